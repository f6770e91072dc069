// ============================================================
// Layer 3: Error Taxonomy
// ============================================================
// Every failure the data pipeline and the model runner can
// surface to a caller. The variants are deliberately coarse:
// callers branch on the *kind* of failure (missing file vs
// corrupt file vs unusable input set), and the payload carries
// the detail for the log line.
//
// The CLI layer wraps these in anyhow::Error with extra context;
// everything below the CLI returns RunnerError directly.

use std::fmt;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::data::dataset::Split;

/// Convenience alias used throughout the core layers.
pub type Result<T> = std::result::Result<T, RunnerError>;

/// Lifecycle states of the model runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerState {
    Uninitialized,
    ReadyForTraining,
    ReadyForInference,
    Terminated,
}

impl fmt::Display for RunnerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunnerState::Uninitialized => "uninitialized",
            RunnerState::ReadyForTraining => "ready-for-training",
            RunnerState::ReadyForInference => "ready-for-inference",
            RunnerState::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum RunnerError {
    /// Invalid or contradictory settings.
    #[error("configuration error: {0}")]
    Config(String),

    /// A referenced checkpoint or input path does not exist.
    #[error("could not find {what} at '{}'", .path.display())]
    NotFound { what: String, path: PathBuf },

    /// The file exists but its payload is truncated or not what we expect.
    #[error("corrupt data in '{}': {reason}", .path.display())]
    CorruptData { path: PathBuf, reason: String },

    /// Stored weights do not fit the architecture used to rebuild the model.
    #[error("shape mismatch for tensor '{name}': expected {expected:?}, found {found:?}")]
    ShapeMismatch {
        name: String,
        expected: Vec<usize>,
        found: Vec<usize>,
    },

    /// The checkpoint does not tell us how to rebuild the model.
    #[error("cannot determine the model architecture from '{}': {reason}", .path.display())]
    MissingArchitecture { path: PathBuf, reason: String },

    /// Evaluation was requested but an annotated spectrum index cannot be built.
    #[error("{0}")]
    AnnotationIndex(String),

    /// Computation was attempted on weights that only exist as placeholders.
    #[error("tensor '{0}' is a placeholder tensor; no data!")]
    DevicePlaceholder(String),

    #[error("the {0} dataset has not been set up")]
    DatasetNotSet(Split),

    #[error("invalid runner state: expected {expected}, found {found}")]
    InvalidState {
        expected: &'static str,
        found: RunnerState,
    },

    /// A peak file could not be parsed.
    #[error("malformed {format} input '{}' (record {record}): {message}", .path.display())]
    Parse {
        format: &'static str,
        path: PathBuf,
        record: usize,
        message: String,
    },

    #[error("I/O error on '{}': {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl RunnerError {
    /// Attach a path to a raw I/O error.
    pub fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        RunnerError::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    pub fn not_found(what: impl Into<String>, path: impl AsRef<Path>) -> Self {
        RunnerError::NotFound {
            what: what.into(),
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn corrupt(path: impl AsRef<Path>, reason: impl Into<String>) -> Self {
        RunnerError::CorruptData {
            path: path.as_ref().to_path_buf(),
            reason: reason.into(),
        }
    }

    /// Short stable code, handy for log filtering and tests.
    pub fn code(&self) -> &'static str {
        match self {
            RunnerError::Config(_) => "config",
            RunnerError::NotFound { .. } => "not-found",
            RunnerError::CorruptData { .. } => "corrupt-data",
            RunnerError::ShapeMismatch { .. } => "shape-mismatch",
            RunnerError::MissingArchitecture { .. } => "missing-architecture",
            RunnerError::AnnotationIndex(_) => "annotation-index",
            RunnerError::DevicePlaceholder(_) => "device-placeholder",
            RunnerError::DatasetNotSet(_) => "dataset-not-set",
            RunnerError::InvalidState { .. } => "invalid-state",
            RunnerError::Parse { .. } => "parse",
            RunnerError::Io { .. } => "io",
        }
    }
}
