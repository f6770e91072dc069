// ============================================================
// Layer 4: Peak File Discovery
// ============================================================
// Turns the user's path arguments into a concrete, sorted list
// of peak files, and opens the right reader for each of them.
//
// Every path argument goes through the same expansion a Unix
// shell would apply:
//   1. a leading `~` becomes the home directory
//   2. `$VAR` / `${VAR}` become environment values (unset
//      variables are left untouched)
//   3. glob patterns (`*`, `?`, `[...]`, `**`) are matched
//      against the filesystem; `*` never crosses a `/`
//
// Matches whose extension is not supported for the run are
// reported and skipped; a pre-built spectrum store (a directory)
// counts as a supported match.

use std::collections::BTreeSet;
use std::env;
use std::path::{Path, PathBuf};

use glob::{glob_with, MatchOptions};

use crate::data::mgf::MgfReader;
use crate::data::mzml::MzMlReader;
use crate::data::mzxml::MzXmlReader;
use crate::domain::error::{Result, RunnerError};
use crate::domain::format::PeakFileFormat;
use crate::domain::traits::SpectrumSource;

/// Outcome of expanding a set of path arguments.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Discovery {
    /// Supported files, sorted and de-duplicated.
    pub files: Vec<PathBuf>,
    /// Matches skipped because their format is not supported here.
    pub ignored: Vec<PathBuf>,
}

/// Expand `patterns` and keep the files supported for an (un)annotated run.
pub fn find_peak_files<S: AsRef<str>>(patterns: &[S], annotated: bool) -> Result<Discovery> {
    let supported = PeakFileFormat::supported(annotated);
    let mut files = BTreeSet::new();
    let mut ignored = BTreeSet::new();

    for pattern in patterns {
        let expanded = expand_vars(&expand_user(pattern.as_ref()));
        for candidate in glob_paths(&expanded)? {
            match PeakFileFormat::from_path(&candidate) {
                Some(format) if supported.contains(&format) => {
                    files.insert(candidate);
                }
                _ => {
                    tracing::warn!("Ignoring unsupported peak file: {}", candidate.display());
                    ignored.insert(candidate);
                }
            }
        }
    }

    if files.is_empty() {
        let shown: Vec<&str> = patterns.iter().map(|p| p.as_ref()).collect();
        tracing::warn!("No supported peak files found under path(s): {:?}", shown);
    }

    Ok(Discovery {
        files: files.into_iter().collect(),
        ignored: ignored.into_iter().collect(),
    })
}

/// Open a streaming reader for a raw peak file.
pub fn open_reader(path: &Path, format: PeakFileFormat) -> Result<Box<dyn SpectrumSource>> {
    tracing::debug!("Reading {} file '{}'", format, path.display());
    match format {
        PeakFileFormat::Mgf => Ok(Box::new(MgfReader::open(path)?)),
        PeakFileFormat::MzMl => Ok(Box::new(MzMlReader::open(path)?)),
        PeakFileFormat::MzXml => Ok(Box::new(MzXmlReader::open(path)?)),
        PeakFileFormat::RecordStore => Err(RunnerError::Config(format!(
            "'{}' is a spectrum store, not a peak file",
            path.display()
        ))),
    }
}

// ─── Expansion helpers ────────────────────────────────────────────────────────

fn expand_user(path: &str) -> String {
    let Some(rest) = path.strip_prefix('~') else {
        return path.to_string();
    };
    if !(rest.is_empty() || rest.starts_with('/')) {
        return path.to_string();
    }
    match env::var("HOME") {
        Ok(home) => format!("{home}{rest}"),
        Err(_) => path.to_string(),
    }
}

fn expand_vars(path: &str) -> String {
    let mut out = String::with_capacity(path.len());
    let mut chars = path.char_indices().peekable();

    while let Some((i, c)) = chars.next() {
        if c != '$' {
            out.push(c);
            continue;
        }
        let rest = &path[i + 1..];
        let (name, consumed) = if let Some(braced) = rest.strip_prefix('{') {
            match braced.find('}') {
                Some(end) => (&braced[..end], end + 2),
                None => ("", 0),
            }
        } else {
            let end = rest
                .find(|ch: char| !(ch.is_ascii_alphanumeric() || ch == '_'))
                .unwrap_or(rest.len());
            (&rest[..end], end)
        };

        match (name.is_empty(), env::var(name)) {
            (false, Ok(value)) => {
                out.push_str(&value);
                for _ in 0..rest[..consumed].chars().count() {
                    chars.next();
                }
            }
            _ => out.push('$'),
        }
    }
    out
}

fn is_glob(pattern: &str) -> bool {
    pattern.contains(['*', '?', '['])
}

/// Filesystem matches for one expanded argument.
fn glob_paths(pattern: &str) -> Result<Vec<PathBuf>> {
    if !is_glob(pattern) {
        let path = Path::new(pattern);
        return Ok(if path.exists() {
            vec![path.to_path_buf()]
        } else {
            Vec::new()
        });
    }

    let options = MatchOptions {
        require_literal_separator: true,
        ..MatchOptions::new()
    };
    let entries = glob_with(pattern, options)
        .map_err(|e| RunnerError::Config(format!("invalid path pattern '{pattern}': {e}")))?;

    let mut out = Vec::new();
    for entry in entries {
        match entry {
            Ok(path) => out.push(path),
            Err(e) => tracing::debug!("Skipping unreadable match of '{}': {}", pattern, e),
        }
    }
    Ok(out)
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn touch(dir: &Path, name: &str) -> PathBuf {
        let p = dir.join(name);
        if let Some(parent) = p.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(&p, "").unwrap();
        p
    }

    fn pattern(dir: &Path, tail: &str) -> String {
        format!("{}/{tail}", dir.display())
    }

    #[test]
    fn test_glob_filters_by_extension() {
        let dir = tempfile::tempdir().unwrap();
        let a = touch(dir.path(), "a.mgf");
        let b = touch(dir.path(), "b.mzML");
        touch(dir.path(), "notes.txt");

        let found = find_peak_files(&[pattern(dir.path(), "*")], false).unwrap();
        assert_eq!(found.files, vec![a.clone(), b]);
        assert_eq!(found.ignored.len(), 1);

        // Annotated runs only accept MGF (and stores).
        let found = find_peak_files(&[pattern(dir.path(), "*")], true).unwrap();
        assert_eq!(found.files, vec![a]);
        assert_eq!(found.ignored.len(), 2);
    }

    #[test]
    fn test_recursive_glob_and_dedup() {
        let dir = tempfile::tempdir().unwrap();
        let a = touch(dir.path(), "x/y/a.mgf");
        let b = touch(dir.path(), "b.mgf");

        let found = find_peak_files(
            &[
                pattern(dir.path(), "**/*.mgf"),
                b.display().to_string(),
            ],
            false,
        )
        .unwrap();
        assert_eq!(found.files, vec![b, a]);
    }

    #[test]
    fn test_star_does_not_cross_directories() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "sub/a.mgf");
        let found = find_peak_files(&[pattern(dir.path(), "*.mgf")], false).unwrap();
        assert!(found.files.is_empty());
    }

    #[test]
    fn test_bad_pattern_is_config_error() {
        let err = find_peak_files(&["/data/[unclosed.mgf"], false).unwrap_err();
        assert_eq!(err.code(), "config");
    }

    #[test]
    fn test_character_class_matches() {
        let dir = tempfile::tempdir().unwrap();
        let a = touch(dir.path(), "run1.mgf");
        touch(dir.path(), "run9.mgf");
        let found = find_peak_files(&[pattern(dir.path(), "run[1-3].mgf")], false).unwrap();
        assert_eq!(found.files, vec![a]);
    }

    #[test]
    fn test_missing_literal_path_finds_nothing() {
        let found = find_peak_files(&["/no/such/file.mgf"], false).unwrap();
        assert!(found.files.is_empty());
        assert!(found.ignored.is_empty());
    }

    #[test]
    fn test_store_directory_is_supported() {
        let dir = tempfile::tempdir().unwrap();
        let store = dir.path().join("train.spstore");
        fs::create_dir_all(&store).unwrap();
        let found = find_peak_files(&[store.display().to_string()], true).unwrap();
        assert_eq!(found.files, vec![store]);
    }

    #[test]
    fn test_expand_vars_and_user() {
        env::set_var("DENOVO_LOADER_TEST_DIR", "/data/runs");
        assert_eq!(expand_vars("$DENOVO_LOADER_TEST_DIR/a.mgf"), "/data/runs/a.mgf");
        assert_eq!(expand_vars("${DENOVO_LOADER_TEST_DIR}x"), "/data/runsx");
        assert_eq!(expand_vars("$DENOVO_UNSET_VAR_XYZ/a"), "$DENOVO_UNSET_VAR_XYZ/a");
        assert_eq!(expand_vars("cost$"), "cost$");

        if let Ok(home) = env::var("HOME") {
            assert_eq!(expand_user("~/a.mgf"), format!("{home}/a.mgf"));
        }
        assert_eq!(expand_user("~other/a.mgf"), "~other/a.mgf");
    }
}
