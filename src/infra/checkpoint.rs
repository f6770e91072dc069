// ============================================================
// Layer 6: Checkpoint Container
// ============================================================
// Saves and restores model weights together with the
// hyperparameters needed to rebuild the architecture.
//
// What gets saved per checkpoint:
//   1. An 8-byte magic marker            "SPCKPT\0\0"
//   2. A bincode envelope holding
//        - the schema version
//        - epoch / global step at save time
//        - the hyperparameter map as JSON (optional)
//        - the tensor shape manifest (name -> shape)
//        - the module record, as written by Burn's
//          NamedMpkBytesRecorder (MessagePack, full precision)
//
// Why keep the hyperparameters inside the checkpoint?
//   Inference needs the exact architecture (dim_model, n_layers,
//   residues, ...) before the weights can be loaded. A checkpoint
//   written by an older build may lack the map, which the
//   reconciler handles by falling back to the configuration.
//
// Why a shape manifest next to the record?
//   The manifest can be compared with the architecture implied by
//   the reconciled hyperparameters before any record is decoded,
//   and it survives a placeholder load where the record is dropped.
//
// Checkpoints are written atomically and never modified in place.
//
// File naming convention (see ml::trainer):
//   <model_save_folder>/
//     epoch=0-step=1.ckpt   <- latest epoch-end checkpoint
//     best.ckpt             <- lowest validation loss so far

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use bincode::Options;
use serde::{Deserialize, Serialize};

use crate::domain::error::{Result, RunnerError};
use crate::infra::atomic;
use crate::ml::model::Placement;

/// Leading bytes of every checkpoint file.
pub const MAGIC: &[u8; 8] = b"SPCKPT\0\0";

/// Current schema version.
pub const CHECKPOINT_VERSION: u32 = 2;

#[derive(Debug, Serialize, Deserialize)]
struct Payload {
    version: u32,
    epoch: usize,
    global_step: usize,
    hyper_parameters: Option<String>,
    shapes: Vec<(String, Vec<usize>)>,
    record: Vec<u8>,
}

/// Weights plus the versioned hyperparameter map.
#[derive(Debug, Clone, PartialEq)]
pub struct Checkpoint {
    pub version: u32,
    pub epoch: usize,
    pub global_step: usize,
    /// `None` for checkpoints written without a hyperparameter map.
    pub hyper_parameters: Option<BTreeMap<String, serde_json::Value>>,
    /// Shape of every named tensor in `record`.
    pub shapes: BTreeMap<String, Vec<usize>>,
    /// Serialized module record; `None` after a placeholder load.
    pub record: Option<Vec<u8>>,
}

impl Checkpoint {
    pub fn new(
        epoch: usize,
        global_step: usize,
        hyper_parameters: Option<BTreeMap<String, serde_json::Value>>,
        shapes: BTreeMap<String, Vec<usize>>,
        record: Option<Vec<u8>>,
    ) -> Self {
        Self {
            version: CHECKPOINT_VERSION,
            epoch,
            global_step,
            hyper_parameters,
            shapes,
            record,
        }
    }

    /// Number of scalar weights described by the manifest, or `None` if a
    /// shape does not fit in `usize`.
    pub fn num_params(&self) -> Option<usize> {
        self.shapes
            .values()
            .try_fold(0usize, |acc, shape| acc.checked_add(numel(shape)?))
    }

    /// Write the checkpoint atomically. A checkpoint without a record cannot be saved.
    pub fn save(&self, path: &Path) -> Result<()> {
        let record = self.record.clone().ok_or_else(|| {
            RunnerError::DevicePlaceholder(
                self.shapes.keys().next().cloned().unwrap_or_else(|| "record".into()),
            )
        })?;

        let hyper_parameters = self
            .hyper_parameters
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| RunnerError::Config(format!("cannot serialize hyperparameters: {e}")))?;

        let payload = Payload {
            version: self.version,
            epoch: self.epoch,
            global_step: self.global_step,
            hyper_parameters,
            shapes: self.shapes.clone().into_iter().collect(),
            record,
        };

        let mut bytes = MAGIC.to_vec();
        bincode_options()
            .serialize_into(&mut bytes, &payload)
            .map_err(|e| RunnerError::corrupt(path, e.to_string()))?;

        atomic::write_atomic(path, &bytes)?;
        tracing::debug!(
            "Saved checkpoint '{}' (epoch {}, step {})",
            path.display(),
            self.epoch,
            self.global_step
        );
        Ok(())
    }

    /// Read a checkpoint from disk.
    ///
    /// A missing file is `NotFound`; a truncated file, a foreign file or an
    /// undecodable payload is `CorruptData`. With `Placement::Placeholder`
    /// the module record is dropped and only the shape manifest is kept.
    pub fn load(path: &Path, placement: Placement) -> Result<Self> {
        let bytes = fs::read(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => RunnerError::not_found("the model weights file", path),
            _ => RunnerError::io(path, e),
        })?;

        if bytes.len() < MAGIC.len() || &bytes[..MAGIC.len()] != MAGIC {
            return Err(RunnerError::corrupt(path, "unexpected end of checkpoint data"));
        }
        let body = &bytes[MAGIC.len()..];

        let payload: Payload = bincode_options()
            .with_limit(body.len() as u64)
            .deserialize(body)
            .map_err(|e| RunnerError::corrupt(path, format!("unexpected end of checkpoint data ({e})")))?;

        if payload.version > CHECKPOINT_VERSION {
            return Err(RunnerError::corrupt(
                path,
                format!("checkpoint schema version {} is newer than supported", payload.version),
            ));
        }

        let hyper_parameters = payload
            .hyper_parameters
            .map(|json| serde_json::from_str(&json))
            .transpose()
            .map_err(|e| RunnerError::corrupt(path, format!("bad hyperparameter map: {e}")))?;

        let mut shapes = BTreeMap::new();
        for (name, shape) in payload.shapes {
            if numel(&shape).is_none() {
                return Err(RunnerError::corrupt(
                    path,
                    format!("tensor '{name}' shape {shape:?} overflows"),
                ));
            }
            shapes.insert(name, shape);
        }
        if payload.record.is_empty() {
            return Err(RunnerError::corrupt(path, "checkpoint holds no module record"));
        }

        let ckpt = Self {
            version: payload.version,
            epoch: payload.epoch,
            global_step: payload.global_step,
            hyper_parameters,
            shapes,
            record: match placement {
                Placement::Cpu => Some(payload.record),
                Placement::Placeholder => None,
            },
        };
        tracing::debug!(
            "Loaded checkpoint '{}' ({} tensors, {} parameters, epoch {})",
            path.display(),
            ckpt.shapes.len(),
            ckpt.num_params().unwrap_or_default(),
            ckpt.epoch
        );
        Ok(ckpt)
    }
}

/// Element count of a shape, `None` on overflow.
fn numel(shape: &[usize]) -> Option<usize> {
    shape.iter().try_fold(1usize, |acc, &dim| acc.checked_mul(dim))
}

fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new().with_fixint_encoding()
}
