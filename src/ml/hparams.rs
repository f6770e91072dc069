// ============================================================
// Layer 5: Model Hyperparameters
// ============================================================
// The model is described by two records:
//
//   ArchitectureParams   fix the weight shapes; a checkpoint can
//                        only be rebuilt with the exact values it
//                        was trained with
//   BehaviorParams       decoding, schedule and logging knobs;
//                        safe to change between runs
//
// Both are serialized into one flat map (field name -> JSON
// value) stored inside every checkpoint. The flat layout keeps
// older maps readable and lets the reconciler merge them field
// by field.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::data::tokenizer::default_residues;
use crate::domain::error::{Result, RunnerError};

/// Flat hyperparameter map as stored in a checkpoint.
pub type HparamMap = BTreeMap<String, serde_json::Value>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchitectureParams {
    pub dim_model: usize,
    pub n_head: usize,
    pub dim_feedforward: usize,
    pub n_layers: usize,
    pub dropout: f64,
    /// Width of the intensity encoding; `None` adds it onto the m/z encoding.
    pub dim_intensity: Option<usize>,
    pub residues: BTreeMap<String, f64>,
    pub max_charge: u8,
}

impl Default for ArchitectureParams {
    fn default() -> Self {
        Self {
            dim_model: 512,
            n_head: 8,
            dim_feedforward: 1024,
            n_layers: 9,
            dropout: 0.0,
            dim_intensity: None,
            residues: default_residues(),
            max_charge: 10,
        }
    }
}

impl ArchitectureParams {
    pub fn validate(&self) -> Result<()> {
        if self.dim_model == 0 || self.dim_feedforward == 0 {
            return Err(RunnerError::Config(
                "dim_model and dim_feedforward must be positive".into(),
            ));
        }
        if self.n_head == 0 || self.dim_model % self.n_head != 0 {
            return Err(RunnerError::Config(format!(
                "dim_model ({}) must be divisible by n_head ({})",
                self.dim_model, self.n_head
            )));
        }
        if let Some(k) = self.dim_intensity {
            if k >= self.dim_model {
                return Err(RunnerError::Config(format!(
                    "dim_intensity ({k}) must be smaller than dim_model ({})",
                    self.dim_model
                )));
            }
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(RunnerError::Config(format!(
                "dropout must lie in [0, 1), got {}",
                self.dropout
            )));
        }
        if self.max_charge == 0 {
            return Err(RunnerError::Config("max_charge must be at least 1".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BehaviorParams {
    pub max_length: usize,
    /// Precursor tolerance in ppm.
    pub precursor_mass_tol: f64,
    pub isotope_error_range: (i32, i32),
    pub n_beams: usize,
    pub min_peptide_len: usize,
    pub top_match: usize,
    pub n_log: usize,
    pub tb_summarywriter: Option<PathBuf>,
    pub train_label_smoothing: f64,
    pub warmup_iters: usize,
    pub cosine_schedule_period_iters: usize,
    pub lr: f64,
    pub weight_decay: f64,
    pub calculate_precision: bool,
}

impl Default for BehaviorParams {
    fn default() -> Self {
        Self {
            max_length: 100,
            precursor_mass_tol: 50.0,
            isotope_error_range: (0, 1),
            n_beams: 1,
            min_peptide_len: 6,
            top_match: 1,
            n_log: 1,
            tb_summarywriter: None,
            train_label_smoothing: 0.01,
            warmup_iters: 100_000,
            cosine_schedule_period_iters: 600_000,
            lr: 5e-4,
            weight_decay: 1e-5,
            calculate_precision: false,
        }
    }
}

/// Everything needed to construct the model.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Hyperparameters {
    #[serde(flatten)]
    pub architecture: ArchitectureParams,
    #[serde(flatten)]
    pub behavior: BehaviorParams,
}

impl Hyperparameters {
    /// Flatten into the checkpoint map.
    pub fn to_map(&self) -> Result<HparamMap> {
        match serde_json::to_value(self) {
            Ok(serde_json::Value::Object(obj)) => Ok(obj.into_iter().collect()),
            Ok(other) => Err(RunnerError::Config(format!(
                "hyperparameters serialized to {other} instead of a map"
            ))),
            Err(e) => Err(RunnerError::Config(format!(
                "cannot serialize hyperparameters: {e}"
            ))),
        }
    }

    /// Rebuild from a checkpoint map; every field must be present.
    pub fn from_map(map: &HparamMap) -> Result<Self> {
        let obj: serde_json::Map<String, serde_json::Value> =
            map.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        serde_json::from_value(serde_json::Value::Object(obj))
            .map_err(|e| RunnerError::Config(format!("malformed hyperparameter map: {e}")))
    }
}
