// ============================================================
// Layer 2: Run Configuration
// ============================================================
// Every tunable value of a run, loaded from a JSON file.
// Each field has a default, so a config file only needs to list
// what it changes:
//
//   { "max_epochs": 1, "n_layers": 1, "train_batch_size": 32 }
//
// The flat layout mirrors the hyperparameter map stored in
// checkpoints: architecture and behavior fields carry the same
// names here and there (except `learning_rate`, stored as `lr`).

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::data::preprocessor::PreprocessingParams;
use crate::data::tokenizer::default_residues;
use crate::domain::error::{Result, RunnerError};
use crate::ml::hparams::{ArchitectureParams, BehaviorParams, Hyperparameters};
use crate::ml::model::Placement;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    // ── Data ──
    pub n_peaks: usize,
    pub min_mz: f64,
    pub max_mz: f64,
    pub min_intensity: f32,
    /// Da
    pub remove_precursor_tol: f64,
    pub max_charge: u8,
    pub train_batch_size: usize,
    pub predict_batch_size: usize,
    /// Passed through; all work runs on the calling thread.
    pub n_workers: Option<usize>,
    pub shuffle: bool,
    pub shuffle_buffer_size: usize,
    pub random_seed: u64,

    // ── Architecture ──
    pub dim_model: usize,
    pub n_head: usize,
    pub dim_feedforward: usize,
    pub n_layers: usize,
    pub dropout: f64,
    pub dim_intensity: Option<usize>,
    pub residues: BTreeMap<String, f64>,

    // ── Behavior ──
    pub max_length: usize,
    /// ppm
    pub precursor_mass_tol: f64,
    pub isotope_error_range: (i32, i32),
    pub min_peptide_len: usize,
    pub n_beams: usize,
    pub top_match: usize,
    pub n_log: usize,
    pub tb_summarywriter: Option<PathBuf>,
    pub train_label_smoothing: f64,
    pub warmup_iters: usize,
    pub cosine_schedule_period_iters: usize,
    pub learning_rate: f64,
    pub weight_decay: f64,
    pub calculate_precision: bool,

    // ── Trainer ──
    pub accelerator: String,
    pub devices: Option<usize>,
    pub max_epochs: usize,
    pub num_sanity_val_steps: usize,
    pub val_check_interval: usize,
    pub model_save_folder_path: PathBuf,
    pub placement: Placement,
}

impl Default for RunConfig {
    fn default() -> Self {
        let arch = ArchitectureParams::default();
        let behavior = BehaviorParams::default();
        Self {
            n_peaks: 150,
            min_mz: 50.0,
            max_mz: 2500.0,
            min_intensity: 0.01,
            remove_precursor_tol: 2.0,
            max_charge: arch.max_charge,
            train_batch_size: 32,
            predict_batch_size: 1024,
            n_workers: None,
            shuffle: true,
            shuffle_buffer_size: 100_000,
            random_seed: 454,

            dim_model: arch.dim_model,
            n_head: arch.n_head,
            dim_feedforward: arch.dim_feedforward,
            n_layers: arch.n_layers,
            dropout: arch.dropout,
            dim_intensity: arch.dim_intensity,
            residues: default_residues(),

            max_length: behavior.max_length,
            precursor_mass_tol: behavior.precursor_mass_tol,
            isotope_error_range: behavior.isotope_error_range,
            min_peptide_len: behavior.min_peptide_len,
            n_beams: behavior.n_beams,
            top_match: behavior.top_match,
            n_log: behavior.n_log,
            tb_summarywriter: behavior.tb_summarywriter,
            train_label_smoothing: behavior.train_label_smoothing,
            warmup_iters: behavior.warmup_iters,
            cosine_schedule_period_iters: behavior.cosine_schedule_period_iters,
            learning_rate: behavior.lr,
            weight_decay: behavior.weight_decay,
            calculate_precision: behavior.calculate_precision,

            accelerator: "auto".to_string(),
            devices: None,
            max_epochs: 30,
            num_sanity_val_steps: 0,
            val_check_interval: 50_000,
            model_save_folder_path: PathBuf::new(),
            placement: Placement::Cpu,
        }
    }
}

impl RunConfig {
    /// Load and validate a JSON config file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => RunnerError::not_found("the config file", path),
            _ => RunnerError::io(path, e),
        })?;
        let config: Self = serde_json::from_str(&text).map_err(|e| {
            RunnerError::Config(format!("cannot parse '{}': {e}", path.display()))
        })?;
        config.validate()?;
        tracing::debug!("Loaded config from '{}'", path.display());
        Ok(config)
    }

    /// Reject values that contradict each other or cannot work.
    pub fn validate(&self) -> Result<()> {
        let err = |msg: String| Err(RunnerError::Config(msg));
        if self.min_mz >= self.max_mz {
            return err(format!(
                "min_mz ({}) must be smaller than max_mz ({})",
                self.min_mz, self.max_mz
            ));
        }
        if self.n_peaks == 0 {
            return err("n_peaks must be positive".into());
        }
        if !(0.0..=1.0).contains(&self.min_intensity) {
            return err(format!("min_intensity must lie in [0, 1], got {}", self.min_intensity));
        }
        if self.train_batch_size == 0 || self.predict_batch_size == 0 {
            return err("batch sizes must be positive".into());
        }
        if self.shuffle && self.shuffle_buffer_size == 0 {
            return err("shuffle_buffer_size must be positive when shuffling".into());
        }
        if self.isotope_error_range.0 > self.isotope_error_range.1 {
            return err(format!(
                "isotope_error_range {:?} is reversed",
                self.isotope_error_range
            ));
        }
        if self.min_peptide_len > self.max_length {
            return err(format!(
                "min_peptide_len ({}) exceeds max_length ({})",
                self.min_peptide_len, self.max_length
            ));
        }
        if self.val_check_interval == 0 {
            return err("val_check_interval must be positive".into());
        }
        if !(0.0..1.0).contains(&self.train_label_smoothing) {
            return err(format!(
                "train_label_smoothing must lie in [0, 1), got {}",
                self.train_label_smoothing
            ));
        }
        self.architecture().validate()
    }

    pub fn preprocessing(&self) -> PreprocessingParams {
        PreprocessingParams {
            max_charge: self.max_charge,
            min_mz: self.min_mz,
            max_mz: self.max_mz,
            remove_precursor_tol: self.remove_precursor_tol,
            min_intensity: self.min_intensity,
            n_peaks: self.n_peaks,
        }
    }

    pub fn architecture(&self) -> ArchitectureParams {
        ArchitectureParams {
            dim_model: self.dim_model,
            n_head: self.n_head,
            dim_feedforward: self.dim_feedforward,
            n_layers: self.n_layers,
            dropout: self.dropout,
            dim_intensity: self.dim_intensity,
            residues: self.residues.clone(),
            max_charge: self.max_charge,
        }
    }

    pub fn behavior(&self) -> BehaviorParams {
        BehaviorParams {
            max_length: self.max_length,
            precursor_mass_tol: self.precursor_mass_tol,
            isotope_error_range: self.isotope_error_range,
            n_beams: self.n_beams,
            min_peptide_len: self.min_peptide_len,
            top_match: self.top_match,
            n_log: self.n_log,
            tb_summarywriter: self.tb_summarywriter.clone(),
            train_label_smoothing: self.train_label_smoothing,
            warmup_iters: self.warmup_iters,
            cosine_schedule_period_iters: self.cosine_schedule_period_iters,
            lr: self.learning_rate,
            weight_decay: self.weight_decay,
            calculate_precision: self.calculate_precision,
        }
    }

    pub fn hyperparameters(&self) -> Hyperparameters {
        Hyperparameters {
            architecture: self.architecture(),
            behavior: self.behavior(),
        }
    }

    /// Flat (name, value) pairs for the results metadata.
    pub fn settings(&self) -> Vec<(String, String)> {
        match serde_json::to_value(self) {
            Ok(serde_json::Value::Object(obj)) => obj
                .into_iter()
                .map(|(k, v)| {
                    let v = match v {
                        serde_json::Value::String(s) => s,
                        other => other.to_string(),
                    };
                    (k, v)
                })
                .collect(),
            _ => Vec::new(),
        }
    }
}
