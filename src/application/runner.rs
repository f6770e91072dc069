// ============================================================
// Layer 2: Model Runner
// ============================================================
// Owns one training or prediction run from start to finish.
//
//   uninitialized ──initialize_model(train)──▶ ready-for-training
//         │
//         └──initialize_model(inference)──▶ ready-for-inference
//
//   any state ──exit──▶ terminated
//
// The runner is a scoped resource. `enter` creates the temporary
// directory the spectrum stores are built in; `exit` writes the
// final results file and removes that directory. `scoped` runs a
// body between the two and always runs `exit`, so a failed run
// still leaves its (partial) results file behind.
//
// Train:    trainer → model → discover files → data module → fit
// Predict:  results file → trainer → model → discover files
//           → data module → predict → (evaluate) precision

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use tempfile::TempDir;

use crate::application::config::RunConfig;
use crate::data::batcher::ShuffleConfig;
use crate::data::dataset::{DatasetBuilder, Split};
use crate::data::loader::find_peak_files;
use crate::data::module::{DataModule, DataModuleConfig, Stage};
use crate::data::preprocessor::PreprocessingChain;
use crate::domain::error::{Result, RunnerError, RunnerState};
use crate::infra::checkpoint::Checkpoint;
use crate::infra::metrics::MetricsLogger;
use crate::infra::mztab::MztabWriter;
use crate::ml::inferencer::{evaluate_predictions, PrecisionMetrics};
use crate::ml::model::Spec2Pep;
use crate::ml::reconcile::{reconcile, HparamSource};
use crate::ml::trainer::{Trainer, TrainerConfig, TrainerMode};

// ─── Warnings ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WarningKind {
    IgnoredPeakFile,
    DeprecatedField,
    ArchitectureOverride,
    MissingHyperparameters,
}

/// A recoverable condition met during the run. Also logged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunnerWarning {
    pub kind: WarningKind,
    pub message: String,
}

impl fmt::Display for RunnerWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

// ─── ModelRunner ──────────────────────────────────────────────────────────────

pub struct ModelRunner {
    config: RunConfig,
    config_path: Option<PathBuf>,
    model_filename: Option<PathBuf>,
    output_root: Option<String>,
    state: RunnerState,
    work_dir: Option<TempDir>,
    trainer: Option<Trainer>,
    model: Option<Spec2Pep>,
    loaders: Option<DataModule>,
    writer: Option<MztabWriter>,
    warnings: Vec<RunnerWarning>,
    last_metrics: Option<PrecisionMetrics>,
}

impl ModelRunner {
    /// `output_root` prefixes the best checkpoint (`{root}.best.ckpt`).
    pub fn new(config: RunConfig, model_filename: Option<PathBuf>, output_root: Option<String>) -> Self {
        Self {
            config,
            config_path: None,
            model_filename,
            output_root,
            state: RunnerState::Uninitialized,
            work_dir: None,
            trainer: None,
            model: None,
            loaders: None,
            writer: None,
            warnings: Vec::new(),
            last_metrics: None,
        }
    }

    /// Config file reported in the results metadata.
    pub fn with_config_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_path = Some(path.into());
        self
    }

    pub fn state(&self) -> RunnerState {
        self.state
    }

    pub fn warnings(&self) -> &[RunnerWarning] {
        &self.warnings
    }

    /// Precision of the last evaluated prediction run.
    pub fn last_metrics(&self) -> Option<PrecisionMetrics> {
        self.last_metrics
    }

    pub fn model(&self) -> Option<&Spec2Pep> {
        self.model.as_ref()
    }

    pub fn trainer(&self) -> Option<&Trainer> {
        self.trainer.as_ref()
    }

    pub fn data_module(&self) -> Option<&DataModule> {
        self.loaders.as_ref()
    }

    /// Scratch directory of the entered scope.
    pub fn work_dir(&self) -> Option<&Path> {
        self.work_dir.as_ref().map(|d| d.path())
    }

    // ── Scope ────────────────────────────────────────────────────────────────

    /// Acquire the temporary store directory.
    pub fn enter(&mut self) -> Result<()> {
        self.ensure_active()?;
        if self.work_dir.is_none() {
            let dir = tempfile::Builder::new()
                .prefix("denovo-runner-")
                .tempdir()
                .map_err(|e| RunnerError::io(std::env::temp_dir(), e))?;
            tracing::debug!("Working directory: '{}'", dir.path().display());
            self.work_dir = Some(dir);
        }
        Ok(())
    }

    /// Write the final results file and release the temporary directory.
    /// Runs once; later calls are no-ops.
    pub fn exit(&mut self) -> Result<()> {
        if self.state == RunnerState::Terminated {
            return Ok(());
        }
        self.state = RunnerState::Terminated;

        // Datasets hold open stores inside the work directory.
        self.loaders = None;

        let saved = match &self.writer {
            Some(writer) => writer.save(),
            None => Ok(()),
        };
        let closed = match self.work_dir.take() {
            Some(dir) => {
                let path = dir.path().to_path_buf();
                dir.close().map_err(|e| RunnerError::io(&path, e))
            }
            None => Ok(()),
        };
        tracing::debug!("Runner terminated");
        saved.and(closed)
    }

    /// Run `body` inside an entered scope. `exit` always runs; an error from
    /// the body takes precedence over one from `exit`.
    pub fn scoped<T>(&mut self, body: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        self.enter()?;
        let result = body(self);
        let exited = self.exit();
        match (result, exited) {
            (Ok(value), exited) => exited.map(|()| value),
            (Err(e), Err(exit_err)) => {
                tracing::warn!("Runner cleanup failed after an earlier error: {}", exit_err);
                Err(e)
            }
            (Err(e), Ok(())) => Err(e),
        }
    }

    // ── Initialization ───────────────────────────────────────────────────────

    /// Create the trainer for a training or an inference run.
    pub fn initialize_trainer(&mut self, train: bool) {
        let mode = if train {
            TrainerMode::Training
        } else {
            TrainerMode::Inference
        };
        self.trainer = Some(Trainer::new(TrainerConfig {
            mode,
            accelerator: self.config.accelerator.clone(),
            devices: self.config.devices,
            max_epochs: self.config.max_epochs,
            num_sanity_val_steps: self.config.num_sanity_val_steps,
            val_check_interval: self.config.val_check_interval,
            model_save_folder: self.config.model_save_folder_path.clone(),
            output_root: self.output_root.clone(),
        }));
    }

    /// Build a fresh model or restore one from the model file.
    pub fn initialize_model(&mut self, train: bool) -> Result<()> {
        self.ensure_active()?;
        let config_hparams = self.config.hyperparameters();

        let Some(path) = self.model_filename.clone() else {
            if !train {
                return Err(RunnerError::Config(
                    "A model file must be provided for inference".into(),
                ));
            }
            tracing::info!("No model file given; training a new model");
            self.model = Some(Spec2Pep::new(config_hparams, self.config.random_seed)?);
            self.state = RunnerState::ReadyForTraining;
            return Ok(());
        };

        // ── Step 1: Read the checkpoint ──
        let ckpt = Checkpoint::load(&path, self.config.placement)?;

        // ── Step 2: Merge its hyperparameters with the config ──
        let reconciled = reconcile(ckpt.hyper_parameters.as_ref(), &config_hparams)?;
        for legacy in &reconciled.deprecated {
            self.warn(
                WarningKind::DeprecatedField,
                format!(
                    "Deprecated hyperparameter '{legacy}' in '{}' was migrated to its current name",
                    path.display()
                ),
            );
        }
        for o in &reconciled.overridden {
            self.warn(WarningKind::ArchitectureOverride, o.to_string());
        }
        let config_only = reconciled.source == HparamSource::ConfigOnly;
        if config_only {
            self.warn(
                WarningKind::MissingHyperparameters,
                format!(
                    "'{}' carries no hyperparameters; rebuilding the model from the config",
                    path.display()
                ),
            );
        }

        // ── Step 3: Load the weights into that architecture ──
        let mut model = Spec2Pep::from_checkpoint(ckpt, reconciled.hparams, self.config.placement)
            .map_err(|e| match e {
                RunnerError::ShapeMismatch { .. } if config_only => RunnerError::MissingArchitecture {
                    path: path.clone(),
                    reason: e.to_string(),
                },
                other => other,
            })?;

        if train {
            self.state = RunnerState::ReadyForTraining;
        } else {
            model.freeze();
            self.state = RunnerState::ReadyForInference;
        }
        tracing::info!("Loaded model from '{}'", path.display());
        self.model = Some(model);
        Ok(())
    }

    /// Create the data module. Batch sizes are split across devices.
    pub fn initialize_data_module(
        &mut self,
        train_paths: Option<Vec<PathBuf>>,
        valid_paths: Option<Vec<PathBuf>>,
        test_paths: Option<Vec<PathBuf>>,
    ) -> Result<()> {
        let Some(trainer) = &self.trainer else {
            return Err(RunnerError::InvalidState {
                expected: "an initialized trainer",
                found: self.state,
            });
        };
        let Some(work_dir) = &self.work_dir else {
            return Err(RunnerError::InvalidState {
                expected: "an entered runner scope",
                found: self.state,
            });
        };

        let devices = trainer.num_devices().max(1);
        let shuffle = self.config.shuffle.then_some(ShuffleConfig {
            capacity: self.config.shuffle_buffer_size,
            seed: Some(self.config.random_seed),
        });
        let builder = DatasetBuilder::new(
            PreprocessingChain::standard(&self.config.preprocessing()),
            work_dir.path(),
        );
        self.loaders = Some(DataModule::new(
            builder,
            DataModuleConfig {
                train_paths,
                valid_paths,
                test_paths,
                train_batch_size: (self.config.train_batch_size / devices).max(1),
                eval_batch_size: (self.config.predict_batch_size / devices).max(1),
                shuffle,
            },
        ));
        Ok(())
    }

    // ── Train ────────────────────────────────────────────────────────────────

    /// Train on annotated peak files, validating on a second set.
    pub fn train(&mut self, train_paths: &[impl AsRef<str>], valid_paths: &[impl AsRef<str>]) -> Result<()> {
        self.ensure_active()?;
        self.initialize_trainer(true);
        self.initialize_model(true)?;

        let train_files = self.discover(train_paths, true, "training")?;
        let valid_files = self.discover(valid_paths, true, "validation")?;
        self.initialize_data_module(Some(train_files), Some(valid_files), None)?;

        let (Some(trainer), Some(model), Some(loaders)) =
            (self.trainer.as_mut(), self.model.as_mut(), self.loaders.as_mut())
        else {
            return Err(RunnerError::InvalidState {
                expected: "an initialized trainer, model and data module",
                found: self.state,
            });
        };
        loaders.setup(Some(Stage::Fit), true)?;

        let metrics = model
            .hparams()
            .behavior
            .tb_summarywriter
            .as_ref()
            .map(MetricsLogger::new)
            .transpose()?;

        trainer.fit(
            model,
            &loaders.train_dataloader()?,
            &loaders.val_dataloader()?,
            metrics.as_ref(),
        )
    }

    // ── Predict ──────────────────────────────────────────────────────────────

    /// Predict peptides for the peak files and write them to
    /// `output` (extension replaced by `.mztab`). With `evaluate` the files
    /// must be annotated and precision is computed afterwards.
    pub fn predict(&mut self, peak_paths: &[impl AsRef<str>], output: &Path, evaluate: bool) -> Result<()> {
        self.ensure_active()?;

        // ── Step 1: Results file, so every outcome leaves one behind ──
        let mut writer = MztabWriter::create(output.with_extension("mztab"))?;
        writer.set_metadata(
            self.config.settings(),
            self.model_filename.as_deref(),
            self.config_path.as_deref(),
        )?;
        self.writer = Some(writer);

        // ── Step 2: Trainer and frozen model ──
        self.initialize_trainer(false);
        self.initialize_model(false)?;

        // ── Step 3: Test dataset ──
        let files = self.discover(peak_paths, evaluate, "test")?;
        self.initialize_data_module(None, None, Some(files))?;

        let (Some(trainer), Some(model), Some(loaders), Some(writer)) = (
            self.trainer.as_mut(),
            self.model.as_ref(),
            self.loaders.as_mut(),
            self.writer.as_mut(),
        ) else {
            return Err(RunnerError::InvalidState {
                expected: "an initialized trainer, model and data module",
                found: self.state,
            });
        };
        loaders.setup(Some(Stage::Test), evaluate)?;
        let sources: Vec<PathBuf> = loaders
            .dataset(Split::Test)?
            .source_files()
            .iter()
            .map(PathBuf::from)
            .collect();
        writer.set_ms_run(&sources)?;

        // ── Step 4: Predict ──
        trainer.predict(model, &loaders.predict_dataloader()?, writer)?;
        writer.mark_complete();

        if evaluate {
            self.last_metrics = Some(self.log_metrics()?);
        }
        Ok(())
    }

    /// Score the written PSMs against the test annotations.
    fn log_metrics(&self) -> Result<PrecisionMetrics> {
        let (Some(model), Some(loaders), Some(writer)) =
            (self.model.as_ref(), self.loaders.as_ref(), self.writer.as_ref())
        else {
            return Err(RunnerError::InvalidState {
                expected: "a finished prediction run",
                found: self.state,
            });
        };

        let mut truth = BTreeMap::new();
        for rec in loaders.dataset(Split::Test)?.iter()? {
            let rec = rec?;
            if let Some(peptide) = &rec.annotation {
                truth.insert(rec.spectrum_key(), peptide.clone());
            }
        }

        let metrics = evaluate_predictions(writer.psms(), &truth, model.tokenizer());
        tracing::info!("Peptide Precision: {:.2}%", 100.0 * metrics.peptide_precision);
        tracing::info!("Amino Acid Precision: {:.2}%", 100.0 * metrics.aa_precision);
        Ok(metrics)
    }

    // ── Helpers ──────────────────────────────────────────────────────────────

    /// Write the current model to `path`.
    pub fn save_checkpoint(&self, path: &Path) -> Result<()> {
        match (&self.trainer, &self.model) {
            (Some(trainer), Some(model)) => trainer.save_checkpoint(model, path),
            (None, Some(model)) => model.to_checkpoint(0, 0)?.save(path),
            _ => Err(RunnerError::InvalidState {
                expected: "an initialized model",
                found: self.state,
            }),
        }
    }

    /// Expand path patterns; a run with no usable file is a not-found error.
    fn discover(&mut self, patterns: &[impl AsRef<str>], annotated: bool, what: &str) -> Result<Vec<PathBuf>> {
        let found = find_peak_files(patterns, annotated)?;
        for path in &found.ignored {
            self.warnings.push(RunnerWarning {
                kind: WarningKind::IgnoredPeakFile,
                message: format!("Ignoring unsupported peak file: {}", path.display()),
            });
        }
        if found.files.is_empty() {
            let shown: Vec<&str> = patterns.iter().map(|p| p.as_ref()).collect();
            return Err(RunnerError::not_found(
                format!("{what} peak files"),
                shown.join(", "),
            ));
        }
        tracing::info!("Found {} {} peak file(s)", found.files.len(), what);
        Ok(found.files)
    }

    fn warn(&mut self, kind: WarningKind, message: String) {
        tracing::warn!("{}", message);
        self.warnings.push(RunnerWarning { kind, message });
    }

    fn ensure_active(&self) -> Result<()> {
        if self.state == RunnerState::Terminated {
            return Err(RunnerError::InvalidState {
                expected: "an active runner",
                found: self.state,
            });
        }
        Ok(())
    }
}

impl Drop for ModelRunner {
    fn drop(&mut self) {
        if let Err(e) = self.exit() {
            tracing::warn!("Runner cleanup failed: {}", e);
        }
    }
}
