// ============================================================
// Layer 5: Trainer
// ============================================================
// Drives the model through training, validation and prediction.
//
// Training loop:
//
//   sanity check: num_sanity_val_steps validation batches
//   for epoch in 0..max_epochs:
//       for batch in train (buffer-shuffled, reseeded per epoch):
//           training_step ; global_step += 1
//           every val_check_interval global steps:
//               validate -> history row, metrics CSV,
//               best checkpoint on a new lowest valid_loss
//       epoch-end checkpoint  epoch={e}-step={s}.ckpt
//       (the previous epoch-end checkpoint is removed)
//
// Inference mode uses one device and never writes checkpoints.
// Device count and strategy are resolved here and passed through;
// all computation runs on the calling thread.

use std::fs;
use std::path::{Path, PathBuf};

use crate::data::batcher::BatchSource;
use crate::domain::error::{Result, RunnerError};
use crate::infra::metrics::{MetricsLogger, ValidationMetrics};
use crate::infra::mztab::MztabWriter;
use crate::ml::inferencer::{aa_match_batch, aa_match_metrics, run_inference};
use crate::ml::model::Spec2Pep;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrainerMode {
    Training,
    Inference,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    Auto,
    DataParallel,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrainerConfig {
    pub mode: TrainerMode,
    pub accelerator: String,
    /// `None` picks automatically.
    pub devices: Option<usize>,
    pub max_epochs: usize,
    pub num_sanity_val_steps: usize,
    pub val_check_interval: usize,
    pub model_save_folder: PathBuf,
    /// Prefix of the best-model checkpoint, `{root}.best.ckpt`.
    pub output_root: Option<String>,
}

pub struct Trainer {
    config: TrainerConfig,
    num_devices: usize,
    strategy: Strategy,
    global_step: usize,
    current_epoch: usize,
    best_valid_loss: f64,
    last_epoch_checkpoint: Option<PathBuf>,
}

impl Trainer {
    pub fn new(config: TrainerConfig) -> Self {
        let num_devices = match config.mode {
            TrainerMode::Inference => 1,
            // On the CPU "auto" resolves to a single device.
            TrainerMode::Training => config.devices.filter(|&n| n > 0).unwrap_or(1),
        };
        let strategy = if num_devices > 1 && config.accelerator != "cpu" {
            Strategy::DataParallel
        } else {
            Strategy::Auto
        };
        tracing::debug!(
            "Trainer ({:?}): accelerator={}, devices={}, strategy={:?}",
            config.mode,
            config.accelerator,
            num_devices,
            strategy
        );
        Self {
            config,
            num_devices,
            strategy,
            global_step: 0,
            current_epoch: 0,
            best_valid_loss: f64::INFINITY,
            last_epoch_checkpoint: None,
        }
    }

    pub fn config(&self) -> &TrainerConfig {
        &self.config
    }

    pub fn num_devices(&self) -> usize {
        self.num_devices
    }

    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    pub fn global_step(&self) -> usize {
        self.global_step
    }

    pub fn current_epoch(&self) -> usize {
        self.current_epoch
    }

    fn checkpointing(&self) -> bool {
        self.config.mode == TrainerMode::Training
    }

    pub fn best_checkpoint_path(&self) -> PathBuf {
        let name = match &self.config.output_root {
            Some(root) => format!("{root}.best.ckpt"),
            None => "best.ckpt".to_string(),
        };
        self.config.model_save_folder.join(name)
    }

    // ── Fit ──────────────────────────────────────────────────────────────────

    pub fn fit(
        &mut self,
        model: &mut Spec2Pep,
        train: &BatchSource<'_>,
        valid: &BatchSource<'_>,
        metrics: Option<&MetricsLogger>,
    ) -> Result<()> {
        if self.config.mode != TrainerMode::Training {
            return Err(RunnerError::Config(
                "an inference trainer cannot fit a model".into(),
            ));
        }
        tracing::info!(
            "Training for {} epoch(s): {} training and {} validation batches per pass",
            self.config.max_epochs,
            train.n_batches(),
            valid.n_batches()
        );

        // ── Sanity check ──
        if self.config.num_sanity_val_steps > 0 {
            let loss = self.validation_loss(model, valid, Some(self.config.num_sanity_val_steps))?.0;
            tracing::debug!("Sanity validation loss: {:.4}", loss);
        }

        for epoch in 0..self.config.max_epochs {
            self.current_epoch = epoch;
            let mut loss_sum = 0.0f64;
            let mut n_batches = 0usize;

            for batch in train.iter(epoch)? {
                let batch = batch?;
                loss_sum += model.training_step(&batch, self.global_step)?;
                n_batches += 1;
                self.global_step += 1;

                if self.global_step % self.config.val_check_interval.max(1) == 0 {
                    let train_loss = loss_sum / n_batches as f64;
                    self.validate(model, valid, Some(train_loss), metrics)?;
                }
            }

            if n_batches > 0 {
                tracing::info!(
                    "Epoch {:>3}/{} | step {} | train_loss={:.4}",
                    epoch + 1,
                    self.config.max_epochs,
                    self.global_step,
                    loss_sum / n_batches as f64
                );
            }
            self.save_epoch_checkpoint(model, epoch)?;
        }

        tracing::info!("Training complete after {} step(s)", self.global_step);
        Ok(())
    }

    /// Full validation pass; records a history row and the best checkpoint.
    pub fn validate(
        &mut self,
        model: &mut Spec2Pep,
        valid: &BatchSource<'_>,
        train_loss: Option<f64>,
        metrics: Option<&MetricsLogger>,
    ) -> Result<ValidationMetrics> {
        let (valid_loss, pairs) = self.validation_loss(model, valid, None)?;
        let precision = pairs.map(|pairs| {
            let counts = aa_match_batch(
                pairs.iter().map(|(t, p)| (t.as_str(), Some(p.as_str()))),
                model.tokenizer(),
            );
            aa_match_metrics(&counts)
        });

        let row = ValidationMetrics {
            epoch: self.current_epoch,
            step: self.global_step,
            train_loss,
            valid_loss,
            aa_precision: precision.map(|p| p.aa_precision),
            peptide_precision: precision.map(|p| p.peptide_precision),
        };
        tracing::info!(
            "Validation at step {}: valid_loss={:.4}{}",
            row.step,
            row.valid_loss,
            precision
                .map(|p| format!(
                    " aa_precision={:.3} peptide_precision={:.3}",
                    p.aa_precision, p.peptide_precision
                ))
                .unwrap_or_default()
        );

        if let Some(logger) = metrics {
            logger.log(&row)?;
        }
        if row.is_improvement(self.best_valid_loss) {
            self.best_valid_loss = row.valid_loss;
            if self.checkpointing() {
                self.save_checkpoint(model, &self.best_checkpoint_path())?;
            }
        }
        model.record_validation(row.clone());
        Ok(row)
    }

    /// Mean batch loss and, with precision enabled, all (truth, prediction) pairs.
    fn validation_loss(
        &self,
        model: &Spec2Pep,
        valid: &BatchSource<'_>,
        limit: Option<usize>,
    ) -> Result<(f64, Option<Vec<(String, String)>>)> {
        let mut loss_sum = 0.0f64;
        let mut n_batches = 0usize;
        let mut all_pairs: Option<Vec<(String, String)>> = None;

        for batch in valid.iter(0)?.take(limit.unwrap_or(usize::MAX)) {
            let out = model.validation_step(&batch?)?;
            loss_sum += out.loss;
            n_batches += 1;
            if let Some(pairs) = out.pairs {
                all_pairs.get_or_insert_with(Vec::new).extend(pairs);
            }
        }
        let loss = if n_batches == 0 {
            f64::NAN
        } else {
            loss_sum / n_batches as f64
        };
        Ok((loss, all_pairs))
    }

    // ── Checkpoints ──────────────────────────────────────────────────────────

    fn save_epoch_checkpoint(&mut self, model: &Spec2Pep, epoch: usize) -> Result<()> {
        if !self.checkpointing() {
            return Ok(());
        }
        let path = self
            .config
            .model_save_folder
            .join(format!("epoch={}-step={}.ckpt", epoch, self.global_step));
        self.save_checkpoint(model, &path)?;

        if let Some(prev) = self.last_epoch_checkpoint.replace(path.clone()) {
            if prev != path {
                fs::remove_file(&prev).map_err(|e| RunnerError::io(&prev, e))?;
            }
        }
        tracing::debug!("Epoch checkpoint saved to '{}'", path.display());
        Ok(())
    }

    /// Write the model's current state to `path`.
    pub fn save_checkpoint(&self, model: &Spec2Pep, path: &Path) -> Result<()> {
        model
            .to_checkpoint(self.current_epoch, self.global_step)?
            .save(path)
    }

    // ── Predict ──────────────────────────────────────────────────────────────

    /// Predict every batch, appending PSMs to `writer` as they are produced.
    pub fn predict(&mut self, model: &Spec2Pep, source: &BatchSource<'_>, writer: &mut MztabWriter) -> Result<usize> {
        let n = run_inference(model, source, writer)?;
        tracing::info!("Predicted {} PSM(s) from {} spectra", n, source.dataset().len());
        Ok(n)
    }
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::dataset::{DatasetBuilder, Split};
    use crate::data::preprocessor::{PreprocessingChain, PreprocessingParams};
    use crate::test_support;

    fn config(dir: &Path, mode: TrainerMode) -> TrainerConfig {
        TrainerConfig {
            mode,
            accelerator: "cpu".into(),
            devices: None,
            max_epochs: 3,
            num_sanity_val_steps: 0,
            val_check_interval: 2,
            model_save_folder: dir.to_path_buf(),
            output_root: None,
        }
    }

    #[test]
    fn test_inference_uses_one_device() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(dir.path(), TrainerMode::Inference);
        cfg.devices = Some(4);
        assert_eq!(Trainer::new(cfg.clone()).num_devices(), 1);
        cfg.mode = TrainerMode::Training;
        let t = Trainer::new(cfg.clone());
        assert_eq!(t.num_devices(), 4);
        assert_eq!(t.strategy(), Strategy::Auto);
        cfg.accelerator = "gpu".into();
        assert_eq!(Trainer::new(cfg).strategy(), Strategy::DataParallel);
    }

    #[test]
    fn test_fit_keeps_latest_epoch_checkpoint_and_best() {
        let dir = tempfile::tempdir().unwrap();
        let mgf = test_support::mgf_small(dir.path());
        let builder = DatasetBuilder::new(
            PreprocessingChain::standard(&PreprocessingParams::default()),
            dir.path(),
        );
        let train = builder.build(&[mgf.clone()], true, Split::Train, 1).unwrap();
        let valid = builder.build(&[mgf], true, Split::Valid, 8).unwrap();

        let ckpt_dir = dir.path().join("ckpt");
        let mut trainer = Trainer::new(config(&ckpt_dir, TrainerMode::Training));
        let mut model = Spec2Pep::new(test_support::tiny_hparams(), 1).unwrap();
        trainer
            .fit(
                &mut model,
                &BatchSource::new(&train, None),
                &BatchSource::new(&valid, None),
                None,
            )
            .unwrap();

        // 2 spectra, batch size 1: 2 steps per epoch, 3 epochs.
        assert_eq!(trainer.global_step(), 6);
        assert!(ckpt_dir.join("epoch=2-step=6.ckpt").is_file());
        assert!(!ckpt_dir.join("epoch=1-step=4.ckpt").exists());
        assert!(ckpt_dir.join("best.ckpt").is_file());
        assert_eq!(model.history().len(), 3);
    }

    #[test]
    fn test_inference_trainer_refuses_to_fit() {
        let dir = tempfile::tempdir().unwrap();
        let mgf = test_support::mgf_small(dir.path());
        let builder = DatasetBuilder::new(
            PreprocessingChain::standard(&PreprocessingParams::default()),
            dir.path(),
        );
        let ds = builder.build(&[mgf], true, Split::Train, 1).unwrap();
        let mut trainer = Trainer::new(config(dir.path(), TrainerMode::Inference));
        let mut model = Spec2Pep::new(test_support::tiny_hparams(), 1).unwrap();
        let src = BatchSource::new(&ds, None);
        assert!(trainer.fit(&mut model, &src, &src, None).is_err());
    }
}
