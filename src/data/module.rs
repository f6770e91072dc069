// ============================================================
// Layer 4: Data Module
// ============================================================
// One facade over every split the runner may need. The runner
// hands it the path lists it has, calls `setup` for the stage
// it is about to run, and then asks for dataloaders.
//
//   stage      builds
//   ─────────  ─────────────────
//   Fit        train + valid
//   Validate   valid
//   Test       test
//   (none)     everything supplied
//
// `setup` is idempotent: a split already built with the same
// annotation flag is not rebuilt. Only splits whose path list
// was supplied are built; asking for any other split fails with
// DatasetNotSet.

use std::path::PathBuf;

use crate::data::batcher::{BatchSource, Batches, ShuffleConfig, SpectrumBatch};
use crate::data::dataset::{DatasetBuilder, Split, SpectrumDataset};
use crate::data::tokenizer::PeptideTokenizer;
use crate::domain::error::{Result, RunnerError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Fit,
    Validate,
    Test,
}

/// Paths, batch sizes and shuffling for each split.
#[derive(Debug, Clone, Default)]
pub struct DataModuleConfig {
    pub train_paths: Option<Vec<PathBuf>>,
    pub valid_paths: Option<Vec<PathBuf>>,
    pub test_paths: Option<Vec<PathBuf>>,
    pub train_batch_size: usize,
    pub eval_batch_size: usize,
    /// `None` disables shuffling of the training split.
    pub shuffle: Option<ShuffleConfig>,
}

pub struct DataModule {
    builder: DatasetBuilder,
    config: DataModuleConfig,
    train: Option<SpectrumDataset>,
    valid: Option<SpectrumDataset>,
    test: Option<SpectrumDataset>,
}

impl DataModule {
    pub fn new(builder: DatasetBuilder, config: DataModuleConfig) -> Self {
        Self {
            builder,
            config,
            train: None,
            valid: None,
            test: None,
        }
    }

    pub fn config(&self) -> &DataModuleConfig {
        &self.config
    }

    /// Build the datasets needed for `stage`.
    pub fn setup(&mut self, stage: Option<Stage>, annotated: bool) -> Result<()> {
        let splits: &[Split] = match stage {
            None => &[Split::Train, Split::Valid, Split::Test],
            Some(Stage::Fit) => &[Split::Train, Split::Valid],
            Some(Stage::Validate) => &[Split::Valid],
            Some(Stage::Test) => &[Split::Test],
        };
        for &split in splits {
            self.build_split(split, annotated)?;
        }
        Ok(())
    }

    fn build_split(&mut self, split: Split, annotated: bool) -> Result<()> {
        let (paths, batch_size) = match split {
            Split::Train => (&self.config.train_paths, self.config.train_batch_size),
            Split::Valid => (&self.config.valid_paths, self.config.eval_batch_size),
            Split::Test => (&self.config.test_paths, self.config.eval_batch_size),
        };
        let Some(paths) = paths else {
            return Ok(());
        };

        let slot = match split {
            Split::Train => &self.train,
            Split::Valid => &self.valid,
            Split::Test => &self.test,
        };
        if slot.as_ref().is_some_and(|d| d.annotated() == annotated) {
            tracing::debug!("{} dataset already set up", split);
            return Ok(());
        }

        let dataset = self.builder.build(paths, annotated, split, batch_size)?;
        match split {
            Split::Train => self.train = Some(dataset),
            Split::Valid => self.valid = Some(dataset),
            Split::Test => self.test = Some(dataset),
        }
        Ok(())
    }

    pub fn dataset(&self, split: Split) -> Result<&SpectrumDataset> {
        let slot = match split {
            Split::Train => &self.train,
            Split::Valid => &self.valid,
            Split::Test => &self.test,
        };
        slot.as_ref().ok_or(RunnerError::DatasetNotSet(split))
    }

    /// Training batches, buffer-shuffled unless shuffling is disabled.
    pub fn train_dataloader(&self) -> Result<BatchSource<'_>> {
        Ok(BatchSource::new(self.dataset(Split::Train)?, self.config.shuffle))
    }

    pub fn val_dataloader(&self) -> Result<BatchSource<'_>> {
        Ok(BatchSource::new(self.dataset(Split::Valid)?, None))
    }

    pub fn test_dataloader(&self) -> Result<BatchSource<'_>> {
        Ok(BatchSource::new(self.dataset(Split::Test)?, None))
    }

    /// Same data and order as the test loader.
    pub fn predict_dataloader(&self) -> Result<BatchSource<'_>> {
        self.test_dataloader()
    }

    /// Test batches paired with database candidates for every spectrum.
    pub fn db_dataloader<'a>(&'a self, db: &'a ProteinDatabase) -> Result<DbBatches<'a>> {
        let batches = self.test_dataloader()?.iter(0)?;
        Ok(DbBatches { batches, db })
    }
}

// ─── Database search ──────────────────────────────────────────────────────────

/// Candidate peptides indexed by neutral mass.
#[derive(Debug, Clone)]
pub struct ProteinDatabase {
    /// (peptide, neutral mass), sorted by mass.
    peptides: Vec<(String, f64)>,
    tolerance_ppm: f64,
}

impl ProteinDatabase {
    pub fn new(
        peptides: impl IntoIterator<Item = String>,
        tokenizer: &PeptideTokenizer,
        tolerance_ppm: f64,
    ) -> Result<Self> {
        let mut indexed = Vec::new();
        for peptide in peptides {
            let mass = tokenizer.mass(&peptide)?;
            indexed.push((peptide, mass));
        }
        indexed.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        indexed.dedup_by(|a, b| a.0 == b.0);
        Ok(Self {
            peptides: indexed,
            tolerance_ppm,
        })
    }

    pub fn len(&self) -> usize {
        self.peptides.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peptides.is_empty()
    }

    /// Peptides whose mass lies within the ppm tolerance of `mass`.
    pub fn candidates(&self, mass: f64) -> Vec<&str> {
        let tol = mass.abs() * self.tolerance_ppm / 1e6;
        let lo = self.peptides.partition_point(|(_, m)| *m < mass - tol);
        self.peptides[lo..]
            .iter()
            .take_while(|(_, m)| *m <= mass + tol)
            .map(|(p, _)| p.as_str())
            .collect()
    }
}

/// A batch of spectra and the candidate peptides of each one.
#[derive(Debug, Clone, PartialEq)]
pub struct PsmBatch {
    pub spectra: SpectrumBatch,
    pub candidates: Vec<Vec<String>>,
}

pub struct DbBatches<'a> {
    batches: Batches,
    db: &'a ProteinDatabase,
}

impl Iterator for DbBatches<'_> {
    type Item = Result<PsmBatch>;

    fn next(&mut self) -> Option<Self::Item> {
        let batch = match self.batches.next()? {
            Ok(b) => b,
            Err(e) => return Some(Err(e)),
        };
        let candidates = batch
            .spectra
            .iter()
            .map(|s| {
                self.db
                    .candidates(s.precursor_mass())
                    .into_iter()
                    .map(str::to_string)
                    .collect()
            })
            .collect();
        Some(Ok(PsmBatch {
            spectra: batch,
            candidates,
        }))
    }
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::preprocessor::{PreprocessingChain, PreprocessingParams};
    use crate::data::tokenizer::default_residues;
    use crate::test_support;

    fn module(dir: &std::path::Path, config: DataModuleConfig) -> DataModule {
        DataModule::new(
            DatasetBuilder::new(PreprocessingChain::standard(&PreprocessingParams::default()), dir),
            config,
        )
    }

    #[test]
    fn test_unset_datasets_fail_clearly() {
        let dir = tempfile::tempdir().unwrap();
        let dm = module(dir.path(), DataModuleConfig::default());
        let err = dm.train_dataloader().err().unwrap();
        assert!(matches!(err, RunnerError::DatasetNotSet(Split::Train)));
        assert!(matches!(
            dm.test_dataloader().err().unwrap(),
            RunnerError::DatasetNotSet(Split::Test)
        ));
    }

    #[test]
    fn test_setup_builds_only_supplied_splits_and_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let mgf = test_support::mgf_small(dir.path());
        let mut dm = module(
            dir.path(),
            DataModuleConfig {
                train_paths: Some(vec![mgf.clone()]),
                valid_paths: Some(vec![mgf]),
                train_batch_size: 4,
                eval_batch_size: 8,
                ..Default::default()
            },
        );

        dm.setup(Some(Stage::Fit), true).unwrap();
        assert_eq!(dm.train_dataloader().unwrap().batch_size(), 4);
        assert_eq!(dm.val_dataloader().unwrap().batch_size(), 8);
        assert!(dm.test_dataloader().is_err());

        let store = dm.dataset(Split::Train).unwrap().descriptor().store_path.clone();
        let before = std::fs::metadata(store.join("records.bin"))
            .unwrap()
            .modified()
            .unwrap();
        dm.setup(Some(Stage::Fit), true).unwrap();
        let after = std::fs::metadata(store.join("records.bin"))
            .unwrap()
            .modified()
            .unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn test_only_training_is_shuffled() {
        let dir = tempfile::tempdir().unwrap();
        let mgf = test_support::mgf_small(dir.path());
        let mut dm = module(
            dir.path(),
            DataModuleConfig {
                train_paths: Some(vec![mgf.clone()]),
                test_paths: Some(vec![mgf]),
                train_batch_size: 2,
                eval_batch_size: 2,
                shuffle: Some(ShuffleConfig {
                    capacity: 4,
                    seed: Some(1),
                }),
                ..Default::default()
            },
        );
        dm.setup(None, true).unwrap();
        assert!(dm.train_dataloader().unwrap().is_shuffled());
        assert!(!dm.test_dataloader().unwrap().is_shuffled());
        assert!(!dm.predict_dataloader().unwrap().is_shuffled());
    }

    #[test]
    fn test_db_candidates_within_tolerance() {
        let tok = PeptideTokenizer::new(&default_residues()).unwrap();
        let db = ProteinDatabase::new(
            ["PEPTIDE", "PEPTLDE", "AMDK", "PEPTIDE"].map(String::from),
            &tok,
            10.0,
        )
        .unwrap();
        assert_eq!(db.len(), 3);

        let mass = tok.mass("PEPTIDE").unwrap();
        let mut found = db.candidates(mass);
        found.sort_unstable();
        // I and L are isobaric.
        assert_eq!(found, vec!["PEPTIDE", "PEPTLDE"]);
        assert!(db.candidates(mass + 1.0).is_empty());
    }

    #[test]
    fn test_db_dataloader_pairs_every_spectrum() {
        let dir = tempfile::tempdir().unwrap();
        let mgf = test_support::mgf_small(dir.path());
        let mut dm = module(
            dir.path(),
            DataModuleConfig {
                test_paths: Some(vec![mgf]),
                eval_batch_size: 8,
                ..Default::default()
            },
        );
        dm.setup(Some(Stage::Test), false).unwrap();

        let tok = PeptideTokenizer::new(&default_residues()).unwrap();
        let db = ProteinDatabase::new(
            test_support::MGF_SMALL_PEPTIDES.map(String::from),
            &tok,
            50.0,
        )
        .unwrap();
        let batches: Vec<PsmBatch> = dm
            .db_dataloader(&db)
            .unwrap()
            .map(|b| b.unwrap())
            .collect();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].candidates.len(), batches[0].spectra.len());
        assert!(batches[0].candidates.iter().all(|c| !c.is_empty()));
    }
}
