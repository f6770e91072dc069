// ============================================================
// Layer 4: Spectrum Dataset
// ============================================================
// A dataset is one split (train / valid / test) materialized as
// a spectrum store. The builder decides, from the input paths,
// whether it can reuse a pre-built store or has to parse the
// peak files, run the preprocessing chain and write a new one.
//
//   paths ──► FormatSet::resolve
//               │
//               ├─ Prebuilt(store)  open it as is
//               │
//               └─ Raw(files)       parse ─► preprocess ─► store
//                                   at <work_dir>/<split>.spstore

use std::fmt;
use std::path::{Path, PathBuf};

use crate::data::loader::open_reader;
use crate::data::preprocessor::PreprocessingChain;
use crate::domain::error::{Result, RunnerError};
use crate::domain::format::{AuxFields, FormatSet, PeakFileFormat};
use crate::domain::spectrum::SpectrumRecord;
use crate::infra::store::{SpectrumStore, StoreIter, StoreWriter, STORE_EXTENSION};

/// Message of every annotation-index failure.
pub const ANNOTATION_INDEX_ERROR: &str = "Error creating annotated spectrum index. \
     This may be the result of having an unannotated MGF file present in the \
     validation peak file path list.\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Split {
    Train,
    Valid,
    Test,
}

impl fmt::Display for Split {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Split::Train => "train",
            Split::Valid => "valid",
            Split::Test => "test",
        };
        f.write_str(name)
    }
}

/// What a dataset was built from and where it lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetDescriptor {
    pub split: Split,
    pub sources: Vec<PathBuf>,
    pub annotated: bool,
    pub store_path: PathBuf,
}

/// A built split, ready for the batch source.
#[derive(Debug, Clone)]
pub struct SpectrumDataset {
    descriptor: DatasetDescriptor,
    store: SpectrumStore,
    batch_size: usize,
}

impl SpectrumDataset {
    pub fn descriptor(&self) -> &DatasetDescriptor {
        &self.descriptor
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn annotated(&self) -> bool {
        self.descriptor.annotated
    }

    pub fn fields(&self) -> AuxFields {
        self.store.fields()
    }

    /// Source file paths in `file_index` order.
    pub fn source_files(&self) -> &[String] {
        self.store.source_files()
    }

    pub fn get(&self, i: usize) -> Result<SpectrumRecord> {
        self.store.get(i)
    }

    /// Records in storage order.
    pub fn iter(&self) -> Result<StoreIter> {
        self.store.iter()
    }
}

/// Builds datasets under one working directory.
pub struct DatasetBuilder {
    chain: PreprocessingChain,
    work_dir: PathBuf,
}

impl DatasetBuilder {
    pub fn new(chain: PreprocessingChain, work_dir: impl AsRef<Path>) -> Self {
        Self {
            chain,
            work_dir: work_dir.as_ref().to_path_buf(),
        }
    }

    /// Deterministic store location for a split.
    pub fn store_path(&self, split: Split) -> PathBuf {
        self.work_dir.join(format!("{split}.{STORE_EXTENSION}"))
    }

    pub fn build(
        &self,
        paths: &[PathBuf],
        annotated: bool,
        split: Split,
        batch_size: usize,
    ) -> Result<SpectrumDataset> {
        let set = FormatSet::resolve(paths)?;

        let store = match &set {
            FormatSet::Prebuilt(path) => {
                let store = SpectrumStore::open(path)?;
                if annotated && !store.annotated() {
                    return Err(RunnerError::AnnotationIndex(format!(
                        "{ANNOTATION_INDEX_ERROR}Original error message: spectrum store '{}' \
                         was built without annotations",
                        path.display()
                    )));
                }
                tracing::info!(
                    "Using pre-built {} store '{}' ({} spectra)",
                    split,
                    path.display(),
                    store.len()
                );
                store
            }
            FormatSet::Raw { files, .. } => {
                let fields = set.aux_fields(annotated, split);
                self.materialize(files, annotated, fields, split)?
            }
        };

        Ok(SpectrumDataset {
            descriptor: DatasetDescriptor {
                split,
                sources: paths.to_vec(),
                annotated,
                store_path: store.path().to_path_buf(),
            },
            store,
            batch_size: batch_size.max(1),
        })
    }

    fn materialize(
        &self,
        files: &[(PathBuf, PeakFileFormat)],
        annotated: bool,
        fields: AuxFields,
        split: Split,
    ) -> Result<SpectrumStore> {
        let target = self.store_path(split);
        let mut writer = StoreWriter::create(&target, annotated, fields)?;
        let mut n_read = 0usize;
        let mut n_rejected = 0usize;

        for (path, format) in files {
            let file_index = writer.add_source(path);
            let family = format.family();
            let mut reader = open_reader(path, *format)?;

            while let Some(raw) = reader.next_spectrum()? {
                n_read += 1;

                // ── Step 1: Auxiliary fields, read before the peaks move ──
                let annotation = if fields.sequence {
                    match raw.params.get("seq") {
                        Some(seq) => Some(seq.clone()),
                        None => {
                            return Err(RunnerError::AnnotationIndex(format!(
                                "{ANNOTATION_INDEX_ERROR}Original error message: spectrum {} \
                                 in '{}' has no SEQ annotation",
                                raw.index,
                                path.display()
                            )))
                        }
                    }
                } else {
                    None
                };
                let scan = match family {
                    Some(family) if fields.scan_fields => family.extract_scan_fields(&raw),
                    _ => Default::default(),
                };

                // ── Step 2: Normalize and preprocess ──
                let mut rec = SpectrumRecord::new(
                    raw.mz,
                    raw.intensity,
                    raw.precursor_mz,
                    raw.precursor_charge.unwrap_or(0),
                );
                rec.file_index = file_index;
                rec.index = raw.index;
                rec.retention_time = raw.retention_time;
                rec.annotation = annotation;
                rec.scan_id = scan.scan_id;
                rec.title = scan.title;

                match self.chain.apply(rec) {
                    Some(rec) => writer.append(&rec)?,
                    None => n_rejected += 1,
                }
            }
        }

        let store = writer.finish()?;
        tracing::info!(
            "Built {} dataset: {} spectra from {} file(s) ({} of {} rejected by preprocessing)",
            split,
            store.len(),
            files.len(),
            n_rejected,
            n_read
        );
        Ok(store)
    }
}
