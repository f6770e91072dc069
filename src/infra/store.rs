// ============================================================
// Layer 6: Spectrum Record Store
// ============================================================
// The reusable on-disk form of a dataset. Peak files are parsed
// and preprocessed once; every later epoch (and every later run
// pointed at the store) reads normalized records straight back.
//
// Layout of a store directory `<name>.spstore/`:
//
//   manifest.json   version, annotated flag, extracted fields,
//                   source files and the byte offset of every
//                   record
//   records.bin     length-prefixed bincode records
//                   [u32 LE length][SpectrumRecord bytes] ...
//
// A store is built in a `.tmp` sibling directory and renamed
// into place only after the manifest is written, so a crashed
// build never leaves a store that looks complete.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::domain::error::{Result, RunnerError};
use crate::domain::format::AuxFields;
use crate::domain::spectrum::SpectrumRecord;
use crate::infra::atomic;

/// Directory extension marking a pre-built store.
pub const STORE_EXTENSION: &str = "spstore";

/// Bumped whenever the record layout changes.
pub const STORE_VERSION: u32 = 1;

const MANIFEST_FILE: &str = "manifest.json";
const RECORDS_FILE: &str = "records.bin";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreManifest {
    pub version: u32,
    pub annotated: bool,
    pub fields: AuxFields,
    pub n_spectra: usize,
    pub source_files: Vec<String>,
    pub offsets: Vec<u64>,
}

// ─── Writer ───────────────────────────────────────────────────────────────────

/// Streams records into a new store.
pub struct StoreWriter {
    target: PathBuf,
    staging: PathBuf,
    records: BufWriter<File>,
    position: u64,
    manifest: StoreManifest,
}

impl StoreWriter {
    /// Start a new store at `target`, replacing any previous one on `finish`.
    pub fn create(target: impl AsRef<Path>, annotated: bool, fields: AuxFields) -> Result<Self> {
        let target = target.as_ref().to_path_buf();
        let staging = atomic::temp_sibling(&target);

        if staging.exists() {
            fs::remove_dir_all(&staging).map_err(|e| RunnerError::io(&staging, e))?;
        }
        fs::create_dir_all(&staging).map_err(|e| RunnerError::io(&staging, e))?;

        let records_path = staging.join(RECORDS_FILE);
        let file = File::create(&records_path).map_err(|e| RunnerError::io(&records_path, e))?;

        Ok(Self {
            target,
            staging,
            records: BufWriter::new(file),
            position: 0,
            manifest: StoreManifest {
                version: STORE_VERSION,
                annotated,
                fields,
                n_spectra: 0,
                source_files: Vec::new(),
                offsets: Vec::new(),
            },
        })
    }

    /// Register a source file; returns its index for `SpectrumRecord::file_index`.
    pub fn add_source(&mut self, path: &Path) -> usize {
        self.manifest
            .source_files
            .push(path.to_string_lossy().into_owned());
        self.manifest.source_files.len() - 1
    }

    pub fn append(&mut self, record: &SpectrumRecord) -> Result<()> {
        let bytes = bincode::serialize(record)
            .map_err(|e| RunnerError::corrupt(&self.staging, e.to_string()))?;
        let len = u32::try_from(bytes.len())
            .map_err(|_| RunnerError::corrupt(&self.staging, "record exceeds 4 GiB"))?;

        let records_path = self.staging.join(RECORDS_FILE);
        self.records
            .write_all(&len.to_le_bytes())
            .and_then(|_| self.records.write_all(&bytes))
            .map_err(|e| RunnerError::io(&records_path, e))?;

        self.manifest.offsets.push(self.position);
        self.manifest.n_spectra += 1;
        self.position += 4 + u64::from(len);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.manifest.n_spectra
    }

    pub fn is_empty(&self) -> bool {
        self.manifest.n_spectra == 0
    }

    /// Flush, write the manifest and move the store into place.
    pub fn finish(mut self) -> Result<SpectrumStore> {
        let records_path = self.staging.join(RECORDS_FILE);
        self.records
            .flush()
            .map_err(|e| RunnerError::io(&records_path, e))?;
        self.records
            .get_ref()
            .sync_all()
            .map_err(|e| RunnerError::io(&records_path, e))?;

        let manifest = serde_json::to_vec_pretty(&self.manifest)
            .map_err(|e| RunnerError::corrupt(&self.staging, e.to_string()))?;
        atomic::write_atomic(&self.staging.join(MANIFEST_FILE), &manifest)?;

        if self.target.exists() {
            fs::remove_dir_all(&self.target).map_err(|e| RunnerError::io(&self.target, e))?;
        }
        fs::rename(&self.staging, &self.target).map_err(|e| RunnerError::io(&self.target, e))?;

        tracing::debug!(
            "Materialized {} spectra into '{}'",
            self.manifest.n_spectra,
            self.target.display()
        );

        Ok(SpectrumStore {
            path: self.target,
            manifest: self.manifest,
        })
    }
}

// ─── Reader ───────────────────────────────────────────────────────────────────

/// A finished, read-only store.
#[derive(Debug, Clone)]
pub struct SpectrumStore {
    path: PathBuf,
    manifest: StoreManifest,
}

impl SpectrumStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if !path.is_dir() {
            return Err(RunnerError::not_found("a spectrum store", &path));
        }

        let manifest_path = path.join(MANIFEST_FILE);
        let bytes = fs::read(&manifest_path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => RunnerError::corrupt(&path, "store has no manifest"),
            _ => RunnerError::io(&manifest_path, e),
        })?;
        let manifest: StoreManifest = serde_json::from_slice(&bytes)
            .map_err(|e| RunnerError::corrupt(&manifest_path, e.to_string()))?;

        if manifest.version != STORE_VERSION {
            return Err(RunnerError::corrupt(
                &path,
                format!(
                    "unsupported store version {} (expected {STORE_VERSION})",
                    manifest.version
                ),
            ));
        }
        if manifest.offsets.len() != manifest.n_spectra {
            return Err(RunnerError::corrupt(&path, "manifest offsets do not match record count"));
        }

        Ok(Self { path, manifest })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.manifest.n_spectra
    }

    pub fn is_empty(&self) -> bool {
        self.manifest.n_spectra == 0
    }

    /// Whether the store was built with ground-truth sequences.
    pub fn annotated(&self) -> bool {
        self.manifest.annotated
    }

    pub fn fields(&self) -> AuxFields {
        self.manifest.fields
    }

    pub fn source_files(&self) -> &[String] {
        &self.manifest.source_files
    }

    /// Random access to one record.
    pub fn get(&self, i: usize) -> Result<SpectrumRecord> {
        let offset = *self.manifest.offsets.get(i).ok_or_else(|| {
            RunnerError::corrupt(
                &self.path,
                format!("record {i} out of range ({} records)", self.len()),
            )
        })?;
        let records_path = self.path.join(RECORDS_FILE);
        let file = File::open(&records_path).map_err(|e| RunnerError::io(&records_path, e))?;
        let mut available = file_len(&file, &records_path)?.saturating_sub(offset);
        let mut reader = BufReader::new(file);
        reader
            .seek(SeekFrom::Start(offset))
            .map_err(|e| RunnerError::io(&records_path, e))?;
        read_record(&mut reader, &records_path, &mut available)?
            .ok_or_else(|| RunnerError::corrupt(&records_path, "unexpected end of store data"))
    }

    /// Stream every record in storage order.
    pub fn iter(&self) -> Result<StoreIter> {
        let records_path = self.path.join(RECORDS_FILE);
        let file = File::open(&records_path).map_err(|e| RunnerError::io(&records_path, e))?;
        let available = file_len(&file, &records_path)?;
        Ok(StoreIter {
            reader: BufReader::new(file),
            path: records_path,
            remaining: self.len(),
            available,
        })
    }
}

/// Sequential reader over `records.bin`.
pub struct StoreIter {
    reader: BufReader<File>,
    path: PathBuf,
    remaining: usize,
    /// Unread bytes of `records.bin`.
    available: u64,
}

impl Iterator for StoreIter {
    type Item = Result<SpectrumRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        match read_record(&mut self.reader, &self.path, &mut self.available) {
            Ok(Some(record)) => Some(Ok(record)),
            Ok(None) => {
                self.remaining = 0;
                Some(Err(RunnerError::corrupt(&self.path, "unexpected end of store data")))
            }
            Err(e) => {
                self.remaining = 0;
                Some(Err(e))
            }
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, Some(self.remaining))
    }
}

/// Read one length-prefixed record. `available` counts the bytes left in
/// the file from the reader's position; a length prefix that claims more
/// than that is corrupt and never allocated.
fn read_record(reader: &mut impl Read, path: &Path, available: &mut u64) -> Result<Option<SpectrumRecord>> {
    let mut len = [0u8; 4];
    match reader.read_exact(&mut len) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(RunnerError::io(path, e)),
    }
    let len = u64::from(u32::from_le_bytes(len));
    *available = available.saturating_sub(4);
    if len > *available {
        return Err(RunnerError::corrupt(
            path,
            format!("record length {len} exceeds the {available} bytes left in the store"),
        ));
    }
    *available -= len;

    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf).map_err(|e| match e.kind() {
        std::io::ErrorKind::UnexpectedEof => RunnerError::corrupt(path, "truncated record"),
        _ => RunnerError::io(path, e),
    })?;
    let record =
        bincode::deserialize(&buf).map_err(|e| RunnerError::corrupt(path, e.to_string()))?;
    Ok(Some(record))
}

fn file_len(file: &File, path: &Path) -> Result<u64> {
    Ok(file.metadata().map_err(|e| RunnerError::io(path, e))?.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(i: usize, seq: Option<&str>) -> SpectrumRecord {
        let mut r = SpectrumRecord::new(vec![100.0 + i as f64, 200.0], vec![1.0, 0.5], 450.0, 2);
        r.index = i;
        r.annotation = seq.map(str::to_string);
        r
    }

    #[test]
    fn test_write_then_read_back_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join(format!("train.{STORE_EXTENSION}"));
        let fields = AuxFields {
            sequence: true,
            scan_fields: false,
        };

        let mut writer = StoreWriter::create(&target, true, fields).unwrap();
        let src = writer.add_source(Path::new("a.mgf"));
        assert_eq!(src, 0);
        for i in 0..5 {
            writer.append(&record(i, Some("PEPTIDE"))).unwrap();
        }
        let store = writer.finish().unwrap();
        assert_eq!(store.len(), 5);

        let reopened = SpectrumStore::open(&target).unwrap();
        assert!(reopened.annotated());
        assert_eq!(reopened.fields(), fields);
        assert_eq!(reopened.source_files(), &["a.mgf".to_string()]);

        let all: Vec<_> = reopened.iter().unwrap().map(|r| r.unwrap()).collect();
        assert_eq!(all.len(), 5);
        assert_eq!(all[3], record(3, Some("PEPTIDE")));
        assert_eq!(reopened.get(4).unwrap(), all[4]);
        assert!(reopened.get(5).is_err());
        assert!(!atomic::temp_sibling(&target).exists());
    }

    #[test]
    fn test_open_missing_store_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = SpectrumStore::open(dir.path().join("nope.spstore")).unwrap_err();
        assert_eq!(err.code(), "not-found");
    }

    #[test]
    fn test_directory_without_manifest_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let err = SpectrumStore::open(dir.path()).unwrap_err();
        assert_eq!(err.code(), "corrupt-data");
    }

    #[test]
    fn test_truncated_records_are_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("t.spstore");
        let mut writer = StoreWriter::create(&target, false, AuxFields::default()).unwrap();
        writer.append(&record(0, None)).unwrap();
        writer.append(&record(1, None)).unwrap();
        writer.finish().unwrap();

        let records = target.join(RECORDS_FILE);
        let bytes = fs::read(&records).unwrap();
        fs::write(&records, &bytes[..bytes.len() - 3]).unwrap();

        let store = SpectrumStore::open(&target).unwrap();
        let results: Vec<_> = store.iter().unwrap().collect();
        assert!(results[0].is_ok());
        assert_eq!(results[1].as_ref().unwrap_err().code(), "corrupt-data");
    }

    #[test]
    fn test_oversized_length_prefix_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("big.spstore");
        let mut writer = StoreWriter::create(&target, false, AuxFields::default()).unwrap();
        writer.append(&record(0, None)).unwrap();
        writer.finish().unwrap();

        // Claim a 4 GiB record in a file of a few dozen bytes.
        let records = target.join(RECORDS_FILE);
        let mut bytes = fs::read(&records).unwrap();
        bytes[..4].copy_from_slice(&u32::MAX.to_le_bytes());
        fs::write(&records, &bytes).unwrap();

        let store = SpectrumStore::open(&target).unwrap();
        let err = store.iter().unwrap().next().unwrap().unwrap_err();
        assert_eq!(err.code(), "corrupt-data");
        assert!(err.to_string().contains("exceeds"));
        assert_eq!(store.get(0).unwrap_err().code(), "corrupt-data");
    }
}
