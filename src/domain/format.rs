// ============================================================
// Layer 3: Peak File Formats
// ============================================================
// Input format is decided purely by file extension. Instead of
// scattering extension checks across the code base, a path set
// is resolved once into a FormatSet, and each format family
// carries its own strategy for pulling scan identifiers out of
// a RawSpectrum.
//
//   family A  (MGF)        scans = SCANS param, else TITLE
//                          title = TITLE param
//   family B  (mzML/mzXML) scans = title = native id
//   store     pre-built spectrum store, loaded as is

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::data::dataset::Split;
use crate::domain::error::{Result, RunnerError};
use crate::domain::spectrum::RawSpectrum;
use crate::infra::store::STORE_EXTENSION;

/// Every input format the pipeline understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeakFileFormat {
    Mgf,
    MzMl,
    MzXml,
    /// A spectrum store materialized by an earlier run.
    RecordStore,
}

/// Families of peak-list formats sharing a scan-identifier scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FormatFamily {
    Mgf,
    Xml,
}

impl PeakFileFormat {
    /// Sniff the format from the extension (case insensitive).
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "mgf" => Some(PeakFileFormat::Mgf),
            "mzml" => Some(PeakFileFormat::MzMl),
            "mzxml" => Some(PeakFileFormat::MzXml),
            e if e == STORE_EXTENSION => Some(PeakFileFormat::RecordStore),
            _ => None,
        }
    }

    pub fn family(self) -> Option<FormatFamily> {
        match self {
            PeakFileFormat::Mgf => Some(FormatFamily::Mgf),
            PeakFileFormat::MzMl | PeakFileFormat::MzXml => Some(FormatFamily::Xml),
            PeakFileFormat::RecordStore => None,
        }
    }

    /// Formats that may carry peptide annotations.
    pub fn supports_annotations(self) -> bool {
        matches!(self, PeakFileFormat::Mgf | PeakFileFormat::RecordStore)
    }

    /// The formats a run accepts, depending on whether annotations are required.
    pub fn supported(annotated: bool) -> &'static [PeakFileFormat] {
        if annotated {
            &[PeakFileFormat::Mgf, PeakFileFormat::RecordStore]
        } else {
            &[
                PeakFileFormat::Mgf,
                PeakFileFormat::RecordStore,
                PeakFileFormat::MzMl,
                PeakFileFormat::MzXml,
            ]
        }
    }
}

impl fmt::Display for PeakFileFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PeakFileFormat::Mgf => "MGF",
            PeakFileFormat::MzMl => "mzML",
            PeakFileFormat::MzXml => "mzXML",
            PeakFileFormat::RecordStore => "spectrum store",
        };
        f.write_str(name)
    }
}

/// Scan identifier and title pulled from a raw spectrum.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ScanFields {
    pub scan_id: Option<String>,
    pub title: Option<String>,
}

impl FormatFamily {
    /// Extraction strategy for the scan-id / title auxiliary fields.
    pub fn extract_scan_fields(self, raw: &RawSpectrum) -> ScanFields {
        match self {
            FormatFamily::Mgf => {
                let title = raw.params.get("title").cloned();
                let scan_id = raw
                    .params
                    .get("scans")
                    .cloned()
                    .or_else(|| title.clone())
                    .or_else(|| Some(format!("index={}", raw.index)));
                ScanFields { scan_id, title }
            }
            FormatFamily::Xml => {
                let id = raw
                    .native_id
                    .clone()
                    .unwrap_or_else(|| format!("index={}", raw.index));
                ScanFields {
                    scan_id: Some(id.clone()),
                    title: Some(id),
                }
            }
        }
    }
}

/// Auxiliary fields to extract while building a dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AuxFields {
    /// Ground-truth peptide sequence (`SEQ`).
    pub sequence: bool,
    /// Scan identifier and title.
    pub scan_fields: bool,
}

/// A path set resolved into a single, closed description of its formats.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FormatSet {
    /// Exactly one pre-built store.
    Prebuilt(PathBuf),
    /// Raw peak files; `family` is `Some` only when every file shares one.
    Raw {
        files: Vec<(PathBuf, PeakFileFormat)>,
        family: Option<FormatFamily>,
    },
}

impl FormatSet {
    /// Classify every path by extension.
    ///
    /// Fails fast when a pre-built store is mixed with raw files, when more than
    /// one store is given, or when a file's format is not recognized.
    pub fn resolve(paths: &[PathBuf]) -> Result<Self> {
        if paths.is_empty() {
            return Err(RunnerError::Config("no input paths were given".into()));
        }

        let formats: Vec<Option<PeakFileFormat>> =
            paths.iter().map(|p| PeakFileFormat::from_path(p)).collect();
        let n_stores = formats
            .iter()
            .filter(|f| **f == Some(PeakFileFormat::RecordStore))
            .count();

        if n_stores > 0 {
            if n_stores != paths.len() {
                return Err(RunnerError::Config(
                    "a pre-built spectrum store cannot be mixed with raw peak files".into(),
                ));
            }
            if n_stores > 1 {
                return Err(RunnerError::Config(format!(
                    "multiple spectrum stores specified ({n_stores}); only one is allowed"
                )));
            }
            return Ok(FormatSet::Prebuilt(paths[0].clone()));
        }

        let mut files = Vec::with_capacity(paths.len());
        for (path, format) in paths.iter().zip(formats) {
            let format = format.ok_or_else(|| {
                RunnerError::Config(format!("unsupported peak file: '{}'", path.display()))
            })?;
            files.push((path.clone(), format));
        }

        let first = files[0].1.family();
        let family = if files.iter().all(|(_, f)| f.family() == first) {
            first
        } else {
            None
        };

        Ok(FormatSet::Raw { files, family })
    }

    /// Decide which auxiliary fields to extract for a split.
    pub fn aux_fields(&self, annotated: bool, split: Split) -> AuxFields {
        let uniform = matches!(self, FormatSet::Raw { family: Some(_), .. });
        AuxFields {
            sequence: annotated,
            scan_fields: split == Split::Test && uniform,
        }
    }

    /// The shared family, when there is one.
    pub fn family(&self) -> Option<FormatFamily> {
        match self {
            FormatSet::Raw { family, .. } => *family,
            FormatSet::Prebuilt(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paths(names: &[&str]) -> Vec<PathBuf> {
        names.iter().map(PathBuf::from).collect()
    }

    #[test]
    fn test_sniff_is_case_insensitive() {
        assert_eq!(
            PeakFileFormat::from_path(Path::new("a/B.mzML")),
            Some(PeakFileFormat::MzMl)
        );
        assert_eq!(
            PeakFileFormat::from_path(Path::new("x.MGF")),
            Some(PeakFileFormat::Mgf)
        );
        assert_eq!(PeakFileFormat::from_path(Path::new("x.txt")), None);
        assert_eq!(PeakFileFormat::from_path(Path::new("noext")), None);
    }

    #[test]
    fn test_uniform_mgf_set_extracts_scan_fields_for_test_only() {
        let set = FormatSet::resolve(&paths(&["a.mgf", "b.mgf"])).unwrap();
        assert_eq!(set.family(), Some(FormatFamily::Mgf));
        let test = set.aux_fields(false, Split::Test);
        assert!(test.scan_fields && !test.sequence);
        let train = set.aux_fields(true, Split::Train);
        assert!(!train.scan_fields && train.sequence);
    }

    #[test]
    fn test_mixed_families_extract_no_scan_fields() {
        let set = FormatSet::resolve(&paths(&["a.mgf", "b.mzML"])).unwrap();
        assert_eq!(set.family(), None);
        assert!(!set.aux_fields(false, Split::Test).scan_fields);
    }

    #[test]
    fn test_mzml_and_mzxml_share_a_family() {
        let set = FormatSet::resolve(&paths(&["a.mzml", "b.mzXML"])).unwrap();
        assert_eq!(set.family(), Some(FormatFamily::Xml));
    }

    #[test]
    fn test_store_mixed_with_raw_is_a_config_error() {
        let store = format!("train.{STORE_EXTENSION}");
        let err = FormatSet::resolve(&paths(&[store.as_str(), "a.mgf"])).unwrap_err();
        assert!(matches!(err, RunnerError::Config(_)));
    }

    #[test]
    fn test_two_stores_are_a_config_error() {
        let a = format!("a.{STORE_EXTENSION}");
        let b = format!("b.{STORE_EXTENSION}");
        let err = FormatSet::resolve(&paths(&[a.as_str(), b.as_str()])).unwrap_err();
        assert!(matches!(err, RunnerError::Config(_)));
    }

    #[test]
    fn test_single_store_is_prebuilt() {
        let a = format!("a.{STORE_EXTENSION}");
        let set = FormatSet::resolve(&paths(&[a.as_str()])).unwrap();
        assert!(matches!(set, FormatSet::Prebuilt(_)));
    }

    #[test]
    fn test_mgf_scan_fields_fall_back_to_title() {
        let mut raw = RawSpectrum::default();
        raw.params.insert("title".into(), "spec_1".into());
        let fields = FormatFamily::Mgf.extract_scan_fields(&raw);
        assert_eq!(fields.scan_id.as_deref(), Some("spec_1"));

        raw.params.insert("scans".into(), "F1:17".into());
        let fields = FormatFamily::Mgf.extract_scan_fields(&raw);
        assert_eq!(fields.scan_id.as_deref(), Some("F1:17"));
        assert_eq!(fields.title.as_deref(), Some("spec_1"));
    }

    #[test]
    fn test_xml_scan_fields_use_native_id() {
        let raw = RawSpectrum {
            native_id: Some("scan=42".into()),
            ..Default::default()
        };
        let fields = FormatFamily::Xml.extract_scan_fields(&raw);
        assert_eq!(fields.scan_id, fields.title);
        assert_eq!(fields.scan_id.as_deref(), Some("scan=42"));
    }
}
