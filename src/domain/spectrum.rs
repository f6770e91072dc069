// ============================================================
// Layer 3: Spectrum Domain Types
// ============================================================
// Two shapes of the same scan:
//
//   RawSpectrum     what a peak-list reader hands us, straight
//                   from the file, with the format-specific
//                   metadata still attached (MGF params or the
//                   mzML native id).
//
//   SpectrumRecord  the normalized record we persist in the
//                   spectrum store and feed to the model.
//                   Peaks are sorted by m/z and intensities
//                   are non-negative.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Mass of a proton in Dalton.
pub const PROTON_MASS: f64 = 1.007_276;

/// A scan as read from a peak-list file, before normalization.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawSpectrum {
    /// Position of the scan within its file (0-based).
    pub index: usize,
    /// MS level; MGF files only carry MS/MS scans so readers default to 2.
    pub ms_level: u8,
    pub mz: Vec<f64>,
    pub intensity: Vec<f32>,
    pub precursor_mz: f64,
    /// `None` when the file did not state a charge.
    pub precursor_charge: Option<u8>,
    pub retention_time: Option<f64>,
    /// Lower-cased `KEY=VALUE` header lines of an MGF block.
    pub params: BTreeMap<String, String>,
    /// The `id` attribute of an mzML spectrum or the `num` of an mzXML scan.
    pub native_id: Option<String>,
}

/// Whether the root compression has already been applied to a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum IntensityScaling {
    #[default]
    Raw,
    Root,
}

/// One normalized MS/MS scan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpectrumRecord {
    /// Index into the owning store's list of source files.
    pub file_index: usize,
    /// Position of the scan within its source file.
    pub index: usize,
    pub mz: Vec<f64>,
    pub intensity: Vec<f32>,
    pub precursor_mz: f64,
    pub precursor_charge: u8,
    pub retention_time: Option<f64>,
    pub scan_id: Option<String>,
    pub title: Option<String>,
    /// Ground-truth peptide sequence, present for annotated datasets.
    pub annotation: Option<String>,
    pub scaling: IntensityScaling,
}

impl SpectrumRecord {
    /// Build a record from parallel peak arrays, enforcing the invariants:
    /// peaks sorted by m/z, no negative or non-finite intensities.
    pub fn new(
        mz: Vec<f64>,
        intensity: Vec<f32>,
        precursor_mz: f64,
        precursor_charge: u8,
    ) -> Self {
        let mut peaks: Vec<(f64, f32)> = mz
            .into_iter()
            .zip(intensity)
            .filter(|(m, i)| m.is_finite() && i.is_finite() && *i >= 0.0)
            .collect();
        peaks.sort_by(|a, b| a.0.total_cmp(&b.0));
        let (mz, intensity): (Vec<f64>, Vec<f32>) = peaks.into_iter().unzip();

        Self {
            file_index: 0,
            index: 0,
            mz,
            intensity,
            precursor_mz,
            precursor_charge,
            retention_time: None,
            scan_id: None,
            title: None,
            annotation: None,
            scaling: IntensityScaling::Raw,
        }
    }

    pub fn n_peaks(&self) -> usize {
        self.mz.len()
    }

    /// Neutral precursor mass, `(m/z - proton) * z`.
    pub fn precursor_mass(&self) -> f64 {
        (self.precursor_mz - PROTON_MASS) * f64::from(self.precursor_charge)
    }

    /// Keep only the peaks for which `keep(mz, intensity)` holds.
    pub(crate) fn retain_peaks(&mut self, mut keep: impl FnMut(f64, f32) -> bool) {
        let (mz, intensity): (Vec<f64>, Vec<f32>) = self
            .mz
            .iter()
            .zip(&self.intensity)
            .filter(|(m, i)| keep(**m, **i))
            .map(|(m, i)| (*m, *i))
            .unzip();
        self.mz = mz;
        self.intensity = intensity;
    }

    /// Stable identifier used to match predictions back to annotations.
    pub fn spectrum_key(&self) -> String {
        match &self.scan_id {
            Some(scan) => format!("{}:{}", self.file_index, scan),
            None => format!("{}:index={}", self.file_index, self.index),
        }
    }

    pub fn is_sorted(&self) -> bool {
        self.mz.windows(2).all(|w| w[0] <= w[1])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_sorts_and_drops_negative_peaks() {
        let rec = SpectrumRecord::new(
            vec![300.0, 100.0, 200.0, 150.0],
            vec![1.0, 2.0, -1.0, f32::NAN],
            500.0,
            2,
        );
        assert_eq!(rec.mz, vec![100.0, 300.0]);
        assert_eq!(rec.intensity, vec![2.0, 1.0]);
        assert!(rec.is_sorted());
    }

    #[test]
    fn test_precursor_mass() {
        let rec = SpectrumRecord::new(vec![], vec![], 500.0 + PROTON_MASS, 2);
        assert!((rec.precursor_mass() - 1000.0).abs() < 1e-9);
    }

    #[test]
    fn test_spectrum_key_prefers_scan_id() {
        let mut rec = SpectrumRecord::new(vec![], vec![], 400.0, 2);
        rec.file_index = 1;
        rec.index = 7;
        assert_eq!(rec.spectrum_key(), "1:index=7");
        rec.scan_id = Some("F1:101".into());
        assert_eq!(rec.spectrum_key(), "1:F1:101");
    }
}
