// ============================================================
// Layer 3: Peptide-Spectrum Match
// ============================================================
// One prediction row: the peptide the model proposes for a
// spectrum, with its confidence and the precursor numbers the
// results writer reports alongside it.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Psm {
    /// Predicted peptide in residue-token notation, e.g. `PEPTM+15.995K`.
    pub sequence: String,
    /// Index of the source file in the run's ms_run list.
    pub file_index: usize,
    /// Scan identifier within that file.
    pub scan_id: String,
    /// Key matching `SpectrumRecord::spectrum_key`.
    pub spectrum_key: String,
    pub score: f32,
    /// Per-residue confidence, same order as the residues in `sequence`.
    pub aa_scores: Vec<f32>,
    pub charge: u8,
    pub exp_mz: f64,
    pub calc_mz: f64,
    pub retention_time: Option<f64>,
}

impl Psm {
    /// mzTab `spectra_ref` value, 1-based ms_run index.
    pub fn spectra_ref(&self) -> String {
        format!("ms_run[{}]:{}", self.file_index + 1, self.scan_id)
    }
}
