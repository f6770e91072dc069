// ============================================================
// Layer 4: Peptide Tokenizer
// ============================================================
// Converts peptide strings to residue token ids and back, and
// computes peptide masses from the residue table.
//
// Vocabulary layout:
//   id 0        stop token "$" (end of peptide)
//   id 1..=n    residues, sorted by their string form
//
// Tokenization is longest-match: at every position the longest
// residue string that matches wins, so "M+15.995" is read as
// one oxidized methionine rather than "M" followed by garbage,
// and N-terminal modifications like "+42.011" become tokens of
// their own.
//
// Masses (monoisotopic, Dalton):
//   peptide mass = sum(residue masses) + H2O
//   m/z          = (mass + z * proton) / z

use std::collections::BTreeMap;

use crate::domain::error::{Result, RunnerError};
use crate::domain::spectrum::PROTON_MASS;

/// Monoisotopic mass of water.
pub const H2O_MASS: f64 = 18.010_565;

pub const STOP_TOKEN: &str = "$";
pub const STOP_ID: usize = 0;

/// The standard residue table: canonical amino acids, common
/// modified residues and N-terminal modifications.
pub fn default_residues() -> BTreeMap<String, f64> {
    [
        ("G", 57.021_464),
        ("A", 71.037_114),
        ("S", 87.032_028),
        ("P", 97.052_764),
        ("V", 99.068_414),
        ("T", 101.047_670),
        ("C+57.021", 160.030_649),
        ("L", 113.084_064),
        ("I", 113.084_064),
        ("N", 114.042_927),
        ("D", 115.026_943),
        ("Q", 128.058_578),
        ("K", 128.094_963),
        ("E", 129.042_593),
        ("M", 131.040_485),
        ("H", 137.058_912),
        ("F", 147.068_414),
        ("R", 156.101_111),
        ("Y", 163.063_329),
        ("W", 186.079_313),
        // Amino acid modifications.
        ("M+15.995", 147.035_400),
        ("N+0.984", 115.026_943),
        ("Q+0.984", 129.042_594),
        // N-terminal modifications.
        ("+42.011", 42.010_565),
        ("+43.006", 43.005_814),
        ("-17.027", -17.026_549),
        ("+43.006-17.027", 25.980_265),
    ]
    .into_iter()
    .map(|(r, m)| (r.to_string(), m))
    .collect()
}

#[derive(Debug, Clone, PartialEq)]
pub struct PeptideTokenizer {
    /// Residue strings indexed by `id - 1`.
    residues: Vec<String>,
    masses: Vec<f64>,
    /// Longest residue string, bounds the prefix search.
    max_len: usize,
}

impl PeptideTokenizer {
    pub fn new(table: &BTreeMap<String, f64>) -> Result<Self> {
        if table.is_empty() {
            return Err(RunnerError::Config("the residue table is empty".into()));
        }
        if let Some(bad) = table.keys().find(|r| r.is_empty() || r.as_str() == STOP_TOKEN) {
            return Err(RunnerError::Config(format!("invalid residue name '{bad}'")));
        }
        // BTreeMap iteration gives the sorted order the vocabulary relies on.
        let residues: Vec<String> = table.keys().cloned().collect();
        let masses: Vec<f64> = table.values().copied().collect();
        let max_len = residues.iter().map(|r| r.len()).max().unwrap_or(1);
        Ok(Self {
            residues,
            masses,
            max_len,
        })
    }

    /// Number of token ids, stop token included.
    pub fn vocab_size(&self) -> usize {
        self.residues.len() + 1
    }

    pub fn residue(&self, id: usize) -> Option<&str> {
        if id == STOP_ID {
            return Some(STOP_TOKEN);
        }
        self.residues.get(id - 1).map(String::as_str)
    }

    pub fn residue_mass(&self, id: usize) -> Option<f64> {
        if id == STOP_ID {
            return None;
        }
        self.masses.get(id - 1).copied()
    }

    fn id_of(&self, residue: &str) -> Option<usize> {
        self.residues
            .binary_search_by(|r| r.as_str().cmp(residue))
            .ok()
            .map(|i| i + 1)
    }

    /// Split a peptide into residue token ids (no stop token).
    pub fn tokenize(&self, peptide: &str) -> Result<Vec<usize>> {
        let mut ids = Vec::with_capacity(peptide.len());
        let mut rest = peptide;
        while !rest.is_empty() {
            let upper = self.max_len.min(rest.len());
            let matched = (1..=upper)
                .rev()
                .filter(|&n| rest.is_char_boundary(n))
                .find_map(|n| self.id_of(&rest[..n]).map(|id| (id, n)));
            match matched {
                Some((id, n)) => {
                    ids.push(id);
                    rest = &rest[n..];
                }
                None => {
                    return Err(RunnerError::Config(format!(
                        "unknown residue at '{rest}' in peptide '{peptide}'"
                    )))
                }
            }
        }
        Ok(ids)
    }

    /// Join token ids back into a peptide string, stopping at the stop token.
    pub fn detokenize(&self, ids: &[usize]) -> String {
        ids.iter()
            .take_while(|&&id| id != STOP_ID)
            .filter_map(|&id| self.residue(id))
            .collect()
    }

    /// Residue strings of a peptide, in order.
    pub fn split(&self, peptide: &str) -> Result<Vec<String>> {
        Ok(self
            .tokenize(peptide)?
            .into_iter()
            .filter_map(|id| self.residue(id).map(str::to_string))
            .collect())
    }

    /// Neutral monoisotopic mass of a token sequence.
    pub fn mass_of_ids(&self, ids: &[usize]) -> f64 {
        ids.iter()
            .filter_map(|&id| self.residue_mass(id))
            .sum::<f64>()
            + H2O_MASS
    }

    pub fn mass(&self, peptide: &str) -> Result<f64> {
        Ok(self.mass_of_ids(&self.tokenize(peptide)?))
    }

    pub fn mz(&self, peptide: &str, charge: u8) -> Result<f64> {
        let z = f64::from(charge.max(1));
        Ok((self.mass(peptide)? + z * PROTON_MASS) / z)
    }

    /// Residue masses keyed by residue string.
    pub fn mass_table(&self) -> BTreeMap<String, f64> {
        self.residues
            .iter()
            .cloned()
            .zip(self.masses.iter().copied())
            .collect()
    }
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;

    fn tok() -> PeptideTokenizer {
        PeptideTokenizer::new(&default_residues()).unwrap()
    }

    #[test]
    fn test_longest_match_reads_modified_residues() {
        let t = tok();
        let parts = t.split("PEPTM+15.995K").unwrap();
        assert_eq!(parts, vec!["P", "E", "P", "T", "M+15.995", "K"]);

        let parts = t.split("+43.006-17.027PEP").unwrap();
        assert_eq!(parts[0], "+43.006-17.027");
    }

    #[test]
    fn test_detokenize_stops_at_stop_token() {
        let t = tok();
        let mut ids = t.tokenize("PEPTIDE").unwrap();
        ids.push(STOP_ID);
        ids.push(1);
        assert_eq!(t.detokenize(&ids), "PEPTIDE");
    }

    #[test]
    fn test_unknown_residue_is_an_error() {
        assert!(tok().tokenize("PEPXIDE").is_err());
    }

    #[test]
    fn test_peptide_mass() {
        // PEPTIDE monoisotopic mass 799.35996 Da.
        let m = tok().mass("PEPTIDE").unwrap();
        assert!((m - 799.359_96).abs() < 1e-3, "{m}");
        let mz = tok().mz("PEPTIDE", 2).unwrap();
        assert!((mz - (799.359_96 + 2.0 * PROTON_MASS) / 2.0).abs() < 1e-3);
    }

    #[test]
    fn test_vocab_is_sorted_with_stop_at_zero() {
        let t = tok();
        assert_eq!(t.vocab_size(), default_residues().len() + 1);
        assert_eq!(t.residue(0), Some(STOP_TOKEN));
        let names: Vec<&str> = (1..t.vocab_size()).filter_map(|i| t.residue(i)).collect();
        let mut sorted = names.clone();
        sorted.sort();
        assert_eq!(names, sorted);
    }
}
