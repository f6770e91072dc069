// ============================================================
// Layer 5: Inferencer
// ============================================================
// Runs the model over prediction batches and scores predicted
// peptides against annotations.
//
// Peptide matching is mass-aware rather than string based, so
// isobaric residues (I/L) and residue swaps whose masses add up
// are handled the way a mass spectrometer would see them:
//
//   walk both peptides left to right with cumulative masses
//     - cumulative masses agree within 0.5 Da:
//         the residue pair matches if their own masses agree
//         within 0.1 Da; advance both
//     - otherwise advance the side with the lighter prefix
//
//   a peptide matches only if every position matched

use std::collections::BTreeMap;

use crate::data::batcher::BatchSource;
use crate::data::tokenizer::PeptideTokenizer;
use crate::domain::error::Result;
use crate::domain::psm::Psm;
use crate::infra::mztab::MztabWriter;
use crate::ml::model::Spec2Pep;

pub const CUM_MASS_THRESHOLD: f64 = 0.5;
pub const IND_MASS_THRESHOLD: f64 = 0.1;

/// Amino-acid and peptide level agreement between predictions and truth.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PrecisionMetrics {
    /// Matched residues over predicted residues.
    pub aa_precision: f64,
    /// Matched residues over true residues.
    pub aa_recall: f64,
    /// Fraction of spectra whose whole peptide matched.
    pub peptide_precision: f64,
}

/// Per-pair matches plus the residue totals of both sides.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MatchCounts {
    pub matches: Vec<(Vec<bool>, bool)>,
    pub n_aa_true: usize,
    pub n_aa_pred: usize,
}

/// Match two residue lists from the N-terminus.
pub fn aa_match_prefix(
    peptide1: &[String],
    peptide2: &[String],
    masses: &BTreeMap<String, f64>,
    cum_mass_threshold: f64,
    ind_mass_threshold: f64,
) -> (Vec<bool>, bool) {
    let mut aa_matches = vec![false; peptide1.len().max(peptide2.len())];
    let (mut cum1, mut cum2) = (0.0f64, 0.0f64);
    let (mut i1, mut i2) = (0usize, 0usize);
    let mass = |aa: &String| masses.get(aa).copied().unwrap_or(0.0);

    while i1 < peptide1.len() && i2 < peptide2.len() {
        let m1 = mass(&peptide1[i1]);
        let m2 = mass(&peptide2[i2]);
        if ((cum1 + m1) - (cum2 + m2)).abs() < cum_mass_threshold {
            aa_matches[i1.max(i2)] = (m1 - m2).abs() < ind_mass_threshold;
            i1 += 1;
            i2 += 1;
            cum1 += m1;
            cum2 += m2;
        } else if cum2 + m2 > cum1 + m1 {
            i1 += 1;
            cum1 += m1;
        } else {
            i2 += 1;
            cum2 += m2;
        }
    }
    let all = aa_matches.iter().all(|&m| m);
    (aa_matches, all)
}

fn residues(tokenizer: &PeptideTokenizer, peptide: &str) -> Vec<String> {
    // Unknown residues count as zero mass, they never match.
    tokenizer
        .split(peptide)
        .unwrap_or_else(|_| peptide.chars().map(String::from).collect())
}

/// Match (truth, prediction) pairs. A missing prediction matches nothing.
pub fn aa_match_batch<'a>(
    pairs: impl IntoIterator<Item = (&'a str, Option<&'a str>)>,
    tokenizer: &PeptideTokenizer,
) -> MatchCounts {
    let masses = tokenizer.mass_table();
    let mut counts = MatchCounts::default();
    for (truth, pred) in pairs {
        let truth = residues(tokenizer, truth);
        let pred = pred.map(|p| residues(tokenizer, p)).unwrap_or_default();
        counts.n_aa_true += truth.len();
        counts.n_aa_pred += pred.len();
        counts.matches.push(aa_match_prefix(
            &truth,
            &pred,
            &masses,
            CUM_MASS_THRESHOLD,
            IND_MASS_THRESHOLD,
        ));
    }
    counts
}

pub fn aa_match_metrics(counts: &MatchCounts) -> PrecisionMetrics {
    let n_aa_match: usize = counts
        .matches
        .iter()
        .map(|(m, _)| m.iter().filter(|&&x| x).count())
        .sum();
    let n_pep_match = counts.matches.iter().filter(|(_, all)| *all).count();
    PrecisionMetrics {
        aa_precision: n_aa_match as f64 / (counts.n_aa_pred as f64 + 1e-8),
        aa_recall: n_aa_match as f64 / (counts.n_aa_true as f64 + 1e-8),
        peptide_precision: n_pep_match as f64 / (counts.matches.len() as f64 + 1e-8),
    }
}

/// Score PSMs against the annotations of their spectra. `truth` maps
/// spectrum key to peptide; PSMs of unannotated spectra are skipped.
pub fn evaluate_predictions(
    psms: &[Psm],
    truth: &BTreeMap<String, String>,
    tokenizer: &PeptideTokenizer,
) -> PrecisionMetrics {
    let pairs = psms.iter().filter_map(|p| {
        truth
            .get(&p.spectrum_key)
            .map(|t| (t.as_str(), Some(p.sequence.as_str())))
    });
    aa_match_metrics(&aa_match_batch(pairs, tokenizer))
}

/// Predict every batch and append the PSMs to the results file as they
/// are produced. Returns the number of PSMs written.
pub fn run_inference(model: &Spec2Pep, source: &BatchSource<'_>, writer: &mut MztabWriter) -> Result<usize> {
    let mut n_psms = 0usize;
    for (i, batch) in source.iter(0)?.enumerate() {
        let batch = batch?;
        let psms = model.predict_step(&batch)?;
        writer.append(&psms)?;
        n_psms += psms.len();
        tracing::debug!("Predicted batch {} ({} spectra, {} PSMs)", i, batch.len(), psms.len());
    }
    Ok(n_psms)
}
