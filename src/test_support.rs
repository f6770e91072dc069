// Shared fixtures for unit tests: small peak files written into a
// scratch directory, and a configuration small enough to train in
// a few milliseconds.

use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

use crate::application::config::RunConfig;
use crate::data::mzml::tests::mzml_document;
use crate::data::tokenizer::{default_residues, PeptideTokenizer, H2O_MASS};
use crate::domain::spectrum::PROTON_MASS;
use crate::ml::hparams::Hyperparameters;

/// Peptides of the two spectra in `mgf_small`, in file order.
pub(crate) const MGF_SMALL_PEPTIDES: [&str; 2] = ["LESLIEK", "PEPTIDEK"];

const MANY_PEPTIDES: [&str; 5] = ["PEPTIDEK", "LESLIEK", "VAAGLEK", "MNPQSTR", "DLYGHWK"];

fn tokenizer() -> PeptideTokenizer {
    PeptideTokenizer::new(&default_residues()).unwrap()
}

/// b and y ions at charge 1, kept inside the preprocessing window and away
/// from the precursor.
fn fragment_peaks(peptide: &str, charge: u8) -> (f64, Vec<(f64, f32)>) {
    let tok = tokenizer();
    let masses: Vec<f64> = tok
        .tokenize(peptide)
        .unwrap()
        .into_iter()
        .map(|id| tok.residue_mass(id).unwrap())
        .collect();
    let total: f64 = masses.iter().sum();
    let precursor = tok.mz(peptide, charge).unwrap();
    let singly = total + H2O_MASS + PROTON_MASS;

    let mut peaks = Vec::new();
    let mut prefix = 0.0;
    for (i, m) in masses.iter().take(masses.len() - 1).enumerate() {
        prefix += m;
        peaks.push((prefix + PROTON_MASS, 100.0 + 25.0 * i as f32));
        peaks.push((total - prefix + H2O_MASS + PROTON_MASS, 400.0 - 20.0 * i as f32));
    }
    peaks.retain(|&(mz, _)| {
        (50.0..=2500.0).contains(&mz) && (mz - precursor).abs() > 2.0 && (mz - singly).abs() > 2.0
    });
    peaks.sort_by(|a, b| a.0.total_cmp(&b.0));
    (precursor, peaks)
}

fn mgf_block(out: &mut String, i: usize, peptide: &str, annotated: bool) {
    let (precursor, peaks) = fragment_peaks(peptide, 2);
    writeln!(out, "BEGIN IONS").unwrap();
    writeln!(out, "TITLE=fixture.{i}.{i}.2").unwrap();
    writeln!(out, "PEPMASS={precursor:.6}").unwrap();
    writeln!(out, "CHARGE=2+").unwrap();
    writeln!(out, "SCANS=F1:{}", i + 1).unwrap();
    writeln!(out, "RTINSECONDS={}", 10.0 * i as f64).unwrap();
    if annotated {
        writeln!(out, "SEQ={peptide}").unwrap();
    }
    for (mz, intensity) in peaks {
        writeln!(out, "{mz:.5} {intensity:.1}").unwrap();
    }
    writeln!(out, "END IONS").unwrap();
}

fn write_mgf(path: PathBuf, peptides: &[&str], annotated: bool) -> PathBuf {
    let mut text = String::new();
    for (i, peptide) in peptides.iter().enumerate() {
        mgf_block(&mut text, i, peptide, annotated);
    }
    fs::write(&path, text).unwrap();
    path
}

/// Two annotated spectra.
pub(crate) fn mgf_small(dir: &Path) -> PathBuf {
    write_mgf(dir.join("small.mgf"), &MGF_SMALL_PEPTIDES, true)
}

/// The same two spectra without SEQ lines.
pub(crate) fn mgf_small_unannotated(dir: &Path) -> PathBuf {
    write_mgf(dir.join("small_unannotated.mgf"), &MGF_SMALL_PEPTIDES, false)
}

/// `n` annotated spectra that all survive preprocessing.
pub(crate) fn mgf_many(dir: &Path, n: usize) -> PathBuf {
    let peptides: Vec<&str> = MANY_PEPTIDES.iter().copied().cycle().take(n).collect();
    write_mgf(dir.join("many.mgf"), &peptides, true)
}

/// Two MS2 spectra (native ids "scan=17" and "scan=111").
pub(crate) fn mzml_small(dir: &Path) -> PathBuf {
    let peaks = |scale: f32| -> (Vec<f64>, Vec<f32>) {
        let mz = vec![120.1, 250.2, 380.3, 620.4, 750.5];
        let intensity = mz.iter().enumerate().map(|(i, _)| scale * (i + 1) as f32).collect();
        (mz, intensity)
    };
    let (mz1, in1) = peaks(10.0);
    let (mz2, in2) = peaks(3.0);
    let doc = mzml_document(&[("scan=17", 2, mz1, in1), ("scan=111", 2, mz2, in2)]);
    let path = dir.join("small.mzml");
    fs::write(&path, doc).unwrap();
    path
}

/// A model small enough to train in tests.
pub(crate) fn tiny_hparams() -> Hyperparameters {
    let mut hp = Hyperparameters::default();
    hp.architecture.dim_model = 16;
    hp.architecture.n_head = 2;
    hp.architecture.dim_feedforward = 32;
    hp.architecture.n_layers = 1;
    hp.behavior.max_length = 12;
    hp.behavior.min_peptide_len = 2;
    hp
}

/// Run configuration matching `tiny_hparams`, saving checkpoints in `dir`.
pub(crate) fn tiny_config(dir: &Path) -> RunConfig {
    let hp = tiny_hparams();
    RunConfig {
        dim_model: hp.architecture.dim_model,
        n_head: hp.architecture.n_head,
        dim_feedforward: hp.architecture.dim_feedforward,
        n_layers: hp.architecture.n_layers,
        max_length: hp.behavior.max_length,
        min_peptide_len: hp.behavior.min_peptide_len,
        max_epochs: 20,
        train_batch_size: 32,
        predict_batch_size: 32,
        shuffle_buffer_size: 16,
        val_check_interval: 50,
        accelerator: "cpu".to_string(),
        model_save_folder_path: dir.to_path_buf(),
        ..RunConfig::default()
    }
}
