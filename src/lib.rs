//! Spectrum data preparation and model-runner lifecycle for de novo
//! peptide sequencing from tandem mass spectra.

pub mod application;
pub mod cli;
pub mod data;
pub mod domain;
pub mod infra;
pub mod ml;

#[cfg(test)]
mod test_support;
