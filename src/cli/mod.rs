// ============================================================
// Layer 1: CLI
// ============================================================
// Parses the command line with clap and hands each subcommand
// to the model runner. Errors leave this layer as anyhow::Error
// with a line of context per step.

pub mod commands;

use std::path::Path;

use anyhow::{Context, Result};
use clap::Parser;
use commands::{Commands, SequenceArgs, TrainArgs};

use crate::application::config::RunConfig;
use crate::application::runner::ModelRunner;

#[derive(Parser, Debug)]
#[command(
    name = "denovo-runner",
    version,
    about = "De novo peptide sequencing of MS/MS spectra: train models and predict peptides."
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    pub fn run(self) -> Result<()> {
        match self.command {
            Commands::Sequence(args) => run_sequence(args),
            Commands::Train(args) => run_train(args),
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<RunConfig> {
    match path {
        Some(path) => RunConfig::from_file(path)
            .with_context(|| format!("Failed to load config '{}'", path.display())),
        None => {
            tracing::info!("No config file given; using defaults");
            Ok(RunConfig::default())
        }
    }
}

fn run_sequence(args: SequenceArgs) -> Result<()> {
    let config = load_config(args.config.as_deref())?;
    let mut runner = ModelRunner::new(config, Some(args.model.clone()), None);
    if let Some(path) = &args.config {
        runner = runner.with_config_path(path);
    }

    tracing::info!(
        "Sequencing {} path(s) with model '{}'",
        args.peak_path.len(),
        args.model.display()
    );
    runner
        .scoped(|r| r.predict(&args.peak_path, &args.output, args.evaluate))
        .context("Sequencing failed")?;

    if let Some(m) = runner.last_metrics() {
        println!(
            "Peptide precision: {:.2}%  Amino acid precision: {:.2}%",
            100.0 * m.peptide_precision,
            100.0 * m.aa_precision
        );
    }
    println!("Results written to {}", args.output.with_extension("mztab").display());
    Ok(())
}

fn run_train(args: TrainArgs) -> Result<()> {
    let config = load_config(args.config.as_deref())?;
    let save_folder = config.model_save_folder_path.clone();
    let mut runner = ModelRunner::new(config, args.model, args.output_root);
    if let Some(path) = &args.config {
        runner = runner.with_config_path(path);
    }

    tracing::info!(
        "Training on {} path(s), validating on {}",
        args.peak_path.len(),
        args.validation_peak_path.len()
    );
    runner
        .scoped(|r| r.train(&args.peak_path, &args.validation_peak_path))
        .context("Training failed")?;

    println!("Training complete. Checkpoints saved in '{}'.", save_folder.display());
    Ok(())
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_sequence_args_parse() {
        let cli = Cli::try_parse_from([
            "denovo-runner", "sequence", "a.mgf", "b.mzml", "--model", "m.ckpt", "--evaluate",
        ])
        .unwrap();
        let Commands::Sequence(args) = cli.command else {
            panic!("expected the sequence command");
        };
        assert_eq!(args.peak_path, vec!["a.mgf", "b.mzml"]);
        assert!(args.evaluate);
        assert_eq!(args.output, Path::new("results.mztab"));
    }

    #[test]
    fn test_train_requires_validation_files() {
        assert!(Cli::try_parse_from(["denovo-runner", "train", "a.mgf"]).is_err());
        let cli = Cli::try_parse_from([
            "denovo-runner", "train", "a.mgf", "-p", "v.mgf", "--output-root", "foobar",
        ])
        .unwrap();
        let Commands::Train(args) = cli.command else {
            panic!("expected the train command");
        };
        assert_eq!(args.validation_peak_path, vec!["v.mgf"]);
        assert_eq!(args.output_root.as_deref(), Some("foobar"));
    }

    #[test]
    fn test_missing_config_file_has_context() {
        let err = load_config(Some(Path::new("/nonexistent/config.json"))).unwrap_err();
        assert!(err.to_string().contains("Failed to load config"));
    }
}
