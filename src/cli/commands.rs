// ============================================================
// Layer 1: CLI Commands and Arguments
// ============================================================
// Defines the two subcommands, `sequence` and `train`, and
// their flags. Peak paths may be files, directories of stores or
// glob patterns; they are expanded by the data layer, not here.

use std::path::PathBuf;

use clap::{Args, Subcommand};

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Predict peptide sequences for MS/MS spectra with a trained model
    Sequence(SequenceArgs),

    /// Train a model on annotated MS/MS spectra
    Train(TrainArgs),
}

/// Arguments for the `sequence` command.
#[derive(Args, Debug)]
pub struct SequenceArgs {
    /// Peak files to sequence (MGF, mzML, mzXML or a spectrum store)
    #[arg(required = true)]
    pub peak_path: Vec<String>,

    /// Model weights to predict with
    #[arg(long, short)]
    pub model: PathBuf,

    /// JSON config file; defaults are used when omitted
    #[arg(long, short)]
    pub config: Option<PathBuf>,

    /// Results file; the extension is replaced by .mztab
    #[arg(long, short, default_value = "results.mztab")]
    pub output: PathBuf,

    /// Score predictions against the SEQ annotations of the input
    #[arg(long)]
    pub evaluate: bool,
}

/// Arguments for the `train` command.
#[derive(Args, Debug)]
pub struct TrainArgs {
    /// Annotated training peak files
    #[arg(required = true)]
    pub peak_path: Vec<String>,

    /// Annotated validation peak files
    #[arg(long, short = 'p', required = true, num_args = 1..)]
    pub validation_peak_path: Vec<String>,

    /// Checkpoint to resume training from
    #[arg(long, short)]
    pub model: Option<PathBuf>,

    /// JSON config file; defaults are used when omitted
    #[arg(long, short)]
    pub config: Option<PathBuf>,

    /// Prefix of the best checkpoint ({root}.best.ckpt)
    #[arg(long, short)]
    pub output_root: Option<String>,
}
