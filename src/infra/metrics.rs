// ============================================================
// Layer 6: Metrics Logger
// ============================================================
// Records validation history to a CSV file, one row per
// validation pass.
//
// Metrics recorded per row:
//   - epoch, step:        when the validation ran
//   - train_loss:         mean training loss since the last row
//   - valid_loss:         mean label-smoothed loss on validation
//   - aa_precision:       amino-acid precision (optional)
//   - peptide_precision:  peptide precision (optional)
//
// The precision columns are only filled when the run enables
// `calculate_precision`; otherwise they are left empty.
//
// Output file: <tb_summarywriter>/metrics.csv
//
// Example CSV output:
//   epoch,step,train_loss,valid_loss,aa_precision,peptide_precision
//   0,50000,1.204312,1.189004,,
//   1,100000,0.982110,0.990473,0.412000,0.118000

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::domain::error::{Result, RunnerError};

const HEADER: &str = "epoch,step,train_loss,valid_loss,aa_precision,peptide_precision";

/// One row of validation history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationMetrics {
    pub epoch: usize,
    pub step: usize,
    /// `None` for sanity-check passes that run before any training step.
    pub train_loss: Option<f64>,
    pub valid_loss: f64,
    pub aa_precision: Option<f64>,
    pub peptide_precision: Option<f64>,
}

impl ValidationMetrics {
    /// Returns true if this row improved over the previous best valid_loss
    pub fn is_improvement(&self, best_valid_loss: f64) -> bool {
        self.valid_loss < best_valid_loss
    }
}

/// Appends validation rows to a CSV file.
pub struct MetricsLogger {
    csv_path: PathBuf,
}

impl MetricsLogger {
    /// Create the logger, writing the header if the file is new.
    pub fn new(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir).map_err(|e| RunnerError::io(dir, e))?;

        let csv_path = dir.join("metrics.csv");

        // Appending across runs keeps the earlier history.
        if !csv_path.exists() {
            let mut f = fs::File::create(&csv_path).map_err(|e| RunnerError::io(&csv_path, e))?;
            writeln!(f, "{HEADER}").map_err(|e| RunnerError::io(&csv_path, e))?;
            tracing::debug!("Created metrics CSV: '{}'", csv_path.display());
        }

        Ok(Self { csv_path })
    }

    pub fn log(&self, m: &ValidationMetrics) -> Result<()> {
        let mut f = OpenOptions::new()
            .append(true)
            .open(&self.csv_path)
            .map_err(|e| RunnerError::io(&self.csv_path, e))?;

        let opt = |v: Option<f64>| v.map(|x| format!("{x:.6}")).unwrap_or_default();
        writeln!(
            f,
            "{},{},{},{:.6},{},{}",
            m.epoch,
            m.step,
            opt(m.train_loss),
            m.valid_loss,
            opt(m.aa_precision),
            opt(m.peptide_precision),
        )
        .map_err(|e| RunnerError::io(&self.csv_path, e))?;

        tracing::debug!(
            "Logged validation at step {}: valid_loss={:.4}",
            m.step,
            m.valid_loss,
        );
        Ok(())
    }

    pub fn csv_path(&self) -> &Path {
        &self.csv_path
    }
}
