// ============================================================
// Layer 6: mzTab Results Writer
// ============================================================
// Predictions are reported as an mzTab 1.0 identification file:
//
//   MTD   metadata: software, run settings, ms_run locations
//   COM   "partial results" marker while the run is unfinished
//   PSH   PSM section header
//   PSM   one row per peptide-spectrum match
//
// The file exists on disk from the moment the writer is created
// (metadata only), PSM rows are appended as batches are decoded,
// and `save` rewrites the final version through an atomic rename.
// A run that fails half way therefore still leaves a readable,
// clearly marked partial artifact behind.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::domain::error::{Result, RunnerError};
use crate::domain::psm::Psm;
use crate::infra::atomic;

pub const MZTAB_VERSION: &str = "1.0.0";

/// Comment line present until the run is marked complete.
pub const PARTIAL_MARKER: &str = "COM\tpartial results; run did not complete";

const PSH_COLUMNS: [&str; 19] = [
    "sequence",
    "PSM_ID",
    "accession",
    "unique",
    "database",
    "database_version",
    "search_engine",
    "search_engine_score[1]",
    "modifications",
    "retention_time",
    "charge",
    "exp_mass_to_charge",
    "calc_mass_to_charge",
    "spectra_ref",
    "pre",
    "post",
    "start",
    "end",
    "opt_ms_run[1]_aa_scores",
];

#[derive(Debug)]
pub struct MztabWriter {
    path: PathBuf,
    settings: Vec<(String, String)>,
    model: Option<String>,
    config_filename: Option<String>,
    ms_runs: Vec<PathBuf>,
    psms: Vec<Psm>,
    complete: bool,
}

impl MztabWriter {
    /// Create the writer and put a metadata-only file on disk.
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let writer = Self {
            path: path.as_ref().to_path_buf(),
            settings: Vec::new(),
            model: None,
            config_filename: None,
            ms_runs: Vec::new(),
            psms: Vec::new(),
            complete: false,
        };
        writer.rewrite()?;
        tracing::debug!("Created results file '{}'", writer.path.display());
        Ok(writer)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Record the run settings and model identity in the metadata section.
    pub fn set_metadata(
        &mut self,
        settings: Vec<(String, String)>,
        model: Option<&Path>,
        config_filename: Option<&Path>,
    ) -> Result<()> {
        self.settings = settings;
        self.model = model.map(|p| p.display().to_string());
        self.config_filename = config_filename.map(|p| p.display().to_string());
        self.rewrite()
    }

    /// Record the peak files predictions will refer to (`ms_run[n]`).
    pub fn set_ms_run(&mut self, files: &[PathBuf]) -> Result<()> {
        self.ms_runs = files.to_vec();
        self.rewrite()
    }

    /// Keep `psms` and append their rows to the file on disk.
    pub fn append(&mut self, psms: &[Psm]) -> Result<()> {
        if psms.is_empty() {
            return Ok(());
        }
        let mut text = String::new();
        if self.psms.is_empty() {
            text.push_str(&psh_line());
        }
        for (i, psm) in psms.iter().enumerate() {
            text.push_str(&psm_line(psm, self.psms.len() + i));
        }

        let mut f = OpenOptions::new()
            .append(true)
            .open(&self.path)
            .map_err(|e| RunnerError::io(&self.path, e))?;
        f.write_all(text.as_bytes())
            .map_err(|e| RunnerError::io(&self.path, e))?;

        self.psms.extend_from_slice(psms);
        Ok(())
    }

    pub fn psms(&self) -> &[Psm] {
        &self.psms
    }

    /// The run finished; the next `save` drops the partial marker.
    pub fn mark_complete(&mut self) {
        self.complete = true;
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// Write the final version of the file atomically.
    pub fn save(&self) -> Result<()> {
        self.rewrite()?;
        tracing::info!(
            "Wrote {} PSMs to '{}'{}",
            self.psms.len(),
            self.path.display(),
            if self.complete { "" } else { " (partial)" }
        );
        Ok(())
    }

    fn rewrite(&self) -> Result<()> {
        let mut text = self.metadata_lines();
        if !self.complete {
            text.push_str(PARTIAL_MARKER);
            text.push('\n');
        }
        if !self.psms.is_empty() {
            text.push_str(&psh_line());
            for (i, psm) in self.psms.iter().enumerate() {
                text.push_str(&psm_line(psm, i));
            }
        }
        atomic::write_atomic(&self.path, text.as_bytes())
    }

    fn metadata_lines(&self) -> String {
        let mut lines: Vec<(String, String)> = vec![
            ("mzTab-version".into(), MZTAB_VERSION.into()),
            ("mzTab-mode".into(), "Summary".into()),
            ("mzTab-type".into(), "Identification".into()),
            (
                "description".into(),
                format!("de novo identification by {}", env!("CARGO_PKG_NAME")),
            ),
            (
                "software[1]".into(),
                format!(
                    "[MS, MS:1003281, {}, {}]",
                    env!("CARGO_PKG_NAME"),
                    env!("CARGO_PKG_VERSION")
                ),
            ),
            (
                "psm_search_engine_score[1]".into(),
                "[MS, MS:1001143, search engine specific score for PSMs, ]".into(),
            ),
        ];

        let mut settings = Vec::new();
        if let Some(model) = &self.model {
            settings.push(format!("model = {model}"));
        }
        if let Some(config) = &self.config_filename {
            settings.push(format!("config_filename = {config}"));
        }
        settings.extend(self.settings.iter().map(|(k, v)| format!("{k} = {v}")));
        for (i, s) in settings.into_iter().enumerate() {
            lines.push((format!("software[1]-setting[{}]", i + 1), s));
        }

        for (i, file) in self.ms_runs.iter().enumerate() {
            lines.push((
                format!("ms_run[{}]-location", i + 1),
                format!("file://{}", file.display()),
            ));
        }

        lines
            .into_iter()
            .map(|(k, v)| format!("MTD\t{k}\t{v}\n"))
            .collect()
    }
}

fn psh_line() -> String {
    format!("PSH\t{}\n", PSH_COLUMNS.join("\t"))
}

fn psm_line(psm: &Psm, id: usize) -> String {
    let aa_scores = psm
        .aa_scores
        .iter()
        .map(|s| format!("{s:.5}"))
        .collect::<Vec<_>>()
        .join(",");
    let rt = psm
        .retention_time
        .map(|t| format!("{t:.4}"))
        .unwrap_or_else(|| "null".into());

    let fields = [
        psm.sequence.clone(),
        id.to_string(),
        "null".into(),
        "null".into(),
        "null".into(),
        "null".into(),
        format!("[MS, MS:1003281, {}, ]", env!("CARGO_PKG_NAME")),
        format!("{:.5}", psm.score),
        "null".into(),
        rt,
        format!("{}", psm.charge),
        format!("{:.5}", psm.exp_mz),
        format!("{:.5}", psm.calc_mz),
        psm.spectra_ref(),
        "null".into(),
        "null".into(),
        "null".into(),
        "null".into(),
        aa_scores,
    ];
    format!("PSM\t{}\n", fields.join("\t"))
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn psm(seq: &str, scan: &str) -> Psm {
        Psm {
            sequence: seq.into(),
            file_index: 0,
            scan_id: scan.into(),
            spectrum_key: format!("0:{scan}"),
            score: 0.25,
            aa_scores: vec![0.25; seq.len()],
            charge: 2,
            exp_mz: 500.0,
            calc_mz: 500.01,
            retention_time: Some(12.5),
        }
    }

    #[test]
    fn test_create_writes_metadata_only_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.mztab");
        let _w = MztabWriter::create(&path).unwrap();
        let text = fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("MTD\tmzTab-version\t1.0.0"));
        assert!(text.contains(PARTIAL_MARKER));
        assert!(!text.contains("PSH"));
    }

    #[test]
    fn test_append_is_incremental_and_save_drops_marker() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.mztab");
        let mut w = MztabWriter::create(&path).unwrap();
        w.set_metadata(vec![("n_beams".into(), "1".into())], None, None)
            .unwrap();
        w.set_ms_run(&[PathBuf::from("/data/a.mgf")]).unwrap();

        w.append(&[psm("PEPTIDE", "1")]).unwrap();
        let partial = fs::read_to_string(&path).unwrap();
        assert_eq!(partial.matches("\nPSM\t").count(), 1);
        assert!(partial.contains("ms_run[1]-location\tfile:///data/a.mgf"));
        assert!(partial.contains("software[1]-setting[1]\tn_beams = 1"));

        w.append(&[psm("ACDK", "2"), psm("LLK", "3")]).unwrap();
        assert_eq!(w.psms().len(), 3);
        assert_eq!(fs::read_to_string(&path).unwrap().matches("PSH\t").count(), 1);

        w.mark_complete();
        w.save().unwrap();
        let text = fs::read_to_string(&path).unwrap();
        assert!(!text.contains(PARTIAL_MARKER));
        assert_eq!(text.matches("\nPSM\t").count(), 3);
        assert!(text.contains("ms_run[1]:3"));
    }

    #[test]
    fn test_unfinished_save_keeps_marker() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.mztab");
        let w = MztabWriter::create(&path).unwrap();
        w.save().unwrap();
        assert!(fs::read_to_string(&path).unwrap().contains(PARTIAL_MARKER));
    }
}
