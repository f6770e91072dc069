// ============================================================
// Layer 4: MGF Reader
// ============================================================
// Streams spectra out of Mascot Generic Format files.
//
// An MGF block looks like:
//
//   BEGIN IONS
//   TITLE=run1.101.101.2
//   PEPMASS=523.7752 10234.5
//   CHARGE=2+
//   SCANS=101
//   RTINSECONDS=1403.2
//   SEQ=PEPTIDEK
//   101.0712 2390.1
//   ...
//   END IONS
//
// Header keys are lower-cased into RawSpectrum::params so the
// format-family strategies can look them up uniformly. Lines
// outside a block (global parameters, comments) are skipped.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use crate::domain::error::{Result, RunnerError};
use crate::domain::format::PeakFileFormat;
use crate::domain::spectrum::RawSpectrum;
use crate::domain::traits::SpectrumSource;

pub struct MgfReader<R> {
    reader: R,
    path: PathBuf,
    line: String,
    n_read: usize,
}

impl MgfReader<BufReader<File>> {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| RunnerError::io(path, e))?;
        Ok(Self::from_reader(BufReader::new(file), path))
    }
}

impl<R: BufRead> MgfReader<R> {
    pub fn from_reader(reader: R, path: impl AsRef<Path>) -> Self {
        Self {
            reader,
            path: path.as_ref().to_path_buf(),
            line: String::new(),
            n_read: 0,
        }
    }

    fn parse_error(&self, message: impl Into<String>) -> RunnerError {
        RunnerError::Parse {
            format: "MGF",
            path: self.path.clone(),
            record: self.n_read,
            message: message.into(),
        }
    }

    /// Next trimmed line, `None` at end of input.
    fn next_line(&mut self) -> Result<Option<&str>> {
        self.line.clear();
        let n = self
            .reader
            .read_line(&mut self.line)
            .map_err(|e| RunnerError::io(&self.path, e))?;
        if n == 0 {
            return Ok(None);
        }
        Ok(Some(self.line.trim()))
    }
}

impl<R: BufRead> SpectrumSource for MgfReader<R> {
    fn format(&self) -> PeakFileFormat {
        PeakFileFormat::Mgf
    }

    fn next_spectrum(&mut self) -> Result<Option<RawSpectrum>> {
        // ── Step 1: Seek to the next block ──
        loop {
            match self.next_line()? {
                None => return Ok(None),
                Some(l) if l.eq_ignore_ascii_case("BEGIN IONS") => break,
                Some(_) => {}
            }
        }

        let mut spectrum = RawSpectrum {
            index: self.n_read,
            ms_level: 2,
            ..Default::default()
        };

        // ── Step 2: Header lines and peaks until END IONS ──
        loop {
            let line = match self.next_line()? {
                Some(l) => l.to_string(),
                None => return Err(self.parse_error("missing END IONS")),
            };
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if line.eq_ignore_ascii_case("END IONS") {
                break;
            }

            if let Some((key, value)) = line.split_once('=') {
                let key = key.trim().to_ascii_lowercase();
                let value = value.trim().to_string();
                match key.as_str() {
                    "pepmass" => {
                        let first = value.split_whitespace().next().unwrap_or("");
                        spectrum.precursor_mz = first
                            .parse()
                            .map_err(|_| self.parse_error(format!("bad PEPMASS '{value}'")))?;
                    }
                    "charge" => spectrum.precursor_charge = parse_charge(&value),
                    "rtinseconds" => spectrum.retention_time = value.parse().ok(),
                    _ => {}
                }
                spectrum.params.insert(key, value);
                continue;
            }

            let mut fields = line.split_whitespace();
            let mz = fields.next().and_then(|f| f.parse::<f64>().ok());
            let intensity = fields.next().and_then(|f| f.parse::<f32>().ok());
            match (mz, intensity) {
                (Some(mz), Some(intensity)) => {
                    spectrum.mz.push(mz);
                    spectrum.intensity.push(intensity);
                }
                _ => return Err(self.parse_error(format!("bad peak line '{line}'"))),
            }
        }

        self.n_read += 1;
        Ok(Some(spectrum))
    }
}

/// Parse `2+`, `3`, `2+ and 3+`; negative or unparsable charges are `None`.
fn parse_charge(value: &str) -> Option<u8> {
    let first = value.split_whitespace().next()?;
    if first.ends_with('-') {
        return None;
    }
    first.trim_end_matches('+').parse().ok().filter(|&z| z > 0)
}
