// ============================================================
// Layer 4: mzXML Reader
// ============================================================
// Streams MS/MS scans out of mzXML files.
//
//   <scan num="12" msLevel="2" retentionTime="PT84.2S">
//     <precursorMz precursorCharge="2">523.77</precursorMz>
//     <peaks precision="32" byteOrder="network"
//            compressionType="zlib">...base64...</peaks>
//   </scan>
//
// Peaks are interleaved (m/z, intensity) pairs in network byte
// order. Older writers nest MS2 scans inside their MS1 parent,
// so open scans are kept on a stack.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use quick_xml::events::Event;
use quick_xml::Reader;

use crate::data::mzml::{attr, decode_binary, ByteOrder};
use crate::domain::error::{Result, RunnerError};
use crate::domain::format::PeakFileFormat;
use crate::domain::spectrum::RawSpectrum;
use crate::domain::traits::SpectrumSource;

#[derive(Debug, Default)]
struct ScanState {
    spectrum: RawSpectrum,
    double: bool,
    zlib: bool,
    little_endian: bool,
    peaks_text: String,
    precursor_text: String,
    in_peaks: bool,
    in_precursor: bool,
}

pub struct MzXmlReader<R> {
    reader: Reader<R>,
    buf: Vec<u8>,
    path: PathBuf,
    n_read: usize,
    stack: Vec<ScanState>,
}

impl MzXmlReader<BufReader<File>> {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| RunnerError::io(path, e))?;
        Ok(Self::from_reader(BufReader::new(file), path))
    }
}

impl<R: BufRead> MzXmlReader<R> {
    pub fn from_reader(inner: R, path: impl AsRef<Path>) -> Self {
        let mut reader = Reader::from_reader(inner);
        reader.trim_text(true);
        Self {
            reader,
            buf: Vec::new(),
            path: path.as_ref().to_path_buf(),
            n_read: 0,
            stack: Vec::new(),
        }
    }
}

/// `PT84.2S` style durations, in seconds.
fn parse_retention_time(value: &str) -> Option<f64> {
    let v = value.trim();
    let v = v.strip_prefix("PT").unwrap_or(v);
    if let Some(min) = v.strip_suffix('M') {
        return min.parse::<f64>().ok().map(|m| m * 60.0);
    }
    v.strip_suffix('S').unwrap_or(v).parse().ok()
}

impl<R: BufRead> SpectrumSource for MzXmlReader<R> {
    fn format(&self) -> PeakFileFormat {
        PeakFileFormat::MzXml
    }

    fn next_spectrum(&mut self) -> Result<Option<RawSpectrum>> {
        let Self {
            reader,
            buf,
            path,
            n_read,
            stack,
        } = self;
        let parse_error = |message: String| RunnerError::Parse {
            format: "mzXML",
            path: path.clone(),
            record: *n_read,
            message,
        };

        loop {
            buf.clear();
            let event = reader
                .read_event_into(buf)
                .map_err(|e| parse_error(e.to_string()))?;

            match event {
                Event::Start(ref e) | Event::Empty(ref e) => {
                    let is_start = matches!(event, Event::Start(_));
                    match e.local_name().as_ref() {
                        b"scan" => {
                            let spectrum = RawSpectrum {
                                ms_level: attr(e, b"msLevel")
                                    .and_then(|v| v.parse().ok())
                                    .unwrap_or(1),
                                native_id: attr(e, b"num"),
                                retention_time: attr(e, b"retentionTime")
                                    .as_deref()
                                    .and_then(parse_retention_time),
                                ..Default::default()
                            };
                            if is_start {
                                stack.push(ScanState {
                                    spectrum,
                                    ..Default::default()
                                });
                            }
                        }
                        b"precursorMz" => {
                            if let Some(state) = stack.last_mut() {
                                state.spectrum.precursor_charge = attr(e, b"precursorCharge")
                                    .and_then(|v| v.parse().ok())
                                    .filter(|&z| z > 0);
                                state.in_precursor = is_start;
                            }
                        }
                        b"peaks" => {
                            if let Some(state) = stack.last_mut() {
                                state.double = attr(e, b"precision").as_deref() == Some("64");
                                state.zlib = attr(e, b"compressionType").as_deref() == Some("zlib");
                                state.little_endian =
                                    attr(e, b"byteOrder").as_deref() == Some("little");
                                state.in_peaks = is_start;
                            }
                        }
                        _ => {}
                    }
                }
                Event::Text(ref t) => {
                    if let Some(state) = stack.last_mut() {
                        if state.in_peaks || state.in_precursor {
                            let text = t.unescape().map_err(|e| parse_error(e.to_string()))?;
                            if state.in_peaks {
                                state.peaks_text.push_str(&text);
                            } else {
                                state.precursor_text.push_str(&text);
                            }
                        }
                    }
                }
                Event::End(ref e) => match e.local_name().as_ref() {
                    b"precursorMz" => {
                        if let Some(state) = stack.last_mut() {
                            state.in_precursor = false;
                            state.spectrum.precursor_mz =
                                state.precursor_text.trim().parse().map_err(|_| {
                                    parse_error(format!(
                                        "bad precursorMz '{}'",
                                        state.precursor_text
                                    ))
                                })?;
                        }
                    }
                    b"peaks" => {
                        if let Some(state) = stack.last_mut() {
                            state.in_peaks = false;
                        }
                    }
                    b"scan" => {
                        let Some(state) = stack.pop() else {
                            continue;
                        };
                        if state.spectrum.ms_level != 2 {
                            continue;
                        }
                        let order = if state.little_endian {
                            ByteOrder::Little
                        } else {
                            ByteOrder::Big
                        };
                        let values = decode_binary(&state.peaks_text, state.double, state.zlib, order)
                            .map_err(&parse_error)?;
                        if values.len() % 2 != 0 {
                            return Err(parse_error("odd number of peak values".into()));
                        }

                        let mut spectrum = state.spectrum;
                        for pair in values.chunks_exact(2) {
                            spectrum.mz.push(pair[0]);
                            spectrum.intensity.push(pair[1] as f32);
                        }
                        spectrum.index = *n_read;
                        *n_read += 1;
                        return Ok(Some(spectrum));
                    }
                    _ => {}
                },
                Event::Eof => {
                    if !stack.is_empty() {
                        return Err(parse_error("unexpected end of file inside <scan>".into()));
                    }
                    return Ok(None);
                }
                _ => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use std::io::Cursor;

    fn peaks_b64(pairs: &[(f32, f32)]) -> String {
        let bytes: Vec<u8> = pairs
            .iter()
            .flat_map(|(m, i)| m.to_be_bytes().into_iter().chain(i.to_be_bytes()))
            .collect();
        STANDARD.encode(bytes)
    }

    #[test]
    fn test_reads_nested_ms2_scans() {
        let doc = format!(
            r#"<?xml version="1.0"?>
<mzXML><msRun scanCount="2">
<scan num="1" msLevel="1" retentionTime="PT1S">
  <peaks precision="32" byteOrder="network" compressionType="none">{ms1}</peaks>
  <scan num="2" msLevel="2" retentionTime="PT1.5M">
    <precursorMz precursorIntensity="10" precursorCharge="3">650.5</precursorMz>
    <peaks precision="32" byteOrder="network" compressionType="none">{ms2}</peaks>
  </scan>
</scan>
</msRun></mzXML>
"#,
            ms1 = peaks_b64(&[(100.0, 1.0)]),
            ms2 = peaks_b64(&[(150.5, 2.0), (300.25, 8.0)]),
        );
        let mut reader = MzXmlReader::from_reader(Cursor::new(doc.into_bytes()), "t.mzXML");

        let s = reader.next_spectrum().unwrap().unwrap();
        assert_eq!(s.native_id.as_deref(), Some("2"));
        assert_eq!(s.precursor_mz, 650.5);
        assert_eq!(s.precursor_charge, Some(3));
        assert_eq!(s.retention_time, Some(90.0));
        assert_eq!(s.mz, vec![150.5, 300.25]);
        assert_eq!(s.intensity, vec![2.0, 8.0]);

        assert!(reader.next_spectrum().unwrap().is_none());
    }

    #[test]
    fn test_retention_time_formats() {
        assert_eq!(parse_retention_time("PT84.2S"), Some(84.2));
        assert_eq!(parse_retention_time("PT2M"), Some(120.0));
        assert_eq!(parse_retention_time("12"), Some(12.0));
    }
}
