// ============================================================
// Layer 4: mzML Reader
// ============================================================
// Streams MS/MS spectra out of mzML files with a pull parser;
// the whole document is never held in memory.
//
// What we read per <spectrum>:
//   id attribute                native id (scan identifier)
//   MS:1000511 ms level         only MS2 spectra are yielded
//   MS:1000744 selected ion m/z precursor m/z
//   MS:1000041 charge state     precursor charge
//   MS:1000016 scan start time  retention time (seconds)
//   <binaryDataArray>           m/z (MS:1000514) and intensity
//                               (MS:1000515) arrays, base64,
//                               32/64-bit little endian,
//                               optionally zlib compressed
//
// Everything else in the document (file description, software,
// chromatograms, index) is skipped.

use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use flate2::read::ZlibDecoder;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

use crate::domain::error::{Result, RunnerError};
use crate::domain::format::PeakFileFormat;
use crate::domain::spectrum::RawSpectrum;
use crate::domain::traits::SpectrumSource;

// ─── Binary array decoding ────────────────────────────────────────────────────

/// Byte order of an encoded numeric array.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ByteOrder {
    Little,
    Big,
}

/// Decode a base64 numeric array into f64 values.
pub(crate) fn decode_binary(
    text: &str,
    double: bool,
    zlib: bool,
    order: ByteOrder,
) -> std::result::Result<Vec<f64>, String> {
    let cleaned: String = text.chars().filter(|c| !c.is_whitespace()).collect();
    if cleaned.is_empty() {
        return Ok(Vec::new());
    }
    let raw = STANDARD
        .decode(cleaned.as_bytes())
        .map_err(|e| format!("invalid base64: {e}"))?;

    let bytes = if zlib {
        let mut out = Vec::new();
        ZlibDecoder::new(raw.as_slice())
            .read_to_end(&mut out)
            .map_err(|e| format!("invalid zlib stream: {e}"))?;
        out
    } else {
        raw
    };

    let width = if double { 8 } else { 4 };
    if bytes.len() % width != 0 {
        return Err(format!(
            "array of {} bytes is not a multiple of {width}",
            bytes.len()
        ));
    }

    let values = bytes
        .chunks_exact(width)
        .map(|c| match (double, order) {
            (true, ByteOrder::Little) => f64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]),
            (true, ByteOrder::Big) => f64::from_be_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]),
            (false, ByteOrder::Little) => f64::from(f32::from_le_bytes([c[0], c[1], c[2], c[3]])),
            (false, ByteOrder::Big) => f64::from(f32::from_be_bytes([c[0], c[1], c[2], c[3]])),
        })
        .collect();
    Ok(values)
}

/// Owned value of attribute `key`, if present.
pub(crate) fn attr(e: &BytesStart<'_>, key: &[u8]) -> Option<String> {
    e.attributes()
        .flatten()
        .find(|a| a.key.as_ref() == key)
        .and_then(|a| a.unescape_value().ok().map(|v| v.into_owned()))
}

// ─── Reader ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ArrayKind {
    Mz,
    Intensity,
}

#[derive(Debug)]
struct ArrayState {
    kind: Option<ArrayKind>,
    double: bool,
    zlib: bool,
    text: String,
}

impl Default for ArrayState {
    fn default() -> Self {
        Self {
            kind: None,
            double: true,
            zlib: false,
            text: String::new(),
        }
    }
}

#[derive(Debug, Default)]
struct SpectrumState {
    spectrum: RawSpectrum,
    ms_level: Option<u8>,
    array: Option<ArrayState>,
    in_binary: bool,
}

impl SpectrumState {
    fn cv_param(&mut self, e: &BytesStart<'_>) {
        let Some(accession) = attr(e, b"accession") else {
            return;
        };
        let value = attr(e, b"value").unwrap_or_default();

        if let Some(array) = self.array.as_mut() {
            match accession.as_str() {
                "MS:1000514" => array.kind = Some(ArrayKind::Mz),
                "MS:1000515" => array.kind = Some(ArrayKind::Intensity),
                "MS:1000523" => array.double = true,
                "MS:1000521" => array.double = false,
                "MS:1000574" => array.zlib = true,
                "MS:1000576" => array.zlib = false,
                _ => {}
            }
            return;
        }

        match accession.as_str() {
            "MS:1000511" => self.ms_level = value.parse().ok(),
            "MS:1000744" => {
                if let Ok(mz) = value.parse() {
                    self.spectrum.precursor_mz = mz;
                }
            }
            "MS:1000041" => self.spectrum.precursor_charge = value.parse().ok().filter(|&z| z > 0),
            "MS:1000016" => {
                let minutes = attr(e, b"unitAccession").as_deref() == Some("UO:0000031")
                    || attr(e, b"unitName").as_deref() == Some("minute");
                self.spectrum.retention_time = value
                    .parse::<f64>()
                    .ok()
                    .map(|t| if minutes { t * 60.0 } else { t });
            }
            _ => {}
        }
    }
}

pub struct MzMlReader<R> {
    reader: Reader<R>,
    buf: Vec<u8>,
    path: PathBuf,
    n_read: usize,
}

impl MzMlReader<BufReader<File>> {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| RunnerError::io(path, e))?;
        Ok(Self::from_reader(BufReader::new(file), path))
    }
}

impl<R: BufRead> MzMlReader<R> {
    pub fn from_reader(inner: R, path: impl AsRef<Path>) -> Self {
        let mut reader = Reader::from_reader(inner);
        reader.trim_text(true);
        Self {
            reader,
            buf: Vec::new(),
            path: path.as_ref().to_path_buf(),
            n_read: 0,
        }
    }
}

impl<R: BufRead> SpectrumSource for MzMlReader<R> {
    fn format(&self) -> PeakFileFormat {
        PeakFileFormat::MzMl
    }

    fn next_spectrum(&mut self) -> Result<Option<RawSpectrum>> {
        let Self {
            reader,
            buf,
            path,
            n_read,
        } = self;
        let parse_error = |message: String| RunnerError::Parse {
            format: "mzML",
            path: path.clone(),
            record: *n_read,
            message,
        };

        let mut current: Option<SpectrumState> = None;
        loop {
            buf.clear();
            let event = reader
                .read_event_into(buf)
                .map_err(|e| parse_error(e.to_string()))?;

            match event {
                Event::Start(ref e) | Event::Empty(ref e) => {
                    let is_start = matches!(event, Event::Start(_));
                    match e.local_name().as_ref() {
                        b"spectrum" if is_start => {
                            current = Some(SpectrumState {
                                spectrum: RawSpectrum {
                                    native_id: attr(e, b"id"),
                                    ..Default::default()
                                },
                                ..Default::default()
                            });
                        }
                        b"cvParam" => {
                            if let Some(state) = current.as_mut() {
                                state.cv_param(e);
                            }
                        }
                        b"binaryDataArray" if is_start => {
                            if let Some(state) = current.as_mut() {
                                state.array = Some(ArrayState::default());
                            }
                        }
                        b"binary" if is_start => {
                            if let Some(state) = current.as_mut() {
                                state.in_binary = true;
                            }
                        }
                        _ => {}
                    }
                }
                Event::Text(ref t) => {
                    if let Some(state) = current.as_mut().filter(|s| s.in_binary) {
                        let text = t.unescape().map_err(|e| parse_error(e.to_string()))?;
                        if let Some(array) = state.array.as_mut() {
                            array.text.push_str(&text);
                        }
                    }
                }
                Event::End(ref e) => {
                    let Some(state) = current.as_mut() else {
                        continue;
                    };
                    match e.local_name().as_ref() {
                        b"binary" => state.in_binary = false,
                        b"binaryDataArray" => {
                            if let Some(array) = state.array.take() {
                                let values =
                                    decode_binary(&array.text, array.double, array.zlib, ByteOrder::Little)
                                        .map_err(&parse_error)?;
                                match array.kind {
                                    Some(ArrayKind::Mz) => state.spectrum.mz = values,
                                    Some(ArrayKind::Intensity) => {
                                        state.spectrum.intensity =
                                            values.into_iter().map(|v| v as f32).collect()
                                    }
                                    None => {}
                                }
                            }
                        }
                        b"spectrum" => {
                            let Some(state) = current.take() else {
                                continue;
                            };
                            let level = state.ms_level.unwrap_or(2);
                            if level != 2 {
                                continue;
                            }
                            let mut spectrum = state.spectrum;
                            if spectrum.mz.len() != spectrum.intensity.len() {
                                return Err(parse_error(format!(
                                    "m/z and intensity arrays differ in length ({} vs {})",
                                    spectrum.mz.len(),
                                    spectrum.intensity.len()
                                )));
                            }
                            spectrum.ms_level = level;
                            spectrum.index = *n_read;
                            *n_read += 1;
                            return Ok(Some(spectrum));
                        }
                        _ => {}
                    }
                }
                Event::Eof => {
                    if current.is_some() {
                        return Err(parse_error("unexpected end of file inside <spectrum>".into()));
                    }
                    return Ok(None);
                }
                _ => {}
            }
        }
    }
}
