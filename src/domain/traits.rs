// ============================================================
// Layer 3: Core Traits
// ============================================================
// Readers for every peak-list format implement SpectrumSource,
// so the dataset builder can stream spectra from any of them
// without knowing which format it is holding.
//
// Implementations:
//   - MgfReader    (data::mgf)
//   - MzMlReader   (data::mzml)
//   - MzXmlReader  (data::mzxml)

use crate::domain::error::Result;
use crate::domain::format::PeakFileFormat;
use crate::domain::spectrum::RawSpectrum;

/// Anything that yields raw spectra one at a time.
pub trait SpectrumSource {
    /// The format this source parses.
    fn format(&self) -> PeakFileFormat;

    /// Read the next spectrum, `Ok(None)` at end of input.
    fn next_spectrum(&mut self) -> Result<Option<RawSpectrum>>;
}

/// Adapts any `SpectrumSource` into an iterator of results.
pub struct SourceIter<S> {
    source: S,
    done: bool,
}

impl<S: SpectrumSource> SourceIter<S> {
    pub fn new(source: S) -> Self {
        Self {
            source,
            done: false,
        }
    }
}

impl<S: SpectrumSource> Iterator for SourceIter<S> {
    type Item = Result<RawSpectrum>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.source.next_spectrum() {
            Ok(Some(spectrum)) => Some(Ok(spectrum)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                // A parse error ends the stream; the caller sees it once.
                self.done = true;
                Some(Err(e))
            }
        }
    }
}
