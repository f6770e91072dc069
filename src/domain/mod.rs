// ============================================================
// Layer 3: Domain Layer
// ============================================================
// Plain structs, enums and traits describing what the system
// works with: spectra, input formats, predictions and the
// errors every other layer reports.
//
// Rules for this layer:
//   - no file I/O
//   - no model math

/// Error taxonomy shared by every core layer
pub mod error;

/// Input formats and their scan-identifier strategies
pub mod format;

/// Peptide-spectrum match rows
pub mod psm;

/// Raw and normalized spectrum records
pub mod spectrum;

/// Reader abstraction implemented by every peak-list parser
pub mod traits;
