// ============================================================
// Layer 4: Data Pipeline
// ============================================================
// This layer handles everything from raw peak-list files all
// the way to batches the model can consume.
//
// The pipeline flows in this order:
//
//   path arguments (globs, ~, $VAR)
//       │
//       ▼
//   loader            → expands paths, keeps supported files
//       │
//       ▼
//   mgf / mzml / mzxml → stream RawSpectrum values
//       │
//       ▼
//   preprocessor      → charge / m/z / precursor / top-N /
//       │               root / unit-norm chain
//       ▼
//   dataset           → materializes a spectrum store per split
//       │
//       ▼
//   batcher           → ordered or buffer-shuffled batches
//       │
//       ▼
//   module            → per-stage setup and dataloader accessors
//
// Each module is responsible for exactly one step.

/// Shuffle buffer and batch iteration
pub mod batcher;

/// Per-split dataset building on top of the spectrum store
pub mod dataset;

/// Path expansion and reader dispatch
pub mod loader;

/// MGF reader
pub mod mgf;

/// Data module facade over all splits
pub mod module;

/// mzML reader
pub mod mzml;

/// mzXML reader
pub mod mzxml;

/// Spectrum preprocessing chain
pub mod preprocessor;

/// Residue vocabulary and peptide masses
pub mod tokenizer;
