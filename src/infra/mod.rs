// ============================================================
// Layer 6: Infrastructure Layer
// ============================================================
// Everything that touches the filesystem on behalf of the
// layers above:
//
//   atomic.rs      write-to-temp then rename, used for every
//                  final artifact
//
//   store.rs       the on-disk spectrum record store built by
//                  the dataset builder and reused across runs
//
//   checkpoint.rs  weights + hyperparameter map container
//
//   mztab.rs       incremental mzTab results writer
//
//   metrics.rs     validation history CSV
//
// None of these modules know about training or decoding; they
// move bytes and report RunnerError on failure.

/// Atomic file replacement
pub mod atomic;

/// Model checkpoint saving and loading
pub mod checkpoint;

/// Validation metrics CSV logger
pub mod metrics;

/// mzTab results writer
pub mod mztab;

/// Spectrum record store
pub mod store;
