// ============================================================
// Layer 5: ML / Model Layer
// ============================================================
// Everything that knows about model weights lives here. The
// runner talks to this layer through Spec2Pep and Trainer only.
//
// What's in this layer:
//
//   hparams.rs    architecture and behavior hyperparameters and
//                 their flat checkpoint map
//
//   reconcile.rs  merges a checkpoint's map with the current
//                 configuration (precedence table, legacy names)
//
//   model.rs      the Spec2Pep Burn transformer: strict shape-
//                 checked loading, training / validation / predict
//
//   trainer.rs    epoch loop, validation cadence, checkpoint
//                 callbacks, device resolution
//
//   inferencer.rs prediction loop and mass-aware precision

/// Architecture and behavior hyperparameters
pub mod hparams;

/// Prediction loop and peptide precision
pub mod inferencer;

/// Spec2Pep reference model
pub mod model;

/// Checkpoint/config hyperparameter merge
pub mod reconcile;

/// Training loop with validation and checkpointing
pub mod trainer;
