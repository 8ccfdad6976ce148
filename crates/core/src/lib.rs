//! # moevar-core: Model Collaborators
//!
//! The networks the training driver consumes, each behind a narrow trait:
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`interface`] | `VisualTokenizer`, `ArModel`, `ArOutput` |
//! | [`vq`] | `MultiScaleVq`: frozen residual multi-scale quantizer |
//! | [`attention`] | `StageAttention`, block-causal and causal masks |
//! | [`moe`] | `MoeFeedForward`: top-k routing with balance loss |
//! | [`model`] | `MoeVar`: next-scale prediction transformer |
//!
//! Everything goes through `candle-core`/`candle-nn`, so the same code runs on
//! CPU, CUDA and Metal.

pub mod attention;
pub mod interface;
pub mod model;
pub mod moe;
pub mod vq;

// ── Public re-exports ───────────────────────────────────────────────────────

pub use interface::{ArModel, ArOutput, VisualTokenizer};
pub use model::MoeVar;
pub use moe::MoeFeedForward;
pub use vq::MultiScaleVq;
