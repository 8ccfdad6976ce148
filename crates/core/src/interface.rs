//! Narrow interfaces the training driver consumes.
//!
//! The trainer only ever talks to a frozen [`VisualTokenizer`] and an
//! [`ArModel`]; the concrete networks in this crate are one implementation.

use candle_core::{Result, Tensor};

/// Output of one autoregressive forward pass.
pub struct ArOutput {
    /// `(batch, seq_len, vocab)`.
    pub logits: Tensor,
    /// Scalar load-balancing penalty of the MoE layers (0 for dense models).
    pub aux_loss: Tensor,
}

/// Frozen image → multi-scale token mapping.
pub trait VisualTokenizer {
    /// Per-stage token ids, coarse to fine; stage `s` is `(batch, pn_s²)` u32.
    fn encode(&self, images: &Tensor) -> Result<Vec<Tensor>>;

    /// Teacher-forcing input for every stage after the first:
    /// `(batch, seq_len - pn_0², latent_channels)`.
    fn teacher_forcing_input(&self, ids: &[Tensor]) -> Result<Tensor>;

    fn vocab_size(&self) -> usize;

    fn patch_nums(&self) -> &[usize];
}

/// Class-conditional next-scale prediction model.
pub trait ArModel {
    fn forward(&self, labels: &Tensor, teacher_forcing: &Tensor) -> Result<ArOutput>;

    /// Switch between training behaviour (label dropout, router noise) and
    /// deterministic inference.
    fn set_training(&self, training: bool);

    fn is_training(&self) -> bool;
}
