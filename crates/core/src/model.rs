//! Class-conditional next-scale prediction transformer with MoE blocks.
//!
//! Sequence layout: the first stage is the start token(s) built from the class
//! embedding; every later stage is the word-embedded teacher-forcing input
//! from the tokenizer. Level and absolute position embeddings are added, and
//! attention is block-causal over stages.

use std::sync::atomic::{AtomicBool, Ordering};

use candle_core::{DType, Device, Result, Tensor};
use candle_nn::{embedding, layer_norm, linear, Embedding, Init, LayerNorm, Linear, Module, VarBuilder};
use rand::Rng;

use moevar_common::MoeVarConfig;

use crate::attention::{stage_mask, StageAttention};
use crate::interface::{ArModel, ArOutput};
use crate::moe::MoeFeedForward;

// ── Block ───────────────────────────────────────────────────────────────────

/// Pre-norm → attention → residual → pre-norm → MoE → residual.
struct MoeBlock {
    ln1: LayerNorm,
    attn: StageAttention,
    ln2: LayerNorm,
    moe: MoeFeedForward,
}

impl MoeBlock {
    fn new(config: &MoeVarConfig, vb: VarBuilder) -> Result<Self> {
        let c = config.embed_dim();
        Ok(Self {
            ln1: layer_norm(c, config.layer_norm_eps, vb.pp("ln1"))?,
            attn: StageAttention::new(config, vb.pp("attn"))?,
            ln2: layer_norm(c, config.layer_norm_eps, vb.pp("ln2"))?,
            moe: MoeFeedForward::new(config, vb.pp("moe"))?,
        })
    }

    fn forward(&self, x: &Tensor, bias: &Tensor, training: bool) -> Result<(Tensor, Tensor)> {
        let x = (x + self.attn.forward(&self.ln1.forward(x)?, bias)?)?;
        let (h, aux) = self.moe.forward(&self.ln2.forward(&x)?, training)?;
        Ok(((x + h)?, aux))
    }
}

// ── MoeVar ──────────────────────────────────────────────────────────────────

pub struct MoeVar {
    class_emb: Embedding,
    pos_start: Tensor,
    word_embed: Linear,
    pos_1lc: Tensor,
    lvl_embed: Embedding,
    blocks: Vec<MoeBlock>,
    head_nm: LayerNorm,
    head: Linear,
    attn_bias: Tensor,
    lvl_ids: Tensor,
    training: AtomicBool,
    config: MoeVarConfig,
}

impl MoeVar {
    pub fn new(vb: VarBuilder, config: &MoeVarConfig) -> Result<Self> {
        let c = config.embed_dim();
        let first_l = config.patch_nums[0] * config.patch_nums[0];
        let seq_len = config.seq_len();
        let init = Init::Randn {
            mean: 0.0,
            stdev: config.init_std,
        };

        // The extra class is the unconditional token.
        let class_emb = embedding(config.num_classes + 1, c, vb.pp("class_emb"))?;
        let pos_start = vb.get_with_hints((1, first_l, c), "pos_start", init)?;
        let word_embed = linear(config.latent_channels, c, vb.pp("word_embed"))?;
        let pos_1lc = vb.get_with_hints((1, seq_len, c), "pos_1LC", init)?;
        let lvl_embed = embedding(config.num_stages(), c, vb.pp("lvl_embed"))?;

        let mut blocks = Vec::with_capacity(config.depth);
        for i in 0..config.depth {
            blocks.push(MoeBlock::new(config, vb.pp(format!("blocks.{i}")))?);
        }
        let head_nm = layer_norm(c, config.layer_norm_eps, vb.pp("head_nm"))?;
        let head = linear(c, config.vocab_size, vb.pp("head"))?;

        let levels: Vec<usize> = config
            .patch_nums
            .iter()
            .enumerate()
            .flat_map(|(s, pn)| std::iter::repeat(s).take(pn * pn))
            .collect();
        let device = vb.device();
        let attn_bias = stage_mask(&levels, device)?;
        let lvl_ids = Tensor::from_vec(
            levels.iter().map(|&l| l as u32).collect::<Vec<_>>(),
            seq_len,
            device,
        )?;
        tracing::debug!(
            depth = config.depth,
            embed_dim = c,
            experts = config.num_experts,
            top_k = config.top_k,
            seq_len,
            "built MoE transformer"
        );

        Ok(Self {
            class_emb,
            pos_start,
            word_embed,
            pos_1lc,
            lvl_embed,
            blocks,
            head_nm,
            head,
            attn_bias,
            lvl_ids,
            training: AtomicBool::new(true),
            config: config.clone(),
        })
    }

    pub fn config(&self) -> &MoeVarConfig {
        &self.config
    }

    /// Replace a random subset of labels with the unconditional class.
    fn drop_labels(&self, labels: &Tensor, device: &Device) -> Result<Tensor> {
        let rate = self.config.cond_drop_rate;
        if rate <= 0.0 {
            return Ok(labels.clone());
        }
        let mut rng = rand::thread_rng();
        let uncond = self.config.num_classes as u32;
        let dropped: Vec<u32> = labels
            .to_vec1::<u32>()?
            .into_iter()
            .map(|l| if rng.gen_bool(rate.min(1.0)) { uncond } else { l })
            .collect();
        Tensor::from_vec(dropped, labels.dim(0)?, device)
    }
}

impl ArModel for MoeVar {
    fn forward(&self, labels: &Tensor, teacher_forcing: &Tensor) -> Result<ArOutput> {
        let training = self.is_training();
        let device = labels.device();
        let labels = if training {
            self.drop_labels(labels, device)?
        } else {
            labels.clone()
        };

        let sos = self
            .class_emb
            .forward(&labels)?
            .unsqueeze(1)?
            .broadcast_add(&self.pos_start)?;
        let tokens = self.word_embed.forward(teacher_forcing)?;
        let x = Tensor::cat(&[&sos, &tokens], 1)?;
        let lvl = self.lvl_embed.forward(&self.lvl_ids)?.unsqueeze(0)?;
        let mut x = x.broadcast_add(&lvl)?.broadcast_add(&self.pos_1lc)?;

        let mut aux = Tensor::zeros((), DType::F32, device)?;
        for block in &self.blocks {
            let (y, a) = block.forward(&x, &self.attn_bias, training)?;
            x = y;
            aux = (aux + a)?;
        }
        let aux_loss = aux.affine(1.0 / self.blocks.len().max(1) as f64, 0.0)?;
        let logits = self.head.forward(&self.head_nm.forward(&x)?)?;
        Ok(ArOutput { logits, aux_loss })
    }

    fn set_training(&self, training: bool) {
        self.training.store(training, Ordering::Relaxed);
    }

    fn is_training(&self) -> bool {
        self.training.load(Ordering::Relaxed)
    }
}
