//! Multi-head self-attention with an additive stage mask.
//!
//! Features:
//! * Fused Q/K/V projection via a single linear layer (3 × hidden).
//! * The caller supplies the mask, so the same block serves block-causal
//!   next-scale prediction and plain causal decoding.

use candle_core::{DType, Device, IndexOp, Result, Tensor, D};
use candle_nn::{linear, Linear, Module, VarBuilder};

use moevar_common::MoeVarConfig;

/// Additive value for masked positions.
const MASKED: f32 = -1e9;

/// Multi-head self-attention.
pub struct StageAttention {
    c_attn: Linear,
    c_proj: Linear,
    num_heads: usize,
    head_dim: usize,
    scale: f64,
}

impl StageAttention {
    pub fn new(config: &MoeVarConfig, vb: VarBuilder) -> Result<Self> {
        let hidden = config.embed_dim();
        let c_attn = linear(hidden, 3 * hidden, vb.pp("c_attn"))?;
        let c_proj = linear(hidden, hidden, vb.pp("c_proj"))?;
        let head_dim = config.head_dim();
        Ok(Self {
            c_attn,
            c_proj,
            num_heads: config.heads(),
            head_dim,
            scale: 1.0 / (head_dim as f64).sqrt(),
        })
    }

    /// `x`: `(b, t, c)`; `bias`: `(1, 1, t, t)` additive mask.
    pub fn forward(&self, x: &Tensor, bias: &Tensor) -> Result<Tensor> {
        let (b, t, c) = x.dims3()?;

        // Fused QKV projection
        let qkv = self.c_attn.forward(x)?;
        let qkv = qkv.reshape((b, t, 3, self.num_heads, self.head_dim))?;
        let qkv = qkv.permute((0, 3, 1, 4, 2))?; // (b, heads, t, head_dim, 3)

        let q = qkv.i((.., .., .., .., 0))?.contiguous()?;
        let k = qkv.i((.., .., .., .., 1))?.contiguous()?;
        let v = qkv.i((.., .., .., .., 2))?.contiguous()?;

        let scores = (q.matmul(&k.t()?)? * self.scale)?;
        let scores = scores.broadcast_add(bias)?;
        let att = candle_nn::ops::softmax(&scores, D::Minus1)?;
        let y = att.contiguous()?.matmul(&v)?;
        let y = y.transpose(1, 2)?.reshape((b, t, c))?;

        self.c_proj.forward(&y)
    }
}

/// Mask where token `i` sees token `j` iff `level[j] <= level[i]`:
/// full attention inside a stage and to every coarser stage.
pub fn stage_mask(levels: &[usize], device: &Device) -> Result<Tensor> {
    let t = levels.len();
    let mut data = Vec::with_capacity(t * t);
    for &li in levels {
        for &lj in levels {
            data.push(if lj <= li { 0.0 } else { MASKED });
        }
    }
    Tensor::from_vec(data, (1, 1, t, t), device)
}

/// Plain lower-triangular causal mask.
pub fn causal_mask(t: usize, device: &Device) -> Result<Tensor> {
    let tril = Tensor::tril2(t, DType::F32, device)?;
    let ones = Tensor::ones((t, t), DType::F32, device)?;
    let masked = ((ones - tril)? * MASKED as f64)?;
    masked.reshape((1, 1, t, t))
}

#[cfg(test)]
mod tests {
    use candle_nn::VarMap;

    use super::*;

    #[test]
    fn stage_mask_is_block_causal() {
        let m = stage_mask(&[0, 1, 1, 2], &Device::Cpu).unwrap();
        let rows = m.reshape((4, 4)).unwrap().to_vec2::<f32>().unwrap();
        assert_eq!(rows[0], vec![0.0, MASKED, MASKED, MASKED]);
        assert_eq!(rows[1], vec![0.0, 0.0, 0.0, MASKED]);
        assert_eq!(rows[2], rows[1]);
        assert_eq!(rows[3], vec![0.0; 4]);
    }

    #[test]
    fn masked_positions_do_not_leak() {
        let cfg = MoeVarConfig::tiny();
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let attn = StageAttention::new(&cfg, vb).unwrap();
        let c = cfg.embed_dim();
        let bias = causal_mask(3, &Device::Cpu).unwrap();

        let x = Tensor::randn(0f32, 1f32, (1, 3, c), &Device::Cpu).unwrap();
        let y = attn.forward(&x, &bias).unwrap();
        // Changing the last token must not change the first output.
        let tail = Tensor::randn(0f32, 1f32, (1, 1, c), &Device::Cpu).unwrap();
        let x2 = Tensor::cat(&[&x.narrow(1, 0, 2).unwrap(), &tail], 1).unwrap();
        let y2 = attn.forward(&x2, &bias).unwrap();
        let a = y.i((0, 0)).unwrap().to_vec1::<f32>().unwrap();
        let b = y2.i((0, 0)).unwrap().to_vec1::<f32>().unwrap();
        for (p, q) in a.iter().zip(&b) {
            assert!((p - q).abs() < 1e-5);
        }
    }
}
