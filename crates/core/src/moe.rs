//! Top-k mixture-of-experts feed-forward layer.
//!
//! Router: linear → (noise while training) → softmax → keep the `k` largest
//! probabilities per token, renormalised. Every expert is a GELU MLP.
//! The auxiliary loss is the Switch-Transformer balance term
//! `E · Σ_e f_e · P_e` with `f_e` the fraction of routing slots sent to
//! expert `e` and `P_e` its mean router probability; it is 1 when routing is
//! uniform.

use candle_core::{DType, Result, Tensor, D};
use candle_nn::{linear, linear_no_bias, Linear, Module, VarBuilder};

use moevar_common::MoeVarConfig;

struct Expert {
    fc1: Linear,
    fc2: Linear,
}

impl Expert {
    fn new(hidden: usize, inner: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            fc1: linear(hidden, inner, vb.pp("fc1"))?,
            fc2: linear(inner, hidden, vb.pp("fc2"))?,
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        self.fc2.forward(&self.fc1.forward(x)?.gelu()?)
    }
}

pub struct MoeFeedForward {
    router: Linear,
    experts: Vec<Expert>,
    top_k: usize,
    noise_std: f64,
}

/// Routing decision for a flat batch of tokens.
pub struct Routing {
    /// Softmax router probabilities, `(n, E)`.
    pub probs: Tensor,
    /// 1.0 for selected experts, `(n, E)`.
    pub mask: Tensor,
    /// Renormalised gate weights, `(n, E)`.
    pub gates: Tensor,
}

impl MoeFeedForward {
    pub fn new(config: &MoeVarConfig, vb: VarBuilder) -> Result<Self> {
        let hidden = config.embed_dim();
        let inner = config.hidden_dim();
        let router = linear_no_bias(hidden, config.num_experts, vb.pp("router"))?;
        let experts = (0..config.num_experts)
            .map(|e| Expert::new(hidden, inner, vb.pp(format!("experts.{e}"))))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            router,
            experts,
            top_k: config.top_k,
            noise_std: config.router_noise_std,
        })
    }

    pub fn num_experts(&self) -> usize {
        self.experts.len()
    }

    pub fn route(&self, flat: &Tensor, training: bool) -> Result<Routing> {
        let mut logits = self.router.forward(flat)?;
        if training && self.noise_std > 0.0 {
            logits = (&logits + logits.randn_like(0.0, self.noise_std)?)?;
        }
        let probs = candle_nn::ops::softmax(&logits, D::Minus1)?;

        // Probabilities live in [0, 1]; subtracting 2 removes a pick from
        // later rounds.
        let mut remaining = probs.clone();
        let mut mask = probs.zeros_like()?;
        for _ in 0..self.top_k {
            let best = remaining.max_keepdim(D::Minus1)?;
            let hit = remaining.broadcast_ge(&best)?.to_dtype(DType::F32)?;
            mask = (mask + &hit)?;
            remaining = (remaining - (hit * 2.0)?)?;
        }
        let mask = mask.clamp(0f32, 1f32)?;

        let gates = (&probs * &mask)?;
        let denom = (gates.sum_keepdim(D::Minus1)? + 1e-9)?;
        let gates = gates.broadcast_div(&denom)?;
        Ok(Routing { probs, mask, gates })
    }

    /// `x`: `(b, t, c)` → `(output, aux_loss)`.
    pub fn forward(&self, x: &Tensor, training: bool) -> Result<(Tensor, Tensor)> {
        let (b, t, c) = x.dims3()?;
        let flat = x.reshape((b * t, c))?;
        let routing = self.route(&flat, training)?;

        let mut out = flat.zeros_like()?;
        for (e, expert) in self.experts.iter().enumerate() {
            let gate = routing.gates.narrow(1, e, 1)?;
            out = (out + expert.forward(&flat)?.broadcast_mul(&gate)?)?;
        }

        let n_experts = self.experts.len() as f64;
        let load = routing.mask.mean(0)?.affine(1.0 / self.top_k as f64, 0.0)?;
        let importance = routing.probs.mean(0)?;
        let aux = (load * importance)?.sum_all()?.affine(n_experts, 0.0)?;

        Ok((out.reshape((b, t, c))?, aux))
    }
}

#[cfg(test)]
mod tests {
    use candle_core::Device;
    use candle_nn::VarMap;

    use super::*;

    fn layer(noise: f64) -> (MoeFeedForward, VarMap) {
        let cfg = MoeVarConfig {
            router_noise_std: noise,
            ..MoeVarConfig::tiny()
        };
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        (MoeFeedForward::new(&cfg, vb).unwrap(), varmap)
    }

    #[test]
    fn routes_exactly_top_k() {
        let (moe, _vm) = layer(0.0);
        let x = Tensor::randn(0f32, 1f32, (10, 64), &Device::Cpu).unwrap();
        let r = moe.route(&x, false).unwrap();
        let picked = r.mask.sum(1).unwrap().to_vec1::<f32>().unwrap();
        assert!(picked.iter().all(|&p| p == 2.0));
        let gate_sums = r.gates.sum(1).unwrap().to_vec1::<f32>().unwrap();
        assert!(gate_sums.iter().all(|&g| (g - 1.0).abs() < 1e-4));
    }

    #[test]
    fn aux_loss_is_one_when_uniform() {
        let (moe, varmap) = layer(0.0);
        // Zero router → uniform probabilities; ties select every expert.
        for var in varmap.all_vars() {
            if var.dims() == [4, 64] {
                var.set(&var.zeros_like().unwrap()).unwrap();
            }
        }
        let x = Tensor::randn(0f32, 1f32, (2, 3, 64), &Device::Cpu).unwrap();
        let (y, aux) = moe.forward(&x, false).unwrap();
        assert_eq!(y.dims(), &[2, 3, 64]);
        // mask is all ones, load = 1/k per expert, importance = 1/E
        let expected = 4.0 * 4.0 * (1.0 / 2.0) * (1.0 / 4.0);
        assert!((aux.to_scalar::<f32>().unwrap() - expected).abs() < 1e-5);
    }

    #[test]
    fn router_noise_only_in_training() {
        let (moe, _vm) = layer(1.0);
        let x = Tensor::randn(0f32, 1f32, (6, 64), &Device::Cpu).unwrap();
        let a = moe.route(&x, false).unwrap().probs.to_vec2::<f32>().unwrap();
        let b = moe.route(&x, false).unwrap().probs.to_vec2::<f32>().unwrap();
        assert_eq!(a, b);
        let c = moe.route(&x, true).unwrap().probs.to_vec2::<f32>().unwrap();
        assert_ne!(a, c);
    }
}
