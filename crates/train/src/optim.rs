//! Base optimizers over named parameter groups.
//!
//! Parameters are split once into a `decay` and a `no_decay` group. The
//! scheduler writes `lr`/`weight_decay` into every group before each update;
//! [`BaseOptimizer::apply_update`] consumes already-averaged, unscaled and
//! clipped gradients aligned with [`BaseOptimizer::params`].

use std::collections::{BTreeMap, HashMap};

use candle_core::{DType, Tensor, Var};
use serde::{Deserialize, Serialize};

use moevar_common::{OptimizerKind, Result, TrainError};

/// Name fragments of parameters that never receive weight decay.
pub const NO_DECAY_KEYS: &[&str] = &[
    "class_emb",
    "pos_start",
    "pos_1LC",
    "lvl_embed",
    "ln1",
    "ln2",
    "head_nm",
    "router",
];

const FIRST_MOMENT: &str = "optim.m.";
const SECOND_MOMENT: &str = "optim.v.";

// ── Parameter groups ────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ParamGroup {
    pub name: String,
    /// Indices into [`BaseOptimizer::params`].
    pub params: Vec<usize>,
    pub lr_scale: f64,
    pub wd_scale: f64,
    /// Written by the scheduler.
    pub lr: f64,
    pub weight_decay: f64,
}

impl ParamGroup {
    fn new(name: &str, params: Vec<usize>, wd_scale: f64) -> Self {
        Self {
            name: name.into(),
            params,
            lr_scale: 1.0,
            wd_scale,
            lr: 0.0,
            weight_decay: 0.0,
        }
    }
}

/// Whether `name`/`var` belongs to the `no_decay` group.
pub fn is_no_decay(name: &str, var: &Var, keys: &[&str]) -> bool {
    var.rank() <= 1 || name.ends_with(".bias") || keys.iter().any(|k| name.contains(k))
}

/// Split named parameters into the `decay` and `no_decay` groups; empty
/// groups are left out.
pub fn build_param_groups(named: &[(String, Var)], no_decay_keys: &[&str]) -> Vec<ParamGroup> {
    let (no_decay, decay): (Vec<usize>, Vec<usize>) = (0..named.len())
        .partition(|&i| is_no_decay(&named[i].0, &named[i].1, no_decay_keys));
    let mut groups = Vec::with_capacity(2);
    if !decay.is_empty() {
        groups.push(ParamGroup::new("decay", decay, 1.0));
    }
    if !no_decay.is_empty() {
        groups.push(ParamGroup::new("no_decay", no_decay, 0.0));
    }
    groups
}

// ── Saved state ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupMeta {
    pub name: String,
    pub lr_scale: f64,
    pub wd_scale: f64,
    pub params: Vec<String>,
}

/// JSON part of the optimizer state; moments travel as tensors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizerMeta {
    pub kind: OptimizerKind,
    pub step: u64,
    pub groups: Vec<GroupMeta>,
    pub shapes: BTreeMap<String, Vec<usize>>,
}

// ── Optimizer ───────────────────────────────────────────────────────────────

pub struct BaseOptimizer {
    kind: OptimizerKind,
    params: Vec<(String, Var)>,
    groups: Vec<ParamGroup>,
    /// AdamW first moment, or the SGD momentum buffer.
    first: Vec<Option<Tensor>>,
    /// AdamW second moment.
    second: Vec<Option<Tensor>>,
    step: u64,
}

impl BaseOptimizer {
    pub fn new(kind: OptimizerKind, params: Vec<(String, Var)>, groups: Vec<ParamGroup>) -> Self {
        let n = params.len();
        Self {
            kind,
            params,
            groups,
            first: vec![None; n],
            second: vec![None; n],
            step: 0,
        }
    }

    pub fn kind(&self) -> OptimizerKind {
        self.kind
    }

    pub fn params(&self) -> &[(String, Var)] {
        &self.params
    }

    pub fn groups(&self) -> &[ParamGroup] {
        &self.groups
    }

    pub fn groups_mut(&mut self) -> &mut [ParamGroup] {
        &mut self.groups
    }

    /// Number of updates applied so far.
    pub fn step_count(&self) -> u64 {
        self.step
    }

    /// One update with the current per-group `lr`/`weight_decay`.
    /// Parameters without a gradient are left untouched.
    pub fn apply_update(&mut self, grads: &[Option<Tensor>]) -> candle_core::Result<()> {
        if grads.len() != self.params.len() {
            candle_core::bail!(
                "got {} gradients for {} parameters",
                grads.len(),
                self.params.len()
            );
        }
        self.step += 1;
        let t = self.step;

        for group in &self.groups {
            let (lr, wd) = (group.lr, group.weight_decay);
            for &i in &group.params {
                let Some(grad) = &grads[i] else { continue };
                let var = &self.params[i].1;
                let theta = var.as_tensor().detach();
                match self.kind {
                    OptimizerKind::AdamW { beta1, beta2, eps } => {
                        let m = match self.first[i].take() {
                            Some(m) => ((m * beta1)? + (grad * (1.0 - beta1))?)?,
                            None => (grad * (1.0 - beta1))?,
                        };
                        let v = match self.second[i].take() {
                            Some(v) => ((v * beta2)? + (grad.sqr()? * (1.0 - beta2))?)?,
                            None => (grad.sqr()? * (1.0 - beta2))?,
                        };
                        let m_hat = (&m / bias_correction(beta1, t))?;
                        let v_hat = (&v / bias_correction(beta2, t))?;
                        let delta = (m_hat / (v_hat.sqrt()? + eps)?)?;
                        // Decoupled decay: shrink first, then step.
                        let next = (theta.affine(1.0 - lr * wd, 0.0)? - (delta * lr)?)?;
                        var.set(&next)?;
                        self.first[i] = Some(m);
                        self.second[i] = Some(v);
                    }
                    OptimizerKind::Sgd { momentum } => {
                        let g = if wd > 0.0 {
                            (grad + (&theta * wd)?)?
                        } else {
                            grad.clone()
                        };
                        let buf = match self.first[i].take() {
                            Some(b) if momentum > 0.0 => ((b * momentum)? + &g)?,
                            _ => g,
                        };
                        let next = (&theta - (&buf * lr)?)?;
                        var.set(&next)?;
                        self.first[i] = Some(buf);
                    }
                }
            }
        }
        Ok(())
    }

    pub fn meta(&self) -> OptimizerMeta {
        OptimizerMeta {
            kind: self.kind,
            step: self.step,
            groups: self
                .groups
                .iter()
                .map(|g| GroupMeta {
                    name: g.name.clone(),
                    lr_scale: g.lr_scale,
                    wd_scale: g.wd_scale,
                    params: g.params.iter().map(|&i| self.params[i].0.clone()).collect(),
                })
                .collect(),
            shapes: self
                .params
                .iter()
                .map(|(name, var)| (name.clone(), var.dims().to_vec()))
                .collect(),
        }
    }

    /// Moment tensors, named `optim.m.<param>` / `optim.v.<param>`.
    pub fn state_tensors(&self) -> Vec<(String, Tensor)> {
        let mut out = Vec::new();
        for (i, (name, _)) in self.params.iter().enumerate() {
            if let Some(m) = &self.first[i] {
                out.push((format!("{FIRST_MOMENT}{name}"), m.clone()));
            }
            if let Some(v) = &self.second[i] {
                out.push((format!("{SECOND_MOMENT}{name}"), v.clone()));
            }
        }
        out
    }

    /// Restore state saved by [`meta`](Self::meta) and
    /// [`state_tensors`](Self::state_tensors). Nothing is modified on error.
    pub fn load(&mut self, meta: &OptimizerMeta, tensors: &HashMap<String, Tensor>) -> Result<()> {
        let live = self.meta();
        if meta.kind != live.kind {
            return Err(TrainError::StateShapeMismatch(format!(
                "optimizer kind {:?} does not match {:?}",
                meta.kind, live.kind
            )));
        }
        if meta.groups.len() != live.groups.len() {
            return Err(TrainError::StateShapeMismatch(format!(
                "{} parameter groups saved, {} live",
                meta.groups.len(),
                live.groups.len()
            )));
        }
        for (saved, current) in meta.groups.iter().zip(&live.groups) {
            if saved.name != current.name || saved.params != current.params {
                return Err(TrainError::StateShapeMismatch(format!(
                    "parameter group {:?} does not match the live group {:?}",
                    saved.name, current.name
                )));
            }
        }
        if meta.shapes != live.shapes {
            let first_diff = live
                .shapes
                .iter()
                .find(|(name, dims)| meta.shapes.get(*name) != Some(*dims))
                .map(|(name, _)| name.clone())
                .unwrap_or_default();
            return Err(TrainError::StateShapeMismatch(format!(
                "parameter shapes differ (first: {first_diff:?})"
            )));
        }

        let mut first = vec![None; self.params.len()];
        let mut second = vec![None; self.params.len()];
        for (i, (name, var)) in self.params.iter().enumerate() {
            for (prefix, slot) in [(FIRST_MOMENT, &mut first[i]), (SECOND_MOMENT, &mut second[i])] {
                if let Some(t) = tensors.get(&format!("{prefix}{name}")) {
                    if t.dims() != var.dims() {
                        return Err(TrainError::StateShapeMismatch(format!(
                            "{prefix}{name} has shape {:?}, parameter {:?}",
                            t.dims(),
                            var.dims()
                        )));
                    }
                    *slot = Some(t.to_dtype(DType::F32)?.to_device(var.device())?);
                }
            }
        }
        self.first = first;
        self.second = second;
        self.step = meta.step;
        Ok(())
    }
}

// ── Gradient utilities ──────────────────────────────────────────────────────

/// Global L2 norm over every present gradient, accumulated in f64.
pub fn global_norm(grads: &[Option<Tensor>]) -> candle_core::Result<f64> {
    let mut total = 0.0f64;
    for g in grads.iter().flatten() {
        total += g.to_dtype(DType::F64)?.sqr()?.sum_all()?.to_scalar::<f64>()?;
    }
    Ok(total.sqrt())
}

/// Multiply every present gradient by `factor`.
pub fn scale_grads(grads: &mut [Option<Tensor>], factor: f64) -> candle_core::Result<()> {
    for g in grads.iter_mut() {
        if let Some(t) = g.take() {
            *g = Some(t.affine(factor, 0.0)?);
        }
    }
    Ok(())
}

// ── Tests ───────────────────────────────────────────────────────────────────

/// `1 - beta^step`, the AdamW moment bias correction.
fn bias_correction(beta: f64, step: u64) -> f64 {
    1.0 - beta.powf(step as f64)
}

#[cfg(test)]
mod tests {
    use candle_core::Device;

    use super::*;

    fn param(name: &str, values: &[f32], dims: &[usize]) -> (String, Var) {
        let t = Tensor::from_slice(values, dims, &Device::Cpu).unwrap();
        (name.to_string(), Var::from_tensor(&t).unwrap())
    }

    fn grad(values: &[f32], dims: &[usize]) -> Option<Tensor> {
        Some(Tensor::from_slice(values, dims, &Device::Cpu).unwrap())
    }

    #[test]
    fn groups_split_by_rank_and_name() {
        let named = vec![
            param("blocks.0.attn.c_attn.weight", &[0.0; 4], &[2, 2]),
            param("blocks.0.attn.c_attn.bias", &[0.0; 2], &[2]),
            param("blocks.0.moe.router.weight", &[0.0; 4], &[2, 2]),
            param("pos_1LC", &[0.0; 4], &[1, 2, 2]),
            param("head.weight", &[0.0; 4], &[2, 2]),
        ];
        let groups = build_param_groups(&named, NO_DECAY_KEYS);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].name, "decay");
        assert_eq!(groups[0].params, vec![0, 4]);
        assert_eq!(groups[1].params, vec![1, 2, 3]);
        assert_eq!(groups[1].wd_scale, 0.0);
    }

    #[test]
    fn adamw_first_step_moves_by_lr() {
        let named = vec![param("w", &[1.0, -1.0], &[1, 2])];
        let var = named[0].1.clone();
        let mut groups = build_param_groups(&named, &[]);
        groups[0].lr = 0.1;
        let mut opt = BaseOptimizer::new(OptimizerKind::default(), named, groups);
        opt.apply_update(&[grad(&[0.5, -2.0], &[1, 2])]).unwrap();
        // Bias-corrected first step is lr * sign(g).
        let got = var.as_tensor().flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!((got[0] - 0.9).abs() < 1e-5);
        assert!((got[1] + 0.9).abs() < 1e-5);
        assert_eq!(opt.step_count(), 1);
    }

    #[test]
    fn bias_correction_holds_for_long_runs() {
        assert!((bias_correction(0.9, 1) - 0.1).abs() < 1e-12);
        assert!((bias_correction(0.999, 2) - (1.0 - 0.999f64 * 0.999)).abs() < 1e-12);
        // Past i32::MAX the correction has converged to 1.
        assert_eq!(bias_correction(0.9, (1u64 << 32) + 1), 1.0);
        assert_eq!(bias_correction(0.999, u64::MAX), 1.0);
    }

    #[test]
    fn sgd_weight_decay_without_gradient_signal() {
        let named = vec![param("w", &[2.0, 2.0], &[1, 2])];
        let var = named[0].1.clone();
        let mut groups = build_param_groups(&named, &[]);
        groups[0].lr = 0.5;
        groups[0].weight_decay = 0.1;
        let mut opt = BaseOptimizer::new(OptimizerKind::Sgd { momentum: 0.0 }, named, groups);
        opt.apply_update(&[grad(&[0.0, 0.0], &[1, 2])]).unwrap();
        // SGD couples decay into the gradient: 2 - 0.5 * 0.1 * 2
        let got = var.as_tensor().flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!((got[0] - 1.9).abs() < 1e-6);
    }

    #[test]
    fn state_round_trip_and_mismatch() {
        let named = vec![param("a", &[1.0, 2.0], &[1, 2]), param("b", &[3.0], &[1])];
        let groups = build_param_groups(&named, &[]);
        let mut opt = BaseOptimizer::new(OptimizerKind::default(), named.clone(), groups);
        opt.groups_mut().iter_mut().for_each(|g| g.lr = 0.01);
        opt.apply_update(&[grad(&[1.0, 1.0], &[1, 2]), grad(&[1.0], &[1])]).unwrap();

        let meta = opt.meta();
        let tensors: HashMap<String, Tensor> = opt.state_tensors().into_iter().collect();
        assert_eq!(tensors.len(), 4);

        let groups = build_param_groups(&named, &[]);
        let mut fresh = BaseOptimizer::new(OptimizerKind::default(), named, groups);
        fresh.load(&meta, &tensors).unwrap();
        assert_eq!(fresh.step_count(), 1);
        assert_eq!(fresh.meta(), meta);

        let other = vec![param("a", &[1.0, 2.0, 3.0], &[1, 3]), param("b", &[3.0], &[1])];
        let groups = build_param_groups(&other, &[]);
        let mut wrong = BaseOptimizer::new(OptimizerKind::default(), other, groups);
        assert!(matches!(
            wrong.load(&meta, &tensors),
            Err(TrainError::StateShapeMismatch(_))
        ));
    }

    #[test]
    fn norm_and_scale() {
        let mut grads = vec![grad(&[3.0], &[1]), None, grad(&[4.0], &[1])];
        assert!((global_norm(&grads).unwrap() - 5.0).abs() < 1e-12);
        scale_grads(&mut grads, 0.5).unwrap();
        assert!((global_norm(&grads).unwrap() - 2.5).abs() < 1e-12);
    }
}
