//! Mixed-precision accumulating optimizer.
//!
//! [`AmpOptimizer::step`] is called once per micro-batch. Gradients pile up in
//! a pending buffer until `accumulation_steps` calls have been made; the
//! call that completes the window synchronizes, unscales, measures, clips and
//! applies them. A non-finite gradient norm skips the update, drops the
//! window and (in `fp16`) halves the loss scale.

use std::collections::HashMap;

use candle_core::{Tensor, Var};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use moevar_common::{Precision, Result, TrainError};

use crate::optim::{global_norm, scale_grads, BaseOptimizer, OptimizerMeta};

const PENDING: &str = "optim.pending.";

// ── Gradient synchronization seam ───────────────────────────────────────────

/// Averages a completed window of gradients across ranks.
///
/// `grads` is aligned with `params`; implementations may fill missing
/// entries.
pub trait GradientSync {
    fn sync_gradients(&self, grads: &mut [Option<Tensor>], params: &[(String, Var)]) -> Result<()>;
}

/// Single-process training: gradients are already global.
pub struct NoSync;

impl GradientSync for NoSync {
    fn sync_gradients(&self, _grads: &mut [Option<Tensor>], _params: &[(String, Var)]) -> Result<()> {
        Ok(())
    }
}

// ── Loss scaler ─────────────────────────────────────────────────────────────

/// Dynamic loss scale for `fp16`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LossScaler {
    scale: f64,
    growth_tracker: u32,
}

impl LossScaler {
    pub const INIT_SCALE: f64 = 2048.0;
    pub const GROWTH_FACTOR: f64 = 2.0;
    pub const BACKOFF_FACTOR: f64 = 0.5;
    pub const GROWTH_INTERVAL: u32 = 1000;
    pub const MAX_SCALE: f64 = 32768.0;

    pub fn new() -> Self {
        Self {
            scale: Self::INIT_SCALE,
            growth_tracker: 0,
        }
    }

    pub fn scale(&self) -> f64 {
        self.scale
    }

    pub fn growth_tracker(&self) -> u32 {
        self.growth_tracker
    }

    pub fn update(&mut self, found_non_finite: bool) {
        if found_non_finite {
            self.scale *= Self::BACKOFF_FACTOR;
            self.growth_tracker = 0;
            return;
        }
        self.growth_tracker += 1;
        if self.growth_tracker >= Self::GROWTH_INTERVAL {
            self.scale = (self.scale * Self::GROWTH_FACTOR).min(Self::MAX_SCALE);
            self.growth_tracker = 0;
        }
    }
}

impl Default for LossScaler {
    fn default() -> Self {
        Self::new()
    }
}

// ── Step outcome ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OptimStep {
    /// Pre-clip global norm; `0` unless an update was applied.
    pub grad_norm: f64,
    /// `log2` of the loss scale after this call; `None` without a scaler.
    pub loss_scale_log2: Option<f64>,
    /// An update was applied.
    pub updated: bool,
    /// The window completed with a non-finite norm and was dropped.
    pub skipped_non_finite: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AmpMeta {
    pub precision: Precision,
    pub loss_scale: f64,
    pub growth_tracker: u32,
    pub accumulation_steps: usize,
    pub counter: usize,
    pub updates: u64,
    pub skipped: u64,
    pub optimizer: OptimizerMeta,
}

// ── Optimizer ───────────────────────────────────────────────────────────────

pub struct AmpOptimizer {
    base: BaseOptimizer,
    precision: Precision,
    scaler: Option<LossScaler>,
    grad_clip: f64,
    accumulation_steps: usize,
    counter: usize,
    pending: Vec<Option<Tensor>>,
    updates: u64,
    skipped: u64,
}

impl AmpOptimizer {
    pub fn new(
        base: BaseOptimizer,
        precision: Precision,
        grad_clip: f64,
        accumulation_steps: usize,
    ) -> Result<Self> {
        if accumulation_steps == 0 {
            return Err(TrainError::config("accumulation steps must be at least 1"));
        }
        let n = base.params().len();
        Ok(Self {
            base,
            precision,
            scaler: precision.uses_loss_scaling().then(LossScaler::new),
            grad_clip,
            accumulation_steps,
            counter: 0,
            pending: vec![None; n],
            updates: 0,
            skipped: 0,
        })
    }

    pub fn base(&self) -> &BaseOptimizer {
        &self.base
    }

    pub fn base_mut(&mut self) -> &mut BaseOptimizer {
        &mut self.base
    }

    pub fn precision(&self) -> Precision {
        self.precision
    }

    pub fn accumulation_steps(&self) -> usize {
        self.accumulation_steps
    }

    /// Micro-batches accumulated in the open window.
    pub fn counter(&self) -> usize {
        self.counter
    }

    /// Whether the next [`step`](Self::step) completes the window.
    pub fn completes_window(&self) -> bool {
        self.counter + 1 == self.accumulation_steps
    }

    pub fn loss_scale(&self) -> f64 {
        self.scaler.map_or(1.0, |s| s.scale())
    }

    pub fn loss_scale_log2(&self) -> Option<f64> {
        self.scaler.map(|s| s.scale().log2())
    }

    pub fn updates(&self) -> u64 {
        self.updates
    }

    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    /// Backpropagate one micro-batch loss and update when the window closes.
    pub fn step(&mut self, loss: &Tensor, sync: &dyn GradientSync) -> anyhow::Result<OptimStep> {
        let factor = self.loss_scale() / self.accumulation_steps as f64;
        let grads = loss.affine(factor, 0.0)?.backward()?;
        for (slot, (_, var)) in self.pending.iter_mut().zip(self.base.params()) {
            if let Some(g) = grads.get(var.as_tensor()) {
                let g = g.detach();
                *slot = Some(match slot.take() {
                    Some(acc) => (acc + g)?,
                    None => g,
                });
            }
        }
        drop(grads);

        self.counter += 1;
        if self.counter < self.accumulation_steps {
            return Ok(OptimStep {
                grad_norm: 0.0,
                loss_scale_log2: self.loss_scale_log2(),
                updated: false,
                skipped_non_finite: false,
            });
        }

        self.counter = 0;
        let n = self.pending.len();
        let mut window = std::mem::replace(&mut self.pending, vec![None; n]);
        sync.sync_gradients(&mut window, self.base.params())?;
        if let Some(scaler) = self.scaler {
            scale_grads(&mut window, 1.0 / scaler.scale())?;
        }

        let norm = global_norm(&window)?;
        if !norm.is_finite() {
            if let Some(scaler) = self.scaler.as_mut() {
                scaler.update(true);
            }
            self.skipped += 1;
            warn!(
                skipped = self.skipped,
                loss_scale = self.loss_scale(),
                "non-finite gradient norm, update skipped"
            );
            return Ok(OptimStep {
                grad_norm: 0.0,
                loss_scale_log2: self.loss_scale_log2(),
                updated: false,
                skipped_non_finite: true,
            });
        }

        if self.grad_clip > 0.0 && norm > self.grad_clip {
            scale_grads(&mut window, self.grad_clip / norm)?;
        }
        self.base.apply_update(&window)?;
        self.updates += 1;
        if let Some(scaler) = self.scaler.as_mut() {
            scaler.update(false);
        }
        debug!(norm, updates = self.updates, "optimizer update");

        Ok(OptimStep {
            grad_norm: norm,
            loss_scale_log2: self.loss_scale_log2(),
            updated: true,
            skipped_non_finite: false,
        })
    }

    // ── State ───────────────────────────────────────────────────────────────

    pub fn meta(&self) -> AmpMeta {
        let scaler = self.scaler.unwrap_or_default();
        AmpMeta {
            precision: self.precision,
            loss_scale: scaler.scale(),
            growth_tracker: scaler.growth_tracker(),
            accumulation_steps: self.accumulation_steps,
            counter: self.counter,
            updates: self.updates,
            skipped: self.skipped,
            optimizer: self.base.meta(),
        }
    }

    /// Moments plus the pending partial window.
    pub fn state_tensors(&self) -> Vec<(String, Tensor)> {
        let mut out = self.base.state_tensors();
        for (g, (name, _)) in self.pending.iter().zip(self.base.params()) {
            if let Some(g) = g {
                out.push((format!("{PENDING}{name}"), g.clone()));
            }
        }
        out
    }

    pub fn load(&mut self, meta: &AmpMeta, tensors: &HashMap<String, Tensor>) -> Result<()> {
        if meta.counter > 0 && meta.accumulation_steps != self.accumulation_steps {
            return Err(TrainError::StateShapeMismatch(format!(
                "open accumulation window of {}/{} cannot resume with {} steps",
                meta.counter, meta.accumulation_steps, self.accumulation_steps
            )));
        }
        let mut pending = vec![None; self.pending.len()];
        for (slot, (name, var)) in pending.iter_mut().zip(self.base.params()) {
            if let Some(t) = tensors.get(&format!("{PENDING}{name}")) {
                if t.dims() != var.dims() {
                    return Err(TrainError::StateShapeMismatch(format!(
                        "pending gradient of {name} has shape {:?}, parameter {:?}",
                        t.dims(),
                        var.dims()
                    )));
                }
                *slot = Some(t.to_device(var.device())?);
            }
        }
        self.base.load(&meta.optimizer, tensors)?;

        if meta.precision != self.precision {
            warn!(
                saved = ?meta.precision,
                current = ?self.precision,
                "precision changed since the checkpoint"
            );
        }
        if let Some(scaler) = self.scaler.as_mut() {
            if meta.precision.uses_loss_scaling() {
                scaler.scale = meta.loss_scale;
                scaler.growth_tracker = meta.growth_tracker;
            }
        }
        self.pending = pending;
        self.counter = meta.counter;
        self.updates = meta.updates;
        self.skipped = meta.skipped;
        Ok(())
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use candle_core::Device;

    use super::*;
    use crate::optim::build_param_groups;
    use moevar_common::OptimizerKind;

    fn setup(precision: Precision, accum: usize) -> (AmpOptimizer, Var) {
        let w = Var::from_tensor(&Tensor::new(&[[1.0f32, 2.0]], &Device::Cpu).unwrap()).unwrap();
        let named = vec![("w".to_string(), w.clone())];
        let mut groups = build_param_groups(&named, &[]);
        groups[0].lr = 0.1;
        let base = BaseOptimizer::new(OptimizerKind::Sgd { momentum: 0.0 }, named, groups);
        (AmpOptimizer::new(base, precision, 0.0, accum).unwrap(), w)
    }

    fn loss(w: &Var) -> Tensor {
        w.as_tensor().sum_all().unwrap()
    }

    fn values(w: &Var) -> Vec<f32> {
        w.as_tensor().flatten_all().unwrap().to_vec1::<f32>().unwrap()
    }

    #[test]
    fn four_calls_make_one_update() {
        let (mut opt, w) = setup(Precision::Fp32, 4);
        for _ in 0..3 {
            let s = opt.step(&loss(&w), &NoSync).unwrap();
            assert!(!s.updated);
            assert_eq!(s.loss_scale_log2, None);
        }
        assert_eq!(values(&w), vec![1.0, 2.0]);
        assert_eq!(opt.counter(), 3);
        assert!(opt.completes_window());

        let s = opt.step(&loss(&w), &NoSync).unwrap();
        assert!(s.updated);
        // Four micro-batches of d(sum)/dw = 1, averaged: grad = [1, 1].
        assert!((s.grad_norm - 2f64.sqrt()).abs() < 1e-6);
        let v = values(&w);
        assert!((v[0] - 0.9).abs() < 1e-6 && (v[1] - 1.9).abs() < 1e-6);
        assert_eq!(opt.counter(), 0);
        assert_eq!(opt.updates(), 1);
    }

    #[test]
    fn non_finite_on_window_close_is_absorbed() {
        let (mut opt, w) = setup(Precision::Fp16, 4);
        assert_eq!(opt.loss_scale_log2(), Some(11.0));
        for _ in 0..3 {
            opt.step(&loss(&w), &NoSync).unwrap();
        }
        let bad = w
            .as_tensor()
            .broadcast_mul(&Tensor::new(f32::INFINITY, &Device::Cpu).unwrap())
            .unwrap()
            .sum_all()
            .unwrap();
        let s = opt.step(&bad, &NoSync).unwrap();
        assert!(!s.updated);
        assert!(s.skipped_non_finite);
        assert_eq!(s.loss_scale_log2, Some(10.0));
        assert_eq!(opt.counter(), 0);
        assert_eq!(opt.updates(), 0);
        assert_eq!(opt.skipped(), 1);
        assert_eq!(values(&w), vec![1.0, 2.0]);

        // The next window starts clean.
        for _ in 0..4 {
            opt.step(&loss(&w), &NoSync).unwrap();
        }
        assert_eq!(opt.updates(), 1);
    }

    #[test]
    fn fp16_scale_is_removed_before_the_update() {
        let (mut opt, w) = setup(Precision::Fp16, 1);
        let s = opt.step(&loss(&w), &NoSync).unwrap();
        assert!(s.updated);
        assert!((s.grad_norm - 2f64.sqrt()).abs() < 1e-4);
        assert!((values(&w)[0] - 0.9).abs() < 1e-5);
    }

    #[test]
    fn scaler_grows_after_interval_and_caps() {
        let mut s = LossScaler::new();
        for _ in 0..LossScaler::GROWTH_INTERVAL {
            s.update(false);
        }
        assert_eq!(s.scale(), 4096.0);
        for _ in 0..10 * LossScaler::GROWTH_INTERVAL {
            s.update(false);
        }
        assert_eq!(s.scale(), LossScaler::MAX_SCALE);
        s.update(true);
        assert_eq!(s.scale(), LossScaler::MAX_SCALE / 2.0);
        assert_eq!(s.growth_tracker(), 0);
    }

    #[test]
    fn state_round_trip_keeps_open_window() {
        let (mut opt, w) = setup(Precision::Fp16, 4);
        opt.step(&loss(&w), &NoSync).unwrap();
        opt.step(&loss(&w), &NoSync).unwrap();
        let meta = opt.meta();
        let tensors: HashMap<String, Tensor> = opt.state_tensors().into_iter().collect();
        assert!(tensors.contains_key("optim.pending.w"));

        let (mut resumed, w2) = setup(Precision::Fp16, 4);
        resumed.load(&meta, &tensors).unwrap();
        assert_eq!(resumed.counter(), 2);
        assert_eq!(resumed.meta(), meta);
        resumed.step(&loss(&w2), &NoSync).unwrap();
        let s = resumed.step(&loss(&w2), &NoSync).unwrap();
        assert!(s.updated);

        let (mut other, _) = setup(Precision::Fp16, 2);
        assert!(matches!(
            other.load(&meta, &tensors),
            Err(TrainError::StateShapeMismatch(_))
        ));
    }
}
