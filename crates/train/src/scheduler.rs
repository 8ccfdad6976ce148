//! Learning-rate, weight-decay and progressive-resolution schedules.
//!
//! Everything here is a pure function of the global step, so a resumed run
//! recomputes exactly the values the interrupted run would have used.

use std::f64::consts::PI;

use moevar_common::{ScheduleShape, TrainConfig};

use crate::optim::ParamGroup;

/// Floor of the `exp` shape when the end fraction is 0 (`ln 0` is undefined).
const EXP_FLOOR: f64 = 1e-3;

// ── LR / WD ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct ScheduleConfig {
    pub shape: ScheduleShape,
    pub base_lr: f64,
    pub base_wd: f64,
    pub final_wd: f64,
    pub warmup_steps: usize,
    pub total_steps: usize,
    pub warmup_start_frac: f64,
    pub warmup_end_frac: f64,
}

impl ScheduleConfig {
    pub fn from_train(cfg: &TrainConfig, iters_per_epoch: usize) -> Self {
        let ipe = iters_per_epoch as f64;
        Self {
            shape: cfg.schedule,
            base_lr: cfg.peak_lr(),
            base_wd: cfg.weight_decay,
            final_wd: cfg.final_wd(),
            warmup_steps: (cfg.warmup_epochs() * ipe).round() as usize,
            total_steps: cfg.epochs * iters_per_epoch,
            warmup_start_frac: cfg.warmup_start_frac,
            warmup_end_frac: cfg.warmup_end_frac,
        }
    }
}

/// Learning rate and weight decay before per-group scaling.
pub fn lr_wd_at(cfg: &ScheduleConfig, step: usize) -> (f64, f64) {
    let lr = if step < cfg.warmup_steps {
        let wsf = cfg.warmup_start_frac;
        cfg.base_lr * (wsf + (1.0 - wsf) * step as f64 / cfg.warmup_steps as f64)
    } else {
        let span = cfg.total_steps as f64 - 1.0 - cfg.warmup_steps as f64;
        let p = if span > 0.0 {
            ((step - cfg.warmup_steps) as f64 / span).clamp(0.0, 1.0)
        } else {
            1.0
        };
        cfg.base_lr * decay_factor(cfg.shape, p, cfg.warmup_end_frac)
    };

    let last = cfg.total_steps.saturating_sub(1);
    let wd = if last == 0 {
        cfg.base_wd
    } else {
        let q = step.min(last) as f64 / last as f64;
        cfg.final_wd + (cfg.base_wd - cfg.final_wd) * (0.5 + 0.5 * (PI * q).cos())
    };
    (lr, wd)
}

/// Multiplier of the base LR at decay progress `p ∈ [0, 1]`.
fn decay_factor(shape: ScheduleShape, p: f64, end: f64) -> f64 {
    let linear = |t: f64| {
        if p < t {
            1.0
        } else {
            (1.0 - p) / (1.0 - t)
        }
    };
    let f = match shape {
        ScheduleShape::Cos => 0.5 + 0.5 * (PI * p).cos(),
        ScheduleShape::Lin => linear(0.15),
        ScheduleShape::Lin0 => linear(0.05),
        ScheduleShape::Lin00 => 1.0 - p,
        ScheduleShape::LinT(t) => linear(t),
        ScheduleShape::Exp => {
            const T: f64 = 0.15;
            if p < T {
                return 1.0;
            }
            let floor = if end > 0.0 { end } else { EXP_FLOOR };
            return ((p - T) / (1.0 - T) * floor.ln()).exp();
        }
    };
    end + (1.0 - end) * f
}

/// Range of the applied values over all groups.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduleValues {
    pub lr_min: f64,
    pub lr_max: f64,
    pub wd_min: f64,
    pub wd_max: f64,
}

/// Compute the schedule at `step` and write it into every group.
/// `wd_min` ignores groups whose decay is 0.
pub fn apply_schedule(cfg: &ScheduleConfig, step: usize, groups: &mut [ParamGroup]) -> ScheduleValues {
    let (lr, wd) = lr_wd_at(cfg, step);
    let mut out = ScheduleValues {
        lr_min: f64::INFINITY,
        lr_max: f64::NEG_INFINITY,
        wd_min: f64::INFINITY,
        wd_max: f64::NEG_INFINITY,
    };
    for g in groups.iter_mut() {
        g.lr = lr * g.lr_scale;
        g.weight_decay = wd * g.wd_scale;
        out.lr_min = out.lr_min.min(g.lr);
        out.lr_max = out.lr_max.max(g.lr);
        out.wd_max = out.wd_max.max(g.weight_decay);
        if g.weight_decay > 0.0 {
            out.wd_min = out.wd_min.min(g.weight_decay);
        }
    }
    if !out.lr_max.is_finite() {
        out.lr_min = lr;
        out.lr_max = lr;
    }
    if !out.wd_max.is_finite() {
        out.wd_max = wd;
    }
    if !out.wd_min.is_finite() {
        out.wd_min = out.wd_max;
    }
    out
}

// ── Progressive resolution ──────────────────────────────────────────────────

/// Active curriculum stage and the ramp weight of its newest tokens.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgStage {
    pub stage: usize,
    pub ramp: f64,
}

/// Progressive-resolution curriculum over token stages.
///
/// Supervision starts at stage `pg0`, grows towards the last stage until
/// `pg · max_steps`, and each newly added stage is faded in over
/// `ramp_steps`.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressiveSchedule {
    pub pg: f64,
    pub pg0: usize,
    pub last_stage: usize,
    pub warmup_steps: usize,
    pub max_steps: usize,
    pub ramp_steps: f64,
}

impl ProgressiveSchedule {
    pub fn from_train(cfg: &TrainConfig, iters_per_epoch: usize, num_stages: usize) -> Self {
        let ipe = iters_per_epoch as f64;
        Self {
            pg: cfg.pg,
            pg0: cfg.pg0,
            last_stage: num_stages.saturating_sub(1),
            warmup_steps: (cfg.warmup_epochs() * ipe).round() as usize,
            max_steps: cfg.epochs * iters_per_epoch,
            ramp_steps: cfg.pgwp_epochs() * ipe,
        }
    }

    fn end(&self) -> f64 {
        self.max_steps as f64 * self.pg
    }

    fn delta(&self) -> usize {
        self.last_stage.saturating_sub(self.pg0)
    }

    /// Stage index before the last-stage cutoff, or `None` when disabled.
    pub fn raw_stage(&self, step: usize) -> Option<usize> {
        if self.pg <= 0.0 {
            return None;
        }
        if step <= self.warmup_steps {
            return Some(self.pg0.min(self.last_stage));
        }
        if step as f64 >= self.end() {
            return Some(self.last_stage);
        }
        let span = self.end() - self.warmup_steps as f64;
        let progress = ((step - self.warmup_steps) as f64 / span).clamp(0.0, 1.0);
        Some(self.pg0 + (progress * self.delta() as f64).round() as usize)
    }

    /// First (fractional) step at which `stage` is active.
    fn stage_start(&self, stage: usize) -> f64 {
        let delta = self.delta().max(1) as f64;
        let need = (stage.saturating_sub(self.pg0) as f64 - 0.5) / delta;
        self.warmup_steps as f64 + need.max(0.0) * (self.end() - self.warmup_steps as f64)
    }

    /// Curriculum stage at `step`; `None` when disabled or once the last
    /// stage (full supervision) is reached.
    pub fn stage(&self, step: usize) -> Option<ProgStage> {
        let stage = self.raw_stage(step)?;
        if stage >= self.last_stage {
            return None;
        }
        let ramp = if stage <= self.pg0 || self.ramp_steps <= 0.0 {
            1.0
        } else {
            ((step as f64 - self.stage_start(stage)) / self.ramp_steps).clamp(0.01, 1.0)
        };
        Some(ProgStage { stage, ramp })
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
