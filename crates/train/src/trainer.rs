//! Trainer: one micro-batch step and a held-out evaluation pass.
//!
//! Decouples the compute graph (tokenize, forward, weighted loss) from the
//! optimisation step, which lives in [`AmpOptimizer`]. The trainer holds no
//! position state of its own: the driver passes iteration, global step and
//! curriculum stage in, and checkpoints carry only model and optimizer state.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use candle_core::{DType, Device, Tensor, Var, D};
use candle_nn::{ops, VarBuilder, VarMap};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use moevar_common::{
    batch_to_tensors, HostBatch, MoeVarConfig, OptimizerKind, Precision, TrainConfig, TrainError,
};
use moevar_core::{ArModel, MoeVar, VisualTokenizer};

use crate::amp::{AmpMeta, AmpOptimizer, OptimStep};
use crate::dist::{Collective, ModelWrapper};
use crate::metrics::MetricLogger;
use crate::optim::{build_param_groups, BaseOptimizer, NO_DECAY_KEYS};
use crate::scheduler::ProgStage;

/// Prefix of model parameters in a checkpoint.
pub const MODEL_PREFIX: &str = "model.";

/// Meters the trainer and driver record, in display order.
pub const TRAIN_METRICS: &[&str] = &["Lm", "Lt", "Accm", "Acct", "MoELoss", "tnm", "tlr"];

// ── Config ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct TrainerOptions {
    pub label_smoothing: f64,
    pub aux_weight: f64,
    pub grad_clip: f64,
    pub accumulation_steps: usize,
    pub precision: Precision,
    pub optimizer: OptimizerKind,
}

impl TrainerOptions {
    pub fn from_train(cfg: &TrainConfig) -> Self {
        Self {
            label_smoothing: cfg.label_smoothing,
            aux_weight: cfg.aux_weight,
            grad_clip: cfg.grad_clip,
            accumulation_steps: cfg.grad_accum,
            precision: cfg.precision,
            optimizer: cfg.optimizer,
        }
    }
}

/// One micro-batch as seen by [`Trainer::train_step`].
pub struct StepInput<'a> {
    /// `(B, C, H, W)` in `[-1, 1]`.
    pub images: &'a Tensor,
    /// `(B,)` u32 class ids.
    pub labels: &'a Tensor,
    pub iteration: usize,
    pub global_step: usize,
    /// The driver's view of whether this call closes an accumulation window.
    pub stepping: bool,
    pub prog: Option<ProgStage>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EvalResult {
    pub loss_mean: f64,
    pub loss_tail: f64,
    pub acc_mean: f64,
    pub acc_tail: f64,
    pub samples: f64,
    pub seconds: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EvalOutcome {
    /// No held-out data was supplied.
    Skipped,
    Done(EvalResult),
}

/// Trainer part of a checkpoint record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainerMeta {
    pub optimizer: AmpMeta,
}

// ── Eval mode guard ─────────────────────────────────────────────────────────

/// Puts the model in inference mode and restores the previous mode on drop.
pub struct EvalModeGuard<'a> {
    model: &'a dyn ArModel,
    previous: bool,
}

impl<'a> EvalModeGuard<'a> {
    pub fn new(model: &'a dyn ArModel) -> Self {
        let previous = model.is_training();
        model.set_training(false);
        Self { model, previous }
    }
}

impl Drop for EvalModeGuard<'_> {
    fn drop(&mut self) {
        self.model.set_training(self.previous);
    }
}

// ── Trainer ─────────────────────────────────────────────────────────────────

pub struct Trainer {
    model: ModelWrapper,
    tokenizer: Box<dyn VisualTokenizer>,
    optimizer: AmpOptimizer,
    varmap: VarMap,
    comm: Arc<dyn Collective>,
    device: Device,
    /// Token range `[begin, end)` of every stage.
    stage_bounds: Vec<(usize, usize)>,
    seq_len: usize,
    label_smoothing: f64,
    aux_weight: f64,
    stepping_warned: bool,
}

impl Trainer {
    /// Wrap an already-built model whose parameters live in `varmap`.
    pub fn new(
        model: Box<dyn ArModel>,
        varmap: VarMap,
        tokenizer: Box<dyn VisualTokenizer>,
        opts: &TrainerOptions,
        comm: Arc<dyn Collective>,
        device: Device,
    ) -> anyhow::Result<Self> {
        let params = named_params(&varmap)?;
        let total: usize = params.iter().map(|(_, v)| v.elem_count()).sum();

        let mut stage_bounds = Vec::with_capacity(tokenizer.patch_nums().len());
        let mut begin = 0;
        for pn in tokenizer.patch_nums() {
            stage_bounds.push((begin, begin + pn * pn));
            begin += pn * pn;
        }
        let seq_len = begin;

        let model = ModelWrapper::new(model, &params, Arc::clone(&comm))?;
        let groups = build_param_groups(&params, NO_DECAY_KEYS);
        for g in &groups {
            info!(group = %g.name, params = g.params.len(), wd_scale = g.wd_scale, "param group");
        }
        let base = BaseOptimizer::new(opts.optimizer, params, groups);
        let optimizer = AmpOptimizer::new(
            base,
            opts.precision,
            opts.grad_clip,
            opts.accumulation_steps,
        )?;
        info!(
            total_params = total,
            seq_len,
            distributed = model.is_distributed(),
            precision = ?opts.precision,
            "trainer ready"
        );

        Ok(Self {
            model,
            tokenizer,
            optimizer,
            varmap,
            comm,
            device,
            stage_bounds,
            seq_len,
            label_smoothing: opts.label_smoothing,
            aux_weight: opts.aux_weight,
            stepping_warned: false,
        })
    }

    /// Build the MoE model from `model_cfg` and wrap it.
    pub fn build(
        model_cfg: &MoeVarConfig,
        opts: &TrainerOptions,
        tokenizer: Box<dyn VisualTokenizer>,
        comm: Arc<dyn Collective>,
        device: Device,
    ) -> anyhow::Result<Self> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let model = MoeVar::new(vb, model_cfg)?;
        Self::new(Box::new(model), varmap, tokenizer, opts, comm, device)
    }

    pub fn optimizer(&self) -> &AmpOptimizer {
        &self.optimizer
    }

    pub fn optimizer_mut(&mut self) -> &mut AmpOptimizer {
        &mut self.optimizer
    }

    pub fn model(&self) -> &dyn ArModel {
        self.model.model()
    }

    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn stage_bounds(&self) -> &[(usize, usize)] {
        &self.stage_bounds
    }

    // ── Training ────────────────────────────────────────────────────────────

    /// Forward, weighted loss and one accumulating optimizer call.
    pub fn train_step(
        &mut self,
        input: StepInput<'_>,
        metrics: &mut MetricLogger,
    ) -> anyhow::Result<OptimStep> {
        let completes = self.optimizer.completes_window();
        if input.stepping != completes && !self.stepping_warned {
            warn!(
                iteration = input.iteration,
                global_step = input.global_step,
                driver = input.stepping,
                optimizer = completes,
                "accumulation window disagrees with the driver; following the optimizer"
            );
            self.stepping_warned = true;
        }

        let ids = self.tokenizer.encode(input.images)?;
        let teacher_forcing = self.tokenizer.teacher_forcing_input(&ids)?.detach();
        let targets = Tensor::cat(&ids, 1)?;
        let out = self.model.forward(input.labels, &teacher_forcing)?;

        let (ce, nll) = token_losses(&out.logits, &targets, self.label_smoothing)?;
        let weights = self.loss_weights(input.prog)?;
        let main = ce.broadcast_mul(&weights)?.sum(1)?.mean(0)?;
        let loss = (main + out.aux_loss.affine(self.aux_weight, 0.0)?)?;

        let step = self.optimizer.step(&loss, &self.model)?;

        let upto = match input.prog {
            Some(p) => self.stage_end(p.stage)?,
            None => self.seq_len,
        };
        let stats = token_stats(&nll, &out.logits, &targets, upto, self.tail())?;
        metrics.record("Lm", stats.loss_mean);
        metrics.record("Accm", stats.acc_mean);
        if input.prog.is_none() {
            metrics.record("Lt", stats.loss_tail);
            metrics.record("Acct", stats.acc_tail);
        }
        metrics.record("MoELoss", out.aux_loss.to_dtype(DType::F64)?.to_scalar::<f64>()?);
        if step.updated {
            metrics.record("tnm", step.grad_norm);
        }
        Ok(step)
    }

    fn stage_end(&self, stage: usize) -> anyhow::Result<usize> {
        self.stage_bounds
            .get(stage)
            .map(|&(_, end)| end)
            .ok_or_else(|| anyhow::anyhow!("curriculum stage {stage} does not exist"))
    }

    fn tail(&self) -> (usize, usize) {
        self.stage_bounds.last().copied().unwrap_or((0, self.seq_len))
    }

    /// `(1, L)` token weights: `1/L` each; under a curriculum stage the
    /// later stages are zeroed and the newest one is scaled by its ramp.
    fn loss_weights(&self, prog: Option<ProgStage>) -> anyhow::Result<Tensor> {
        let l = self.seq_len;
        let mut w = vec![1.0f32 / l as f32; l];
        if let Some(p) = prog {
            let (begin, end) = *self
                .stage_bounds
                .get(p.stage)
                .ok_or_else(|| anyhow::anyhow!("curriculum stage {} does not exist", p.stage))?;
            w[end..].iter_mut().for_each(|x| *x = 0.0);
            let ramp = p.ramp.clamp(0.0, 1.0) as f32;
            w[begin..end].iter_mut().for_each(|x| *x *= ramp);
        }
        Ok(Tensor::from_vec(w, (1, l), &self.device)?)
    }

    // ── Evaluation ──────────────────────────────────────────────────────────

    /// One pass over `loader`, reduced over every rank. `None` skips.
    pub fn evaluate<I>(&self, loader: Option<I>) -> anyhow::Result<EvalOutcome>
    where
        I: IntoIterator<Item = moevar_common::Result<HostBatch>>,
    {
        let Some(loader) = loader else {
            return Ok(EvalOutcome::Skipped);
        };
        let start = Instant::now();
        let _mode = EvalModeGuard::new(self.model.model());

        // Batch-size weighted sums of Lm, Lt, Accm, Acct, the count, then a
        // failure flag. Every rank reaches the reduction even after an error.
        let mut sums = [0.0f64; 6];
        let mut failure = None;
        for batch in loader {
            match self.eval_batch(batch) {
                Ok(Some((s, b))) => {
                    sums[0] += s.loss_mean * b;
                    sums[1] += s.loss_tail * b;
                    sums[2] += s.acc_mean * b;
                    sums[3] += s.acc_tail * b;
                    sums[4] += b;
                }
                Ok(None) => {}
                Err(e) => {
                    sums[5] = 1.0;
                    failure = Some(e);
                    break;
                }
            }
        }
        let reduced = self.comm.all_reduce_sum(&mut sums);
        if let Some(e) = failure {
            return Err(e);
        }
        reduced?;
        if sums[5] > 0.0 {
            return Err(TrainError::Collective(format!(
                "{} peer rank(s) failed during evaluation",
                sums[5] as usize
            ))
            .into());
        }

        let total = sums[4];
        let div = total.max(1.0);
        Ok(EvalOutcome::Done(EvalResult {
            loss_mean: sums[0] / div,
            loss_tail: sums[1] / div,
            acc_mean: sums[2] / div,
            acc_tail: sums[3] / div,
            samples: total,
            seconds: start.elapsed().as_secs_f64(),
        }))
    }

    fn eval_batch(
        &self,
        batch: moevar_common::Result<HostBatch>,
    ) -> anyhow::Result<Option<(TokenStats, f64)>> {
        let batch = batch?;
        if batch.is_empty() {
            return Ok(None);
        }
        let (images, labels) = batch_to_tensors(&batch, &self.device)?;
        let ids = self.tokenizer.encode(&images)?;
        let teacher_forcing = self.tokenizer.teacher_forcing_input(&ids)?;
        let targets = Tensor::cat(&ids, 1)?;
        let logits = self.model.forward(&labels, &teacher_forcing)?.logits.detach();
        let (_, nll) = token_losses(&logits, &targets, 0.0)?;
        let s = token_stats(&nll, &logits, &targets, self.seq_len, self.tail())?;
        Ok(Some((s, batch.len() as f64)))
    }

    // ── State ───────────────────────────────────────────────────────────────

    /// Checkpoint payload: JSON meta plus named tensors.
    pub fn state(&self) -> (TrainerMeta, Vec<(String, Tensor)>) {
        let mut tensors: Vec<(String, Tensor)> = self
            .optimizer
            .base()
            .params()
            .iter()
            .map(|(name, var)| (format!("{MODEL_PREFIX}{name}"), var.as_tensor().detach()))
            .collect();
        tensors.extend(self.optimizer.state_tensors());
        (
            TrainerMeta {
                optimizer: self.optimizer.meta(),
            },
            tensors,
        )
    }

    /// Restore [`state`](Self::state). Every shape is checked before any
    /// parameter is overwritten.
    pub fn load_state(
        &mut self,
        meta: &TrainerMeta,
        tensors: &HashMap<String, Tensor>,
    ) -> moevar_common::Result<()> {
        let mut restored = Vec::with_capacity(self.optimizer.base().params().len());
        for (name, var) in self.optimizer.base().params() {
            let key = format!("{MODEL_PREFIX}{name}");
            let t = tensors
                .get(&key)
                .ok_or_else(|| TrainError::StateShapeMismatch(format!("missing {key}")))?;
            if t.dims() != var.dims() {
                return Err(TrainError::StateShapeMismatch(format!(
                    "{key} has shape {:?}, model {:?}",
                    t.dims(),
                    var.dims()
                )));
            }
            restored.push((var.clone(), t.to_dtype(var.dtype())?.to_device(var.device())?));
        }
        self.optimizer.load(&meta.optimizer, tensors)?;
        for (var, t) in restored {
            var.set(&t)?;
        }
        Ok(())
    }
}

/// Parameters of `varmap` sorted by name.
pub fn named_params(varmap: &VarMap) -> anyhow::Result<Vec<(String, Var)>> {
    let data = varmap
        .data()
        .lock()
        .map_err(|_| anyhow::anyhow!("parameter map lock poisoned"))?;
    let mut params: Vec<(String, Var)> = data.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
    params.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(params)
}

// ── Loss ────────────────────────────────────────────────────────────────────

/// Per-token `(smoothed CE, plain NLL)`, both `(B, L)`.
fn token_losses(
    logits: &Tensor,
    targets: &Tensor,
    smoothing: f64,
) -> candle_core::Result<(Tensor, Tensor)> {
    let (b, l, v) = logits.dims3()?;
    let log_probs = ops::log_softmax(&logits.reshape((b * l, v))?, D::Minus1)?;
    let nll = log_probs
        .gather(&targets.reshape((b * l, 1))?, 1)?
        .squeeze(1)?
        .neg()?;
    let ce = if smoothing > 0.0 {
        let uniform = log_probs.mean(D::Minus1)?.neg()?;
        (nll.affine(1.0 - smoothing, 0.0)? + uniform.affine(smoothing, 0.0)?)?
    } else {
        nll.clone()
    };
    Ok((ce.reshape((b, l))?, nll.reshape((b, l))?))
}

struct TokenStats {
    loss_mean: f64,
    loss_tail: f64,
    acc_mean: f64,
    acc_tail: f64,
}

/// Mean NLL and top-1 accuracy (percent) over tokens `[0, upto)` and over
/// the `tail` range.
fn token_stats(
    nll: &Tensor,
    logits: &Tensor,
    targets: &Tensor,
    upto: usize,
    tail: (usize, usize),
) -> candle_core::Result<TokenStats> {
    let nll = nll.detach().to_dtype(DType::F32)?.to_vec2::<f32>()?;
    let pred = logits.detach().argmax(D::Minus1)?.to_vec2::<u32>()?;
    let tgt = targets.to_vec2::<u32>()?;

    let (mut loss_all, mut loss_tail, mut hit_all, mut hit_tail) = (0.0f64, 0.0f64, 0usize, 0usize);
    for ((n, p), t) in nll.iter().zip(&pred).zip(&tgt) {
        for j in 0..upto {
            loss_all += n[j] as f64;
            hit_all += usize::from(p[j] == t[j]);
        }
        for j in tail.0..tail.1 {
            loss_tail += n[j] as f64;
            hit_tail += usize::from(p[j] == t[j]);
        }
    }
    let rows = nll.len().max(1) as f64;
    let n_all = rows * upto.max(1) as f64;
    let n_tail = rows * (tail.1 - tail.0).max(1) as f64;
    Ok(TokenStats {
        loss_mean: loss_all / n_all,
        loss_tail: loss_tail / n_tail,
        acc_mean: 100.0 * hit_all as f64 / n_all,
        acc_tail: 100.0 * hit_tail as f64 / n_tail,
    })
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use moevar_common::{eval_partition, EvalLoader, ImageDataset, SyntheticDataset};
    use moevar_core::MultiScaleVq;

    use super::*;
    use crate::dist::{LocalGroup, SingleProcess};

    fn opts(precision: Precision, accum: usize) -> TrainerOptions {
        TrainerOptions {
            label_smoothing: 0.1,
            aux_weight: 0.01,
            grad_clip: 2.0,
            accumulation_steps: accum,
            precision,
            optimizer: OptimizerKind::default(),
        }
    }

    fn tiny_trainer(comm: Arc<dyn Collective>, opts: &TrainerOptions) -> Trainer {
        let cfg = MoeVarConfig::tiny();
        let vq = MultiScaleVq::generate(&cfg, 0, &Device::Cpu).unwrap();
        let mut t = Trainer::build(&cfg, opts, Box::new(vq), comm, Device::Cpu).unwrap();
        for g in t.optimizer_mut().base_mut().groups_mut() {
            g.lr = 1e-3;
        }
        t
    }

    fn batch(b: usize) -> (Tensor, Tensor) {
        let s = MoeVarConfig::tiny().image_size();
        let images = Tensor::rand(-1f32, 1f32, (b, 3, s, s), &Device::Cpu).unwrap();
        let labels = Tensor::from_vec((0..b as u32).map(|i| i % 4).collect(), b, &Device::Cpu).unwrap();
        (images, labels)
    }

    fn step_input<'a>(images: &'a Tensor, labels: &'a Tensor, it: usize, prog: Option<ProgStage>) -> StepInput<'a> {
        StepInput {
            images,
            labels,
            iteration: it,
            global_step: it,
            stepping: true,
            prog,
        }
    }

    fn synthetic() -> Arc<dyn ImageDataset> {
        let s = MoeVarConfig::tiny().image_size();
        Arc::new(SyntheticDataset::new(10, 4, (3, s, s), 7))
    }

    #[test]
    fn train_step_records_metrics_and_updates() {
        let mut trainer = tiny_trainer(Arc::new(SingleProcess), &opts(Precision::Fp32, 1));
        let (images, labels) = batch(2);
        let mut metrics = MetricLogger::new();
        let before = trainer.optimizer().base().params()[0].1.as_tensor().flatten_all().unwrap().to_vec1::<f32>().unwrap();

        let step = trainer.train_step(step_input(&images, &labels, 0, None), &mut metrics).unwrap();
        assert!(step.updated);
        assert!(step.grad_norm > 0.0 && step.grad_norm.is_finite());
        assert_eq!(step.loss_scale_log2, None);
        for name in ["Lm", "Lt", "Accm", "Acct", "MoELoss", "tnm"] {
            assert!(metrics.global_avg(name).is_some(), "missing {name}");
        }
        let lm = metrics.global_avg("Lm").unwrap();
        // Near-uniform logits at init: about ln(vocab).
        assert!(lm > 1.0 && lm < 10.0);

        let after = trainer.optimizer().base().params()[0].1.as_tensor().flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert_ne!(before, after);
    }

    #[test]
    fn curriculum_skips_tail_metrics() {
        let mut trainer = tiny_trainer(Arc::new(SingleProcess), &opts(Precision::Fp32, 1));
        let (images, labels) = batch(2);
        let mut metrics = MetricLogger::new();
        let prog = Some(ProgStage { stage: 1, ramp: 0.5 });
        trainer.train_step(step_input(&images, &labels, 0, prog), &mut metrics).unwrap();
        assert!(metrics.global_avg("Lm").is_some());
        assert!(metrics.global_avg("Lt").is_none());
        assert!(metrics.global_avg("Acct").is_none());

        let w = trainer.loss_weights(prog).unwrap().flatten_all().unwrap().to_vec1::<f32>().unwrap();
        // tiny: stages [0,1), [1,5), [5,14)
        let l = 14.0f32;
        assert!((w[0] - 1.0 / l).abs() < 1e-7);
        assert!((w[1] - 0.5 / l).abs() < 1e-7);
        assert!(w[5..].iter().all(|&x| x == 0.0));
    }

    #[test]
    fn driver_and_optimizer_disagreement_is_tolerated() {
        let mut trainer = tiny_trainer(Arc::new(SingleProcess), &opts(Precision::Fp32, 2));
        let (images, labels) = batch(2);
        let mut metrics = MetricLogger::new();
        // Driver claims the first call steps; the optimizer window of 2 wins.
        let step = trainer.train_step(step_input(&images, &labels, 0, None), &mut metrics).unwrap();
        assert!(!step.updated);
        let step = trainer.train_step(step_input(&images, &labels, 1, None), &mut metrics).unwrap();
        assert!(step.updated);
    }

    #[test]
    fn evaluate_skips_without_data_and_restores_mode() {
        let trainer = tiny_trainer(Arc::new(SingleProcess), &opts(Precision::Fp32, 1));
        let none: Option<Vec<moevar_common::Result<HostBatch>>> = None;
        assert_eq!(trainer.evaluate(none).unwrap(), EvalOutcome::Skipped);

        assert!(trainer.model().is_training());
        let failing = vec![Err(TrainError::Data("boom".into()))];
        assert!(trainer.evaluate(Some(failing)).is_err());
        assert!(trainer.model().is_training());

        let loader = EvalLoader::new(synthetic(), 0..10, 3);
        let EvalOutcome::Done(r) = trainer.evaluate(Some(loader)).unwrap() else {
            panic!("evaluation skipped");
        };
        assert_eq!(r.samples, 10.0);
        assert!(r.loss_mean.is_finite() && (0.0..=100.0).contains(&r.acc_mean));
        assert!(trainer.model().is_training());
    }

    #[test]
    fn state_round_trip_restores_params_counter_and_scale() {
        let o = opts(Precision::Fp16, 4);
        let mut a = tiny_trainer(Arc::new(SingleProcess), &o);
        let (images, labels) = batch(2);
        let mut metrics = MetricLogger::new();
        for it in 0..6 {
            a.train_step(step_input(&images, &labels, it, None), &mut metrics).unwrap();
        }
        let (meta, tensors) = a.state();
        let tensors: HashMap<String, Tensor> = tensors.into_iter().collect();

        let mut b = tiny_trainer(Arc::new(SingleProcess), &o);
        b.load_state(&meta, &tensors).unwrap();
        assert_eq!(b.optimizer().counter(), 2);
        assert_eq!(b.optimizer().loss_scale(), a.optimizer().loss_scale());
        assert_eq!(b.optimizer().meta(), a.optimizer().meta());
        for ((na, va), (nb, vb)) in a.optimizer().base().params().iter().zip(b.optimizer().base().params()) {
            assert_eq!(na, nb);
            let x = va.as_tensor().flatten_all().unwrap().to_vec1::<f32>().unwrap();
            let y = vb.as_tensor().flatten_all().unwrap().to_vec1::<f32>().unwrap();
            assert_eq!(x, y, "{na}");
        }

        let wide = MoeVarConfig {
            depth: 2,
            ..MoeVarConfig::tiny()
        };
        let vq = MultiScaleVq::generate(&wide, 0, &Device::Cpu).unwrap();
        let mut c = Trainer::build(&wide, &o, Box::new(vq), Arc::new(SingleProcess), Device::Cpu).unwrap();
        let err = c.load_state(&meta, &tensors).unwrap_err();
        assert!(matches!(err, TrainError::StateShapeMismatch(_)));
    }

    #[test]
    fn eval_failure_on_one_rank_fails_every_rank() {
        let o = opts(Precision::Fp32, 1);
        let handles: Vec<_> = LocalGroup::new(2)
            .into_iter()
            .map(|comm| {
                let o = o.clone();
                std::thread::spawn(move || {
                    let rank = comm.rank();
                    let comm: Arc<dyn Collective> = Arc::new(comm);
                    let t = tiny_trainer(comm, &o);
                    let range = eval_partition(10, 2, rank);
                    let batches: Vec<moevar_common::Result<HostBatch>> = if rank == 1 {
                        vec![Err(TrainError::Data("unreadable record".into()))]
                    } else {
                        EvalLoader::new(synthetic(), range, 2).collect()
                    };
                    let res = t.evaluate(Some(batches));
                    (rank, res.map_err(|e| e.to_string()), t.model().is_training())
                })
            })
            .collect();
        for h in handles {
            let (rank, res, training) = h.join().unwrap();
            let err = res.expect_err("every rank must fail");
            if rank == 1 {
                assert!(err.contains("unreadable record"), "{err}");
            } else {
                assert!(err.contains("failed during evaluation"), "{err}");
            }
            assert!(training);
        }
    }

    #[test]
    fn two_rank_evaluation_matches_single_rank() {
        let o = opts(Precision::Fp32, 1);
        let reference = tiny_trainer(Arc::new(SingleProcess), &o);
        let (meta, tensors) = reference.state();
        let tensors: HashMap<String, Tensor> = tensors.into_iter().collect();
        let EvalOutcome::Done(single) = reference
            .evaluate(Some(EvalLoader::new(synthetic(), 0..10, 3)))
            .unwrap()
        else {
            panic!("evaluation skipped");
        };

        let handles: Vec<_> = LocalGroup::new(2)
            .into_iter()
            .map(|comm| {
                let meta = meta.clone();
                let tensors = tensors.clone();
                let o = o.clone();
                std::thread::spawn(move || {
                    let rank = comm.rank();
                    let comm: Arc<dyn Collective> = Arc::new(comm);
                    let mut t = tiny_trainer(comm, &o);
                    t.load_state(&meta, &tensors).unwrap();
                    let range = eval_partition(10, 2, rank);
                    match t.evaluate(Some(EvalLoader::new(synthetic(), range, 2))).unwrap() {
                        EvalOutcome::Done(r) => r,
                        EvalOutcome::Skipped => panic!("evaluation skipped"),
                    }
                })
            })
            .collect();
        for h in handles {
            let r = h.join().unwrap();
            assert_eq!(r.samples, 10.0);
            assert!((r.acc_mean - single.acc_mean).abs() < 1e-6);
            assert!((r.acc_tail - single.acc_tail).abs() < 1e-6);
            assert!((r.loss_mean - single.loss_mean).abs() < 1e-5);
            assert!((r.loss_tail - single.loss_tail).abs() < 1e-5);
        }
    }
}
