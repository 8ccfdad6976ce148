//! Epoch driver: the outer training loop.
//!
//! [`EpochDriver::prepare`] wires everything a rank needs (datasets,
//! frozen tokenizer, trainer, resume position, loader, schedules, sinks);
//! [`EpochDriver::run`] then iterates epochs:
//!
//! - per iteration: schedule → curriculum stage → `train_step` → telemetry
//! - per epoch: metric sync, best tracking, evaluation and checkpoint on
//!   cadence, ETA, and one JSON summary line in `<output>/log.txt`

use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use indicatif::{ProgressBar, ProgressStyle};
use tracing::{info, warn};

use moevar_common::{
    batch_to_tensors, eval_partition, Augment, DataLoader, EvalLoader, ImageDataset,
    ImageShardDataset, MoeVarConfig, ResumableBatchSampler, SamplerConfig, SyntheticDataset,
    TrainConfig, TrainError, PREFETCH_BUFFER,
};
use moevar_core::MultiScaleVq;

use crate::checkpoint::{agree_on_resume, auto_resume, save_on_leader, CheckpointRecord, FORMAT_VERSION};
use crate::dist::{Collective, DistContext};
use crate::metrics::{finish_time, format_duration, BestMetricsTracker, MetricLogger, TrainingTelemetry};
use crate::scheduler::{apply_schedule, ProgressiveSchedule, ScheduleConfig};
use crate::telemetry::{JsonlSink, NullSink, TelemetrySink};
use crate::trainer::{EvalOutcome, StepInput, Trainer, TrainerOptions, TRAIN_METRICS};

pub const TRAIN_SHARD: &str = "train.vqi";
pub const VAL_SHARD: &str = "val.vqi";
pub const LOG_FILE: &str = "log.txt";
pub const SCALARS_FILE: &str = "tb/scalars.jsonl";

/// Eval batches are this much larger than training batches.
const EVAL_BATCH_FACTOR: f64 = 1.5;

/// Outcome of a finished run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub start_epoch: usize,
    pub epochs_run: usize,
    pub global_step: usize,
    pub best: BestMetricsTracker,
}

struct ValSplit {
    dataset: Arc<dyn ImageDataset>,
    range: Range<usize>,
    batch_size: usize,
}

impl ValSplit {
    fn loader(&self) -> EvalLoader {
        EvalLoader::new(Arc::clone(&self.dataset), self.range.clone(), self.batch_size)
    }
}

/// Last-iteration values the epoch summary reports.
#[derive(Debug, Default, Clone, Copy)]
struct StepTail {
    tlr: f64,
    twd: f64,
    tnm: f64,
    loss_scale_log2: Option<f64>,
}

pub struct EpochDriver {
    args: TrainConfig,
    model_cfg: MoeVarConfig,
    ctx: DistContext,
    trainer: Trainer,
    loader: DataLoader,
    val: Option<ValSplit>,
    schedule: ScheduleConfig,
    prog: ProgressiveSchedule,
    start_epoch: usize,
    start_iteration: usize,
    best: BestMetricsTracker,
    sink: Box<dyn TelemetrySink>,
    /// Iteration wall times of the whole run, for the ETA.
    iter_times: MetricLogger,
}

impl EpochDriver {
    pub fn prepare(args: TrainConfig, model_cfg: MoeVarConfig, ctx: DistContext) -> anyhow::Result<Self> {
        model_cfg.validate()?;
        args.validate(ctx.world_size())?;
        let comm = ctx.comm();
        let device = ctx.device().clone();

        // ── Data ────────────────────────────────────────────────────────────
        let (train_ds, val_ds) = open_datasets(&args, &model_cfg)?;
        let local_bs = args.local_batch_size(ctx.world_size());
        info!(
            train = train_ds.len(),
            val = val_ds.as_ref().map_or(0, |d| d.len()),
            global_batch = args.global_batch_size,
            local_batch = local_bs,
            "datasets ready"
        );

        // ── Tokenizer ───────────────────────────────────────────────────────
        if ctx.is_local_master() && !args.vq_ckpt.exists() {
            if let Some(parent) = args.vq_ckpt.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)?;
            }
            MultiScaleVq::generate(&model_cfg, args.seed, &device)?.save(&args.vq_ckpt)?;
            info!(path = %args.vq_ckpt.display(), "generated tokenizer weights");
        }
        ctx.barrier()?;
        let tokenizer = MultiScaleVq::load(&args.vq_ckpt, &model_cfg, &device)?;

        // ── Trainer and resume ──────────────────────────────────────────────
        let opts = TrainerOptions::from_train(&args);
        let mut trainer = Trainer::build(&model_cfg, &opts, Box::new(tokenizer), Arc::clone(&comm), device.clone())?;

        let resumed = auto_resume(&args.output_dir, &device);
        let local_pos = resumed.as_ref().map_or((0, 0), |c| c.record.position());
        let (start_epoch, start_iteration) = agree_on_resume(comm.as_ref(), local_pos)?;
        let mut best = BestMetricsTracker::default();
        if let Some(ckpt) = resumed {
            warn_on_changed_args(&ckpt.record.args, &args);
            if ckpt.record.model_config != model_cfg {
                warn!("model configuration differs from the checkpoint");
            }
            trainer.load_state(&ckpt.record.trainer, &ckpt.tensors)?;
            best = ckpt.record.best;
        }

        // ── Loader ──────────────────────────────────────────────────────────
        let sampler = ResumableBatchSampler::new(
            SamplerConfig {
                dataset_len: train_ds.len(),
                global_batch_size: args.global_batch_size,
                world_size: ctx.world_size(),
                rank: ctx.rank(),
                seed: args.seed,
                shuffle: true,
                fill_last: args.fill_last,
            },
            start_epoch,
            start_iteration,
        )?;
        let augment_seed = if args.same_seed_for_all_ranks {
            args.seed
        } else {
            args.seed.wrapping_add(ctx.rank() as u64)
        };
        let augment = Augment {
            hflip: args.hflip,
            seed: augment_seed,
        };
        let loader = DataLoader::new(train_ds, sampler, augment, PREFETCH_BUFFER);
        let ipe = loader.iters_per_epoch();

        let val = val_ds.map(|dataset| ValSplit {
            range: eval_partition(dataset.len(), ctx.world_size(), ctx.rank()),
            batch_size: ((local_bs as f64 * EVAL_BATCH_FACTOR).round() as usize).max(1),
            dataset,
        });

        let schedule = ScheduleConfig::from_train(&args, ipe);
        let prog = ProgressiveSchedule::from_train(&args, ipe, model_cfg.num_stages());
        info!(
            peak_lr = schedule.base_lr,
            shape = %schedule.shape,
            warmup_steps = schedule.warmup_steps,
            total_steps = schedule.total_steps,
            iters_per_epoch = ipe,
            start_epoch,
            start_iteration,
            "schedule"
        );

        // ── Outputs ─────────────────────────────────────────────────────────
        let sink: Box<dyn TelemetrySink> = if ctx.is_master() {
            std::fs::create_dir_all(&args.output_dir)?;
            args.save(&args.output_dir.join("train_config.json"))?;
            model_cfg.save(&args.output_dir.join("model_config.json"))?;
            Box::new(JsonlSink::create(&args.output_dir.join(SCALARS_FILE))?)
        } else {
            Box::new(NullSink)
        };

        Ok(Self {
            args,
            model_cfg,
            ctx,
            trainer,
            loader,
            val,
            schedule,
            prog,
            start_epoch,
            start_iteration,
            best,
            sink,
            iter_times: MetricLogger::new(),
        })
    }

    pub fn trainer(&self) -> &Trainer {
        &self.trainer
    }

    pub fn start_position(&self) -> (usize, usize) {
        (self.start_epoch, self.start_iteration)
    }

    /// Train to `args.epochs`. Telemetry is flushed and closed however the
    /// loop ends.
    pub fn run(&mut self) -> anyhow::Result<RunSummary> {
        let result = self.run_epochs();
        self.sink.flush();
        self.sink.close();
        if let Err(e) = &result {
            tracing::error!(rank = self.ctx.rank(), "training stopped: {e:#}");
        }
        result
    }

    fn run_epochs(&mut self) -> anyhow::Result<RunSummary> {
        let run_start = Instant::now();
        let ipe = self.loader.iters_per_epoch();
        let epochs = self.args.epochs;
        let log_path = self.args.output_dir.join(LOG_FILE);
        info!(
            from = self.start_epoch,
            to = epochs,
            world_size = self.ctx.world_size(),
            "start training"
        );

        for ep in self.start_epoch..epochs {
            let epoch_start = Instant::now();
            self.loader.set_epoch(ep);
            let first_it = if ep == self.start_epoch { self.start_iteration } else { 0 };

            let (mut metrics, tail) = self.train_one_epoch(ep, first_it)?;
            metrics.sync(self.ctx.comm().as_ref(), TRAIN_METRICS)?;
            let (lm, lt) = (metrics.global_avg("Lm"), metrics.global_avg("Lt"));
            let (am, at) = (metrics.global_avg("Accm"), metrics.global_avg("Acct"));
            self.best.update_train(lm, lt, am, at);

            let mut summary = TrainingTelemetry {
                exp_name: self.args.exp_name.clone(),
                epoch: ep + 1,
                epochs,
                global_step: (ep + 1) * ipe,
                total_steps: epochs * ipe,
                iters_per_epoch: ipe,
                tlr: tail.tlr,
                twd: tail.twd,
                tnm: tail.tnm,
                loss_mean: lm,
                loss_tail: lt,
                acc_mean: am,
                acc_tail: at,
                moe_loss: metrics.global_avg("MoELoss"),
                skipped_updates: self.trainer.optimizer().skipped(),
                loss_scale_log2: tail.loss_scale_log2,
                ..Default::default()
            };

            let checkpoint_epoch = (ep + 1) % self.args.save_every.max(1) == 0 || ep + 1 == epochs;
            if checkpoint_epoch {
                let mut improved = false;
                let outcome = self.trainer.evaluate(self.val.as_ref().map(ValSplit::loader))?;
                match outcome {
                    EvalOutcome::Done(r) => {
                        improved = self.best.update_val(r.loss_mean, r.loss_tail, r.acc_mean, r.acc_tail);
                        summary.val_loss_mean = Some(r.loss_mean);
                        summary.val_loss_tail = Some(r.loss_tail);
                        summary.val_acc_mean = Some(r.acc_mean);
                        summary.val_acc_tail = Some(r.acc_tail);
                        summary.val_samples = Some(r.samples);
                        info!(
                            epoch = ep + 1,
                            samples = r.samples,
                            secs = format!("{:.2}", r.seconds),
                            "[val] Lm {:.4}  Lt {:.4}  Accm {:.2}  Acct {:.2}{}",
                            r.loss_mean,
                            r.loss_tail,
                            r.acc_mean,
                            r.acc_tail,
                            if improved { "  (best)" } else { "" }
                        );
                        self.sink.update(
                            (ep + 1) * ipe,
                            &[
                                ("val_Lm", r.loss_mean),
                                ("val_Lt", r.loss_tail),
                                ("val_Accm", r.acc_mean),
                                ("val_Acct", r.acc_tail),
                            ],
                        );
                    }
                    EvalOutcome::Skipped => info!(epoch = ep + 1, "no validation data; evaluation skipped"),
                }
                self.save(ep + 1, improved)?;
            }

            let iter_secs = self.iter_times.median("iter").unwrap_or(0.0);
            let remaining_iters = (epochs - ep - 1) * ipe;
            let remain = iter_secs * remaining_iters as f64;
            summary.epoch_seconds = epoch_start.elapsed().as_secs_f64();
            summary.remain_time = format_duration(remain);
            summary.finish_time = finish_time(remain);
            summary.best = Some(self.best.clone());

            info!(
                "[ep {}/{}] {}  remain {}  finish {}",
                ep + 1,
                epochs,
                metrics.format(&["Lm", "Lt", "Accm", "Acct", "MoELoss"]),
                summary.remain_time,
                summary.finish_time
            );
            if self.ctx.is_master() {
                summary.append_to(&log_path)?;
            }
            self.sink.flush();
        }

        let epochs_run = epochs.saturating_sub(self.start_epoch);
        info!(
            epochs_run,
            total = %format_duration(run_start.elapsed().as_secs_f64()),
            best_val_tail = self.best.val_loss_tail,
            "training finished"
        );
        self.ctx.barrier()?;
        Ok(RunSummary {
            start_epoch: self.start_epoch,
            epochs_run,
            global_step: epochs * ipe,
            best: self.best.clone(),
        })
    }

    fn train_one_epoch(&mut self, ep: usize, first_it: usize) -> anyhow::Result<(MetricLogger, StepTail)> {
        let ipe = self.loader.iters_per_epoch();
        let accum = self.args.grad_accum.max(1);
        let log_every = self.args.log_every.max(1);
        let device = self.ctx.device().clone();
        let mut metrics = MetricLogger::new();
        let mut tail = StepTail::default();

        let pb = if self.ctx.is_master() {
            ProgressBar::new(ipe.saturating_sub(first_it) as u64)
        } else {
            ProgressBar::hidden()
        };
        pb.set_style(
            ProgressStyle::default_bar()
                .template("[{elapsed_precise}] {bar:40} {pos}/{len} it  {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar()),
        );

        for it in first_it..ipe {
            let t0 = Instant::now();
            let g_it = ep * ipe + it;
            let batch = self.loader.next_batch()?;
            if (batch.epoch, batch.iteration) != (ep, it) {
                return Err(TrainError::Data(format!(
                    "loader produced batch {:?}, expected {:?}",
                    (batch.epoch, batch.iteration),
                    (ep, it)
                ))
                .into());
            }
            let (images, labels) = batch_to_tensors(&batch, &device)?;

            let sv = apply_schedule(&self.schedule, g_it, self.trainer.optimizer_mut().base_mut().groups_mut());
            let prog = self.prog.stage(g_it);
            let step = self.trainer.train_step(
                StepInput {
                    images: &images,
                    labels: &labels,
                    iteration: it,
                    global_step: g_it,
                    stepping: (g_it + 1) % accum == 0,
                    prog,
                },
                &mut metrics,
            )?;
            metrics.record("tlr", sv.lr_max);

            tail.tlr = sv.lr_max;
            tail.twd = sv.wd_max;
            if step.updated {
                tail.tnm = step.grad_norm;
            }
            tail.loss_scale_log2 = step.loss_scale_log2;

            let mut scalars: Vec<(&str, f64)> = ["Lm", "Lt", "Accm", "Acct", "MoELoss"]
                .iter()
                .filter_map(|&n| metrics.get(n).and_then(|m| m.last()).map(|v| (n, v)))
                .collect();
            scalars.extend([("tlr", sv.lr_max), ("twd", sv.wd_max)]);
            if step.updated {
                scalars.push(("tnm", step.grad_norm));
            }
            if let Some(s) = step.loss_scale_log2 {
                scalars.push(("scale_log2", s));
            }
            if let Some(p) = prog {
                scalars.push(("pg_stage", p.stage as f64));
            }
            self.sink.update(g_it, &scalars);

            self.iter_times.record("iter", t0.elapsed().as_secs_f64());
            pb.inc(1);
            if it % log_every == 0 || it + 1 == ipe {
                let line = metrics.format(TRAIN_METRICS);
                pb.set_message(line.clone());
                info!(
                    "[ep {}] [{:>5}/{}] {}  twd {:.4}{}",
                    ep + 1,
                    it,
                    ipe,
                    line,
                    sv.wd_max,
                    if step.skipped_non_finite { "  (non-finite, skipped)" } else { "" }
                );
            }
        }
        pb.finish_and_clear();
        Ok((metrics, tail))
    }

    /// Write the resume point `(epoch, 0)` and wait for every rank.
    fn save(&mut self, epoch: usize, improved: bool) -> anyhow::Result<()> {
        let (trainer_meta, tensors) = self.trainer.state();
        let record = CheckpointRecord {
            format_version: FORMAT_VERSION,
            epoch,
            iteration: 0,
            trainer: trainer_meta,
            args: self.args.clone(),
            model_config: self.model_cfg.clone(),
            best: self.best.clone(),
        };
        let comm: Arc<dyn Collective> = self.ctx.comm();
        save_on_leader(comm.as_ref(), &self.args.output_dir, &record, &tensors, improved)?;
        Ok(())
    }
}

/// Synthetic data under `local_debug`, shards under `data_path` otherwise.
/// A missing validation shard disables evaluation.
fn open_datasets(
    args: &TrainConfig,
    model_cfg: &MoeVarConfig,
) -> anyhow::Result<(Arc<dyn ImageDataset>, Option<Arc<dyn ImageDataset>>)> {
    let size = model_cfg.image_size();
    let shape = (model_cfg.image_channels, size, size);
    if args.local_debug {
        let train = SyntheticDataset::new(args.global_batch_size * 4, model_cfg.num_classes, shape, args.seed);
        let val = SyntheticDataset::new(args.global_batch_size * 2, model_cfg.num_classes, shape, args.seed + 1);
        return Ok((Arc::new(train), Some(Arc::new(val))));
    }

    let train = open_shard(&args.data_path.join(TRAIN_SHARD), shape, model_cfg.num_classes)?;
    let val_path = args.data_path.join(VAL_SHARD);
    let val = if val_path.exists() {
        Some(open_shard(&val_path, shape, model_cfg.num_classes)?)
    } else {
        warn!(path = %val_path.display(), "validation shard not found; evaluation disabled");
        None
    };
    Ok((train, val))
}

fn open_shard(
    path: &Path,
    shape: (usize, usize, usize),
    num_classes: usize,
) -> anyhow::Result<Arc<dyn ImageDataset>> {
    let ds = ImageShardDataset::open(path)?;
    if ds.image_shape() != shape {
        return Err(TrainError::config(format!(
            "{} holds {:?} images, model expects {shape:?}",
            path.display(),
            ds.image_shape()
        ))
        .into());
    }
    if ds.num_classes() > num_classes {
        return Err(TrainError::config(format!(
            "{} has {} classes, model has {num_classes}",
            path.display(),
            ds.num_classes()
        ))
        .into());
    }
    Ok(Arc::new(ds))
}

fn warn_on_changed_args(saved: &TrainConfig, live: &TrainConfig) {
    let (Ok(saved), Ok(live)) = (serde_json::to_value(saved), serde_json::to_value(live)) else {
        return;
    };
    let (Some(saved), Some(live)) = (saved.as_object(), live.as_object()) else {
        return;
    };
    for (key, now) in live {
        if let Some(before) = saved.get(key).filter(|b| *b != now) {
            warn!("argument {key} changed since the checkpoint: {before} -> {now}");
        }
    }
}

/// Default location of the tokenizer weights next to the run outputs.
pub fn default_vq_path(output_dir: &Path) -> PathBuf {
    output_dir.join("vq_ms.safetensors")
}
