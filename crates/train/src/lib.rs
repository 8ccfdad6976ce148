//! # moevar-train: Distributed Training Driver
//!
//! Everything between a dataset and a checkpoint file:
//!
//! * **[`EpochDriver`]**: the outer loop with schedules, evaluation and checkpoint
//!   cadence, best tracking, ETA and per-epoch summaries.
//! * **[`Trainer`]**: one micro-batch step (tokenize → forward → weighted
//!   loss) and a rank-reduced evaluation pass.
//! * **[`AmpOptimizer`]**: gradient accumulation, dynamic loss scaling,
//!   clipping and non-finite skipping around a [`BaseOptimizer`].
//! * **[`ScheduleConfig`]** / **[`ProgressiveSchedule`]**: LR/WD warmup and
//!   decay, progressive-resolution curriculum.
//! * **[`Collective`]**: barrier, sum-reduce and broadcast over a process
//!   group (single process, in-process threads, or TCP).
//! * **[`checkpoint`]**: atomic safetensors checkpoints and auto-resume.

pub mod amp;
pub mod checkpoint;
pub mod dist;
pub mod driver;
pub mod metrics;
pub mod optim;
pub mod scheduler;
pub mod telemetry;
pub mod trainer;

pub use amp::{AmpMeta, AmpOptimizer, GradientSync, LossScaler, OptimStep};
pub use checkpoint::{auto_resume, inspect, CheckpointKind, CheckpointRecord, LoadedCheckpoint};
pub use dist::{Collective, DistContext, LocalGroup, ModelWrapper, SingleProcess, TcpConfig, TcpGroup};
pub use driver::{EpochDriver, RunSummary};
pub use metrics::{BestMetricsTracker, MetricLogger, SmoothedValue, TrainingTelemetry};
pub use optim::{BaseOptimizer, ParamGroup};
pub use scheduler::{lr_wd_at, ProgStage, ProgressiveSchedule, ScheduleConfig};
pub use telemetry::{JsonlSink, NullSink, TelemetrySink};
pub use trainer::{EvalOutcome, EvalResult, StepInput, Trainer, TrainerOptions};
