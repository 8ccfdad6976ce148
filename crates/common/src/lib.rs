//! # moevar-common: Shared Primitives
//!
//! Types and utilities shared across every crate in the workspace:
//!
//! * **[`MoeVarConfig`]** / **[`TrainConfig`]**: model and run settings (JSON).
//! * **[`TrainError`]**: the error taxonomy of the training driver.
//! * **[`ResumableBatchSampler`]**: restartable rank-partitioned batch order.
//! * **[`DataLoader`]** / **[`EvalLoader`]**: image shards to host batches.
//! * **[`batch_to_tensors`]**: host batch → Candle tensors.

pub mod config;
pub mod data;
pub mod error;
pub mod pack;
pub mod sampler;

pub use config::{MoeVarConfig, OptimizerKind, Precision, ScheduleShape, TrainConfig};
pub use data::{
    batch_to_tensors, Augment, DataLoader, EvalLoader, HostBatch, ImageDataset,
    ImageShardDataset, ShardHeader, ShardWriter, SyntheticDataset, PREFETCH_BUFFER,
};
pub use error::{Result, TrainError};
pub use pack::pack_image_folder;
pub use sampler::{eval_partition, BatchDescriptor, ResumableBatchSampler, SamplerConfig};
