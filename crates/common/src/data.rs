//! Data pipeline: image shards, augmentation, prefetching loaders.
//!
//! * **[`ImageShardDataset`]**: zero-copy access to a `VQI1` shard via `memmap2`.
//! * **[`SyntheticDataset`]**: generated class-coloured images for debug runs.
//! * **[`DataLoader`]**: background thread that turns sampler output into
//!   ready [`HostBatch`]es, decoding samples on the rayon pool.
//! * **[`EvalLoader`]**: sequential, non-dropping pass over one rank's split.
//! * **[`batch_to_tensors`]**: host batch → Candle tensors.

use std::fs::File;
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;
use std::thread::JoinHandle;

use candle_core::{Device, Tensor};
use memmap2::Mmap;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;

use crate::error::{Result, TrainError};
use crate::sampler::ResumableBatchSampler;

/// Number of batches to prefetch so the training thread is not starved.
pub const PREFETCH_BUFFER: usize = 8;

// ── Shard format ────────────────────────────────────────────────────────────

/// Magic bytes of the image shard format.
const SHARD_MAGIC: &[u8; 4] = b"VQI1";
/// magic (4) + num_samples u64 (8) + channels, height, width, num_classes u32 (16).
const SHARD_HEADER_LEN: usize = 4 + 8 + 16;

/// Geometry stored in a shard header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardHeader {
    pub num_samples: usize,
    pub channels: usize,
    pub height: usize,
    pub width: usize,
    pub num_classes: usize,
}

impl ShardHeader {
    pub fn pixels_per_sample(&self) -> usize {
        self.channels * self.height * self.width
    }

    fn record_len(&self) -> usize {
        4 + self.pixels_per_sample()
    }
}

/// Streaming writer for a `VQI1` shard.
///
/// Layout: header, then per sample a u32 LE label followed by
/// `channels * height * width` u8 pixels in CHW order.
pub struct ShardWriter {
    file: BufWriter<File>,
    header: ShardHeader,
}

impl ShardWriter {
    pub fn create(
        path: &Path,
        channels: usize,
        height: usize,
        width: usize,
        num_classes: usize,
    ) -> Result<Self> {
        let mut file = BufWriter::new(File::create(path)?);
        let header = ShardHeader {
            num_samples: 0,
            channels,
            height,
            width,
            num_classes,
        };
        write_header(&mut file, &header)?;
        Ok(Self { file, header })
    }

    pub fn push(&mut self, label: u32, pixels: &[u8]) -> Result<()> {
        if pixels.len() != self.header.pixels_per_sample() {
            return Err(TrainError::Data(format!(
                "sample has {} bytes, shard expects {}",
                pixels.len(),
                self.header.pixels_per_sample()
            )));
        }
        if label as usize >= self.header.num_classes {
            return Err(TrainError::Data(format!(
                "label {label} out of range for {} classes",
                self.header.num_classes
            )));
        }
        self.file.write_all(&label.to_le_bytes())?;
        self.file.write_all(pixels)?;
        self.header.num_samples += 1;
        Ok(())
    }

    /// Patch the sample count into the header and flush to disk.
    pub fn finish(mut self) -> Result<ShardHeader> {
        self.file.seek(SeekFrom::Start(0))?;
        write_header(&mut self.file, &self.header)?;
        let file = self
            .file
            .into_inner()
            .map_err(|e| TrainError::Io(e.into_error()))?;
        file.sync_all()?;
        Ok(self.header)
    }
}

fn write_header(w: &mut impl Write, h: &ShardHeader) -> Result<()> {
    w.write_all(SHARD_MAGIC)?;
    w.write_all(&(h.num_samples as u64).to_le_bytes())?;
    for v in [h.channels, h.height, h.width, h.num_classes] {
        w.write_all(&(v as u32).to_le_bytes())?;
    }
    Ok(())
}

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[at..at + 4]);
    u32::from_le_bytes(buf)
}

// ── Datasets ────────────────────────────────────────────────────────────────

/// Random-access labelled image source.
pub trait ImageDataset: Send + Sync {
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
    fn num_classes(&self) -> usize;
    /// `(channels, height, width)`.
    fn image_shape(&self) -> (usize, usize, usize);
    /// Raw CHW pixels and label of sample `idx`.
    fn get(&self, idx: usize) -> Result<(Vec<u8>, u32)>;
}

/// Zero-copy dataset over a `VQI1` shard.
pub struct ImageShardDataset {
    mmap: Mmap,
    header: ShardHeader,
    path: PathBuf,
}

impl ImageShardDataset {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let mmap = unsafe { Mmap::map(&file)? };
        let bad = |reason: String| TrainError::Data(format!("{}: {reason}", path.display()));
        if mmap.len() < SHARD_HEADER_LEN {
            return Err(bad("shard too short".into()));
        }
        if &mmap[0..4] != SHARD_MAGIC {
            return Err(bad("bad magic".into()));
        }
        let mut n = [0u8; 8];
        n.copy_from_slice(&mmap[4..12]);
        let header = ShardHeader {
            num_samples: u64::from_le_bytes(n) as usize,
            channels: read_u32(&mmap, 12) as usize,
            height: read_u32(&mmap, 16) as usize,
            width: read_u32(&mmap, 20) as usize,
            num_classes: read_u32(&mmap, 24) as usize,
        };
        let expected = header
            .channels
            .checked_mul(header.height)
            .and_then(|p| p.checked_mul(header.width))
            .and_then(|p| p.checked_add(4))
            .and_then(|r| r.checked_mul(header.num_samples))
            .and_then(|b| b.checked_add(SHARD_HEADER_LEN))
            .ok_or_else(|| bad("header sizes overflow".into()))?;
        if mmap.len() < expected {
            return Err(bad(format!(
                "truncated: expected {expected} bytes, got {}",
                mmap.len()
            )));
        }
        Ok(Self {
            mmap,
            header,
            path: path.to_path_buf(),
        })
    }

    pub fn header(&self) -> &ShardHeader {
        &self.header
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ImageDataset for ImageShardDataset {
    fn len(&self) -> usize {
        self.header.num_samples
    }

    fn num_classes(&self) -> usize {
        self.header.num_classes
    }

    fn image_shape(&self) -> (usize, usize, usize) {
        (self.header.channels, self.header.height, self.header.width)
    }

    fn get(&self, idx: usize) -> Result<(Vec<u8>, u32)> {
        if idx >= self.header.num_samples {
            return Err(TrainError::Data(format!(
                "index {idx} out of range for {} samples",
                self.header.num_samples
            )));
        }
        let at = SHARD_HEADER_LEN + idx * self.header.record_len();
        let label = read_u32(&self.mmap, at);
        let pixels = self.mmap[at + 4..at + self.header.record_len()].to_vec();
        Ok((pixels, label))
    }
}

/// Deterministic generated images: each class has its own base colour plus
/// per-sample noise.
pub struct SyntheticDataset {
    len: usize,
    num_classes: usize,
    shape: (usize, usize, usize),
    seed: u64,
}

impl SyntheticDataset {
    pub fn new(len: usize, num_classes: usize, shape: (usize, usize, usize), seed: u64) -> Self {
        Self {
            len,
            num_classes: num_classes.max(1),
            shape,
            seed,
        }
    }
}

impl ImageDataset for SyntheticDataset {
    fn len(&self) -> usize {
        self.len
    }

    fn num_classes(&self) -> usize {
        self.num_classes
    }

    fn image_shape(&self) -> (usize, usize, usize) {
        self.shape
    }

    fn get(&self, idx: usize) -> Result<(Vec<u8>, u32)> {
        let label = (idx % self.num_classes) as u32;
        let (c, h, w) = self.shape;
        let mut rng = StdRng::seed_from_u64(self.seed ^ (idx as u64).wrapping_mul(0x9E37_79B9));
        let mut pixels = Vec::with_capacity(c * h * w);
        for ch in 0..c {
            let base = (label as usize * 67 + ch * 41) % 200;
            for _ in 0..h * w {
                pixels.push((base + rng.gen_range(0..48)) as u8);
            }
        }
        Ok((pixels, label))
    }
}

// ── Augmentation ────────────────────────────────────────────────────────────

/// Per-sample augmentation, seeded by `(seed, epoch, index)` so a resumed
/// run sees the same flips.
#[derive(Debug, Clone, Copy)]
pub struct Augment {
    pub hflip: bool,
    pub seed: u64,
}

impl Augment {
    pub fn none() -> Self {
        Self {
            hflip: false,
            seed: 0,
        }
    }

    fn apply(&self, pixels: &mut [u8], shape: (usize, usize, usize), epoch: usize, idx: usize) {
        if !self.hflip {
            return;
        }
        let seed = self.seed ^ ((epoch as u64) << 32) ^ idx as u64;
        if StdRng::seed_from_u64(seed).gen_bool(0.5) {
            let (_, _, w) = shape;
            for row in pixels.chunks_mut(w) {
                row.reverse();
            }
        }
    }
}

// ── Batches ─────────────────────────────────────────────────────────────────

/// Decoded batch in host memory; images normalised to `[-1, 1]`.
#[derive(Debug, Clone)]
pub struct HostBatch {
    pub epoch: usize,
    pub iteration: usize,
    pub images: Vec<f32>,
    pub labels: Vec<u32>,
    pub shape: (usize, usize, usize),
}

impl HostBatch {
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

fn assemble(
    dataset: &dyn ImageDataset,
    indices: &[usize],
    augment: Augment,
    epoch: usize,
    iteration: usize,
) -> Result<HostBatch> {
    let shape = dataset.image_shape();
    let samples = indices
        .par_iter()
        .map(|&idx| -> Result<(Vec<u8>, u32)> {
            let (mut pixels, label) = dataset.get(idx)?;
            augment.apply(&mut pixels, shape, epoch, idx);
            Ok((pixels, label))
        })
        .collect::<Result<Vec<_>>>()?;

    let per = shape.0 * shape.1 * shape.2;
    let mut images = Vec::with_capacity(per * samples.len());
    let mut labels = Vec::with_capacity(samples.len());
    for (pixels, label) in samples {
        images.extend(pixels.iter().map(|&p| p as f32 / 127.5 - 1.0));
        labels.push(label);
    }
    Ok(HostBatch {
        epoch,
        iteration,
        images,
        labels,
        shape,
    })
}

/// Convert a host batch to `(images (B,C,H,W) f32, labels (B,) u32)`.
pub fn batch_to_tensors(
    batch: &HostBatch,
    device: &Device,
) -> candle_core::Result<(Tensor, Tensor)> {
    let (c, h, w) = batch.shape;
    let images = Tensor::from_vec(batch.images.clone(), (batch.len(), c, h, w), device)?;
    let labels = Tensor::from_vec(batch.labels.clone(), batch.len(), device)?;
    Ok((images, labels))
}

// ── Training loader ─────────────────────────────────────────────────────────

/// Prefetching loader driven by a [`ResumableBatchSampler`].
///
/// A producer thread walks the sampler and keeps up to `prefetch` decoded
/// batches queued. [`DataLoader::set_epoch`] restarts the producer only when
/// the requested position differs from the one queued next.
pub struct DataLoader {
    dataset: Arc<dyn ImageDataset>,
    sampler: ResumableBatchSampler,
    augment: Augment,
    prefetch: usize,
    rx: Option<Receiver<Result<HostBatch>>>,
    worker: Option<JoinHandle<()>>,
    next_pos: (usize, usize),
}

impl DataLoader {
    pub fn new(
        dataset: Arc<dyn ImageDataset>,
        sampler: ResumableBatchSampler,
        augment: Augment,
        prefetch: usize,
    ) -> Self {
        let next_pos = sampler.position();
        let mut loader = Self {
            dataset,
            sampler,
            augment,
            prefetch: prefetch.max(1),
            rx: None,
            worker: None,
            next_pos,
        };
        loader.spawn();
        loader
    }

    pub fn iters_per_epoch(&self) -> usize {
        self.sampler.iters_per_epoch()
    }

    /// `(epoch, iteration)` the next batch belongs to.
    pub fn position(&self) -> (usize, usize) {
        self.next_pos
    }

    /// Align the stream with the start of `epoch` (or keep a mid-epoch
    /// resume position inside it).
    pub fn set_epoch(&mut self, epoch: usize) {
        if self.next_pos.0 == epoch {
            return;
        }
        self.shutdown();
        self.sampler.seek(epoch, 0);
        self.next_pos = (epoch, 0);
        self.spawn();
    }

    pub fn next_batch(&mut self) -> Result<HostBatch> {
        let rx = self
            .rx
            .as_ref()
            .ok_or_else(|| TrainError::Data("loader is shut down".into()))?;
        let batch = rx
            .recv()
            .map_err(|_| TrainError::Data("loader thread exited".into()))??;
        self.next_pos = if batch.iteration + 1 == self.sampler.iters_per_epoch() {
            (batch.epoch + 1, 0)
        } else {
            (batch.epoch, batch.iteration + 1)
        };
        Ok(batch)
    }

    fn spawn(&mut self) {
        let (tx, rx) = mpsc::sync_channel(self.prefetch);
        let dataset = Arc::clone(&self.dataset);
        let sampler = self.sampler.clone();
        let augment = self.augment;
        let handle = std::thread::spawn(move || {
            for desc in sampler {
                let batch = assemble(
                    dataset.as_ref(),
                    &desc.indices,
                    augment,
                    desc.epoch,
                    desc.iteration,
                );
                let failed = batch.is_err();
                if tx.send(batch).is_err() || failed {
                    break;
                }
            }
        });
        self.rx = Some(rx);
        self.worker = Some(handle);
    }

    fn shutdown(&mut self) {
        // Dropping the receiver wakes a producer blocked on a full queue.
        self.rx = None;
        if let Some(handle) = self.worker.take() {
            if handle.join().is_err() {
                tracing::warn!("data loader thread panicked");
            }
        }
    }
}

impl Drop for DataLoader {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ── Evaluation loader ───────────────────────────────────────────────────────

/// One ordered pass over `range`, keeping the final short batch.
pub struct EvalLoader {
    dataset: Arc<dyn ImageDataset>,
    range: Range<usize>,
    batch_size: usize,
    cursor: usize,
}

impl EvalLoader {
    pub fn new(dataset: Arc<dyn ImageDataset>, range: Range<usize>, batch_size: usize) -> Self {
        let cursor = range.start;
        Self {
            dataset,
            range,
            batch_size: batch_size.max(1),
            cursor,
        }
    }

    pub fn num_samples(&self) -> usize {
        self.range.len()
    }
}

impl Iterator for EvalLoader {
    type Item = Result<HostBatch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor >= self.range.end {
            return None;
        }
        let end = (self.cursor + self.batch_size).min(self.range.end);
        let indices: Vec<usize> = (self.cursor..end).collect();
        let iteration = (self.cursor - self.range.start) / self.batch_size;
        self.cursor = end;
        Some(assemble(
            self.dataset.as_ref(),
            &indices,
            Augment::none(),
            0,
            iteration,
        ))
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
