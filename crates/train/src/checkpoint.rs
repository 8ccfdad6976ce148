//! Checkpoint files and auto-resume.
//!
//! A checkpoint is a single safetensors file. Tensors hold the model
//! parameters and optimizer moments; the JSON [`CheckpointRecord`] rides in
//! the safetensors `__metadata__` map, so the resume scan reads headers only.
//!
//! Files are `<dir>/ar-ckpt-last.safetensors` and
//! `<dir>/ar-ckpt-best.safetensors`. Writes go through a hidden temporary
//! file and a rename, so a crash never leaves a half-written `last`.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};

use candle_core::{Device, Tensor};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use moevar_common::{MoeVarConfig, Result, TrainConfig, TrainError};

use crate::dist::Collective;
use crate::metrics::BestMetricsTracker;
use crate::trainer::TrainerMeta;

pub const CKPT_TAG: &str = "ar-ckpt";
pub const FORMAT_VERSION: u32 = 1;

const RECORD_KEY: &str = "record";
const METADATA_KEY: &str = "__metadata__";
/// Upper bound on a safetensors header we are willing to parse.
const MAX_HEADER_BYTES: u64 = 100 << 20;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub format_version: u32,
    /// Epoch to resume at.
    pub epoch: usize,
    /// Iteration within `epoch` to resume at.
    pub iteration: usize,
    pub trainer: TrainerMeta,
    pub args: TrainConfig,
    pub model_config: MoeVarConfig,
    pub best: BestMetricsTracker,
}

impl CheckpointRecord {
    pub fn position(&self) -> (usize, usize) {
        (self.epoch, self.iteration)
    }
}

pub struct LoadedCheckpoint {
    pub path: PathBuf,
    pub record: CheckpointRecord,
    pub tensors: HashMap<String, Tensor>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointKind {
    Last,
    Best,
}

impl CheckpointKind {
    fn suffix(self) -> &'static str {
        match self {
            Self::Last => "last",
            Self::Best => "best",
        }
    }
}

pub fn checkpoint_path(dir: &Path, kind: CheckpointKind) -> PathBuf {
    dir.join(format!("{CKPT_TAG}-{}.safetensors", kind.suffix()))
}

fn temp_path(target: &Path) -> PathBuf {
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    target.with_file_name(format!(".{name}.tmp"))
}

fn replace_atomically(tmp: &Path, target: &Path) -> Result<()> {
    File::open(tmp)?.sync_all()?;
    fs::rename(tmp, target)?;
    // Persist the directory entry so the rename survives a crash.
    if let Some(parent) = target.parent().filter(|p| !p.as_os_str().is_empty()) {
        sync_dir(parent)?;
    }
    Ok(())
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> Result<()> {
    File::open(dir)?.sync_all()?;
    Ok(())
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> Result<()> {
    Ok(())
}

// ── Save ────────────────────────────────────────────────────────────────────

/// Write `last`, and copy it to `best` when `is_best`. Only the caller's
/// writer rank should call this.
pub fn save_checkpoint(
    dir: &Path,
    record: &CheckpointRecord,
    tensors: &[(String, Tensor)],
    is_best: bool,
) -> Result<PathBuf> {
    fs::create_dir_all(dir)?;
    let last = checkpoint_path(dir, CheckpointKind::Last);
    let tmp = temp_path(&last);

    let mut metadata = HashMap::new();
    metadata.insert(RECORD_KEY.to_string(), serde_json::to_string(record)?);
    let data = tensors.iter().map(|(name, t)| (name.as_str(), t));
    safetensors::serialize_to_file(data, &Some(metadata), &tmp)?;
    replace_atomically(&tmp, &last)?;
    info!(path = %last.display(), epoch = record.epoch, iteration = record.iteration, "checkpoint saved");

    if is_best {
        let best = checkpoint_path(dir, CheckpointKind::Best);
        let tmp = temp_path(&best);
        fs::copy(&last, &tmp)?;
        replace_atomically(&tmp, &best)?;
        info!(path = %best.display(), "best checkpoint updated");
    }
    Ok(last)
}

/// Leader writes, every rank then waits so nobody races ahead of the file.
pub fn save_on_leader(
    comm: &dyn Collective,
    dir: &Path,
    record: &CheckpointRecord,
    tensors: &[(String, Tensor)],
    is_best: bool,
) -> Result<()> {
    let written = if comm.rank() == 0 {
        save_checkpoint(dir, record, tensors, is_best).map(|_| ())
    } else {
        Ok(())
    };
    // A failed write still reaches the barrier so the other ranks are not
    // left waiting on it.
    let barrier = comm.barrier();
    written.and(barrier)
}

// ── Load ────────────────────────────────────────────────────────────────────

fn read_header(path: &Path) -> Result<serde_json::Value> {
    let mut file = File::open(path)?;
    let mut len = [0u8; 8];
    file.read_exact(&mut len)
        .map_err(|e| TrainError::corrupt(path, format!("header length: {e}")))?;
    let len = u64::from_le_bytes(len);
    if len == 0 || len > MAX_HEADER_BYTES {
        return Err(TrainError::corrupt(path, format!("implausible header length {len}")));
    }
    let mut buf = vec![0u8; len as usize];
    file.read_exact(&mut buf)
        .map_err(|e| TrainError::corrupt(path, format!("truncated header: {e}")))?;
    serde_json::from_slice(&buf).map_err(|e| TrainError::corrupt(path, e))
}

fn record_from_header(path: &Path, header: &serde_json::Value) -> Result<CheckpointRecord> {
    let raw = header
        .get(METADATA_KEY)
        .and_then(|m| m.get(RECORD_KEY))
        .and_then(|r| r.as_str())
        .ok_or_else(|| TrainError::corrupt(path, "no training record in header"))?;
    let record: CheckpointRecord =
        serde_json::from_str(raw).map_err(|e| TrainError::corrupt(path, e))?;
    if record.format_version != FORMAT_VERSION {
        return Err(TrainError::corrupt(
            path,
            format!("format version {} (expected {FORMAT_VERSION})", record.format_version),
        ));
    }
    Ok(record)
}

/// The embedded record, without touching tensor data.
pub fn read_record(path: &Path) -> Result<CheckpointRecord> {
    let header = read_header(path)?;
    record_from_header(path, &header)
}

/// Record plus the number of stored tensors.
pub fn inspect(path: &Path) -> Result<(CheckpointRecord, usize)> {
    let header = read_header(path)?;
    let record = record_from_header(path, &header)?;
    let count = header
        .as_object()
        .map(|m| m.keys().filter(|k| *k != METADATA_KEY).count())
        .unwrap_or(0);
    Ok((record, count))
}

pub fn load_checkpoint(path: &Path, device: &Device) -> Result<LoadedCheckpoint> {
    let record = read_record(path)?;
    let tensors =
        candle_core::safetensors::load(path, device).map_err(|e| TrainError::corrupt(path, e))?;
    Ok(LoadedCheckpoint {
        path: path.to_path_buf(),
        record,
        tensors,
    })
}

/// Checkpoint files in `dir`, newest position first; `last` wins ties.
fn candidates(dir: &Path) -> Vec<(PathBuf, Option<CheckpointRecord>)> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };
    let prefix = format!("{CKPT_TAG}-");
    let mut found: Vec<(PathBuf, Option<CheckpointRecord>)> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with(&prefix) && n.ends_with(".safetensors"))
        })
        .map(|p| match read_record(&p) {
            Ok(r) => (p, Some(r)),
            Err(e) => {
                warn!("skipping checkpoint: {e}");
                (p, None)
            }
        })
        .collect();

    let key = |(p, r): &(PathBuf, Option<CheckpointRecord>)| {
        let is_last = p
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.contains("-last"));
        (r.as_ref().map(CheckpointRecord::position), is_last)
    };
    found.sort_by(|a, b| key(b).cmp(&key(a)));
    found
}

/// Newest loadable checkpoint in `dir`, or `None` for a cold start.
pub fn auto_resume(dir: &Path, device: &Device) -> Option<LoadedCheckpoint> {
    for (path, record) in candidates(dir) {
        if record.is_none() {
            continue;
        }
        match load_checkpoint(&path, device) {
            Ok(ckpt) => {
                info!(
                    path = %path.display(),
                    epoch = ckpt.record.epoch,
                    iteration = ckpt.record.iteration,
                    "resuming"
                );
                return Some(ckpt);
            }
            Err(e) => warn!("skipping checkpoint: {e}"),
        }
    }
    info!(dir = %dir.display(), "no usable checkpoint; starting fresh");
    None
}

/// Rank 0 broadcasts its resume position; every other rank must hold the
/// same one. A mismatch on any rank fails all of them.
pub fn agree_on_resume(comm: &dyn Collective, local: (usize, usize)) -> Result<(usize, usize)> {
    let mut buf = [local.0 as f64, local.1 as f64];
    comm.broadcast(&mut buf, 0)?;
    let leader = (buf[0] as usize, buf[1] as usize);
    let mut disagree = [f64::from(u8::from(leader != local))];
    comm.all_reduce_sum(&mut disagree)?;
    if leader != local {
        return Err(TrainError::ResumeMismatch(format!(
            "rank {} would resume at {local:?}, rank 0 at {leader:?}",
            comm.rank()
        )));
    }
    if disagree[0] > 0.0 {
        return Err(TrainError::ResumeMismatch(format!(
            "{} rank(s) disagree with rank 0's resume position {leader:?}",
            disagree[0] as usize
        )));
    }
    Ok(leader)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use candle_core::DType;

    use super::*;
    use crate::amp::AmpMeta;
    use crate::dist::{LocalGroup, SingleProcess};
    use crate::optim::OptimizerMeta;

    fn record(epoch: usize) -> CheckpointRecord {
        CheckpointRecord {
            format_version: FORMAT_VERSION,
            epoch,
            iteration: 0,
            trainer: TrainerMeta {
                optimizer: AmpMeta {
                    precision: moevar_common::Precision::Fp16,
                    loss_scale: 1024.0,
                    growth_tracker: 3,
                    accumulation_steps: 2,
                    counter: 1,
                    updates: 7,
                    skipped: 1,
                    optimizer: OptimizerMeta {
                        kind: Default::default(),
                        step: 7,
                        groups: Vec::new(),
                        shapes: Default::default(),
                    },
                },
            },
            args: TrainConfig::default(),
            model_config: MoeVarConfig::tiny(),
            best: BestMetricsTracker::default(),
        }
    }

    fn tensors(v: f32) -> Vec<(String, Tensor)> {
        vec![
            ("model.w".into(), Tensor::full(v, (2, 3), &Device::Cpu).unwrap()),
            ("optim.m.w".into(), Tensor::zeros((2, 3), DType::F32, &Device::Cpu).unwrap()),
        ]
    }

    #[test]
    fn round_trip_and_best_copy() {
        let dir = tempfile::tempdir().unwrap();
        save_checkpoint(dir.path(), &record(3), &tensors(1.5), true).unwrap();

        let (rec, count) = inspect(&checkpoint_path(dir.path(), CheckpointKind::Best)).unwrap();
        assert_eq!(rec, record(3));
        assert_eq!(count, 2);

        let ckpt = auto_resume(dir.path(), &Device::Cpu).unwrap();
        assert!(ckpt.path.ends_with("ar-ckpt-last.safetensors"));
        assert_eq!(ckpt.record.position(), (3, 0));
        let w = ckpt.tensors["model.w"].flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(w, vec![1.5; 6]);

        // No temporaries left behind.
        let names: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert!(names.iter().all(|n| !n.ends_with(".tmp")), "{names:?}");
    }

    #[test]
    fn replace_overwrites_target_and_consumes_temp() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("ar-ckpt-last.safetensors");
        let tmp = temp_path(&target);
        fs::write(&target, b"old").unwrap();
        fs::write(&tmp, b"new").unwrap();
        replace_atomically(&tmp, &target).unwrap();
        assert_eq!(fs::read(&target).unwrap(), b"new");
        assert!(!tmp.exists());
        // The directory sync needs a directory that still exists.
        assert!(sync_dir(dir.path()).is_ok());
        assert!(sync_dir(&dir.path().join("gone")).is_err() || cfg!(not(unix)));
    }

    #[test]
    fn corrupt_newest_falls_back_to_older() {
        let dir = tempfile::tempdir().unwrap();
        // best at epoch 2, then last at epoch 4 gets clobbered.
        save_checkpoint(dir.path(), &record(2), &tensors(2.0), true).unwrap();
        save_checkpoint(dir.path(), &record(4), &tensors(4.0), false).unwrap();
        let last = checkpoint_path(dir.path(), CheckpointKind::Last);
        fs::write(&last, b"\x10\x00\x00\x00\x00\x00\x00\x00{not json at all").unwrap();

        assert!(matches!(read_record(&last), Err(TrainError::CheckpointCorrupt { .. })));
        let ckpt = auto_resume(dir.path(), &Device::Cpu).unwrap();
        assert!(ckpt.path.ends_with("ar-ckpt-best.safetensors"));
        assert_eq!(ckpt.record.epoch, 2);
    }

    #[test]
    fn empty_or_missing_directory_is_a_cold_start() {
        let dir = tempfile::tempdir().unwrap();
        assert!(auto_resume(dir.path(), &Device::Cpu).is_none());
        assert!(auto_resume(&dir.path().join("nope"), &Device::Cpu).is_none());
        fs::write(dir.path().join("ar-ckpt-last.safetensors"), b"").unwrap();
        assert!(auto_resume(dir.path(), &Device::Cpu).is_none());
    }

    #[test]
    fn ranks_must_agree_on_position() {
        assert_eq!(agree_on_resume(&SingleProcess, (5, 2)).unwrap(), (5, 2));

        let handles: Vec<_> = LocalGroup::new(2)
            .into_iter()
            .map(|comm| {
                std::thread::spawn(move || {
                    let comm: Arc<dyn Collective> = Arc::new(comm);
                    let local = if comm.rank() == 0 { (3, 0) } else { (2, 0) };
                    agree_on_resume(comm.as_ref(), local)
                })
            })
            .collect();
        for h in handles {
            assert!(matches!(h.join().unwrap(), Err(TrainError::ResumeMismatch(_))));
        }

        // Agreement on three ranks passes everywhere.
        let handles: Vec<_> = LocalGroup::new(3)
            .into_iter()
            .map(|comm| std::thread::spawn(move || agree_on_resume(&comm, (4, 1))))
            .collect();
        for h in handles {
            assert_eq!(h.join().unwrap().unwrap(), (4, 1));
        }
    }

    #[test]
    fn leader_writes_and_everyone_waits() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().to_path_buf();
        let handles: Vec<_> = LocalGroup::new(3)
            .into_iter()
            .map(|comm| {
                let path = path.clone();
                std::thread::spawn(move || {
                    save_on_leader(&comm, &path, &record(1), &tensors(0.5), false).unwrap();
                    // After the barrier every rank sees the file.
                    read_record(&checkpoint_path(&path, CheckpointKind::Last)).unwrap()
                })
            })
            .collect();
        for h in handles {
            assert_eq!(h.join().unwrap().epoch, 1);
        }
        assert!(!checkpoint_path(&path, CheckpointKind::Best).exists());
    }
}
