//! Process group and collectives.
//!
//! Every rank runs one process. Collectives are expressed through the
//! [`Collective`] trait over `f64` buffers:
//!
//! * **[`SingleProcess`]**: world size 1, every collective is a no-op.
//! * **[`LocalGroup`]**: in-process ranks on threads, for tests and
//!   single-host debugging.
//! * **[`TcpGroup`]**: star topology with rank 0 as hub. Sums are combined in
//!   rank order at the hub so every rank receives bit-identical results.
//!
//! [`DistContext`] wraps the chosen group together with the local rank and
//! device, and releases the group when dropped. [`ModelWrapper`] puts the
//! model behind the same contract whether or not gradients cross ranks.

use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use candle_core::{DType, Device, Tensor, Var};
use parking_lot::{Condvar, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Runtime;
use tracing::{debug, info, warn};

use moevar_common::{Result, TrainError};
use moevar_core::{ArModel, ArOutput};

use crate::amp::GradientSync;

// ── Collective trait ────────────────────────────────────────────────────────

/// Collective operations of a fixed group of ranks.
///
/// Every rank must issue the same sequence of calls with the same buffer
/// lengths; a violation is reported as [`TrainError::Collective`] where it can
/// be detected and hangs otherwise.
pub trait Collective: Send + Sync {
    fn rank(&self) -> usize;

    fn world_size(&self) -> usize;

    /// Element-wise sum over ranks, written back into `buf` on every rank.
    fn all_reduce_sum(&self, buf: &mut [f64]) -> Result<()>;

    /// Overwrite `buf` on every rank with the contents of `root`'s buffer.
    fn broadcast(&self, buf: &mut [f64], root: usize) -> Result<()>;

    /// Block until every rank has reached the barrier.
    fn barrier(&self) -> Result<()> {
        self.all_reduce_sum(&mut [])
    }

    /// Release transport resources. Further collectives fail.
    fn shutdown(&self) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Sum,
    Broadcast(usize),
}

impl Op {
    fn tag(self) -> (u8, u32) {
        match self {
            Op::Sum => (0, 0),
            Op::Broadcast(root) => (1, root as u32),
        }
    }
}

/// Rank-ordered reduction shared by every group implementation.
fn combine(contributions: &[&[f64]], op: Op) -> Vec<f64> {
    match op {
        Op::Sum => {
            let mut out = vec![0.0; contributions.first().map_or(0, |c| c.len())];
            for c in contributions {
                for (o, v) in out.iter_mut().zip(c.iter()) {
                    *o += v;
                }
            }
            out
        }
        Op::Broadcast(root) => contributions[root].to_vec(),
    }
}

// ── Single process ──────────────────────────────────────────────────────────

pub struct SingleProcess;

impl Collective for SingleProcess {
    fn rank(&self) -> usize {
        0
    }

    fn world_size(&self) -> usize {
        1
    }

    fn all_reduce_sum(&self, _buf: &mut [f64]) -> Result<()> {
        Ok(())
    }

    fn broadcast(&self, _buf: &mut [f64], root: usize) -> Result<()> {
        if root != 0 {
            return Err(TrainError::Collective(format!("broadcast root {root} out of range")));
        }
        Ok(())
    }
}

// ── In-process group ────────────────────────────────────────────────────────

struct Round {
    generation: u64,
    arrived: usize,
    op: Option<Op>,
    contributions: Vec<Option<Vec<f64>>>,
    result: Arc<Vec<f64>>,
}

struct Shared {
    world: usize,
    round: Mutex<Round>,
    done: Condvar,
}

/// Thread-backed process group.
pub struct LocalGroup;

impl LocalGroup {
    /// One communicator per rank; move each into its own thread.
    pub fn new(world_size: usize) -> Vec<LocalComm> {
        let world = world_size.max(1);
        let shared = Arc::new(Shared {
            world,
            round: Mutex::new(Round {
                generation: 0,
                arrived: 0,
                op: None,
                contributions: vec![None; world],
                result: Arc::new(Vec::new()),
            }),
            done: Condvar::new(),
        });
        (0..world)
            .map(|rank| LocalComm {
                rank,
                shared: Arc::clone(&shared),
            })
            .collect()
    }
}

pub struct LocalComm {
    rank: usize,
    shared: Arc<Shared>,
}

impl LocalComm {
    fn run(&self, buf: &mut [f64], op: Op) -> Result<()> {
        let shared = &self.shared;
        let mut round = shared.round.lock();

        let running = round.op;
        match running {
            None => round.op = Some(op),
            Some(current) if current != op => {
                return Err(TrainError::Collective(format!(
                    "rank {} issued {op:?} while the group runs {current:?}",
                    self.rank
                )));
            }
            Some(_) => {}
        }
        if let Some(other) = round.contributions.iter().flatten().next() {
            if other.len() != buf.len() {
                return Err(TrainError::Collective(format!(
                    "rank {} contributed {} values, peers {}",
                    self.rank,
                    buf.len(),
                    other.len()
                )));
            }
        }

        round.contributions[self.rank] = Some(buf.to_vec());
        round.arrived += 1;
        let generation = round.generation;

        if round.arrived == shared.world {
            let parts: Vec<&[f64]> = round
                .contributions
                .iter()
                .map(|c| c.as_deref().unwrap_or(&[]))
                .collect();
            let result = combine(&parts, op);
            round.result = Arc::new(result);
            round.arrived = 0;
            round.op = None;
            round.contributions.iter_mut().for_each(|c| *c = None);
            round.generation += 1;
            shared.done.notify_all();
        } else {
            while round.generation == generation {
                shared.done.wait(&mut round);
            }
        }

        buf.copy_from_slice(&round.result);
        Ok(())
    }
}

impl Collective for LocalComm {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.shared.world
    }

    fn all_reduce_sum(&self, buf: &mut [f64]) -> Result<()> {
        self.run(buf, Op::Sum)
    }

    fn broadcast(&self, buf: &mut [f64], root: usize) -> Result<()> {
        if root >= self.shared.world {
            return Err(TrainError::Collective(format!("broadcast root {root} out of range")));
        }
        self.run(buf, Op::Broadcast(root))
    }
}

// ── TCP group ───────────────────────────────────────────────────────────────

/// Connection settings of a [`TcpGroup`].
#[derive(Debug, Clone)]
pub struct TcpConfig {
    pub connect_timeout: Duration,
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            max_retries: 60,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
        }
    }
}

enum Links {
    /// Rank 0: one stream per peer, indexed by `rank - 1`.
    Hub(Vec<TcpStream>),
    Spoke(TcpStream),
    Closed,
}

/// Star-topology process group over TCP.
///
/// Frames are `op: u8, root: u32, len: u64` followed by `len` little-endian
/// `f64` values. The hub reads one frame from every peer, combines them in
/// rank order and writes the result back.
pub struct TcpGroup {
    rank: usize,
    world: usize,
    runtime: Runtime,
    links: Mutex<Links>,
}

impl TcpGroup {
    pub fn connect(rank: usize, world_size: usize, hub: SocketAddr, cfg: &TcpConfig) -> Result<Self> {
        if rank >= world_size {
            return Err(TrainError::config(format!(
                "rank {rank} is outside a world of {world_size}"
            )));
        }
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let links = runtime.block_on(async {
            if rank == 0 {
                accept_peers(hub, world_size, cfg).await
            } else {
                connect_hub(hub, rank, cfg).await
            }
        })?;
        info!(rank, world_size, %hub, "process group connected");
        Ok(Self {
            rank,
            world: world_size,
            runtime,
            links: Mutex::new(links),
        })
    }

    fn run(&self, buf: &mut [f64], op: Op) -> Result<()> {
        let mut links = self.links.lock();
        let result = self.runtime.block_on(async {
            match &mut *links {
                Links::Hub(peers) => {
                    let mut gathered = Vec::with_capacity(peers.len());
                    for (i, peer) in peers.iter_mut().enumerate() {
                        let (tag, data) = read_frame(peer, buf.len()).await?;
                        if tag != op.tag() {
                            return Err(TrainError::Collective(format!(
                                "rank {} sent op {tag:?} with {} values, hub expected {:?} with {}",
                                i + 1,
                                data.len(),
                                op.tag(),
                                buf.len()
                            )));
                        }
                        gathered.push(data);
                    }
                    let mut parts: Vec<&[f64]> = Vec::with_capacity(self.world);
                    parts.push(&*buf);
                    parts.extend(gathered.iter().map(Vec::as_slice));
                    let result = combine(&parts, op);
                    for peer in peers.iter_mut() {
                        write_frame(peer, op.tag(), &result).await?;
                    }
                    Ok(result)
                }
                Links::Spoke(stream) => {
                    write_frame(stream, op.tag(), buf).await?;
                    let (tag, data) = read_frame(stream, buf.len()).await?;
                    if tag != op.tag() {
                        return Err(TrainError::Collective(
                            "hub answered with a mismatched frame".into(),
                        ));
                    }
                    Ok(data)
                }
                Links::Closed => Err(TrainError::Collective("process group is shut down".into())),
            }
        })?;
        buf.copy_from_slice(&result);
        Ok(())
    }
}

impl Collective for TcpGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world
    }

    fn all_reduce_sum(&self, buf: &mut [f64]) -> Result<()> {
        self.run(buf, Op::Sum)
    }

    fn broadcast(&self, buf: &mut [f64], root: usize) -> Result<()> {
        if root >= self.world {
            return Err(TrainError::Collective(format!("broadcast root {root} out of range")));
        }
        self.run(buf, Op::Broadcast(root))
    }

    fn shutdown(&self) {
        let mut links = self.links.lock();
        if !matches!(*links, Links::Closed) {
            debug!(rank = self.rank, "closing process group");
            *links = Links::Closed;
        }
    }
}

async fn accept_peers(addr: SocketAddr, world: usize, cfg: &TcpConfig) -> Result<Links> {
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, peers = world - 1, "hub listening");
    let mut peers: Vec<Option<TcpStream>> = (1..world).map(|_| None).collect();
    // Each spoke may spend its whole retry budget before it shows up.
    let patience = cfg.max_backoff * cfg.max_retries.max(1) + cfg.connect_timeout;

    while peers.iter().any(Option::is_none) {
        let (mut stream, from) = tokio::time::timeout(patience, listener.accept())
            .await
            .map_err(|_| TrainError::Collective("timed out waiting for peers".into()))??;
        if let Err(e) = stream.set_nodelay(true) {
            warn!("failed to set TCP_NODELAY: {e}");
        }
        let peer = stream.read_u32_le().await? as usize;
        match peer.checked_sub(1).and_then(|i| peers.get_mut(i)) {
            Some(slot) if slot.is_none() => {
                debug!(peer, %from, "peer joined");
                *slot = Some(stream);
            }
            _ => {
                return Err(TrainError::Collective(format!(
                    "unexpected handshake from rank {peer} ({from})"
                )));
            }
        }
    }
    Ok(Links::Hub(peers.into_iter().flatten().collect()))
}

async fn connect_hub(addr: SocketAddr, rank: usize, cfg: &TcpConfig) -> Result<Links> {
    let mut backoff = cfg.initial_backoff;
    for attempt in 0..=cfg.max_retries {
        match tokio::time::timeout(cfg.connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(mut stream)) => {
                if let Err(e) = stream.set_nodelay(true) {
                    warn!("failed to set TCP_NODELAY: {e}");
                }
                stream.write_u32_le(rank as u32).await?;
                return Ok(Links::Spoke(stream));
            }
            Ok(Err(e)) if attempt == 0 => debug!(rank, %addr, "waiting for hub ({e})"),
            Ok(Err(_)) => {}
            Err(_) => debug!(rank, %addr, attempt, "connect timed out"),
        }
        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(cfg.max_backoff);
    }
    Err(TrainError::Collective(format!(
        "rank {rank} could not reach {addr} after {} attempts",
        cfg.max_retries + 1
    )))
}

async fn write_frame(stream: &mut TcpStream, tag: (u8, u32), data: &[f64]) -> Result<()> {
    let mut frame = Vec::with_capacity(13 + data.len() * 8);
    frame.push(tag.0);
    frame.extend_from_slice(&tag.1.to_le_bytes());
    frame.extend_from_slice(&(data.len() as u64).to_le_bytes());
    for v in data {
        frame.extend_from_slice(&v.to_le_bytes());
    }
    stream.write_all(&frame).await?;
    Ok(())
}

/// Read one frame whose payload must hold exactly `expected` values. The
/// length is checked before anything is allocated.
async fn read_frame(stream: &mut TcpStream, expected: usize) -> Result<((u8, u32), Vec<f64>)> {
    let op = stream.read_u8().await?;
    let root = stream.read_u32_le().await?;
    let len = stream.read_u64_le().await?;
    if usize::try_from(len).ok() != Some(expected) {
        return Err(TrainError::Collective(format!(
            "frame announces {len} values, expected {expected}"
        )));
    }
    let mut bytes = vec![0u8; expected * 8];
    stream.read_exact(&mut bytes).await?;
    let data = bytes
        .chunks_exact(8)
        .map(|c| f64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
        .collect();
    Ok(((op, root), data))
}

// ── Context ─────────────────────────────────────────────────────────────────

/// Rank identity, process group and compute device of this process.
pub struct DistContext {
    comm: Arc<dyn Collective>,
    local_rank: usize,
    local_world_size: usize,
    device: Device,
}

impl DistContext {
    pub fn single(device: Device) -> Self {
        Self::from_comm(Arc::new(SingleProcess), 0, 1, device)
    }

    pub fn from_comm(
        comm: Arc<dyn Collective>,
        local_rank: usize,
        local_world_size: usize,
        device: Device,
    ) -> Self {
        Self {
            comm,
            local_rank,
            local_world_size: local_world_size.max(1),
            device,
        }
    }

    /// Build from the launcher environment (`RANK`, `WORLD_SIZE`,
    /// `LOCAL_RANK`, `LOCAL_WORLD_SIZE`, `MASTER_ADDR`, `MASTER_PORT`).
    /// Missing variables mean a single process.
    pub fn from_env(cfg: &TcpConfig, force_cpu: bool) -> Result<Self> {
        let rank = env_usize("RANK", 0)?;
        let world_size = env_usize("WORLD_SIZE", 1)?;
        let local_rank = env_usize("LOCAL_RANK", rank)?;
        let local_world_size = env_usize("LOCAL_WORLD_SIZE", world_size)?;

        let device = if force_cpu {
            Device::Cpu
        } else {
            Device::cuda_if_available(local_rank)?
        };

        if world_size <= 1 {
            return Ok(Self::from_comm(Arc::new(SingleProcess), 0, 1, device));
        }

        let host = std::env::var("MASTER_ADDR").unwrap_or_else(|_| "127.0.0.1".into());
        let port = parse_port(std::env::var("MASTER_PORT").ok().as_deref())?;
        let hub = (host.as_str(), port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| TrainError::config(format!("cannot resolve MASTER_ADDR {host}")))?;
        let group = TcpGroup::connect(rank, world_size, hub, cfg)?;
        Ok(Self::from_comm(Arc::new(group), local_rank, local_world_size, device))
    }

    pub fn rank(&self) -> usize {
        self.comm.rank()
    }

    pub fn world_size(&self) -> usize {
        self.comm.world_size()
    }

    pub fn local_rank(&self) -> usize {
        self.local_rank
    }

    pub fn local_world_size(&self) -> usize {
        self.local_world_size
    }

    pub fn is_master(&self) -> bool {
        self.rank() == 0
    }

    pub fn is_local_master(&self) -> bool {
        self.local_rank == 0
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn comm(&self) -> Arc<dyn Collective> {
        Arc::clone(&self.comm)
    }

    pub fn barrier(&self) -> Result<()> {
        self.comm.barrier()
    }

    pub fn all_reduce_sum(&self, buf: &mut [f64]) -> Result<()> {
        self.comm.all_reduce_sum(buf)
    }

    pub fn broadcast(&self, buf: &mut [f64], root: usize) -> Result<()> {
        self.comm.broadcast(buf, root)
    }
}

impl Drop for DistContext {
    fn drop(&mut self) {
        self.comm.shutdown();
    }
}

fn env_usize(name: &str, default: usize) -> Result<usize> {
    match std::env::var(name) {
        Ok(v) => v
            .trim()
            .parse()
            .map_err(|_| TrainError::config(format!("{name}={v:?} is not a non-negative integer"))),
        Err(_) => Ok(default),
    }
}

/// `MASTER_PORT`, defaulting to 29500.
fn parse_port(raw: Option<&str>) -> Result<u16> {
    let Some(raw) = raw else {
        return Ok(29500);
    };
    raw.trim()
        .parse::<u64>()
        .ok()
        .and_then(|p| u16::try_from(p).ok())
        .ok_or_else(|| TrainError::config(format!("MASTER_PORT={raw:?} is not a valid TCP port")))
}

// ── Model wrapper ───────────────────────────────────────────────────────────

/// The model as seen by the trainer. `Distributed` averages gradients over
/// the group and starts from rank 0's parameters.
pub enum ModelWrapper {
    Local(Box<dyn ArModel>),
    Distributed {
        model: Box<dyn ArModel>,
        comm: Arc<dyn Collective>,
    },
}

impl ModelWrapper {
    /// Pick the variant by world size. In a group, every rank's `params`
    /// are overwritten with rank 0's values.
    pub fn new(
        model: Box<dyn ArModel>,
        params: &[(String, Var)],
        comm: Arc<dyn Collective>,
    ) -> Result<Self> {
        if comm.world_size() <= 1 {
            return Ok(Self::Local(model));
        }
        broadcast_params(params, comm.as_ref())?;
        Ok(Self::Distributed { model, comm })
    }

    pub fn model(&self) -> &dyn ArModel {
        match self {
            Self::Local(model) | Self::Distributed { model, .. } => model.as_ref(),
        }
    }

    pub fn forward(&self, labels: &Tensor, teacher_forcing: &Tensor) -> candle_core::Result<ArOutput> {
        self.model().forward(labels, teacher_forcing)
    }

    pub fn is_distributed(&self) -> bool {
        matches!(self, Self::Distributed { .. })
    }
}

impl GradientSync for ModelWrapper {
    fn sync_gradients(&self, grads: &mut [Option<Tensor>], params: &[(String, Var)]) -> Result<()> {
        match self {
            Self::Local(_) => Ok(()),
            Self::Distributed { comm, .. } => average_gradients(grads, params, comm.as_ref()),
        }
    }
}

fn flatten_f64(t: &Tensor) -> Result<Vec<f64>> {
    Ok(t.flatten_all()?.to_dtype(DType::F64)?.to_vec1::<f64>()?)
}

/// Overwrite every parameter with rank 0's value.
pub fn broadcast_params(params: &[(String, Var)], comm: &dyn Collective) -> Result<()> {
    let mut buf = Vec::new();
    for (_, var) in params {
        buf.extend(flatten_f64(var.as_tensor())?);
    }
    comm.broadcast(&mut buf, 0)?;
    let mut offset = 0;
    for (_, var) in params {
        let n = var.elem_count();
        let t = Tensor::from_slice(&buf[offset..offset + n], var.dims(), var.device())?
            .to_dtype(var.dtype())?;
        var.set(&t)?;
        offset += n;
    }
    Ok(())
}

/// Mean of the gradients over the group. A rank without a gradient for a
/// parameter contributes zeros, and every slot is filled afterwards.
pub fn average_gradients(
    grads: &mut [Option<Tensor>],
    params: &[(String, Var)],
    comm: &dyn Collective,
) -> Result<()> {
    if grads.len() != params.len() {
        return Err(TrainError::Collective(format!(
            "{} gradients for {} parameters",
            grads.len(),
            params.len()
        )));
    }
    let mut buf = Vec::new();
    for (g, (_, var)) in grads.iter().zip(params) {
        match g {
            Some(t) => buf.extend(flatten_f64(t)?),
            None => buf.extend(std::iter::repeat(0.0).take(var.elem_count())),
        }
    }
    comm.all_reduce_sum(&mut buf)?;
    let inv = 1.0 / comm.world_size() as f64;
    let mut offset = 0;
    for (g, (_, var)) in grads.iter_mut().zip(params) {
        let n = var.elem_count();
        let mean: Vec<f32> = buf[offset..offset + n].iter().map(|v| (v * inv) as f32).collect();
        *g = Some(Tensor::from_vec(mean, var.dims(), var.device())?);
        offset += n;
    }
    Ok(())
}

// ── Tests ───────────────────────────────────────────────────────────────────
