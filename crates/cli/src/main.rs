use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use moevar_common::{
    pack_image_folder, MoeVarConfig, OptimizerKind, Precision, ScheduleShape, TrainConfig,
};
use moevar_train::{inspect, DistContext, EpochDriver, TcpConfig};

#[derive(Parser, Debug)]
#[command(name = "moevar", about = "Distributed training driver for MoE visual autoregressive models")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Train (or resume) a MoE autoregressive model on tokenized images.
    /// Launch one process per rank with RANK / WORLD_SIZE / MASTER_ADDR set.
    Train(TrainArgs),
    /// Pack an ImageFolder-style tree (`class/xxx.jpg`) into a `.vqi` shard.
    Pack(PackArgs),
    /// Print a checkpoint's training record and tensor count.
    Inspect(InspectArgs),
}

// ── Train ──────────────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
struct TrainArgs {
    /// Base run settings (JSON); flags below override it.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Model settings (JSON). Defaults to the built-in model, or the tiny
    /// one under `--local-debug`.
    #[arg(long)]
    model_config: Option<PathBuf>,
    #[arg(long)]
    exp_name: Option<String>,
    /// Directory holding `train.vqi` and `val.vqi`.
    #[arg(long)]
    data_path: Option<PathBuf>,
    #[arg(long)]
    output_dir: Option<PathBuf>,
    /// Tokenizer weights; generated here when missing.
    #[arg(long)]
    vq_ckpt: Option<PathBuf>,
    /// Global batch size over all ranks.
    #[arg(long)]
    bs: Option<usize>,
    #[arg(long)]
    ac: Option<usize>,
    #[arg(long)]
    ep: Option<usize>,
    /// Base learning rate; the peak is `ac * blr * bs / 256`.
    #[arg(long)]
    blr: Option<f64>,
    #[arg(long)]
    wd: Option<f64>,
    #[arg(long)]
    wde: Option<f64>,
    /// cos | lin | lin0 | lin00 | lin<t> | exp
    #[arg(long)]
    sche: Option<ScheduleShape>,
    #[arg(long)]
    wp: Option<f64>,
    #[arg(long)]
    wp0: Option<f64>,
    #[arg(long)]
    wpe: Option<f64>,
    #[arg(long)]
    tclip: Option<f64>,
    #[arg(long)]
    ls: Option<f64>,
    /// fp32 | fp16 | bf16
    #[arg(long)]
    precision: Option<Precision>,
    /// adamw | sgd
    #[arg(long)]
    opt: Option<OptimizerKind>,
    #[arg(long)]
    pg: Option<f64>,
    #[arg(long)]
    pg0: Option<usize>,
    #[arg(long)]
    pgwp: Option<f64>,
    #[arg(long)]
    num_experts: Option<usize>,
    #[arg(long)]
    top_k: Option<usize>,
    #[arg(long)]
    router_noise_std: Option<f64>,
    #[arg(long)]
    aux_weight: Option<f64>,
    #[arg(long)]
    seed: Option<u64>,
    #[arg(long)]
    same_seed_for_all_ranks: bool,
    /// Decoding threads; 0 keeps the rayon default.
    #[arg(long)]
    workers: Option<usize>,
    #[arg(long)]
    hflip: bool,
    #[arg(long)]
    save_every: Option<usize>,
    #[arg(long)]
    log_every: Option<usize>,
    /// Synthetic data and a tiny model on CPU.
    #[arg(long)]
    local_debug: bool,
    #[arg(long)]
    cpu: bool,
}

impl TrainArgs {
    fn resolve(&self) -> Result<(TrainConfig, MoeVarConfig)> {
        let mut t = match &self.config {
            Some(p) => TrainConfig::load(p)?,
            None => TrainConfig::default(),
        };
        macro_rules! set {
            ($($flag:ident => $field:ident),* $(,)?) => {
                $(if let Some(v) = &self.$flag {
                    t.$field = v.clone();
                })*
            };
        }
        set!(
            exp_name => exp_name,
            data_path => data_path,
            output_dir => output_dir,
            vq_ckpt => vq_ckpt,
            bs => global_batch_size,
            ac => grad_accum,
            ep => epochs,
            blr => blr,
            wd => weight_decay,
            sche => schedule,
            wp0 => warmup_start_frac,
            wpe => warmup_end_frac,
            tclip => grad_clip,
            ls => label_smoothing,
            precision => precision,
            opt => optimizer,
            aux_weight => aux_weight,
            pg => pg,
            pg0 => pg0,
            seed => seed,
            workers => workers,
            save_every => save_every,
            log_every => log_every,
        );
        if self.wde.is_some() {
            t.final_weight_decay = self.wde;
        }
        if self.wp.is_some() {
            t.warmup_epochs = self.wp;
        }
        if self.pgwp.is_some() {
            t.pgwp = self.pgwp;
        }
        t.same_seed_for_all_ranks |= self.same_seed_for_all_ranks;
        t.hflip |= self.hflip;
        t.local_debug |= self.local_debug;

        let mut m = match &self.model_config {
            Some(p) => MoeVarConfig::load(p)?,
            None if t.local_debug => MoeVarConfig::tiny(),
            None => MoeVarConfig::default(),
        };
        if let Some(v) = self.num_experts {
            m.num_experts = v;
        }
        if let Some(v) = self.top_k {
            m.top_k = v;
        }
        if let Some(v) = self.router_noise_std {
            m.router_noise_std = v;
        }
        Ok((t, m))
    }
}

#[derive(Parser, Debug)]
struct PackArgs {
    /// Root with one sub-directory per class.
    #[arg(long)]
    input: PathBuf,
    #[arg(long)]
    output: PathBuf,
    /// Square side length after resize and centre crop.
    #[arg(long, default_value_t = 256)]
    size: u32,
}

#[derive(Parser, Debug)]
struct InspectArgs {
    checkpoint: PathBuf,
}

fn main() -> Result<()> {
    // Non-leader ranks stay quiet unless RUST_LOG says otherwise.
    let rank: usize = std::env::var("RANK").ok().and_then(|r| r.parse().ok()).unwrap_or(0);
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if rank == 0 { "info" } else { "warn" }));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    match cli.command {
        Command::Train(args) => cmd_train(args),
        Command::Pack(args) => cmd_pack(args),
        Command::Inspect(args) => cmd_inspect(args),
    }
}

// ── Command implementations ────────────────────────────────────────────────────

fn cmd_train(args: TrainArgs) -> Result<()> {
    let (train_cfg, model_cfg) = args.resolve()?;
    if train_cfg.workers > 0 {
        if let Err(e) = rayon::ThreadPoolBuilder::new()
            .num_threads(train_cfg.workers)
            .build_global()
        {
            warn!("could not size the decoding pool: {e}");
        }
    }

    let ctx = DistContext::from_env(&TcpConfig::default(), args.cpu || train_cfg.local_debug)?;
    info!(
        rank = ctx.rank(),
        world_size = ctx.world_size(),
        local_rank = ctx.local_rank(),
        device = ?ctx.device(),
        exp = %train_cfg.exp_name,
        "process group ready"
    );

    let mut driver = EpochDriver::prepare(train_cfg, model_cfg, ctx)?;
    let summary = driver.run()?;
    info!(
        epochs_run = summary.epochs_run,
        global_step = summary.global_step,
        best_val_tail = summary.best.val_loss_tail,
        best_val_acc_tail = summary.best.val_acc_tail,
        "done"
    );
    Ok(())
}

fn cmd_pack(args: PackArgs) -> Result<()> {
    let header = pack_image_folder(&args.input, &args.output, args.size)?;
    info!(
        samples = header.num_samples,
        classes = header.num_classes,
        size = args.size,
        out = %args.output.display(),
        "packed"
    );
    Ok(())
}

fn cmd_inspect(args: InspectArgs) -> Result<()> {
    let (record, tensors) = inspect(&args.checkpoint)?;
    println!("{}", serde_json::to_string_pretty(&record)?);
    println!("tensors: {tensors}");
    Ok(())
}
