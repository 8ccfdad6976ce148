//! Model and run configuration for MoEVAR.
//!
//! Both structs are serialised as JSON. Every field has a `#[serde(default)]`
//! so a minimal `{}` file produces a working setup, and older snapshots keep
//! loading after fields are added.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TrainError};

// ── Model config ────────────────────────────────────────────────────────────

/// Hyper-parameters of the frozen multi-scale VQ tokenizer and the MoE
/// autoregressive transformer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MoeVarConfig {
    // ── Tokenizer ───────────────────────────────────────────────────────────
    /// Codebook size of the VQ tokenizer (also the AR output vocabulary).
    pub vocab_size: usize,
    /// Latent channels of the VQ feature map.
    pub latent_channels: usize,
    /// Input image channels.
    pub image_channels: usize,
    /// Side length of every token map, coarse to fine.
    pub patch_nums: Vec<usize>,
    /// Pixels per latent cell along one side.
    pub downsample: usize,

    // ── Transformer ─────────────────────────────────────────────────────────
    /// Number of transformer blocks. Width is `64 * depth`.
    pub depth: usize,
    /// Attention heads; `None` means one head per block (`depth`).
    pub num_heads: Option<usize>,
    pub mlp_ratio: f64,
    pub num_classes: usize,
    pub layer_norm_eps: f64,
    /// Probability of replacing the class label with the unconditional
    /// token during training.
    pub cond_drop_rate: f64,
    pub init_std: f64,

    // ── Mixture of experts ──────────────────────────────────────────────────
    pub num_experts: usize,
    /// Experts selected per token.
    pub top_k: usize,
    /// Std of the gaussian noise added to router logits while training.
    pub router_noise_std: f64,
}

impl Default for MoeVarConfig {
    fn default() -> Self {
        Self {
            vocab_size: 4096,
            latent_channels: 32,
            image_channels: 3,
            patch_nums: vec![1, 2, 3, 4, 5, 6, 8, 10, 13, 16],
            downsample: 16,
            depth: 16,
            num_heads: None,
            mlp_ratio: 4.0,
            num_classes: 1000,
            layer_norm_eps: 1e-6,
            cond_drop_rate: 0.1,
            init_std: 0.02,
            num_experts: 8,
            top_k: 2,
            router_noise_std: 0.1,
        }
    }
}

impl MoeVarConfig {
    /// A single-block model for `--local-debug` runs and tests.
    pub fn tiny() -> Self {
        Self {
            vocab_size: 32,
            latent_channels: 8,
            image_channels: 3,
            patch_nums: vec![1, 2, 3],
            downsample: 4,
            depth: 1,
            num_heads: Some(2),
            mlp_ratio: 2.0,
            num_classes: 4,
            num_experts: 4,
            top_k: 2,
            ..Default::default()
        }
    }

    pub fn embed_dim(&self) -> usize {
        self.depth * 64
    }

    pub fn heads(&self) -> usize {
        self.num_heads.unwrap_or(self.depth)
    }

    pub fn head_dim(&self) -> usize {
        self.embed_dim() / self.heads()
    }

    pub fn hidden_dim(&self) -> usize {
        (self.embed_dim() as f64 * self.mlp_ratio).round() as usize
    }

    pub fn num_stages(&self) -> usize {
        self.patch_nums.len()
    }

    /// Total tokens across all stages (`Σ pn²`).
    pub fn seq_len(&self) -> usize {
        self.patch_nums.iter().map(|pn| pn * pn).sum()
    }

    /// `[begin, end)` token range of every stage.
    pub fn stage_bounds(&self) -> Vec<(usize, usize)> {
        let mut cur = 0;
        self.patch_nums
            .iter()
            .map(|pn| {
                let begin = cur;
                cur += pn * pn;
                (begin, cur)
            })
            .collect()
    }

    /// Pixel side length the tokenizer expects.
    pub fn image_size(&self) -> usize {
        self.patch_nums.last().copied().unwrap_or(0) * self.downsample
    }

    pub fn validate(&self) -> Result<()> {
        if self.patch_nums.len() < 2 {
            return Err(TrainError::config("patch_nums needs at least two stages"));
        }
        if self.patch_nums.windows(2).any(|w| w[0] >= w[1]) || self.patch_nums[0] == 0 {
            return Err(TrainError::config(format!(
                "patch_nums must be strictly increasing and positive, got {:?}",
                self.patch_nums
            )));
        }
        if self.depth == 0 || self.heads() == 0 || self.embed_dim() % self.heads() != 0 {
            return Err(TrainError::config(format!(
                "width {} is not divisible by {} heads",
                self.embed_dim(),
                self.heads()
            )));
        }
        if self.num_experts == 0 || self.top_k == 0 || self.top_k > self.num_experts {
            return Err(TrainError::config(format!(
                "top_k ({}) must be in 1..={} experts",
                self.top_k, self.num_experts
            )));
        }
        if self.vocab_size < 2 || self.num_classes == 0 {
            return Err(TrainError::config("vocab_size and num_classes must be positive"));
        }
        Ok(())
    }

    /// Save config to a JSON file.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Load config from a JSON file.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let json = std::fs::read_to_string(path)?;
        let config = serde_json::from_str(&json)?;
        Ok(config)
    }
}

// ── Closed choices ──────────────────────────────────────────────────────────

/// Shape of the learning-rate decay after warmup.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ScheduleShape {
    /// Half cosine from 1 to 0.
    Cos,
    /// Flat until 15% of the decay phase, then linear.
    Lin,
    /// Flat until 5%, then linear.
    Lin0,
    /// Linear from the first decay step.
    Lin00,
    /// Flat until the given fraction, then linear.
    LinT(f64),
    /// Flat until 15%, then exponential.
    Exp,
}

impl FromStr for ScheduleShape {
    type Err = TrainError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "cos" | "cosine" => Ok(Self::Cos),
            "lin" | "linear" => Ok(Self::Lin),
            "lin0" => Ok(Self::Lin0),
            "lin00" => Ok(Self::Lin00),
            "exp" => Ok(Self::Exp),
            other => match other.strip_prefix("lin").and_then(|t| t.parse::<f64>().ok()) {
                Some(t) if (0.0..1.0).contains(&t) => Ok(Self::LinT(t)),
                _ => Err(TrainError::config(format!("unknown schedule shape {other:?}"))),
            },
        }
    }
}

impl fmt::Display for ScheduleShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cos => f.write_str("cos"),
            Self::Lin => f.write_str("lin"),
            Self::Lin0 => f.write_str("lin0"),
            Self::Lin00 => f.write_str("lin00"),
            Self::LinT(t) => write!(f, "lin{t}"),
            Self::Exp => f.write_str("exp"),
        }
    }
}

impl TryFrom<String> for ScheduleShape {
    type Error = TrainError;
    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<ScheduleShape> for String {
    fn from(s: ScheduleShape) -> Self {
        s.to_string()
    }
}

/// Numeric mode of the accumulating optimizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    Fp32,
    /// Dynamic loss scaling.
    Fp16,
    /// No loss scaling.
    Bf16,
}

impl Precision {
    pub fn uses_loss_scaling(self) -> bool {
        self == Self::Fp16
    }
}

impl FromStr for Precision {
    type Err = TrainError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "0" | "fp32" | "off" => Ok(Self::Fp32),
            "1" | "fp16" => Ok(Self::Fp16),
            "2" | "bf16" => Ok(Self::Bf16),
            other => Err(TrainError::config(format!("unknown precision {other:?}"))),
        }
    }
}

/// Base optimizer selected at parse time.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum OptimizerKind {
    AdamW { beta1: f64, beta2: f64, eps: f64 },
    Sgd { momentum: f64 },
}

impl Default for OptimizerKind {
    fn default() -> Self {
        Self::AdamW {
            beta1: 0.9,
            beta2: 0.95,
            eps: 1e-8,
        }
    }
}

impl FromStr for OptimizerKind {
    type Err = TrainError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "adamw" | "adam" => Ok(Self::default()),
            "sgd" => Ok(Self::Sgd { momentum: 0.9 }),
            other => Err(TrainError::config(format!("unknown optimizer {other:?}"))),
        }
    }
}

// ── Run config ──────────────────────────────────────────────────────────────

/// Every knob of a training run. A copy is embedded in each checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    pub exp_name: String,
    /// Directory holding `train.vqi` and `val.vqi`.
    pub data_path: PathBuf,
    pub output_dir: PathBuf,
    /// Frozen tokenizer weights (created on first use when missing).
    pub vq_ckpt: PathBuf,

    // ── Batching ────────────────────────────────────────────────────────────
    /// Samples per iteration summed over all ranks.
    pub global_batch_size: usize,
    /// Micro-batches per parameter update.
    pub grad_accum: usize,
    pub epochs: usize,
    pub fill_last: bool,

    // ── Optimisation ────────────────────────────────────────────────────────
    /// Base LR per 256 samples; see [`TrainConfig::peak_lr`].
    pub blr: f64,
    pub weight_decay: f64,
    /// Weight decay reached at the last step; `None` keeps it constant.
    pub final_weight_decay: Option<f64>,
    pub schedule: ScheduleShape,
    /// Warmup length in epochs; `None` means `epochs / 50`.
    pub warmup_epochs: Option<f64>,
    pub warmup_start_frac: f64,
    pub warmup_end_frac: f64,
    /// Max gradient norm; `0` disables clipping.
    pub grad_clip: f64,
    pub label_smoothing: f64,
    pub precision: Precision,
    pub optimizer: OptimizerKind,
    pub aux_weight: f64,

    // ── Curriculum ──────────────────────────────────────────────────────────
    /// Fraction of training covered by the progressive schedule; `0` disables.
    pub pg: f64,
    /// First curriculum stage.
    pub pg0: usize,
    /// Ramp length of a newly added stage in epochs; `None` means `epochs / 300`.
    pub pgwp: Option<f64>,

    // ── Data ────────────────────────────────────────────────────────────────
    pub seed: u64,
    /// Use the same augmentation seed on all ranks.
    pub same_seed_for_all_ranks: bool,
    /// Decoding threads; `0` lets rayon decide.
    pub workers: usize,
    pub hflip: bool,
    /// Use a generated dataset instead of reading shards.
    pub local_debug: bool,

    // ── Cadence ─────────────────────────────────────────────────────────────
    pub save_every: usize,
    pub log_every: usize,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            exp_name: "moevar".into(),
            data_path: PathBuf::from("data"),
            output_dir: PathBuf::from("local_output"),
            vq_ckpt: PathBuf::from("vq_ms.safetensors"),
            global_batch_size: 256,
            grad_accum: 1,
            epochs: 200,
            fill_last: true,
            blr: 1e-4,
            weight_decay: 0.05,
            final_weight_decay: None,
            schedule: ScheduleShape::Lin0,
            warmup_epochs: None,
            warmup_start_frac: 0.005,
            warmup_end_frac: 0.0,
            grad_clip: 2.0,
            label_smoothing: 0.0,
            precision: Precision::Fp32,
            optimizer: OptimizerKind::default(),
            aux_weight: 0.01,
            pg: 0.0,
            pg0: 4,
            pgwp: None,
            seed: 0,
            same_seed_for_all_ranks: false,
            workers: 0,
            hflip: false,
            local_debug: false,
            save_every: 10,
            log_every: 50,
        }
    }
}

impl TrainConfig {
    /// Peak learning rate after scaling by the effective batch size.
    pub fn peak_lr(&self) -> f64 {
        self.grad_accum as f64 * self.blr * self.global_batch_size as f64 / 256.0
    }

    pub fn final_wd(&self) -> f64 {
        self.final_weight_decay.unwrap_or(self.weight_decay)
    }

    pub fn warmup_epochs(&self) -> f64 {
        self.warmup_epochs.unwrap_or(self.epochs as f64 / 50.0)
    }

    pub fn pgwp_epochs(&self) -> f64 {
        self.pgwp.unwrap_or(self.epochs as f64 / 300.0)
    }

    pub fn local_batch_size(&self, world_size: usize) -> usize {
        self.global_batch_size / world_size.max(1)
    }

    /// Checks that need the world size; run once per rank at startup.
    pub fn validate(&self, world_size: usize) -> Result<()> {
        if world_size == 0 || self.global_batch_size == 0 {
            return Err(TrainError::config("batch size and world size must be positive"));
        }
        if self.global_batch_size % world_size != 0 {
            return Err(TrainError::config(format!(
                "global batch size {} is not divisible by world size {}",
                self.global_batch_size, world_size
            )));
        }
        if self.grad_accum == 0 {
            return Err(TrainError::config("grad_accum must be at least 1"));
        }
        if self.epochs == 0 {
            return Err(TrainError::config("epochs must be at least 1"));
        }
        if !(0.0..=1.0).contains(&self.pg) {
            return Err(TrainError::config(format!("pg must be in [0, 1], got {}", self.pg)));
        }
        Ok(())
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&json)?)
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_json_round_trip() {
        let config = MoeVarConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let loaded: MoeVarConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(config, loaded);
        assert_eq!(loaded.embed_dim(), 1024);
        assert_eq!(loaded.heads(), 16);
        assert_eq!(loaded.seq_len(), 680);
        assert_eq!(loaded.image_size(), 256);
    }

    #[test]
    fn missing_fields_fall_back() {
        let loaded: TrainConfig = serde_json::from_str(r#"{"epochs": 10}"#).unwrap();
        assert_eq!(loaded.epochs, 10);
        assert_eq!(loaded.schedule, ScheduleShape::Lin0);
        assert_eq!(loaded.warmup_epochs(), 0.2);
        assert_eq!(loaded.final_wd(), loaded.weight_decay);
    }

    #[test]
    fn stage_bounds_cover_sequence() {
        let c = MoeVarConfig::tiny();
        assert_eq!(c.stage_bounds(), vec![(0, 1), (1, 5), (5, 14)]);
        assert_eq!(c.seq_len(), 14);
        c.validate().unwrap();
    }

    #[test]
    fn schedule_shape_parsing() {
        assert_eq!("cos".parse::<ScheduleShape>().unwrap(), ScheduleShape::Cos);
        assert_eq!("lin0.3".parse::<ScheduleShape>().unwrap(), ScheduleShape::LinT(0.3));
        assert!("spiral".parse::<ScheduleShape>().is_err());
        let json = serde_json::to_string(&ScheduleShape::LinT(0.25)).unwrap();
        assert_eq!(json, "\"lin0.25\"");
        let back: ScheduleShape = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ScheduleShape::LinT(0.25));
    }

    #[test]
    fn optimizer_and_precision_parsing() {
        assert_eq!("sgd".parse::<OptimizerKind>().unwrap(), OptimizerKind::Sgd { momentum: 0.9 });
        assert_eq!("1".parse::<Precision>().unwrap(), Precision::Fp16);
        assert!(Precision::Fp16.uses_loss_scaling());
        assert!(!Precision::Bf16.uses_loss_scaling());
        let json = serde_json::to_string(&OptimizerKind::default()).unwrap();
        assert!(json.contains("\"kind\":\"adamw\""));
    }

    #[test]
    fn batch_must_divide_world() {
        let cfg = TrainConfig {
            global_batch_size: 10,
            ..Default::default()
        };
        assert!(matches!(cfg.validate(4), Err(TrainError::Config(_))));
        assert!(cfg.validate(5).is_ok());
        assert_eq!(cfg.local_batch_size(5), 2);
    }

    #[test]
    fn invalid_top_k_rejected() {
        let c = MoeVarConfig {
            top_k: 9,
            ..Default::default()
        };
        assert!(c.validate().is_err());
    }

    #[test]
    fn peak_lr_scales_with_batch() {
        let cfg = TrainConfig {
            global_batch_size: 512,
            grad_accum: 2,
            blr: 1e-4,
            ..Default::default()
        };
        assert!((cfg.peak_lr() - 4e-4).abs() < 1e-15);
    }
}
