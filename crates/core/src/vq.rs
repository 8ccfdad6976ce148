//! Frozen multi-scale residual VQ tokenizer.
//!
//! Images are cut into `downsample × downsample` patches and projected to the
//! latent space, giving an `(B, Cv, G, G)` feature map with `G = pn_last`.
//! Each stage then quantizes the (nearest-resized) residual at its own
//! resolution and subtracts the upsampled reconstruction, coarse to fine.

use std::collections::HashMap;
use std::path::Path;

use candle_core::{DType, Device, Result, Tensor, D};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use moevar_common::{MoeVarConfig, TrainError};

use crate::interface::VisualTokenizer;

const PROJ_WEIGHT: &str = "encoder.proj.weight";
const PROJ_BIAS: &str = "encoder.proj.bias";
const CODEBOOK: &str = "quantize.embedding";

pub struct MultiScaleVq {
    proj: Tensor,
    proj_bias: Tensor,
    codebook: Tensor,
    /// `‖e‖²` of every code, `(1, V)`.
    codebook_sq: Tensor,
    patch_nums: Vec<usize>,
    downsample: usize,
    latent_channels: usize,
}

impl MultiScaleVq {
    /// Deterministic weights from `seed`; used when no checkpoint exists yet.
    pub fn generate(config: &MoeVarConfig, seed: u64, device: &Device) -> Result<Self> {
        let mut rng = StdRng::seed_from_u64(seed);
        let fan_in = config.image_channels * config.downsample * config.downsample;
        let cv = config.latent_channels;
        let bound = (3.0 / fan_in as f32).sqrt();
        let proj: Vec<f32> = (0..fan_in * cv).map(|_| rng.gen_range(-bound..bound)).collect();
        let codebook: Vec<f32> = (0..config.vocab_size * cv)
            .map(|_| rng.gen_range(-1.0f32..1.0))
            .collect();
        Self::from_tensors(
            config,
            Tensor::from_vec(proj, (fan_in, cv), device)?,
            Tensor::zeros(cv, DType::F32, device)?,
            Tensor::from_vec(codebook, (config.vocab_size, cv), device)?,
        )
    }

    /// Load weights written by [`MultiScaleVq::save`].
    pub fn load(path: &Path, config: &MoeVarConfig, device: &Device) -> moevar_common::Result<Self> {
        let mut tensors = candle_core::safetensors::load(path, device)?;
        let mut take = |name: &str, dims: &[usize]| -> moevar_common::Result<Tensor> {
            let t = tensors.remove(name).ok_or_else(|| {
                TrainError::StateShapeMismatch(format!("{}: missing {name}", path.display()))
            })?;
            if t.dims() != dims {
                return Err(TrainError::StateShapeMismatch(format!(
                    "{}: {name} has shape {:?}, expected {dims:?}",
                    path.display(),
                    t.dims()
                )));
            }
            Ok(t)
        };
        let fan_in = config.image_channels * config.downsample * config.downsample;
        let cv = config.latent_channels;
        let proj = take(PROJ_WEIGHT, &[fan_in, cv])?;
        let bias = take(PROJ_BIAS, &[cv])?;
        let codebook = take(CODEBOOK, &[config.vocab_size, cv])?;
        Ok(Self::from_tensors(config, proj, bias, codebook)?)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let tensors: HashMap<String, Tensor> = [
            (PROJ_WEIGHT.to_string(), self.proj.clone()),
            (PROJ_BIAS.to_string(), self.proj_bias.clone()),
            (CODEBOOK.to_string(), self.codebook.clone()),
        ]
        .into_iter()
        .collect();
        candle_core::safetensors::save(&tensors, path)
    }

    fn from_tensors(
        config: &MoeVarConfig,
        proj: Tensor,
        proj_bias: Tensor,
        codebook: Tensor,
    ) -> Result<Self> {
        let codebook_sq = codebook.sqr()?.sum(1)?.unsqueeze(0)?;
        Ok(Self {
            proj,
            proj_bias,
            codebook,
            codebook_sq,
            patch_nums: config.patch_nums.clone(),
            downsample: config.downsample,
            latent_channels: config.latent_channels,
        })
    }

    fn grid(&self) -> usize {
        self.patch_nums.last().copied().unwrap_or(0)
    }

    /// `(B, C, H, W)` images → `(B, Cv, G, G)` latent features.
    fn features(&self, images: &Tensor) -> Result<Tensor> {
        let (b, c, h, w) = images.dims4()?;
        let ds = self.downsample;
        let g = self.grid();
        if h != g * ds || w != g * ds {
            candle_core::bail!("tokenizer expects {0}x{0} images, got {h}x{w}", g * ds);
        }
        let patches = images
            .reshape(vec![b, c, g, ds, g, ds])?
            .permute(vec![0, 2, 4, 1, 3, 5])?
            .reshape((b * g * g, c * ds * ds))?;
        let f = patches.matmul(&self.proj)?.broadcast_add(&self.proj_bias)?;
        f.reshape((b, g, g, self.latent_channels))?
            .permute((0, 3, 1, 2))?
            .contiguous()
    }

    /// Index of the nearest code for every row of `z` `(N, Cv)`.
    fn nearest(&self, z: &Tensor) -> Result<Tensor> {
        // argmin ‖z - e‖² == argmax (2 z·e - ‖e‖²)
        let scores = z
            .matmul(&self.codebook.t()?)?
            .affine(2.0, 0.0)?
            .broadcast_sub(&self.codebook_sq)?;
        scores.argmax(D::Minus1)
    }

    /// Codes `(B, pn²)` → `(B, Cv, pn, pn)`.
    fn lookup(&self, ids: &Tensor, pn: usize) -> Result<Tensor> {
        let b = ids.dim(0)?;
        self.codebook
            .index_select(&ids.flatten_all()?, 0)?
            .reshape((b, pn, pn, self.latent_channels))?
            .permute((0, 3, 1, 2))?
            .contiguous()
    }
}

fn resize(x: &Tensor, size: usize) -> Result<Tensor> {
    if x.dim(D::Minus1)? == size {
        Ok(x.clone())
    } else {
        x.interpolate2d(size, size)
    }
}

fn flatten_tokens(x: &Tensor) -> Result<Tensor> {
    let (b, c, h, w) = x.dims4()?;
    x.permute((0, 2, 3, 1))?.reshape((b, h * w, c))
}

impl VisualTokenizer for MultiScaleVq {
    fn encode(&self, images: &Tensor) -> Result<Vec<Tensor>> {
        let g = self.grid();
        let mut rest = self.features(images)?;
        let b = rest.dim(0)?;
        let mut ids = Vec::with_capacity(self.patch_nums.len());
        for &pn in &self.patch_nums {
            let z = flatten_tokens(&resize(&rest, pn)?)?.reshape((b * pn * pn, self.latent_channels))?;
            let idx = self.nearest(&z)?.reshape((b, pn * pn))?;
            let recon = resize(&self.lookup(&idx, pn)?, g)?;
            rest = (rest - recon)?;
            ids.push(idx);
        }
        Ok(ids)
    }

    fn teacher_forcing_input(&self, ids: &[Tensor]) -> Result<Tensor> {
        if ids.len() != self.patch_nums.len() || ids.len() < 2 {
            candle_core::bail!(
                "expected {} token stages, got {}",
                self.patch_nums.len(),
                ids.len()
            );
        }
        let g = self.grid();
        let b = ids[0].dim(0)?;
        let mut f_hat = Tensor::zeros((b, self.latent_channels, g, g), DType::F32, ids[0].device())?;
        let mut parts = Vec::with_capacity(ids.len() - 1);
        for s in 0..ids.len() - 1 {
            let pn = self.patch_nums[s];
            f_hat = (f_hat + resize(&self.lookup(&ids[s], pn)?, g)?)?;
            let next = self.patch_nums[s + 1];
            parts.push(flatten_tokens(&resize(&f_hat, next)?)?);
        }
        Tensor::cat(&parts, 1)
    }

    fn vocab_size(&self) -> usize {
        self.codebook_sq.dim(1).unwrap_or(0)
    }

    fn patch_nums(&self) -> &[usize] {
        &self.patch_nums
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn images(cfg: &MoeVarConfig, b: usize) -> Tensor {
        let s = cfg.image_size();
        Tensor::rand(-1f32, 1f32, (b, cfg.image_channels, s, s), &Device::Cpu).unwrap()
    }

    #[test]
    fn encode_shapes_follow_patch_nums() {
        let cfg = MoeVarConfig::tiny();
        let vq = MultiScaleVq::generate(&cfg, 0, &Device::Cpu).unwrap();
        let ids = vq.encode(&images(&cfg, 2)).unwrap();
        assert_eq!(ids.len(), 3);
        for (t, pn) in ids.iter().zip(&cfg.patch_nums) {
            assert_eq!(t.dims(), &[2, pn * pn]);
            assert_eq!(t.dtype(), DType::U32);
            let max = t.flatten_all().unwrap().to_vec1::<u32>().unwrap().into_iter().max().unwrap();
            assert!((max as usize) < cfg.vocab_size);
        }
        let tf = vq.teacher_forcing_input(&ids).unwrap();
        assert_eq!(tf.dims(), &[2, cfg.seq_len() - 1, cfg.latent_channels]);
    }

    #[test]
    fn nearest_picks_exact_code() {
        let cfg = MoeVarConfig::tiny();
        let vq = MultiScaleVq::generate(&cfg, 1, &Device::Cpu).unwrap();
        let picks = Tensor::new(&[5u32, 17, 0], &Device::Cpu).unwrap();
        let z = vq.codebook.index_select(&picks, 0).unwrap();
        let got = vq.nearest(&z).unwrap().to_vec1::<u32>().unwrap();
        assert_eq!(got, vec![5, 17, 0]);
    }

    #[test]
    fn generation_is_deterministic_and_saves() {
        let cfg = MoeVarConfig::tiny();
        let a = MultiScaleVq::generate(&cfg, 9, &Device::Cpu).unwrap();
        let b = MultiScaleVq::generate(&cfg, 9, &Device::Cpu).unwrap();
        let x = images(&cfg, 1);
        let ia = a.encode(&x).unwrap();
        let ib = b.encode(&x).unwrap();
        for (p, q) in ia.iter().zip(&ib) {
            assert_eq!(p.to_vec2::<u32>().unwrap(), q.to_vec2::<u32>().unwrap());
        }

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vq.safetensors");
        a.save(&path).unwrap();
        let loaded = MultiScaleVq::load(&path, &cfg, &Device::Cpu).unwrap();
        let il = loaded.encode(&x).unwrap();
        assert_eq!(ia[2].to_vec2::<u32>().unwrap(), il[2].to_vec2::<u32>().unwrap());

        let other = MoeVarConfig {
            vocab_size: 64,
            ..MoeVarConfig::tiny()
        };
        assert!(matches!(
            MultiScaleVq::load(&path, &other, &Device::Cpu),
            Err(TrainError::StateShapeMismatch(_))
        ));
    }

    #[test]
    fn rejects_wrong_resolution() {
        let cfg = MoeVarConfig::tiny();
        let vq = MultiScaleVq::generate(&cfg, 0, &Device::Cpu).unwrap();
        let x = Tensor::zeros((1, 3, 8, 8), DType::F32, &Device::Cpu).unwrap();
        assert!(vq.encode(&x).is_err());
    }
}
