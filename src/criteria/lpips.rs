//! LPIPS-style learned perceptual distance
//!
//! Images in [-1, 1] go through the LPIPS scaling layer and a stack of
//! 3x3 conv + ReLU stages. Channel-normalised feature differences are weighted
//! by non-negative linear heads, averaged spatially and summed over stages.
//! The network is frozen: every weight is stored as a buffer and detached on use.

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::path::Path;

use super::PerceptualDistance;
use crate::error::ensure_compatible;
use crate::models::params::{seeded_normal, ParameterStore};

const LPIPS_SHIFT: [f32; 3] = [-0.030, -0.088, -0.188];
const LPIPS_SCALE: [f32; 3] = [0.458, 0.448, 0.450];

/// Feature stack width preset.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LpipsType {
    #[default]
    Alex,
    Vgg,
}

impl LpipsType {
    pub fn channels(&self) -> Vec<usize> {
        match self {
            LpipsType::Alex => vec![32, 64, 128],
            LpipsType::Vgg => vec![32, 64, 128, 256],
        }
    }
}

struct Stage {
    kernel: Tensor,
    bias: Tensor,
    lin: Tensor,
}

pub struct Lpips {
    store: ParameterStore,
    stages: Vec<Stage>,
    shift: Option<Tensor>,
    scale: Option<Tensor>,
}

impl Lpips {
    /// Build the network with seeded weights.
    pub fn new(channels: &[usize], in_channels: usize, seed: u64, device: &Device) -> Result<Self> {
        let mut store = ParameterStore::new(device, DType::F32);
        let mut rng = StdRng::seed_from_u64(seed);

        let mut stages = Vec::with_capacity(channels.len());
        let mut prev = in_channels;
        for (i, &out) in channels.iter().enumerate() {
            let std = (2.0 / (prev * 9) as f64).sqrt();
            let kernel = store.register_buffer(
                format!("net.slice{}.weight", i),
                &seeded_normal((out, prev, 3, 3), std, &mut rng, device)?,
            )?;
            let bias = store.register_buffer(
                format!("net.slice{}.bias", i),
                &Tensor::zeros((1, out, 1, 1), DType::F32, device)?,
            )?;
            let lin = store.register_buffer(
                format!("lin{}.weight", i),
                &(Tensor::ones((1, out, 1, 1), DType::F32, device)? / out as f64)?,
            )?;
            stages.push(Stage { kernel, bias, lin });
            prev = out;
        }

        let (shift, scale) = if in_channels == 3 {
            (
                Some(Tensor::from_slice(&LPIPS_SHIFT, (1, 3, 1, 1), device)?),
                Some(Tensor::from_slice(&LPIPS_SCALE, (1, 3, 1, 1), device)?),
            )
        } else {
            (None, None)
        };

        Ok(Self { store, stages, shift, scale })
    }

    pub fn from_type(lpips_type: LpipsType, in_channels: usize, device: &Device) -> Result<Self> {
        Self::new(&lpips_type.channels(), in_channels, 0, device)
    }

    /// Load converted LPIPS weights; tensor names follow `net.slice{i}.*` / `lin{i}.weight`.
    pub fn load(&self, path: &Path) -> Result<()> {
        self.store
            .load(path)
            .with_context(|| format!("Failed to load LPIPS weights {}", path.display()))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        self.store.save(path)
    }

    fn scale_input(&self, x: &Tensor) -> Result<Tensor> {
        match (&self.shift, &self.scale) {
            (Some(shift), Some(scale)) => Ok(x.broadcast_sub(shift)?.broadcast_div(scale)?),
            _ => Ok(x.clone()),
        }
    }
}

fn normalize_channels(x: &Tensor) -> Result<Tensor> {
    let norm = (x.sqr()?.sum_keepdim(1)? + 1e-10)?.sqrt()?;
    Ok(x.broadcast_div(&norm)?)
}

impl PerceptualDistance for Lpips {
    fn distance(&self, a: &Tensor, b: &Tensor) -> Result<Tensor> {
        ensure_compatible("lpips", a, b)?;
        let batch = a.dim(0)?;
        let mut fa = self.scale_input(&a.to_dtype(DType::F32)?)?;
        let mut fb = self.scale_input(&b.to_dtype(DType::F32)?)?;
        let mut total = Tensor::zeros(batch, DType::F32, a.device())?;

        for (i, stage) in self.stages.iter().enumerate() {
            if i > 0 {
                let (_, _, h, w) = fa.dims4()?;
                if h < 2 || w < 2 {
                    break;
                }
                fa = fa.avg_pool2d(2)?;
                fb = fb.avg_pool2d(2)?;
            }
            let kernel = stage.kernel.detach();
            let bias = stage.bias.detach();
            fa = fa.conv2d(&kernel, 1, 1, 1, 1)?.broadcast_add(&bias)?.relu()?;
            fb = fb.conv2d(&kernel, 1, 1, 1, 1)?.broadcast_add(&bias)?.relu()?;

            let diff = (normalize_channels(&fa)? - normalize_channels(&fb)?)?.sqr()?;
            let weighted = diff.broadcast_mul(&stage.lin.detach())?.sum_keepdim(1)?;
            let per_sample = weighted.mean((1, 2, 3))?;
            total = (total + per_sample)?;
        }
        Ok(total)
    }
}
