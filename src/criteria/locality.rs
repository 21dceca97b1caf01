//! Locality regularization ("ball holder" loss)
//!
//! Keeps the tuned generator close to the original one away from the pivot:
//! random codes from the original mapping network are pulled onto a sphere of
//! radius `alpha` around the pivot, and both generators' outputs there are compared.

use anyhow::Result;
use candle_core::{DType, Tensor};
use std::sync::Arc;

use super::{l2_loss, PerceptualDistance};
use crate::models::{Generator, NoiseMode};

#[derive(Debug, Clone, PartialEq)]
pub struct LocalityConfig {
    pub num_samples: usize,
    pub alpha: f64,
    pub l2_lambda: f64,
    pub lpips_lambda: f64,
    pub truncation_psi: f64,
}

impl Default for LocalityConfig {
    fn default() -> Self {
        Self {
            num_samples: 1,
            alpha: 30.0,
            l2_lambda: 0.1,
            lpips_lambda: 0.1,
            truncation_psi: 0.5,
        }
    }
}

pub struct LocalityRegularizer<G: Generator> {
    original: Arc<G>,
    perceptual: Arc<dyn PerceptualDistance>,
    config: LocalityConfig,
}

impl<G: Generator> LocalityRegularizer<G> {
    pub fn new(original: Arc<G>, perceptual: Arc<dyn PerceptualDistance>, config: LocalityConfig) -> Self {
        Self { original, perceptual, config }
    }

    pub fn config(&self) -> &LocalityConfig {
        &self.config
    }

    /// False when the penalty would be identically zero.
    pub fn is_active(&self) -> bool {
        self.config.num_samples > 0 && (self.config.l2_lambda > 0.0 || self.config.lpips_lambda > 0.0)
    }

    /// Move from `pivot` towards `w_code` by exactly `alpha` (L2 over the whole code).
    pub fn morph(&self, w_code: &Tensor, pivot: &Tensor) -> Result<Tensor> {
        let direction = w_code.broadcast_sub(pivot)?;
        let norm = (direction.sqr()?.sum_all()? + 1e-12)?.sqrt()?;
        let step = (direction.broadcast_div(&norm)? * self.config.alpha)?;
        Ok(pivot.broadcast_add(&step)?)
    }

    /// Scalar drift penalty of `tuned` relative to the original generator near `pivot`.
    pub fn penalty(&self, tuned: &G, pivot: &Tensor) -> Result<Tensor> {
        let device = pivot.device();
        let mut loss = Tensor::zeros((), DType::F32, device)?;
        if !self.is_active() {
            return Ok(loss);
        }

        let n = self.config.num_samples;
        let z = Tensor::randn(0f32, 1f32, (n, self.original.z_dim()), self.original.device())?;
        let w_samples = self
            .original
            .mapping(&z, self.config.truncation_psi)?
            .to_device(device)?
            .detach();
        let pivot = pivot.detach();

        for i in 0..n {
            let w_code = self.morph(&w_samples.narrow(0, i, 1)?, &pivot)?;
            let new_img = tuned.synthesize(&w_code, NoiseMode::None, true)?;
            let old_img = self.original.synthesize(&w_code, NoiseMode::None, true)?.detach();

            if self.config.l2_lambda > 0.0 {
                loss = (loss + (l2_loss(&old_img, &new_img)? * self.config.l2_lambda)?)?;
            }
            if self.config.lpips_lambda > 0.0 {
                let lpips = self.perceptual.distance(&old_img, &new_img)?.mean_all()?;
                loss = (loss + (lpips * self.config.lpips_lambda)?)?;
            }
        }

        Ok((loss / n as f64)?)
    }
}
