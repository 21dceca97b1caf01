//! Direct optimisation of a single W code against a target image
//!
//! Starts from the mean code of the mapping network, perturbs it with
//! decaying noise and follows a ramped learning rate schedule while
//! minimising the perceptual distance between synthesis and target.

use anyhow::{Context, Result};
use candle_core::{DType, Tensor, Var};
use candle_nn::Optimizer;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::f64::consts::PI;
use std::sync::Arc;

use super::Inverter;
use crate::criteria::PerceptualDistance;
use crate::models::params::seeded_normal;
use crate::models::{Generator, NoiseMode};
use crate::training::adam::{Adam, ParamsAdam};
use crate::training::image_utils::resize_square;

#[derive(Debug, Clone, PartialEq)]
pub struct ProjectorConfig {
    pub num_steps: usize,
    /// Mapping samples used to estimate the mean code and its spread.
    pub w_avg_samples: usize,
    pub initial_learning_rate: f64,
    pub initial_noise_factor: f64,
    pub lr_rampdown_length: f64,
    pub lr_rampup_length: f64,
    pub noise_ramp_length: f64,
    pub seed: u64,
    /// Images larger than this are pooled down before comparison.
    pub max_resolution: usize,
}

impl Default for ProjectorConfig {
    fn default() -> Self {
        Self {
            num_steps: 450,
            w_avg_samples: 600,
            initial_learning_rate: 5e-3,
            initial_noise_factor: 0.05,
            lr_rampdown_length: 0.25,
            lr_rampup_length: 0.05,
            noise_ramp_length: 0.75,
            seed: 123,
            max_resolution: 256,
        }
    }
}

impl ProjectorConfig {
    /// Learning rate at progress `t` in [0, 1): cosine rampdown times linear rampup.
    pub fn learning_rate_at(&self, t: f64) -> f64 {
        let rampdown = ((1.0 - t) / self.lr_rampdown_length).min(1.0);
        let rampdown = 0.5 - 0.5 * (rampdown * PI).cos();
        let rampup = if self.lr_rampup_length > 0.0 {
            (t / self.lr_rampup_length).min(1.0)
        } else {
            1.0
        };
        self.initial_learning_rate * rampdown * rampup
    }

    /// Standard deviation of the noise added to the code at progress `t`.
    pub fn noise_scale_at(&self, w_std: f64, t: f64) -> f64 {
        let remaining = (1.0 - t / self.noise_ramp_length).max(0.0);
        w_std * self.initial_noise_factor * remaining * remaining
    }
}

fn fit_resolution(images: &Tensor, max_resolution: usize) -> Result<Tensor> {
    let (_, _, h, _) = images.dims4()?;
    if h > max_resolution {
        resize_square(images, max_resolution)
    } else {
        Ok(images.clone())
    }
}

/// Find the W code (broadcast to every layer) that best reproduces `target`.
///
/// Returns `[1, num_ws, w_dim]`, detached.
pub fn project<G: Generator>(
    generator: &G,
    target: &Tensor,
    perceptual: &dyn PerceptualDistance,
    config: &ProjectorConfig,
    image_id: &str,
) -> Result<Tensor> {
    let device = generator.device().clone();
    let (num_ws, w_dim) = (generator.num_ws(), generator.w_dim());

    let mut rng = StdRng::seed_from_u64(config.seed);
    let samples = config.w_avg_samples.max(1);
    let z = seeded_normal((samples, generator.z_dim()), 1.0, &mut rng, &device)?;
    let w_samples = generator
        .mapping(&z, 1.0)?
        .narrow(1, 0, 1)?
        .to_dtype(DType::F32)?
        .detach();
    let w_avg = w_samples.mean_keepdim(0)?;
    let w_std = (w_samples.broadcast_sub(&w_avg)?.sqr()?.sum_all()?.to_scalar::<f32>()? as f64
        / samples as f64)
        .sqrt();

    let target = target
        .to_device(&device)
        .context("Failed to move target image to the generator device")?
        .to_dtype(DType::F32)?
        .detach();
    let target = fit_resolution(&target, config.max_resolution)?;

    let w_opt = Var::from_tensor(&w_avg)?;
    let mut optimizer = Adam::new(
        vec![w_opt.clone()],
        ParamsAdam {
            lr: config.initial_learning_rate,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            weight_decay: 0.0,
        },
    )?;

    for step in 0..config.num_steps {
        let t = step as f64 / config.num_steps as f64;
        optimizer.set_learning_rate(config.learning_rate_at(t));

        let noise_scale = config.noise_scale_at(w_std, t);
        let w_noise = (Tensor::randn(0f32, 1f32, w_avg.dims(), &device)? * noise_scale)?;
        let ws = (w_opt.as_tensor() + w_noise)?.broadcast_as((1, num_ws, w_dim))?;

        let synth = generator.synthesize(&ws, NoiseMode::Const, true)?;
        let synth = fit_resolution(&synth, config.max_resolution)?;
        let dist = perceptual.distance(&target, &synth)?.sum_all()?;
        optimizer.backward_step(&dist)?;

        if step % 50 == 0 || step + 1 == config.num_steps {
            log::debug!(
                "[{}] projection step {}/{}: dist {:.4}",
                image_id,
                step + 1,
                config.num_steps,
                dist.to_scalar::<f32>()?
            );
        }
    }

    Ok(w_opt
        .as_tensor()
        .detach()
        .broadcast_as((1, num_ws, w_dim))?
        .contiguous()?)
}

/// W-space inversion by projection.
pub struct ProjectorInversion {
    config: ProjectorConfig,
    perceptual: Arc<dyn PerceptualDistance>,
}

impl ProjectorInversion {
    pub fn new(config: ProjectorConfig, perceptual: Arc<dyn PerceptualDistance>) -> Self {
        Self { config, perceptual }
    }

    pub fn config(&self) -> &ProjectorConfig {
        &self.config
    }
}

impl<G: Generator> Inverter<G> for ProjectorInversion {
    fn invert(&self, generator: &G, image: &Tensor, image_id: &str) -> Result<Tensor> {
        log::info!("Projecting {} ({} steps)", image_id, self.config.num_steps);
        project(generator, image, self.perceptual.as_ref(), &self.config, image_id)
    }
}
