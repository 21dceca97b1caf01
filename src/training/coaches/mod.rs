//! Shared tuning machinery and the concrete training strategies built on it
//!
//! A `Coach` owns the working generator, a frozen copy of the original, the
//! optimizer, the loss aggregator with its locality regularizer, and the pivot
//! cache. Strategies (`SingleIdCoach`, `MultiIdCoach`) only decide the loop
//! structure and go through the coach's primitives for everything else.

pub mod multi_id;
pub mod single_id;

pub use multi_id::MultiIdCoach;
pub use single_id::SingleIdCoach;

use anyhow::{Context, Result};
use candle_core::{Device, Tensor};
use candle_nn::Optimizer;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::adam::{Adam, ParamsAdam};
use super::data_loader::ImageDataset;
use super::image_utils::save_image;
use super::{CoachKind, Config};
use crate::criteria::{LocalityRegularizer, LossAggregator, LossBreakdown, Lpips, PerceptualDistance};
use crate::error::PtiError;
use crate::inversion::{inverter_from_config, load_pivot, pivot_path, save_pivot, Inverter, PivotCache};
use crate::models::{Generator, NoiseMode, ParameterGroup, TaggedParameter};

/// Which generator parameters are tuned.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum TuningMode {
    /// Every generator parameter.
    #[default]
    #[serde(rename = "w")]
    W,
    /// Everything except the style-modulation projections.
    #[serde(rename = "s")]
    S,
}

impl TuningMode {
    pub fn selects(&self, group: ParameterGroup) -> bool {
        match self {
            TuningMode::W => true,
            TuningMode::S => group != ParameterGroup::StyleModulation,
        }
    }
}

/// Scalar values of one loss evaluation.
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq)]
pub struct LossValues {
    pub total: f32,
    pub l2: Option<f32>,
    pub lpips: Option<f32>,
    pub locality: Option<f32>,
}

impl LossValues {
    pub fn from_breakdown(loss: &LossBreakdown) -> Result<Self> {
        Ok(Self {
            total: loss.total_value()?,
            l2: loss.l2_value()?,
            lpips: loss.lpips_value()?,
            locality: loss.locality_value()?,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ImageReport {
    pub image_id: String,
    /// Optimizer steps taken on this image.
    pub steps: usize,
    pub stopped_early: bool,
    pub final_loss: Option<LossValues>,
    pub pivot: PathBuf,
    pub reconstruction: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TrainingReport {
    pub run_name: String,
    pub coach: CoachKind,
    pub mode: TuningMode,
    pub images: Vec<ImageReport>,
    pub checkpoints: Vec<PathBuf>,
}

impl TrainingReport {
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create directory: {}", dir.display()))?;
        }
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json).with_context(|| format!("Failed to write report {}", path.display()))?;
        Ok(())
    }
}

/// A complete tuning run over a dataset.
pub trait TrainingSession {
    fn run_training_session(&mut self, dataset: &ImageDataset) -> Result<TrainingReport>;
}

pub struct Coach<G: Generator + 'static> {
    config: Config,
    g: G,
    original_g: Arc<G>,
    perceptual: Arc<dyn PerceptualDistance>,
    inverter: Box<dyn Inverter<G>>,
    loss: LossAggregator,
    space_regularizer: LocalityRegularizer<G>,
    optimizer: Adam,
    pivots: PivotCache,
    image_counter: usize,
    training_step: usize,
    device: Device,
    mode: TuningMode,
}

/// Assembles a `Coach`. Only the generator is mandatory; the perceptual
/// network and the inverter default to what the configuration selects.
pub struct CoachBuilder<G: Generator + 'static> {
    config: Config,
    generator: Option<G>,
    perceptual: Option<Arc<dyn PerceptualDistance>>,
    inverter: Option<Box<dyn Inverter<G>>>,
}

impl<G: Generator + 'static> CoachBuilder<G> {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            generator: None,
            perceptual: None,
            inverter: None,
        }
    }

    pub fn generator(mut self, generator: G) -> Self {
        self.generator = Some(generator);
        self
    }

    pub fn perceptual(mut self, perceptual: Arc<dyn PerceptualDistance>) -> Self {
        self.perceptual = Some(perceptual);
        self
    }

    pub fn inverter(mut self, inverter: Box<dyn Inverter<G>>) -> Self {
        self.inverter = Some(inverter);
        self
    }

    pub fn build(self) -> Result<Coach<G>> {
        let mut g = self.generator.ok_or(PtiError::MissingGenerator)?;
        let config = self.config;
        config.validate()?;
        let device = g.device().clone();

        let perceptual = match self.perceptual {
            Some(perceptual) => perceptual,
            None => default_perceptual(&config, &device)?,
        };
        let original_g = Arc::new(g.frozen_copy()?);
        let inverter = match self.inverter {
            Some(inverter) => inverter,
            None => inverter_from_config(&config, original_g.as_ref(), perceptual.clone())?,
        };

        let hp = &config.hyperparameters;
        g.set_requires_grad(true);
        let loss = LossAggregator::new(hp.loss_config(), perceptual.clone());
        let space_regularizer =
            LocalityRegularizer::new(original_g.clone(), perceptual.clone(), hp.locality_config());
        let optimizer = build_optimizer(&g, config.mode, hp.pti_learning_rate)?;
        let mode = config.mode;

        log::info!(
            "Coach ready: {} trainable tensors (mode {:?}) on {:?}",
            optimizer.num_params(),
            mode,
            device
        );

        Ok(Coach {
            config,
            g,
            original_g,
            perceptual,
            inverter,
            loss,
            space_regularizer,
            optimizer,
            pivots: PivotCache::new(),
            image_counter: 0,
            training_step: 0,
            device,
            mode,
        })
    }
}

fn default_perceptual(config: &Config, device: &Device) -> Result<Arc<dyn PerceptualDistance>> {
    let lpips = Lpips::from_type(
        config.hyperparameters.lpips_type,
        config.generator.img_channels,
        device,
    )?;
    match &config.paths.lpips {
        Some(path) => lpips.load(path)?,
        None if config.paths.allow_random_weights => {
            log::warn!("No LPIPS weights configured, using seeded perceptual network")
        }
        None => {
            return Err(PtiError::InvalidConfig(
                "paths.lpips is required unless paths.allow_random_weights is set".to_string(),
            )
            .into())
        }
    }
    Ok(Arc::new(lpips))
}

fn trainable<G: Generator>(g: &G, mode: TuningMode) -> Vec<TaggedParameter> {
    g.parameters()
        .into_iter()
        .filter(|p| mode.selects(p.group))
        .collect()
}

fn build_optimizer<G: Generator>(g: &G, mode: TuningMode, lr: f64) -> Result<Adam> {
    Ok(Adam::from_parameters(&trainable(g, mode), ParamsAdam::with_lr(lr))?)
}

impl<G: Generator + 'static> Coach<G> {
    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn generator(&self) -> &G {
        &self.g
    }

    pub fn original_generator(&self) -> &G {
        &self.original_g
    }

    pub fn optimizer(&self) -> &Adam {
        &self.optimizer
    }

    pub fn pivots(&self) -> &PivotCache {
        &self.pivots
    }

    pub fn image_counter(&self) -> usize {
        self.image_counter
    }

    pub fn training_step(&self) -> usize {
        self.training_step
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn mode(&self) -> TuningMode {
        self.mode
    }

    /// Start an independent run: restore the original weights, re-enable
    /// gradients and discard the regularizer and optimizer state.
    pub fn restart_training(&mut self) -> Result<()> {
        self.g.load_state_from(&self.original_g)?;
        self.g.set_requires_grad(true);
        self.space_regularizer = LocalityRegularizer::new(
            self.original_g.clone(),
            self.perceptual.clone(),
            self.config.hyperparameters.locality_config(),
        );
        self.optimizer = self.configure_optimizers(self.mode)?;
        Ok(())
    }

    pub fn trainable_parameters(&self, mode: TuningMode) -> Vec<TaggedParameter> {
        trainable(&self.g, mode)
    }

    pub fn configure_optimizers(&self, mode: TuningMode) -> Result<Adam> {
        build_optimizer(&self.g, mode, self.config.hyperparameters.pti_learning_rate)
    }

    /// Cached pivot for `image_id`, computing and caching it on a miss.
    pub fn get_inversion(&mut self, image_id: &str, image: &Tensor) -> Result<Tensor> {
        if let Some(pivot) = self.pivots.get(image_id) {
            return Ok(pivot.to_device(&self.device)?);
        }

        let pivot = match self.load_last_pivot(image_id)? {
            Some(pivot) => pivot,
            None => {
                let image = image.to_device(&self.device)?;
                self.inverter.invert(&self.original_g, &image, image_id)?
            }
        };
        let pivot = pivot.detach().to_device(&self.device)?;
        Ok(self.pivots.insert(image_id, pivot).clone())
    }

    fn load_last_pivot(&self, image_id: &str) -> Result<Option<Tensor>> {
        if !self.config.hyperparameters.use_last_w_pivots {
            return Ok(None);
        }
        let path = pivot_path(&self.config.paths.embeddings_dir, &self.config.run_name, image_id);
        match load_pivot(&path, image_id, &self.device) {
            Ok(pivot) => {
                log::info!("Loaded pivot for {} from {}", image_id, path.display());
                Ok(Some(pivot))
            }
            Err(err) if matches!(err.downcast_ref::<PtiError>(), Some(PtiError::MissingPivot(_))) => {
                log::warn!("No stored pivot for {}, inverting", image_id);
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    /// Deterministic full-precision synthesis through the working generator.
    pub fn forward(&self, w: &Tensor) -> Result<Tensor> {
        let w = w.to_device(&self.device)?;
        self.g.synthesize(&w, NoiseMode::Const, true)
    }

    pub fn calc_loss(
        &self,
        generated: &Tensor,
        real: &Tensor,
        use_ball_holder: bool,
        w_batch: &Tensor,
    ) -> Result<LossBreakdown> {
        let real = real.to_device(&self.device)?;
        self.loss.loss(generated, &real, use_ball_holder, || {
            self.space_regularizer.penalty(&self.g, w_batch)
        })
    }

    /// Backpropagate `loss` and apply one optimizer update.
    pub fn optimizer_step(&mut self, loss: &Tensor) -> Result<()> {
        self.optimizer.backward_step(loss)?;
        Ok(())
    }

    /// Ball holder flag for the next step; advances the session step counter.
    pub fn next_ball_holder(&mut self) -> bool {
        let interval = self.config.hyperparameters.locality_regularization_interval.max(1);
        let use_ball_holder = self.training_step % interval == 0;
        self.training_step += 1;
        use_ball_holder
    }

    pub fn persist_pivot(&self, image_id: &str, pivot: &Tensor) -> Result<PathBuf> {
        let path = pivot_path(&self.config.paths.embeddings_dir, &self.config.run_name, image_id);
        save_pivot(&path, pivot)?;
        Ok(path)
    }

    /// `<checkpoints_dir>/model_<run_name>_<suffix>.safetensors`
    pub fn checkpoint_path(&self, suffix: &str) -> PathBuf {
        self.config
            .paths
            .checkpoints_dir
            .join(format!("model_{}_{}.safetensors", self.config.run_name, suffix))
    }

    pub fn save_generator(&self, suffix: &str) -> Result<PathBuf> {
        let path = self.checkpoint_path(suffix);
        fs::create_dir_all(&self.config.paths.checkpoints_dir).with_context(|| {
            format!("Failed to create directory: {}", self.config.paths.checkpoints_dir.display())
        })?;
        self.g.save(&path)?;
        log::info!("Saved tuned generator to {}", path.display());
        Ok(path)
    }

    /// Write the current reconstruction of `image_id` when enabled in the logging config.
    pub fn save_reconstruction(&self, image_id: &str, pivot: &Tensor) -> Result<Option<PathBuf>> {
        if !self.config.logging.save_reconstructions {
            return Ok(None);
        }
        let path = self
            .config
            .paths
            .checkpoints_dir
            .join("reconstructions")
            .join(format!("{}_{}.png", self.config.run_name, image_id));
        let image = self.forward(pivot)?.detach();
        save_image(&image, &path)?;
        Ok(Some(path))
    }

    pub fn report_path(&self) -> PathBuf {
        self.config
            .paths
            .checkpoints_dir
            .join(format!("report_{}.json", self.config.run_name))
    }
}
