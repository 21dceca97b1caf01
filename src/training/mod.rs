pub mod adam;
pub mod coaches;
pub mod data_loader;
pub mod image_utils;
pub mod progress;

pub use adam::{Adam, ParamsAdam};
pub use coaches::{Coach, CoachBuilder, MultiIdCoach, SingleIdCoach, TrainingReport, TrainingSession, TuningMode};
pub use data_loader::{ImageDataset, ImageItem};

use anyhow::{Context, Result};
use candle_core::Device;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::criteria::{LocalityConfig, LossConfig, LpipsType};
use crate::error::PtiError;
use crate::inversion::{InversionType, ProjectorConfig};
use crate::models::{EncoderConfig, GeneratorConfig, StyleGenerator};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub run_name: String,
    #[serde(default = "default_device")]
    pub device: String,
    #[serde(default)]
    pub coach: CoachKind,
    #[serde(default)]
    pub mode: TuningMode,
    pub generator: GeneratorConfig,
    #[serde(default)]
    pub encoder: EncoderConfig,
    #[serde(default)]
    pub hyperparameters: Hyperparameters,
    pub paths: PathsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_device() -> String {
    "cpu".to_string()
}

/// Which training strategy runs the session.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CoachKind {
    #[default]
    SingleId,
    MultiId,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Hyperparameters {
    pub lpips_type: LpipsType,
    pub first_inv_type: InversionType,
    pub latent_ball_num_of_samples: usize,
    pub locality_regularization_interval: usize,
    pub use_locality_regularization: bool,
    pub regularizer_l2_lambda: f64,
    pub regularizer_lpips_lambda: f64,
    pub regularizer_alpha: f64,
    pub pt_l2_lambda: f64,
    pub pt_lpips_lambda: f64,
    #[serde(alias = "LPIPS_value_threshold")]
    pub lpips_value_threshold: f64,
    pub max_pti_steps: usize,
    pub first_inv_steps: usize,
    pub max_images_to_invert: usize,
    pub pti_learning_rate: f64,
    pub first_inv_lr: f64,
    pub use_last_w_pivots: bool,
    pub w_avg_samples: usize,
}

impl Default for Hyperparameters {
    fn default() -> Self {
        Self {
            lpips_type: LpipsType::Alex,
            first_inv_type: InversionType::W,
            latent_ball_num_of_samples: 1,
            locality_regularization_interval: 1,
            use_locality_regularization: false,
            regularizer_l2_lambda: 0.1,
            regularizer_lpips_lambda: 0.1,
            regularizer_alpha: 30.0,
            pt_l2_lambda: 1.0,
            pt_lpips_lambda: 1.0,
            lpips_value_threshold: 0.06,
            max_pti_steps: 350,
            first_inv_steps: 450,
            max_images_to_invert: 30,
            pti_learning_rate: 3e-4,
            first_inv_lr: 5e-3,
            use_last_w_pivots: false,
            w_avg_samples: 600,
        }
    }
}

impl Hyperparameters {
    pub fn loss_config(&self) -> LossConfig {
        LossConfig {
            l2_lambda: self.pt_l2_lambda,
            lpips_lambda: self.pt_lpips_lambda,
            use_locality_regularization: self.use_locality_regularization,
        }
    }

    pub fn locality_config(&self) -> LocalityConfig {
        LocalityConfig {
            num_samples: self.latent_ball_num_of_samples,
            alpha: self.regularizer_alpha,
            l2_lambda: self.regularizer_l2_lambda,
            lpips_lambda: self.regularizer_lpips_lambda,
            ..Default::default()
        }
    }

    pub fn projector_config(&self) -> ProjectorConfig {
        ProjectorConfig {
            num_steps: self.first_inv_steps,
            w_avg_samples: self.w_avg_samples,
            initial_learning_rate: self.first_inv_lr,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    pub input_data: PathBuf,
    pub checkpoints_dir: PathBuf,
    pub embeddings_dir: PathBuf,
    #[serde(default)]
    pub e4e: Option<PathBuf>,
    #[serde(default)]
    pub lpips: Option<PathBuf>,
    /// Permit seeded encoder/LPIPS weights when no weight file is configured.
    /// Without it a missing `e4e` (for w+) or `lpips` file is a configuration error.
    #[serde(default)]
    pub allow_random_weights: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub log_every: usize,
    pub save_reconstructions: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            log_every: 10,
            save_reconstructions: false,
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), PtiError> {
        self.generator.validate()?;

        let hp = &self.hyperparameters;
        if hp.locality_regularization_interval == 0 {
            return Err(PtiError::InvalidConfig(
                "hyperparameters.locality_regularization_interval must be positive".to_string(),
            ));
        }
        let non_negative = [
            ("regularizer_l2_lambda", hp.regularizer_l2_lambda),
            ("regularizer_lpips_lambda", hp.regularizer_lpips_lambda),
            ("regularizer_alpha", hp.regularizer_alpha),
            ("pt_l2_lambda", hp.pt_l2_lambda),
            ("pt_lpips_lambda", hp.pt_lpips_lambda),
            ("pti_learning_rate", hp.pti_learning_rate),
            ("first_inv_lr", hp.first_inv_lr),
        ];
        for (name, value) in non_negative {
            if value < 0.0 || value.is_nan() {
                return Err(PtiError::InvalidConfig(format!(
                    "hyperparameters.{} must be non-negative, got {}",
                    name, value
                )));
            }
        }
        if hp.first_inv_type == InversionType::WPlus
            && self.paths.e4e.is_none()
            && !self.paths.allow_random_weights
        {
            return Err(PtiError::InvalidConfig(
                "first_inv_type w+ needs paths.e4e (or paths.allow_random_weights)".to_string(),
            ));
        }
        if self.logging.log_every == 0 {
            return Err(PtiError::InvalidConfig("logging.log_every must be positive".to_string()));
        }
        if log::LevelFilter::from_str(&self.logging.level).is_err() {
            return Err(PtiError::InvalidConfig(format!(
                "logging.level must be one of off, error, warn, info, debug, trace; got {}",
                self.logging.level
            )));
        }
        Ok(())
    }

    /// `cpu`, or `cuda` (falls back to CPU when no GPU is available).
    pub fn device(&self) -> Result<Device> {
        match self.device.to_lowercase().as_str() {
            "cpu" => Ok(Device::Cpu),
            "cuda" | "gpu" => Ok(Device::cuda_if_available(0)?),
            other => Err(PtiError::InvalidConfig(format!("unknown device: {}", other)).into()),
        }
    }
}

/// Build the generator, dataset and coach described by `config` and run the session.
pub fn train_from_config(config: Config) -> Result<TrainingReport> {
    config.validate()?;
    let device = config.device()?;
    let generator = StyleGenerator::from_config(config.generator.clone(), &device)?;
    log::info!(
        "Generator: {} parameters, {} layers, {}px",
        generator.num_elements(),
        config.generator.num_ws,
        config.generator.resolution
    );

    let dataset = ImageDataset::from_dir(&config.paths.input_data, config.generator.resolution, &device)?;
    if dataset.is_empty() {
        anyhow::bail!("No images found in {}", config.paths.input_data.display());
    }

    let kind = config.coach;
    let coach = CoachBuilder::new(config).generator(generator).build()?;
    match kind {
        CoachKind::SingleId => SingleIdCoach::new(coach).run_training_session(&dataset),
        CoachKind::MultiId => MultiIdCoach::new(coach).run_training_session(&dataset),
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let config_str = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = serde_yaml::from_str(&config_str)
        .with_context(|| format!("Failed to parse YAML config {}", path.display()))?;
    config.validate()?;

    Ok(config)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::models::generator::tests::toy_config;

    /// Small, fast configuration rooted in `dir`.
    pub(crate) fn toy_run_config(dir: &Path) -> Config {
        Config {
            run_name: "toy".to_string(),
            device: "cpu".to_string(),
            coach: CoachKind::SingleId,
            mode: TuningMode::W,
            generator: toy_config(),
            encoder: EncoderConfig {
                input_resolution: 16,
                channels: vec![4, 8],
                latent_avg_samples: 8,
                seed: 0,
            },
            hyperparameters: Hyperparameters {
                first_inv_steps: 3,
                w_avg_samples: 16,
                max_pti_steps: 3,
                ..Default::default()
            },
            paths: PathsConfig {
                input_data: dir.join("data"),
                checkpoints_dir: dir.join("checkpoints"),
                embeddings_dir: dir.join("embeddings"),
                e4e: None,
                lpips: None,
                allow_random_weights: true,
            },
            logging: LoggingConfig::default(),
        }
    }

    const MINIMAL_YAML: &str = r#"
run_name: faces
generator:
  z_dim: 8
  w_dim: 8
  num_ws: 3
  features: 16
  mapping_layers: 2
  img_channels: 3
  resolution: 8
paths:
  input_data: data
  checkpoints_dir: ckpt
  embeddings_dir: emb
"#;

    #[test]
    fn test_defaults_follow_reference_hyperparameters() -> Result<()> {
        let config: Config = serde_yaml::from_str(MINIMAL_YAML)?;
        config.validate()?;
        let hp = &config.hyperparameters;
        assert_eq!(hp.first_inv_type, InversionType::W);
        assert_eq!(hp.max_pti_steps, 350);
        assert_eq!(hp.first_inv_steps, 450);
        assert_eq!(hp.pti_learning_rate, 3e-4);
        assert_eq!(hp.lpips_value_threshold, 0.06);
        assert!(!hp.use_locality_regularization);
        assert_eq!(config.coach, CoachKind::SingleId);
        assert_eq!(config.mode, TuningMode::W);
        assert_eq!(config.device, "cpu");

        // batch size from older run files has no effect and is ignored
        let legacy = format!("{}hyperparameters:\n  train_batch_size: 4\n  max_pti_steps: 7\n", MINIMAL_YAML);
        let config: Config = serde_yaml::from_str(&legacy)?;
        assert_eq!(config.hyperparameters.max_pti_steps, 7);
        Ok(())
    }

    #[test]
    fn test_load_config_from_file() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("run.yaml");
        let yaml = format!(
            "{}coach: multi_id\nmode: s\nhyperparameters:\n  first_inv_type: w+\n  LPIPS_value_threshold: 0.1\n",
            MINIMAL_YAML
        );

        fs::write(&path, &yaml)?;
        let err = load_config(&path).unwrap_err();
        assert!(matches!(err.downcast_ref::<PtiError>(), Some(PtiError::InvalidConfig(_))));

        let yaml = yaml.replace("  embeddings_dir: emb\n", "  embeddings_dir: emb\n  allow_random_weights: true\n");
        fs::write(&path, &yaml)?;
        let config = load_config(&path)?;
        assert_eq!(config.coach, CoachKind::MultiId);
        assert_eq!(config.mode, TuningMode::S);
        assert_eq!(config.hyperparameters.first_inv_type, InversionType::WPlus);
        assert_eq!(config.hyperparameters.lpips_value_threshold, 0.1);
        Ok(())
    }

    #[test]
    fn test_train_from_config_end_to_end() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut config = toy_run_config(dir.path());
        config.hyperparameters.max_pti_steps = 2;
        config.hyperparameters.first_inv_steps = 2;
        config.hyperparameters.lpips_value_threshold = 0.0;

        let image = candle_core::Tensor::rand(-1f32, 1f32, (3, 12, 12), &Device::Cpu)?;
        image_utils::save_image(&image, config.paths.input_data.join("portrait.png"))?;

        let report = train_from_config(config.clone())?;
        assert_eq!(report.images.len(), 1);
        assert_eq!(report.images[0].image_id, "portrait");
        assert!(config.paths.checkpoints_dir.join("model_toy_portrait.safetensors").exists());
        assert!(config.paths.embeddings_dir.join("toy").join("portrait").join("0.safetensors").exists());

        config.coach = CoachKind::MultiId;
        config.hyperparameters.first_inv_type = InversionType::WPlus;
        let report = train_from_config(config.clone())?;
        assert_eq!(report.coach, CoachKind::MultiId);
        assert!(config.paths.checkpoints_dir.join("model_toy_multi_id.safetensors").exists());
        Ok(())
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let dir = Path::new("/tmp");
        let mut config = toy_run_config(dir);
        config.hyperparameters.locality_regularization_interval = 0;
        assert!(config.validate().is_err());

        let mut config = toy_run_config(dir);
        config.hyperparameters.pt_l2_lambda = -1.0;
        assert!(config.validate().is_err());

        let mut config = toy_run_config(dir);
        config.generator.num_ws = 0;
        assert!(config.validate().is_err());

        let mut config = toy_run_config(dir);
        config.logging.level = "verbose".to_string();
        assert!(matches!(config.validate(), Err(PtiError::InvalidConfig(_))));
        config.logging.level = "DEBUG".to_string();
        assert!(config.validate().is_ok());

        let mut config = toy_run_config(dir);
        config.device = "tpu".to_string();
        assert!(config.device().is_err());
    }
}
