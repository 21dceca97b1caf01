//! Latent inversion: finding the pivot code for a real image
//!
//! Two interchangeable strategies implement `Inverter`: direct optimisation in
//! W space (`ProjectorInversion`) and a single encoder pass (`EncoderInversion`).

pub mod encoder;
pub mod projector;

pub use encoder::EncoderInversion;
pub use projector::{project, ProjectorConfig, ProjectorInversion};

use anyhow::{Context, Result};
use candle_core::{Device, Tensor};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::criteria::PerceptualDistance;
use crate::error::PtiError;
use crate::models::{E4eEncoder, Generator};
use crate::training::Config;

/// Which inversion strategy seeds the tuning run.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum InversionType {
    /// Direct optimisation of a single shared code.
    #[default]
    #[serde(rename = "w")]
    W,
    /// Encoder prediction of one code per generator layer.
    #[serde(rename = "w+")]
    WPlus,
}

pub trait Inverter<G: Generator> {
    /// Latent codes `[1, num_ws, w_dim]` reproducing `image`, detached from any graph.
    fn invert(&self, generator: &G, image: &Tensor, image_id: &str) -> Result<Tensor>;
}

/// Build the inverter selected by `hyperparameters.first_inv_type`.
pub fn inverter_from_config<G: Generator + 'static>(
    config: &Config,
    generator: &G,
    perceptual: Arc<dyn PerceptualDistance>,
) -> Result<Box<dyn Inverter<G>>> {
    match config.hyperparameters.first_inv_type {
        InversionType::W => Ok(Box::new(ProjectorInversion::new(
            config.hyperparameters.projector_config(),
            perceptual,
        ))),
        InversionType::WPlus => {
            let encoder = E4eEncoder::new(config.encoder.clone(), generator)?;
            match &config.paths.e4e {
                Some(path) => encoder.load(path)?,
                None => log::warn!("No e4e checkpoint configured, using seeded encoder weights"),
            }
            Ok(Box::new(EncoderInversion::new(Box::new(encoder), config.encoder.input_resolution)))
        }
    }
}

/// Pivots computed so far in this session, keyed by image name.
#[derive(Default)]
pub struct PivotCache {
    pivots: HashMap<String, Tensor>,
}

impl PivotCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, image_id: &str) -> Option<&Tensor> {
        self.pivots.get(image_id)
    }

    pub fn contains(&self, image_id: &str) -> bool {
        self.pivots.contains_key(image_id)
    }

    /// Store a pivot. An existing entry is never replaced; the stored pivot is returned.
    pub fn insert(&mut self, image_id: impl Into<String>, pivot: Tensor) -> &Tensor {
        self.pivots.entry(image_id.into()).or_insert(pivot)
    }

    pub fn len(&self) -> usize {
        self.pivots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pivots.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Tensor)> {
        self.pivots.iter().map(|(k, v)| (k.as_str(), v))
    }
}

/// `<embeddings_dir>/<run_name>/<image_id>/0.safetensors`
pub fn pivot_path(embeddings_dir: &Path, run_name: &str, image_id: &str) -> PathBuf {
    embeddings_dir.join(run_name).join(image_id).join("0.safetensors")
}

pub fn save_pivot(path: &Path, pivot: &Tensor) -> Result<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create directory: {}", dir.display()))?;
    }
    let tensors = HashMap::from([("w".to_string(), pivot.detach())]);
    candle_core::safetensors::save(&tensors, path)
        .with_context(|| format!("Failed to save pivot to {}", path.display()))?;
    Ok(())
}

pub fn load_pivot(path: &Path, image_id: &str, device: &Device) -> Result<Tensor> {
    if !path.exists() {
        return Err(PtiError::MissingPivot(image_id.to_string()).into());
    }
    let mut tensors = candle_core::safetensors::load(path, device)
        .with_context(|| format!("Failed to read pivot {}", path.display()))?;
    tensors
        .remove("w")
        .ok_or_else(|| PtiError::MissingPivot(image_id.to_string()).into())
}
