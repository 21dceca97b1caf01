//! Ordered collection of named target images

use anyhow::{Context, Result};
use candle_core::{Device, Tensor};
use rayon::prelude::*;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use super::image_utils::image_to_tensor;
use crate::error::PtiError;

const IMAGE_EXTENSIONS: [&str; 5] = ["jpg", "jpeg", "png", "webp", "bmp"];

/// A target image and the name it is cached and saved under.
#[derive(Debug, Clone)]
pub struct ImageItem {
    pub name: String,
    /// `[1, C, H, W]` in [-1, 1]
    pub image: Tensor,
}

#[derive(Debug, Clone, Default)]
pub struct ImageDataset {
    items: Vec<ImageItem>,
}

impl ImageDataset {
    /// Load every image in `dir`, sorted by file name, resized to `resolution`.
    /// Images are named by their file stem; two files sharing a stem are rejected.
    pub fn from_dir(dir: &Path, resolution: usize, device: &Device) -> Result<Self> {
        let entries = fs::read_dir(dir)
            .with_context(|| format!("Failed to read dataset directory: {}", dir.display()))?;

        let mut paths: Vec<PathBuf> = Vec::new();
        for entry in entries {
            let path = entry?.path();
            let is_image = path
                .extension()
                .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_string_lossy().to_lowercase().as_str()))
                .unwrap_or(false);
            if is_image {
                paths.push(path);
            }
        }
        paths.sort();

        let mut seen: HashMap<String, &PathBuf> = HashMap::new();
        for path in &paths {
            let name = image_name(path)?;
            if let Some(first) = seen.insert(name.clone(), path) {
                return Err(PtiError::DuplicateImage {
                    id: name,
                    first: first.display().to_string(),
                    second: path.display().to_string(),
                }
                .into());
            }
        }

        // decode and resize on the CPU in parallel, then move to the target device
        let decoded: Vec<(String, Tensor)> = paths
            .par_iter()
            .map(|path| -> Result<(String, Tensor)> {
                let name = image_name(path)?;
                let img = image::open(path)
                    .with_context(|| format!("Failed to open image: {}", path.display()))?;
                Ok((name, image_to_tensor(&img, resolution, &Device::Cpu)?))
            })
            .collect::<Result<_>>()?;

        let items = decoded
            .into_iter()
            .map(|(name, image)| Ok(ImageItem { name, image: image.to_device(device)? }))
            .collect::<Result<Vec<_>>>()?;

        log::info!("Loaded {} images from {}", items.len(), dir.display());
        Ok(Self { items })
    }

    /// Build a dataset from already prepared tensors. Names must be unique.
    pub fn from_tensors(items: Vec<(String, Tensor)>) -> Result<Self> {
        let mut seen = HashSet::new();
        for (name, _) in &items {
            if !seen.insert(name.as_str()) {
                return Err(PtiError::DuplicateImage {
                    id: name.clone(),
                    first: name.clone(),
                    second: name.clone(),
                }
                .into());
            }
        }
        Ok(Self {
            items: items
                .into_iter()
                .map(|(name, image)| ImageItem { name, image })
                .collect(),
        })
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ImageItem> {
        self.items.iter()
    }

    /// The first `limit` images, in order.
    pub fn take(&self, limit: usize) -> impl Iterator<Item = &ImageItem> {
        self.items.iter().take(limit)
    }

    pub fn get(&self, name: &str) -> Option<&ImageItem> {
        self.items.iter().find(|item| item.name == name)
    }
}

fn image_name(path: &Path) -> Result<String> {
    path.file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .with_context(|| format!("Image path has no file name: {}", path.display()))
}
