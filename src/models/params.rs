//! Named, group-tagged parameter storage
//!
//! Every trainable tensor is declared together with the role it plays in the
//! network, so optimizers can select subsets by role instead of by name.

use anyhow::{Context, Result};
use candle_core::{DType, Device, Shape, Tensor, Var};
use candle_nn::Init;
use rand::rngs::StdRng;
use rand_distr::{Distribution, Normal};
use std::collections::HashMap;
use std::path::Path;

/// Role of a parameter inside a style-based network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParameterGroup {
    /// Latent mapping network.
    Mapping,
    /// Per-layer affine projections producing modulation styles.
    StyleModulation,
    /// Everything else on the image path: constant input, layer weights, biases, noise strengths.
    Synthesis,
}

/// A trainable variable together with its name and role.
#[derive(Clone)]
pub struct TaggedParameter {
    pub name: String,
    pub group: ParameterGroup,
    pub var: Var,
}

impl std::fmt::Debug for TaggedParameter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaggedParameter")
            .field("name", &self.name)
            .field("group", &self.group)
            .field("shape", &self.var.dims())
            .finish()
    }
}

/// Owns the variables of one network instance.
///
/// Buffers are stored as variables too so that `load`/`copy_from` can overwrite
/// them in place, but they are never handed out as parameters.
pub struct ParameterStore {
    device: Device,
    dtype: DType,
    params: Vec<TaggedParameter>,
    buffers: Vec<(String, Var)>,
}

impl ParameterStore {
    pub fn new(device: &Device, dtype: DType) -> Self {
        Self {
            device: device.clone(),
            dtype,
            params: Vec::new(),
            buffers: Vec::new(),
        }
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Declare a parameter initialised with a candle-nn `Init` and return its tensor.
    pub fn register<S: Into<Shape>>(
        &mut self,
        name: impl Into<String>,
        group: ParameterGroup,
        shape: S,
        init: Init,
    ) -> Result<Tensor> {
        let var = init.var(shape, self.dtype, &self.device)?;
        Ok(self.push_param(name.into(), group, var))
    }

    /// Declare a non-trainable buffer.
    pub fn register_buffer(&mut self, name: impl Into<String>, value: &Tensor) -> Result<Tensor> {
        let value = value.to_dtype(self.dtype)?.to_device(&self.device)?;
        let var = Var::from_tensor(&value)?;
        let tensor = var.as_tensor().clone();
        self.buffers.push((name.into(), var));
        Ok(tensor)
    }

    /// Overwrite a registered buffer in place.
    pub fn set_buffer(&self, name: &str, value: &Tensor) -> Result<()> {
        let (_, var) = self
            .buffers
            .iter()
            .find(|(n, _)| n == name)
            .with_context(|| format!("No buffer named {}", name))?;
        var.set(&value.to_dtype(self.dtype)?.to_device(&self.device)?)
            .with_context(|| format!("Buffer {} has a different shape", name))?;
        Ok(())
    }

    fn push_param(&mut self, name: String, group: ParameterGroup, var: Var) -> Tensor {
        let tensor = var.as_tensor().clone();
        self.params.push(TaggedParameter { name, group, var });
        tensor
    }

    pub fn parameters(&self) -> &[TaggedParameter] {
        &self.params
    }

    pub fn num_elements(&self) -> usize {
        self.params.iter().map(|p| p.var.elem_count()).sum()
    }

    fn entries(&self) -> impl Iterator<Item = (&str, &Var)> {
        self.params
            .iter()
            .map(|p| (p.name.as_str(), &p.var))
            .chain(self.buffers.iter().map(|(n, v)| (n.as_str(), v)))
    }

    /// Overwrite every parameter and buffer with the same-named value from `other`.
    pub fn copy_from(&self, other: &ParameterStore) -> Result<()> {
        let source: HashMap<&str, &Var> = other.entries().collect();
        for (name, var) in self.entries() {
            let src = source
                .get(name)
                .with_context(|| format!("Source network has no tensor named {}", name))?;
            let value = src.as_tensor().to_dtype(self.dtype)?.to_device(&self.device)?;
            var.set(&value)
                .with_context(|| format!("Failed to copy tensor {}", name))?;
        }
        Ok(())
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let tensors: HashMap<String, Tensor> = self
            .entries()
            .map(|(name, var)| (name.to_string(), var.as_tensor().clone()))
            .collect();
        candle_core::safetensors::save(&tensors, path)
            .with_context(|| format!("Failed to save weights to {}", path.display()))?;
        Ok(())
    }

    /// Load weights saved by `save` (or converted to the same names) into this store.
    pub fn load(&self, path: &Path) -> Result<()> {
        let tensors = candle_core::safetensors::load(path, &self.device)
            .with_context(|| format!("Failed to read weights from {}", path.display()))?;
        for (name, var) in self.entries() {
            let value = tensors
                .get(name)
                .with_context(|| format!("{} is missing tensor {}", path.display(), name))?;
            var.set(&value.to_dtype(self.dtype)?)
                .with_context(|| format!("Tensor {} in {} has the wrong shape", name, path.display()))?;
        }
        Ok(())
    }
}

/// Sample a normally distributed tensor from a seeded generator.
pub fn seeded_normal<S: Into<Shape>>(
    shape: S,
    std: f64,
    rng: &mut StdRng,
    device: &Device,
) -> Result<Tensor> {
    let shape: Shape = shape.into();
    let normal = Normal::new(0.0f32, std as f32)?;
    let data: Vec<f32> = (0..shape.elem_count()).map(|_| normal.sample(rng)).collect();
    Ok(Tensor::from_vec(data, shape, device)?)
}
