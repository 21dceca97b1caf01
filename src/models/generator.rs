//! Style-based generator contract and a compact implementation of it
//!
//! The tuning core only relies on the `Generator` trait: latent mapping,
//! synthesis with a selectable noise mode, and tagged access to parameters.

use anyhow::{Context, Result};
use candle_core::{DType, Device, IndexOp, Tensor, D};
use candle_nn::Init;
use serde::{Deserialize, Serialize};
use std::path::Path;

use super::params::{ParameterGroup, ParameterStore, TaggedParameter};
use crate::error::PtiError;

/// Latent samples averaged into `mapping.w_avg` when a network is built.
const W_AVG_SAMPLES: usize = 1000;

/// How per-layer noise is injected during synthesis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoiseMode {
    /// Fresh Gaussian noise on every call.
    Random,
    /// The fixed noise buffer stored with the network.
    Const,
    /// No noise.
    None,
}

/// Common trait for generators that can be inverted and tuned
pub trait Generator: Sized {
    /// Synthesize images `[batch, channels, res, res]` from codes `[batch, num_ws, w_dim]`.
    fn synthesize(&self, ws: &Tensor, noise_mode: NoiseMode, force_fp32: bool) -> Result<Tensor>;

    /// Map input noise `[batch, z_dim]` to per-layer codes `[batch, num_ws, w_dim]`.
    fn mapping(&self, z: &Tensor, truncation_psi: f64) -> Result<Tensor>;

    fn z_dim(&self) -> usize;
    fn w_dim(&self) -> usize;
    fn num_ws(&self) -> usize;
    fn device(&self) -> &Device;

    /// All trainable parameters with their declared roles.
    fn parameters(&self) -> Vec<TaggedParameter>;

    fn requires_grad(&self) -> bool;
    fn set_requires_grad(&mut self, enabled: bool);

    /// Deep copy whose weights are detached from every gradient graph.
    fn frozen_copy(&self) -> Result<Self>;

    /// Overwrite this generator's weights with `other`'s.
    fn load_state_from(&self, other: &Self) -> Result<()>;

    fn save(&self, path: &Path) -> Result<()>;
}

/// Architecture of `StyleGenerator`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GeneratorConfig {
    pub z_dim: usize,
    pub w_dim: usize,
    pub num_ws: usize,
    pub features: usize,
    pub mapping_layers: usize,
    pub img_channels: usize,
    pub resolution: usize,
    #[serde(default)]
    pub checkpoint: Option<std::path::PathBuf>,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            z_dim: 64,
            w_dim: 64,
            num_ws: 8,
            features: 128,
            mapping_layers: 4,
            img_channels: 3,
            resolution: 32,
            checkpoint: None,
        }
    }
}

impl GeneratorConfig {
    pub fn validate(&self) -> std::result::Result<(), PtiError> {
        let sizes = [
            ("z_dim", self.z_dim),
            ("w_dim", self.w_dim),
            ("num_ws", self.num_ws),
            ("features", self.features),
            ("mapping_layers", self.mapping_layers),
            ("img_channels", self.img_channels),
            ("resolution", self.resolution),
        ];
        for (name, value) in sizes {
            if value == 0 {
                return Err(PtiError::InvalidConfig(format!("generator.{} must be positive", name)));
            }
        }
        Ok(())
    }
}

struct Dense {
    weight: Tensor,
    bias: Tensor,
}

impl Dense {
    fn new(
        store: &mut ParameterStore,
        prefix: &str,
        group: ParameterGroup,
        in_dim: usize,
        out_dim: usize,
        bias_init: f64,
    ) -> Result<Self> {
        let stdev = 1.0 / (in_dim as f64).sqrt();
        let weight = store.register(
            format!("{}.weight", prefix),
            group,
            (out_dim, in_dim),
            Init::Randn { mean: 0.0, stdev },
        )?;
        let bias = store.register(format!("{}.bias", prefix), group, out_dim, Init::Const(bias_init))?;
        Ok(Self { weight, bias })
    }
}

struct StyleLayer {
    affine: Dense,
    weight: Tensor,
    bias: Tensor,
    noise_strength: Tensor,
    noise_const: Tensor,
}

/// Small style-based generator: MLP mapping network, a learned constant input,
/// style-modulated fully connected synthesis layers and a to-RGB projection.
pub struct StyleGenerator {
    config: GeneratorConfig,
    device: Device,
    store: ParameterStore,
    mapping: Vec<Dense>,
    input: Tensor,
    layers: Vec<StyleLayer>,
    to_rgb: Dense,
    w_avg: Tensor,
    requires_grad: bool,
}

impl StyleGenerator {
    pub fn new(config: GeneratorConfig, device: &Device) -> Result<Self> {
        config.validate()?;
        let mut store = ParameterStore::new(device, DType::F32);

        let mut mapping = Vec::with_capacity(config.mapping_layers);
        for i in 0..config.mapping_layers {
            let in_dim = if i == 0 { config.z_dim } else { config.w_dim };
            mapping.push(Dense::new(
                &mut store,
                &format!("mapping.fc{}", i),
                ParameterGroup::Mapping,
                in_dim,
                config.w_dim,
                0.0,
            )?);
        }
        let w_avg = store.register_buffer("mapping.w_avg", &Tensor::zeros(config.w_dim, DType::F32, device)?)?;

        let input = store.register(
            "synthesis.input.const",
            ParameterGroup::Synthesis,
            config.features,
            Init::Randn { mean: 0.0, stdev: 1.0 },
        )?;

        let mut layers = Vec::with_capacity(config.num_ws);
        for i in 0..config.num_ws {
            let prefix = format!("synthesis.layer{}", i);
            let affine = Dense::new(
                &mut store,
                &format!("{}.affine", prefix),
                ParameterGroup::StyleModulation,
                config.w_dim,
                config.features,
                1.0,
            )?;
            let weight = store.register(
                format!("{}.weight", prefix),
                ParameterGroup::Synthesis,
                (config.features, config.features),
                Init::Randn { mean: 0.0, stdev: 1.0 / (config.features as f64).sqrt() },
            )?;
            let bias = store.register(
                format!("{}.bias", prefix),
                ParameterGroup::Synthesis,
                config.features,
                Init::Const(0.0),
            )?;
            let noise_strength = store.register(
                format!("{}.noise_strength", prefix),
                ParameterGroup::Synthesis,
                1,
                Init::Const(0.05),
            )?;
            let noise_const = store.register_buffer(
                format!("{}.noise_const", prefix),
                &Tensor::randn(0f32, 1f32, config.features, device)?,
            )?;
            layers.push(StyleLayer { affine, weight, bias, noise_strength, noise_const });
        }

        let pixels = config.img_channels * config.resolution * config.resolution;
        let to_rgb = Dense::new(
            &mut store,
            "synthesis.to_rgb",
            ParameterGroup::Synthesis,
            config.features,
            pixels,
            0.0,
        )?;

        let generator = Self {
            config,
            device: device.clone(),
            store,
            mapping,
            input,
            layers,
            to_rgb,
            w_avg,
            requires_grad: true,
        };
        generator.update_w_avg(W_AVG_SAMPLES)?;
        Ok(generator)
    }

    /// Re-estimate the truncation center as the mean mapped code of `samples` draws.
    /// Checkpoints carry their own `mapping.w_avg` and overwrite this on load.
    pub fn update_w_avg(&self, samples: usize) -> Result<()> {
        let z = Tensor::randn(0f32, 1f32, (samples.max(1), self.config.z_dim), &self.device)?;
        let avg = self.mapping(&z, 1.0)?.i((.., 0))?.detach().mean(0)?;
        self.store.set_buffer("mapping.w_avg", &avg)
    }

    /// Center that truncation pulls mapped codes toward.
    pub fn w_avg(&self) -> &Tensor {
        &self.w_avg
    }

    /// Build the network and load weights from `config.checkpoint` when one is set.
    pub fn from_config(config: GeneratorConfig, device: &Device) -> Result<Self> {
        let checkpoint = config.checkpoint.clone();
        let generator = Self::new(config, device)?;
        if let Some(path) = checkpoint {
            generator.load(&path)?;
            log::info!("Loaded generator weights from {}", path.display());
        }
        Ok(generator)
    }

    pub fn config(&self) -> &GeneratorConfig {
        &self.config
    }

    pub fn load(&self, path: &Path) -> Result<()> {
        self.store
            .load(path)
            .with_context(|| format!("Failed to load generator checkpoint {}", path.display()))
    }

    pub fn num_elements(&self) -> usize {
        self.store.num_elements()
    }

    /// Weight as used by the forward pass: detached unless gradients are tracked.
    fn weight(&self, t: &Tensor, force_fp32: bool) -> Result<Tensor> {
        let t = if self.requires_grad { t.clone() } else { t.detach() };
        if force_fp32 {
            Ok(t.to_dtype(DType::F32)?)
        } else {
            Ok(t)
        }
    }

    fn dense(&self, layer: &Dense, x: &Tensor, force_fp32: bool) -> Result<Tensor> {
        let w = self.weight(&layer.weight, force_fp32)?;
        let b = self.weight(&layer.bias, force_fp32)?;
        Ok(x.contiguous()?.matmul(&w.t()?)?.broadcast_add(&b)?)
    }
}

impl Generator for StyleGenerator {
    fn synthesize(&self, ws: &Tensor, noise_mode: NoiseMode, force_fp32: bool) -> Result<Tensor> {
        let (batch, num_ws, w_dim) = ws.dims3().context("Expected latent codes [batch, num_ws, w_dim]")?;
        if num_ws != self.config.num_ws || w_dim != self.config.w_dim {
            return Err(PtiError::ShapeMismatch {
                op: "synthesize",
                left: ws.dims().to_vec(),
                right: vec![batch, self.config.num_ws, self.config.w_dim],
            }
            .into());
        }
        if !ws.device().same_device(&self.device) {
            return Err(PtiError::DeviceMismatch { op: "synthesize" }.into());
        }
        let dtype = if force_fp32 { DType::F32 } else { self.store.dtype() };
        let ws = ws.to_dtype(dtype)?;

        let features = self.config.features;
        let mut x = self
            .weight(&self.input, force_fp32)?
            .unsqueeze(0)?
            .broadcast_as((batch, features))?;

        for (i, layer) in self.layers.iter().enumerate() {
            let style = self.dense(&layer.affine, &ws.i((.., i))?, force_fp32)?;
            x = (x * style)?;
            let weight = self.weight(&layer.weight, force_fp32)?;
            let bias = self.weight(&layer.bias, force_fp32)?;
            x = x.matmul(&weight.t()?)?.broadcast_add(&bias)?;

            let strength = self.weight(&layer.noise_strength, force_fp32)?;
            x = match noise_mode {
                NoiseMode::Random => {
                    let noise = Tensor::randn(0f32, 1f32, (batch, features), &self.device)?.to_dtype(dtype)?;
                    (x + noise.broadcast_mul(&strength)?)?
                }
                NoiseMode::Const => {
                    let noise = layer.noise_const.detach().to_dtype(dtype)?.unsqueeze(0)?;
                    x.broadcast_add(&noise.broadcast_mul(&strength)?)?
                }
                NoiseMode::None => x,
            };
            x = candle_nn::ops::leaky_relu(&x, 0.2)?;
        }

        let rgb = self.dense(&self.to_rgb, &x, force_fp32)?;
        let res = self.config.resolution;
        Ok(rgb.reshape((batch, self.config.img_channels, res, res))?)
    }

    fn mapping(&self, z: &Tensor, truncation_psi: f64) -> Result<Tensor> {
        let (batch, z_dim) = z.dims2().context("Expected input noise [batch, z_dim]")?;
        if z_dim != self.config.z_dim {
            return Err(PtiError::ShapeMismatch {
                op: "mapping",
                left: z.dims().to_vec(),
                right: vec![batch, self.config.z_dim],
            }
            .into());
        }
        let z = z.to_dtype(self.store.dtype())?.to_device(&self.device)?;

        // normalize second moment
        let norm = (z.sqr()?.mean_keepdim(D::Minus1)? + 1e-8)?.sqrt()?;
        let mut x = z.broadcast_div(&norm)?;
        for layer in &self.mapping {
            x = candle_nn::ops::leaky_relu(&self.dense(layer, &x, false)?, 0.2)?;
        }

        if truncation_psi != 1.0 {
            let w_avg = self.w_avg.detach().unsqueeze(0)?;
            let delta = (x.broadcast_sub(&w_avg)? * truncation_psi)?;
            x = delta.broadcast_add(&w_avg)?;
        }

        Ok(x
            .unsqueeze(1)?
            .broadcast_as((batch, self.config.num_ws, self.config.w_dim))?
            .contiguous()?)
    }

    fn z_dim(&self) -> usize {
        self.config.z_dim
    }

    fn w_dim(&self) -> usize {
        self.config.w_dim
    }

    fn num_ws(&self) -> usize {
        self.config.num_ws
    }

    fn device(&self) -> &Device {
        &self.device
    }

    fn parameters(&self) -> Vec<TaggedParameter> {
        self.store.parameters().to_vec()
    }

    fn requires_grad(&self) -> bool {
        self.requires_grad
    }

    fn set_requires_grad(&mut self, enabled: bool) {
        self.requires_grad = enabled;
    }

    fn frozen_copy(&self) -> Result<Self> {
        let mut copy = Self::new(self.config.clone(), &self.device)?;
        copy.store.copy_from(&self.store)?;
        copy.requires_grad = false;
        Ok(copy)
    }

    fn load_state_from(&self, other: &Self) -> Result<()> {
        self.store.copy_from(&other.store)
    }

    fn save(&self, path: &Path) -> Result<()> {
        self.store.save(path)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn toy_config() -> GeneratorConfig {
        GeneratorConfig {
            z_dim: 8,
            w_dim: 8,
            num_ws: 3,
            features: 16,
            mapping_layers: 2,
            img_channels: 3,
            resolution: 8,
            checkpoint: None,
        }
    }

    fn max_abs_diff(a: &Tensor, b: &Tensor) -> Result<f32> {
        Ok((a - b)?.abs()?.flatten_all()?.max(0)?.to_scalar::<f32>()?)
    }

    #[test]
    fn test_shapes() -> Result<()> {
        let device = Device::Cpu;
        let g = StyleGenerator::new(toy_config(), &device)?;
        let z = Tensor::randn(0f32, 1f32, (2, 8), &device)?;
        let ws = g.mapping(&z, 1.0)?;
        assert_eq!(ws.dims(), &[2, 3, 8]);
        let img = g.synthesize(&ws, NoiseMode::Const, true)?;
        assert_eq!(img.dims(), &[2, 3, 8, 8]);
        Ok(())
    }

    #[test]
    fn test_w_avg_is_the_mapping_mean() -> Result<()> {
        let device = Device::Cpu;
        let g = StyleGenerator::new(toy_config(), &device)?;
        let w_avg = g.w_avg().to_vec1::<f32>()?;
        assert!(w_avg.iter().any(|v| *v != 0.0));

        // full truncation collapses every sample onto the stored center
        let z = Tensor::randn(0f32, 1f32, (4, 8), &device)?;
        let truncated = g.mapping(&z, 0.0)?;
        for row in truncated.i((.., 0))?.to_vec2::<f32>()? {
            for (a, b) in row.iter().zip(&w_avg) {
                assert!((a - b).abs() < 1e-5);
            }
        }

        let z = Tensor::randn(0f32, 1f32, (2000, 8), &device)?;
        let empirical = g.mapping(&z, 1.0)?.i((.., 0))?.mean(0)?;
        let g_avg = g.w_avg().unsqueeze(0)?;
        assert!(max_abs_diff(&empirical.unsqueeze(0)?, &g_avg)? < 0.2);
        Ok(())
    }

    #[test]
    fn test_const_noise_is_deterministic() -> Result<()> {
        let device = Device::Cpu;
        let g = StyleGenerator::new(toy_config(), &device)?;
        let ws = Tensor::randn(0f32, 1f32, (1, 3, 8), &device)?;
        let a = g.synthesize(&ws, NoiseMode::Const, true)?;
        let b = g.synthesize(&ws, NoiseMode::Const, true)?;
        assert_eq!(max_abs_diff(&a, &b)?, 0.0);

        let r1 = g.synthesize(&ws, NoiseMode::Random, true)?;
        let r2 = g.synthesize(&ws, NoiseMode::Random, true)?;
        assert!(max_abs_diff(&r1, &r2)? > 0.0);
        Ok(())
    }

    #[test]
    fn test_rejects_wrong_latent_shape() -> Result<()> {
        let device = Device::Cpu;
        let g = StyleGenerator::new(toy_config(), &device)?;
        let ws = Tensor::zeros((1, 2, 8), DType::F32, &device)?;
        let err = g.synthesize(&ws, NoiseMode::None, true).unwrap_err();
        assert!(matches!(err.downcast_ref::<PtiError>(), Some(PtiError::ShapeMismatch { .. })));
        Ok(())
    }

    #[test]
    fn test_frozen_copy_matches_and_carries_no_gradient() -> Result<()> {
        let device = Device::Cpu;
        let g = StyleGenerator::new(toy_config(), &device)?;
        let frozen = g.frozen_copy()?;
        assert!(!frozen.requires_grad());

        let ws = Tensor::randn(0f32, 1f32, (1, 3, 8), &device)?;
        let a = g.synthesize(&ws, NoiseMode::Const, true)?;
        let b = frozen.synthesize(&ws, NoiseMode::Const, true)?;
        assert!(max_abs_diff(&a, &b)? < 1e-6);

        let grads = b.sqr()?.mean_all()?.backward()?;
        for p in frozen.parameters() {
            assert!(grads.get(p.var.as_tensor()).is_none());
        }

        let grads = a.sqr()?.mean_all()?.backward()?;
        assert!(g.parameters().iter().any(|p| grads.get(p.var.as_tensor()).is_some()));
        Ok(())
    }

    #[test]
    fn test_style_modulation_parameters_are_tagged() -> Result<()> {
        let device = Device::Cpu;
        let g = StyleGenerator::new(toy_config(), &device)?;
        let styles = g
            .parameters()
            .into_iter()
            .filter(|p| p.group == ParameterGroup::StyleModulation)
            .count();
        // weight + bias per synthesis layer
        assert_eq!(styles, 2 * 3);
        Ok(())
    }

    #[test]
    fn test_checkpoint_round_trip() -> Result<()> {
        let device = Device::Cpu;
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("g.safetensors");

        let g = StyleGenerator::new(toy_config(), &device)?;
        g.save(&path)?;
        let mut config = toy_config();
        config.checkpoint = Some(path);
        let loaded = StyleGenerator::from_config(config, &device)?;

        let ws = Tensor::randn(0f32, 1f32, (1, 3, 8), &device)?;
        let a = g.synthesize(&ws, NoiseMode::Const, true)?;
        let b = loaded.synthesize(&ws, NoiseMode::Const, true)?;
        assert!(max_abs_diff(&a, &b)? < 1e-6);
        Ok(())
    }
}
