//! e4e-style latent encoder
//!
//! A strided conv backbone pooled to a feature vector, followed by one linear
//! head per generator layer. Head 0 predicts the base code and every later
//! head a delta on top of it; the result is offset by `latent_avg`. The
//! encoder carries its own frozen copy of the generator as decoder.

use anyhow::{Context, Result};
use candle_core::{DType, Tensor};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::path::Path;

use super::generator::{Generator, NoiseMode};
use super::params::{seeded_normal, ParameterStore};
use crate::training::image_utils::resize_square;

/// Flags mirroring the call convention of the e4e reference encoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncodeOptions {
    pub randomize_noise: bool,
    pub return_latents: bool,
    /// Pool decoded images to the encoder input resolution.
    pub resize: bool,
    /// Treat the input as latent codes instead of images.
    pub input_code: bool,
}

impl Default for EncodeOptions {
    fn default() -> Self {
        Self {
            randomize_noise: false,
            return_latents: true,
            resize: false,
            input_code: false,
        }
    }
}

pub struct EncoderOutput {
    pub images: Tensor,
    pub latents: Option<Tensor>,
}

pub trait LatentEncoder {
    fn encode(&self, x: &Tensor, options: &EncodeOptions) -> Result<EncoderOutput>;
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EncoderConfig {
    /// Side length images are resized to before encoding.
    pub input_resolution: usize,
    /// Output channels of the stride-2 conv stages.
    pub channels: Vec<usize>,
    /// Number of samples used to estimate `latent_avg` for fresh weights.
    pub latent_avg_samples: usize,
    pub seed: u64,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            input_resolution: 256,
            channels: vec![16, 32, 64, 128],
            latent_avg_samples: 256,
            seed: 0,
        }
    }
}

struct Conv {
    kernel: Tensor,
    bias: Tensor,
}

struct Head {
    weight: Tensor,
    bias: Tensor,
}

pub struct E4eEncoder<G: Generator> {
    config: EncoderConfig,
    store: ParameterStore,
    convs: Vec<Conv>,
    heads: Vec<Head>,
    latent_avg: Tensor,
    decoder: G,
}

impl<G: Generator> E4eEncoder<G> {
    /// Encoder for `generator` with seeded weights and a frozen copy of it as decoder.
    pub fn new(config: EncoderConfig, generator: &G) -> Result<Self> {
        let device = generator.device().clone();
        let decoder = generator.frozen_copy()?;
        let mut store = ParameterStore::new(&device, DType::F32);
        let mut rng = StdRng::seed_from_u64(config.seed);

        let mut convs = Vec::with_capacity(config.channels.len());
        let mut prev = 3;
        for (i, &out) in config.channels.iter().enumerate() {
            let std = (2.0 / (prev * 9) as f64).sqrt();
            let kernel = store.register_buffer(
                format!("encoder.body{}.weight", i),
                &seeded_normal((out, prev, 3, 3), std, &mut rng, &device)?,
            )?;
            let bias = store.register_buffer(
                format!("encoder.body{}.bias", i),
                &Tensor::zeros((1, out, 1, 1), DType::F32, &device)?,
            )?;
            convs.push(Conv { kernel, bias });
            prev = out;
        }

        let w_dim = decoder.w_dim();
        let mut heads = Vec::with_capacity(decoder.num_ws());
        for i in 0..decoder.num_ws() {
            let std = 0.1 / (prev as f64).sqrt();
            let weight = store.register_buffer(
                format!("encoder.styles{}.weight", i),
                &seeded_normal((w_dim, prev), std, &mut rng, &device)?,
            )?;
            let bias = store.register_buffer(
                format!("encoder.styles{}.bias", i),
                &Tensor::zeros(w_dim, DType::F32, &device)?,
            )?;
            heads.push(Head { weight, bias });
        }

        let latent_avg = store.register_buffer(
            "latent_avg",
            &estimate_latent_avg(&decoder, config.latent_avg_samples, &mut rng)?,
        )?;

        Ok(Self { config, store, convs, heads, latent_avg, decoder })
    }

    pub fn config(&self) -> &EncoderConfig {
        &self.config
    }

    pub fn decoder(&self) -> &G {
        &self.decoder
    }

    /// Load converted encoder weights (`encoder.*` and `latent_avg`).
    pub fn load(&self, path: &Path) -> Result<()> {
        self.store
            .load(path)
            .with_context(|| format!("Failed to load e4e weights {}", path.display()))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        self.store.save(path)
    }

    fn features(&self, x: &Tensor) -> Result<Tensor> {
        let mut x = x.to_dtype(DType::F32)?;
        for conv in &self.convs {
            x = x
                .conv2d(&conv.kernel.detach(), 1, 2, 1, 1)?
                .broadcast_add(&conv.bias.detach())?;
            x = candle_nn::ops::leaky_relu(&x, 0.2)?;
        }
        Ok(x.mean((2, 3))?)
    }

    /// Per-layer codes `[batch, num_ws, w_dim]` for images `[batch, 3, H, W]`.
    pub fn codes(&self, x: &Tensor) -> Result<Tensor> {
        let features = self.features(x)?;
        let project = |head: &Head| -> Result<Tensor> {
            Ok(features.matmul(&head.weight.detach().t()?)?.broadcast_add(&head.bias.detach())?)
        };

        let mut codes = Vec::with_capacity(self.heads.len());
        let mut base: Option<Tensor> = None;
        for head in &self.heads {
            let code = match &base {
                None => {
                    let b = project(head)?;
                    base = Some(b.clone());
                    b
                }
                Some(b) => (b + project(head)?)?,
            };
            codes.push(code);
        }
        let codes = Tensor::stack(&codes, 1)?;
        Ok(codes.broadcast_add(&self.latent_avg.detach().unsqueeze(0)?)?)
    }
}

fn estimate_latent_avg<G: Generator>(decoder: &G, samples: usize, rng: &mut StdRng) -> Result<Tensor> {
    let device = decoder.device();
    if samples == 0 {
        return Ok(Tensor::zeros((decoder.num_ws(), decoder.w_dim()), DType::F32, device)?);
    }
    let z = seeded_normal((samples, decoder.z_dim()), 1.0, rng, device)?;
    Ok(decoder.mapping(&z, 1.0)?.to_dtype(DType::F32)?.mean(0)?)
}

impl<G: Generator> LatentEncoder for E4eEncoder<G> {
    fn encode(&self, x: &Tensor, options: &EncodeOptions) -> Result<EncoderOutput> {
        let codes = if options.input_code {
            x.clone()
        } else {
            self.codes(x)?
        };
        let noise = if options.randomize_noise {
            NoiseMode::Random
        } else {
            NoiseMode::Const
        };
        let images = self.decoder.synthesize(&codes, noise, true)?;
        let images = if options.resize {
            resize_square(&images, self.config.input_resolution)?
        } else {
            images
        };
        Ok(EncoderOutput {
            images,
            latents: options.return_latents.then_some(codes),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::generator::tests::toy_config;
    use crate::models::StyleGenerator;
    use candle_core::Device;

    fn small_config() -> EncoderConfig {
        EncoderConfig {
            input_resolution: 16,
            channels: vec![4, 8],
            latent_avg_samples: 8,
            seed: 3,
        }
    }

    #[test]
    fn test_codes_have_generator_layout() -> Result<()> {
        let device = Device::Cpu;
        let g = StyleGenerator::new(toy_config(), &device)?;
        let encoder = E4eEncoder::new(small_config(), &g)?;
        let x = Tensor::rand(-1f32, 1f32, (2, 3, 16, 16), &device)?;

        let out = encoder.encode(&x, &EncodeOptions::default())?;
        let latents = out.latents.context("latents requested")?;
        assert_eq!(latents.dims(), &[2, 3, 8]);
        assert_eq!(out.images.dims(), &[2, 3, 8, 8]);

        let resized = encoder.encode(&x, &EncodeOptions { resize: true, return_latents: false, ..Default::default() })?;
        assert!(resized.latents.is_none());
        assert_eq!(resized.images.dims(), &[2, 3, 16, 16]);
        Ok(())
    }

    #[test]
    fn test_input_code_skips_the_backbone() -> Result<()> {
        let device = Device::Cpu;
        let g = StyleGenerator::new(toy_config(), &device)?;
        let encoder = E4eEncoder::new(small_config(), &g)?;
        let ws = Tensor::randn(0f32, 1f32, (1, 3, 8), &device)?;

        let out = encoder.encode(&ws, &EncodeOptions { input_code: true, ..Default::default() })?;
        let expected = g.synthesize(&ws, NoiseMode::Const, true)?;
        let diff = (out.images - expected)?.abs()?.flatten_all()?.max(0)?.to_scalar::<f32>()?;
        assert!(diff < 1e-6);
        Ok(())
    }

    #[test]
    fn test_weights_round_trip() -> Result<()> {
        let device = Device::Cpu;
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("e4e.safetensors");
        let g = StyleGenerator::new(toy_config(), &device)?;
        let x = Tensor::rand(-1f32, 1f32, (1, 3, 16, 16), &device)?;

        let source = E4eEncoder::new(small_config(), &g)?;
        source.save(&path)?;
        let target = E4eEncoder::new(EncoderConfig { seed: 42, ..small_config() }, &g)?;
        target.load(&path)?;

        let a = source.codes(&x)?.flatten_all()?.to_vec1::<f32>()?;
        let b = target.codes(&x)?.flatten_all()?.to_vec1::<f32>()?;
        assert_eq!(a, b);
        Ok(())
    }
}
