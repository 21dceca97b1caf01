//! W+ inversion with a single encoder pass

use anyhow::{Context, Result};
use candle_core::{DType, Tensor};

use super::Inverter;
use crate::error::PtiError;
use crate::models::{EncodeOptions, Generator, LatentEncoder};
use crate::training::image_utils::resize_square;

pub struct EncoderInversion {
    encoder: Box<dyn LatentEncoder>,
    input_resolution: usize,
}

impl EncoderInversion {
    pub fn new(encoder: Box<dyn LatentEncoder>, input_resolution: usize) -> Self {
        Self { encoder, input_resolution }
    }

    /// Bring a generator-range image `[1, 3, H, W]` into the encoder's input layout.
    pub fn preprocess(&self, image: &Tensor) -> Result<Tensor> {
        let image = image.narrow(0, 0, 1)?.to_dtype(DType::F32)?;
        let unit = ((image + 1.0)? / 2.0)?.clamp(0f32, 1f32)?;
        let resized = resize_square(&unit, self.input_resolution)?;
        Ok(((resized - 0.5)? / 0.5)?)
    }
}

impl<G: Generator> Inverter<G> for EncoderInversion {
    fn invert(&self, generator: &G, image: &Tensor, image_id: &str) -> Result<Tensor> {
        log::info!("Encoding {} with e4e", image_id);
        let input = self.preprocess(&image.to_device(generator.device())?)?;
        let options = EncodeOptions {
            randomize_noise: false,
            return_latents: true,
            resize: false,
            input_code: false,
        };
        let latents = self
            .encoder
            .encode(&input, &options)?
            .latents
            .context("Encoder returned no latent codes")?;

        let expected = [1, generator.num_ws(), generator.w_dim()];
        if latents.dims() != expected {
            return Err(PtiError::ShapeMismatch {
                op: "encoder inversion",
                left: latents.dims().to_vec(),
                right: expected.to_vec(),
            }
            .into());
        }
        Ok(latents.detach())
    }
}
