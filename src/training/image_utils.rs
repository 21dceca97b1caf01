//! Conversions between image files and generator-range tensors

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use image::DynamicImage;
use std::path::Path;

/// Save a tensor in [-1, 1] as an image. Accepts `[C, H, W]` or `[1, C, H, W]`
/// with 1 or 3 channels.
pub fn save_image<P: AsRef<Path>>(tensor: &Tensor, path: P) -> Result<()> {
    let tensor = if tensor.rank() == 4 {
        tensor.squeeze(0)?
    } else {
        tensor.clone()
    };
    let tensor = tensor.to_dtype(DType::F32)?.to_device(&Device::Cpu)?;
    let tensor = ((tensor.clamp(-1f32, 1f32)? + 1.0)? * 127.5)?.round()?;
    let tensor = tensor.to_dtype(DType::U8)?;

    let (channel, height, width) = tensor.dims3().context("Expected 3D tensor [C, H, W]")?;
    let data = tensor.permute((1, 2, 0))?.flatten_all()?.to_vec1::<u8>()?;

    let img = match channel {
        3 => DynamicImage::ImageRgb8(
            image::RgbImage::from_raw(width as u32, height as u32, data)
                .context("Failed to create image buffer")?,
        ),
        1 => DynamicImage::ImageLuma8(
            image::GrayImage::from_raw(width as u32, height as u32, data)
                .context("Failed to create image buffer")?,
        ),
        _ => anyhow::bail!("Expected 1 or 3 channels, got {}", channel),
    };

    let path = path.as_ref();
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create directory: {}", dir.display()))?;
    }
    let format = match path.extension().and_then(|s| s.to_str()) {
        Some("jpg") | Some("jpeg") => image::ImageFormat::Jpeg,
        _ => image::ImageFormat::Png,
    };
    img.save_with_format(path, format)
        .with_context(|| format!("Failed to save image: {}", path.display()))?;
    Ok(())
}

/// Decode a loaded image into `[1, 3, H, W]` in [-1, 1], resized to `resolution`.
pub fn image_to_tensor(img: &DynamicImage, resolution: usize, device: &Device) -> Result<Tensor> {
    let img = img.resize_exact(
        resolution as u32,
        resolution as u32,
        image::imageops::FilterType::Lanczos3,
    );
    let rgb = img.to_rgb8();
    let data = rgb.into_raw();
    let tensor = Tensor::from_vec(data, (resolution, resolution, 3), device)?
        .permute((2, 0, 1))?
        .to_dtype(DType::F32)?;
    let tensor = ((tensor / 127.5)? - 1.0)?;
    Ok(tensor.unsqueeze(0)?)
}

/// Resize `[B, C, H, W]` to a square `size` x `size`: average pooling when the
/// size divides evenly, nearest-neighbour sampling otherwise.
pub fn resize_square(x: &Tensor, size: usize) -> Result<Tensor> {
    let (_, _, h, w) = x.dims4()?;
    if h == size && w == size {
        return Ok(x.clone());
    }
    if h == w && h > size && h % size == 0 {
        return Ok(x.avg_pool2d(h / size)?);
    }
    Ok(x.upsample_nearest2d(size, size)?)
}
