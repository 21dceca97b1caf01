//! Pixelwise reconstruction loss

use anyhow::Result;
use candle_core::Tensor;

use crate::error::ensure_compatible;

/// Mean squared difference over every element.
pub fn l2_loss(generated: &Tensor, real: &Tensor) -> Result<Tensor> {
    ensure_compatible("l2_loss", generated, real)?;
    Ok((generated - real)?.sqr()?.mean_all()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PtiError;
    use candle_core::Device;

    #[test]
    fn test_mean_squared_difference() -> Result<()> {
        let device = Device::Cpu;
        let a = Tensor::new(&[[1f32, 2.0], [3.0, 4.0]], &device)?;
        let b = Tensor::new(&[[1f32, 0.0], [0.0, 4.0]], &device)?;
        // (0 + 4 + 9 + 0) / 4
        assert_eq!(l2_loss(&a, &b)?.to_scalar::<f32>()?, 3.25);
        Ok(())
    }

    #[test]
    fn test_shape_mismatch_is_reported() -> Result<()> {
        let device = Device::Cpu;
        let a = Tensor::zeros((1, 3, 4, 4), candle_core::DType::F32, &device)?;
        let b = Tensor::zeros((1, 3, 8, 8), candle_core::DType::F32, &device)?;
        let err = l2_loss(&a, &b).unwrap_err();
        assert!(matches!(err.downcast_ref::<PtiError>(), Some(PtiError::ShapeMismatch { .. })));
        Ok(())
    }
}
