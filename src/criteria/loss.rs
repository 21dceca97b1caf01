//! Weighted combination of reconstruction, perceptual and locality terms

use anyhow::Result;
use candle_core::{DType, Tensor};
use std::sync::Arc;

use super::{l2_loss, PerceptualDistance};

#[derive(Debug, Clone, PartialEq)]
pub struct LossConfig {
    pub l2_lambda: f64,
    pub lpips_lambda: f64,
    pub use_locality_regularization: bool,
}

impl Default for LossConfig {
    fn default() -> Self {
        Self {
            l2_lambda: 1.0,
            lpips_lambda: 1.0,
            use_locality_regularization: false,
        }
    }
}

/// Total loss plus the individual terms that were actually computed.
pub struct LossBreakdown {
    pub total: Tensor,
    pub l2: Option<Tensor>,
    pub lpips: Option<Tensor>,
    pub locality: Option<Tensor>,
}

impl LossBreakdown {
    pub fn total_value(&self) -> Result<f32> {
        Ok(self.total.to_scalar::<f32>()?)
    }

    pub fn l2_value(&self) -> Result<Option<f32>> {
        scalar(&self.l2)
    }

    pub fn lpips_value(&self) -> Result<Option<f32>> {
        scalar(&self.lpips)
    }

    pub fn locality_value(&self) -> Result<Option<f32>> {
        scalar(&self.locality)
    }
}

fn scalar(term: &Option<Tensor>) -> Result<Option<f32>> {
    term.as_ref()
        .map(|t| t.to_dtype(DType::F32)?.to_scalar::<f32>())
        .transpose()
        .map_err(Into::into)
}

pub struct LossAggregator {
    config: LossConfig,
    perceptual: Arc<dyn PerceptualDistance>,
}

impl LossAggregator {
    pub fn new(config: LossConfig, perceptual: Arc<dyn PerceptualDistance>) -> Self {
        Self { config, perceptual }
    }

    pub fn config(&self) -> &LossConfig {
        &self.config
    }

    /// Combine the enabled terms. `locality` is only invoked when the ball holder
    /// is up and locality regularization is enabled; disabled terms cost nothing.
    pub fn loss<F>(&self, generated: &Tensor, real: &Tensor, use_ball_holder: bool, locality: F) -> Result<LossBreakdown>
    where
        F: FnOnce() -> Result<Tensor>,
    {
        let mut total = Tensor::zeros((), DType::F32, generated.device())?;

        let l2 = if self.config.l2_lambda > 0.0 {
            let value = l2_loss(generated, real)?;
            total = (total + (&value * self.config.l2_lambda)?)?;
            Some(value)
        } else {
            None
        };

        let lpips = if self.config.lpips_lambda > 0.0 {
            let value = self.perceptual.distance(generated, real)?.mean_all()?;
            total = (total + (&value * self.config.lpips_lambda)?)?;
            Some(value)
        } else {
            None
        };

        let locality = if use_ball_holder && self.config.use_locality_regularization {
            let value = locality()?;
            total = (total + &value)?;
            Some(value)
        } else {
            None
        };

        Ok(LossBreakdown { total, l2, lpips, locality })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::criteria::Lpips;
    use candle_core::Device;

    fn aggregator(config: LossConfig) -> Result<LossAggregator> {
        let lpips: Arc<dyn PerceptualDistance> = Arc::new(Lpips::new(&[4, 8], 3, 0, &Device::Cpu)?);
        Ok(LossAggregator::new(config, lpips))
    }

    fn images() -> Result<(Tensor, Tensor)> {
        let device = Device::Cpu;
        Ok((
            Tensor::rand(-1f32, 1f32, (1, 3, 8, 8), &device)?,
            Tensor::rand(-1f32, 1f32, (1, 3, 8, 8), &device)?,
        ))
    }

    #[test]
    fn test_all_terms_disabled_is_zero() -> Result<()> {
        let agg = aggregator(LossConfig {
            l2_lambda: 0.0,
            lpips_lambda: 0.0,
            use_locality_regularization: false,
        })?;
        let (generated, real) = images()?;
        let out = agg.loss(&generated, &real, true, || panic!("locality must not run"))?;
        assert_eq!(out.total_value()?, 0.0);
        assert!(out.l2.is_none() && out.lpips.is_none() && out.locality.is_none());

        // a constant loss yields an empty gradient store rather than an error
        let grads = out.total.backward()?;
        assert!(grads.get(&generated).is_none());
        Ok(())
    }

    #[test]
    fn test_l2_only_is_mean_squared_error() -> Result<()> {
        let agg = aggregator(LossConfig {
            l2_lambda: 1.0,
            lpips_lambda: 0.0,
            use_locality_regularization: false,
        })?;
        let (generated, real) = images()?;
        let out = agg.loss(&generated, &real, false, || panic!("locality must not run"))?;
        let mse = (&generated - &real)?.sqr()?.mean_all()?.to_scalar::<f32>()?;
        assert!((out.total_value()? - mse).abs() < 1e-6);
        assert_eq!(out.l2_value()?, Some(mse));
        assert_eq!(out.lpips_value()?, None);
        Ok(())
    }

    #[test]
    fn test_terms_are_weighted() -> Result<()> {
        let agg = aggregator(LossConfig {
            l2_lambda: 2.0,
            lpips_lambda: 0.5,
            use_locality_regularization: true,
        })?;
        let (generated, real) = images()?;
        let out = agg.loss(&generated, &real, true, || {
            Ok(Tensor::new(3f32, &Device::Cpu)?)
        })?;
        let expected = 2.0 * out.l2_value()?.unwrap_or_default()
            + 0.5 * out.lpips_value()?.unwrap_or_default()
            + 3.0;
        assert!((out.total_value()? - expected).abs() < 1e-5);
        assert_eq!(out.locality_value()?, Some(3.0));
        Ok(())
    }

    #[test]
    fn test_locality_waits_for_ball_holder() -> Result<()> {
        let agg = aggregator(LossConfig {
            l2_lambda: 0.0,
            lpips_lambda: 0.0,
            use_locality_regularization: true,
        })?;
        let (generated, real) = images()?;
        let out = agg.loss(&generated, &real, false, || panic!("locality must not run"))?;
        assert!(out.locality.is_none());
        Ok(())
    }
}
