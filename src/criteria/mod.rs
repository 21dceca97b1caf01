//! Loss terms used while inverting and tuning

pub mod l2;
pub mod locality;
pub mod loss;
pub mod lpips;

pub use l2::l2_loss;
pub use locality::{LocalityConfig, LocalityRegularizer};
pub use loss::{LossAggregator, LossBreakdown, LossConfig};
pub use lpips::{Lpips, LpipsType};

use anyhow::Result;
use candle_core::Tensor;

/// Frozen perceptual distance between two image batches.
pub trait PerceptualDistance {
    /// Per-sample distance `[batch]` between images in [-1, 1].
    fn distance(&self, a: &Tensor, b: &Tensor) -> Result<Tensor>;
}
