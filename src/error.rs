//! Typed failures surfaced by the tuning core

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PtiError {
    /// A coach was built without a generator.
    #[error("no generator supplied to the coach")]
    MissingGenerator,

    #[error("shape mismatch in {op}: {left:?} vs {right:?}")]
    ShapeMismatch {
        op: &'static str,
        left: Vec<usize>,
        right: Vec<usize>,
    },

    #[error("tensors for {op} live on different devices")]
    DeviceMismatch { op: &'static str },

    /// Two dataset images resolve to the same id.
    #[error("duplicate image id {id}: {first} and {second}")]
    DuplicateImage { id: String, first: String, second: String },

    #[error("no stored pivot for image: {0}")]
    MissingPivot(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Fails with `ShapeMismatch`/`DeviceMismatch` unless both tensors can be combined elementwise.
pub fn ensure_compatible(
    op: &'static str,
    left: &candle_core::Tensor,
    right: &candle_core::Tensor,
) -> Result<(), PtiError> {
    if !left.device().same_device(right.device()) {
        return Err(PtiError::DeviceMismatch { op });
    }
    if left.dims() != right.dims() {
        return Err(PtiError::ShapeMismatch {
            op,
            left: left.dims().to_vec(),
            right: right.dims().to_vec(),
        });
    }
    Ok(())
}
