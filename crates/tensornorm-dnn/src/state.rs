//! Op State - Forward-to-Backward Hand-off
//!
//! Forward-training can hand intermediate results to backward through an
//! opaque, caller-owned `OpState`. Backward recovers the concrete payload
//! with a checked downcast.
//!
//! @version 0.1.0

use core::any::{type_name, Any};
use core::fmt;

use tensornorm_core::error::{Error, Result};
use tensornorm_tensor::Tensor;

// =============================================================================
// OpState
// =============================================================================

/// Type-erased state produced by one operation for a later one.
pub struct OpState {
    payload: Box<dyn Any + Send + Sync>,
    name: &'static str,
}

impl OpState {
    /// Wraps a payload.
    pub fn new<T: Any + Send + Sync>(payload: T) -> Self {
        Self {
            payload: Box::new(payload),
            name: type_name::<T>(),
        }
    }

    /// Returns the payload if it is a `T`.
    pub fn downcast_ref<T: Any>(&self) -> Result<&T> {
        self.payload
            .downcast_ref::<T>()
            .ok_or(Error::StateMismatch {
                expected: type_name::<T>(),
            })
    }

    /// Returns true if the payload is a `T`.
    #[must_use]
    pub fn is<T: Any>(&self) -> bool {
        self.payload.is::<T>()
    }
}

impl fmt::Debug for OpState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpState").field("payload", &self.name).finish()
    }
}

// =============================================================================
// BatchNormState
// =============================================================================

/// What batch-norm backward needs from forward.
#[derive(Debug, Clone)]
pub struct BatchNormState {
    x_cont: Tensor,
    x_mean: Tensor,
    x_inv_std: Tensor,
}

impl BatchNormState {
    /// Creates a state from the contiguous input and the batch statistics.
    #[must_use]
    pub fn new(x_cont: Tensor, x_mean: Tensor, x_inv_std: Tensor) -> Self {
        Self {
            x_cont,
            x_mean,
            x_inv_std,
        }
    }

    /// Contiguous forward input.
    #[must_use]
    pub fn x_cont(&self) -> &Tensor {
        &self.x_cont
    }

    /// Per-channel batch mean, in the statistics dtype.
    #[must_use]
    pub fn x_mean(&self) -> &Tensor {
        &self.x_mean
    }

    /// Per-channel inverse standard deviation, in the statistics dtype.
    #[must_use]
    pub fn x_inv_std(&self) -> &Tensor {
        &self.x_inv_std
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_downcast() {
        let t = Tensor::from_vec(vec![1.0_f32], &[1]).unwrap();
        let state = OpState::new(BatchNormState::new(t.clone(), t.clone(), t));
        assert!(state.is::<BatchNormState>());
        assert_eq!(
            state
                .downcast_ref::<BatchNormState>()
                .unwrap()
                .x_mean()
                .to_vec::<f32>(),
            vec![1.0]
        );
    }

    #[test]
    fn test_wrong_payload() {
        let state = OpState::new(42_u32);
        assert!(matches!(
            state.downcast_ref::<BatchNormState>(),
            Err(Error::StateMismatch { .. })
        ));
        assert!(format!("{state:?}").contains("u32"));
    }
}
