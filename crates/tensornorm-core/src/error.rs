//! Error Types - tensornorm Error Handling
//!
//! Provides the error type shared by every tensornorm crate: tensor-capability
//! failures (shape, dtype, device, layout) and the batch-normalization errors
//! raised before or around an accelerated primitive call.
//!
//! # Key Features
//! - Unified error type for all tensornorm operations
//! - Primitive status codes carried through as typed data
//! - Integration with `std::error::Error`
//!
//! @version 0.1.0

use thiserror::Error;

use crate::device::Device;
use crate::dtype::DType;

// =============================================================================
// Error Types
// =============================================================================

/// The main error type for tensornorm operations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    /// Shape mismatch between tensors.
    #[error("Shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        /// The expected shape.
        expected: Vec<usize>,
        /// The actual shape.
        actual: Vec<usize>,
    },

    /// Data type mismatch between tensors.
    #[error("DType mismatch: expected {expected:?}, got {actual:?}")]
    DTypeMismatch {
        /// The expected data type.
        expected: DType,
        /// The actual data type.
        actual: DType,
    },

    /// Device mismatch between tensors.
    #[error("Device mismatch: expected {expected:?}, got {actual:?}")]
    DeviceMismatch {
        /// The expected device.
        expected: Device,
        /// The actual device.
        actual: Device,
    },

    /// Invalid dimension index.
    #[error("Invalid dimension: index {index} for tensor with {ndim} dimensions")]
    InvalidDimension {
        /// The invalid dimension index.
        index: i64,
        /// Number of dimensions in the tensor.
        ndim: usize,
    },

    /// Index out of bounds.
    #[error("Index out of bounds: index {index} for dimension of size {size}")]
    IndexOutOfBounds {
        /// The invalid index.
        index: usize,
        /// The size of the dimension.
        size: usize,
    },

    /// Device not available.
    #[error("Device not available: {device:?}")]
    DeviceNotAvailable {
        /// The unavailable device.
        device: Device,
    },

    /// Invalid operation for the given tensor.
    #[error("Invalid operation: {message}")]
    InvalidOperation {
        /// Description of why the operation is invalid.
        message: String,
    },

    /// Contiguous tensor required.
    #[error("Operation requires contiguous tensor")]
    NotContiguous,

    /// The reduction axes cannot be mapped onto a normalization mode.
    #[error("Dimension error: {message}")]
    Dimension {
        /// Description including the offending axes.
        message: String,
    },

    /// Epsilon below the minimum accepted by the primitive.
    #[error("Minimum allowed epsilon is {min} but found {found}.")]
    Epsilon {
        /// Smallest epsilon the primitive accepts.
        min: f64,
        /// The epsilon that was requested.
        found: f64,
    },

    /// A buffer does not have the memory layout an operation needs.
    #[error("Layout error: {message}")]
    Layout {
        /// Which buffer and why.
        message: String,
    },

    /// The primitive reported a precision tensornorm cannot represent.
    #[error("Unsupported dtype: {message}")]
    UnsupportedDType {
        /// Description of the unsupported type.
        message: String,
    },

    /// The accelerated primitive returned a non-success status.
    #[error("{status} ({code}): {message}")]
    Primitive {
        /// Symbolic name of the status.
        status: String,
        /// Numeric status code.
        code: i32,
        /// Context from the failing call.
        message: String,
    },

    /// Backward was called without the state produced by forward.
    #[error("Batch normalization state is missing; recomputing statistics in backward is not supported")]
    MissingState,

    /// The op state holds a payload of another operation family.
    #[error("Op state does not hold a {expected}")]
    StateMismatch {
        /// Name of the payload type that was requested.
        expected: &'static str,
    },

    /// Internal error (should not happen).
    #[error("Internal error: {message}")]
    InternalError {
        /// Description of the internal error.
        message: String,
    },
}

// =============================================================================
// Result Type
// =============================================================================

/// A specialized Result type for tensornorm operations.
pub type Result<T> = core::result::Result<T, Error>;

// =============================================================================
// Helper Functions
// =============================================================================

impl Error {
    /// Creates a new shape mismatch error.
    #[must_use]
    pub fn shape_mismatch(expected: &[usize], actual: &[usize]) -> Self {
        Self::ShapeMismatch {
            expected: expected.to_vec(),
            actual: actual.to_vec(),
        }
    }

    /// Creates a new invalid operation error.
    #[must_use]
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    /// Creates a new dimension error.
    #[must_use]
    pub fn dimension(message: impl Into<String>) -> Self {
        Self::Dimension {
            message: message.into(),
        }
    }

    /// Creates a new layout error.
    #[must_use]
    pub fn layout(message: impl Into<String>) -> Self {
        Self::Layout {
            message: message.into(),
        }
    }

    /// Creates a new unsupported dtype error.
    #[must_use]
    pub fn unsupported_dtype(message: impl Into<String>) -> Self {
        Self::UnsupportedDType {
            message: message.into(),
        }
    }

    /// Creates a new internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::InternalError {
            message: message.into(),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::shape_mismatch(&[2, 3], &[2, 4]);
        assert!(err.to_string().contains("Shape mismatch"));
    }

    #[test]
    fn test_epsilon_display() {
        let err = Error::Epsilon {
            min: 1e-5,
            found: 1e-7,
        };
        assert_eq!(
            err.to_string(),
            "Minimum allowed epsilon is 0.00001 but found 0.0000001."
        );
    }

    #[test]
    fn test_primitive_display() {
        let err = Error::Primitive {
            status: "STATUS_BAD_PARAM".to_string(),
            code: 3,
            message: "forward training".to_string(),
        };
        assert_eq!(err.to_string(), "STATUS_BAD_PARAM (3): forward training");
    }

    #[test]
    fn test_error_equality() {
        assert_eq!(Error::MissingState, Error::MissingState);
        assert_ne!(Error::NotContiguous, Error::MissingState);
    }
}
