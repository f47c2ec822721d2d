//! Primitive Interface - Accelerated Batch-Normalization Library Seam
//!
//! Defines the contract between the batch-normalization operations and a
//! neural-network primitives library: opaque tensor descriptors, status
//! codes, scaling coefficients, and the three batch-norm entry points.
//!
//! Entry points take raw data pointers in the layout their descriptors
//! describe, so implementations may target any memory the pointers can
//! address.
//!
//! # Key Features
//! - `BatchNormPrimitive` trait implemented by every primitive library
//! - Numeric status codes carried into `tensornorm_core::Error`
//! - Compute-type scaling coefficients derived from the data dtype
//!
//! @version 0.1.0

use core::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use tensornorm_core::dtype::DType;
use tensornorm_core::error::{Error as CoreError, Result};

use crate::mode::BatchNormMode;

// =============================================================================
// Data Types
// =============================================================================

/// Element types a tensor descriptor can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    /// 16-bit IEEE float.
    Half,
    /// 32-bit IEEE float.
    Float,
    /// 64-bit IEEE float.
    Double,
    /// 8-bit signed integer.
    Int8,
    /// 32-bit signed integer.
    Int32,
    /// 8-bit unsigned integer.
    UInt8,
}

impl DataType {
    /// Returns the descriptor type for a tensor dtype.
    pub fn from_dtype(dtype: DType) -> Result<Self> {
        match dtype {
            DType::F16 => Ok(Self::Half),
            DType::F32 => Ok(Self::Float),
            DType::F64 => Ok(Self::Double),
            DType::I8 => Ok(Self::Int8),
            DType::I32 => Ok(Self::Int32),
            DType::U8 => Ok(Self::UInt8),
            DType::I64 => Err(CoreError::unsupported_dtype(format!(
                "{dtype} has no primitive data type"
            ))),
        }
    }

    /// Returns the tensor dtype of this descriptor type.
    #[must_use]
    pub const fn to_dtype(self) -> DType {
        match self {
            Self::Half => DType::F16,
            Self::Float => DType::F32,
            Self::Double => DType::F64,
            Self::Int8 => DType::I8,
            Self::Int32 => DType::I32,
            Self::UInt8 => DType::U8,
        }
    }

    /// Returns the size in bytes of one element.
    #[must_use]
    pub const fn size_of(self) -> usize {
        self.to_dtype().size_of()
    }

    /// Returns true for the floating point types.
    #[must_use]
    pub const fn is_float(self) -> bool {
        matches!(self, Self::Half | Self::Float | Self::Double)
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Half => "DATA_HALF",
            Self::Float => "DATA_FLOAT",
            Self::Double => "DATA_DOUBLE",
            Self::Int8 => "DATA_INT8",
            Self::Int32 => "DATA_INT32",
            Self::UInt8 => "DATA_UINT8",
        };
        f.write_str(name)
    }
}

// =============================================================================
// Status
// =============================================================================

/// Non-success status codes a primitive call can return.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    /// The library was not initialized.
    NotInitialized,
    /// A resource allocation failed.
    AllocFailed,
    /// An argument was invalid.
    BadParam,
    /// The library hit an internal error.
    InternalError,
    /// A value was out of range.
    InvalidValue,
    /// The device lacks a required feature.
    ArchMismatch,
    /// Device memory could not be accessed.
    MappingError,
    /// A kernel failed to execute.
    ExecutionFailed,
    /// The configuration is not supported.
    NotSupported,
}

impl Status {
    /// Returns the numeric status code.
    #[must_use]
    pub const fn code(self) -> i32 {
        match self {
            Self::NotInitialized => 1,
            Self::AllocFailed => 2,
            Self::BadParam => 3,
            Self::InternalError => 4,
            Self::InvalidValue => 5,
            Self::ArchMismatch => 6,
            Self::MappingError => 7,
            Self::ExecutionFailed => 8,
            Self::NotSupported => 9,
        }
    }

    /// Returns the symbolic status name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::NotInitialized => "STATUS_NOT_INITIALIZED",
            Self::AllocFailed => "STATUS_ALLOC_FAILED",
            Self::BadParam => "STATUS_BAD_PARAM",
            Self::InternalError => "STATUS_INTERNAL_ERROR",
            Self::InvalidValue => "STATUS_INVALID_VALUE",
            Self::ArchMismatch => "STATUS_ARCH_MISMATCH",
            Self::MappingError => "STATUS_MAPPING_ERROR",
            Self::ExecutionFailed => "STATUS_EXECUTION_FAILED",
            Self::NotSupported => "STATUS_NOT_SUPPORTED",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A failed primitive call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{status}: {message}")]
pub struct PrimitiveError {
    /// Status returned by the library.
    pub status: Status,
    /// What the library was asked to do.
    pub message: String,
}

impl PrimitiveError {
    /// Creates a new primitive error.
    #[must_use]
    pub fn new(status: Status, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    /// Creates a `STATUS_BAD_PARAM` error.
    #[must_use]
    pub fn bad_param(message: impl Into<String>) -> Self {
        Self::new(Status::BadParam, message)
    }
}

impl From<PrimitiveError> for CoreError {
    fn from(err: PrimitiveError) -> Self {
        Self::Primitive {
            status: err.status.name().to_string(),
            code: err.status.code(),
            message: err.message,
        }
    }
}

/// Result type of primitive calls.
pub type PrimitiveResult<T> = core::result::Result<T, PrimitiveError>;

// =============================================================================
// Descriptors
// =============================================================================

/// Opaque handle to a tensor descriptor owned by a primitive library.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DescriptorHandle(pub u64);

impl fmt::Display for DescriptorHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "desc#{}", self.0)
    }
}

/// What a tensor descriptor describes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorDescriptorInfo {
    /// Element type.
    pub data_type: DataType,
    /// Extent of each dimension.
    pub dims: Vec<usize>,
    /// Stride of each dimension, in elements.
    pub strides: Vec<isize>,
}

impl TensorDescriptorInfo {
    /// Returns the number of elements described.
    #[must_use]
    pub fn numel(&self) -> usize {
        self.dims.iter().product()
    }
}

// =============================================================================
// Coefficients
// =============================================================================

/// A scaling factor in the primitive's compute type.
///
/// Half and single precision data compute in `f32`, double precision data
/// computes in `f64`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Coefficient {
    /// Single-precision scaling factor.
    F32(f32),
    /// Double-precision scaling factor.
    F64(f64),
}

impl Coefficient {
    /// Returns `value` in the compute type of `dtype`.
    #[must_use]
    pub fn for_dtype(dtype: DType, value: f64) -> Self {
        match dtype {
            DType::F64 => Self::F64(value),
            _ => Self::F32(value as f32),
        }
    }

    /// Returns the coefficient `1` for `dtype`.
    #[must_use]
    pub fn one(dtype: DType) -> Self {
        Self::for_dtype(dtype, 1.0)
    }

    /// Returns the coefficient `0` for `dtype`.
    #[must_use]
    pub fn zero(dtype: DType) -> Self {
        Self::for_dtype(dtype, 0.0)
    }

    /// Returns the value widened to `f64`.
    #[must_use]
    pub fn value(self) -> f64 {
        match self {
            Self::F32(v) => f64::from(v),
            Self::F64(v) => v,
        }
    }

    /// Returns true if the coefficient is exactly zero.
    #[must_use]
    pub fn is_zero(self) -> bool {
        self.value() == 0.0
    }

    /// Returns true if this coefficient has the compute type of `data_type`.
    #[must_use]
    pub fn matches(self, data_type: DataType) -> bool {
        match self {
            Self::F64(_) => data_type == DataType::Double,
            Self::F32(_) => matches!(data_type, DataType::Half | DataType::Float),
        }
    }
}

// =============================================================================
// Call Arguments
// =============================================================================

/// Arguments of a training-mode forward call.
///
/// `y = alpha * bn(x) + beta * y`, with `beta == 0` meaning `y` is not read.
#[derive(Debug, Clone, Copy)]
pub struct ForwardTrainingArgs {
    /// Normalization mode.
    pub mode: BatchNormMode,
    /// Scale of the result.
    pub alpha: Coefficient,
    /// Scale of the prior destination contents.
    pub beta: Coefficient,
    /// Descriptor of `x` and `y`.
    pub x_desc: DescriptorHandle,
    /// Input data.
    pub x: *const u8,
    /// Output data.
    pub y: *mut u8,
    /// Descriptor of every per-channel buffer.
    pub bn_desc: DescriptorHandle,
    /// Scale parameter (gamma).
    pub scale: *const u8,
    /// Shift parameter (beta).
    pub bias: *const u8,
    /// Weight of the batch statistic in the running average.
    pub exponential_average_factor: f64,
    /// Running mean, updated in place. May be null.
    pub running_mean: *mut u8,
    /// Running variance, updated in place. May be null.
    pub running_var: *mut u8,
    /// Variance epsilon.
    pub epsilon: f64,
    /// Receives the batch mean. May be null.
    pub save_mean: *mut u8,
    /// Receives the batch inverse standard deviation. May be null.
    pub save_inv_std: *mut u8,
}

/// Arguments of a backward call.
#[derive(Debug, Clone, Copy)]
pub struct BackwardArgs {
    /// Normalization mode.
    pub mode: BatchNormMode,
    /// Scale of the computed input gradient.
    pub alpha_data: Coefficient,
    /// Scale of the prior input-gradient contents.
    pub beta_data: Coefficient,
    /// Scale of the computed parameter gradients.
    pub alpha_param: Coefficient,
    /// Scale of the prior parameter-gradient contents.
    pub beta_param: Coefficient,
    /// Descriptor of `x`, `dy` and `dx`.
    pub x_desc: DescriptorHandle,
    /// Forward input.
    pub x: *const u8,
    /// Gradient of the forward output.
    pub dy: *const u8,
    /// Receives the input gradient.
    pub dx: *mut u8,
    /// Descriptor of every per-channel buffer.
    pub bn_desc: DescriptorHandle,
    /// Scale parameter (gamma).
    pub scale: *const u8,
    /// Receives the scale gradient.
    pub scale_grad: *mut u8,
    /// Receives the shift gradient.
    pub bias_grad: *mut u8,
    /// Variance epsilon.
    pub epsilon: f64,
    /// Batch mean saved by forward.
    pub saved_mean: *const u8,
    /// Batch inverse standard deviation saved by forward.
    pub saved_inv_std: *const u8,
}

/// Arguments of an inference-mode forward call.
#[derive(Debug, Clone, Copy)]
pub struct ForwardInferenceArgs {
    /// Normalization mode.
    pub mode: BatchNormMode,
    /// Scale of the result.
    pub alpha: Coefficient,
    /// Scale of the prior destination contents.
    pub beta: Coefficient,
    /// Descriptor of `x` and `y`.
    pub x_desc: DescriptorHandle,
    /// Input data.
    pub x: *const u8,
    /// Output data.
    pub y: *mut u8,
    /// Descriptor of every per-channel buffer.
    pub bn_desc: DescriptorHandle,
    /// Scale parameter (gamma).
    pub scale: *const u8,
    /// Shift parameter (beta).
    pub bias: *const u8,
    /// Fixed mean.
    pub estimated_mean: *const u8,
    /// Fixed variance.
    pub estimated_var: *const u8,
    /// Variance epsilon.
    pub epsilon: f64,
}

// =============================================================================
// Primitive Trait
// =============================================================================

/// A neural-network primitives library providing batch normalization.
///
/// Descriptor handles are owned by the caller between `create` and
/// `destroy`. The three entry points read and write through raw pointers
/// laid out as their descriptors describe.
pub trait BatchNormPrimitive: Send + Sync {
    /// Returns the name of this library.
    fn name(&self) -> &'static str;

    /// Returns the smallest epsilon the library accepts.
    fn min_epsilon(&self) -> f64;

    /// Allocates an unset tensor descriptor.
    fn create_tensor_descriptor(&self) -> PrimitiveResult<DescriptorHandle>;

    /// Describes an N-dimensional tensor.
    fn set_tensor_descriptor(
        &self,
        handle: DescriptorHandle,
        data_type: DataType,
        dims: &[usize],
        strides: &[isize],
    ) -> PrimitiveResult<()>;

    /// Sets `derived` to the per-channel statistics layout of `x_desc` in
    /// `mode`.
    fn derive_bn_descriptor(
        &self,
        derived: DescriptorHandle,
        x_desc: DescriptorHandle,
        mode: BatchNormMode,
    ) -> PrimitiveResult<()>;

    /// Returns what a descriptor describes.
    fn tensor_descriptor_info(&self, handle: DescriptorHandle)
        -> PrimitiveResult<TensorDescriptorInfo>;

    /// Releases a descriptor.
    fn destroy_tensor_descriptor(&self, handle: DescriptorHandle) -> PrimitiveResult<()>;

    /// Normalizes with batch statistics, updating running statistics.
    ///
    /// # Safety
    ///
    /// Every non-null pointer must address memory laid out as its
    /// descriptor describes, valid for the duration of the call, with no
    /// other access to the written buffers in the meantime.
    unsafe fn forward_training(&self, args: &ForwardTrainingArgs) -> PrimitiveResult<()>;

    /// Computes input, scale and shift gradients.
    ///
    /// # Safety
    ///
    /// Same contract as [`BatchNormPrimitive::forward_training`].
    unsafe fn backward(&self, args: &BackwardArgs) -> PrimitiveResult<()>;

    /// Normalizes with fixed statistics.
    ///
    /// # Safety
    ///
    /// Same contract as [`BatchNormPrimitive::forward_training`].
    unsafe fn forward_inference(&self, args: &ForwardInferenceArgs) -> PrimitiveResult<()>;
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coefficients_follow_compute_type() {
        assert_eq!(Coefficient::one(DType::F16), Coefficient::F32(1.0));
        assert_eq!(Coefficient::one(DType::F32), Coefficient::F32(1.0));
        assert_eq!(Coefficient::one(DType::F64), Coefficient::F64(1.0));
        assert!(Coefficient::zero(DType::F64).is_zero());
        assert!(Coefficient::one(DType::F16).matches(DataType::Half));
        assert!(!Coefficient::one(DType::F32).matches(DataType::Double));
    }

    #[test]
    fn test_data_type_mapping() {
        assert_eq!(DataType::from_dtype(DType::F16).unwrap(), DataType::Half);
        assert_eq!(DataType::Double.to_dtype(), DType::F64);
        assert!(DataType::from_dtype(DType::I64).is_err());
        assert!(!DataType::Int32.is_float());
    }

    #[test]
    fn test_primitive_error_conversion() {
        let err: CoreError = PrimitiveError::bad_param("set tensor descriptor").into();
        assert_eq!(
            err,
            CoreError::Primitive {
                status: "STATUS_BAD_PARAM".to_string(),
                code: 3,
                message: "set tensor descriptor".to_string(),
            }
        );
    }
}
