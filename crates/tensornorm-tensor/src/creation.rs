//! Tensor Creation - Factory Functions
//!
//! Allocation helpers matching shape, dtype and device, as needed by
//! operations that produce fresh contiguous buffers.
//!
//! @version 0.1.0

use tensornorm_core::dtype::DType;
use tensornorm_core::storage::Storage;
use tensornorm_core::Device;

use crate::shape::{contiguous_strides, numel, Shape};
use crate::tensor::Tensor;

// =============================================================================
// Allocation
// =============================================================================

/// Allocates a contiguous tensor of `shape`/`dtype` on `device`.
///
/// Host-resident storage is zero-initialised; callers must not rely on the
/// contents.
#[must_use]
pub fn empty(shape: &[usize], dtype: DType, device: Device) -> Tensor {
    let storage = Storage::zeros(numel(shape) * dtype.size_of(), device);
    Tensor {
        storage,
        shape: Shape::from_slice(shape),
        strides: contiguous_strides(shape),
        offset: 0,
        dtype,
    }
}

/// Allocates a contiguous tensor with the shape, dtype and device of `like`.
#[must_use]
pub fn empty_like(like: &Tensor) -> Tensor {
    empty(like.shape(), like.dtype(), like.device())
}

/// Creates a tensor of zeros.
#[must_use]
pub fn zeros(shape: &[usize], dtype: DType, device: Device) -> Tensor {
    empty(shape, dtype, device)
}

/// Creates a tensor filled with `value`.
#[must_use]
pub fn full(shape: &[usize], value: f64, dtype: DType, device: Device) -> Tensor {
    let tensor = empty(shape, dtype, device);
    {
        let mut bytes = tensor.storage.as_bytes_mut();
        for i in 0..tensor.numel() {
            dtype.write_f64(&mut bytes, i, value);
        }
    }
    tensor
}

/// Creates a tensor of ones.
#[must_use]
pub fn ones(shape: &[usize], dtype: DType, device: Device) -> Tensor {
    full(shape, 1.0, dtype, device)
}

// =============================================================================
// Tests
// =============================================================================
