//! Descriptors - Scoped Primitive Tensor Descriptors
//!
//! Guards over descriptor handles that release the handle when dropped, on
//! success and error paths alike. Neither guard can be cloned, so every
//! handle has exactly one owner.
//!
//! @version 0.1.0

use tracing::warn;

use tensornorm_core::dtype::DType;
use tensornorm_core::error::{Error, Result};
use tensornorm_tensor::shape::contiguous_strides;
use tensornorm_tensor::Tensor;

use crate::mode::BatchNormMode;
use crate::primitive::{BatchNormPrimitive, DataType, DescriptorHandle, TensorDescriptorInfo};

/// Descriptors always have at least this many dimensions; lower-rank
/// tensors are padded with trailing unit dimensions.
pub const MIN_DESCRIPTOR_DIMS: usize = 4;

// =============================================================================
// Owned Handle
// =============================================================================

struct OwnedHandle<'p, P: BatchNormPrimitive + ?Sized> {
    primitive: &'p P,
    handle: DescriptorHandle,
}

impl<'p, P: BatchNormPrimitive + ?Sized> OwnedHandle<'p, P> {
    fn create(primitive: &'p P) -> Result<Self> {
        let handle = primitive.create_tensor_descriptor()?;
        Ok(Self { primitive, handle })
    }

    fn info(&self) -> Result<TensorDescriptorInfo> {
        Ok(self.primitive.tensor_descriptor_info(self.handle)?)
    }
}

impl<P: BatchNormPrimitive + ?Sized> Drop for OwnedHandle<'_, P> {
    fn drop(&mut self) {
        if let Err(e) = self.primitive.destroy_tensor_descriptor(self.handle) {
            warn!(
                primitive = self.primitive.name(),
                handle = %self.handle,
                error = %e,
                "failed to destroy tensor descriptor"
            );
        }
    }
}

// =============================================================================
// TensorDescriptor
// =============================================================================

/// Descriptor of a data tensor.
pub struct TensorDescriptor<'p, P: BatchNormPrimitive + ?Sized> {
    inner: OwnedHandle<'p, P>,
}

impl<'p, P: BatchNormPrimitive + ?Sized> TensorDescriptor<'p, P> {
    /// Describes `tensor`'s dtype, shape and strides.
    ///
    /// Contiguous tensors are described with canonical row-major strides,
    /// whatever stride their unit dimensions carry.
    pub fn new(primitive: &'p P, tensor: &Tensor) -> Result<Self> {
        let data_type = DataType::from_dtype(tensor.dtype())?;
        let (dims, strides) = if tensor.is_contiguous() {
            padded_layout(tensor.shape(), &contiguous_strides(tensor.shape()))
        } else {
            padded_layout(tensor.shape(), tensor.strides())
        };

        let inner = OwnedHandle::create(primitive)?;
        primitive.set_tensor_descriptor(inner.handle, data_type, &dims, &strides)?;
        Ok(Self { inner })
    }

    /// Returns the raw handle.
    #[must_use]
    pub fn handle(&self) -> DescriptorHandle {
        self.inner.handle
    }

    /// Returns what the descriptor describes.
    pub fn info(&self) -> Result<TensorDescriptorInfo> {
        self.inner.info()
    }
}

fn padded_layout(shape: &[usize], strides: &[isize]) -> (Vec<usize>, Vec<isize>) {
    let mut dims = shape.to_vec();
    let mut strides = strides.to_vec();
    while dims.len() < MIN_DESCRIPTOR_DIMS {
        dims.push(1);
        strides.push(1);
    }
    (dims, strides)
}

// =============================================================================
// BnTensorDescriptor
// =============================================================================

/// Descriptor of the per-channel statistics and parameters of a
/// batch-normalized tensor.
pub struct BnTensorDescriptor<'p, P: BatchNormPrimitive + ?Sized> {
    inner: OwnedHandle<'p, P>,
}

impl<'p, P: BatchNormPrimitive + ?Sized> BnTensorDescriptor<'p, P> {
    /// Derives the statistics descriptor of `x_desc` in `mode`.
    pub fn new(primitive: &'p P, x_desc: &TensorDescriptor<'_, P>, mode: BatchNormMode) -> Result<Self> {
        let inner = OwnedHandle::create(primitive)?;
        primitive.derive_bn_descriptor(inner.handle, x_desc.handle(), mode)?;
        Ok(Self { inner })
    }

    /// Returns the raw handle.
    #[must_use]
    pub fn handle(&self) -> DescriptorHandle {
        self.inner.handle
    }

    /// Returns the number of per-channel elements described.
    pub fn numel(&self) -> Result<usize> {
        Ok(self.inner.info()?.numel())
    }

    /// Returns the dtype the primitive keeps statistics and parameters in.
    ///
    /// Fails with [`Error::UnsupportedDType`] for non-float precisions.
    pub fn dtype(&self) -> Result<DType> {
        let data_type = self.inner.info()?.data_type;
        match data_type {
            DataType::Half | DataType::Float | DataType::Double => Ok(data_type.to_dtype()),
            other => Err(Error::unsupported_dtype(format!(
                "Unsupported statistics data type: {other}"
            ))),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
