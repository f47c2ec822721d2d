//! Tensor - Core N-Dimensional Array Type
//!
//! The `Tensor` struct is a dtype-erased, strided view over reference-counted
//! byte storage. Cloning a tensor shares its storage, so an output tensor
//! passed by reference to an operation is written in place.
//!
//! # Key Features
//! - Runtime dtype (f16, f32, f64, integers)
//! - Strided views with shared storage
//! - Raw data pointers for primitive libraries
//!
//! @version 0.1.0

use core::fmt;

use tensornorm_core::dtype::{DType, Scalar};
use tensornorm_core::error::{Error, Result};
use tensornorm_core::storage::Storage;
use tensornorm_core::Device;

use crate::shape::{
    contiguous_strides, is_contiguous, linear_index, normalize_dim, numel, reduce_shape,
    transpose_strides, unravel_index, Shape, Strides,
};

// =============================================================================
// Tensor Struct
// =============================================================================

/// An N-dimensional array whose element type is known at runtime.
#[derive(Clone)]
pub struct Tensor {
    /// Underlying byte storage (reference-counted).
    pub(crate) storage: Storage,
    /// Shape of the tensor (dimensions).
    pub(crate) shape: Shape,
    /// Strides for each dimension, in elements.
    pub(crate) strides: Strides,
    /// Offset into storage, in elements.
    pub(crate) offset: usize,
    /// Element type.
    pub(crate) dtype: DType,
}

impl Tensor {
    // =========================================================================
    // Constructors
    // =========================================================================

    /// Creates a contiguous tensor over `storage`.
    ///
    /// Fails if the storage does not hold exactly `numel(shape)` elements of
    /// `dtype`.
    pub fn from_storage(storage: Storage, shape: &[usize], dtype: DType) -> Result<Self> {
        let nbytes = numel(shape) * dtype.size_of();
        if nbytes != storage.len() {
            return Err(Error::shape_mismatch(
                &[storage.len() / dtype.size_of()],
                shape,
            ));
        }

        Ok(Self {
            storage,
            strides: contiguous_strides(shape),
            shape: Shape::from_slice(shape),
            offset: 0,
            dtype,
        })
    }

    /// Creates a CPU tensor from a vector with the given shape.
    pub fn from_vec<T: Scalar>(data: Vec<T>, shape: &[usize]) -> Result<Self> {
        Self::from_vec_on(data, shape, Device::Cpu)
    }

    /// Creates a tensor on `device` from a vector with the given shape.
    pub fn from_vec_on<T: Scalar>(data: Vec<T>, shape: &[usize], device: Device) -> Result<Self> {
        if data.len() != numel(shape) {
            return Err(Error::shape_mismatch(&[data.len()], shape));
        }
        let bytes = bytemuck::cast_slice::<T, u8>(&data).to_vec();
        Self::from_storage(Storage::from_bytes(bytes, device), shape, T::DTYPE)
    }

    /// Creates a CPU tensor by copying a slice.
    pub fn from_slice<T: Scalar>(data: &[T], shape: &[usize]) -> Result<Self> {
        Self::from_vec(data.to_vec(), shape)
    }

    /// Creates a view with explicit shape, strides and element offset.
    ///
    /// Fails if any addressed element falls outside the storage.
    pub fn as_strided(&self, shape: &[usize], strides: &[isize], offset: usize) -> Result<Self> {
        if shape.len() != strides.len() {
            return Err(Error::invalid_operation(format!(
                "as_strided: {} dims but {} strides",
                shape.len(),
                strides.len()
            )));
        }
        if strides.iter().any(|&s| s < 0) {
            return Err(Error::invalid_operation("as_strided: negative strides"));
        }

        let capacity = self.storage.len() / self.dtype.size_of();
        if numel(shape) > 0 {
            let last: usize = shape
                .iter()
                .zip(strides.iter())
                .map(|(&dim, &stride)| (dim - 1) * stride as usize)
                .sum();
            if offset + last >= capacity {
                return Err(Error::IndexOutOfBounds {
                    index: offset + last,
                    size: capacity,
                });
            }
        }

        Ok(Self {
            storage: self.storage.clone(),
            shape: Shape::from_slice(shape),
            strides: Strides::from_slice(strides),
            offset,
            dtype: self.dtype,
        })
    }

    // =========================================================================
    // Properties
    // =========================================================================

    /// Returns the shape of the tensor.
    #[must_use]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Returns the strides of the tensor, in elements.
    #[must_use]
    pub fn strides(&self) -> &[isize] {
        &self.strides
    }

    /// Returns the element offset into the storage.
    #[must_use]
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Returns the element type.
    #[must_use]
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Returns the number of dimensions.
    #[must_use]
    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    /// Returns the total number of elements.
    #[must_use]
    pub fn numel(&self) -> usize {
        numel(&self.shape)
    }

    /// Returns the number of bytes the elements occupy when contiguous.
    #[must_use]
    pub fn nbytes(&self) -> usize {
        self.numel() * self.dtype.size_of()
    }

    /// Returns true if the tensor is empty (has zero elements).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.numel() == 0
    }

    /// Returns the device this tensor is on.
    #[must_use]
    pub fn device(&self) -> Device {
        self.storage.device()
    }

    /// Returns the underlying storage.
    #[must_use]
    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    /// Returns true if the tensor is contiguous in memory.
    #[must_use]
    pub fn is_contiguous(&self) -> bool {
        is_contiguous(&self.shape, &self.strides)
    }

    /// Returns true if both tensors address the same first byte of the same
    /// buffer.
    #[must_use]
    pub fn shares_data_with(&self, other: &Self) -> bool {
        self.storage.same_buffer(&other.storage)
            && self.offset * self.dtype.size_of() == other.offset * other.dtype.size_of()
    }

    /// Returns the shape left after reducing over `axes`.
    pub fn reduced_shape(&self, axes: &[usize], keepdims: bool) -> Result<Shape> {
        reduce_shape(&self.shape, axes, keepdims)
    }

    // =========================================================================
    // Raw Access
    // =========================================================================

    /// Returns a pointer to the first element of this view.
    ///
    /// The pointer addresses device memory in the layout described by
    /// `shape()`/`strides()`, and is intended for primitive libraries.
    pub fn data_ptr(&self) -> Result<*mut u8> {
        self.storage.raw_ptr(self.offset * self.dtype.size_of())
    }

    /// Returns the storage element offset of every element, in row-major
    /// logical order.
    pub(crate) fn element_offsets(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.numel()).map(move |i| {
            let indices = unravel_index(i, &self.shape);
            self.offset + linear_index(&indices, &self.strides)
        })
    }

    // =========================================================================
    // Data Access
    // =========================================================================

    /// Returns the element at the given indices, widened to `f64`.
    pub fn get(&self, indices: &[usize]) -> Result<f64> {
        let offset = self.checked_offset(indices)?;
        Ok(self.dtype.read_f64(&self.storage.as_bytes(), offset))
    }

    /// Sets the element at the given indices, converting from `f64`.
    pub fn set(&self, indices: &[usize], value: f64) -> Result<()> {
        let offset = self.checked_offset(indices)?;
        self.dtype
            .write_f64(&mut self.storage.as_bytes_mut(), offset, value);
        Ok(())
    }

    fn checked_offset(&self, indices: &[usize]) -> Result<usize> {
        if indices.len() != self.ndim() {
            return Err(Error::invalid_operation(format!(
                "Expected {} indices, got {}",
                self.ndim(),
                indices.len()
            )));
        }

        for (&idx, &dim) in indices.iter().zip(self.shape.iter()) {
            if idx >= dim {
                return Err(Error::IndexOutOfBounds {
                    index: idx,
                    size: dim,
                });
            }
        }

        Ok(self.offset + linear_index(indices, &self.strides))
    }

    /// Returns all elements in logical order, widened to `f64`.
    #[must_use]
    pub fn to_f64_vec(&self) -> Vec<f64> {
        let bytes = self.storage.as_bytes();
        self.element_offsets()
            .map(|offset| self.dtype.read_f64(&bytes, offset))
            .collect()
    }

    /// Returns all elements in logical order, converted to `T`.
    #[must_use]
    pub fn to_vec<T: Scalar>(&self) -> Vec<T> {
        self.to_f64_vec().into_iter().map(T::from_f64).collect()
    }

    // =========================================================================
    // Shape Operations
    // =========================================================================

    /// Returns a view with two dimensions swapped.
    pub fn transpose(&self, dim0: i64, dim1: i64) -> Result<Self> {
        let d0 = normalize_dim(dim0, self.ndim())?;
        let d1 = normalize_dim(dim1, self.ndim())?;

        let mut shape = self.shape.clone();
        shape.swap(d0, d1);

        Ok(Self {
            storage: self.storage.clone(),
            shape,
            strides: transpose_strides(&self.strides, d0, d1),
            offset: self.offset,
            dtype: self.dtype,
        })
    }

    /// Returns a view with a new shape over the same contiguous data.
    pub fn reshape(&self, new_shape: &[usize]) -> Result<Self> {
        if numel(new_shape) != self.numel() {
            return Err(Error::shape_mismatch(self.shape(), new_shape));
        }
        if !self.is_contiguous() {
            return Err(Error::NotContiguous);
        }

        Ok(Self {
            storage: self.storage.clone(),
            shape: Shape::from_slice(new_shape),
            strides: contiguous_strides(new_shape),
            offset: self.offset,
            dtype: self.dtype,
        })
    }
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tensor")
            .field("shape", &self.shape.as_slice())
            .field("strides", &self.strides.as_slice())
            .field("offset", &self.offset)
            .field("dtype", &self.dtype)
            .field("device", &self.device())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use half::f16;

    #[test]
    fn test_from_vec() {
        let t = Tensor::from_vec(vec![1.0_f32, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3]).unwrap();
        assert_eq!(t.shape(), &[2, 3]);
        assert_eq!(t.strides(), &[3, 1]);
        assert_eq!(t.dtype(), DType::F32);
        assert_eq!(t.nbytes(), 24);
        assert!(t.is_contiguous());
        assert_eq!(t.get(&[1, 2]).unwrap(), 6.0);
    }

    #[test]
    fn test_from_vec_shape_mismatch() {
        assert!(Tensor::from_vec(vec![1.0_f64, 2.0], &[3]).is_err());
    }

    #[test]
    fn test_set_writes_through_clones() {
        let t = Tensor::from_vec(vec![0.0_f64; 4], &[4]).unwrap();
        let alias = t.clone();
        alias.set(&[2], 5.0).unwrap();
        assert_eq!(t.to_vec::<f64>(), vec![0.0, 0.0, 5.0, 0.0]);
    }

    #[test]
    fn test_transpose_is_non_contiguous_view() {
        let t = Tensor::from_vec(vec![1_i32, 2, 3, 4, 5, 6], &[2, 3]).unwrap();
        let tt = t.transpose(0, 1).unwrap();
        assert_eq!(tt.shape(), &[3, 2]);
        assert!(!tt.is_contiguous());
        assert_eq!(tt.to_vec::<i32>(), vec![1, 4, 2, 5, 3, 6]);
        assert!(tt.shares_data_with(&t));
    }

    #[test]
    fn test_as_strided() {
        let t = Tensor::from_vec(vec![0.0_f32, 1.0, 2.0, 3.0, 4.0, 5.0], &[6]).unwrap();
        let every_other = t.as_strided(&[3], &[2], 1).unwrap();
        assert!(!every_other.is_contiguous());
        assert_eq!(every_other.to_vec::<f32>(), vec![1.0, 3.0, 5.0]);
        assert!(t.as_strided(&[4], &[2], 0).is_err());
    }

    #[test]
    fn test_half_round_trip() {
        let t = Tensor::from_vec(vec![f16::from_f32(0.5), f16::from_f32(-2.0)], &[2]).unwrap();
        assert_eq!(t.dtype(), DType::F16);
        assert_eq!(t.to_vec::<f32>(), vec![0.5, -2.0]);
    }

    #[test]
    fn test_reshape_requires_contiguous() {
        let t = Tensor::from_vec(vec![1.0_f32; 6], &[2, 3]).unwrap();
        assert_eq!(t.reshape(&[3, 2]).unwrap().shape(), &[3, 2]);
        assert!(t.transpose(0, 1).unwrap().reshape(&[6]).is_err());
    }

    #[test]
    fn test_data_ptr_respects_offset() {
        let t = Tensor::from_vec(vec![1.0_f32, 2.0, 3.0], &[3]).unwrap();
        let view = t.as_strided(&[2], &[1], 1).unwrap();
        let base = t.data_ptr().unwrap();
        let shifted = view.data_ptr().unwrap();
        assert_eq!(shifted as usize - base as usize, 4);
    }
}
