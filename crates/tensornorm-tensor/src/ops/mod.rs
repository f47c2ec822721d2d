//! Tensor Operations - Layout and Precision Conversion
//!
//! The conversions an accelerated operator needs before and after a
//! primitive call.
//!
//! # Categories
//!
//! ## Layout
//! - `as_contiguous` - Row-major copy, or the tensor itself if already contiguous
//!
//! ## Precision
//! - `as_contiguous_with_dtype` - Contiguous and of the requested dtype, copying only if needed
//! - `astype` - Always a fresh contiguous copy in the requested dtype
//! - `cast_into` - Element-wise cast into an existing tensor of any layout
//!
//! ## Raw Memory
//! - `memory_copy_from` - Byte copy between same-sized contiguous tensors
//!
//! # Example
//!
//! ```rust
//! use tensornorm_tensor::{DType, Tensor};
//!
//! let t = Tensor::from_vec(vec![1.0_f32, 2.0, 3.0, 4.0], &[2, 2]).unwrap();
//! let tt = t.transpose(0, 1).unwrap();
//! let c = tt.as_contiguous();
//! assert!(c.is_contiguous());
//! assert_eq!(c.to_vec::<f32>(), vec![1.0, 3.0, 2.0, 4.0]);
//!
//! let d = t.as_contiguous_with_dtype(DType::F64);
//! assert_eq!(d.dtype(), DType::F64);
//! ```
//!
//! @version 0.1.0

use tracing::trace;

use tensornorm_core::dtype::DType;
use tensornorm_core::error::{Error, Result};

use crate::creation::empty;
use crate::tensor::Tensor;

impl Tensor {
    /// Returns a contiguous tensor with the same values.
    ///
    /// Reuses this tensor's storage when it is already contiguous.
    #[must_use]
    pub fn as_contiguous(&self) -> Self {
        self.as_contiguous_with_dtype(self.dtype)
    }

    /// Returns a contiguous tensor of `dtype` with the same values.
    ///
    /// Reuses this tensor's storage when it is already contiguous and of
    /// `dtype`; otherwise copies (and casts) into a new buffer on the same
    /// device.
    #[must_use]
    pub fn as_contiguous_with_dtype(&self, dtype: DType) -> Self {
        if self.is_contiguous() && self.dtype == dtype {
            return self.clone();
        }
        self.astype(dtype)
    }

    /// Returns a new contiguous copy converted to `dtype`.
    #[must_use]
    pub fn astype(&self, dtype: DType) -> Self {
        trace!(from = %self.dtype, to = %dtype, numel = self.numel(), "astype");
        let out = empty(self.shape(), dtype, self.device());
        {
            let src = self.storage.as_bytes();
            let mut dst = out.storage.as_bytes_mut();
            for (i, offset) in self.element_offsets().enumerate() {
                dtype.write_f64(&mut dst, i, self.dtype.read_f64(&src, offset));
            }
        }
        out
    }

    /// Casts every element of this tensor into `out`.
    ///
    /// `out` may have any dtype and layout but must match this tensor's
    /// shape and device. When `out` is this very view the call is a no-op.
    pub fn cast_into(&self, out: &Self) -> Result<()> {
        if self.shape() != out.shape() {
            return Err(Error::shape_mismatch(self.shape(), out.shape()));
        }
        if self.device() != out.device() {
            return Err(Error::DeviceMismatch {
                expected: out.device(),
                actual: self.device(),
            });
        }
        if self.shares_data_with(out) && self.dtype == out.dtype && self.strides == out.strides {
            return Ok(());
        }

        // Read everything first so overlapping views behave like a copy.
        let values = self.to_f64_vec();
        let mut dst = out.storage.as_bytes_mut();
        for (value, offset) in values.into_iter().zip(out.element_offsets()) {
            out.dtype.write_f64(&mut dst, offset, value);
        }
        Ok(())
    }

    /// Copies the raw bytes of `src` into this tensor.
    ///
    /// Both tensors must be contiguous, live on the same device and span the
    /// same number of bytes. No dtype interpretation takes place.
    pub fn memory_copy_from(&self, src: &Self) -> Result<()> {
        if !self.is_contiguous() || !src.is_contiguous() {
            return Err(Error::NotContiguous);
        }
        if self.nbytes() != src.nbytes() {
            return Err(Error::invalid_operation(format!(
                "memory copy between buffers of {} and {} bytes",
                self.nbytes(),
                src.nbytes()
            )));
        }
        self.storage.copy_bytes_from(
            self.offset * self.dtype.size_of(),
            &src.storage,
            src.offset * src.dtype.size_of(),
            src.nbytes(),
        )
    }
}

// =============================================================================
// Tests
// =============================================================================
