//! tensornorm Tensor - Strided Arrays for Primitive Libraries
//!
//! This crate provides the `Tensor` type the batch-normalization core
//! operates on: a dtype-erased, strided view over shared byte storage with
//! the layout and precision conversions needed around accelerated
//! primitive calls.
//!
//! # Key Features
//! - Runtime dtype with f16/f32/f64 support
//! - Strided views sharing storage (outputs are written in place)
//! - Contiguity checks and contiguous/dtype-converting copies
//! - Reduction-axis sets and reduced shapes
//!
//! # Example
//! ```rust
//! use tensornorm_tensor::{empty_like, Axes, DType, Tensor};
//!
//! let x = Tensor::from_vec(vec![1.0_f32; 24], &[2, 3, 2, 2]).unwrap();
//! let axes = Axes::from([0, 2, 3]);
//! assert_eq!(x.reduced_shape(&axes, true).unwrap().as_slice(), &[1, 3, 1, 1]);
//!
//! let y = empty_like(&x);
//! assert_eq!(y.dtype(), DType::F32);
//! ```
//!
//! @version 0.1.0

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
// ML/tensor-specific allowances
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_wrap)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::uninlined_format_args)]

// =============================================================================
// Modules
// =============================================================================

pub mod creation;
pub mod ops;
pub mod shape;
pub mod tensor;

// =============================================================================
// Re-exports
// =============================================================================

pub use creation::{empty, empty_like, full, ones, zeros};
pub use shape::{Axes, Shape, Strides};
pub use tensor::Tensor;

pub use tensornorm_core::{DType, Device, DeviceScope, Error, Result, Scalar};

// =============================================================================
// Prelude
// =============================================================================

/// Convenient imports for common usage.
pub mod prelude {
    pub use crate::creation::{empty, empty_like, full, ones, zeros};
    pub use crate::shape::{Axes, Shape, Strides};
    pub use crate::tensor::Tensor;
    pub use tensornorm_core::prelude::*;
}

// =============================================================================
// Tests
// =============================================================================
