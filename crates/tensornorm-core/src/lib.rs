//! tensornorm Core - Foundation Layer for tensornorm
//!
//! This crate provides the abstractions the batch-normalization core is
//! built on: data types, device identity with scoped device selection,
//! byte storage, and the shared error type.
//!
//! # Key Features
//! - Device abstraction (CPU, CUDA ordinals) with a scoped context stack
//! - Runtime dtype system (f16, f32, f64, integers)
//! - Reference-counted byte storage with raw pointer access
//!
//! # Example
//! ```rust
//! use tensornorm_core::{DType, Device, Storage};
//!
//! let storage = Storage::zeros(4 * DType::F32.size_of(), Device::Cpu);
//! assert_eq!(storage.len(), 16);
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
#![allow(clippy::uninlined_format_args)]

// =============================================================================
// Modules
// =============================================================================

pub mod backends;
pub mod device;
pub mod dtype;
pub mod error;
pub mod storage;

// =============================================================================
// Re-exports
// =============================================================================

pub use device::{current_device, Device, DeviceScope};
pub use dtype::{DType, DTypeKind, Scalar};
pub use error::{Error, Result};
pub use storage::Storage;

// =============================================================================
// Prelude
// =============================================================================

/// Convenient imports for common usage.
pub mod prelude {
    pub use crate::device::{current_device, Device, DeviceScope};
    pub use crate::dtype::{DType, DTypeKind, Scalar};
    pub use crate::error::{Error, Result};
    pub use crate::storage::Storage;
}
