//! tensornorm DNN - Accelerated Batch Normalization
//!
//! This crate runs batch normalization (training forward, backward and
//! inference forward) through a neural-network primitives library. It maps
//! reduction axes onto the library's normalization modes, coerces caller
//! tensors into the layout and precision the library needs, hands batch
//! statistics from forward to backward, and writes running statistics
//! back into the caller's buffers.
//!
//! # Key Features
//! - `BatchNormPrimitive` trait with scoped descriptors
//! - `HostPrimitive` reference library on host memory
//! - Running statistics in any float precision
//! - Opaque forward-to-backward state
//!
//! # Example
//! ```rust
//! use tensornorm_dnn::{resolve_mode, BatchNormMode};
//! use tensornorm_tensor::Axes;
//!
//! assert_eq!(resolve_mode(&Axes::from([0, 2, 3])).unwrap(), BatchNormMode::Spatial);
//! assert!(resolve_mode(&Axes::from([1])).is_err());
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
#![allow(clippy::similar_names)]
#![allow(clippy::many_single_char_names)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::float_cmp)]
#![allow(clippy::uninlined_format_args)]

// =============================================================================
// Modules
// =============================================================================

pub mod batch_norm;
pub mod config;
pub mod descriptor;
pub mod host;
pub mod mode;
pub mod primitive;
pub mod state;

// =============================================================================
// Re-exports
// =============================================================================

pub use batch_norm::{
    check_epsilon, update_running, BatchNorm, BatchNormBackwardArgs, BatchNormForwardArgs,
    FixedBatchNormArgs,
};
pub use config::BatchNormConfig;
pub use descriptor::{BnTensorDescriptor, TensorDescriptor};
pub use host::HostPrimitive;
pub use mode::{default_axes, resolve_mode, BatchNormMode};
pub use primitive::{
    BatchNormPrimitive, Coefficient, DataType, DescriptorHandle, PrimitiveError, PrimitiveResult,
    Status, TensorDescriptorInfo,
};
pub use state::{BatchNormState, OpState};

// =============================================================================
// Prelude
// =============================================================================

/// Convenient imports for common usage.
pub mod prelude {
    pub use crate::batch_norm::{
        BatchNorm, BatchNormBackwardArgs, BatchNormForwardArgs, FixedBatchNormArgs,
    };
    pub use crate::config::BatchNormConfig;
    pub use crate::host::HostPrimitive;
    pub use crate::mode::{default_axes, resolve_mode, BatchNormMode};
    pub use crate::primitive::BatchNormPrimitive;
    pub use crate::state::OpState;
}
