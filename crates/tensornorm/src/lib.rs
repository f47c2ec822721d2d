//! # tensornorm - Accelerated Batch Normalization in Rust
//!
//! tensornorm runs batch normalization through neural-network primitive
//! libraries. It accepts tensors of any layout and float precision and
//! takes care of what the primitive needs around the call.
//!
//! ## Core Features
//!
//! - **Tensors**: dtype-erased strided views with contiguous and precision-converting copies
//! - **Modes**: reduction axes mapped onto per-activation or spatial normalization
//! - **Training**: forward with running-statistics update in any float precision
//! - **Backward**: gradients from the statistics saved by forward, never recomputed
//! - **Inference**: normalization with fixed statistics
//! - **Primitives**: pluggable `BatchNormPrimitive` libraries, host reference library included
//!
//! # Quick Start
//!
//! ```rust
//! use tensornorm::prelude::*;
//!
//! let ctx = BatchNorm::host();
//! let x = Tensor::from_vec((0..24).map(|i| i as f32 * 0.1).collect::<Vec<_>>(), &[2, 3, 2, 2]).unwrap();
//! let gamma = ones(&[1, 3, 1, 1], DType::F32, Device::Cpu);
//! let beta = zeros(&[1, 3, 1, 1], DType::F32, Device::Cpu);
//! let running_mean = zeros(&[3], DType::F32, Device::Cpu);
//! let running_var = ones(&[3], DType::F32, Device::Cpu);
//!
//! let (y, state) = batch_norm(&ctx, &x, &gamma, &beta, &running_mean, &running_var, None, None, None).unwrap();
//! let gout = ones(y.shape(), DType::F32, Device::Cpu);
//! let (gx, ggamma, gbeta) = batch_norm_grad(&ctx, &gamma, &gout, None, None, &state).unwrap();
//! assert_eq!(gx.shape(), x.shape());
//! ```
//!
//! # Feature Flags
//!
//! - `cuda`: CUDA device discovery and context binding for device scopes
//!
//! @version 0.1.0

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
// ML/tensor-specific allowances
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::uninlined_format_args)]

// =============================================================================
// Re-exports
// =============================================================================

pub use tensornorm_core as core;
pub use tensornorm_dnn as dnn;
pub use tensornorm_tensor as tensor;

// =============================================================================
// Functional API
// =============================================================================

pub mod functional;
pub use functional::{batch_norm, batch_norm_grad, fixed_batch_norm};

// =============================================================================
// Prelude
// =============================================================================

/// Common imports for batch normalization.
///
/// ```rust
/// use tensornorm::prelude::*;
/// ```
pub mod prelude {
    pub use tensornorm_core::{DType, Device, DeviceScope, Error, Result};

    pub use tensornorm_tensor::{empty, empty_like, full, ones, zeros, Axes, Tensor};

    pub use tensornorm_dnn::{
        default_axes, resolve_mode, BatchNorm, BatchNormBackwardArgs, BatchNormConfig,
        BatchNormForwardArgs, BatchNormMode, BatchNormPrimitive, BatchNormState,
        FixedBatchNormArgs, HostPrimitive, OpState,
    };

    pub use crate::functional::{batch_norm, batch_norm_grad, fixed_batch_norm};
}
