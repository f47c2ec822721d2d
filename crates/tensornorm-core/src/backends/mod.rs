//! Backends - Device-Specific Runtime Hooks
//!
//! Device runtimes the core talks to directly. Kernel work is not done
//! here: accelerated operators go through primitive libraries, and this
//! module only answers "is the device there" and "make it current".
//!
//! # Available Backends
//! - `cuda` - NVIDIA CUDA driver (real bindings with the `cuda` feature)
//!
//! @version 0.1.0

// =============================================================================
// Backend Modules
// =============================================================================

pub mod cuda;

// =============================================================================
// Device Selection Utilities
// =============================================================================

/// Returns the number of available GPUs across all backends.
#[must_use]
pub fn gpu_count() -> usize {
    cuda::device_count()
}
