//! CUDA Backend - NVIDIA Driver Hooks
//!
//! Device discovery and context binding for NVIDIA GPUs. With the `cuda`
//! feature these go through the driver API via cudarc; without it every
//! query reports no devices and binding is a no-op, so host-resident
//! tensors tagged with a CUDA ordinal still flow through the scoped
//! device-selection logic.
//!
//! # Requirements
//! - NVIDIA GPU with compute capability 3.5+
//! - CUDA Toolkit 11.0+
//!
//! @version 0.1.0

#[cfg(feature = "cuda")]
use cudarc::driver::CudaDevice;

use crate::error::Result;
#[cfg(feature = "cuda")]
use crate::{device::Device, error::Error};

// =============================================================================
// CUDA Runtime Functions
// =============================================================================

/// Returns whether CUDA is available on this system.
pub fn is_available() -> bool {
    device_count() > 0
}

/// Returns the number of available CUDA devices.
pub fn device_count() -> usize {
    #[cfg(feature = "cuda")]
    {
        cudarc::driver::result::init()
            .and_then(|()| cudarc::driver::result::device::get_count())
            .map_or(0, |count| count as usize)
    }
    #[cfg(not(feature = "cuda"))]
    {
        0
    }
}

/// Returns whether a specific CUDA device is available.
pub fn is_device_available(index: usize) -> bool {
    index < device_count()
}

/// Makes the primary context of device `index` current on this thread.
#[cfg(feature = "cuda")]
pub fn bind_device(index: usize) -> Result<()> {
    let device = CudaDevice::new(index).map_err(|e| {
        tracing::warn!(index, error = %e, "CUDA device unavailable");
        Error::DeviceNotAvailable {
            device: Device::Cuda(index),
        }
    })?;
    device.bind_to_thread().map_err(|e| Error::Primitive {
        status: "CUDA_ERROR_INVALID_CONTEXT".to_string(),
        code: 201,
        message: e.to_string(),
    })
}

/// Makes the primary context of device `index` current on this thread.
#[cfg(not(feature = "cuda"))]
pub fn bind_device(index: usize) -> Result<()> {
    let _ = index;
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================
