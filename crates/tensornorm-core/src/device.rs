//! Device Abstraction - Device Identity and Scoped Selection
//!
//! Provides the device tag every storage buffer carries and the scoped
//! device-context stack that brackets each accelerated call.
//!
//! # Key Features
//! - Unified device abstraction (CPU, CUDA ordinals)
//! - Device availability checking
//! - `DeviceScope` guard with strict push/pop discipline
//!
//! # Example
//! ```rust
//! use tensornorm_core::{current_device, Device, DeviceScope};
//!
//! assert_eq!(current_device(), Device::Cpu);
//! {
//!     let _scope = DeviceScope::enter(Device::Cuda(1)).unwrap();
//!     assert_eq!(current_device(), Device::Cuda(1));
//! }
//! assert_eq!(current_device(), Device::Cpu);
//! ```
//!
//! @version 0.1.0

use core::fmt;
use core::marker::PhantomData;
use std::cell::RefCell;

use crate::error::Result;

// =============================================================================
// Device Enum
// =============================================================================

/// Represents a compute device where tensors are allocated and operations executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Device {
    /// CPU device (always available).
    Cpu,

    /// NVIDIA CUDA GPU device with device index.
    Cuda(usize),
}

impl Device {
    /// Returns true if this device is available on the current system.
    #[must_use]
    pub fn is_available(self) -> bool {
        match self {
            Self::Cpu => true,
            Self::Cuda(idx) => crate::backends::cuda::is_device_available(idx),
        }
    }

    /// Returns true if this is a CPU device.
    #[must_use]
    pub const fn is_cpu(self) -> bool {
        matches!(self, Self::Cpu)
    }

    /// Returns true if this is a GPU device.
    #[must_use]
    pub const fn is_gpu(self) -> bool {
        !self.is_cpu()
    }

    /// Returns the device index for GPU devices, or 0 for CPU.
    #[must_use]
    pub const fn index(self) -> usize {
        match self {
            Self::Cpu => 0,
            Self::Cuda(idx) => idx,
        }
    }

    /// Returns the name of this device type.
    #[must_use]
    pub const fn device_type(self) -> &'static str {
        match self {
            Self::Cpu => "cpu",
            Self::Cuda(_) => "cuda",
        }
    }

    /// Returns a CUDA device with the given index.
    #[must_use]
    pub const fn cuda(index: usize) -> Self {
        Self::Cuda(index)
    }
}

impl Default for Device {
    fn default() -> Self {
        Self::Cpu
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cpu => write!(f, "cpu"),
            Self::Cuda(idx) => write!(f, "cuda:{idx}"),
        }
    }
}

// =============================================================================
// Device Context Stack
// =============================================================================

thread_local! {
    static DEVICE_STACK: RefCell<Vec<Device>> = const { RefCell::new(Vec::new()) };
}

/// Returns the device selected by the innermost live `DeviceScope` on this
/// thread, or `Device::Cpu` when no scope is active.
#[must_use]
pub fn current_device() -> Device {
    DEVICE_STACK.with(|stack| stack.borrow().last().copied().unwrap_or_default())
}

/// Returns how many `DeviceScope`s are live on this thread.
#[must_use]
pub fn scope_depth() -> usize {
    DEVICE_STACK.with(|stack| stack.borrow().len())
}

/// Guard that makes a device current for its lifetime.
///
/// Entering pushes onto a thread-local stack and dropping pops it, so the
/// previous device is restored on every exit path, including `?` returns
/// and unwinding. The guard is neither `Clone` nor `Send`: it must be
/// released on the thread and in the block that created it.
#[derive(Debug)]
pub struct DeviceScope {
    device: Device,
    previous: Device,
    _not_send: PhantomData<*const ()>,
}

impl DeviceScope {
    /// Makes `device` current until the returned guard is dropped.
    pub fn enter(device: Device) -> Result<Self> {
        let previous = current_device();
        if let Device::Cuda(index) = device {
            crate::backends::cuda::bind_device(index)?;
        }
        DEVICE_STACK.with(|stack| stack.borrow_mut().push(device));
        tracing::trace!(%device, %previous, "entered device scope");
        Ok(Self {
            device,
            previous,
            _not_send: PhantomData,
        })
    }

    /// Returns the device this scope selected.
    #[must_use]
    pub fn device(&self) -> Device {
        self.device
    }

    /// Returns the device that was current before this scope.
    #[must_use]
    pub fn previous(&self) -> Device {
        self.previous
    }
}

impl Drop for DeviceScope {
    fn drop(&mut self) {
        DEVICE_STACK.with(|stack| {
            let popped = stack.borrow_mut().pop();
            debug_assert_eq!(popped, Some(self.device), "device scopes released out of order");
        });
        if let Device::Cuda(index) = self.previous {
            if let Err(e) = crate::backends::cuda::bind_device(index) {
                tracing::warn!(error = %e, index, "failed to restore CUDA device");
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
