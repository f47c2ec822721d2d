//! Storage - Raw Memory Management for Tensors
//!
//! Provides the dtype-erased byte buffer that underlies every tensor.
//! Storage is reference-counted so views, contiguous copies that turn out to
//! be no-ops, and output tensors handed to an operation all share memory.
//!
//! # Key Features
//! - Reference-counted memory for efficient views
//! - Raw pointer access for primitive libraries
//! - Same-size raw memory copy between buffers on one device
//!
//! # Example
//! ```rust
//! use tensornorm_core::{Device, Storage};
//!
//! let storage = Storage::zeros(16, Device::Cpu);
//! assert_eq!(storage.len(), 16);
//! ```
//!
//! @version 0.1.0

use core::ops::{Deref, DerefMut};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::device::Device;
use crate::error::{Error, Result};

// =============================================================================
// Storage Struct
// =============================================================================

/// Raw byte storage for tensor data.
///
/// Storage manages one contiguous block of bytes tagged with the device it
/// belongs to. Element interpretation (dtype, shape, strides) lives in the
/// tensor that views it.
#[derive(Debug)]
pub struct Storage {
    /// The underlying data buffer.
    inner: Arc<RwLock<StorageInner>>,
}

/// Inner storage data that can be shared between views.
#[derive(Debug)]
struct StorageInner {
    /// Owned bytes. Never resized after construction.
    data: Vec<u8>,
    /// The device this storage resides on.
    device: Device,
}

impl Storage {
    /// Creates `len` zeroed bytes on `device`.
    #[must_use]
    pub fn zeros(len: usize, device: Device) -> Self {
        Self::from_bytes(vec![0u8; len], device)
    }

    /// Creates storage that takes ownership of `data`.
    #[must_use]
    pub fn from_bytes(data: Vec<u8>, device: Device) -> Self {
        Self {
            inner: Arc::new(RwLock::new(StorageInner { data, device })),
        }
    }

    /// Returns the number of bytes in this storage.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.read().data.len()
    }

    /// Returns true if the storage holds no bytes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the device this storage is on.
    #[must_use]
    pub fn device(&self) -> Device {
        self.inner.read().device
    }

    /// Returns true if both handles refer to the same buffer.
    #[must_use]
    pub fn same_buffer(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Returns true if this storage is uniquely owned (not shared).
    #[must_use]
    pub fn is_unique(&self) -> bool {
        Arc::strong_count(&self.inner) == 1
    }

    /// Returns an immutable view of the bytes.
    #[must_use]
    pub fn as_bytes(&self) -> StorageReadGuard<'_> {
        StorageReadGuard {
            guard: self.inner.read(),
        }
    }

    /// Returns a mutable view of the bytes.
    #[must_use]
    pub fn as_bytes_mut(&self) -> StorageWriteGuard<'_> {
        StorageWriteGuard {
            guard: self.inner.write(),
        }
    }

    /// Returns the address of byte `offset`.
    ///
    /// The pointer stays valid for as long as any handle to this storage is
    /// alive. Callers that write through it must be the only writer for the
    /// duration of the access.
    pub fn raw_ptr(&self, offset: usize) -> Result<*mut u8> {
        let mut guard = self.inner.write();
        if offset > guard.data.len() {
            return Err(Error::IndexOutOfBounds {
                index: offset,
                size: guard.data.len(),
            });
        }
        // SAFETY: `offset` is within the allocation (one-past-the-end allowed).
        Ok(unsafe { guard.data.as_mut_ptr().add(offset) })
    }

    /// Copies `nbytes` bytes from `src[src_offset..]` into `self[dst_offset..]`.
    ///
    /// Both buffers must live on the same device. Copying a range onto
    /// itself is a no-op.
    pub fn copy_bytes_from(
        &self,
        dst_offset: usize,
        src: &Self,
        src_offset: usize,
        nbytes: usize,
    ) -> Result<()> {
        let (dst_device, src_device) = (self.device(), src.device());
        if dst_device != src_device {
            return Err(Error::DeviceMismatch {
                expected: dst_device,
                actual: src_device,
            });
        }

        if self.same_buffer(src) {
            let mut dst = self.as_bytes_mut();
            check_range(src_offset, nbytes, dst.len())?;
            check_range(dst_offset, nbytes, dst.len())?;
            dst.copy_within(src_offset..src_offset + nbytes, dst_offset);
            return Ok(());
        }

        let src_guard = src.as_bytes();
        let mut dst_guard = self.as_bytes_mut();
        check_range(src_offset, nbytes, src_guard.len())?;
        check_range(dst_offset, nbytes, dst_guard.len())?;
        dst_guard[dst_offset..dst_offset + nbytes]
            .copy_from_slice(&src_guard[src_offset..src_offset + nbytes]);
        Ok(())
    }

    /// Makes a deep copy of this storage.
    #[must_use]
    pub fn deep_copy(&self) -> Self {
        let guard = self.inner.read();
        Self::from_bytes(guard.data.clone(), guard.device)
    }
}

fn check_range(offset: usize, nbytes: usize, len: usize) -> Result<()> {
    if offset + nbytes > len {
        return Err(Error::IndexOutOfBounds {
            index: offset + nbytes,
            size: len,
        });
    }
    Ok(())
}

impl Clone for Storage {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

// =============================================================================
// Guard Types for Safe Access
// =============================================================================

/// Read guard for storage bytes.
pub struct StorageReadGuard<'a> {
    guard: parking_lot::RwLockReadGuard<'a, StorageInner>,
}

impl Deref for StorageReadGuard<'_> {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        &self.guard.data
    }
}

/// Write guard for storage bytes.
pub struct StorageWriteGuard<'a> {
    guard: parking_lot::RwLockWriteGuard<'a, StorageInner>,
}

impl Deref for StorageWriteGuard<'_> {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        &self.guard.data
    }
}

impl DerefMut for StorageWriteGuard<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.guard.data
    }
}

// =============================================================================
// Tests
// =============================================================================
