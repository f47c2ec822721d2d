//! Data Types - tensornorm Type System
//!
//! Defines the element types a tensor can hold and the traits used to move
//! values between typed host slices and dtype-erased byte storage.
//!
//! # Key Features
//! - Runtime dtype information via `DType`
//! - Coarse classification via `DTypeKind`
//! - Half-precision (f16) support through the `half` crate
//! - Lossy conversion through `f64` for casting between dtypes
//!
//! @version 0.1.0

use bytemuck::Pod;
use half::f16;
use num_traits::{NumCast, ToPrimitive};

use core::fmt::Debug;

// =============================================================================
// DType Enum
// =============================================================================

/// Runtime representation of tensor data types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    /// 16-bit floating point (half precision).
    F16,
    /// 32-bit floating point (single precision).
    F32,
    /// 64-bit floating point (double precision).
    F64,
    /// 8-bit signed integer.
    I8,
    /// 32-bit signed integer.
    I32,
    /// 64-bit signed integer.
    I64,
    /// 8-bit unsigned integer.
    U8,
}

/// Coarse classification of a dtype.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DTypeKind {
    /// Floating point.
    Float,
    /// Signed integer.
    Int,
    /// Unsigned integer.
    UInt,
}

impl DType {
    /// Returns the size in bytes of this data type.
    #[must_use]
    pub const fn size_of(self) -> usize {
        match self {
            Self::I8 | Self::U8 => 1,
            Self::F16 => 2,
            Self::F32 | Self::I32 => 4,
            Self::F64 | Self::I64 => 8,
        }
    }

    /// Returns the kind of this data type.
    #[must_use]
    pub const fn kind(self) -> DTypeKind {
        match self {
            Self::F16 | Self::F32 | Self::F64 => DTypeKind::Float,
            Self::I8 | Self::I32 | Self::I64 => DTypeKind::Int,
            Self::U8 => DTypeKind::UInt,
        }
    }

    /// Returns true if this is a floating point type.
    #[must_use]
    pub const fn is_float(self) -> bool {
        matches!(self.kind(), DTypeKind::Float)
    }

    /// Returns the name of this data type as a string.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::F16 => "f16",
            Self::F32 => "f32",
            Self::F64 => "f64",
            Self::I8 => "i8",
            Self::I32 => "i32",
            Self::I64 => "i64",
            Self::U8 => "u8",
        }
    }

    /// Reads the element at `index` from a slice of raw bytes.
    ///
    /// `bytes` must hold at least `(index + 1) * self.size_of()` bytes.
    #[must_use]
    pub fn read_f64(self, bytes: &[u8], index: usize) -> f64 {
        let start = index * self.size_of();
        let raw = &bytes[start..start + self.size_of()];
        match self {
            Self::F16 => bytemuck::pod_read_unaligned::<f16>(raw).to_f64(),
            Self::F32 => <f64 as From<f32>>::from(bytemuck::pod_read_unaligned::<f32>(raw)),
            Self::F64 => bytemuck::pod_read_unaligned::<f64>(raw),
            Self::I8 => <f64 as From<i8>>::from(bytemuck::pod_read_unaligned::<i8>(raw)),
            Self::I32 => <f64 as From<i32>>::from(bytemuck::pod_read_unaligned::<i32>(raw)),
            Self::I64 => bytemuck::pod_read_unaligned::<i64>(raw) as f64,
            Self::U8 => <f64 as From<u8>>::from(raw[0]),
        }
    }

    /// Writes `value` as this dtype into the element slot at `index`.
    pub fn write_f64(self, bytes: &mut [u8], index: usize, value: f64) {
        let start = index * self.size_of();
        let dst = &mut bytes[start..start + self.size_of()];
        match self {
            Self::F16 => dst.copy_from_slice(bytemuck::bytes_of(&f16::from_f64(value))),
            Self::F32 => dst.copy_from_slice(bytemuck::bytes_of(&(value as f32))),
            Self::F64 => dst.copy_from_slice(bytemuck::bytes_of(&value)),
            Self::I8 => dst.copy_from_slice(bytemuck::bytes_of(&(value as i8))),
            Self::I32 => dst.copy_from_slice(bytemuck::bytes_of(&(value as i32))),
            Self::I64 => dst.copy_from_slice(bytemuck::bytes_of(&(value as i64))),
            Self::U8 => dst[0] = value as u8,
        }
    }
}

impl Default for DType {
    fn default() -> Self {
        Self::F32
    }
}

impl core::fmt::Display for DType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.name())
    }
}

// =============================================================================
// Scalar Trait
// =============================================================================

/// Trait for all scalar types that can be stored in a tensor.
pub trait Scalar: Copy + Debug + Default + Send + Sync + Pod + NumCast + ToPrimitive + 'static {
    /// The runtime dtype for this scalar type.
    const DTYPE: DType;

    /// Returns the dtype for this type.
    #[must_use]
    fn dtype() -> DType {
        Self::DTYPE
    }

    /// Widens this value to `f64`.
    fn as_f64(self) -> f64 {
        self.to_f64().unwrap_or(f64::NAN)
    }

    /// Narrows an `f64` into this type, saturating where `NumCast` refuses.
    fn from_f64(value: f64) -> Self {
        <Self as NumCast>::from(value).unwrap_or_default()
    }
}

macro_rules! impl_scalar {
    ($ty:ty, $dtype:expr) => {
        impl Scalar for $ty {
            const DTYPE: DType = $dtype;
        }
    };
}

impl_scalar!(f16, DType::F16);
impl_scalar!(f32, DType::F32);
impl_scalar!(f64, DType::F64);
impl_scalar!(i8, DType::I8);
impl_scalar!(i32, DType::I32);
impl_scalar!(i64, DType::I64);
impl_scalar!(u8, DType::U8);

// =============================================================================
// Tests
// =============================================================================
