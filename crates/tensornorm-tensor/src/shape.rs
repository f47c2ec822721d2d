//! Shape and Strides - Tensor Dimension Management
//!
//! Provides types and functions for managing tensor shapes, strides and
//! reduction axes. Shapes define the dimensions of a tensor, strides define
//! how to traverse the underlying storage.
//!
//! # Key Features
//! - Efficient shape representation with small-vector optimization
//! - Stride computation and contiguity checks
//! - Reduction-axis sets and reduced shapes with kept dimensions
//!
//! @version 0.1.0

use core::fmt;
use core::ops::Deref;

use smallvec::SmallVec;

use tensornorm_core::error::{Error, Result};

// =============================================================================
// Type Aliases
// =============================================================================

/// Shape type - dimensions of a tensor.
/// Uses `SmallVec` for stack allocation of small shapes (up to 6 dimensions).
pub type Shape = SmallVec<[usize; 6]>;

/// Strides type - step sizes, in elements, for each dimension.
pub type Strides = SmallVec<[isize; 6]>;

// =============================================================================
// Axes
// =============================================================================

/// An ordered set of dimension indices, e.g. the axes a reduction runs over.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Axes(SmallVec<[usize; 6]>);

impl Axes {
    /// Creates an axis set from dimension indices, in the given order.
    #[must_use]
    pub fn new(axes: &[usize]) -> Self {
        Self(SmallVec::from_slice(axes))
    }

    /// Returns the number of axes in the set.
    #[must_use]
    pub fn ndim(&self) -> usize {
        self.0.len()
    }

    /// Returns true if `axis` is a member of the set.
    #[must_use]
    pub fn contains(&self, axis: usize) -> bool {
        self.0.contains(&axis)
    }
}

impl Deref for Axes {
    type Target = [usize];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<&[usize]> for Axes {
    fn from(axes: &[usize]) -> Self {
        Self::new(axes)
    }
}

impl<const N: usize> From<[usize; N]> for Axes {
    fn from(axes: [usize; N]) -> Self {
        Self::new(&axes)
    }
}

impl fmt::Display for Axes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, axis) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{axis}")?;
        }
        write!(f, ")")
    }
}

// =============================================================================
// Shape Utilities
// =============================================================================

/// Computes the total number of elements from a shape.
#[must_use]
pub fn numel(shape: &[usize]) -> usize {
    shape.iter().product()
}

/// Computes row-major (C-order) strides for a shape.
#[must_use]
pub fn contiguous_strides(shape: &[usize]) -> Strides {
    if shape.is_empty() {
        return Strides::new();
    }

    let mut strides = Strides::with_capacity(shape.len());
    let mut stride = 1isize;

    // Compute strides from right to left
    for &dim in shape.iter().rev() {
        strides.push(stride);
        stride *= dim as isize;
    }

    strides.reverse();
    strides
}

/// Checks if strides represent a contiguous row-major layout.
///
/// Strides of dimensions with extent 1 are ignored, since no element is
/// ever addressed through them.
#[must_use]
pub fn is_contiguous(shape: &[usize], strides: &[isize]) -> bool {
    if numel(shape) <= 1 {
        return true;
    }

    let expected = contiguous_strides(shape);
    shape
        .iter()
        .zip(strides.iter().zip(expected.iter()))
        .all(|(&dim, (&actual, &wanted))| dim == 1 || actual == wanted)
}

/// Computes the element offset from multi-dimensional indices.
#[must_use]
pub fn linear_index(indices: &[usize], strides: &[isize]) -> usize {
    debug_assert_eq!(indices.len(), strides.len());

    let mut offset = 0isize;
    for (&idx, &stride) in indices.iter().zip(strides.iter()) {
        offset += idx as isize * stride;
    }
    offset as usize
}

/// Converts a linear index to multi-dimensional indices.
#[must_use]
pub fn unravel_index(mut linear: usize, shape: &[usize]) -> Vec<usize> {
    let mut indices = vec![0; shape.len()];

    for (i, &dim) in shape.iter().enumerate().rev() {
        indices[i] = linear % dim;
        linear /= dim;
    }

    indices
}

/// Computes the shape left after reducing over `axes`.
///
/// With `keepdims` the reduced dimensions stay in place with extent 1,
/// otherwise they are removed.
pub fn reduce_shape(shape: &[usize], axes: &[usize], keepdims: bool) -> Result<Shape> {
    for &axis in axes {
        if axis >= shape.len() {
            return Err(Error::InvalidDimension {
                index: axis as i64,
                ndim: shape.len(),
            });
        }
    }

    let mut result = Shape::with_capacity(shape.len());
    for (i, &dim) in shape.iter().enumerate() {
        if axes.contains(&i) {
            if keepdims {
                result.push(1);
            }
        } else {
            result.push(dim);
        }
    }
    Ok(result)
}

/// Swaps two stride values.
#[must_use]
pub fn transpose_strides(strides: &[isize], dim0: usize, dim1: usize) -> Strides {
    let mut result = Strides::from_slice(strides);
    result.swap(dim0, dim1);
    result
}

// =============================================================================
// Validation
// =============================================================================

/// Normalizes a dimension index, supporting negative indexing.
pub fn normalize_dim(dim: i64, ndim: usize) -> Result<usize> {
    let ndim_i64 = ndim as i64;

    let normalized = if dim < 0 { dim + ndim_i64 } else { dim };

    if normalized < 0 || normalized >= ndim_i64 {
        return Err(Error::InvalidDimension { index: dim, ndim });
    }

    Ok(normalized as usize)
}

// =============================================================================
// Tests
// =============================================================================
