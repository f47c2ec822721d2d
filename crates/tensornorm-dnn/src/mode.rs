//! Normalization Mode - Reduction Axes to Primitive Mode
//!
//! The primitive library normalizes either every activation separately or
//! every channel across its spatial extent. This module maps a caller's
//! reduction-axis set onto one of those two modes.
//!
//! @version 0.1.0

use core::fmt;

use serde::{Deserialize, Serialize};

use tensornorm_core::error::{Error, Result};
use tensornorm_tensor::Axes;

// =============================================================================
// BatchNormMode
// =============================================================================

/// How statistics are gathered by the primitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BatchNormMode {
    /// One mean/variance per activation, reduced over the batch axis only.
    PerActivation,
    /// One mean/variance per channel, reduced over batch and spatial axes.
    Spatial,
}

impl BatchNormMode {
    /// Returns the mode's name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::PerActivation => "per_activation",
            Self::Spatial => "spatial",
        }
    }
}

impl fmt::Display for BatchNormMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// =============================================================================
// Resolution
// =============================================================================

/// Maps a reduction-axis set onto a normalization mode.
///
/// `(0)` selects [`BatchNormMode::PerActivation`]; `(0, 2, 3)` and
/// `(0, 2, 3, 4)` select [`BatchNormMode::Spatial`]. Every other set is
/// rejected with [`Error::Dimension`].
pub fn resolve_mode(axis: &Axes) -> Result<BatchNormMode> {
    match &axis[..] {
        [0] => Ok(BatchNormMode::PerActivation),
        [0, 2, 3] | [0, 2, 3, 4] => Ok(BatchNormMode::Spatial),
        _ => Err(Error::dimension(format!(
            "Invalid axis for BatchNorm using the accelerated primitive {axis}. Expected 1, 3 or 4 dimensions."
        ))),
    }
}

/// Returns the conventional batch-norm axes for an `ndim`-dimensional
/// input: every axis except the channel axis 1.
#[must_use]
pub fn default_axes(ndim: usize) -> Axes {
    let axes: Vec<usize> = (0..ndim).filter(|&i| i != 1).collect();
    Axes::new(&axes)
}

// =============================================================================
// Tests
// =============================================================================
