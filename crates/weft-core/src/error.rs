//! Error types for buffer operations.

use crate::DataType;
use thiserror::Error;

/// Result type alias for buffer operations.
pub type Result<T> = core::result::Result<T, Error>;

/// Buffer error types.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Error {
    /// Element type differs from the one required.
    #[error("dtype mismatch: expected {expected}, got {actual}")]
    DtypeMismatch { expected: DataType, actual: DataType },

    /// Shapes disagree where they must match.
    #[error("shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    /// Element count disagrees with the declared shape.
    #[error("length mismatch: shape requires {expected} elements, got {actual}")]
    LengthMismatch { expected: usize, actual: usize },

    /// Strides do not describe a valid layout for the shape.
    #[error("invalid strides {strides:?} for shape {shape:?}")]
    InvalidStrides {
        shape: Vec<usize>,
        strides: Vec<usize>,
    },

    /// Operation requires a contiguous buffer.
    #[error("tensor is required to be contiguous")]
    NonContiguous,

    /// Operation requires at least one dimension.
    #[error("operation requires a tensor with at least one dimension")]
    ZeroDimensional,
}

impl Error {
    /// Create a dtype mismatch error.
    pub fn dtype_mismatch(expected: DataType, actual: DataType) -> Self {
        Error::DtypeMismatch { expected, actual }
    }

    /// Create a shape mismatch error.
    pub fn shape_mismatch(expected: &[usize], actual: &[usize]) -> Self {
        Error::ShapeMismatch {
            expected: expected.to_vec(),
            actual: actual.to_vec(),
        }
    }

    /// Get error category for logging.
    pub fn category(&self) -> &'static str {
        match self {
            Error::DtypeMismatch { .. } => "dtype_mismatch",
            Error::ShapeMismatch { .. } => "shape_mismatch",
            Error::LengthMismatch { .. } => "length_mismatch",
            Error::InvalidStrides { .. } => "invalid_strides",
            Error::NonContiguous => "non_contiguous",
            Error::ZeroDimensional => "zero_dimensional",
        }
    }
}
