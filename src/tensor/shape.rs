//! Shape descriptors for native arrays

use crate::error::{NdResult, NdScopeError};
use std::fmt;

/// Dimensions of an array.
///
/// A rank-0 shape (no dimensions) describes a scalar with one element.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Shape {
    dims: Vec<usize>,
}

impl Shape {
    /// Create a shape from owned dimensions
    pub fn new(dims: Vec<usize>) -> Self {
        Shape { dims }
    }

    /// Create a shape from a dimension slice
    pub fn of(dims: &[usize]) -> Self {
        Shape {
            dims: dims.to_vec(),
        }
    }

    /// Scalar shape (rank 0, one element)
    pub fn scalar() -> Self {
        Shape { dims: Vec::new() }
    }

    /// Number of dimensions
    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    /// Dimension sizes
    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    /// Total number of elements.
    ///
    /// Fails with `InvalidArgument` if the product overflows `usize`,
    /// so callers can reject the allocation before any native call.
    pub fn element_count(&self) -> NdResult<usize> {
        self.dims
            .iter()
            .try_fold(1usize, |acc, &d| acc.checked_mul(d))
            .ok_or_else(|| {
                NdScopeError::InvalidArgument(format!(
                    "shape {} element count overflows usize",
                    self
                ))
            })
    }

    /// Total size in bytes for the given element type
    pub fn size_in_bytes(&self, element_size: usize) -> NdResult<usize> {
        self.element_count()?
            .checked_mul(element_size)
            .ok_or_else(|| {
                NdScopeError::InvalidArgument(format!(
                    "shape {} byte size overflows usize",
                    self
                ))
            })
    }
}

impl From<Vec<usize>> for Shape {
    fn from(dims: Vec<usize>) -> Self {
        Shape::new(dims)
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, d) in self.dims.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", d)?;
        }
        write!(f, ")")
    }
}
