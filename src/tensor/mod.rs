//! Datatype, shape and sparse-format descriptors
//!
//! These are consumed, not interpreted, by the scope tree: they travel with
//! a handle so the backend can size and label allocations.

pub mod dtype;
pub mod shape;

pub use dtype::DataType;
pub use shape::Shape;

use std::fmt;

/// Physical storage format of an array.
///
/// The core only labels arrays with their format; the physical layout is
/// entirely the backend's business.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SparseFormat {
    /// Dense row-major storage
    #[default]
    Dense,
    /// Compressed sparse row
    Csr,
    /// Row-sparse (only a subset of rows materialized)
    RowSparse,
}

impl SparseFormat {
    /// Stable wire tag used by backends that persist arrays
    pub fn tag(&self) -> u8 {
        match self {
            SparseFormat::Dense => 0,
            SparseFormat::Csr => 1,
            SparseFormat::RowSparse => 2,
        }
    }

    /// Inverse of [`SparseFormat::tag`]
    pub fn from_tag(tag: u8) -> Option<SparseFormat> {
        match tag {
            0 => Some(SparseFormat::Dense),
            1 => Some(SparseFormat::Csr),
            2 => Some(SparseFormat::RowSparse),
            _ => None,
        }
    }
}

impl fmt::Display for SparseFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SparseFormat::Dense => "dense",
            SparseFormat::Csr => "csr",
            SparseFormat::RowSparse => "row_sparse",
        };
        write!(f, "{}", name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sparse_format_tag_roundtrip() {
        for fmt in [SparseFormat::Dense, SparseFormat::Csr, SparseFormat::RowSparse] {
            assert_eq!(SparseFormat::from_tag(fmt.tag()), Some(fmt));
        }
        assert_eq!(SparseFormat::from_tag(9), None);
    }
}
