//! Element datatype tags
//!
//! The core consumes the datatype only to size allocations and label
//! arrays; element semantics belong to the backend.

use std::fmt;

/// Element datatype of an array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
    /// 32-bit IEEE float
    F32,
    /// 64-bit IEEE float
    F64,
    /// 16-bit IEEE float
    F16,
    /// Unsigned 8-bit integer
    U8,
    /// Signed 32-bit integer
    I32,
    /// Signed 64-bit integer
    I64,
}

impl DataType {
    /// Size of one element in bytes
    pub fn size_in_bytes(&self) -> usize {
        match self {
            DataType::F32 => 4,
            DataType::F64 => 8,
            DataType::F16 => 2,
            DataType::U8 => 1,
            DataType::I32 => 4,
            DataType::I64 => 8,
        }
    }

    /// Stable wire tag used by backends that persist arrays
    pub fn tag(&self) -> u8 {
        match self {
            DataType::F32 => 0,
            DataType::F64 => 1,
            DataType::F16 => 2,
            DataType::U8 => 3,
            DataType::I32 => 4,
            DataType::I64 => 5,
        }
    }

    /// Inverse of [`DataType::tag`]
    pub fn from_tag(tag: u8) -> Option<DataType> {
        match tag {
            0 => Some(DataType::F32),
            1 => Some(DataType::F64),
            2 => Some(DataType::F16),
            3 => Some(DataType::U8),
            4 => Some(DataType::I32),
            5 => Some(DataType::I64),
            _ => None,
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DataType::F32 => "f32",
            DataType::F64 => "f64",
            DataType::F16 => "f16",
            DataType::U8 => "u8",
            DataType::I32 => "i32",
            DataType::I64 => "i64",
        };
        write!(f, "{}", name)
    }
}
