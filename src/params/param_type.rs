//! Parameter type definitions.

use serde::{Deserialize, Serialize};

/// Decoded type of a device parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ParamType {
    /// 32-bit little-endian float
    Float32,
    /// 8-bit unsigned integer
    Uint8,
    /// 16-bit unsigned integer
    Uint16,
    /// 32-bit unsigned integer
    Uint32,
    /// 64-bit unsigned integer
    Uint64,
    /// 32-bit signed integer
    Int32,
    /// 32-bit signed integer with the sign flipped on decode
    Int32Inverted,
    /// Float32 magnitude followed by a signed direction byte
    Velocity,
    /// Raw bytes, passed through untouched
    Bytes,
    /// Concatenation of other parameters' encodings
    Combo,
}

impl ParamType {
    /// Encoded size in bytes, or `None` for types without a fixed size
    /// ([`Bytes`](ParamType::Bytes) is caller-defined, [`Combo`](ParamType::Combo)
    /// is the sum of its constituents).
    pub const fn fixed_size(&self) -> Option<usize> {
        match self {
            ParamType::Float32 => Some(4),
            ParamType::Uint8 => Some(1),
            ParamType::Uint16 => Some(2),
            ParamType::Uint32 => Some(4),
            ParamType::Uint64 => Some(8),
            ParamType::Int32 | ParamType::Int32Inverted => Some(4),
            ParamType::Velocity => Some(5),
            ParamType::Bytes | ParamType::Combo => None,
        }
    }
}
