//! Runtime value type for decoded parameters.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A decoded parameter value.
///
/// Combo reads decode to [`Value::Combo`], keyed by constituent parameter
/// identifier in a deterministic order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Float32(f32),
    Uint8(u8),
    Uint16(u16),
    Uint32(u32),
    Uint64(u64),
    Int32(i32),
    /// Signed velocity in counts per second (magnitude × direction)
    Velocity(f32),
    Bytes(Vec<u8>),
    Combo(BTreeMap<u8, Value>),
}

impl Value {
    /// Float view of [`Float32`](Value::Float32) and [`Velocity`](Value::Velocity) values.
    pub fn as_f32(&self) -> Option<f32> {
        match self {
            Value::Float32(v) | Value::Velocity(v) => Some(*v),
            _ => None,
        }
    }

    /// Widened unsigned view of any unsigned integer value.
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::Uint8(v) => Some(u64::from(*v)),
            Value::Uint16(v) => Some(u64::from(*v)),
            Value::Uint32(v) => Some(u64::from(*v)),
            Value::Uint64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_u8(&self) -> Option<u8> {
        match self {
            Value::Uint8(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_u16(&self) -> Option<u16> {
        match self {
            Value::Uint16(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_i32(&self) -> Option<i32> {
        match self {
            Value::Int32(v) => Some(*v),
            _ => None,
        }
    }

    /// Boolean view of a [`Uint8`](Value::Uint8) flag (non-zero is true).
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Uint8(v) => Some(*v != 0),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_combo(&self) -> Option<&BTreeMap<u8, Value>> {
        match self {
            Value::Combo(v) => Some(v),
            _ => None,
        }
    }
}
