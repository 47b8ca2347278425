//! Node types, tagged values and the per-node wire codec
//!
//! Every value-bearing node declares one of these wire types in the tree
//! descriptor; all value traffic after the descriptor is just
//! `[op_code][payload]` with the payload layout fixed by the node's type.
//!
//! Wire layouts (after the 1-byte op-code):
//! - U8 / S8 / Chooser: 1 byte
//! - U16 / S16: 2 bytes little-endian
//! - U32 / S32: 4 bytes little-endian
//! - Float: 4 bytes little-endian IEEE-754 single, surfaced as f64
//! - Str / Bin: 2-byte little-endian length prefix + raw bytes

use crate::{Error, Result};
use bytes::BufMut;
use std::fmt;

/// Declared wire type of a tree node.
///
/// The ordinal is the byte used in the tree descriptor. Everything from
/// [`NodeType::Chooser`] up carries a value and is assigned an op-code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum NodeType {
    /// Structural node, no value
    Plain = 0,
    /// Reference to another subtree, no value
    Link = 1,
    /// Single byte selecting one of the node's children by index
    Chooser = 2,
    U8 = 3,
    U16 = 4,
    U32 = 5,
    S8 = 6,
    S16 = 7,
    S32 = 8,
    Str = 9,
    Bin = 10,
    Float = 11,
}

impl NodeType {
    /// Map a descriptor type byte to a node type.
    pub fn from_wire(byte: u8) -> Result<Self> {
        Ok(match byte {
            0 => NodeType::Plain,
            1 => NodeType::Link,
            2 => NodeType::Chooser,
            3 => NodeType::U8,
            4 => NodeType::U16,
            5 => NodeType::U32,
            6 => NodeType::S8,
            7 => NodeType::S16,
            8 => NodeType::S32,
            9 => NodeType::Str,
            10 => NodeType::Bin,
            11 => NodeType::Float,
            other => return Err(Error::UnknownNodeType(other)),
        })
    }

    /// Whether nodes of this type carry a value (and get an op-code).
    pub fn has_value(self) -> bool {
        self >= NodeType::Chooser
    }
}

/// A decoded node value, tagged by the same enum the node declares.
///
/// Values are immutable snapshots: each wire update builds a new `Value`
/// rather than mutating the one already handed to subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Also used for Chooser nodes (selected child index)
    U8(u8),
    U16(u16),
    U32(u32),
    S8(i8),
    S16(i16),
    S32(i32),
    Str(String),
    Bin(Vec<u8>),
    /// Stored as 4 wire bytes (single precision), widened to f64
    Float(f64),
}

impl Value {
    /// Variant name, for error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::U8(_) => "u8",
            Value::U16(_) => "u16",
            Value::U32(_) => "u32",
            Value::S8(_) => "s8",
            Value::S16(_) => "s16",
            Value::S32(_) => "s32",
            Value::Str(_) => "string",
            Value::Bin(_) => "binary",
            Value::Float(_) => "float",
        }
    }

    /// Widen any integer variant to i64.
    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            Value::U8(v) => Some(v as i64),
            Value::U16(v) => Some(v as i64),
            Value::U32(v) => Some(v as i64),
            Value::S8(v) => Some(v as i64),
            Value::S16(v) => Some(v as i64),
            Value::S32(v) => Some(v as i64),
            _ => None,
        }
    }

    /// Numeric value as f64 (integers widen, Float passes through).
    pub fn as_f64(&self) -> Option<f64> {
        match *self {
            Value::Float(v) => Some(v),
            _ => self.as_i64().map(|v| v as f64),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bin(b) => Some(b),
            _ => None,
        }
    }
}

// Debug-only rendering; the wire format never depends on this.
impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::U8(v) => write!(f, "{v}"),
            Value::U16(v) => write!(f, "{v}"),
            Value::U32(v) => write!(f, "{v}"),
            Value::S8(v) => write!(f, "{v}"),
            Value::S16(v) => write!(f, "{v}"),
            Value::S32(v) => write!(f, "{v}"),
            Value::Str(s) => write!(f, "{s}"),
            Value::Bin(b) => write!(f, "<{} bytes>", b.len()),
            Value::Float(v) => write!(f, "{v}"),
        }
    }
}

/// Outcome of a decode attempt against the receive buffer.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    /// Value decoded; `consumed` counts the op-code byte and the payload.
    Complete { value: Value, consumed: usize },
    /// Declared payload not fully buffered yet; nothing was consumed.
    /// Normal outcome, retried after the next fragment arrives.
    Partial,
}

/// Decode one value of the given type from `buf`.
///
/// `buf[0]` is the op-code (already resolved to a node by the caller); the
/// payload starts at `buf[1]`. Str/Bin report [`Decoded::Partial`] until the
/// 2-byte length prefix and the full declared payload are buffered. Fixed
/// widths likewise wait when a fragment boundary split them.
pub fn decode_value(ty: NodeType, buf: &[u8]) -> Result<Decoded> {
    debug_assert!(!buf.is_empty(), "dispatcher guarantees the op-code byte");
    match ty {
        NodeType::Plain | NodeType::Link => Err(Error::ValuelessType(ty)),

        NodeType::Chooser | NodeType::U8 => fixed(buf, 1, |p| Value::U8(p[0])),
        NodeType::S8 => fixed(buf, 1, |p| Value::S8(p[0] as i8)),
        NodeType::U16 => fixed(buf, 2, |p| Value::U16(u16::from_le_bytes([p[0], p[1]]))),
        NodeType::S16 => fixed(buf, 2, |p| Value::S16(i16::from_le_bytes([p[0], p[1]]))),
        NodeType::U32 => fixed(buf, 4, |p| {
            Value::U32(u32::from_le_bytes([p[0], p[1], p[2], p[3]]))
        }),
        NodeType::S32 => fixed(buf, 4, |p| {
            Value::S32(i32::from_le_bytes([p[0], p[1], p[2], p[3]]))
        }),
        NodeType::Float => fixed(buf, 4, |p| {
            // explicit single -> double promotion, no other rounding
            Value::Float(f32::from_le_bytes([p[0], p[1], p[2], p[3]]) as f64)
        }),

        NodeType::Str | NodeType::Bin => {
            if buf.len() < 3 {
                return Ok(Decoded::Partial);
            }
            let len = u16::from_le_bytes([buf[1], buf[2]]) as usize;
            // length is checked against the bytes after the prefix, not the
            // whole buffer
            if buf.len() < 3 + len {
                return Ok(Decoded::Partial);
            }
            let payload = &buf[3..3 + len];
            let value = if ty == NodeType::Str {
                let s = std::str::from_utf8(payload)
                    .map_err(|e| Error::InvalidString(e.to_string()))?;
                Value::Str(s.to_string())
            } else {
                Value::Bin(payload.to_vec())
            };
            Ok(Decoded::Complete {
                value,
                consumed: 3 + len,
            })
        }
    }
}

fn fixed(buf: &[u8], width: usize, build: impl FnOnce(&[u8]) -> Value) -> Result<Decoded> {
    if buf.len() < 1 + width {
        return Ok(Decoded::Partial);
    }
    Ok(Decoded::Complete {
        value: build(&buf[1..1 + width]),
        consumed: 1 + width,
    })
}

/// Encode a value as its wire payload (op-code excluded).
///
/// Str/Bin emit their literal bytes with no length prefix; the framing layer
/// owns any headers. Widths and endianness mirror [`decode_value`].
pub fn encode_value(ty: NodeType, value: &Value) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(4);
    match (ty, value) {
        (NodeType::Chooser | NodeType::U8, Value::U8(v)) => out.put_u8(*v),
        (NodeType::S8, Value::S8(v)) => out.put_i8(*v),
        (NodeType::U16, Value::U16(v)) => out.put_u16_le(*v),
        (NodeType::S16, Value::S16(v)) => out.put_i16_le(*v),
        (NodeType::U32, Value::U32(v)) => out.put_u32_le(*v),
        (NodeType::S32, Value::S32(v)) => out.put_i32_le(*v),
        (NodeType::Float, Value::Float(v)) => out.put_f32_le(*v as f32),
        (NodeType::Str, Value::Str(s)) => out.extend_from_slice(s.as_bytes()),
        (NodeType::Bin, Value::Bin(b)) => out.extend_from_slice(b),
        (NodeType::Plain | NodeType::Link, _) => return Err(Error::ValuelessType(ty)),
        (expected, got) => {
            return Err(Error::TypeMismatch {
                expected,
                got: got.kind(),
            })
        }
    }
    Ok(out)
}
