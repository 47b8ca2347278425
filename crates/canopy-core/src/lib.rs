//! Canopy Core
//!
//! Protocol engine for tree-described wireless instruments. The instrument
//! publishes its whole command surface as a compressed capability tree; all
//! traffic after that is compact `[op_code][payload]` messages resolved
//! through the tree.
//!
//! This crate provides:
//! - CRC-32 descriptor checksumming ([`Crc32`])
//! - Node types, tagged values and the per-node wire codec ([`value`])
//! - Descriptor decompression and parsing ([`descriptor`])
//! - The arena-backed capability tree ([`Tree`])
//! - The stream parser / dispatcher state machine ([`Engine`])
//!
//! Everything here is synchronous and transport-agnostic; the async session
//! layer lives in `canopy-client` on top of `canopy-transport`.

pub mod crc;
pub mod descriptor;
pub mod engine;
pub mod error;
pub mod tree;
pub mod value;

pub use crc::Crc32;
pub use descriptor::{parse_descriptor, ParsedTree, CRC_NODE_PATH};
pub use engine::{CrcPolicy, Engine, EngineConfig, Event, ResyncPolicy, MAX_FRAME, TREE_OPCODE};
pub use error::{Error, Result};
pub use tree::{Node, NodeId, SubscriberFn, Tree};
pub use value::{decode_value, encode_value, Decoded, NodeType, Value};
