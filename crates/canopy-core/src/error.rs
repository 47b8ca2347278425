//! Error types for the canopy protocol engine

use crate::value::NodeType;
use thiserror::Error;

/// Result type alias for canopy-core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Protocol engine error types
#[derive(Error, Debug)]
pub enum Error {
    /// Descriptor buffer ended mid-record
    #[error("truncated descriptor: need {needed} bytes, have {have}")]
    TruncatedDescriptor { needed: usize, have: usize },

    /// Zlib stream in the tree descriptor could not be inflated
    #[error("descriptor decompression failed: {0}")]
    Decompress(String),

    /// Descriptor carried a type byte outside the known ordinals
    #[error("unknown node type: 0x{0:02x}")]
    UnknownNodeType(u8),

    /// Every valid tree carries the ADMIN:CRC32 node
    #[error("tree has no node at path {0}")]
    MissingCrcNode(&'static str),

    /// Operation needs the capability tree before the descriptor arrived
    #[error("capability tree not received yet")]
    TreeNotReady,

    /// Echoed tree checksum did not match the computed one (abort policy)
    #[error("tree checksum mismatch: computed 0x{computed:08x}, instrument reported 0x{reported:08x}")]
    ChecksumMismatch { computed: u32, reported: u32 },

    /// A Plain or Link node can never carry wire bytes
    #[error("node type {0:?} carries no value")]
    ValuelessType(NodeType),

    /// Value variant does not match the node's declared type
    #[error("wrong value for {expected:?} node: got {got}")]
    TypeMismatch { expected: NodeType, got: &'static str },

    /// choose() on a node whose parent is not a Chooser
    #[error("node '{0}' is not a chooser option")]
    NotChooserOption(String),

    /// Path lookup failed where a node was required
    #[error("no node at path '{0}'")]
    NodeNotFound(String),

    /// Op-code count outgrew the one-byte wire space
    #[error("op-code space exhausted at {0} nodes")]
    OpCodeOverflow(usize),

    /// Str payload was not valid UTF-8
    #[error("invalid string payload: {0}")]
    InvalidString(String),
}
