//! Tree descriptor decompression and parsing
//!
//! The instrument sends its full capability tree once per connection as a
//! zlib-compressed blob under op-code 1. Decompressed, the grammar is a
//! recursive record:
//!
//! ```text
//! [type:u8][name_len:u8][name:name_len bytes][child_count:u8][child records...]
//! ```
//!
//! An empty name denotes the synthetic root, rendered as "ROOT". Value-bearing
//! nodes (type ordinal >= Chooser) are assigned dense op-codes in depth-first
//! pre-order and registered in a flat op-code table. The checksum is computed
//! over the *compressed* bytes as received; the instrument later confirms it
//! through the ADMIN:CRC32 node.

use crate::crc::Crc32;
use crate::tree::{NodeId, Tree};
use crate::value::NodeType;
use crate::{Error, Result};
use flate2::read::ZlibDecoder;
use std::io::Read;
use tracing::{debug, info};

/// Well-known path every valid tree must contain.
pub const CRC_NODE_PATH: &str = "ADMIN:CRC32";

/// Result of a successful descriptor parse.
pub struct ParsedTree {
    pub tree: Tree,
    /// Dense op-code -> node table, index = op-code.
    pub op_table: Vec<NodeId>,
    /// CRC-32 of the compressed descriptor bytes.
    pub checksum: u32,
}

/// Decompress and parse a tree descriptor blob.
///
/// `compressed` is exactly the byte range announced by the op-code-1 length
/// prefix. Malformed zlib data, a truncated record structure, or a tree
/// without [`CRC_NODE_PATH`] all abort tree construction.
pub fn parse_descriptor(compressed: &[u8]) -> Result<ParsedTree> {
    let mut raw = Vec::new();
    ZlibDecoder::new(compressed)
        .read_to_end(&mut raw)
        .map_err(|e| Error::Decompress(e.to_string()))?;
    debug!(
        compressed = compressed.len(),
        decompressed = raw.len(),
        "inflated tree descriptor"
    );

    let checksum = Crc32::new().checksum(compressed);
    info!(checksum = format_args!("0x{checksum:08x}"), "tree checksum");

    let mut tree = Tree::new();
    let mut op_table = Vec::new();
    let mut cursor = Cursor::new(&raw);
    parse_node(&mut cursor, &mut tree, None, &mut op_table)?;

    if tree.find(CRC_NODE_PATH, None).is_none() {
        return Err(Error::MissingCrcNode(CRC_NODE_PATH));
    }

    Ok(ParsedTree {
        tree,
        op_table,
        checksum,
    })
}

/// Bounds-checked reader over the decompressed descriptor.
struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.buf.len() - self.pos < n {
            return Err(Error::TruncatedDescriptor {
                needed: n,
                have: self.buf.len() - self.pos,
            });
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn take_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }
}

/// Parse one record and its children. The op-code counter is the table
/// itself: the next op-code is always the current table length, so parsing
/// stays a pure function of the input bytes.
fn parse_node(
    cursor: &mut Cursor<'_>,
    tree: &mut Tree,
    parent: Option<NodeId>,
    op_table: &mut Vec<NodeId>,
) -> Result<NodeId> {
    let node_type = NodeType::from_wire(cursor.take_u8()?)?;
    let name_len = cursor.take_u8()? as usize;
    let name = if name_len == 0 {
        "ROOT".to_string()
    } else {
        String::from_utf8(cursor.take(name_len)?.to_vec())
            .map_err(|e| Error::InvalidString(e.to_string()))?
    };

    let op_code = if node_type.has_value() {
        let op = op_table.len();
        if op > u8::MAX as usize {
            return Err(Error::OpCodeOverflow(op));
        }
        Some(op as u8)
    } else {
        None
    };

    let id = tree.push(name, node_type, parent, op_code);
    if op_code.is_some() {
        op_table.push(id);
    }

    let child_count = cursor.take_u8()?;
    for _ in 0..child_count {
        parse_node(cursor, tree, Some(id), op_table)?;
    }
    Ok(id)
}


#[cfg(test)]
mod tests {
    use super::fixtures::{compress, record, sample_descriptor};
    use super::*;

    #[test]
    fn parses_sample_tree() {
        let parsed = parse_descriptor(&sample_descriptor()).unwrap();
        assert_eq!(parsed.tree.node(parsed.tree.root()).name, "ROOT");
        assert!(parsed.tree.find("ADMIN:CRC32", None).is_some());
        assert!(parsed.tree.find("ADMIN:DIAG", None).is_some());
        assert!(parsed.tree.find("MODE:B", None).is_some());
    }

    #[test]
    fn op_codes_are_dense_pre_order_skipping_plain_and_link() {
        let parsed = parse_descriptor(&sample_descriptor()).unwrap();
        let tree = &parsed.tree;

        let crc = tree.find("ADMIN:CRC32", None).unwrap();
        let tree_node = tree.find("ADMIN:TREE", None).unwrap();
        let diag = tree.find("ADMIN:DIAG", None).unwrap();
        let mode = tree.find("MODE", None).unwrap();
        assert_eq!(tree.node(crc).op_code, Some(0));
        assert_eq!(tree.node(tree_node).op_code, Some(1));
        assert_eq!(tree.node(diag).op_code, Some(2));
        assert_eq!(tree.node(mode).op_code, Some(3));

        assert_eq!(parsed.op_table, vec![crc, tree_node, diag, mode]);

        // structural nodes stay out of the table
        let admin = tree.find("ADMIN", None).unwrap();
        assert_eq!(tree.node(admin).op_code, None);
        assert_eq!(tree.node(tree.root()).op_code, None);
    }

    #[test]
    fn checksum_covers_compressed_bytes() {
        let blob = sample_descriptor();
        let parsed = parse_descriptor(&blob).unwrap();
        assert_eq!(parsed.checksum, Crc32::new().checksum(&blob));
    }

    #[test]
    fn garbage_zlib_is_fatal() {
        assert!(matches!(
            parse_descriptor(&[0xDE, 0xAD, 0xBE, 0xEF]),
            Err(Error::Decompress(_))
        ));
    }

    #[test]
    fn truncated_record_is_fatal() {
        // valid zlib stream around a record that promises a longer name
        // than the buffer holds
        let raw = vec![NodeType::Plain as u8, 10, b'X'];
        assert!(matches!(
            parse_descriptor(&compress(&raw)),
            Err(Error::TruncatedDescriptor { .. })
        ));
    }

    #[test]
    fn tree_without_crc_node_is_fatal() {
        let child = record(NodeType::U8, "LED", &[]);
        let root = record(NodeType::Plain, "", &[child]);
        assert!(matches!(
            parse_descriptor(&compress(&root)),
            Err(Error::MissingCrcNode(_))
        ));
    }
}
