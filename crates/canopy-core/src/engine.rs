//! Stream parser, dispatcher and outbound framing
//!
//! The engine is a synchronous state machine owned by one task. Inbound
//! fragments (already stripped of their transport sequence byte) are appended
//! to a FIFO receive buffer and dispatched by leading op-code; outbound
//! frames are queued and drained by the session layer. Partial messages are
//! never consumed speculatively: when a frame is incomplete the buffer is
//! left untouched and dispatch resumes after the next fragment.

use crate::descriptor::{parse_descriptor, CRC_NODE_PATH};
use crate::tree::{NodeId, SubscriberFn, Tree};
use crate::value::{decode_value, encode_value, Decoded, Value};
use crate::{Error, Result};
use bytes::{Buf, Bytes, BytesMut};
use std::collections::VecDeque;
use tracing::{debug, info, warn};

/// Op-code of the tree descriptor message.
pub const TREE_OPCODE: u8 = 0x01;

/// High bit of the op-code marks an outbound frame as a value write
/// (a bare op-code is a value request).
pub const VALUE_SET_FLAG: u8 = 0x80;

/// Hard cap on one outbound frame, inherited from the transport's fixed
/// notification size.
pub const MAX_FRAME: usize = 20;

/// Op-codes 0..=2 are administrative (CRC, tree request, tree data) and are
/// excluded from the post-init value sweep.
const FIRST_SWEEP_OPCODE: u8 = 3;

/// Severity of a mismatch between the computed tree checksum and the value
/// the instrument echoes back. Observed instrument behavior treats this as
/// diagnostic only, so `Warn` is the default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CrcPolicy {
    #[default]
    Warn,
    Abort,
}

/// What to do with an op-code that is not in the table. The protocol has no
/// frame length for unknown op-codes, so the stream cannot be realigned
/// reliably; `Stall` leaves the buffer untouched (observed behavior), while
/// `SkipByte` drops one byte and retries as an explicit opt-in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResyncPolicy {
    #[default]
    Stall,
    SkipByte,
}

/// Engine tuning knobs.
#[derive(Debug, Clone, Copy, Default)]
pub struct EngineConfig {
    pub crc_policy: CrcPolicy,
    pub resync_policy: ResyncPolicy,
}

/// Protocol-level outcomes surfaced to the session layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Tree descriptor parsed and registered; checksum queued for echo.
    TreeReady { checksum: u32 },
    /// A node's value was updated from the wire.
    ValueUpdated { node: NodeId },
    /// The instrument echoed the tree checksum for the first time; the
    /// full value sweep has been queued and the session is live.
    Initialized,
}

/// Protocol engine for one session.
///
/// Created empty; the tree appears once the op-code-1 descriptor arrives.
/// Torn down and rebuilt on reconnect.
pub struct Engine {
    config: EngineConfig,
    buffer: BytesMut,
    tree: Option<Tree>,
    op_table: Vec<NodeId>,
    checksum: Option<u32>,
    initialized: bool,
    send_sequence: u8,
    outbound: VecDeque<Bytes>,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            buffer: BytesMut::new(),
            tree: None,
            op_table: Vec::new(),
            checksum: None,
            initialized: false,
            send_sequence: 0,
            outbound: VecDeque::new(),
        }
    }

    /// Whether the init handshake (checksum echo) has completed.
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// The capability tree, once received.
    pub fn tree(&self) -> Option<&Tree> {
        self.tree.as_ref()
    }

    /// Resolve a colon-separated path against the current tree.
    pub fn find(&self, path: &str) -> Option<NodeId> {
        self.tree.as_ref()?.find(path, None)
    }

    /// Current value snapshot of a node.
    pub fn value(&self, node: NodeId) -> Option<&Value> {
        self.tree.as_ref()?.node(node).value.as_ref()
    }

    /// Register a subscriber on a node; ids are per-node, sequential from 1.
    pub fn subscribe(&mut self, node: NodeId, callback: SubscriberFn) -> Result<u32> {
        let tree = self.tree.as_mut().ok_or(Error::TreeNotReady)?;
        Ok(tree.subscribe(node, callback))
    }

    /// Remove a subscription by id.
    pub fn unsubscribe(&mut self, node: NodeId, sub_id: u32) -> bool {
        self.tree
            .as_mut()
            .map(|t| t.unsubscribe(node, sub_id))
            .unwrap_or(false)
    }

    // ------------------------------------------------------------------
    // Inbound
    // ------------------------------------------------------------------

    /// Append one inbound fragment and dispatch as many complete messages
    /// as the buffer now holds. Returns the protocol events produced.
    ///
    /// Errors are fatal to the session (corrupt descriptor, checksum abort
    /// policy); everything recoverable is handled internally.
    pub fn receive(&mut self, fragment: &[u8]) -> Result<Vec<Event>> {
        self.buffer.extend_from_slice(fragment);
        let mut events = Vec::new();

        loop {
            if self.buffer.is_empty() {
                break;
            }
            let op = self.buffer[0];

            if op == TREE_OPCODE {
                if !self.dispatch_tree(&mut events)? {
                    break;
                }
            } else {
                match self.dispatch_value(op, &mut events)? {
                    Dispatch::Continue => {}
                    Dispatch::Wait => break,
                }
            }
        }

        Ok(events)
    }

    /// Op-code 1: `[0x01][len:u16le][compressed descriptor]`. Returns false
    /// while the body is still incomplete.
    fn dispatch_tree(&mut self, events: &mut Vec<Event>) -> Result<bool> {
        if self.buffer.len() < 3 {
            return Ok(false);
        }
        let len = u16::from_le_bytes([self.buffer[1], self.buffer[2]]) as usize;
        if self.buffer.len() < 3 + len {
            debug!(have = self.buffer.len() - 3, need = len, "tree descriptor incomplete");
            return Ok(false);
        }

        let parsed = parse_descriptor(&self.buffer[3..3 + len])?;
        self.buffer.advance(3 + len);

        let mut tree = parsed.tree;
        tree.dump();
        let crc_node = tree
            .find(CRC_NODE_PATH, None)
            .expect("descriptor parse verified the CRC node");
        tree.set_value(crc_node, Value::U32(parsed.checksum))?;

        self.tree = Some(tree);
        self.op_table = parsed.op_table;
        self.checksum = Some(parsed.checksum);
        events.push(Event::TreeReady {
            checksum: parsed.checksum,
        });

        // Echo the checksum back; the instrument confirms by sending it
        // through op-code 0, which completes initialization.
        self.send_value(crc_node)?;
        Ok(true)
    }

    /// Any op-code other than 1: look up the node and decode per its type.
    fn dispatch_value(&mut self, op: u8, events: &mut Vec<Event>) -> Result<Dispatch> {
        if op as usize >= self.op_table.len() {
            warn!(op, "unknown op-code");
            return Ok(match self.config.resync_policy {
                ResyncPolicy::Stall => Dispatch::Wait,
                ResyncPolicy::SkipByte => {
                    self.buffer.advance(1);
                    Dispatch::Continue
                }
            });
        }

        let node_id = self.op_table[op as usize];
        let tree = self.tree.as_mut().expect("op table implies a tree");
        let node_type = tree.node(node_id).node_type;

        let decoded = match decode_value(node_type, &self.buffer) {
            Ok(d) => d,
            // A bad string payload corrupts only this frame; its length is
            // known (decode saw the whole payload), so drop it and move on.
            Err(Error::InvalidString(e)) => {
                let len = u16::from_le_bytes([self.buffer[1], self.buffer[2]]) as usize;
                warn!(op, error = %e, "dropping malformed string frame");
                self.buffer.advance(3 + len);
                return Ok(Dispatch::Continue);
            }
            Err(e) => return Err(e),
        };
        let (value, consumed) = match decoded {
            Decoded::Partial => return Ok(Dispatch::Wait),
            Decoded::Complete { value, consumed } => (value, consumed),
        };
        self.buffer.advance(consumed);

        tree.set_value(node_id, value)?;
        info!(
            node = %tree.node(node_id).name,
            value = %tree.node(node_id).value.as_ref().expect("just set"),
            "value updated"
        );
        tree.notify(node_id);
        events.push(Event::ValueUpdated { node: node_id });

        if op == 0 {
            self.confirm_checksum(node_id, events)?;
        }
        Ok(Dispatch::Continue)
    }

    /// The instrument echoed through the CRC node. Verify it and, on the
    /// first echo, kick off the full value sweep.
    fn confirm_checksum(&mut self, crc_node: NodeId, events: &mut Vec<Event>) -> Result<()> {
        let computed = self.checksum.expect("tree parse stored the checksum");
        let reported = self
            .tree
            .as_ref()
            .and_then(|t| t.node(crc_node).value.as_ref())
            .and_then(|v| match *v {
                Value::U32(v) => Some(v),
                _ => None,
            })
            .unwrap_or(computed);

        if reported != computed {
            match self.config.crc_policy {
                CrcPolicy::Warn => warn!(
                    computed = format_args!("0x{computed:08x}"),
                    reported = format_args!("0x{reported:08x}"),
                    "tree checksum mismatch"
                ),
                CrcPolicy::Abort => {
                    return Err(Error::ChecksumMismatch { computed, reported })
                }
            }
        }

        if !self.initialized {
            self.request_all_values(None);
            self.initialized = true;
            info!("session initialized");
            events.push(Event::Initialized);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Outbound
    // ------------------------------------------------------------------

    /// Ask the instrument for its tree descriptor (sent once after the
    /// notification channel is up).
    pub fn request_tree(&mut self) {
        self.queue_frame(&[TREE_OPCODE]);
    }

    /// Queue a value request (bare op-code) for one node.
    pub fn request_value(&mut self, node: NodeId) -> Result<()> {
        let op = self.op_code_of(node)?;
        self.queue_frame(&[op]);
        Ok(())
    }

    /// Queue a value request for the node at `path`.
    pub fn request_path(&mut self, path: &str) -> Result<()> {
        let node = self
            .find(path)
            .ok_or_else(|| Error::NodeNotFound(path.to_string()))?;
        self.request_value(node)
    }

    /// Queue value requests for every value-bearing node outside the
    /// administrative op-code range, depth-first from `start`.
    pub fn request_all_values(&mut self, start: Option<NodeId>) {
        let Some(tree) = self.tree.as_ref() else { return };
        let mut ops = Vec::new();
        tree.walk(start, &mut |_, node| {
            if let Some(op) = node.op_code {
                if op >= FIRST_SWEEP_OPCODE {
                    ops.push(op);
                }
            }
        });
        for op in ops {
            self.queue_frame(&[op]);
        }
    }

    /// Store a new value on a node and queue the write to the instrument.
    pub fn write_value(&mut self, node: NodeId, value: Value) -> Result<()> {
        let tree = self.tree.as_mut().ok_or(Error::TreeNotReady)?;
        tree.set_value(node, value)?;
        self.send_value(node)
    }

    /// Select a chooser option: sets the parent chooser's value to this
    /// node's positional index and queues the write.
    pub fn choose(&mut self, node: NodeId) -> Result<()> {
        let tree = self.tree.as_mut().ok_or(Error::TreeNotReady)?;
        let (parent, index) = tree.chooser_index(node)?;
        tree.set_value(parent, Value::U8(index))?;
        self.send_value(parent)
    }

    /// Queue a value-set frame `[op|0x80][encoded value]` for the node's
    /// current value.
    fn send_value(&mut self, node: NodeId) -> Result<()> {
        let op = self.op_code_of(node)?;
        let payload = {
            let n = self.tree.as_ref().expect("op code implies a tree").node(node);
            let value = n.value.as_ref().ok_or_else(|| Error::NodeNotFound(n.name.clone()))?;
            encode_value(n.node_type, value)?
        };
        let mut frame = Vec::with_capacity(1 + payload.len());
        frame.push(op | VALUE_SET_FLAG);
        frame.extend_from_slice(&payload);
        self.queue_frame(&frame);
        Ok(())
    }

    fn op_code_of(&self, node: NodeId) -> Result<u8> {
        let tree = self.tree.as_ref().ok_or(Error::TreeNotReady)?;
        let n = tree.node(node);
        n.op_code
            .ok_or_else(|| Error::ValuelessType(n.node_type))
    }

    /// Wrap a payload as `[seq][payload...]`, capped at [`MAX_FRAME`] bytes.
    /// Oversized frames are truncated with a warning; the cap comes from the
    /// transport notification size and cannot be relaxed here.
    fn queue_frame(&mut self, payload: &[u8]) {
        let mut frame = BytesMut::with_capacity(1 + payload.len());
        frame.extend_from_slice(&[self.send_sequence]);
        self.send_sequence = self.send_sequence.wrapping_add(1);
        frame.extend_from_slice(payload);
        if frame.len() > MAX_FRAME {
            warn!(len = frame.len(), "outbound frame exceeds {MAX_FRAME} bytes, truncating");
            frame.truncate(MAX_FRAME);
        }
        self.outbound.push_back(frame.freeze());
    }

    /// Drain all queued outbound frames, in order.
    pub fn drain_outbound(&mut self) -> Vec<Bytes> {
        self.outbound.drain(..).collect()
    }

    /// Bytes currently buffered but not yet dispatched.
    pub fn pending_bytes(&self) -> usize {
        self.buffer.len()
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

enum Dispatch {
    Continue,
    Wait,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::fixtures::{compress, record, sample_descriptor};
    use crate::value::NodeType;

    /// Wrap a compressed blob in the op-code-1 framing.
    fn tree_message(compressed: &[u8]) -> Vec<u8> {
        let mut msg = vec![TREE_OPCODE];
        msg.extend_from_slice(&(compressed.len() as u16).to_le_bytes());
        msg.extend_from_slice(compressed);
        msg
    }

    /// Engine that has already parsed the sample tree, with the checksum
    /// echo frame drained away.
    fn ready_engine() -> (Engine, u32) {
        let mut engine = Engine::default();
        let blob = sample_descriptor();
        let events = engine.receive(&tree_message(&blob)).unwrap();
        let checksum = match events.as_slice() {
            [Event::TreeReady { checksum }] => *checksum,
            other => panic!("unexpected events: {other:?}"),
        };
        engine.drain_outbound();
        (engine, checksum)
    }

    #[test]
    fn tree_message_across_fragments() {
        let mut engine = Engine::default();
        let msg = tree_message(&sample_descriptor());

        for chunk in msg[..msg.len() - 1].chunks(5) {
            assert!(engine.receive(chunk).unwrap().is_empty());
            assert!(engine.tree().is_none());
        }
        let events = engine.receive(&msg[msg.len() - 1..]).unwrap();
        assert!(matches!(events.as_slice(), [Event::TreeReady { .. }]));
        assert!(engine.find("ADMIN:CRC32").is_some());
        assert_eq!(engine.pending_bytes(), 0);
    }

    #[test]
    fn tree_parse_queues_checksum_write() {
        let mut engine = Engine::default();
        let blob = sample_descriptor();
        let events = engine.receive(&tree_message(&blob)).unwrap();
        let Event::TreeReady { checksum } = events[0] else {
            panic!("expected TreeReady");
        };

        let frames = engine.drain_outbound();
        assert_eq!(frames.len(), 1);
        // [seq][op 0 | set flag][u32 le checksum]
        assert_eq!(frames[0][0], 0);
        assert_eq!(frames[0][1], VALUE_SET_FLAG);
        assert_eq!(&frames[0][2..6], checksum.to_le_bytes());
    }

    #[test]
    fn checksum_echo_initializes_once_and_sweeps_values() {
        let (mut engine, checksum) = ready_engine();

        // instrument echoes through op-code 0 (ADMIN:CRC32)
        let mut echo = vec![0x00];
        echo.extend_from_slice(&checksum.to_le_bytes());
        let events = engine.receive(&echo).unwrap();
        assert!(events.contains(&Event::Initialized));
        assert!(engine.is_initialized());

        // the sweep skips the administrative op-codes 0..=2, so only MODE
        // (op 3) gets requested
        let frames = engine.drain_outbound();
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0][1..], &[0x03][..]);

        // a second echo updates the value but does not re-initialize or
        // re-sweep
        let events = engine.receive(&echo).unwrap();
        assert!(!events.contains(&Event::Initialized));
        assert!(engine.drain_outbound().is_empty());
    }

    #[test]
    fn sweep_requests_value_nodes_above_admin_range() {
        // ROOT -> { ADMIN -> { CRC32, TREE, DIAG }, BATT:Float, NAME:Str }
        let crc32 = record(NodeType::U32, "CRC32", &[]);
        let tree = record(NodeType::Bin, "TREE", &[]);
        let diag = record(NodeType::Str, "DIAG", &[]);
        let admin = record(NodeType::Plain, "ADMIN", &[crc32, tree, diag]);
        let batt = record(NodeType::Float, "BATT", &[]);
        let name = record(NodeType::Str, "NAME", &[]);
        let root = record(NodeType::Plain, "", &[admin, batt, name]);
        let blob = compress(&root);

        let mut engine = Engine::default();
        let events = engine.receive(&tree_message(&blob)).unwrap();
        let Event::TreeReady { checksum } = events[0] else {
            panic!("expected TreeReady");
        };
        engine.drain_outbound();

        let mut echo = vec![0x00];
        echo.extend_from_slice(&checksum.to_le_bytes());
        engine.receive(&echo).unwrap();

        // ops: CRC32=0, TREE=1, DIAG=2, BATT=3, NAME=4 -> BATT and NAME
        let frames = engine.drain_outbound();
        assert_eq!(frames.len(), 2);
        assert_eq!(&frames[0][1..], &[0x03][..]);
        assert_eq!(&frames[1][1..], &[0x04][..]);
    }

    #[test]
    fn value_update_waits_for_full_payload() {
        let (mut engine, _) = ready_engine();
        let diag = engine.find("ADMIN:DIAG").unwrap();

        // DIAG (op 2, string): length prefix announces 5 bytes, deliver 2
        assert!(engine.receive(&[0x02, 0x05, 0x00, b'h', b'i']).unwrap().is_empty());
        assert!(engine.value(diag).is_none());
        assert_eq!(engine.pending_bytes(), 5);

        let events = engine.receive(b"gh!").unwrap();
        assert_eq!(events, vec![Event::ValueUpdated { node: diag }]);
        assert_eq!(engine.value(diag), Some(&Value::Str("high!".into())));
        assert_eq!(engine.pending_bytes(), 0);
    }

    #[test]
    fn malformed_string_frame_is_dropped_not_fatal() {
        let (mut engine, _) = ready_engine();
        let diag = engine.find("ADMIN:DIAG").unwrap();
        let mode = engine.find("MODE").unwrap();

        // DIAG (op 2) with two bytes of invalid UTF-8, then a valid MODE
        // update in the same delivery
        let events = engine
            .receive(&[0x02, 0x02, 0x00, 0xFF, 0xFE, 0x03, 0x01])
            .unwrap();
        assert_eq!(events, vec![Event::ValueUpdated { node: mode }]);
        assert!(engine.value(diag).is_none());
        assert_eq!(engine.pending_bytes(), 0);

        // a well-formed DIAG frame afterwards still decodes
        let events = engine.receive(&[0x02, 0x02, 0x00, b'o', b'k']).unwrap();
        assert_eq!(events, vec![Event::ValueUpdated { node: diag }]);
        assert_eq!(engine.value(diag), Some(&Value::Str("ok".into())));
    }

    #[test]
    fn chooser_update_notifies_with_selected_index() {
        let (mut engine, _) = ready_engine();
        let mode = engine.find("MODE").unwrap();
        let events = engine.receive(&[0x03, 0x01]).unwrap();
        assert_eq!(events, vec![Event::ValueUpdated { node: mode }]);
        assert_eq!(engine.value(mode), Some(&Value::U8(1)));
    }

    #[test]
    fn unknown_op_code_stalls_by_default() {
        let (mut engine, _) = ready_engine();
        assert!(engine.receive(&[0x37, 0x01, 0x02]).unwrap().is_empty());
        // nothing consumed, nothing changes on further input
        assert_eq!(engine.pending_bytes(), 3);
        assert!(engine.receive(&[0xFF]).unwrap().is_empty());
        assert_eq!(engine.pending_bytes(), 4);
    }

    #[test]
    fn skip_byte_policy_resynchronizes() {
        let blob = sample_descriptor();
        let mut engine = Engine::new(EngineConfig {
            resync_policy: ResyncPolicy::SkipByte,
            ..EngineConfig::default()
        });
        engine.receive(&tree_message(&blob)).unwrap();
        engine.drain_outbound();

        // one junk byte, then a valid MODE update
        let events = engine.receive(&[0x37, 0x03, 0x01]).unwrap();
        let mode = engine.find("MODE").unwrap();
        assert_eq!(events, vec![Event::ValueUpdated { node: mode }]);
        assert_eq!(engine.pending_bytes(), 0);
    }

    #[test]
    fn checksum_mismatch_aborts_under_strict_policy() {
        let blob = sample_descriptor();
        let mut engine = Engine::new(EngineConfig {
            crc_policy: CrcPolicy::Abort,
            ..EngineConfig::default()
        });
        engine.receive(&tree_message(&blob)).unwrap();
        engine.drain_outbound();

        let mut echo = vec![0x00];
        echo.extend_from_slice(&0xBAD0_BAD0u32.to_le_bytes());
        assert!(matches!(
            engine.receive(&echo),
            Err(Error::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn checksum_mismatch_warns_by_default() {
        let (mut engine, _) = ready_engine();
        let mut echo = vec![0x00];
        echo.extend_from_slice(&0xBAD0_BAD0u32.to_le_bytes());
        let events = engine.receive(&echo).unwrap();
        assert!(events.contains(&Event::Initialized));
    }

    #[test]
    fn outbound_sequence_wraps() {
        let (mut engine, _) = ready_engine();
        let mode = engine.find("MODE").unwrap();
        for _ in 0..300 {
            engine.request_value(mode).unwrap();
        }
        let frames = engine.drain_outbound();
        // the tree parse consumed sequence 0
        assert_eq!(frames[0][0], 1);
        assert_eq!(frames[254][0], 255);
        assert_eq!(frames[255][0], 0);
    }

    #[test]
    fn oversized_frame_is_truncated() {
        let (mut engine, _) = ready_engine();
        let diag = engine.find("ADMIN:DIAG").unwrap();
        engine
            .write_value(diag, Value::Str("a string well past the frame cap".into()))
            .unwrap();
        let frames = engine.drain_outbound();
        assert_eq!(frames[0].len(), MAX_FRAME);
    }

    #[test]
    fn choose_writes_parent_index() {
        let (mut engine, _) = ready_engine();
        let b = engine.find("MODE:B").unwrap();
        engine.choose(b).unwrap();

        let mode = engine.find("MODE").unwrap();
        assert_eq!(engine.value(mode), Some(&Value::U8(1)));
        let frames = engine.drain_outbound();
        // [seq][op 3 | set][index]
        assert_eq!(&frames[0][1..], &[0x03 | VALUE_SET_FLAG, 0x01][..]);
    }

    #[test]
    fn request_path_rejects_unknown_node() {
        let (mut engine, _) = ready_engine();
        assert!(matches!(
            engine.request_path("NO:SUCH:NODE"),
            Err(Error::NodeNotFound(_))
        ));
        engine.request_path("ADMIN:DIAG").unwrap();
        let frames = engine.drain_outbound();
        assert_eq!(&frames[0][1..], &[0x02][..]);
    }
}
