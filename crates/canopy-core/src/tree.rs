//! In-memory capability tree
//!
//! The whole tree is built in one pass from the decoded descriptor and torn
//! down as a unit; only node values change afterwards. Nodes live in an
//! arena and reference each other by index, so parent links never own
//! anything and dropping the [`Tree`] drops everything.

use crate::value::{NodeType, Value};
use crate::{Error, Result};
use std::panic::{catch_unwind, AssertUnwindSafe};
use tracing::{debug, warn};

/// Handle to a node in the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub(crate) usize);

/// Callback invoked with each successful value update of a subscribed node.
pub type SubscriberFn = Box<dyn Fn(&Value) + Send>;

struct Subscriber {
    id: u32,
    callback: SubscriberFn,
}

/// One entry in the capability tree.
pub struct Node {
    pub name: String,
    pub node_type: NodeType,
    /// Dense wire identifier; `None` for Plain/Link nodes.
    pub op_code: Option<u8>,
    pub parent: Option<NodeId>,
    /// Descriptor order; positional for Chooser options.
    pub children: Vec<NodeId>,
    /// Absent until the first value arrives from the instrument.
    pub value: Option<Value>,
    subscribers: Vec<Subscriber>,
    next_subscriber_id: u32,
}

impl Node {
    fn new(name: String, node_type: NodeType, parent: Option<NodeId>, op_code: Option<u8>) -> Self {
        Self {
            name,
            node_type,
            op_code,
            parent,
            children: Vec::new(),
            value: None,
            subscribers: Vec::new(),
            next_subscriber_id: 1,
        }
    }
}

/// Arena of nodes; index 0 is always the synthetic root.
pub struct Tree {
    nodes: Vec<Node>,
}

impl Tree {
    pub(crate) fn new() -> Self {
        Self { nodes: Vec::new() }
    }

    /// The synthetic "ROOT" node. Never addressable via `find` paths.
    pub fn root(&self) -> NodeId {
        NodeId(0)
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub(crate) fn push(
        &mut self,
        name: String,
        node_type: NodeType,
        parent: Option<NodeId>,
        op_code: Option<u8>,
    ) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(Node::new(name, node_type, parent, op_code));
        if let Some(p) = parent {
            self.nodes[p.0].children.push(id);
        }
        id
    }

    /// Resolve a colon-separated path (`CH2:MAPPING:VOLTAGE:60`) by exact,
    /// case-sensitive segment match against successive children. Resolution
    /// starts below `start` (default: root).
    pub fn find(&self, path: &str, start: Option<NodeId>) -> Option<NodeId> {
        let mut current = start.unwrap_or_else(|| self.root());
        for segment in path.split(':') {
            current = *self.nodes[current.0]
                .children
                .iter()
                .find(|&&child| self.nodes[child.0].name == segment)?;
        }
        Some(current)
    }

    /// Store a new value snapshot, validating it against the declared type.
    /// A mismatch means a corrupted tree or a programmer error and is fatal.
    pub fn set_value(&mut self, id: NodeId, value: Value) -> Result<()> {
        let node = &mut self.nodes[id.0];
        let matches = matches!(
            (node.node_type, &value),
            (NodeType::Chooser | NodeType::U8, Value::U8(_))
                | (NodeType::U16, Value::U16(_))
                | (NodeType::U32, Value::U32(_))
                | (NodeType::S8, Value::S8(_))
                | (NodeType::S16, Value::S16(_))
                | (NodeType::S32, Value::S32(_))
                | (NodeType::Str, Value::Str(_))
                | (NodeType::Bin, Value::Bin(_))
                | (NodeType::Float, Value::Float(_))
        );
        if !matches {
            if !node.node_type.has_value() {
                return Err(Error::ValuelessType(node.node_type));
            }
            return Err(Error::TypeMismatch {
                expected: node.node_type,
                got: value.kind(),
            });
        }
        node.value = Some(value);
        Ok(())
    }

    /// Register a callback on a node. Ids are sequential per node, from 1.
    pub fn subscribe(&mut self, id: NodeId, callback: SubscriberFn) -> u32 {
        let node = &mut self.nodes[id.0];
        let sub_id = node.next_subscriber_id;
        node.next_subscriber_id += 1;
        node.subscribers.push(Subscriber {
            id: sub_id,
            callback,
        });
        debug!(node = %node.name, id = sub_id, "subscribed");
        sub_id
    }

    /// Remove a subscription by id. Returns false if it was not present.
    pub fn unsubscribe(&mut self, id: NodeId, sub_id: u32) -> bool {
        let subs = &mut self.nodes[id.0].subscribers;
        let before = subs.len();
        subs.retain(|s| s.id != sub_id);
        subs.len() != before
    }

    /// Invoke every subscriber in subscription order with the current value.
    /// A panicking subscriber is contained so later ones still run.
    pub fn notify(&self, id: NodeId) {
        let node = &self.nodes[id.0];
        let Some(value) = &node.value else { return };
        for sub in &node.subscribers {
            if catch_unwind(AssertUnwindSafe(|| (sub.callback)(value))).is_err() {
                warn!(node = %node.name, subscriber = sub.id, "subscriber panicked");
            }
        }
    }

    /// Zero-based position of `node` among its parent's children, with the
    /// parent id. Valid only when the parent is a Chooser.
    pub fn chooser_index(&self, id: NodeId) -> Result<(NodeId, u8)> {
        let node = &self.nodes[id.0];
        let parent_id = node
            .parent
            .filter(|&p| self.nodes[p.0].node_type == NodeType::Chooser)
            .ok_or_else(|| Error::NotChooserOption(node.name.clone()))?;
        let index = self.nodes[parent_id.0]
            .children
            .iter()
            .position(|&c| c == id)
            .expect("child is present in its parent's child list");
        Ok((parent_id, index as u8))
    }

    /// Depth-first pre-order walk from `start` (default root).
    pub fn walk(&self, start: Option<NodeId>, f: &mut impl FnMut(NodeId, &Node)) {
        let id = start.unwrap_or_else(|| self.root());
        if self.nodes.is_empty() {
            return;
        }
        f(id, &self.nodes[id.0]);
        for &child in &self.nodes[id.0].children {
            self.walk(Some(child), f);
        }
    }

    /// Log the tree shape at debug level.
    pub fn dump(&self) {
        self.dump_from(self.root(), 0);
    }

    fn dump_from(&self, id: NodeId, indent: usize) {
        let node = &self.nodes[id.0];
        debug!(
            "{:indent$}{} [{:?}{}]",
            "",
            node.name,
            node.node_type,
            node.op_code
                .map(|op| format!(", op {op}"))
                .unwrap_or_default(),
        );
        for &child in &node.children {
            self.dump_from(child, indent + 2);
        }
    }
}
