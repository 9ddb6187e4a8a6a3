//! Character trie over dispatch keys.
//!
//! Built once per entry type at patch time and discarded after the
//! dispatch method is emitted. Nodes live in an arena indexed by
//! [`NodeId`]; edges preserve insertion order so code generation is
//! deterministic for a given key order.

use indexmap::IndexMap;

/// Arena index of a trie node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub u32);

impl NodeId {
    /// Creates a node id from an arena index.
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    /// The arena index.
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// A single trie node.
#[derive(Debug, Clone)]
pub struct TrieNode {
    /// Character consumed to reach this node. `'\0'` for the root.
    pub ch: char,
    /// Full dispatch key ending at this node, if any.
    pub key: Option<String>,
    /// Outgoing edges in insertion order.
    pub edges: IndexMap<char, NodeId>,
    /// Back-reference used for sibling iteration during generation.
    pub parent: Option<NodeId>,
}

/// Character-indexed automaton mapping dispatch keys to terminal nodes.
#[derive(Debug)]
pub struct DispatchTrie {
    nodes: Vec<TrieNode>,
}

impl DispatchTrie {
    /// Creates a trie containing only the root.
    pub fn new() -> Self {
        Self {
            nodes: vec![TrieNode {
                ch: '\0',
                key: None,
                edges: IndexMap::new(),
                parent: None,
            }],
        }
    }

    /// The root node id.
    pub fn root(&self) -> NodeId {
        NodeId::new(0)
    }

    /// Borrows a node.
    pub fn node(&self, id: NodeId) -> &TrieNode {
        &self.nodes[id.index()]
    }

    /// Number of nodes, including the root.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// True when no key has been inserted.
    pub fn is_empty(&self) -> bool {
        self.nodes.len() == 1
    }

    /// Inserts a key, marking the node reached after its final character
    /// as terminal. Idempotent: re-inserting an existing key is a no-op
    /// and never overwrites an earlier terminal.
    pub fn insert(&mut self, key: &str) {
        let mut current = 0usize;
        for ch in key.chars() {
            let next = match self.nodes[current].edges.get(&ch) {
                Some(id) => id.index(),
                None => {
                    let id = self.nodes.len();
                    self.nodes.push(TrieNode {
                        ch,
                        key: None,
                        edges: IndexMap::new(),
                        parent: Some(NodeId::new(current as u32)),
                    });
                    self.nodes[current]
                        .edges
                        .insert(ch, NodeId::new(id as u32));
                    id
                }
            };
            current = next;
        }
        if current != 0 && self.nodes[current].key.is_none() {
            self.nodes[current].key = Some(key.to_string());
        }
    }
}

impl Default for DispatchTrie {
    fn default() -> Self {
        Self::new()
    }
}
