//! Identifiers and node states shared across the engine

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Index of a node in a graph arena
///
/// Node ids are dense: the n-th declared node has index `n`. They are only
/// meaningful together with the graph that issued them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(u32);

impl NodeId {
    pub(crate) fn from_index(index: usize) -> Self {
        Self(u32::try_from(index).unwrap_or(u32::MAX))
    }

    /// Position of this node in the arena
    #[inline]
    #[must_use]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Identity of one graph (one deployment run)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GraphId(pub Uuid);

impl GraphId {
    /// Fresh random graph id
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for GraphId {
    fn default() -> Self {
        Self::new()
    }
}

/// Lifecycle of a node during a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeState {
    /// Declared, waiting for dependencies
    Pending,
    /// External call issued (resource nodes only)
    Resolving,
    /// Value available
    Resolved,
    /// Terminal failure, never retried
    Failed,
}

impl NodeState {
    /// Resolved or Failed
    #[inline]
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, NodeState::Resolved | NodeState::Failed)
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NodeState::Pending => "pending",
            NodeState::Resolving => "resolving",
            NodeState::Resolved => "resolved",
            NodeState::Failed => "failed",
        };
        f.write_str(s)
    }
}
