//! Secret taint propagation
//!
//! Every cell carries a `secret` flag. A cell derived from a secret cell
//! through `map`, `try_map`, `concat`, `all`, `format` or a forward reference
//! is secret too, and the flag is never cleared.
//!
//! Values only reach logs, the run journal and default export output through
//! [`Redacted`], so the check happens in one place.

use crate::graph::Node;
use crate::types::NodeId;
use crate::value::Value;
use std::fmt;

/// Text shown instead of a secret value in logs and the journal
pub const REDACTED: &str = "[secret]";

/// Display wrapper that hides secret values
#[derive(Debug, Clone, Copy)]
pub struct Redacted<'a> {
    value: &'a Value,
    secret: bool,
}

impl<'a> Redacted<'a> {
    /// Wrap `value`, hiding it when `secret` is set
    #[must_use]
    pub fn new(value: &'a Value, secret: bool) -> Self {
        Self { value, secret }
    }
}

impl fmt::Display for Redacted<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.secret {
            f.write_str(REDACTED)
        } else {
            write!(f, "{}", self.value)
        }
    }
}

/// True if any of `deps` is secret
pub(crate) fn tainted_by(nodes: &[Node], deps: &[NodeId]) -> bool {
    deps.iter()
        .any(|d| nodes.get(d.index()).is_some_and(Node::is_secret))
}

/// Push taint along edges in topological order.
///
/// Declaration already taints cells whose inputs were known at the time;
/// this pass catches cells that depend on forward references.
pub(crate) fn propagate(nodes: &mut [Node], order: &[NodeId]) {
    for &id in order {
        let tainted = match &nodes[id.index()] {
            Node::Cell(cell) if cell.inherits_taint() && !cell.secret => {
                tainted_by(nodes, &cell.deps)
            }
            _ => false,
        };
        if tainted {
            if let Node::Cell(cell) = &mut nodes[id.index()] {
                cell.secret = true;
            }
        }
    }
}
