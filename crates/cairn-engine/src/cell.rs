//! Deferred value cells
//!
//! A cell is a placeholder for a value that becomes known exactly once. Cells
//! are created by combinators and resource declarations on a
//! [`GraphBuilder`](crate::graph::GraphBuilder); the builder hands out
//! [`Output`] handles that index into its arena.

use crate::error::{ResolutionError, StateMachineError};
use crate::state_machine::validate_transition;
use crate::types::{GraphId, NodeId, NodeState};
use crate::value::Value;
use smallvec::SmallVec;
use std::fmt;
use std::sync::Arc;

/// Dependency list; most cells have a handful of inputs
pub(crate) type Deps = SmallVec<[NodeId; 4]>;

/// Fallible transformation applied by `map`/`try_map`
pub(crate) type MapFn = Arc<dyn Fn(Value) -> Result<Value, String> + Send + Sync>;

/// Handle to a deferred value declared on a graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Output {
    pub(crate) graph: GraphId,
    pub(crate) id: NodeId,
}

impl Output {
    /// Node id of the underlying cell
    #[inline]
    #[must_use]
    pub fn id(self) -> NodeId {
        self.id
    }
}

/// A combinator or resource input: either a deferred value or a plain one
///
/// Plain values are turned into constant cells when the builder consumes them.
#[derive(Debug, Clone)]
pub enum Input {
    /// Reference to an existing cell
    Deferred(Output),
    /// Known value
    Plain(Value),
}

impl From<Output> for Input {
    fn from(value: Output) -> Self {
        Input::Deferred(value)
    }
}

impl From<Value> for Input {
    fn from(value: Value) -> Self {
        Input::Plain(value)
    }
}

impl From<&str> for Input {
    fn from(value: &str) -> Self {
        Input::Plain(value.into())
    }
}

impl From<String> for Input {
    fn from(value: String) -> Self {
        Input::Plain(value.into())
    }
}

impl From<i64> for Input {
    fn from(value: i64) -> Self {
        Input::Plain(value.into())
    }
}

impl From<bool> for Input {
    fn from(value: bool) -> Self {
        Input::Plain(value.into())
    }
}

pub(crate) enum CellKind {
    Constant(Value),
    Map(MapFn),
    Concat,
    All,
    ResourceOutput { property: String },
    ForwardRef { resource: String, property: String },
}

impl fmt::Debug for CellKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CellKind::Constant(_) => f.write_str("Constant"),
            CellKind::Map(_) => f.write_str("Map"),
            CellKind::Concat => f.write_str("Concat"),
            CellKind::All => f.write_str("All"),
            CellKind::ResourceOutput { property } => write!(f, "ResourceOutput({property})"),
            CellKind::ForwardRef { resource, property } => {
                write!(f, "ForwardRef({resource}.{property})")
            }
        }
    }
}

#[derive(Debug)]
pub(crate) struct Cell {
    pub(crate) kind: CellKind,
    pub(crate) deps: Deps,
    pub(crate) secret: bool,
    pub(crate) label: String,
}

impl Cell {
    /// Secrecy is inherited through derived cells, never through resource
    /// outputs (those carry their own declared flag).
    pub(crate) fn inherits_taint(&self) -> bool {
        matches!(
            self.kind,
            CellKind::Map(_) | CellKind::Concat | CellKind::All | CellKind::ForwardRef { .. }
        )
    }

    /// Compute this cell's value from its resolved inputs, given in declared
    /// dependency order.
    ///
    /// Resource outputs are filled in by their resource and never evaluated
    /// here.
    pub(crate) fn evaluate(&self, inputs: &[&Value]) -> Result<Value, String> {
        match &self.kind {
            CellKind::Constant(v) => Ok(v.clone()),
            CellKind::Map(f) => {
                let input = inputs.first().ok_or("map has no input")?;
                f((*input).clone())
            }
            CellKind::Concat => Value::concat(inputs.iter().copied()),
            CellKind::All => Ok(Value::List(inputs.iter().map(|v| (*v).clone()).collect())),
            CellKind::ForwardRef { .. } => inputs
                .first()
                .map(|v| (*v).clone())
                .ok_or_else(|| "unresolved forward reference".to_string()),
            CellKind::ResourceOutput { property } => {
                Err(format!("output `{property}` is set by its resource"))
            }
        }
    }
}

/// Resolution slot of one node, written exactly once per run
#[derive(Debug, Clone)]
pub(crate) struct Slot {
    pub(crate) state: NodeState,
    pub(crate) value: Option<Value>,
    pub(crate) failure: Option<ResolutionError>,
    /// Node whose own failure caused this one, for dependency failures
    pub(crate) cause: Option<NodeId>,
}

impl Slot {
    pub(crate) fn pending() -> Self {
        Self {
            state: NodeState::Pending,
            value: None,
            failure: None,
            cause: None,
        }
    }

    pub(crate) fn begin(&mut self) -> Result<(), StateMachineError> {
        validate_transition(self.state, NodeState::Resolving)?;
        self.state = NodeState::Resolving;
        Ok(())
    }

    pub(crate) fn resolve(&mut self, value: Value) -> Result<(), StateMachineError> {
        validate_transition(self.state, NodeState::Resolved)?;
        self.state = NodeState::Resolved;
        self.value = Some(value);
        Ok(())
    }

    pub(crate) fn fail(&mut self, failure: ResolutionError) -> Result<(), StateMachineError> {
        validate_transition(self.state, NodeState::Failed)?;
        self.state = NodeState::Failed;
        self.failure = Some(failure);
        Ok(())
    }
}
