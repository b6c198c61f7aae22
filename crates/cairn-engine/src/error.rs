//! Error types for the engine
//!
//! Errors are split by phase:
//! - [`GraphError`]: construction-time, raised before any provider call
//! - [`ResolutionError`]: per-node, recorded by the scheduler and propagated
//!   to dependents
//! - [`RunError`]: what a caller sees at the end of a run
//! - [`ConfigError`], [`StateMachineError`], [`JournalError`]: ambient

use crate::types::{NodeId, NodeState};
use std::path::PathBuf;

/// Construction-time errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GraphError {
    /// Two resources share a logical name
    #[error("resource name `{0}` is declared more than once")]
    DuplicateResourceName(String),

    /// Two exports share a name
    #[error("export name `{0}` is declared more than once")]
    DuplicateExportName(String),

    /// The graph contains a cycle
    #[error("cyclic dependency between: {}", .nodes.join(", "))]
    CyclicDependency {
        /// Labels of the nodes on the cycle(s), sorted
        nodes: Vec<String>,
    },

    /// A forward reference names a resource that was never declared
    #[error("reference to undeclared resource `{0}`")]
    UnknownResource(String),

    /// A resource has no such output property
    #[error("resource `{resource}` declares no output `{property}`")]
    UnknownOutput {
        /// Resource name
        resource: String,
        /// Requested property
        property: String,
    },

    /// A handle issued by another graph was used
    #[error("handle {0} does not belong to this graph")]
    ForeignHandle(NodeId),
}

/// Why a node ended in `Failed`
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResolutionError {
    /// The provider call for a resource failed
    #[error("resource `{resource}` failed: {message}")]
    ExternalResourceFailure {
        /// Resource name
        resource: String,
        /// Provider message
        message: String,
    },

    /// A `map`/`try_map`/`concat`/`format` function failed
    #[error("{node} failed: {message}")]
    CombinatorFailure {
        /// Node label
        node: String,
        /// Failure message
        message: String,
    },

    /// An ancestor failed, so this node was never attempted
    #[error("{node} skipped: dependency {origin} failed")]
    DependencyFailure {
        /// Node label
        node: String,
        /// Label of the node whose failure caused this one
        origin: String,
    },

    /// Scheduling stopped before this node was attempted
    #[error("{node} cancelled after an earlier failure")]
    Cancelled {
        /// Node label
        node: String,
    },
}

impl ResolutionError {
    /// True for failures that started at this node rather than upstream
    #[inline]
    #[must_use]
    pub fn is_origin(&self) -> bool {
        !matches!(self, ResolutionError::DependencyFailure { .. })
    }
}

/// Failure of a whole run
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    /// The graph could not be sealed
    #[error("graph construction failed: {0}")]
    Construction(#[from] GraphError),

    /// One or more exports never reached `Resolved`
    #[error(
        "{} export(s) did not resolve ({}); causes: {}",
        .exports.len(),
        .exports.join(", "),
        .failures.iter().map(ToString::to_string).collect::<Vec<_>>().join("; ")
    )]
    UnresolvedExports {
        /// Every failed export, in declaration order
        exports: Vec<String>,
        /// Distinct originating failures
        failures: Vec<ResolutionError>,
    },
}

/// Illegal node state transition
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StateMachineError {
    /// The transition is not allowed from the current state
    #[error("illegal transition {from} -> {to}")]
    IllegalTransition {
        /// Current state
        from: NodeState,
        /// Requested state
        to: NodeState,
    },
}

/// Run journal errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JournalError {
    /// Hash chain broken at the given entry
    #[error("journal integrity violation at entry {seq}")]
    IntegrityViolation {
        /// Sequence number of the first bad entry
        seq: u64,
    },
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required key has no value in any source
    #[error("missing required configuration value `{0}`")]
    Missing(String),

    /// Config file could not be read
    #[error("failed to read {path}: {source}")]
    Io {
        /// File path
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// Config file is not valid TOML for the expected shape
    #[error("invalid configuration: {0}")]
    Parse(#[from] toml::de::Error),

    /// Semantically invalid setting
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_message_lists_nodes() {
        let err = GraphError::CyclicDependency {
            nodes: vec!["a".into(), "b".into()],
        };
        assert_eq!(err.to_string(), "cyclic dependency between: a, b");
    }

    #[test]
    fn test_dependency_failure_is_not_origin() {
        let dep = ResolutionError::DependencyFailure {
            node: "url".into(),
            origin: "token".into(),
        };
        let ext = ResolutionError::ExternalResourceFailure {
            resource: "token".into(),
            message: "boom".into(),
        };
        assert!(!dep.is_origin());
        assert!(ext.is_origin());
    }

    #[test]
    fn test_unresolved_exports_message() {
        let err = RunError::UnresolvedExports {
            exports: vec!["url".into(), "key".into()],
            failures: vec![ResolutionError::ExternalResourceFailure {
                resource: "token".into(),
                message: "denied".into(),
            }],
        };
        let text = err.to_string();
        assert!(text.starts_with("2 export(s) did not resolve (url, key)"));
        assert!(text.contains("resource `token` failed: denied"));
    }
}
