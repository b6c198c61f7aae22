//! Export sink
//!
//! Turns a finished [`RunOutcome`] into named export values. Secret exports
//! are rendered as [`SECRET_PLACEHOLDER`]; their plaintext only leaves the
//! engine through [`ExportSink::deliver_secrets`] and a caller-supplied
//! [`SecureChannel`].

use crate::error::RunError;
use crate::scheduler::RunOutcome;
use crate::types::{NodeId, NodeState};
use crate::value::Value;
use indexmap::IndexMap;
use serde::{Serialize, Serializer};
use std::fmt;

/// Rendered form of a secret export
pub const SECRET_PLACEHOLDER: &str = "<secret>";

/// One rendered export
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rendered {
    /// Non-secret value, shown as is
    Plain(Value),
    /// Secret value, shown as the placeholder
    Secret,
}

impl Rendered {
    /// True for secret exports
    #[must_use]
    pub fn is_secret(&self) -> bool {
        matches!(self, Rendered::Secret)
    }
}

impl Serialize for Rendered {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Rendered::Plain(value) => value.serialize(serializer),
            Rendered::Secret => serializer.serialize_str(SECRET_PLACEHOLDER),
        }
    }
}

impl fmt::Display for Rendered {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rendered::Plain(value) => write!(f, "{value}"),
            Rendered::Secret => f.write_str(SECRET_PLACEHOLDER),
        }
    }
}

/// Exports in declaration order
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct RenderedExports {
    values: IndexMap<String, Rendered>,
}

impl RenderedExports {
    /// Rendered value of one export
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Rendered> {
        self.values.get(name)
    }

    /// Exports in declaration order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Rendered)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Number of exports
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// True if there are no exports
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Pretty-printed JSON object
    ///
    /// # Errors
    /// Serialization errors from `serde_json`.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    /// Two-column text table, one export per line
    #[must_use]
    pub fn to_text(&self) -> String {
        let width = self.values.keys().map(String::len).max().unwrap_or(0);
        let mut out = String::new();
        for (name, value) in &self.values {
            out.push_str(&format!("{name:<width$}  {value}\n"));
        }
        out
    }
}

/// Receives plaintext secret exports
///
/// Implement this for a destination the caller trusts (a vault, a file with
/// restricted permissions, a terminal the user explicitly asked for).
pub trait SecureChannel {
    /// Receive one secret export
    fn deliver(&mut self, name: &str, value: &Value);
}

/// Renders the exports of a finished run
#[derive(Debug, Clone, Copy, Default)]
pub struct ExportSink;

impl ExportSink {
    /// Create a sink
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Render every export.
    ///
    /// # Errors
    /// `RunError::UnresolvedExports` naming every export that did not
    /// resolve, together with the distinct failures that caused them.
    pub fn render(&self, outcome: &RunOutcome) -> Result<RenderedExports, RunError> {
        let mut failed = Vec::new();
        let mut origins: Vec<NodeId> = Vec::new();
        for (name, id) in outcome.graph().exports() {
            if outcome.state(id) != NodeState::Resolved {
                failed.push(name.to_string());
                if let Some(origin) = outcome.origin_of(id) {
                    if !origins.contains(&origin) {
                        origins.push(origin);
                    }
                }
            }
        }

        if !failed.is_empty() {
            tracing::warn!(exports = failed.len(), "exports did not resolve");
            return Err(RunError::UnresolvedExports {
                exports: failed,
                failures: origins
                    .into_iter()
                    .filter_map(|o| outcome.failure(o))
                    .collect(),
            });
        }
        Ok(self.render_resolved(outcome))
    }

    /// Render only the exports that resolved, skipping the rest
    #[must_use]
    pub fn render_resolved(&self, outcome: &RunOutcome) -> RenderedExports {
        let graph = outcome.graph();
        let values = graph
            .exports()
            .filter_map(|(name, id)| {
                let value = outcome.value_of(id)?;
                let rendered = if graph.is_secret(id) {
                    Rendered::Secret
                } else {
                    Rendered::Plain(value)
                };
                Some((name.to_string(), rendered))
            })
            .collect();
        RenderedExports { values }
    }

    /// Hand the plaintext of every resolved secret export to `channel`.
    /// Returns the number delivered.
    pub fn deliver_secrets(&self, outcome: &RunOutcome, channel: &mut dyn SecureChannel) -> usize {
        let graph = outcome.graph();
        let mut delivered = 0;
        for (name, id) in graph.exports() {
            if !graph.is_secret(id) {
                continue;
            }
            if let Some(value) = outcome.value_of(id) {
                channel.deliver(name, &value);
                delivered += 1;
            }
        }
        tracing::debug!(delivered, "delivered secret exports");
        delivered
    }
}
