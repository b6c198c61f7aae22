//! Resource declarations
//!
//! A resource is an external object whose creation is an opaque, side-effecting
//! provider call. Declaring one registers a node keyed by its logical name,
//! wires its inputs as dependencies and synthesizes one unresolved output cell
//! per declared output property.

use crate::cell::{Input, Output};
use crate::error::GraphError;
use crate::types::NodeId;
use std::collections::{BTreeMap, BTreeSet};

/// Arguments of a resource declaration
///
/// ```rust,ignore
/// let args = ResourceArgs::new("storage:BlobContainer")
///     .input("account_name", account.output("name")?)
///     .input("public_access", "None")
///     .output("name");
/// ```
#[derive(Debug, Clone)]
pub struct ResourceArgs {
    pub(crate) kind: String,
    pub(crate) inputs: BTreeMap<String, Input>,
    pub(crate) outputs: Vec<String>,
    pub(crate) secret_outputs: BTreeSet<String>,
}

impl ResourceArgs {
    /// Start a declaration of the given provider kind
    #[must_use]
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            inputs: BTreeMap::new(),
            outputs: Vec::new(),
            secret_outputs: BTreeSet::new(),
        }
    }

    /// Add an input property
    #[must_use]
    pub fn input(mut self, name: impl Into<String>, value: impl Into<Input>) -> Self {
        self.inputs.insert(name.into(), value.into());
        self
    }

    /// Declare an output property
    #[must_use]
    pub fn output(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        if !self.outputs.contains(&name) {
            self.outputs.push(name);
        }
        self
    }

    /// Declare an output property whose value is secret
    #[must_use]
    pub fn secret_output(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        self.secret_outputs.insert(name.clone());
        self.output(name)
    }

    /// Provider kind token
    #[must_use]
    pub fn kind(&self) -> &str {
        &self.kind
    }
}

/// Resource node stored in the graph arena
#[derive(Debug)]
pub(crate) struct ResourceNode {
    pub(crate) name: String,
    pub(crate) kind: String,
    pub(crate) inputs: BTreeMap<String, NodeId>,
    pub(crate) outputs: BTreeMap<String, NodeId>,
    /// At least one output is declared secret; the resource's own value
    /// holds every output, so it is secret too
    pub(crate) secret: bool,
}

/// Handle returned by [`GraphBuilder::declare`](crate::graph::GraphBuilder::declare)
#[derive(Debug, Clone)]
pub struct Resource {
    pub(crate) name: String,
    pub(crate) id: NodeId,
    pub(crate) outputs: BTreeMap<String, Output>,
}

impl Resource {
    /// Logical name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Node id of the resource itself
    #[must_use]
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Output cell for a declared property
    ///
    /// # Errors
    /// `GraphError::UnknownOutput` if the property was not declared.
    pub fn output(&self, property: &str) -> Result<Output, GraphError> {
        self.outputs
            .get(property)
            .copied()
            .ok_or_else(|| GraphError::UnknownOutput {
                resource: self.name.clone(),
                property: property.to_string(),
            })
    }

    /// Declared output names
    pub fn output_names(&self) -> impl Iterator<Item = &str> {
        self.outputs.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secret_output_is_also_an_output() {
        let args = ResourceArgs::new("storage:ServiceSas")
            .output("name")
            .secret_output("token")
            .output("token");
        assert_eq!(args.outputs, vec!["name".to_string(), "token".to_string()]);
        assert!(args.secret_outputs.contains("token"));
    }

    #[test]
    fn test_plain_inputs_are_recorded() {
        let args = ResourceArgs::new("web:WebApp").input("kind", "Linux").input("reserved", true);
        assert_eq!(args.inputs.len(), 2);
        assert_eq!(args.kind(), "web:WebApp");
    }
}
