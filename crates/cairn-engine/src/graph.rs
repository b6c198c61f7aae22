//! Dependency graph construction
//!
//! The graph is built in two phases:
//!
//! 1. **Declaration** ([`GraphBuilder`]): combinators and resource
//!    declarations append nodes to an arena and record data-dependency edges.
//!    Nothing is resolved here.
//! 2. **Sealing** ([`GraphBuilder::seal`]): forward references are bound, the
//!    graph is checked for cycles, secrecy is propagated and an immutable
//!    [`SealedGraph`] is produced for the scheduler.
//!
//! Resources are only ever connected through values: an output cell of one
//! resource feeding an input of another.

use crate::cell::{Cell, CellKind, Deps, Input, MapFn, Output};
use crate::error::GraphError;
use crate::resource::{Resource, ResourceArgs, ResourceNode};
use crate::secret;
use crate::types::{GraphId, NodeId};
use crate::value::Value;
use indexmap::IndexMap;
use petgraph::algo::{tarjan_scc, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use smallvec::smallvec;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Arena entry
#[derive(Debug)]
pub(crate) enum Node {
    Cell(Cell),
    Resource(ResourceNode),
}

impl Node {
    pub(crate) fn is_secret(&self) -> bool {
        match self {
            Node::Cell(cell) => cell.secret,
            Node::Resource(r) => r.secret,
        }
    }

    /// Dependencies in declared order (duplicates kept)
    pub(crate) fn deps(&self) -> Deps {
        match self {
            Node::Cell(cell) => cell.deps.clone(),
            Node::Resource(r) => r.inputs.values().copied().collect(),
        }
    }

    pub(crate) fn label(&self) -> &str {
        match self {
            Node::Cell(cell) => &cell.label,
            Node::Resource(r) => &r.name,
        }
    }
}

/// Builder for a deployment graph
///
/// Usage:
/// ```rust,ignore
/// let mut graph = GraphBuilder::new();
/// let account = graph.declare("acct", ResourceArgs::new("storage:Account").output("name"))?;
/// let url = graph.concat([Input::from("https://"), account.output("name")?.into()]);
/// graph.export("url", url)?;
/// let sealed = graph.seal()?;
/// ```
///
/// Handle misuse (an [`Output`] from another builder) is recorded and reported
/// by [`seal`](Self::seal), so combinators themselves stay infallible.
#[derive(Debug)]
pub struct GraphBuilder {
    id: GraphId,
    nodes: Vec<Node>,
    resources: HashMap<String, NodeId>,
    exports: IndexMap<String, NodeId>,
    errors: Vec<GraphError>,
}

impl GraphBuilder {
    /// Create an empty graph
    #[must_use]
    pub fn new() -> Self {
        Self {
            id: GraphId::new(),
            nodes: Vec::new(),
            resources: HashMap::new(),
            exports: IndexMap::new(),
            errors: Vec::new(),
        }
    }

    /// Identity of this graph
    #[must_use]
    pub fn graph_id(&self) -> GraphId {
        self.id
    }

    /// Number of cells and resources declared so far
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Number of resources declared so far
    #[must_use]
    pub fn resource_count(&self) -> usize {
        self.resources.len()
    }

    /// Whether a cell is secret as of now.
    ///
    /// Cells depending on not-yet-declared resources may become secret when
    /// the graph is sealed; never the other way round.
    #[must_use]
    pub fn is_secret(&self, value: Output) -> bool {
        value.graph == self.id
            && self
                .nodes
                .get(value.id.index())
                .is_some_and(Node::is_secret)
    }

    /// A cell that is already resolved
    pub fn constant(&mut self, value: impl Into<Value>) -> Output {
        self.push_constant(value.into(), false)
    }

    /// A resolved cell marked secret
    pub fn secret(&mut self, value: impl Into<Value>) -> Output {
        self.push_constant(value.into(), true)
    }

    /// Apply `f` once `input` resolves
    pub fn map<F>(&mut self, input: Output, f: F) -> Output
    where
        F: Fn(Value) -> Value + Send + Sync + 'static,
    {
        self.try_map(input, move |v| Ok(f(v)))
    }

    /// Apply a fallible `f` once `input` resolves; an `Err` fails the cell
    /// and everything downstream of it.
    pub fn try_map<F>(&mut self, input: Output, f: F) -> Output
    where
        F: Fn(Value) -> Result<Value, String> + Send + Sync + 'static,
    {
        let dep = self.check(input);
        let f: MapFn = Arc::new(f);
        self.push_derived(CellKind::Map(f), smallvec![dep], "map")
    }

    /// Concatenate parts in declared order once all of them resolve
    pub fn concat<I>(&mut self, parts: I) -> Output
    where
        I: IntoIterator,
        I::Item: Into<Input>,
    {
        let deps = self.resolve_inputs(parts);
        self.push_derived(CellKind::Concat, deps, "concat")
    }

    /// Ordered list of all parts once all of them resolve
    pub fn all<I>(&mut self, parts: I) -> Output
    where
        I: IntoIterator,
        I::Item: Into<Input>,
    {
        let deps = self.resolve_inputs(parts);
        self.push_derived(CellKind::All, deps, "all")
    }

    /// Fill each `{}` in `template` with the next part's text form.
    ///
    /// A placeholder count that does not match the number of parts fails the
    /// cell at resolution time.
    pub fn format<I>(&mut self, template: &str, parts: I) -> Output
    where
        I: IntoIterator,
        I::Item: Into<Input>,
    {
        let list = self.all(parts);
        let template = template.to_string();
        let out = self.try_map(list, move |v| render_template(&template, &v));
        self.relabel(out, format!("format{}", out.id));
        out
    }

    /// Register a resource and synthesize its output cells
    ///
    /// # Errors
    /// `GraphError::DuplicateResourceName` if `name` is already declared.
    pub fn declare(
        &mut self,
        name: impl Into<String>,
        args: ResourceArgs,
    ) -> Result<Resource, GraphError> {
        let name = name.into();
        if self.resources.contains_key(&name) {
            return Err(GraphError::DuplicateResourceName(name));
        }

        let mut inputs = BTreeMap::new();
        for (property, input) in args.inputs {
            let dep = self.resolve_input(input);
            inputs.insert(property, dep);
        }

        let id = NodeId::from_index(self.nodes.len());
        self.nodes.push(Node::Resource(ResourceNode {
            name: name.clone(),
            kind: args.kind,
            inputs,
            outputs: BTreeMap::new(),
            secret: !args.secret_outputs.is_empty(),
        }));
        self.resources.insert(name.clone(), id);

        let mut outputs = BTreeMap::new();
        for property in args.outputs {
            let secret = args.secret_outputs.contains(&property);
            let out = self.push_cell(Cell {
                label: format!("{name}.{property}"),
                kind: CellKind::ResourceOutput {
                    property: property.clone(),
                },
                deps: smallvec![id],
                secret,
            });
            outputs.insert(property, out);
        }

        if let Node::Resource(node) = &mut self.nodes[id.index()] {
            node.outputs = outputs.iter().map(|(k, o)| (k.clone(), o.id)).collect();
        }

        tracing::trace!(resource = %name, outputs = outputs.len(), "declared resource");
        Ok(Resource { name, id, outputs })
    }

    /// Reference an output of a resource that may not be declared yet
    ///
    /// Unknown resources or properties are reported by [`seal`](Self::seal).
    pub fn output_of(&mut self, resource: &str, property: &str) -> Output {
        let existing = self.resources.get(resource).and_then(|rid| {
            match &self.nodes[rid.index()] {
                Node::Resource(r) => r.outputs.get(property).copied(),
                Node::Cell(_) => None,
            }
        });
        if let Some(id) = existing {
            return Output { graph: self.id, id };
        }

        self.push_cell(Cell {
            label: format!("{resource}.{property}"),
            kind: CellKind::ForwardRef {
                resource: resource.to_string(),
                property: property.to_string(),
            },
            deps: Deps::new(),
            secret: false,
        })
    }

    /// Designate a cell as a named export
    ///
    /// # Errors
    /// `GraphError::DuplicateExportName` if `name` is already exported.
    pub fn export(&mut self, name: impl Into<String>, value: Output) -> Result<(), GraphError> {
        let name = name.into();
        if self.exports.contains_key(&name) {
            return Err(GraphError::DuplicateExportName(name));
        }
        let id = self.check(value);
        // Generated labels are replaced by the export name for diagnostics
        if let Some(Node::Cell(cell)) = self.nodes.get_mut(id.index()) {
            if cell.label.contains('#') {
                cell.label.clone_from(&name);
            }
        }
        self.exports.insert(name, id);
        Ok(())
    }

    /// Validate and freeze the graph
    ///
    /// This performs all construction-time checks:
    /// - handles from other graphs
    /// - forward references to unknown resources or outputs
    /// - cycles (reported with the labels of every node on them)
    ///
    /// # Errors
    /// The first construction error found.
    pub fn seal(mut self) -> Result<SealedGraph, GraphError> {
        if !self.errors.is_empty() {
            return Err(self.errors.swap_remove(0));
        }

        self.bind_forward_refs()?;
        let order = self.topological_order()?;
        secret::propagate(&mut self.nodes, &order);

        let mut deps = Vec::with_capacity(self.nodes.len());
        let mut dependents = vec![Vec::new(); self.nodes.len()];
        for (index, node) in self.nodes.iter().enumerate() {
            let mut unique = node.deps();
            unique.sort_unstable();
            unique.dedup();
            for dep in &unique {
                dependents[dep.index()].push(NodeId::from_index(index));
            }
            deps.push(unique);
        }

        tracing::debug!(
            graph = %self.id.0,
            nodes = self.nodes.len(),
            resources = self.resources.len(),
            exports = self.exports.len(),
            "sealed graph"
        );

        Ok(SealedGraph {
            id: self.id,
            nodes: self.nodes,
            deps,
            dependents,
            order,
            resources: self.resources.into_iter().collect(),
            exports: self.exports,
        })
    }

    fn check(&mut self, value: Output) -> NodeId {
        if value.graph != self.id || value.id.index() >= self.nodes.len() {
            self.errors.push(GraphError::ForeignHandle(value.id));
        }
        value.id
    }

    fn resolve_input(&mut self, input: Input) -> NodeId {
        match input {
            Input::Deferred(out) => self.check(out),
            Input::Plain(value) => self.constant(value).id,
        }
    }

    fn resolve_inputs<I>(&mut self, parts: I) -> Deps
    where
        I: IntoIterator,
        I::Item: Into<Input>,
    {
        parts
            .into_iter()
            .map(|p| self.resolve_input(p.into()))
            .collect()
    }

    fn push_constant(&mut self, value: Value, secret: bool) -> Output {
        let prefix = if secret { "secret" } else { "const" };
        let label = format!("{prefix}#{}", self.nodes.len());
        self.push_cell(Cell {
            kind: CellKind::Constant(value),
            deps: Deps::new(),
            secret,
            label,
        })
    }

    fn push_derived(&mut self, kind: CellKind, deps: Deps, prefix: &str) -> Output {
        let secret = secret::tainted_by(&self.nodes, &deps);
        let label = format!("{prefix}#{}", self.nodes.len());
        self.push_cell(Cell {
            kind,
            deps,
            secret,
            label,
        })
    }

    fn push_cell(&mut self, cell: Cell) -> Output {
        let id = NodeId::from_index(self.nodes.len());
        self.nodes.push(Node::Cell(cell));
        Output { graph: self.id, id }
    }

    fn relabel(&mut self, value: Output, label: String) {
        if let Some(Node::Cell(cell)) = self.nodes.get_mut(value.id.index()) {
            cell.label = label;
        }
    }

    fn bind_forward_refs(&mut self) -> Result<(), GraphError> {
        for index in 0..self.nodes.len() {
            let Node::Cell(Cell {
                kind: CellKind::ForwardRef { resource, property },
                ..
            }) = &self.nodes[index]
            else {
                continue;
            };

            let rid = self
                .resources
                .get(resource)
                .ok_or_else(|| GraphError::UnknownResource(resource.clone()))?;
            let target = match &self.nodes[rid.index()] {
                Node::Resource(r) => r.outputs.get(property).copied(),
                Node::Cell(_) => None,
            }
            .ok_or_else(|| GraphError::UnknownOutput {
                resource: resource.clone(),
                property: property.clone(),
            })?;

            if let Node::Cell(cell) = &mut self.nodes[index] {
                cell.deps = smallvec![target];
            }
        }
        Ok(())
    }

    fn topological_order(&self) -> Result<Vec<NodeId>, GraphError> {
        let mut graph: DiGraph<NodeId, ()> = DiGraph::with_capacity(self.nodes.len(), 0);
        let indices: Vec<NodeIndex> = (0..self.nodes.len())
            .map(|i| graph.add_node(NodeId::from_index(i)))
            .collect();
        for (index, node) in self.nodes.iter().enumerate() {
            for dep in node.deps() {
                graph.update_edge(indices[dep.index()], indices[index], ());
            }
        }

        match toposort(&graph, None) {
            Ok(order) => Ok(order.into_iter().map(|ix| graph[ix]).collect()),
            Err(_) => {
                let mut nodes: Vec<String> = tarjan_scc(&graph)
                    .into_iter()
                    .filter(|scc| scc.len() > 1 || graph.contains_edge(scc[0], scc[0]))
                    .flatten()
                    .map(|ix| self.nodes[graph[ix].index()].label().to_string())
                    .collect();
                nodes.sort();
                nodes.dedup();
                Err(GraphError::CyclicDependency { nodes })
            }
        }
    }
}

impl Default for GraphBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn render_template(template: &str, values: &Value) -> Result<Value, String> {
    let values = values.as_list().ok_or("format expects a list of parts")?;
    let pieces: Vec<&str> = template.split("{}").collect();
    if pieces.len() != values.len() + 1 {
        return Err(format!(
            "template has {} placeholder(s) but {} part(s) were given",
            pieces.len() - 1,
            values.len()
        ));
    }

    let mut out = String::from(pieces[0]);
    for (value, piece) in values.iter().zip(&pieces[1..]) {
        match value {
            Value::List(_) | Value::Map(_) | Value::Null => {
                return Err(format!("cannot format {}", value.type_name()))
            }
            other => out.push_str(&other.to_string()),
        }
        out.push_str(piece);
    }
    Ok(Value::Str(out))
}

/// A validated, immutable graph ready for scheduling
///
/// Only [`GraphBuilder::seal`] produces one, so a scheduler never sees a
/// graph with cycles or dangling references.
#[derive(Debug)]
pub struct SealedGraph {
    id: GraphId,
    pub(crate) nodes: Vec<Node>,
    deps: Vec<Deps>,
    dependents: Vec<Vec<NodeId>>,
    order: Vec<NodeId>,
    resources: BTreeMap<String, NodeId>,
    exports: IndexMap<String, NodeId>,
}

impl SealedGraph {
    /// Identity of the graph
    #[must_use]
    pub fn graph_id(&self) -> GraphId {
        self.id
    }

    /// Number of cells and resources
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Number of resources
    #[must_use]
    pub fn resource_count(&self) -> usize {
        self.resources.len()
    }

    /// Resource names in lexical order
    pub fn resource_names(&self) -> impl Iterator<Item = &str> {
        self.resources.keys().map(String::as_str)
    }

    /// Node id of a resource
    #[must_use]
    pub fn resource(&self, name: &str) -> Option<NodeId> {
        self.resources.get(name).copied()
    }

    /// Human-readable label of a node (`acct`, `acct.name`, `concat#7`, ...)
    #[must_use]
    pub fn label(&self, id: NodeId) -> &str {
        self.nodes.get(id.index()).map_or("<unknown>", Node::label)
    }

    /// Whether a node is secret-tainted
    #[must_use]
    pub fn is_secret(&self, id: NodeId) -> bool {
        self.nodes.get(id.index()).is_some_and(Node::is_secret)
    }

    /// Whether a node is a resource
    #[must_use]
    pub fn is_resource(&self, id: NodeId) -> bool {
        matches!(self.nodes.get(id.index()), Some(Node::Resource(_)))
    }

    /// Unique dependencies of a node
    #[must_use]
    pub fn dependencies(&self, id: NodeId) -> &[NodeId] {
        self.deps.get(id.index()).map(|d| d.as_slice()).unwrap_or(&[])
    }

    /// Nodes that depend directly on `id`
    #[must_use]
    pub fn dependents(&self, id: NodeId) -> &[NodeId] {
        self.dependents.get(id.index()).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Exports in declaration order
    pub fn exports(&self) -> impl Iterator<Item = (&str, NodeId)> {
        self.exports.iter().map(|(k, v)| (k.as_str(), *v))
    }

    /// Cell behind an export
    #[must_use]
    pub fn export(&self, name: &str) -> Option<NodeId> {
        self.exports.get(name).copied()
    }

    /// All nodes, dependencies first
    #[must_use]
    pub fn topological_order(&self) -> &[NodeId] {
        &self.order
    }

    /// Resource names grouped by how many resources must be created before
    /// them. Resources within a wave are independent of each other.
    #[must_use]
    pub fn resource_waves(&self) -> Vec<Vec<&str>> {
        let mut depth = vec![0usize; self.nodes.len()];
        for &id in &self.order {
            depth[id.index()] = self
                .dependencies(id)
                .iter()
                .map(|dep| depth[dep.index()] + usize::from(self.is_resource(*dep)))
                .max()
                .unwrap_or(0);
        }

        let mut waves: Vec<Vec<&str>> = Vec::new();
        for &id in &self.order {
            if let Node::Resource(r) = &self.nodes[id.index()] {
                let d = depth[id.index()];
                if waves.len() <= d {
                    waves.resize_with(d + 1, Vec::new);
                }
                waves[d].push(&r.name);
            }
        }
        waves.retain(|w| !w.is_empty());
        for wave in &mut waves {
            wave.sort_unstable();
        }
        waves
    }

    pub(crate) fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.index()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account(graph: &mut GraphBuilder, name: &str) -> Resource {
        graph
            .declare(name, ResourceArgs::new("storage:Account").output("name"))
            .unwrap()
    }

    #[test]
    fn test_declaration_does_not_resolve() {
        let mut graph = GraphBuilder::new();
        let a = account(&mut graph, "a");
        let name = a.output("name").unwrap();
        let upper = graph.map(name, |v| v);
        assert_eq!(graph.node_count(), 3);
        assert!(!graph.is_secret(upper));
    }

    #[test]
    fn test_duplicate_resource_name_rejected() {
        let mut graph = GraphBuilder::new();
        account(&mut graph, "a");
        let err = graph
            .declare("a", ResourceArgs::new("storage:Account"))
            .unwrap_err();
        assert_eq!(err, GraphError::DuplicateResourceName("a".into()));
    }

    #[test]
    fn test_duplicate_export_name_rejected() {
        let mut graph = GraphBuilder::new();
        let c = graph.constant("x");
        graph.export("x", c).unwrap();
        assert_eq!(
            graph.export("x", c),
            Err(GraphError::DuplicateExportName("x".into()))
        );
    }

    #[test]
    fn test_secrecy_inherited_through_combinators() {
        let mut graph = GraphBuilder::new();
        let pwd = graph.secret("hunter2");
        let user = graph.constant("admin");
        let mapped = graph.map(pwd, |v| v);
        let joined = graph.concat([user, mapped]);
        let listed = graph.all([user]);
        assert!(graph.is_secret(mapped));
        assert!(graph.is_secret(joined));
        assert!(!graph.is_secret(listed));
    }

    #[test]
    fn test_unknown_output_on_handle() {
        let mut graph = GraphBuilder::new();
        let a = account(&mut graph, "a");
        assert!(matches!(
            a.output("key"),
            Err(GraphError::UnknownOutput { .. })
        ));
    }

    #[test]
    fn test_forward_reference_binds_at_seal() {
        let mut graph = GraphBuilder::new();
        let later = graph.output_of("b", "name");
        let url = graph.concat([Input::from("https://"), later.into()]);
        graph
            .declare("b", ResourceArgs::new("storage:Account").secret_output("name"))
            .unwrap();
        assert!(!graph.is_secret(url));

        let sealed = graph.seal().unwrap();
        assert!(sealed.is_secret(url.id()));
        assert_eq!(sealed.dependencies(later.id()).len(), 1);
    }

    #[test]
    fn test_forward_reference_to_unknown_resource() {
        let mut graph = GraphBuilder::new();
        graph.output_of("ghost", "name");
        assert_eq!(
            graph.seal().unwrap_err(),
            GraphError::UnknownResource("ghost".into())
        );
    }

    #[test]
    fn test_output_of_declared_resource_reuses_cell() {
        let mut graph = GraphBuilder::new();
        let a = account(&mut graph, "a");
        assert_eq!(graph.output_of("a", "name"), a.output("name").unwrap());
    }

    #[test]
    fn test_cycle_between_resources_is_rejected() {
        let mut graph = GraphBuilder::new();
        let b_id = graph.output_of("b", "id");
        let a = graph
            .declare(
                "a",
                ResourceArgs::new("test:Node").input("peer", b_id).output("id"),
            )
            .unwrap();
        graph
            .declare(
                "b",
                ResourceArgs::new("test:Node")
                    .input("peer", a.output("id").unwrap())
                    .output("id"),
            )
            .unwrap();

        match graph.seal() {
            Err(GraphError::CyclicDependency { nodes }) => {
                assert!(nodes.contains(&"a".to_string()));
                assert!(nodes.contains(&"b".to_string()));
            }
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn test_foreign_handle_reported_at_seal() {
        let mut other = GraphBuilder::new();
        let foreign = other.constant("x");

        let mut graph = GraphBuilder::new();
        graph.map(foreign, |v| v);
        assert!(matches!(graph.seal(), Err(GraphError::ForeignHandle(_))));
    }

    #[test]
    fn test_resource_waves_group_independent_resources() {
        let mut graph = GraphBuilder::new();
        let a = account(&mut graph, "a");
        account(&mut graph, "c");
        let name = a.output("name").unwrap();
        let derived = graph.concat([name]);
        graph
            .declare("b", ResourceArgs::new("storage:Container").input("account", derived))
            .unwrap();

        let sealed = graph.seal().unwrap();
        assert_eq!(sealed.resource_waves(), vec![vec!["a", "c"], vec!["b"]]);
    }

    #[test]
    fn test_render_template() {
        let parts = Value::List(vec![Value::from("app"), Value::from("rg")]);
        assert_eq!(
            render_template("az webapp log tail --name {} --resource-group {}", &parts).unwrap(),
            Value::from("az webapp log tail --name app --resource-group rg")
        );
        assert!(render_template("{} {} {}", &parts).is_err());
    }

    #[test]
    fn test_export_relabels_generated_cells() {
        let mut graph = GraphBuilder::new();
        let c = graph.constant("x");
        let joined = graph.concat([c]);
        graph.export("joined", joined).unwrap();
        let sealed = graph.seal().unwrap();
        assert_eq!(sealed.label(joined.id()), "joined");
    }
}
