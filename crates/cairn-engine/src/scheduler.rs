//! Resolution scheduler
//!
//! The scheduler drives a [`SealedGraph`] to completion. It is event driven:
//! a node becomes ready when its last dependency resolves, derived cells are
//! evaluated inline on the coordinating task, and resource creation is
//! spawned onto a [`JoinSet`] bounded by a semaphore. Independent resources
//! are therefore created concurrently and total wall time approaches the
//! critical path of the graph.
//!
//! # Failure handling
//!
//! A failed node marks every transitive dependent `Failed` with a
//! [`ResolutionError::DependencyFailure`] naming the origin. Under
//! [`FailurePolicy::Continue`] independent branches keep going; under
//! [`FailurePolicy::FailFast`] no new provider call starts after the first
//! failure and whatever is left is marked [`ResolutionError::Cancelled`].
//!
//! Every slot is written exactly once. A resource and all of its output
//! cells are written under one set of locks, so no observer sees a partially
//! created resource.

use crate::cell::{Cell, CellKind, Output, Slot};
use crate::error::{ConfigError, ResolutionError, RunError};
use crate::graph::{GraphBuilder, Node, SealedGraph};
use crate::logging::Journal;
use crate::provider::{CreateRequest, ProviderRegistry, ResourceProvider};
use crate::resource::ResourceNode;
use crate::secret::{Redacted, REDACTED};
use crate::types::{NodeId, NodeState};
use crate::value::{PropertyMap, Value};
use futures::FutureExt;
use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

/// What to do with the rest of the graph once a node fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailurePolicy {
    /// Keep resolving everything that does not depend on the failure
    #[default]
    Continue,
    /// Start no new provider calls after the first failure
    FailFast,
}

/// `[scheduler]` section of the engine configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Upper bound on concurrent provider calls
    pub max_parallelism: usize,
    /// Behaviour after a failure
    pub failure_policy: FailurePolicy,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_parallelism: 16,
            failure_policy: FailurePolicy::Continue,
        }
    }
}

impl SchedulerConfig {
    /// Reject settings the scheduler cannot honour
    ///
    /// # Errors
    /// `ConfigError::Invalid` if `max_parallelism` is zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_parallelism == 0 {
            return Err(ConfigError::Invalid(
                "scheduler.max_parallelism must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Per-run shared state: the graph, one slot per node and the journal
#[derive(Debug)]
struct RunState {
    graph: SealedGraph,
    slots: Vec<Mutex<Slot>>,
    journal: Journal,
    halted: AtomicBool,
}

impl RunState {
    fn new(graph: SealedGraph) -> Self {
        let slots = (0..graph.node_count())
            .map(|_| Mutex::new(Slot::pending()))
            .collect();
        Self {
            graph,
            slots,
            journal: Journal::new(),
            halted: AtomicBool::new(false),
        }
    }

    fn slot(&self, id: NodeId) -> MutexGuard<'_, Slot> {
        self.slots[id.index()].lock()
    }

    fn state(&self, id: NodeId) -> NodeState {
        self.slot(id).state
    }

    fn value(&self, id: NodeId) -> Option<Value> {
        self.slot(id).value.clone()
    }

    fn is_halted(&self) -> bool {
        self.halted.load(Ordering::Acquire)
    }

    fn halt(&self) {
        self.halted.store(true, Ordering::Release);
    }

    fn begin(&self, id: NodeId, provider: &str) -> bool {
        let mut slot = self.slot(id);
        match slot.begin() {
            Ok(()) => {
                self.journal.record(
                    self.graph.label(id),
                    NodeState::Pending,
                    NodeState::Resolving,
                    format!("provider {provider}"),
                );
                true
            }
            Err(e) => {
                error!(node = self.graph.label(id), error = %e, "rejected slot transition");
                false
            }
        }
    }

    fn resolve(&self, id: NodeId, value: Value) {
        let detail = Redacted::new(&value, self.graph.is_secret(id)).to_string();
        let mut slot = self.slot(id);
        self.write_resolved(id, &mut slot, value, detail);
    }

    fn write_resolved(&self, id: NodeId, slot: &mut Slot, value: Value, detail: String) {
        let from = slot.state;
        match slot.resolve(value) {
            Ok(()) => {
                self.journal
                    .record(self.graph.label(id), from, NodeState::Resolved, detail);
            }
            Err(e) => error!(node = self.graph.label(id), error = %e, "rejected slot transition"),
        }
    }

    fn fail(&self, id: NodeId, failure: ResolutionError, cause: Option<NodeId>) -> bool {
        let mut slot = self.slot(id);
        let from = slot.state;
        let detail = failure.to_string();
        match slot.fail(failure) {
            Ok(()) => {
                slot.cause = cause;
                self.journal
                    .record(self.graph.label(id), from, NodeState::Failed, detail);
                true
            }
            Err(e) => {
                error!(node = self.graph.label(id), error = %e, "rejected slot transition");
                false
            }
        }
    }

    /// Write a created resource and all of its output cells at once.
    fn complete_resource(&self, id: NodeId, outputs: &PropertyMap) {
        let Node::Resource(node) = self.graph.node(id) else {
            return;
        };

        // Lock in ascending id order; the resource precedes its outputs.
        let mut ids: Vec<NodeId> = std::iter::once(id)
            .chain(node.outputs.values().copied())
            .collect();
        ids.sort_unstable();
        let mut guards: Vec<(NodeId, MutexGuard<'_, Slot>)> =
            ids.into_iter().map(|n| (n, self.slot(n))).collect();

        for (nid, slot) in &mut guards {
            if *nid == id {
                let declared: PropertyMap = node
                    .outputs
                    .keys()
                    .filter_map(|p| outputs.get(p).map(|v| (p.clone(), v.clone())))
                    .collect();
                let detail = format!(
                    "outputs: {}",
                    node.outputs.keys().cloned().collect::<Vec<_>>().join(", ")
                );
                self.write_resolved(id, slot, Value::Map(declared), detail);
            } else {
                let value = node
                    .outputs
                    .iter()
                    .find(|(_, out)| **out == *nid)
                    .and_then(|(property, _)| outputs.get(property))
                    .cloned()
                    .unwrap_or(Value::Null);
                let detail = Redacted::new(&value, self.graph.is_secret(*nid)).to_string();
                self.write_resolved(*nid, slot, value, detail);
            }
        }
    }
}

/// How a spawned resource task ended
enum Completion {
    Created,
    Failed(ResolutionError),
    NotStarted,
}

/// Readiness bookkeeping, owned by the coordinating task
struct Coordinator {
    state: Arc<RunState>,
    remaining: Vec<usize>,
    ready: VecDeque<NodeId>,
    policy: FailurePolicy,
}

impl Coordinator {
    fn new(state: Arc<RunState>, policy: FailurePolicy) -> Self {
        let graph = &state.graph;
        let remaining: Vec<usize> = (0..graph.node_count())
            .map(|i| graph.dependencies(NodeId::from_index(i)).len())
            .collect();
        let ready = graph
            .topological_order()
            .iter()
            .copied()
            .filter(|id| remaining[id.index()] == 0)
            .collect();
        Self {
            state,
            remaining,
            ready,
            policy,
        }
    }

    /// Count down the dependents of a resolved node
    fn release(&mut self, id: NodeId) {
        for &dependent in self.state.graph.dependents(id) {
            let left = &mut self.remaining[dependent.index()];
            *left = left.saturating_sub(1);
            if *left == 0 && self.state.state(dependent) != NodeState::Failed {
                self.ready.push_back(dependent);
            }
        }
    }

    fn evaluate(&mut self, id: NodeId, cell: &Cell) {
        if let CellKind::ResourceOutput { .. } = cell.kind {
            // Already written together with its resource
            self.release(id);
            return;
        }

        let inputs: Option<Vec<Value>> = cell.deps.iter().map(|d| self.state.value(*d)).collect();
        let result = match inputs {
            None => Err("input is not resolved".to_string()),
            Some(values) => {
                let refs: Vec<&Value> = values.iter().collect();
                std::panic::catch_unwind(AssertUnwindSafe(|| cell.evaluate(&refs)))
                    .unwrap_or_else(|_| Err("combinator panicked".to_string()))
            }
        };

        match result {
            Ok(value) => {
                trace!(
                    node = %cell.label,
                    value = %Redacted::new(&value, cell.secret),
                    "resolved cell"
                );
                self.state.resolve(id, value);
                self.release(id);
            }
            Err(message) => {
                // The message may quote the secret input it rejected
                let message = if cell.secret {
                    REDACTED.to_string()
                } else {
                    message
                };
                self.fail_origin(
                    id,
                    ResolutionError::CombinatorFailure {
                        node: cell.label.clone(),
                        message,
                    },
                );
            }
        }
    }

    /// Record a failure that started at `id` and fail everything downstream
    fn fail_origin(&mut self, id: NodeId, failure: ResolutionError) {
        let graph = &self.state.graph;
        warn!(node = graph.label(id), error = %failure, "node failed");
        if !self.state.fail(id, failure, None) {
            return;
        }

        let origin = graph.label(id).to_string();
        let mut stack: Vec<NodeId> = graph.dependents(id).to_vec();
        let mut skipped = 0usize;
        while let Some(dependent) = stack.pop() {
            if self.state.state(dependent) != NodeState::Pending {
                continue;
            }
            let failure = ResolutionError::DependencyFailure {
                node: graph.label(dependent).to_string(),
                origin: origin.clone(),
            };
            if self.state.fail(dependent, failure, Some(id)) {
                skipped += 1;
                stack.extend_from_slice(graph.dependents(dependent));
            }
        }
        if skipped > 0 {
            debug!(origin = %origin, skipped, "failed dependents");
        }

        if self.policy == FailurePolicy::FailFast && !self.state.is_halted() {
            warn!(origin = %origin, "fail-fast: no further resources will be started");
            self.state.halt();
        }
    }

    /// Mark whatever never got started as cancelled
    fn cancel_remaining(&self) -> usize {
        let graph = &self.state.graph;
        let mut cancelled = 0;
        for &id in graph.topological_order() {
            if self.state.state(id) == NodeState::Pending {
                let failure = ResolutionError::Cancelled {
                    node: graph.label(id).to_string(),
                };
                if self.state.fail(id, failure, None) {
                    cancelled += 1;
                }
            }
        }
        cancelled
    }
}

/// Drives sealed graphs against a set of providers
#[derive(Debug, Clone)]
pub struct Scheduler {
    providers: ProviderRegistry,
    config: SchedulerConfig,
}

impl Scheduler {
    /// Scheduler with default settings
    #[must_use]
    pub fn new(providers: ProviderRegistry) -> Self {
        Self::with_config(providers, SchedulerConfig::default())
    }

    /// Scheduler with explicit settings
    #[must_use]
    pub fn with_config(providers: ProviderRegistry, config: SchedulerConfig) -> Self {
        Self { providers, config }
    }

    /// Active settings
    #[must_use]
    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Seal `graph` and run it
    ///
    /// # Errors
    /// `RunError::Construction` if sealing fails; no provider is called then.
    pub async fn deploy(&self, graph: GraphBuilder) -> Result<RunOutcome, RunError> {
        let sealed = graph.seal()?;
        Ok(self.run(sealed).await)
    }

    /// Resolve every node of `graph`.
    ///
    /// Always returns; every node ends in `Resolved` or `Failed`. Use
    /// [`ExportSink`](crate::export::ExportSink) to turn the outcome into
    /// exported values.
    pub async fn run(&self, graph: SealedGraph) -> RunOutcome {
        let started = Instant::now();
        let state = Arc::new(RunState::new(graph));
        let mut coordinator = Coordinator::new(Arc::clone(&state), self.config.failure_policy);
        let semaphore = Arc::new(Semaphore::new(self.config.max_parallelism.max(1)));
        let mut in_flight: JoinSet<(NodeId, Completion)> = JoinSet::new();

        info!(
            graph = %state.graph.graph_id().0,
            nodes = state.graph.node_count(),
            resources = state.graph.resource_count(),
            max_parallelism = self.config.max_parallelism,
            policy = ?self.config.failure_policy,
            "starting run"
        );

        loop {
            while let Some(id) = coordinator.ready.pop_front() {
                match state.graph.node(id) {
                    Node::Cell(cell) => coordinator.evaluate(id, cell),
                    Node::Resource(node) if state.is_halted() => {
                        debug!(resource = %node.name, "not started after failure");
                    }
                    Node::Resource(node) => match self.prepare(&state, node) {
                        Ok((provider, request)) => {
                            in_flight.spawn(create_resource(
                                Arc::clone(&state),
                                Arc::clone(&semaphore),
                                id,
                                provider,
                                request,
                            ));
                        }
                        Err(failure) => coordinator.fail_origin(id, failure),
                    },
                }
            }

            let Some(joined) = in_flight.join_next().await else {
                break;
            };
            match joined {
                Ok((id, Completion::Created)) => coordinator.release(id),
                Ok((id, Completion::Failed(failure))) => coordinator.fail_origin(id, failure),
                Ok((_, Completion::NotStarted)) => {}
                Err(e) => error!(error = %e, "resource task did not complete"),
            }
        }

        let cancelled = coordinator.cancel_remaining();
        let outcome = RunOutcome {
            state,
            elapsed: started.elapsed(),
        };
        info!(
            resolved = outcome.resolved_count(),
            failed = outcome.failed_count(),
            cancelled,
            elapsed_ms = u64::try_from(outcome.elapsed.as_millis()).unwrap_or(u64::MAX),
            "run finished"
        );
        outcome
    }

    fn prepare(
        &self,
        state: &RunState,
        node: &ResourceNode,
    ) -> Result<(Arc<dyn ResourceProvider>, CreateRequest), ResolutionError> {
        let failure = |message: String| ResolutionError::ExternalResourceFailure {
            resource: node.name.clone(),
            message,
        };

        let provider = self
            .providers
            .get(&node.kind)
            .ok_or_else(|| failure(format!("no provider registered for kind `{}`", node.kind)))?;

        let mut inputs = PropertyMap::new();
        let mut secret_inputs = BTreeSet::new();
        for (property, &dep) in &node.inputs {
            let value = state
                .value(dep)
                .ok_or_else(|| failure(format!("input `{property}` is not resolved")))?;
            if state.graph.is_secret(dep) {
                secret_inputs.insert(property.clone());
            }
            inputs.insert(property.clone(), value);
        }

        Ok((
            provider,
            CreateRequest {
                name: node.name.clone(),
                kind: node.kind.clone(),
                inputs,
                secret_inputs,
                outputs: node.outputs.keys().cloned().collect(),
            },
        ))
    }
}

async fn create_resource(
    state: Arc<RunState>,
    semaphore: Arc<Semaphore>,
    id: NodeId,
    provider: Arc<dyn ResourceProvider>,
    request: CreateRequest,
) -> (NodeId, Completion) {
    let Ok(_permit) = semaphore.acquire_owned().await else {
        return (id, Completion::NotStarted);
    };
    if state.is_halted() || !state.begin(id, provider.name()) {
        return (id, Completion::NotStarted);
    }

    debug!(
        resource = %request.name,
        kind = %request.kind,
        provider = provider.name(),
        "creating resource"
    );
    let started = Instant::now();
    let result = AssertUnwindSafe(provider.create(&request))
        .catch_unwind()
        .await;

    let message = match result {
        Ok(Ok(outputs)) => {
            let missing: Vec<&str> = request
                .outputs
                .iter()
                .filter(|p| !outputs.contains_key(*p))
                .map(String::as_str)
                .collect();
            if missing.is_empty() {
                state.complete_resource(id, &outputs);
                info!(
                    resource = %request.name,
                    elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
                    "created resource"
                );
                return (id, Completion::Created);
            }
            format!("provider returned no value for output(s): {}", missing.join(", "))
        }
        Ok(Err(e)) => {
            debug!(resource = %request.name, retryable = e.retryable, "provider error");
            e.message
        }
        Err(_) => "provider panicked".to_string(),
    };

    (
        id,
        Completion::Failed(ResolutionError::ExternalResourceFailure {
            resource: request.name,
            message,
        }),
    )
}

/// Final state of every node after a run
#[derive(Debug)]
pub struct RunOutcome {
    state: Arc<RunState>,
    elapsed: Duration,
}

impl RunOutcome {
    /// The graph that was run
    #[must_use]
    pub fn graph(&self) -> &SealedGraph {
        &self.state.graph
    }

    /// Final state of a node
    #[must_use]
    pub fn state(&self, id: NodeId) -> NodeState {
        self.state
            .slots
            .get(id.index())
            .map_or(NodeState::Pending, |s| s.lock().state)
    }

    /// Resolved value behind a handle, if it resolved
    ///
    /// Returns plaintext even for secret cells; the caller asked for it
    /// explicitly. Use [`RunOutcome::is_secret`] before displaying it.
    #[must_use]
    pub fn value(&self, output: Output) -> Option<Value> {
        if output.graph != self.state.graph.graph_id() {
            return None;
        }
        self.value_of(output.id)
    }

    /// Resolved value of a node by id
    #[must_use]
    pub fn value_of(&self, id: NodeId) -> Option<Value> {
        self.state
            .slots
            .get(id.index())
            .and_then(|s| s.lock().value.clone())
    }

    /// Whether the value behind a handle is secret
    #[must_use]
    pub fn is_secret(&self, output: Output) -> bool {
        self.state.graph.is_secret(output.id)
    }

    /// Why a node failed
    #[must_use]
    pub fn failure(&self, id: NodeId) -> Option<ResolutionError> {
        self.state
            .slots
            .get(id.index())
            .and_then(|s| s.lock().failure.clone())
    }

    /// The originating failure behind a failed node
    #[must_use]
    pub fn root_cause(&self, id: NodeId) -> Option<ResolutionError> {
        let cause = self.state.slots.get(id.index())?.lock().cause;
        match cause {
            Some(origin) => self.failure(origin),
            None => self.failure(id),
        }
    }

    /// Node id of the failure behind `id` (itself if it failed on its own)
    #[must_use]
    pub fn origin_of(&self, id: NodeId) -> Option<NodeId> {
        let slot = self.state.slots.get(id.index())?.lock();
        match slot.state {
            NodeState::Failed => Some(slot.cause.unwrap_or(id)),
            _ => None,
        }
    }

    /// Failures that started at their own node, in topological order
    #[must_use]
    pub fn origin_failures(&self) -> Vec<(NodeId, ResolutionError)> {
        self.state
            .graph
            .topological_order()
            .iter()
            .filter_map(|&id| {
                self.failure(id)
                    .filter(ResolutionError::is_origin)
                    .map(|f| (id, f))
            })
            .collect()
    }

    /// True if every node resolved
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.failed_count() == 0
    }

    /// Number of resolved nodes
    #[must_use]
    pub fn resolved_count(&self) -> usize {
        self.count(NodeState::Resolved)
    }

    /// Number of failed nodes
    #[must_use]
    pub fn failed_count(&self) -> usize {
        self.count(NodeState::Failed)
    }

    /// Wall time of the run
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    /// Recorded node transitions
    #[must_use]
    pub fn journal(&self) -> &Journal {
        &self.state.journal
    }

    fn count(&self, state: NodeState) -> usize {
        self.state
            .slots
            .iter()
            .filter(|s| s.lock().state == state)
            .count()
    }
}
