//! Testing utilities for the Cairn workspace
//!
//! Scripted providers, secret channels and graph helpers shared by the
//! integration tests.

#![allow(missing_docs)]

use cairn_engine::export::SecureChannel;
use cairn_engine::provider::{CreateRequest, ProviderError, ProviderRegistry, ResourceProvider};
use cairn_engine::value::{PropertyMap, Value};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Default)]
struct Script {
    outputs: PropertyMap,
    latency: Option<Duration>,
    failure: Option<String>,
}

/// One recorded provider call
#[derive(Debug, Clone)]
pub struct CallRecord {
    pub resource: String,
    pub kind: String,
    pub inputs: PropertyMap,
    pub secret_inputs: BTreeSet<String>,
    pub started: Instant,
    pub finished: Instant,
}

/// Provider whose behaviour is scripted per resource name
///
/// Unscripted outputs resolve to `"<resource>.<property>"`.
#[derive(Debug, Default)]
pub struct ScriptedProvider {
    scripts: HashMap<String, Script>,
    default_latency: Duration,
    calls: Mutex<Vec<CallRecord>>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Output values returned for `resource`
    #[must_use]
    pub fn outputs<I, K, V>(mut self, resource: &str, outputs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Value>,
    {
        let script = self.scripts.entry(resource.to_string()).or_default();
        script
            .outputs
            .extend(outputs.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    /// Simulated call latency for `resource`
    #[must_use]
    pub fn latency(mut self, resource: &str, latency: Duration) -> Self {
        self.scripts.entry(resource.to_string()).or_default().latency = Some(latency);
        self
    }

    /// Latency for resources without their own
    #[must_use]
    pub fn default_latency(mut self, latency: Duration) -> Self {
        self.default_latency = latency;
        self
    }

    /// Make creation of `resource` fail
    #[must_use]
    pub fn fail(mut self, resource: &str, message: &str) -> Self {
        self.scripts.entry(resource.to_string()).or_default().failure = Some(message.to_string());
        self
    }

    /// Registry sending every kind to this provider
    pub fn into_registry(self) -> (Arc<Self>, ProviderRegistry) {
        let provider = Arc::new(self);
        let shared: Arc<dyn ResourceProvider> = Arc::clone(&provider) as Arc<dyn ResourceProvider>;
        let registry = ProviderRegistry::with_fallback(shared);
        (provider, registry)
    }

    pub fn calls(&self) -> Vec<CallRecord> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn was_called(&self, resource: &str) -> bool {
        self.calls.lock().iter().any(|c| c.resource == resource)
    }

    pub fn call(&self, resource: &str) -> Option<CallRecord> {
        self.calls.lock().iter().find(|c| c.resource == resource).cloned()
    }

    /// Highest number of calls that were in flight at once
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl ResourceProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn create(&self, request: &CreateRequest) -> Result<PropertyMap, ProviderError> {
        let started = Instant::now();
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        let script = self.scripts.get(&request.name).cloned().unwrap_or_default();
        tokio::time::sleep(script.latency.unwrap_or(self.default_latency)).await;

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.calls.lock().push(CallRecord {
            resource: request.name.clone(),
            kind: request.kind.clone(),
            inputs: request.inputs.clone(),
            secret_inputs: request.secret_inputs.clone(),
            started,
            finished: Instant::now(),
        });

        if let Some(message) = script.failure {
            return Err(ProviderError::new(message));
        }
        Ok(request
            .outputs
            .iter()
            .map(|p| {
                let value = script
                    .outputs
                    .get(p)
                    .cloned()
                    .unwrap_or_else(|| Value::from(format!("{}.{p}", request.name)));
                (p.clone(), value)
            })
            .collect())
    }
}

/// Secure channel that keeps everything it receives
#[derive(Debug, Default)]
pub struct CollectingChannel {
    pub delivered: Vec<(String, Value)>,
}

impl CollectingChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.delivered
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
    }
}

impl SecureChannel for CollectingChannel {
    fn deliver(&mut self, name: &str, value: &Value) {
        self.delivered.push((name.to_string(), value.clone()));
    }
}

/// Shorthand for a millisecond duration
pub fn ms(millis: u64) -> Duration {
    Duration::from_millis(millis)
}
