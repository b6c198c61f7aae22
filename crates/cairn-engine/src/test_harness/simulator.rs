//! Simulated cloud
//!
//! A [`ResourceProvider`] that fabricates plausible outputs for any resource
//! kind after a random, seeded latency. Failures can be injected per
//! resource name. Physical names and keys are derived from the seed and the
//! logical name, so the same seed always produces the same outputs.

use crate::provider::{CreateRequest, ProviderError, ProviderRegistry, ResourceProvider};
use crate::value::{PropertyMap, Value};
use parking_lot::Mutex;
use rand::{rngs::StdRng, Rng, SeedableRng};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

/// Kind prefixes routed to the simulated cloud by [`SimulatedCloud::registry`]
pub const KIND_PREFIXES: &[&str] = &["resources:", "storage:", "insights:", "web:", "sql:"];

/// Subscription id used in simulated resource ids
const SUBSCRIPTION: &str = "00000000-0000-0000-0000-000000000000";

/// Simulator configuration
#[derive(Debug, Clone)]
pub struct SimulatorConfig {
    /// Random seed for latencies and generated names
    pub seed: u64,
    /// Shortest simulated provider call
    pub min_latency: Duration,
    /// Longest simulated provider call
    pub max_latency: Duration,
    /// Logical names of resources whose creation fails
    pub fail: BTreeSet<String>,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            min_latency: Duration::from_millis(20),
            max_latency: Duration::from_millis(120),
            fail: BTreeSet::new(),
        }
    }
}

impl SimulatorConfig {
    /// Fail creation of `resource`
    #[must_use]
    pub fn failing(mut self, resource: impl Into<String>) -> Self {
        self.fail.insert(resource.into());
        self
    }

    /// Use a fixed latency for every call
    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.min_latency = latency;
        self.max_latency = latency;
        self
    }
}

/// One simulated provider call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimulatedCall {
    /// Logical resource name
    pub resource: String,
    /// Resource kind
    pub kind: String,
    /// Simulated latency
    pub latency: Duration,
    /// Whether the call failed
    pub failed: bool,
}

/// Fake cloud backing every resource kind
#[derive(Debug)]
pub struct SimulatedCloud {
    config: SimulatorConfig,
    rng: Mutex<StdRng>,
    calls: Mutex<Vec<SimulatedCall>>,
}

impl SimulatedCloud {
    /// Create a simulator
    #[must_use]
    pub fn new(config: SimulatorConfig) -> Self {
        let rng = StdRng::seed_from_u64(config.seed);
        Self {
            config,
            rng: Mutex::new(rng),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Registry routing every known kind prefix to this simulator
    #[must_use]
    pub fn registry(self: &Arc<Self>) -> ProviderRegistry {
        let mut registry = ProviderRegistry::new();
        for prefix in KIND_PREFIXES {
            let provider: Arc<dyn ResourceProvider> = Arc::clone(self) as Arc<dyn ResourceProvider>;
            registry.register_prefix(*prefix, provider);
        }
        registry
    }

    /// Calls made so far, in completion order
    #[must_use]
    pub fn calls(&self) -> Vec<SimulatedCall> {
        self.calls.lock().clone()
    }

    /// Physical name the simulator assigns to a logical name
    #[must_use]
    pub fn physical_name(&self, logical: &str) -> String {
        let digest = self.digest(&[logical, "name"]);
        format!("{logical}{}", &digest[..8])
    }

    fn next_latency(&self) -> Duration {
        let min = u64::try_from(self.config.min_latency.as_millis()).unwrap_or(u64::MAX);
        let max = u64::try_from(self.config.max_latency.as_millis()).unwrap_or(u64::MAX);
        if max <= min {
            return Duration::from_millis(min);
        }
        Duration::from_millis(self.rng.lock().gen_range(min..=max))
    }

    fn digest(&self, parts: &[&str]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.config.seed.to_le_bytes());
        for part in parts {
            hasher.update(part.as_bytes());
            hasher.update([0]);
        }
        hex::encode(hasher.finalize())
    }

    fn output_value(&self, request: &CreateRequest, property: &str) -> Value {
        let physical = self.physical_name(&request.name);
        let group = request
            .inputs
            .get("resourceGroupName")
            .map_or_else(|| physical.clone(), ToString::to_string);

        match property {
            "name" => Value::Str(physical),
            "id" => Value::Str(format!(
                "/subscriptions/{SUBSCRIPTION}/resourceGroups/{group}/providers/{}/{physical}",
                request.kind
            )),
            "defaultHostName" => Value::Str(format!("{physical}.azurewebsites.net")),
            "fullyQualifiedDomainName" => Value::Str(format!("{physical}.database.windows.net")),
            p if p.ends_with("Token") || p.ends_with("Key") => {
                Value::Str(self.digest(&[&request.name, p]))
            }
            p => request
                .inputs
                .get(p)
                .cloned()
                .unwrap_or_else(|| Value::Str(format!("{physical}-{p}"))),
        }
    }
}

#[async_trait::async_trait]
impl ResourceProvider for SimulatedCloud {
    fn name(&self) -> &str {
        "simulated-cloud"
    }

    async fn create(&self, request: &CreateRequest) -> Result<PropertyMap, ProviderError> {
        let latency = self.next_latency();
        tokio::time::sleep(latency).await;

        let failed = self.config.fail.contains(&request.name);
        self.calls.lock().push(SimulatedCall {
            resource: request.name.clone(),
            kind: request.kind.clone(),
            latency,
            failed,
        });
        if failed {
            return Err(ProviderError::new(format!(
                "simulated failure creating {}",
                request.kind
            )));
        }

        Ok(request
            .outputs
            .iter()
            .map(|p| (p.clone(), self.output_value(request, p)))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(name: &str, kind: &str, outputs: &[&str]) -> CreateRequest {
        CreateRequest {
            name: name.to_string(),
            kind: kind.to_string(),
            inputs: PropertyMap::new(),
            secret_inputs: BTreeSet::new(),
            outputs: outputs.iter().map(ToString::to_string).collect(),
        }
    }

    #[test]
    fn test_same_seed_same_names() {
        let a = SimulatedCloud::new(SimulatorConfig::default());
        let b = SimulatedCloud::new(SimulatorConfig::default());
        let c = SimulatedCloud::new(SimulatorConfig {
            seed: 7,
            ..SimulatorConfig::default()
        });
        assert_eq!(a.physical_name("appservicesa"), b.physical_name("appservicesa"));
        assert_ne!(a.physical_name("appservicesa"), c.physical_name("appservicesa"));
        assert!(a.physical_name("appservicesa").starts_with("appservicesa"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_outputs_follow_property_names() {
        let cloud = SimulatedCloud::new(SimulatorConfig::default());
        let outputs = cloud
            .create(&request(
                "appservice-flask",
                "web:WebApp",
                &["name", "defaultHostName", "instrumentationKey", "other"],
            ))
            .await
            .unwrap();

        let name = outputs["name"].to_string();
        assert_eq!(outputs["defaultHostName"].to_string(), format!("{name}.azurewebsites.net"));
        assert_eq!(outputs["instrumentationKey"].to_string().len(), 64);
        assert_eq!(outputs["other"].to_string(), format!("{name}-other"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_injected_failure() {
        let cloud = SimulatedCloud::new(SimulatorConfig::default().failing("appservicerg"));
        let err = cloud
            .create(&request("appservicerg", "resources:ResourceGroup", &["name"]))
            .await
            .unwrap_err();
        assert!(err.message.contains("resources:ResourceGroup"));
        assert!(cloud.calls()[0].failed);
    }

    #[test]
    fn test_registry_routes_known_prefixes() {
        let cloud = Arc::new(SimulatedCloud::new(SimulatorConfig::default()));
        let registry = cloud.registry();
        assert!(registry.contains("storage:StorageAccount"));
        assert!(registry.contains("sql:Database"));
        assert!(!registry.contains("dns:Zone"));
    }
}
