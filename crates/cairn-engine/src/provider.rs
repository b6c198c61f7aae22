//! Resource providers
//!
//! The engine does not know what a storage account or a web app is. Each
//! resource kind is backed by a [`ResourceProvider`] whose `create` call takes
//! fully resolved inputs and returns the resource's output properties.
//!
//! Retry and timeout policy belong to the provider; the engine treats any
//! error as terminal for the node.

use crate::value::PropertyMap;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

/// Everything a provider needs to create one resource
#[derive(Debug, Clone)]
pub struct CreateRequest {
    /// Logical resource name
    pub name: String,
    /// Provider kind token, e.g. `storage:StorageAccount`
    pub kind: String,
    /// Resolved input properties
    pub inputs: PropertyMap,
    /// Names of inputs whose values are secret
    pub secret_inputs: BTreeSet<String>,
    /// Output properties the declaration expects back
    pub outputs: Vec<String>,
}

/// Provider failure
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct ProviderError {
    /// Human-readable cause
    pub message: String,
    /// Hint that a retry might succeed (informational only)
    pub retryable: bool,
}

impl ProviderError {
    /// Non-retryable error
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }

    /// Error the provider considers transient
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }
}

/// Backend for one or more resource kinds
#[async_trait::async_trait]
pub trait ResourceProvider: Send + Sync {
    /// Name used in logs
    fn name(&self) -> &str;

    /// Create the resource and return its output properties.
    ///
    /// Every name in `request.outputs` must be present in the result;
    /// additional properties are ignored.
    async fn create(&self, request: &CreateRequest) -> Result<PropertyMap, ProviderError>;
}

/// Maps resource kinds to providers
///
/// Lookup order: exact kind, longest registered prefix (e.g. `storage:`),
/// then the fallback provider.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    exact: HashMap<String, Arc<dyn ResourceProvider>>,
    prefixes: Vec<(String, Arc<dyn ResourceProvider>)>,
    fallback: Option<Arc<dyn ResourceProvider>>,
}

impl ProviderRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry that sends every kind to `provider`
    #[must_use]
    pub fn with_fallback(provider: Arc<dyn ResourceProvider>) -> Self {
        Self {
            fallback: Some(provider),
            ..Self::default()
        }
    }

    /// Register a provider for one exact kind
    pub fn register(&mut self, kind: impl Into<String>, provider: Arc<dyn ResourceProvider>) {
        self.exact.insert(kind.into(), provider);
    }

    /// Register a provider for every kind starting with `prefix`
    pub fn register_prefix(
        &mut self,
        prefix: impl Into<String>,
        provider: Arc<dyn ResourceProvider>,
    ) {
        self.prefixes.push((prefix.into(), provider));
        self.prefixes.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
    }

    /// Set the provider used when nothing else matches
    pub fn set_fallback(&mut self, provider: Arc<dyn ResourceProvider>) {
        self.fallback = Some(provider);
    }

    /// Provider responsible for `kind`
    #[must_use]
    pub fn get(&self, kind: &str) -> Option<Arc<dyn ResourceProvider>> {
        if let Some(p) = self.exact.get(kind) {
            return Some(Arc::clone(p));
        }
        self.prefixes
            .iter()
            .find(|(prefix, _)| kind.starts_with(prefix.as_str()))
            .map(|(_, p)| Arc::clone(p))
            .or_else(|| self.fallback.clone())
    }

    /// Check if some provider handles `kind`
    #[inline]
    #[must_use]
    pub fn contains(&self, kind: &str) -> bool {
        self.get(kind).is_some()
    }
}

impl fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("exact", &self.exact.keys().collect::<Vec<_>>())
            .field(
                "prefixes",
                &self.prefixes.iter().map(|(p, _)| p).collect::<Vec<_>>(),
            )
            .field("fallback", &self.fallback.as_ref().map(|p| p.name()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Named(&'static str);

    #[async_trait::async_trait]
    impl ResourceProvider for Named {
        fn name(&self) -> &str {
            self.0
        }

        async fn create(&self, _request: &CreateRequest) -> Result<PropertyMap, ProviderError> {
            Ok(PropertyMap::new())
        }
    }

    #[test]
    fn test_lookup_order() {
        let mut registry = ProviderRegistry::with_fallback(Arc::new(Named("fallback")));
        registry.register_prefix("storage:", Arc::new(Named("storage")));
        registry.register_prefix("storage:Blob", Arc::new(Named("blob")));
        registry.register("storage:Blob", Arc::new(Named("exact")));

        assert_eq!(registry.get("storage:Blob").unwrap().name(), "exact");
        assert_eq!(registry.get("storage:BlobContainer").unwrap().name(), "blob");
        assert_eq!(registry.get("storage:StorageAccount").unwrap().name(), "storage");
        assert_eq!(registry.get("web:WebApp").unwrap().name(), "fallback");
    }

    #[test]
    fn test_empty_registry_has_no_provider() {
        let registry = ProviderRegistry::new();
        assert!(!registry.contains("web:WebApp"));
    }
}
