//! Configuration
//!
//! Two kinds of configuration live here:
//!
//! - **Stack values** read by a deployment program ([`Config`] over a
//!   [`ConfigSource`]). Values can come from memory, the environment or a
//!   TOML file, and are chained with [`ChainConfig`]. A required secret is
//!   seeded into the graph as a secret cell, so it never needs to be handled
//!   as a plain string.
//! - **Engine settings** ([`EngineConfig`]): scheduler and logging sections.
//!
//! Both may share one file:
//!
//! ```toml
//! [scheduler]
//! max_parallelism = 8
//! failure_policy = "fail-fast"
//!
//! [logging]
//! filter = "cairn_engine=debug"
//!
//! [values]
//! location = "westeurope"
//!
//! [secrets]
//! sqlPassword = "..."
//! ```

use crate::cell::Output;
use crate::error::ConfigError;
use crate::graph::GraphBuilder;
use crate::logging::LoggingConfig;
use crate::scheduler::SchedulerConfig;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// A source of named string values
pub trait ConfigSource: Send + Sync {
    /// Name used in logs
    fn name(&self) -> &str;

    /// Value for `key`, if this source has one
    fn get(&self, key: &str) -> Option<String>;

    /// Whether this source holds `key` as a secret
    fn is_secret(&self, _key: &str) -> bool {
        false
    }
}

/// In-memory values, mostly for tests and embedding
#[derive(Debug, Clone, Default)]
pub struct MemoryConfig {
    values: HashMap<String, String>,
    secrets: HashSet<String>,
}

impl MemoryConfig {
    /// Empty source
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a plain value
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set(key, value);
        self
    }

    /// Add a secret value
    #[must_use]
    pub fn with_secret(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let key = key.into();
        self.secrets.insert(key.clone());
        self.set(key, value);
        self
    }

    /// Set a plain value
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }
}

impl ConfigSource for MemoryConfig {
    fn name(&self) -> &str {
        "memory"
    }

    fn get(&self, key: &str) -> Option<String> {
        self.values.get(key).cloned()
    }

    fn is_secret(&self, key: &str) -> bool {
        self.secrets.contains(key)
    }
}

/// Environment variables: `sqlPassword` is read from `CAIRN_SQLPASSWORD`,
/// `app.sku-name` from `CAIRN_APP_SKU_NAME`. Empty variables count as unset.
#[derive(Debug, Clone)]
pub struct EnvConfig {
    prefix: String,
}

impl EnvConfig {
    /// Source using the `CAIRN_` prefix
    #[must_use]
    pub fn new() -> Self {
        Self::with_prefix("CAIRN_")
    }

    /// Source using a custom prefix
    #[must_use]
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Environment variable consulted for `key`
    #[must_use]
    pub fn var_name(&self, key: &str) -> String {
        let key: String = key
            .chars()
            .map(|c| match c {
                '.' | '-' => '_',
                c => c.to_ascii_uppercase(),
            })
            .collect();
        format!("{}{key}", self.prefix)
    }
}

impl Default for EnvConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigSource for EnvConfig {
    fn name(&self) -> &str {
        "env"
    }

    fn get(&self, key: &str) -> Option<String> {
        std::env::var(self.var_name(key))
            .ok()
            .filter(|v| !v.is_empty())
    }
}

#[derive(Debug, Default, Deserialize)]
struct StackFile {
    #[serde(default)]
    values: BTreeMap<String, toml::Value>,
    #[serde(default)]
    secrets: BTreeMap<String, toml::Value>,
}

/// `[values]` and `[secrets]` tables of a TOML file
///
/// Non-string TOML values are read in their TOML text form.
#[derive(Debug, Clone, Default)]
pub struct FileConfig {
    path: Option<PathBuf>,
    values: BTreeMap<String, String>,
    secrets: BTreeMap<String, String>,
}

impl FileConfig {
    /// Read and parse a file
    ///
    /// # Errors
    /// `ConfigError::Io` if the file cannot be read, `ConfigError::Parse` if it
    /// is not valid TOML.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::from_toml_str(&text)?;
        config.path = Some(path.to_path_buf());
        Ok(config)
    }

    /// Parse TOML text
    ///
    /// # Errors
    /// `ConfigError::Parse` if the text is not valid TOML.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let file: StackFile = toml::from_str(text)?;
        Ok(Self {
            path: None,
            values: flatten(file.values),
            secrets: flatten(file.secrets),
        })
    }

    /// File this source was loaded from
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

fn flatten(table: BTreeMap<String, toml::Value>) -> BTreeMap<String, String> {
    table
        .into_iter()
        .map(|(k, v)| {
            let text = match v {
                toml::Value::String(s) => s,
                other => other.to_string(),
            };
            (k, text)
        })
        .collect()
}

impl ConfigSource for FileConfig {
    fn name(&self) -> &str {
        "file"
    }

    fn get(&self, key: &str) -> Option<String> {
        self.secrets
            .get(key)
            .or_else(|| self.values.get(key))
            .cloned()
    }

    fn is_secret(&self, key: &str) -> bool {
        self.secrets.contains_key(key)
    }
}

/// Several sources tried in order; the first one holding a key wins
#[derive(Clone, Default)]
pub struct ChainConfig {
    sources: Vec<Arc<dyn ConfigSource>>,
}

impl ChainConfig {
    /// Chain the given sources, highest precedence first
    #[must_use]
    pub fn new(sources: Vec<Arc<dyn ConfigSource>>) -> Self {
        Self { sources }
    }

    /// Append a lower-precedence source
    pub fn push(&mut self, source: Arc<dyn ConfigSource>) {
        self.sources.push(source);
    }

    /// Source that would answer `key`
    #[must_use]
    pub fn find_source(&self, key: &str) -> Option<&Arc<dyn ConfigSource>> {
        self.sources.iter().find(|s| s.get(key).is_some())
    }
}

impl std::fmt::Debug for ChainConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.sources.iter().map(|s| s.name()))
            .finish()
    }
}

impl ConfigSource for ChainConfig {
    fn name(&self) -> &str {
        "chain"
    }

    fn get(&self, key: &str) -> Option<String> {
        self.sources.iter().find_map(|s| s.get(key))
    }

    fn is_secret(&self, key: &str) -> bool {
        self.find_source(key).is_some_and(|s| s.is_secret(key))
    }
}

/// Stack values as seen by a deployment program
#[derive(Clone)]
pub struct Config {
    source: Arc<dyn ConfigSource>,
}

impl Config {
    /// Read values from `source`
    pub fn new(source: impl ConfigSource + 'static) -> Self {
        Self {
            source: Arc::new(source),
        }
    }

    /// Read values from a shared source
    #[must_use]
    pub fn from_source(source: Arc<dyn ConfigSource>) -> Self {
        Self { source }
    }

    /// Optional value
    #[must_use]
    pub fn get(&self, key: &str) -> Option<String> {
        self.source.get(key)
    }

    /// Required value
    ///
    /// # Errors
    /// `ConfigError::Missing` if no source has `key`.
    pub fn require(&self, key: &str) -> Result<String, ConfigError> {
        let value = self
            .source
            .get(key)
            .ok_or_else(|| ConfigError::Missing(key.to_string()))?;
        tracing::debug!(key, source = self.source.name(), "read configuration value");
        Ok(value)
    }

    /// Required value, seeded into `graph` as a secret cell
    ///
    /// # Errors
    /// `ConfigError::Missing` if no source has `key`.
    pub fn require_secret(
        &self,
        graph: &mut GraphBuilder,
        key: &str,
    ) -> Result<Output, ConfigError> {
        let value = self.require(key)?;
        Ok(graph.secret(value))
    }

    /// Required value as a cell; secret if its source holds it as a secret
    ///
    /// # Errors
    /// `ConfigError::Missing` if no source has `key`.
    pub fn output(&self, graph: &mut GraphBuilder, key: &str) -> Result<Output, ConfigError> {
        let value = self.require(key)?;
        if self.source.is_secret(key) {
            Ok(graph.secret(value))
        } else {
            Ok(graph.constant(value))
        }
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("source", &self.source.name())
            .finish()
    }
}

/// Engine settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// `[scheduler]`
    pub scheduler: SchedulerConfig,
    /// `[logging]`
    pub logging: LoggingConfig,
}

impl EngineConfig {
    /// Parse and validate TOML text; other tables are ignored
    ///
    /// # Errors
    /// `ConfigError::Parse` or `ConfigError::Invalid`.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a file
    ///
    /// # Errors
    /// `ConfigError::Io`, `ConfigError::Parse` or `ConfigError::Invalid`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Check cross-field constraints
    ///
    /// # Errors
    /// `ConfigError::Invalid` describing the first bad setting.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.scheduler.validate()?;
        if self.logging.filter.trim().is_empty() {
            return Err(ConfigError::Invalid("logging.filter must not be empty".to_string()));
        }
        Ok(())
    }
}
