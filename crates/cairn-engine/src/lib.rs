//! Cairn engine (cairn-engine)
//!
//! Declarative resource graphs built from deferred values:
//! 1. **Declaration**: combinators and resource declarations build a graph
//!    of cells whose values are not known yet
//! 2. **Sealing**: the graph is validated (cycles, dangling references) and
//!    secrecy is propagated
//! 3. **Resolution**: the scheduler creates resources as soon as their
//!    inputs resolve, independent ones concurrently
//! 4. **Export**: named results are rendered with secret values masked
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use cairn_engine::prelude::*;
//!
//! let mut graph = GraphBuilder::new();
//! let account = graph.declare("acct", ResourceArgs::new("storage:Account").output("name"))?;
//! let token = graph.declare("token", ResourceArgs::new("storage:Sas").secret_output("value"))?;
//! let url = graph.concat([
//!     Input::from("https://"),
//!     account.output("name")?.into(),
//!     "/blob?".into(),
//!     token.output("value")?.into(),
//! ]);
//! graph.export("url", url)?;
//!
//! let outcome = Scheduler::new(providers).deploy(graph).await?;
//! let exports = ExportSink::new().render(&outcome)?;
//! assert_eq!(exports.get("url"), Some(&Rendered::Secret));
//! ```

// Core modules
pub mod cell;
pub mod error;
pub mod graph;
pub mod resource;
pub mod scheduler;
pub mod secret;
pub mod state_machine;
pub mod types;
pub mod value;

// Surfaces
pub mod config;
pub mod export;
pub mod logging;
pub mod provider;

// Test harness
pub mod test_harness;

// Re-exports
pub use error::*;
pub use types::*;

/// Commonly used types
pub mod prelude {
    pub use crate::cell::{Input, Output};
    pub use crate::config::{
        ChainConfig, Config, ConfigSource, EngineConfig, EnvConfig, FileConfig, MemoryConfig,
    };
    pub use crate::error::{ConfigError, GraphError, ResolutionError, RunError};
    pub use crate::export::{
        ExportSink, Rendered, RenderedExports, SecureChannel, SECRET_PLACEHOLDER,
    };
    pub use crate::graph::{GraphBuilder, SealedGraph};
    pub use crate::provider::{CreateRequest, ProviderError, ProviderRegistry, ResourceProvider};
    pub use crate::resource::{Resource, ResourceArgs};
    pub use crate::scheduler::{FailurePolicy, RunOutcome, Scheduler, SchedulerConfig};
    pub use crate::secret::Redacted;
    pub use crate::types::{GraphId, NodeId, NodeState};
    pub use crate::value::{PropertyMap, Value};
}

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
