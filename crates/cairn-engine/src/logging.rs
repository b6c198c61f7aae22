//! Logging and the run journal
//!
//! Diagnostics go through `tracing`; [`init_tracing`] installs the subscriber
//! used by the `cairn` binary. Node transitions are additionally recorded in
//! a hash-chained [`Journal`] so a finished run can be audited. Journal
//! details are produced with [`Redacted`](crate::secret::Redacted) and never
//! contain secret values.

use crate::error::{ConfigError, JournalError};
use crate::types::NodeState;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing_subscriber::EnvFilter;

/// `[logging]` section of the engine configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive; `RUST_LOG` takes precedence when set
    pub filter: String,
    /// Emit JSON lines instead of human-readable text
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
            json: false,
        }
    }
}

/// Install the global `tracing` subscriber (stderr).
///
/// # Errors
/// `ConfigError::Invalid` if the filter does not parse or a subscriber is
/// already installed.
pub fn init_tracing(config: &LoggingConfig) -> Result<(), ConfigError> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.filter)
            .map_err(|e| ConfigError::Invalid(format!("logging.filter: {e}")))?,
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);

    let result = if config.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    result.map_err(|e| ConfigError::Invalid(format!("tracing: {e}")))
}

/// One recorded transition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalEntry {
    /// Position in the journal, starting at 0
    pub seq: u64,
    /// Wall-clock time of the transition
    pub timestamp: DateTime<Utc>,
    /// Node label
    pub node: String,
    /// Previous state
    pub from: NodeState,
    /// New state
    pub to: NodeState,
    /// Redacted value or failure message
    pub detail: String,
    /// Hash of the previous entry
    pub prev_hash: [u8; 32],
    /// Hash of this entry
    pub hash: [u8; 32],
}

/// Append-only, hash-chained record of node transitions
#[derive(Debug, Default)]
pub struct Journal {
    inner: Mutex<Vec<JournalEntry>>,
}

impl Journal {
    /// Create an empty journal
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a transition and return its sequence number
    pub fn record(
        &self,
        node: impl Into<String>,
        from: NodeState,
        to: NodeState,
        detail: impl Into<String>,
    ) -> u64 {
        let mut guard = self.inner.lock();
        let prev_hash = guard.last().map_or([0u8; 32], |e| e.hash);
        let mut entry = JournalEntry {
            seq: guard.len() as u64,
            timestamp: Utc::now(),
            node: node.into(),
            from,
            to,
            detail: detail.into(),
            prev_hash,
            hash: [0u8; 32],
        };
        entry.hash = compute_hash(&entry);
        let seq = entry.seq;
        guard.push(entry);
        seq
    }

    /// Snapshot of all entries
    #[must_use]
    pub fn entries(&self) -> Vec<JournalEntry> {
        self.inner.lock().clone()
    }

    /// Number of entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// True if nothing was recorded
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Hex digest of the last entry (all zeros when empty)
    #[must_use]
    pub fn head(&self) -> String {
        hex::encode(self.inner.lock().last().map_or([0u8; 32], |e| e.hash))
    }

    /// Check the hash chain
    ///
    /// # Errors
    /// `JournalError::IntegrityViolation` naming the first bad entry.
    pub fn verify_integrity(&self) -> Result<(), JournalError> {
        let guard = self.inner.lock();
        let mut prev = [0u8; 32];
        for entry in guard.iter() {
            if entry.prev_hash != prev || entry.hash != compute_hash(entry) {
                return Err(JournalError::IntegrityViolation { seq: entry.seq });
            }
            prev = entry.hash;
        }
        Ok(())
    }

    #[cfg(test)]
    fn tamper(&self, seq: usize, detail: &str) {
        self.inner.lock()[seq].detail = detail.to_string();
    }
}

fn compute_hash(entry: &JournalEntry) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(entry.seq.to_le_bytes());
    hasher.update(entry.timestamp.timestamp_micros().to_le_bytes());
    hasher.update(entry.node.as_bytes());
    hasher.update([0]);
    hasher.update(entry.from.to_string().as_bytes());
    hasher.update([0]);
    hasher.update(entry.to.to_string().as_bytes());
    hasher.update([0]);
    hasher.update(entry.detail.as_bytes());
    hasher.update([0]);
    hasher.update(entry.prev_hash);
    hasher.finalize().into()
}
