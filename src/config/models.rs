//! Settings for embedding the store.
//!
//! These types map directly to TOML (also JSON / YAML) files and include
//! defaults so that a minimal file stays concise.
use serde::{Deserialize, Serialize};

/// Default function for the key prefix
fn default_key_prefix() -> String {
    "/switchyard".to_string()
}

fn default_event_buffer() -> usize {
    1024
}

fn default_watch_history() -> usize {
    1000
}

/// Logging configuration
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive, e.g. "info" or "switchyard=debug"
    pub level: String,
    /// Emit JSON lines instead of pretty console output
    pub json: bool,
    /// Include span context in JSON output
    pub include_spans: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            include_spans: true,
        }
    }
}

/// Top level settings
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct StoreSettings {
    /// Root of the persisted layout in the key-value store
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Capacity of the bounded change feed
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,

    /// Events retained by the in-memory store for watchers
    #[serde(default = "default_watch_history")]
    pub watch_history: usize,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            key_prefix: default_key_prefix(),
            event_buffer: default_event_buffer(),
            watch_history: default_watch_history(),
            logging: LoggingConfig::default(),
        }
    }
}
