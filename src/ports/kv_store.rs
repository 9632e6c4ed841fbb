use std::{fmt, time::Duration};

use async_trait::async_trait;
use thiserror::Error;

/// Errors reported by a hierarchical key-value store.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum KvError {
    /// The addressed key does not exist
    #[error("Key not found: {key}")]
    KeyNotFound { key: String },

    /// A create-only write hit an existing key
    #[error("Key already exists: {key}")]
    NodeExists { key: String },

    /// A path segment that must be a directory holds a value
    #[error("Not a directory: {key}")]
    NotADirectory { key: String },

    /// A value operation addressed a directory
    #[error("Not a file: {key}")]
    NotAFile { key: String },

    /// The requested watch index is older than the retained history
    #[error("Watch index {requested} has been cleared, oldest retained index is {oldest}")]
    IndexCleared { requested: u64, oldest: u64 },

    /// The store could not be reached or timed out
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// Result type alias for key-value store operations
pub type KvResult<T> = Result<T, KvError>;

/// Read consistency requested from the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Consistency {
    /// Any replica may answer
    Weak,
    /// The read observes every acknowledged write
    #[default]
    Strong,
}

/// Options for subtree reads.
#[derive(Debug, Clone, Copy, Default)]
pub struct GetOptions {
    pub recursive: bool,
    pub consistency: Consistency,
}

impl GetOptions {
    /// Recursive read with strong consistency.
    pub fn recursive() -> Self {
        Self {
            recursive: true,
            consistency: Consistency::Strong,
        }
    }
}

/// Options for single-key writes.
#[derive(Debug, Clone, Copy, Default)]
pub struct SetOptions {
    /// Expire the key after this long
    pub ttl: Option<Duration>,
    /// `Some(false)` makes the write create-only, `Some(true)` update-only
    pub prev_exist: Option<bool>,
}

impl SetOptions {
    /// Create-only write; fails with [`KvError::NodeExists`] if the key exists.
    pub fn create() -> Self {
        Self {
            ttl: None,
            prev_exist: Some(false),
        }
    }
}

/// Mutation kind carried by responses and watch notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KvAction {
    Get,
    Create,
    Set,
    Update,
    Delete,
    Expire,
}

impl KvAction {
    /// Whether the action removed the node.
    pub fn is_removal(self) -> bool {
        matches!(self, KvAction::Delete | KvAction::Expire)
    }
}

impl fmt::Display for KvAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            KvAction::Get => "get",
            KvAction::Create => "create",
            KvAction::Set => "set",
            KvAction::Update => "update",
            KvAction::Delete => "delete",
            KvAction::Expire => "expire",
        };
        f.write_str(s)
    }
}

/// A node in the store: either a value or a directory of child nodes.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Node {
    pub key: String,
    pub value: Option<String>,
    pub dir: bool,
    pub nodes: Vec<Node>,
    pub created_index: u64,
    pub modified_index: u64,
}

impl Node {
    /// Last path segment of the key.
    pub fn name(&self) -> &str {
        self.key.rsplit('/').next().unwrap_or_default()
    }

    /// Direct child by name.
    pub fn child(&self, name: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.name() == name)
    }

    /// Value of a direct child that holds a value.
    pub fn child_value(&self, name: &str) -> Option<&str> {
        self.child(name).and_then(|n| n.value.as_deref())
    }
}

/// Outcome of a store operation or a single watch notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvEvent {
    pub action: KvAction,
    pub node: Node,
    pub prev_node: Option<Node>,
    /// Store index at the time the response was produced
    pub index: u64,
}

/// Port for the hierarchical, watchable key-value store backing the configuration.
///
/// Keys are slash-delimited absolute paths. Writing a key implicitly creates its
/// parent directories.
#[async_trait]
pub trait KvStore: Send + Sync + 'static {
    /// Read a key or a subtree.
    async fn get(&self, key: &str, options: GetOptions) -> KvResult<KvEvent>;

    /// Write a single value.
    async fn set(&self, key: &str, value: &str, options: SetOptions) -> KvResult<KvEvent>;

    /// Delete a key; directories require `recursive`.
    async fn delete(&self, key: &str, recursive: bool) -> KvResult<KvEvent>;

    /// Block until the first mutation at or after `wait_index` under `prefix`.
    ///
    /// Fails with [`KvError::IndexCleared`] if the store no longer retains that index.
    async fn watch(&self, prefix: &str, wait_index: u64) -> KvResult<KvEvent>;

    /// Index of the latest applied mutation.
    async fn current_index(&self) -> KvResult<u64>;
}
