pub mod backend;
pub mod changes;
pub mod keys;
pub mod model;
pub mod plugin;
pub mod predicate;
pub mod watcher;

pub use backend::{BackendError, BackendResult, BackendStore, Snapshot};
pub use changes::ChangeEvent;
pub use keys::{KeyLayout, KeyRef};
pub use plugin::{Middleware, MiddlewareSpec, Registry};
pub use watcher::{ChangeWatcher, WatcherState, event_channel, event_channel_for};
