//! Switchyard - the control-plane store behind a reverse proxy.
//!
//! Switchyard keeps a proxy's routing configuration (hosts, listeners, locations,
//! middlewares, upstreams and endpoints) as typed entities on top of a hierarchical,
//! watchable key-value store, and turns every change to that store into a typed
//! [`ChangeEvent`] the data plane can apply incrementally.
//!
//! # Features
//! - Typed entity model with validation and a JSON wire format
//! - Middleware plugin registry (rate limiting and connection limiting built in)
//! - Referentially checked CRUD over an etcd v2 style keyspace
//! - Ordered middleware priorities per location, renumbered on delete
//! - Live change feed with optional replay of the existing configuration
//! - Failover predicate language for locations
//! - Round-trip statistics types (counters, latency brackets, verdicts)
//!
//! # Quick Example
//! ```no_run
//! use std::sync::Arc;
//!
//! use switchyard::{BackendStore, ChangeWatcher, InMemoryKvStore, default_registry};
//! use switchyard::core::model::{Endpoint, Upstream};
//!
//! # #[tokio::main] async fn main() -> eyre::Result<()> {
//! let store = BackendStore::new(
//!     Arc::new(InMemoryKvStore::new()),
//!     Arc::new(default_registry()?),
//!     "/switchyard",
//! );
//! let watcher = Arc::new(ChangeWatcher::new(store.clone()));
//! let (tx, mut rx) = switchyard::event_channel(1024);
//! tokio::spawn({
//!     let watcher = watcher.clone();
//!     async move { watcher.watch_changes(tx, true).await }
//! });
//!
//! store.add_upstream(Upstream::new("up1")?).await?;
//! store.add_endpoint(Endpoint::new("up1", "e1", "http://10.0.0.1:5000")?).await?;
//! while let Some(event) = rx.recv().await {
//!     println!("{}", event.kind());
//! }
//! # Ok(()) }
//! ```
//!
//! # Architecture
//! The crate separates **ports** (the [`KvStore`] trait) from **adapters** (the in-memory
//! store) while keeping the entity model, persisted layout, CRUD and change feed inside
//! `core`. Middleware types live in `plugins`.
//!
//! # Error Handling
//! Store operations return [`BackendError`]; entity construction returns
//! `ValidationError`. Settings loading returns `eyre::Result<T>` with context attached
//! via `WrapErr`.
pub mod config;
pub mod ports;
pub mod tracing_setup;

pub mod adapters;
pub mod core;
pub mod plugins;

pub use crate::{
    adapters::InMemoryKvStore,
    config::{StoreSettings, load_settings},
    core::{
        BackendError, BackendResult, BackendStore, ChangeEvent, ChangeWatcher, MiddlewareSpec,
        Registry, WatcherState, event_channel, event_channel_for,
    },
    plugins::default_registry,
    ports::KvStore,
};
