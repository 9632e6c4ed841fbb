//! Typed CRUD over the hierarchical key-value store.
//!
//! Entities are spread over several keys (see [`crate::core::keys`]); each
//! operation writes them in an order that lets a concurrent watcher observe a
//! complete entity by the time the key it reacts to is written. Reads always
//! request strong consistency.
use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::{
    config::StoreSettings,
    core::{
        keys::KeyLayout,
        model::{
            DecodeError, Endpoint, Host, HostOptions, KeyPair, Listener, Location, LocationKey,
            LocationOptions, MiddlewareInstance, Upstream, UpstreamOptions, ValidationError,
            error::validate_required_id, listener_from_json, location::validate_path,
            middleware_from_json,
        },
        plugin::{PluginError, Registry},
    },
    ports::kv_store::{Consistency, GetOptions, KvError, KvStore, Node, SetOptions},
};

/// Errors surfaced by the backend store and the change watcher.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum BackendError {
    /// The addressed entity does not exist
    #[error("{entity} '{id}' not found")]
    NotFound { entity: &'static str, id: String },

    /// Create hit an existing identifier
    #[error("{entity} '{id}' already exists")]
    AlreadyExists { entity: &'static str, id: String },

    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// A live reference blocks a delete, or a create references a missing parent
    #[error("Referential integrity violation: {message}")]
    ReferentialIntegrity { message: String },

    #[error(transparent)]
    Plugin(#[from] PluginError),

    /// The store could not be reached or dropped the requested watch history
    #[error("Store unavailable: {0}")]
    StoreUnavailable(#[source] KvError),

    /// Stored data does not decode into the model
    #[error("Corrupted data at '{key}': {message}")]
    Corrupted { key: String, message: String },

    /// Watcher lifecycle misuse
    #[error("Watcher state error: {message}")]
    WatcherState { message: String },
}

/// Result type alias for backend operations
pub type BackendResult<T> = Result<T, BackendError>;

impl BackendError {
    pub(crate) fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        BackendError::NotFound {
            entity,
            id: id.into(),
        }
    }

    pub(crate) fn already_exists(entity: &'static str, id: impl Into<String>) -> Self {
        BackendError::AlreadyExists {
            entity,
            id: id.into(),
        }
    }

    fn corrupted(key: &str, message: impl std::fmt::Display) -> Self {
        BackendError::Corrupted {
            key: key.to_string(),
            message: message.to_string(),
        }
    }

    fn decode(key: &str, error: DecodeError) -> Self {
        Self::corrupted(key, error)
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, BackendError::NotFound { .. })
    }
}

impl From<KvError> for BackendError {
    fn from(err: KvError) -> Self {
        let message = err.to_string();
        match err {
            KvError::KeyNotFound { key } => BackendError::not_found("key", key),
            KvError::NodeExists { key } => BackendError::already_exists("key", key),
            KvError::NotADirectory { key } | KvError::NotAFile { key } => {
                BackendError::Corrupted { key, message }
            }
            other => BackendError::StoreUnavailable(other),
        }
    }
}

/// Map a missing key onto the entity that was addressed.
fn missing_as(entity: &'static str, id: &str) -> impl FnOnce(KvError) -> BackendError {
    let id = id.to_string();
    move |err| match err {
        KvError::KeyNotFound { .. } => BackendError::not_found(entity, id),
        other => other.into(),
    }
}

/// Map a create-only collision onto the entity that was addressed.
fn exists_as(entity: &'static str, id: &str) -> impl FnOnce(KvError) -> BackendError {
    let id = id.to_string();
    move |err| match err {
        KvError::NodeExists { .. } => BackendError::already_exists(entity, id),
        other => other.into(),
    }
}

fn generate_id() -> String {
    Uuid::new_v4().simple().to_string()
}

fn to_json<T: Serialize>(field: &str, value: &T) -> BackendResult<String> {
    serde_json::to_string(value)
        .map_err(|e| BackendError::Validation(ValidationError::invalid(field, e.to_string())))
}

fn location_id(host: &str, id: &str) -> String {
    LocationKey {
        hostname: host.to_string(),
        id: id.to_string(),
    }
    .to_string()
}

/// `hosts/<name>/host` document
#[derive(Debug, Serialize, Deserialize)]
struct HostRecord {
    name: String,
    #[serde(default)]
    options: HostOptions,
}

/// `upstreams/<id>/upstream` document
#[derive(Debug, Serialize, Deserialize)]
struct UpstreamRecord {
    id: String,
    #[serde(default)]
    options: UpstreamOptions,
}

/// Consistent view of the whole tree read at a single store index.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub index: u64,
    pub upstreams: Vec<Upstream>,
    pub hosts: Vec<Host>,
}

/// Typed CRUD over the routing configuration.
///
/// Cheap to clone; clones share the store client and the registry.
#[derive(Clone)]
pub struct BackendStore {
    kv: Arc<dyn KvStore>,
    registry: Arc<Registry>,
    keys: KeyLayout,
}

impl std::fmt::Debug for BackendStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendStore")
            .field("keys", &self.keys)
            .field("registry", &self.registry)
            .finish()
    }
}

impl BackendStore {
    pub fn new(kv: Arc<dyn KvStore>, registry: Arc<Registry>, key_prefix: &str) -> Self {
        Self {
            kv,
            registry,
            keys: KeyLayout::new(key_prefix),
        }
    }

    pub fn from_settings(
        kv: Arc<dyn KvStore>,
        registry: Arc<Registry>,
        settings: &StoreSettings,
    ) -> Self {
        Self::new(kv, registry, &settings.key_prefix)
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn keys(&self) -> &KeyLayout {
        &self.keys
    }

    pub(crate) fn kv(&self) -> &dyn KvStore {
        self.kv.as_ref()
    }

    async fn read(&self, key: &str, recursive: bool) -> Result<Node, KvError> {
        let options = GetOptions {
            recursive,
            consistency: Consistency::Strong,
        };
        Ok(self.kv.get(key, options).await?.node)
    }

    /// Like [`read`](Self::read) but a missing key is `None`.
    async fn read_opt(&self, key: &str, recursive: bool) -> BackendResult<Option<Node>> {
        match self.read(key, recursive).await {
            Ok(node) => Ok(Some(node)),
            Err(KvError::KeyNotFound { .. }) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn exists(&self, key: &str) -> BackendResult<bool> {
        Ok(self.read_opt(key, false).await?.is_some())
    }

    async fn host_exists(&self, name: &str) -> BackendResult<bool> {
        self.exists(&self.keys.host_record(name)).await
    }

    async fn upstream_exists(&self, id: &str) -> BackendResult<bool> {
        self.exists(&self.keys.upstream_dir(id)).await
    }

    fn ensure_registered(&self, type_name: &str) -> BackendResult<()> {
        if self.registry.get_spec(type_name).is_none() {
            return Err(BackendError::not_found("middleware type", type_name));
        }
        Ok(())
    }

    /// Checks a new location must pass before anything is written: its
    /// upstream exists and its middlewares are registered and distinct.
    async fn check_location(&self, location: &Location) -> BackendResult<()> {
        if !self.upstream_exists(&location.upstream.id).await? {
            return Err(BackendError::ReferentialIntegrity {
                message: format!("upstream '{}' does not exist", location.upstream.id),
            });
        }
        let mut seen = HashSet::new();
        for middleware in &location.middlewares {
            self.ensure_registered(&middleware.type_name)?;
            if !middleware.id.is_empty()
                && !seen.insert((middleware.type_name.as_str(), middleware.id.as_str()))
            {
                return Err(BackendError::already_exists("middleware", &middleware.id));
            }
        }
        Ok(())
    }

    /// Remove what a failed create managed to write.
    async fn roll_back(&self, key: &str) {
        match self.kv.delete(key, true).await {
            Ok(_) => tracing::debug!(key, "Rolled back partial write"),
            Err(e) => tracing::warn!(key, error = %e, "Failed to roll back partial write"),
        }
    }

    // ---- decoding -------------------------------------------------------

    fn parse_upstream(&self, node: &Node) -> BackendResult<Upstream> {
        let id = node.name().to_string();
        let options = match node.child("upstream").and_then(|n| n.value.as_deref()) {
            Some(raw) => {
                let key = self.keys.upstream_record(&id);
                let record: UpstreamRecord = serde_json::from_str(raw)
                    .map_err(|e| BackendError::decode(&key, e.into()))?;
                record.options
            }
            None => UpstreamOptions::default(),
        };
        let mut endpoints = Vec::new();
        if let Some(dir) = node.child("endpoints") {
            for child in dir.nodes.iter().filter(|n| !n.dir) {
                endpoints.push(self.parse_endpoint(&id, child)?);
            }
        }
        Ok(Upstream {
            id,
            endpoints,
            options,
        })
    }

    fn parse_endpoint(&self, upstream_id: &str, node: &Node) -> BackendResult<Endpoint> {
        let url = node.value.as_deref().unwrap_or_default();
        Endpoint::new(upstream_id, node.name(), url).map_err(|e| BackendError::corrupted(&node.key, e))
    }

    /// Decode a host directory. Locations carry a placeholder upstream
    /// holding only the referenced id; see [`resolve_upstreams`](Self::resolve_upstreams).
    fn parse_host(&self, node: &Node) -> BackendResult<Option<Host>> {
        let name = node.name().to_string();
        let Some(raw) = node.child_value("host") else {
            return Ok(None);
        };
        let record_key = self.keys.host_record(&name);
        let record: HostRecord =
            serde_json::from_str(raw).map_err(|e| BackendError::decode(&record_key, e.into()))?;

        let key_pair = match node.child_value("keypair") {
            Some(raw) => Some(
                serde_json::from_str::<KeyPair>(raw)
                    .map_err(|e| BackendError::corrupted(&self.keys.key_pair(&name), e))?,
            ),
            None => None,
        };

        let mut listeners = Vec::new();
        if let Some(dir) = node.child("listeners") {
            for child in dir.nodes.iter().filter(|n| !n.dir) {
                let raw = child.value.as_deref().unwrap_or_default();
                let mut listener = listener_from_json(raw.as_bytes())
                    .map_err(|e| BackendError::decode(&child.key, e))?;
                listener.id = child.name().to_string();
                listeners.push(listener);
            }
        }

        let mut locations = Vec::new();
        if let Some(dir) = node.child("locations") {
            for child in dir.nodes.iter().filter(|n| n.dir) {
                if let Some(location) = self.parse_location(&name, child)? {
                    locations.push(location);
                }
            }
        }

        Ok(Some(Host {
            name,
            locations,
            key_pair,
            listeners,
            options: record.options,
        }))
    }

    /// Decode a location directory; `None` while its path or upstream key is
    /// not written yet.
    fn parse_location(&self, hostname: &str, node: &Node) -> BackendResult<Option<Location>> {
        let id = node.name().to_string();
        let (Some(path), Some(upstream_id)) =
            (node.child_value("path"), node.child_value("upstream"))
        else {
            return Ok(None);
        };
        let options = match node.child_value("options") {
            Some(raw) => serde_json::from_str::<LocationOptions>(raw).map_err(|e| {
                BackendError::decode(&self.keys.location_options(hostname, &id), e.into())
            })?,
            None => LocationOptions::default(),
        };

        let mut middlewares = Vec::new();
        if let Some(dir) = node.child("middlewares") {
            for type_dir in dir.nodes.iter().filter(|n| n.dir) {
                for child in type_dir.nodes.iter().filter(|n| !n.dir) {
                    middlewares.push(self.parse_middleware(child)?);
                }
            }
        }
        middlewares.sort_by(|a, b| {
            (a.priority, &a.type_name, &a.id).cmp(&(b.priority, &b.type_name, &b.id))
        });

        let location = Location::with_options(hostname, &id, path, upstream_id, options)
            .map_err(|e| BackendError::corrupted(&node.key, e))?;
        Ok(Some(Location {
            middlewares,
            ..location
        }))
    }

    fn parse_middleware(&self, node: &Node) -> BackendResult<MiddlewareInstance> {
        let raw = node.value.as_deref().unwrap_or_default();
        let mut instance = middleware_from_json(raw.as_bytes(), &self.registry)
            .map_err(|e| BackendError::decode(&node.key, e))?;
        // The key is authoritative for identity.
        instance.id = node.name().to_string();
        Ok(instance)
    }

    /// Replace placeholder upstreams with the stored ones.
    async fn resolve_upstreams(&self, locations: &mut [Location]) -> BackendResult<()> {
        let mut cache: HashMap<String, Upstream> = HashMap::new();
        for location in locations.iter_mut() {
            let id = location.upstream.id.clone();
            let upstream = match cache.get(&id) {
                Some(upstream) => upstream.clone(),
                None => {
                    let upstream = self.get_upstream(&id).await?;
                    cache.insert(id, upstream.clone());
                    upstream
                }
            };
            location.upstream = upstream;
        }
        Ok(())
    }

    // ---- snapshot -------------------------------------------------------

    /// Read every upstream and host at one store index.
    pub async fn snapshot(&self) -> BackendResult<Snapshot> {
        let before = self.kv.current_index().await?;
        let options = GetOptions {
            recursive: true,
            consistency: Consistency::Strong,
        };
        let (index, root) = match self.kv.get(self.keys.root(), options).await {
            Ok(res) => (res.index, res.node),
            Err(KvError::KeyNotFound { .. }) => (before, Node::default()),
            Err(e) => return Err(e.into()),
        };

        let mut upstreams = Vec::new();
        if let Some(dir) = root.child("upstreams") {
            for child in dir.nodes.iter().filter(|n| n.dir) {
                upstreams.push(self.parse_upstream(child)?);
            }
        }
        let by_id: HashMap<&str, &Upstream> =
            upstreams.iter().map(|u| (u.id.as_str(), u)).collect();

        let mut hosts = Vec::new();
        if let Some(dir) = root.child("hosts") {
            for child in dir.nodes.iter().filter(|n| n.dir) {
                let Some(mut host) = self.parse_host(child)? else {
                    continue;
                };
                for location in &mut host.locations {
                    let upstream = by_id
                        .get(location.upstream.id.as_str())
                        .ok_or_else(|| BackendError::not_found("upstream", &location.upstream.id))?;
                    location.upstream = (*upstream).clone();
                }
                hosts.push(host);
            }
        }

        Ok(Snapshot {
            index,
            upstreams,
            hosts,
        })
    }

    // ---- hosts ----------------------------------------------------------

    pub async fn get_hosts(&self) -> BackendResult<Vec<Host>> {
        Ok(self.snapshot().await?.hosts)
    }

    pub async fn get_host(&self, name: &str) -> BackendResult<Host> {
        let node = self
            .read(&self.keys.host_dir(name), true)
            .await
            .map_err(missing_as("host", name))?;
        let mut host = self
            .parse_host(&node)?
            .ok_or_else(|| BackendError::not_found("host", name))?;
        self.resolve_upstreams(&mut host.locations).await?;
        Ok(host)
    }

    /// Store a host with its key pair, listeners and locations.
    ///
    /// Every check runs before the first write. The host record is written
    /// create-only, so a duplicate name fails before anything else is touched;
    /// if a later write fails the host directory is removed again.
    pub async fn add_host(&self, host: Host) -> BackendResult<Host> {
        host.validate()?;
        let mut listener_ids = HashSet::new();
        for listener in &host.listeners {
            if !listener.id.is_empty() && !listener_ids.insert(listener.id.as_str()) {
                return Err(BackendError::already_exists("listener", &listener.id));
            }
        }
        let mut location_ids = HashSet::new();
        for location in &host.locations {
            if location.hostname != host.name {
                return Err(ValidationError::invalid(
                    "location.hostname",
                    format!(
                        "location '{}' belongs to '{}', not '{}'",
                        location.id, location.hostname, host.name
                    ),
                )
                .into());
            }
            if !location.id.is_empty() && !location_ids.insert(location.id.as_str()) {
                return Err(BackendError::already_exists(
                    "location",
                    location_id(&host.name, &location.id),
                ));
            }
            location.validate()?;
            self.check_location(location).await?;
        }

        let record = HostRecord {
            name: host.name.clone(),
            options: host.options,
        };
        self.kv
            .set(
                &self.keys.host_record(&host.name),
                &to_json("host", &record)?,
                SetOptions::create(),
            )
            .await
            .map_err(exists_as("host", &host.name))?;

        let name = host.name.clone();
        if let Err(e) = self.write_host_parts(host).await {
            self.roll_back(&self.keys.host_dir(&name)).await;
            return Err(e);
        }

        tracing::debug!(host = %name, "Host added");
        self.get_host(&name).await
    }

    async fn write_host_parts(&self, host: Host) -> BackendResult<()> {
        if let Some(key_pair) = &host.key_pair {
            self.kv
                .set(
                    &self.keys.key_pair(&host.name),
                    &to_json("key_pair", key_pair)?,
                    SetOptions::default(),
                )
                .await?;
        }
        for listener in host.listeners {
            self.write_listener(&host.name, listener).await?;
        }
        for location in host.locations {
            self.write_location(location).await?;
        }
        Ok(())
    }

    pub async fn delete_host(&self, name: &str) -> BackendResult<()> {
        self.kv
            .delete(&self.keys.host_dir(name), true)
            .await
            .map_err(missing_as("host", name))?;
        tracing::debug!(host = %name, "Host deleted");
        Ok(())
    }

    pub async fn update_host_key_pair(&self, hostname: &str, key_pair: KeyPair) -> BackendResult<Host> {
        if !self.host_exists(hostname).await? {
            return Err(BackendError::not_found("host", hostname));
        }
        self.kv
            .set(
                &self.keys.key_pair(hostname),
                &to_json("key_pair", &key_pair)?,
                SetOptions::default(),
            )
            .await?;
        self.get_host(hostname).await
    }

    pub async fn add_host_listener(&self, hostname: &str, listener: Listener) -> BackendResult<Listener> {
        listener.validate()?;
        if !self.host_exists(hostname).await? {
            return Err(BackendError::ReferentialIntegrity {
                message: format!("host '{hostname}' does not exist"),
            });
        }
        self.write_listener(hostname, listener).await
    }

    async fn write_listener(&self, hostname: &str, listener: Listener) -> BackendResult<Listener> {
        let mut listener = listener;
        if listener.id.is_empty() {
            listener.id = generate_id();
        }
        self.kv
            .set(
                &self.keys.listener(hostname, &listener.id),
                &to_json("listener", &listener)?,
                SetOptions::create(),
            )
            .await
            .map_err(exists_as("listener", &listener.id))?;
        Ok(listener)
    }

    pub async fn delete_host_listener(&self, hostname: &str, listener_id: &str) -> BackendResult<()> {
        self.kv
            .delete(&self.keys.listener(hostname, listener_id), false)
            .await
            .map_err(missing_as("listener", listener_id))?;
        Ok(())
    }

    // ---- upstreams ------------------------------------------------------

    pub async fn get_upstreams(&self) -> BackendResult<Vec<Upstream>> {
        let Some(dir) = self.read_opt(&self.keys.upstreams(), true).await? else {
            return Ok(Vec::new());
        };
        dir.nodes
            .iter()
            .filter(|n| n.dir)
            .map(|n| self.parse_upstream(n))
            .collect()
    }

    pub async fn get_upstream(&self, id: &str) -> BackendResult<Upstream> {
        let node = self
            .read(&self.keys.upstream_dir(id), true)
            .await
            .map_err(missing_as("upstream", id))?;
        if !node.dir {
            return Err(BackendError::corrupted(&node.key, "expected a directory"));
        }
        self.parse_upstream(&node)
    }

    /// Store an upstream and any endpoints it already carries.
    pub async fn add_upstream(&self, upstream: Upstream) -> BackendResult<Upstream> {
        upstream.validate()?;
        let mut upstream = upstream;
        if upstream.id.is_empty() {
            upstream.id = generate_id();
        }
        let record = UpstreamRecord {
            id: upstream.id.clone(),
            options: upstream.options.clone(),
        };
        self.kv
            .set(
                &self.keys.upstream_record(&upstream.id),
                &to_json("upstream", &record)?,
                SetOptions::create(),
            )
            .await
            .map_err(exists_as("upstream", &upstream.id))?;

        for endpoint in upstream.endpoints {
            let endpoint = Endpoint {
                upstream_id: upstream.id.clone(),
                ..endpoint
            };
            self.add_endpoint(endpoint).await?;
        }
        tracing::debug!(upstream = %upstream.id, "Upstream added");
        self.get_upstream(&upstream.id).await
    }

    pub async fn update_upstream_options(
        &self,
        id: &str,
        options: UpstreamOptions,
    ) -> BackendResult<Upstream> {
        options.transport_options()?;
        if !self.upstream_exists(id).await? {
            return Err(BackendError::not_found("upstream", id));
        }
        let record = UpstreamRecord {
            id: id.to_string(),
            options,
        };
        self.kv
            .set(
                &self.keys.upstream_record(id),
                &to_json("upstream", &record)?,
                SetOptions::default(),
            )
            .await?;
        self.get_upstream(id).await
    }

    /// Delete an upstream unless a location still routes to it.
    pub async fn delete_upstream(&self, id: &str) -> BackendResult<()> {
        if !self.upstream_exists(id).await? {
            return Err(BackendError::not_found("upstream", id));
        }
        let users = self.upstream_references(id).await?;
        if !users.is_empty() {
            let users: Vec<String> = users.iter().map(ToString::to_string).collect();
            return Err(BackendError::ReferentialIntegrity {
                message: format!(
                    "upstream '{id}' is in use by locations: {}",
                    users.join(", ")
                ),
            });
        }
        self.kv
            .delete(&self.keys.upstream_dir(id), true)
            .await
            .map_err(missing_as("upstream", id))?;
        tracing::debug!(upstream = %id, "Upstream deleted");
        Ok(())
    }

    /// Locations whose upstream key names `upstream_id`, read without resolving them.
    pub async fn upstream_references(&self, upstream_id: &str) -> BackendResult<Vec<LocationKey>> {
        let Some(hosts) = self.read_opt(&self.keys.hosts(), true).await? else {
            return Ok(Vec::new());
        };
        let mut out = Vec::new();
        for host in hosts.nodes.iter().filter(|n| n.dir) {
            let Some(locations) = host.child("locations") else {
                continue;
            };
            for location in locations.nodes.iter().filter(|n| n.dir) {
                if location.child_value("upstream") == Some(upstream_id) {
                    out.push(LocationKey {
                        hostname: host.name().to_string(),
                        id: location.name().to_string(),
                    });
                }
            }
        }
        Ok(out)
    }

    /// Store index at which the location's upstream key was first written;
    /// `None` while the location is incomplete.
    pub(crate) async fn location_completed_at(
        &self,
        hostname: &str,
        id: &str,
    ) -> BackendResult<Option<u64>> {
        Ok(self
            .read_opt(&self.keys.location_upstream(hostname, id), false)
            .await?
            .map(|node| node.created_index))
    }

    /// Fully resolved locations routing to `upstream_id`.
    pub async fn locations_using_upstream(&self, upstream_id: &str) -> BackendResult<Vec<Location>> {
        let mut out = Vec::new();
        for key in self.upstream_references(upstream_id).await? {
            match self.get_location(&key.hostname, &key.id).await {
                Ok(location) => out.push(location),
                // Deleted or half written since the scan
                Err(BackendError::NotFound { .. }) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(out)
    }

    // ---- endpoints ------------------------------------------------------

    pub async fn add_endpoint(&self, endpoint: Endpoint) -> BackendResult<Endpoint> {
        endpoint.validate()?;
        if !self.upstream_exists(&endpoint.upstream_id).await? {
            return Err(BackendError::ReferentialIntegrity {
                message: format!("upstream '{}' does not exist", endpoint.upstream_id),
            });
        }
        let mut endpoint = endpoint;
        if endpoint.id.is_empty() {
            endpoint.id = generate_id();
        }
        self.kv
            .set(
                &self.keys.endpoint(&endpoint.upstream_id, &endpoint.id),
                &endpoint.url,
                SetOptions::create(),
            )
            .await
            .map_err(exists_as("endpoint", &endpoint.key().to_string()))?;
        Ok(endpoint)
    }

    pub async fn get_endpoint(&self, upstream_id: &str, id: &str) -> BackendResult<Endpoint> {
        let key = self.keys.endpoint(upstream_id, id);
        let node = self
            .read(&key, false)
            .await
            .map_err(missing_as("endpoint", &format!("{upstream_id}.{id}")))?;
        self.parse_endpoint(upstream_id, &node)
    }

    pub async fn delete_endpoint(&self, upstream_id: &str, id: &str) -> BackendResult<()> {
        self.kv
            .delete(&self.keys.endpoint(upstream_id, id), false)
            .await
            .map_err(missing_as("endpoint", &format!("{upstream_id}.{id}")))?;
        Ok(())
    }

    // ---- locations ------------------------------------------------------

    pub async fn get_location(&self, hostname: &str, id: &str) -> BackendResult<Location> {
        let node = self
            .read(&self.keys.location_dir(hostname, id), true)
            .await
            .map_err(missing_as("location", &location_id(hostname, id)))?;
        let mut location = self
            .parse_location(hostname, &node)?
            .ok_or_else(|| BackendError::not_found("location", location_id(hostname, id)))?;
        location.upstream = self.get_upstream(&location.upstream.id).await?;
        Ok(location)
    }

    /// Store a location and its middlewares.
    pub async fn add_location(&self, location: Location) -> BackendResult<Location> {
        location.validate()?;
        if !self.host_exists(&location.hostname).await? {
            return Err(BackendError::ReferentialIntegrity {
                message: format!("host '{}' does not exist", location.hostname),
            });
        }
        self.check_location(&location).await?;

        let (host, id) = self.write_location(location).await?;
        tracing::debug!(host = %host, location = %id, "Location added");
        self.get_location(&host, &id).await
    }

    /// Write a checked location. The upstream key goes last: a location
    /// becomes readable only once it is complete. A failed write removes the
    /// partial location.
    async fn write_location(&self, location: Location) -> BackendResult<(String, String)> {
        let mut location = location;
        if location.id.is_empty() {
            location.id = generate_id();
        }
        let (host, id) = (location.hostname.clone(), location.id.clone());

        self.kv
            .set(
                &self.keys.location_path(&host, &id),
                &location.path,
                SetOptions::create(),
            )
            .await
            .map_err(exists_as("location", &location_id(&host, &id)))?;
        if let Err(e) = self.write_location_parts(&host, &id, location).await {
            self.roll_back(&self.keys.location_dir(&host, &id)).await;
            return Err(e);
        }
        Ok((host, id))
    }

    async fn write_location_parts(
        &self,
        host: &str,
        id: &str,
        location: Location,
    ) -> BackendResult<()> {
        self.kv
            .set(
                &self.keys.location_options(host, id),
                &to_json("options", &location.options)?,
                SetOptions::create(),
            )
            .await?;

        let mut middlewares = location.middlewares;
        middlewares.sort_by_key(|m| m.priority);
        for (position, mut middleware) in middlewares.into_iter().enumerate() {
            if middleware.id.is_empty() {
                middleware.id = generate_id();
            }
            middleware.priority = position;
            self.kv
                .set(
                    &self
                        .keys
                        .middleware(host, id, &middleware.type_name, &middleware.id),
                    &to_json("middleware", &middleware)?,
                    SetOptions::create(),
                )
                .await
                .map_err(exists_as("middleware", &middleware.id))?;
        }

        self.kv
            .set(
                &self.keys.location_upstream(host, id),
                &location.upstream.id,
                SetOptions::default(),
            )
            .await?;
        Ok(())
    }

    pub async fn update_location_upstream(
        &self,
        hostname: &str,
        id: &str,
        upstream_id: &str,
    ) -> BackendResult<Location> {
        validate_required_id("upstream", upstream_id)?;
        self.get_location(hostname, id).await?;
        if !self.upstream_exists(upstream_id).await? {
            return Err(BackendError::ReferentialIntegrity {
                message: format!("upstream '{upstream_id}' does not exist"),
            });
        }
        self.kv
            .set(
                &self.keys.location_upstream(hostname, id),
                upstream_id,
                SetOptions::default(),
            )
            .await?;
        self.get_location(hostname, id).await
    }

    pub async fn update_location_options(
        &self,
        hostname: &str,
        id: &str,
        options: LocationOptions,
    ) -> BackendResult<Location> {
        options.parse()?;
        self.get_location(hostname, id).await?;
        self.kv
            .set(
                &self.keys.location_options(hostname, id),
                &to_json("options", &options)?,
                SetOptions::default(),
            )
            .await?;
        self.get_location(hostname, id).await
    }

    /// Re-point the location's path pattern.
    pub async fn update_location_path(
        &self,
        hostname: &str,
        id: &str,
        path: &str,
    ) -> BackendResult<Location> {
        validate_path(path)?;
        self.get_location(hostname, id).await?;
        self.kv
            .set(
                &self.keys.location_path(hostname, id),
                path,
                SetOptions::default(),
            )
            .await?;
        self.get_location(hostname, id).await
    }

    pub async fn delete_location(&self, hostname: &str, id: &str) -> BackendResult<()> {
        self.kv
            .delete(&self.keys.location_dir(hostname, id), true)
            .await
            .map_err(missing_as("location", &location_id(hostname, id)))?;
        tracing::debug!(host = %hostname, location = %id, "Location deleted");
        Ok(())
    }

    // ---- middlewares ----------------------------------------------------

    /// Append a middleware to the location's chain.
    pub async fn add_location_middleware(
        &self,
        hostname: &str,
        location_id: &str,
        middleware: MiddlewareInstance,
    ) -> BackendResult<MiddlewareInstance> {
        self.ensure_registered(&middleware.type_name)?;
        let location = self.get_location(hostname, location_id).await?;

        let mut middleware = middleware;
        if middleware.id.is_empty() {
            middleware.id = generate_id();
        }
        validate_required_id("middleware id", &middleware.id)?;
        if location
            .middlewares
            .iter()
            .any(|m| m.type_name == middleware.type_name && m.id == middleware.id)
        {
            return Err(BackendError::already_exists("middleware", &middleware.id));
        }

        let remaining = self
            .renumber_middlewares(hostname, location_id, location.middlewares)
            .await?;
        middleware.priority = remaining;
        self.kv
            .set(
                &self.keys.middleware(
                    hostname,
                    location_id,
                    &middleware.type_name,
                    &middleware.id,
                ),
                &to_json("middleware", &middleware)?,
                SetOptions::create(),
            )
            .await
            .map_err(exists_as("middleware", &middleware.id))?;
        Ok(middleware)
    }

    pub async fn get_location_middleware(
        &self,
        hostname: &str,
        location_id: &str,
        type_name: &str,
        id: &str,
    ) -> BackendResult<MiddlewareInstance> {
        self.ensure_registered(type_name)?;
        let node = self
            .read(&self.keys.middleware(hostname, location_id, type_name, id), false)
            .await
            .map_err(missing_as("middleware", id))?;
        self.parse_middleware(&node)
    }

    /// Replace a middleware's configuration; its position in the chain is kept.
    pub async fn update_location_middleware(
        &self,
        hostname: &str,
        location_id: &str,
        middleware: MiddlewareInstance,
    ) -> BackendResult<MiddlewareInstance> {
        self.ensure_registered(&middleware.type_name)?;
        self.get_location(hostname, location_id).await?;
        let current = self
            .get_location_middleware(hostname, location_id, &middleware.type_name, &middleware.id)
            .await?;

        let middleware = MiddlewareInstance {
            priority: current.priority,
            ..middleware
        };
        self.kv
            .set(
                &self.keys.middleware(
                    hostname,
                    location_id,
                    &middleware.type_name,
                    &middleware.id,
                ),
                &to_json("middleware", &middleware)?,
                SetOptions::default(),
            )
            .await?;
        Ok(middleware)
    }

    pub async fn delete_location_middleware(
        &self,
        hostname: &str,
        location_id: &str,
        type_name: &str,
        id: &str,
    ) -> BackendResult<()> {
        self.ensure_registered(type_name)?;
        self.get_location(hostname, location_id).await?;
        self.kv
            .delete(&self.keys.middleware(hostname, location_id, type_name, id), false)
            .await
            .map_err(missing_as("middleware", id))?;

        let location = self.get_location(hostname, location_id).await?;
        self.renumber_middlewares(hostname, location_id, location.middlewares)
            .await?;
        Ok(())
    }

    /// Make priorities contiguous from 0 in chain order, rewriting only the
    /// instances whose priority moved. Returns the chain length.
    async fn renumber_middlewares(
        &self,
        hostname: &str,
        location_id: &str,
        mut middlewares: Vec<MiddlewareInstance>,
    ) -> BackendResult<usize> {
        middlewares.sort_by(|a, b| {
            (a.priority, &a.type_name, &a.id).cmp(&(b.priority, &b.type_name, &b.id))
        });
        let count = middlewares.len();
        for (position, mut middleware) in middlewares.into_iter().enumerate() {
            if middleware.priority == position {
                continue;
            }
            middleware.priority = position;
            self.kv
                .set(
                    &self.keys.middleware(
                        hostname,
                        location_id,
                        &middleware.type_name,
                        &middleware.id,
                    ),
                    &to_json("middleware", &middleware)?,
                    SetOptions::default(),
                )
                .await?;
        }
        Ok(count)
    }
}
