//! In-process hierarchical key-value store.
//!
//! Mirrors the semantics of an etcd v2 keyspace closely enough to embed the
//! configuration store without an external cluster and to drive tests:
//! * explicit directories, auto-created for the parents of any written key
//! * a single monotonically increasing modification index
//! * create-only / update-only writes and per-key TTLs (expired lazily, each
//!   expiry is recorded as an `expire` event)
//! * a bounded event history backing blocking `watch` calls; once the window
//!   has moved past a requested index the watch fails with `IndexCleared`
use std::{
    collections::{BTreeMap, VecDeque},
    sync::{Mutex, MutexGuard},
};

use async_trait::async_trait;
use tokio::{sync::Notify, time::Instant};

use crate::{
    config::StoreSettings,
    ports::kv_store::{GetOptions, KvAction, KvError, KvEvent, KvResult, KvStore, Node, SetOptions},
};

/// Default number of events retained for watchers.
pub const DEFAULT_HISTORY_CAPACITY: usize = 1000;

const ROOT: &str = "/";

#[derive(Debug, Clone)]
struct Entry {
    value: Option<String>,
    created_index: u64,
    modified_index: u64,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_dir(&self) -> bool {
        self.value.is_none()
    }
}

#[derive(Debug)]
struct StoreState {
    entries: BTreeMap<String, Entry>,
    index: u64,
    history: VecDeque<KvEvent>,
    capacity: usize,
    cleared_through: u64,
}

/// Hierarchical key-value store held entirely in memory.
///
/// Cheap to share behind an `Arc`; all operations take a short internal lock
/// and never hold it across an await point.
#[derive(Debug)]
pub struct InMemoryKvStore {
    state: Mutex<StoreState>,
    changed: Notify,
}

impl InMemoryKvStore {
    /// Create an empty store retaining [`DEFAULT_HISTORY_CAPACITY`] events.
    pub fn new() -> Self {
        Self::with_history(DEFAULT_HISTORY_CAPACITY)
    }

    /// Create an empty store sized by the `watch_history` setting.
    pub fn from_settings(settings: &StoreSettings) -> Self {
        Self::with_history(settings.watch_history)
    }

    /// Create an empty store retaining `capacity` events for watchers.
    pub fn with_history(capacity: usize) -> Self {
        Self {
            state: Mutex::new(StoreState {
                entries: BTreeMap::new(),
                index: 0,
                history: VecDeque::with_capacity(capacity.min(4096)),
                capacity: capacity.max(1),
                cleared_through: 0,
            }),
            changed: Notify::new(),
        }
    }

    fn lock(&self) -> KvResult<MutexGuard<'_, StoreState>> {
        self.state
            .lock()
            .map_err(|_| KvError::Unavailable("store lock poisoned".to_string()))
    }

    /// Release the lock and wake watchers if anything was recorded.
    fn finish(&self, state: MutexGuard<'_, StoreState>, emitted: bool) {
        drop(state);
        if emitted {
            self.changed.notify_waiters();
        }
    }
}

impl Default for InMemoryKvStore {
    fn default() -> Self {
        Self::new()
    }
}

fn normalize(key: &str) -> String {
    let trimmed = key.trim_matches('/');
    if trimmed.is_empty() {
        ROOT.to_string()
    } else {
        format!("/{trimmed}")
    }
}

fn child_prefix(key: &str) -> String {
    if key == ROOT {
        ROOT.to_string()
    } else {
        format!("{key}/")
    }
}

fn under_prefix(key: &str, prefix: &str) -> bool {
    prefix == ROOT || key == prefix || key.starts_with(&child_prefix(prefix))
}

fn ancestors(key: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut end = 0;
    while let Some(pos) = key[end + 1..].find('/') {
        end += pos + 1;
        out.push(key[..end].to_string());
    }
    out
}

impl StoreState {
    fn record(&mut self, event: KvEvent) {
        self.history.push_back(event);
        self.trim_history();
    }

    fn trim_history(&mut self) {
        while self.history.len() > self.capacity {
            if let Some(evicted) = self.history.pop_front() {
                self.cleared_through = evicted.index;
            }
        }
    }

    /// Validate a write against the current keyspace and return the parent
    /// directories of `key`.
    fn check_write(
        &self,
        key: &str,
        existing: Option<&Entry>,
        options: SetOptions,
    ) -> KvResult<Vec<String>> {
        if existing.is_some_and(Entry::is_dir) {
            return Err(KvError::NotAFile {
                key: key.to_string(),
            });
        }
        match (options.prev_exist, existing.is_some()) {
            (Some(false), true) => {
                return Err(KvError::NodeExists {
                    key: key.to_string(),
                });
            }
            (Some(true), false) => {
                return Err(KvError::KeyNotFound {
                    key: key.to_string(),
                });
            }
            _ => {}
        }
        let parents = ancestors(key);
        if let Some(blocked) = parents
            .iter()
            .find(|p| self.entries.get(*p).is_some_and(|e| !e.is_dir()))
        {
            return Err(KvError::NotADirectory {
                key: blocked.clone(),
            });
        }
        Ok(parents)
    }

    fn next_expiry(&self) -> Option<Instant> {
        self.entries.values().filter_map(|e| e.expires_at).min()
    }

    /// Drop every key whose TTL elapsed, recording one `expire` event per key.
    fn purge_expired(&mut self, now: Instant) -> bool {
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, e)| e.expires_at.is_some_and(|at| at <= now))
            .map(|(k, _)| k.clone())
            .collect();

        for key in &expired {
            let prev = self.build_node(key, true);
            self.entries.remove(key);
            self.index += 1;
            let index = self.index;
            self.record(KvEvent {
                action: KvAction::Expire,
                node: Node {
                    key: key.clone(),
                    created_index: prev.as_ref().map_or(0, |n| n.created_index),
                    modified_index: index,
                    ..Default::default()
                },
                prev_node: prev,
                index,
            });
        }
        !expired.is_empty()
    }

    fn children(&self, key: &str) -> Vec<String> {
        let prefix = child_prefix(key);
        self.entries
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .filter(|(k, _)| !k[prefix.len()..].contains('/'))
            .map(|(k, _)| k.clone())
            .collect()
    }

    fn shallow_node(&self, key: &str) -> Option<Node> {
        let entry = self.entries.get(key)?;
        Some(Node {
            key: key.to_string(),
            value: entry.value.clone(),
            dir: entry.is_dir(),
            nodes: Vec::new(),
            created_index: entry.created_index,
            modified_index: entry.modified_index,
        })
    }

    fn build_node(&self, key: &str, recursive: bool) -> Option<Node> {
        let (dir, value, created_index, modified_index) = if key == ROOT {
            (true, None, 0, 0)
        } else {
            let entry = self.entries.get(key)?;
            (
                entry.is_dir(),
                entry.value.clone(),
                entry.created_index,
                entry.modified_index,
            )
        };
        let nodes = if dir {
            self.children(key)
                .iter()
                .filter_map(|child| {
                    if recursive {
                        self.build_node(child, true)
                    } else {
                        self.shallow_node(child)
                    }
                })
                .collect()
        } else {
            Vec::new()
        };
        Some(Node {
            key: key.to_string(),
            value,
            dir,
            nodes,
            created_index,
            modified_index,
        })
    }
}

#[async_trait]
impl KvStore for InMemoryKvStore {
    async fn get(&self, key: &str, options: GetOptions) -> KvResult<KvEvent> {
        let key = normalize(key);
        let mut state = self.lock()?;
        let emitted = state.purge_expired(Instant::now());
        let node = state.build_node(&key, options.recursive);
        let index = state.index;
        self.finish(state, emitted);

        let node = node.ok_or(KvError::KeyNotFound { key })?;
        Ok(KvEvent {
            action: KvAction::Get,
            node,
            prev_node: None,
            index,
        })
    }

    async fn set(&self, key: &str, value: &str, options: SetOptions) -> KvResult<KvEvent> {
        let key = normalize(key);
        if key == ROOT {
            return Err(KvError::NotAFile { key });
        }
        let mut state = self.lock()?;
        let emitted = state.purge_expired(Instant::now());

        let existing = state.entries.get(&key).cloned();
        let parents = match state.check_write(&key, existing.as_ref(), options) {
            Ok(parents) => parents,
            Err(e) => {
                self.finish(state, emitted);
                return Err(e);
            }
        };

        let prev_node = state.build_node(&key, false);
        state.index += 1;
        let index = state.index;
        for parent in parents {
            state.entries.entry(parent).or_insert(Entry {
                value: None,
                created_index: index,
                modified_index: index,
                expires_at: None,
            });
        }
        let created_index = existing.as_ref().map_or(index, |e| e.created_index);
        state.entries.insert(
            key.clone(),
            Entry {
                value: Some(value.to_string()),
                created_index,
                modified_index: index,
                expires_at: options.ttl.map(|ttl| Instant::now() + ttl),
            },
        );

        let action = match options.prev_exist {
            Some(false) => KvAction::Create,
            Some(true) => KvAction::Update,
            None => KvAction::Set,
        };
        let event = KvEvent {
            action,
            node: Node {
                key,
                value: Some(value.to_string()),
                dir: false,
                nodes: Vec::new(),
                created_index,
                modified_index: index,
            },
            prev_node,
            index,
        };
        state.record(event.clone());
        self.finish(state, true);
        Ok(event)
    }

    async fn delete(&self, key: &str, recursive: bool) -> KvResult<KvEvent> {
        let key = normalize(key);
        if key == ROOT {
            return Err(KvError::NotAFile { key });
        }
        let mut state = self.lock()?;
        let emitted = state.purge_expired(Instant::now());

        let Some(entry) = state.entries.get(&key).cloned() else {
            self.finish(state, emitted);
            return Err(KvError::KeyNotFound { key });
        };
        if entry.is_dir() && !recursive {
            self.finish(state, emitted);
            return Err(KvError::NotAFile { key });
        }

        let prev_node = state.build_node(&key, true);
        let prefix = child_prefix(&key);
        state.entries.retain(|k, _| k != &key && !k.starts_with(&prefix));
        state.index += 1;
        let index = state.index;
        let event = KvEvent {
            action: KvAction::Delete,
            node: Node {
                key,
                value: None,
                dir: entry.is_dir(),
                nodes: Vec::new(),
                created_index: entry.created_index,
                modified_index: index,
            },
            prev_node,
            index,
        };
        state.record(event.clone());
        self.finish(state, true);
        Ok(event)
    }

    async fn watch(&self, prefix: &str, wait_index: u64) -> KvResult<KvEvent> {
        let prefix = normalize(prefix);
        let mut wait_index = wait_index;
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let next_expiry = {
                let mut state = self.lock()?;
                let emitted = state.purge_expired(Instant::now());
                if wait_index == 0 {
                    wait_index = state.index + 1;
                }
                if wait_index <= state.cleared_through {
                    let oldest = state.cleared_through + 1;
                    self.finish(state, emitted);
                    return Err(KvError::IndexCleared {
                        requested: wait_index,
                        oldest,
                    });
                }
                let found = state
                    .history
                    .iter()
                    .find(|e| e.index >= wait_index && under_prefix(&e.node.key, &prefix))
                    .cloned();
                let next_expiry = state.next_expiry();
                self.finish(state, emitted);
                if let Some(event) = found {
                    return Ok(event);
                }
                next_expiry
            };

            match next_expiry {
                Some(deadline) => {
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = tokio::time::sleep_until(deadline) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    async fn current_index(&self) -> KvResult<u64> {
        let mut state = self.lock()?;
        let emitted = state.purge_expired(Instant::now());
        let index = state.index;
        self.finish(state, emitted);
        Ok(index)
    }
}
