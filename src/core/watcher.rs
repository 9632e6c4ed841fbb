//! Change feed: turns raw store notifications into [`ChangeEvent`]s.
//!
//! A watcher optionally replays the current tree as `*Added` events, then
//! blocks on the store's watch primitive and classifies every notification by
//! key shape and action. Mutations made directly against the store are
//! translated the same way as those made through [`BackendStore`].
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::{
    config::StoreSettings,
    core::{
        backend::{BackendError, BackendResult, BackendStore, Snapshot},
        changes::ChangeEvent,
        keys::KeyRef,
    },
    ports::kv_store::{KvAction, KvEvent},
    tracing_setup::component_span,
};

/// Lifecycle of a [`ChangeWatcher`]; `Stopped` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatcherState {
    Idle,
    Replaying,
    Watching,
    Stopped,
}

/// Bounded, ordered channel for change events.
pub fn event_channel(capacity: usize) -> (mpsc::Sender<ChangeEvent>, mpsc::Receiver<ChangeEvent>) {
    mpsc::channel(capacity.max(1))
}

/// [`event_channel`] sized by the `event_buffer` setting.
pub fn event_channel_for(
    settings: &StoreSettings,
) -> (mpsc::Sender<ChangeEvent>, mpsc::Receiver<ChangeEvent>) {
    event_channel(settings.event_buffer)
}

#[derive(Debug)]
pub struct ChangeWatcher {
    backend: BackendStore,
    cancel: CancellationToken,
    started: AtomicBool,
    state: watch::Sender<WatcherState>,
}

impl ChangeWatcher {
    pub fn new(backend: BackendStore) -> Self {
        let (state, _) = watch::channel(WatcherState::Idle);
        Self {
            backend,
            cancel: CancellationToken::new(),
            started: AtomicBool::new(false),
            state,
        }
    }

    pub fn backend(&self) -> &BackendStore {
        &self.backend
    }

    pub fn state(&self) -> WatcherState {
        *self.state.borrow()
    }

    /// Observe state transitions, e.g. to wait until the watcher is live.
    pub fn subscribe(&self) -> watch::Receiver<WatcherState> {
        self.state.subscribe()
    }

    /// Request the loop to exit. No further notification is read once this
    /// returns; a blocked watch or send is interrupted.
    pub fn stop_watching(&self) {
        self.cancel.cancel();
    }

    /// Run the feed until stopped, the sink is closed, or the store fails.
    ///
    /// A watcher runs once; calling this again fails with
    /// [`BackendError::WatcherState`]. Watch failures (including a compacted
    /// history) are returned to the caller, who may start a new watcher with
    /// `replay_existing` to rebuild its view.
    pub async fn watch_changes(
        &self,
        sink: mpsc::Sender<ChangeEvent>,
        replay_existing: bool,
    ) -> BackendResult<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(BackendError::WatcherState {
                message: format!("watcher already started, state is {:?}", self.state()),
            });
        }

        let span = component_span("change_watcher");
        let result = self.run(&sink, replay_existing).instrument(span).await;
        self.state.send_replace(WatcherState::Stopped);
        match &result {
            Ok(()) => tracing::info!("Change watcher stopped"),
            Err(e) => tracing::warn!(error = %e, "Change watcher failed"),
        }
        result
    }

    async fn run(&self, sink: &mpsc::Sender<ChangeEvent>, replay_existing: bool) -> BackendResult<()> {
        if self.cancel.is_cancelled() {
            return Ok(());
        }
        let kv = self.backend.kv();

        let mut index = if replay_existing {
            self.state.send_replace(WatcherState::Replaying);
            let snapshot = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Ok(()),
                snapshot = self.backend.snapshot() => snapshot?,
            };
            let index = snapshot.index;
            let events = replay_events(snapshot);
            tracing::info!(events = events.len(), index, "Replaying existing configuration");
            for event in events {
                if !self.emit(sink, event).await {
                    return Ok(());
                }
            }
            index + 1
        } else {
            kv.current_index().await? + 1
        };

        self.state.send_replace(WatcherState::Watching);
        let root = self.backend.keys().root().to_string();
        tracing::info!(prefix = %root, index, "Watching for changes");

        loop {
            let event = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Ok(()),
                event = kv.watch(&root, index) => event?,
            };
            index = event.index + 1;

            let change = match self.translate(&event).await {
                Ok(Some(change)) => change,
                Ok(None) => continue,
                Err(e) if e.is_not_found() => {
                    // The entity changed again before it could be read back.
                    tracing::warn!(key = %event.node.key, action = %event.action, error = %e, "Skipping stale notification");
                    continue;
                }
                Err(e) => return Err(e),
            };
            if !self.emit(sink, change).await {
                return Ok(());
            }
        }
    }

    /// Send one event; `false` once the watcher must stop.
    async fn emit(&self, sink: &mpsc::Sender<ChangeEvent>, event: ChangeEvent) -> bool {
        tracing::debug!(kind = event.kind(), "Emitting change");
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            sent = sink.send(event) => {
                if sent.is_err() {
                    tracing::info!("Change sink closed");
                }
                sent.is_ok()
            }
        }
    }

    /// Map one store notification onto at most one change event.
    async fn translate(&self, event: &KvEvent) -> BackendResult<Option<ChangeEvent>> {
        let backend = &self.backend;
        let Some(key_ref) = backend.keys().classify(&event.node.key) else {
            tracing::debug!(key = %event.node.key, "Ignoring key outside the layout");
            return Ok(None);
        };
        let removal = event.action.is_removal();
        let created = event.action == KvAction::Create;
        let updated = matches!(event.action, KvAction::Set | KvAction::Update);

        let change = match key_ref {
            KeyRef::HostRecord { host } if created => ChangeEvent::HostAdded {
                host: backend.get_host(&host).await?,
            },
            KeyRef::HostRecord { host } | KeyRef::HostDir { host } if removal => {
                ChangeEvent::HostDeleted { name: host }
            }
            KeyRef::KeyPair { host } => ChangeEvent::HostKeyPairUpdated {
                host: backend.get_host(&host).await?,
            },
            KeyRef::Listener { host, id } if removal => ChangeEvent::HostListenerDeleted {
                host: backend.get_host(&host).await?,
                listener_id: id,
            },
            KeyRef::Listener { host, id } => {
                let host = backend.get_host(&host).await?;
                let listener = host
                    .listeners
                    .iter()
                    .find(|l| l.id == id)
                    .cloned()
                    .ok_or_else(|| BackendError::not_found("listener", &id))?;
                ChangeEvent::HostListenerAdded { host, listener }
            }
            KeyRef::LocationDir { host, location } if removal => ChangeEvent::LocationDeleted {
                host: backend.get_host(&host).await?,
                location_id: location,
            },
            KeyRef::LocationUpstream { host, location } if !removal => {
                ChangeEvent::LocationUpstreamUpdated {
                    host: backend.get_host(&host).await?,
                    location: backend.get_location(&host, &location).await?,
                }
            }
            KeyRef::LocationOptions { host, location } if updated => {
                ChangeEvent::LocationOptionsUpdated {
                    host: backend.get_host(&host).await?,
                    location: backend.get_location(&host, &location).await?,
                }
            }
            KeyRef::Middleware {
                host,
                location,
                type_name,
                id,
            } if removal => ChangeEvent::LocationMiddlewareDeleted {
                host: backend.get_host(&host).await?,
                location: backend.get_location(&host, &location).await?,
                middleware_id: id,
                middleware_type: type_name,
            },
            KeyRef::Middleware {
                host,
                location,
                type_name,
                id,
            } => {
                if created && self.arrives_with_location(&host, &location, event.index).await? {
                    tracing::debug!(host = %host, location = %location, middleware = %id, "Middleware written with its location");
                    return Ok(None);
                }
                let middleware = backend
                    .get_location_middleware(&host, &location, &type_name, &id)
                    .await?;
                let location = backend.get_location(&host, &location).await?;
                let host = backend.get_host(&host).await?;
                if created {
                    ChangeEvent::LocationMiddlewareAdded {
                        host,
                        location,
                        middleware,
                    }
                } else {
                    ChangeEvent::LocationMiddlewareUpdated {
                        host,
                        location,
                        middleware,
                    }
                }
            }
            KeyRef::UpstreamRecord { upstream } if created => ChangeEvent::UpstreamAdded {
                upstream: backend.get_upstream(&upstream).await?,
            },
            KeyRef::UpstreamRecord { upstream } if updated => {
                ChangeEvent::UpstreamOptionsUpdated {
                    upstream: backend.get_upstream(&upstream).await?,
                }
            }
            KeyRef::UpstreamDir { upstream } if removal => ChangeEvent::UpstreamDeleted {
                upstream_id: upstream,
            },
            KeyRef::Endpoint { upstream, id } => {
                let affected_locations = backend.locations_using_upstream(&upstream).await?;
                let upstream = backend.get_upstream(&upstream).await?;
                if removal {
                    ChangeEvent::EndpointDeleted {
                        upstream,
                        endpoint_id: id,
                        affected_locations,
                    }
                } else {
                    let endpoint = upstream
                        .endpoints
                        .iter()
                        .find(|e| e.id == id)
                        .cloned()
                        .ok_or_else(|| BackendError::not_found("endpoint", &id))?;
                    if created {
                        ChangeEvent::EndpointAdded {
                            upstream,
                            endpoint,
                            affected_locations,
                        }
                    } else {
                        ChangeEvent::EndpointUpdated {
                            upstream,
                            endpoint,
                            affected_locations,
                        }
                    }
                }
            }
            other => {
                tracing::debug!(key = ?other, action = %event.action, "No change event for notification");
                return Ok(None);
            }
        };
        Ok(Some(change))
    }

    /// Whether a middleware created at `index` is part of its location's
    /// initial write. The location's upstream key comes last, so the
    /// `LocationUpstreamUpdated` that follows already carries the middleware.
    async fn arrives_with_location(
        &self,
        host: &str,
        location: &str,
        index: u64,
    ) -> BackendResult<bool> {
        Ok(match self.backend.location_completed_at(host, location).await? {
            Some(completed) => completed > index,
            None => true,
        })
    }
}

/// `*Added` events describing a snapshot, dependencies first: each upstream
/// followed by its endpoints, then each host followed by its locations.
fn replay_events(snapshot: Snapshot) -> Vec<ChangeEvent> {
    let Snapshot {
        upstreams, hosts, ..
    } = snapshot;
    let mut events = Vec::new();

    for upstream in upstreams {
        let affected_locations: Vec<_> = hosts
            .iter()
            .flat_map(|h| h.locations.iter())
            .filter(|l| l.upstream.id == upstream.id)
            .cloned()
            .collect();
        events.push(ChangeEvent::UpstreamAdded {
            upstream: upstream.clone(),
        });
        for endpoint in &upstream.endpoints {
            events.push(ChangeEvent::EndpointAdded {
                upstream: upstream.clone(),
                endpoint: endpoint.clone(),
                affected_locations: affected_locations.clone(),
            });
        }
    }

    for host in hosts {
        events.push(ChangeEvent::HostAdded { host: host.clone() });
        for location in &host.locations {
            events.push(ChangeEvent::LocationAdded {
                host: host.clone(),
                location: location.clone(),
            });
        }
    }
    events
}
