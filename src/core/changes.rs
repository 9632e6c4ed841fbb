//! Typed configuration change events.
//!
//! One closed union so consumers match exhaustively. Events carry entities as
//! re-read from the store after the mutation was applied.
use serde::Serialize;

use crate::core::model::{Endpoint, Host, Listener, Location, MiddlewareInstance, Upstream};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChangeEvent {
    HostAdded {
        host: Host,
    },
    HostDeleted {
        name: String,
    },
    HostKeyPairUpdated {
        host: Host,
    },
    HostListenerAdded {
        host: Host,
        listener: Listener,
    },
    HostListenerDeleted {
        host: Host,
        listener_id: String,
    },
    UpstreamAdded {
        upstream: Upstream,
    },
    UpstreamDeleted {
        upstream_id: String,
    },
    UpstreamOptionsUpdated {
        upstream: Upstream,
    },
    EndpointAdded {
        upstream: Upstream,
        endpoint: Endpoint,
        affected_locations: Vec<Location>,
    },
    EndpointUpdated {
        upstream: Upstream,
        endpoint: Endpoint,
        affected_locations: Vec<Location>,
    },
    EndpointDeleted {
        upstream: Upstream,
        endpoint_id: String,
        affected_locations: Vec<Location>,
    },
    LocationAdded {
        host: Host,
        location: Location,
    },
    LocationUpstreamUpdated {
        host: Host,
        location: Location,
    },
    LocationOptionsUpdated {
        host: Host,
        location: Location,
    },
    LocationDeleted {
        host: Host,
        location_id: String,
    },
    LocationMiddlewareAdded {
        host: Host,
        location: Location,
        middleware: MiddlewareInstance,
    },
    LocationMiddlewareUpdated {
        host: Host,
        location: Location,
        middleware: MiddlewareInstance,
    },
    LocationMiddlewareDeleted {
        host: Host,
        location: Location,
        middleware_id: String,
        middleware_type: String,
    },
}

impl ChangeEvent {
    /// Short name used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            ChangeEvent::HostAdded { .. } => "host_added",
            ChangeEvent::HostDeleted { .. } => "host_deleted",
            ChangeEvent::HostKeyPairUpdated { .. } => "host_key_pair_updated",
            ChangeEvent::HostListenerAdded { .. } => "host_listener_added",
            ChangeEvent::HostListenerDeleted { .. } => "host_listener_deleted",
            ChangeEvent::UpstreamAdded { .. } => "upstream_added",
            ChangeEvent::UpstreamDeleted { .. } => "upstream_deleted",
            ChangeEvent::UpstreamOptionsUpdated { .. } => "upstream_options_updated",
            ChangeEvent::EndpointAdded { .. } => "endpoint_added",
            ChangeEvent::EndpointUpdated { .. } => "endpoint_updated",
            ChangeEvent::EndpointDeleted { .. } => "endpoint_deleted",
            ChangeEvent::LocationAdded { .. } => "location_added",
            ChangeEvent::LocationUpstreamUpdated { .. } => "location_upstream_updated",
            ChangeEvent::LocationOptionsUpdated { .. } => "location_options_updated",
            ChangeEvent::LocationDeleted { .. } => "location_deleted",
            ChangeEvent::LocationMiddlewareAdded { .. } => "location_middleware_added",
            ChangeEvent::LocationMiddlewareUpdated { .. } => "location_middleware_updated",
            ChangeEvent::LocationMiddlewareDeleted { .. } => "location_middleware_deleted",
        }
    }
}
