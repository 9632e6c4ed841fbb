//! Decoding of JSON documents that carry middleware configuration.
//!
//! Hosts and locations cannot derive `Deserialize` because each middleware's
//! concrete type is only known through the [`Registry`]. The raw mirrors
//! below hold the middleware as an untyped value until the registry resolves it.
use serde::Deserialize;
use serde_json::Value;

use super::{
    error::DecodeError,
    host::{Host, HostOptions, KeyPair, Listener},
    location::{Location, LocationOptions, MiddlewareInstance},
    upstream::{Endpoint, Upstream},
};
use crate::core::plugin::Registry;

#[derive(Debug, Deserialize)]
pub(crate) struct RawMiddlewareInstance {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub priority: usize,
    #[serde(rename = "type")]
    pub type_name: String,
    pub middleware: Value,
}

impl RawMiddlewareInstance {
    pub(crate) fn resolve(self, registry: &Registry) -> Result<MiddlewareInstance, DecodeError> {
        let spec = registry
            .get_spec(&self.type_name)
            .ok_or_else(|| DecodeError::UnknownMiddleware {
                type_name: self.type_name.clone(),
            })?;
        let middleware = spec.from_value(self.middleware)?;
        let mut instance = MiddlewareInstance::new(&self.id, &self.type_name, middleware)?;
        instance.priority = self.priority;
        Ok(instance)
    }
}

#[derive(Debug, Deserialize)]
struct RawLocation {
    hostname: String,
    path: String,
    #[serde(default)]
    id: String,
    upstream: Upstream,
    #[serde(default)]
    middlewares: Vec<RawMiddlewareInstance>,
    #[serde(default)]
    options: LocationOptions,
}

impl RawLocation {
    fn resolve(self, registry: &Registry) -> Result<Location, DecodeError> {
        let middlewares = self
            .middlewares
            .into_iter()
            .map(|m| m.resolve(registry))
            .collect::<Result<Vec<_>, _>>()?;
        let location = Location {
            hostname: self.hostname,
            path: self.path,
            id: self.id,
            upstream: self.upstream,
            middlewares,
            options: self.options,
        };
        location.validate()?;
        Ok(location)
    }
}

#[derive(Debug, Deserialize)]
struct RawHost {
    name: String,
    #[serde(default)]
    locations: Vec<RawLocation>,
    #[serde(default)]
    key_pair: Option<KeyPair>,
    #[serde(default)]
    listeners: Vec<Listener>,
    #[serde(default)]
    options: HostOptions,
}

impl RawHost {
    fn resolve(self, registry: &Registry) -> Result<Host, DecodeError> {
        let locations = self
            .locations
            .into_iter()
            .map(|l| l.resolve(registry))
            .collect::<Result<Vec<_>, _>>()?;
        let host = Host {
            name: self.name,
            locations,
            key_pair: self.key_pair,
            listeners: self.listeners,
            options: self.options,
        };
        host.validate()?;
        Ok(host)
    }
}

#[derive(Debug, Deserialize)]
struct HostsDocument {
    #[serde(default)]
    hosts: Vec<RawHost>,
}

/// Decode `{"hosts": [...]}`.
pub fn hosts_from_json(bytes: &[u8], registry: &Registry) -> Result<Vec<Host>, DecodeError> {
    let doc: HostsDocument = serde_json::from_slice(bytes)?;
    doc.hosts.into_iter().map(|h| h.resolve(registry)).collect()
}

pub fn host_from_json(bytes: &[u8], registry: &Registry) -> Result<Host, DecodeError> {
    let raw: RawHost = serde_json::from_slice(bytes)?;
    raw.resolve(registry)
}

pub fn location_from_json(bytes: &[u8], registry: &Registry) -> Result<Location, DecodeError> {
    let raw: RawLocation = serde_json::from_slice(bytes)?;
    raw.resolve(registry)
}

/// Decode one middleware instance as stored under a location.
pub fn middleware_from_json(
    bytes: &[u8],
    registry: &Registry,
) -> Result<MiddlewareInstance, DecodeError> {
    let raw: RawMiddlewareInstance = serde_json::from_slice(bytes)?;
    raw.resolve(registry)
}

pub fn upstream_from_json(bytes: &[u8]) -> Result<Upstream, DecodeError> {
    let upstream: Upstream = serde_json::from_slice(bytes)?;
    upstream.validate()?;
    for endpoint in &upstream.endpoints {
        endpoint.validate()?;
    }
    Ok(upstream)
}

pub fn endpoint_from_json(bytes: &[u8]) -> Result<Endpoint, DecodeError> {
    let endpoint: Endpoint = serde_json::from_slice(bytes)?;
    endpoint.validate()?;
    Ok(endpoint)
}

pub fn listener_from_json(bytes: &[u8]) -> Result<Listener, DecodeError> {
    let listener: Listener = serde_json::from_slice(bytes)?;
    listener.validate()?;
    Ok(listener)
}

#[cfg(test)]
mod tests {
    use std::{fmt, sync::Arc};

    use serde::Serialize;

    use super::*;
    use crate::core::plugin::MiddlewareSpec;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Marker {
        tag: String,
    }

    impl fmt::Display for Marker {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "tag={}", self.tag)
        }
    }

    fn registry() -> Registry {
        let mut registry = Registry::new();
        registry
            .add_spec(
                MiddlewareSpec::new("marker")
                    .with_conversion(|m: Marker| Ok::<_, std::convert::Infallible>(m)),
            )
            .unwrap();
        registry
    }

    fn sample_host() -> Host {
        let mut host = Host::new("localhost").unwrap();
        host.listeners
            .push(Listener::new("l1", "http", "tcp", "127.0.0.1:8080").unwrap());
        let mut location = Location::new("localhost", "loc1", "/home", "up1").unwrap();
        let mut instance = MiddlewareInstance::new(
            "m1",
            "marker",
            Arc::new(Marker {
                tag: "a".to_string(),
            }),
        )
        .unwrap();
        instance.priority = 0;
        location.middlewares.push(instance);
        host.locations.push(location);
        host
    }

    #[test]
    fn test_hosts_round_trip() {
        let hosts = vec![sample_host()];
        let bytes = serde_json::to_vec(&serde_json::json!({ "hosts": hosts })).unwrap();
        let out = hosts_from_json(&bytes, &registry()).unwrap();
        assert_eq!(out, hosts);
    }

    #[test]
    fn test_unknown_middleware_type() {
        let bytes = serde_json::to_vec(&sample_host()).unwrap();
        let err = host_from_json(&bytes, &Registry::new()).unwrap_err();
        assert!(matches!(err, DecodeError::UnknownMiddleware { .. }));
    }

    #[test]
    fn test_upstream_from_json() {
        let mut up = Upstream::new("up1").unwrap();
        up.endpoints
            .push(Endpoint::new("up1", "e1", "http://localhost:5000").unwrap());
        let bytes = serde_json::to_vec(&up).unwrap();
        assert_eq!(upstream_from_json(&bytes).unwrap(), up);
    }

    #[test]
    fn test_endpoint_from_json() {
        let e = Endpoint::new("u1", "e1", "http://localhost:5000").unwrap();
        let bytes = serde_json::to_vec(&e).unwrap();
        assert_eq!(endpoint_from_json(&bytes).unwrap(), e);

        let bad = br#"{"id":"e1","url":"not a url","upstream_id":"u1"}"#;
        assert!(matches!(
            endpoint_from_json(bad),
            Err(DecodeError::Validation(_))
        ));
        assert!(matches!(endpoint_from_json(b"{"), Err(DecodeError::Json(_))));
    }
}
