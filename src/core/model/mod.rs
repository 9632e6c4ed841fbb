//! Domain model of the routing configuration.
//!
//! Every entity is built through a validating constructor; values read back
//! from the store go through the same checks.
pub mod error;
pub mod host;
pub mod json;
pub mod location;
pub mod stats;
pub mod upstream;

use std::fmt;

pub use error::{DecodeError, ValidationError, ValidationResult};
pub use host::{Address, Host, HostOptions, KeyPair, Listener, Network, Protocol};
pub use json::{
    endpoint_from_json, host_from_json, hosts_from_json, listener_from_json, location_from_json,
    middleware_from_json, upstream_from_json,
};
pub use location::{
    Location, LocationLimits, LocationOptions, MiddlewareInstance, ParsedLocationOptions,
};
pub use stats::{
    Anomaly, Bracket, Counters, DEFAULT_QUANTILES, LatencyBrackets, RoundTripStats, StatusCode,
    Verdict,
};
pub use upstream::{
    Endpoint, TransportOptions, Upstream, UpstreamKeepAlive, UpstreamOptions, UpstreamTimeouts,
};

/// Identifies a location across hosts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LocationKey {
    pub hostname: String,
    pub id: String,
}

impl fmt::Display for LocationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.hostname, self.id)
    }
}

/// Identifies an endpoint across upstreams.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EndpointKey {
    pub upstream_id: String,
    pub id: String,
}

impl fmt::Display for EndpointKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.upstream_id, self.id)
    }
}

impl std::str::FromStr for EndpointKey {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('.') {
            Some((upstream_id, id)) if !upstream_id.is_empty() && !id.is_empty() => Ok(Self {
                upstream_id: upstream_id.to_string(),
                id: id.to_string(),
            }),
            _ => Err(ValidationError::invalid("endpoint key", format!("invalid id: '{s}'"))),
        }
    }
}

impl Location {
    pub fn key(&self) -> LocationKey {
        LocationKey {
            hostname: self.hostname.clone(),
            id: self.id.clone(),
        }
    }
}

impl Endpoint {
    pub fn key(&self) -> EndpointKey {
        EndpointKey {
            upstream_id: self.upstream_id.clone(),
            id: self.id.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keys() {
        let l = Location::new("localhost", "loc1", "/home", "u1").unwrap();
        assert_eq!(l.key().to_string(), "localhost.loc1");

        let e = Endpoint::new("u1", "e1", "http://localhost:5000").unwrap();
        assert_eq!(e.key().to_string(), "u1.e1");
        assert_eq!("u1.e1".parse::<EndpointKey>().unwrap(), e.key());
        assert!("u1".parse::<EndpointKey>().is_err());
    }
}
