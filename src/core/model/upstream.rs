//! Upstream pools and their endpoints.
use std::{fmt, time::Duration};

use serde::{Deserialize, Serialize};

use super::error::{ValidationError, ValidationResult, validate_id, validate_required_id};

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamTimeouts {
    /// Socket read timeout, before the first response header arrives
    pub read: String,
    /// Socket connect timeout
    pub dial: String,
    pub tls_handshake: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamKeepAlive {
    pub period: String,
    /// Idle connections kept per backend host
    pub max_idle_conns_per_host: u32,
}

/// Transport tuning as persisted; durations are kept in their textual form
/// (`"5s"`, `"300ms"`) and parsed by [`UpstreamOptions::transport_options`].
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamOptions {
    pub timeouts: UpstreamTimeouts,
    pub keep_alive: UpstreamKeepAlive,
}

/// Parsed transport options. `None` leaves the proxy's default in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TransportOptions {
    pub read_timeout: Option<Duration>,
    pub dial_timeout: Option<Duration>,
    pub tls_handshake_timeout: Option<Duration>,
    pub keep_alive_period: Option<Duration>,
    pub max_idle_conns_per_host: u32,
}

fn parse_duration(field: &str, value: &str) -> ValidationResult<Option<Duration>> {
    if value.is_empty() {
        return Ok(None);
    }
    humantime::parse_duration(value)
        .map(Some)
        .map_err(|e| ValidationError::invalid(field, format!("'{value}': {e}")))
}

impl UpstreamOptions {
    pub fn transport_options(&self) -> ValidationResult<TransportOptions> {
        Ok(TransportOptions {
            read_timeout: parse_duration("timeouts.read", &self.timeouts.read)?,
            dial_timeout: parse_duration("timeouts.dial", &self.timeouts.dial)?,
            tls_handshake_timeout: parse_duration(
                "timeouts.tls_handshake",
                &self.timeouts.tls_handshake,
            )?,
            keep_alive_period: parse_duration("keep_alive.period", &self.keep_alive.period)?,
            max_idle_conns_per_host: self.keep_alive.max_idle_conns_per_host,
        })
    }
}

/// A named pool of endpoints. Locations reference upstreams by id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Upstream {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub endpoints: Vec<Endpoint>,
    #[serde(default)]
    pub options: UpstreamOptions,
}

impl Upstream {
    /// An empty id is allowed; the store generates one on insert.
    pub fn new(id: &str) -> ValidationResult<Self> {
        Self::with_options(id, UpstreamOptions::default())
    }

    pub fn with_options(id: &str, options: UpstreamOptions) -> ValidationResult<Self> {
        validate_id("upstream id", id)?;
        options.transport_options()?;
        Ok(Self {
            id: id.to_string(),
            endpoints: Vec::new(),
            options,
        })
    }

    pub fn validate(&self) -> ValidationResult<()> {
        validate_id("upstream id", &self.id)?;
        self.options.transport_options().map(|_| ())
    }
}

impl fmt::Display for Upstream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Upstream(id={})", self.id)
    }
}

/// Final destination of a proxied request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    #[serde(default)]
    pub id: String,
    pub url: String,
    pub upstream_id: String,
}

impl Endpoint {
    pub fn new(upstream_id: &str, id: &str, url: &str) -> ValidationResult<Self> {
        let endpoint = Self {
            id: id.to_string(),
            url: url.to_string(),
            upstream_id: upstream_id.to_string(),
        };
        endpoint.validate()?;
        Ok(endpoint)
    }

    pub fn validate(&self) -> ValidationResult<()> {
        validate_required_id("upstream id", &self.upstream_id)?;
        validate_id("endpoint id", &self.id)?;
        let parsed = url::Url::parse(&self.url).map_err(|e| {
            ValidationError::invalid("url", format!("endpoint url '{}' is not valid: {e}", self.url))
        })?;
        if !parsed.has_host() {
            return Err(ValidationError::invalid(
                "url",
                format!("endpoint url '{}' has no host", self.url),
            ));
        }
        Ok(())
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Endpoint({}, {}, {})", self.id, self.upstream_id, self.url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_upstream() {
        let u = Upstream::new("u1").unwrap();
        assert_eq!(u.id, "u1");
        assert!(u.endpoints.is_empty());
        assert_eq!(u.to_string(), "Upstream(id=u1)");
    }

    #[test]
    fn test_upstream_options() {
        let options = UpstreamOptions {
            timeouts: UpstreamTimeouts {
                read: "1s".to_string(),
                dial: "2s".to_string(),
                tls_handshake: "3s".to_string(),
            },
            keep_alive: UpstreamKeepAlive {
                period: "4s".to_string(),
                max_idle_conns_per_host: 3,
            },
        };
        let u = Upstream::with_options("u1", options).unwrap();
        let t = u.options.transport_options().unwrap();
        assert_eq!(t.read_timeout, Some(Duration::from_secs(1)));
        assert_eq!(t.dial_timeout, Some(Duration::from_secs(2)));
        assert_eq!(t.tls_handshake_timeout, Some(Duration::from_secs(3)));
        assert_eq!(t.keep_alive_period, Some(Duration::from_secs(4)));
        assert_eq!(t.max_idle_conns_per_host, 3);

        let defaults = UpstreamOptions::default().transport_options().unwrap();
        assert_eq!(defaults, TransportOptions::default());
    }

    #[test]
    fn test_upstream_bad_options() {
        for (read, dial, tls, period) in [
            ("what?", "", "", ""),
            ("", "what?", "", ""),
            ("", "", "what?", ""),
            ("", "", "", "what?"),
        ] {
            let options = UpstreamOptions {
                timeouts: UpstreamTimeouts {
                    read: read.to_string(),
                    dial: dial.to_string(),
                    tls_handshake: tls.to_string(),
                },
                keep_alive: UpstreamKeepAlive {
                    period: period.to_string(),
                    max_idle_conns_per_host: 0,
                },
            };
            assert!(Upstream::with_options("u1", options).is_err());
        }
    }

    #[test]
    fn test_new_endpoint() {
        let e = Endpoint::new("u1", "e1", "http://localhost:5000").unwrap();
        assert_eq!(e.id, "e1");
        assert_eq!(e.upstream_id, "u1");
        assert_eq!(e.to_string(), "Endpoint(e1, u1, http://localhost:5000)");
    }

    #[test]
    fn test_endpoint_bad_params() {
        assert!(Endpoint::new("", "e1", "http://localhost").is_err());
        assert!(Endpoint::new("u1", "e1", "localhost").is_err());
        assert!(Endpoint::new("u1", "e1", "").is_err());
        assert!(Endpoint::new("u1", "e/1", "http://localhost").is_err());
    }
}
