//! Locations and the middleware attached to them.
use std::{fmt, sync::Arc};

use serde::{Deserialize, Serialize, Serializer, ser::SerializeStruct};

use super::{
    error::{ValidationError, ValidationResult, validate_id, validate_required_id},
    upstream::Upstream,
};
use crate::core::{plugin::Middleware, predicate::Predicate};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LocationLimits {
    /// Request bytes kept in memory before buffering to disk
    pub max_mem_body_bytes: i64,
    pub max_body_bytes: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LocationOptions {
    pub limits: LocationLimits,
    /// When a failed attempt may be retried on another endpoint
    pub failover_predicate: String,
    /// Hostname used in forwarding headers
    pub hostname: String,
    /// Append to existing forwarding headers instead of replacing them
    pub trust_forward_header: bool,
}

/// [`LocationOptions`] with the failover predicate compiled.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ParsedLocationOptions {
    pub limits: LocationLimits,
    pub failover_predicate: Option<Predicate>,
    pub hostname: String,
    pub trust_forward_header: bool,
}

impl LocationOptions {
    pub fn parse(&self) -> ValidationResult<ParsedLocationOptions> {
        if self.limits.max_mem_body_bytes < 0 || self.limits.max_body_bytes < 0 {
            return Err(ValidationError::invalid(
                "limits",
                "body limits can not be negative",
            ));
        }
        let failover_predicate = if self.failover_predicate.is_empty() {
            None
        } else {
            Some(
                Predicate::parse(&self.failover_predicate)
                    .map_err(|e| ValidationError::invalid("failover_predicate", e.to_string()))?,
            )
        };
        Ok(ParsedLocationOptions {
            limits: self.limits,
            failover_predicate,
            hostname: self.hostname.clone(),
            trust_forward_header: self.trust_forward_header,
        })
    }
}

/// A path pattern on a host, routed to one upstream through a middleware chain.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Location {
    pub hostname: String,
    pub path: String,
    pub id: String,
    pub upstream: Upstream,
    pub middlewares: Vec<MiddlewareInstance>,
    pub options: LocationOptions,
}

impl Location {
    pub fn new(hostname: &str, id: &str, path: &str, upstream_id: &str) -> ValidationResult<Self> {
        Self::with_options(hostname, id, path, upstream_id, LocationOptions::default())
    }

    pub fn with_options(
        hostname: &str,
        id: &str,
        path: &str,
        upstream_id: &str,
        options: LocationOptions,
    ) -> ValidationResult<Self> {
        let location = Self {
            hostname: hostname.to_string(),
            path: path.to_string(),
            id: id.to_string(),
            upstream: Upstream {
                id: upstream_id.to_string(),
                endpoints: Vec::new(),
                options: Default::default(),
            },
            middlewares: Vec::new(),
            options,
        };
        location.validate()?;
        Ok(location)
    }

    pub fn validate(&self) -> ValidationResult<()> {
        validate_required_id("hostname", &self.hostname)?;
        validate_id("location id", &self.id)?;
        validate_required_id("upstream", &self.upstream.id)?;
        validate_path(&self.path)?;
        for middleware in &self.middlewares {
            validate_id("middleware id", &middleware.id)?;
            validate_required_id("middleware type", &middleware.type_name)?;
        }
        self.options.parse().map(|_| ())
    }

    pub fn parsed_options(&self) -> ValidationResult<ParsedLocationOptions> {
        self.options.parse()
    }
}

pub(crate) fn validate_path(path: &str) -> ValidationResult<()> {
    if path.is_empty() {
        return Err(ValidationError::missing("path"));
    }
    regex::Regex::new(path)
        .map(|_| ())
        .map_err(|e| ValidationError::invalid("path", format!("not a valid regular expression: {e}")))
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Location({}/{}, {}, {})",
            self.hostname, self.id, self.path, self.upstream
        )
    }
}

/// A configured middleware on a location.
///
/// `priority` is the instance's position in the location's chain and is
/// maintained by the backend store.
#[derive(Debug, Clone)]
pub struct MiddlewareInstance {
    pub id: String,
    pub priority: usize,
    pub type_name: String,
    pub middleware: Arc<dyn Middleware>,
}

impl MiddlewareInstance {
    pub fn new(
        id: &str,
        type_name: &str,
        middleware: Arc<dyn Middleware>,
    ) -> ValidationResult<Self> {
        validate_id("middleware id", id)?;
        validate_required_id("middleware type", type_name)?;
        Ok(Self {
            id: id.to_string(),
            priority: 0,
            type_name: type_name.to_string(),
            middleware,
        })
    }
}

impl PartialEq for MiddlewareInstance {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.priority == other.priority
            && self.type_name == other.type_name
            && self.middleware.dyn_eq(other.middleware.as_ref())
    }
}

impl Serialize for MiddlewareInstance {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let middleware = self
            .middleware
            .to_json()
            .map_err(serde::ser::Error::custom)?;
        let mut state = serializer.serialize_struct("MiddlewareInstance", 4)?;
        state.serialize_field("id", &self.id)?;
        state.serialize_field("priority", &self.priority)?;
        state.serialize_field("type", &self.type_name)?;
        state.serialize_field("middleware", &middleware)?;
        state.end()
    }
}

impl fmt::Display for MiddlewareInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Middleware({}/{}, priority={}, {})",
            self.type_name, self.id, self.priority, self.middleware
        )
    }
}
