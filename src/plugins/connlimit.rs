//! Simultaneous connection limiting keyed by a request variable.
use std::fmt;

use serde::{Deserialize, Serialize};

use super::validate_variable;
use crate::core::{
    model::{ValidationError, ValidationResult},
    plugin::MiddlewareSpec,
};

pub const TYPE: &str = "connlimit";

pub fn spec() -> MiddlewareSpec {
    MiddlewareSpec::new(TYPE).with_conversion(ConnLimit::from_config)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnLimit {
    pub connections: i64,
    /// e.g. `client.ip` or `request.header.X-My-Header`
    pub variable: String,
}

impl ConnLimit {
    pub fn new(connections: i64, variable: &str) -> ValidationResult<Self> {
        Self::from_config(Self {
            connections,
            variable: variable.to_string(),
        })
    }

    fn from_config(config: ConnLimit) -> ValidationResult<Self> {
        validate_variable("variable", &config.variable)?;
        if config.connections < 0 {
            return Err(ValidationError::invalid(
                "connections",
                format!("should be >= 0, got {}", config.connections),
            ));
        }
        Ok(config)
    }
}

impl fmt::Display for ConnLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "connections={}, variable={}",
            self.connections, self.variable
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new() {
        let cl = ConnLimit::new(10, "client.ip").unwrap();
        assert_eq!(cl.to_string(), "connections=10, variable=client.ip");
    }

    #[test]
    fn test_bad_params() {
        assert!(ConnLimit::new(-1, "client.ip").is_err());
        assert!(ConnLimit::new(1, "foo").is_err());
    }

    #[test]
    fn test_from_json() {
        let m = spec()
            .from_json(br#"{"connections":5,"variable":"request.host"}"#)
            .unwrap();
        assert_eq!(m.to_string(), "connections=5, variable=request.host");
        assert!(spec().from_json(br#"{"connections":5}"#).is_err());
    }
}
