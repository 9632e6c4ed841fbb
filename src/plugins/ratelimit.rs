//! Token-bucket rate limiting keyed by a request variable.
use std::fmt;

use serde::{Deserialize, Serialize};

use super::{HEADER_PREFIX, validate_variable};
use crate::core::{
    model::{ValidationError, ValidationResult},
    plugin::MiddlewareSpec,
};

pub const TYPE: &str = "ratelimit";

pub fn spec() -> MiddlewareSpec {
    MiddlewareSpec::new(TYPE).with_conversion(RateLimit::from_config)
}

/// Allow `requests` per `period_seconds` with an extra `burst`, counted per
/// value of `variable`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimit {
    pub period_seconds: i64,
    pub requests: i64,
    #[serde(default)]
    pub burst: i64,
    pub variable: String,
    /// Request header carrying per-request rate overrides
    #[serde(default)]
    pub rate_var: String,
}

impl RateLimit {
    pub fn new(
        period_seconds: i64,
        requests: i64,
        burst: i64,
        variable: &str,
        rate_var: &str,
    ) -> ValidationResult<Self> {
        Self::from_config(Self {
            period_seconds,
            requests,
            burst,
            variable: variable.to_string(),
            rate_var: rate_var.to_string(),
        })
    }

    fn from_config(config: RateLimit) -> ValidationResult<Self> {
        validate_variable("variable", &config.variable)?;
        if !config.rate_var.is_empty()
            && !config
                .rate_var
                .strip_prefix(HEADER_PREFIX)
                .is_some_and(|name| !name.is_empty())
        {
            return Err(ValidationError::Unsupported {
                field: "rate_var".to_string(),
                value: config.rate_var,
                supported: "request.header.<Name>".to_string(),
            });
        }
        if config.requests <= 0 {
            return Err(ValidationError::invalid(
                "requests",
                format!("should be > 0, got {}", config.requests),
            ));
        }
        if config.burst < 0 {
            return Err(ValidationError::invalid(
                "burst",
                format!("should be >= 0, got {}", config.burst),
            ));
        }
        if config.period_seconds <= 0 {
            return Err(ValidationError::invalid(
                "period_seconds",
                format!("should be > 0, got {}", config.period_seconds),
            ));
        }
        Ok(config)
    }
}

impl fmt::Display for RateLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "reqs/{}s={}, burst={}, var={}, rateVar={}",
            self.period_seconds, self.requests, self.burst, self.variable, self.rate_var
        )
    }
}
