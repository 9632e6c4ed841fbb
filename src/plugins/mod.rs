//! Built-in middleware plugins.
//!
//! Each plugin exposes a `spec()` for registration; [`default_registry`]
//! registers all of them.
pub mod connlimit;
pub mod ratelimit;

use crate::core::{
    model::{ValidationError, ValidationResult},
    plugin::{Registry, RegistryError},
};

/// Registry with every built-in plugin registered.
pub fn default_registry() -> Result<Registry, RegistryError> {
    let mut registry = Registry::new();
    registry.add_spec(ratelimit::spec())?;
    registry.add_spec(connlimit::spec())?;
    Ok(registry)
}

const HEADER_PREFIX: &str = "request.header.";

/// Check a limiting variable: `client.ip`, `request.host` or `request.header.<Name>`.
pub(crate) fn validate_variable(field: &str, variable: &str) -> ValidationResult<()> {
    match variable {
        "client.ip" | "request.host" => Ok(()),
        v if v.strip_prefix(HEADER_PREFIX).is_some_and(|name| !name.is_empty()) => Ok(()),
        _ => Err(ValidationError::Unsupported {
            field: field.to_string(),
            value: variable.to_string(),
            supported: "client.ip, request.host and request.header.<Name>".to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_registry() {
        let registry = default_registry().unwrap();
        assert!(registry.get_spec(ratelimit::TYPE).is_some());
        assert!(registry.get_spec(connlimit::TYPE).is_some());
        assert_eq!(registry.get_specs().len(), 2);
    }

    #[test]
    fn test_validate_variable() {
        assert!(validate_variable("variable", "client.ip").is_ok());
        assert!(validate_variable("variable", "request.host").is_ok());
        assert!(validate_variable("variable", "request.header.X-Forwarded-For").is_ok());
        assert!(validate_variable("variable", "request.header.").is_err());
        assert!(validate_variable("variable", "foo").is_err());
        assert!(validate_variable("variable", "").is_err());
    }
}
