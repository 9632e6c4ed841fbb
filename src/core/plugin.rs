//! Middleware plugin registry.
//!
//! A [`MiddlewareSpec`] ties a string type tag (as persisted in the store) to a
//! conversion from the tag's JSON configuration into a validated
//! [`Middleware`] value. The conversion's shape is fixed by the generic bounds
//! of [`MiddlewareSpec::with_conversion`]: one configuration value taken by
//! value, returning the middleware or an error. Registration additionally
//! rejects specs without a tag or without a conversion.
//!
//! The [`Registry`] is built once at start-up (`&mut self` registration) and
//! then shared read-only behind an `Arc`.
use std::{any::Any, collections::HashMap, fmt, sync::Arc};

use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;
use thiserror::Error;

/// Capability set every middleware configuration value provides.
///
/// Implemented for any serializable, comparable, printable configuration type.
pub trait Middleware: fmt::Debug + fmt::Display + Send + Sync + 'static {
    /// Serialized configuration, as persisted in the store.
    fn to_json(&self) -> serde_json::Result<Value>;

    /// Access to the concrete configuration type.
    fn as_any(&self) -> &dyn Any;

    /// Structural equality across trait objects.
    fn dyn_eq(&self, other: &dyn Middleware) -> bool;
}

impl<T> Middleware for T
where
    T: Serialize + PartialEq + fmt::Debug + fmt::Display + Send + Sync + 'static,
{
    fn to_json(&self) -> serde_json::Result<Value> {
        serde_json::to_value(self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn dyn_eq(&self, other: &dyn Middleware) -> bool {
        other
            .as_any()
            .downcast_ref::<T>()
            .is_some_and(|other| self == other)
    }
}

/// Errors constructing a middleware from its serialized configuration.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum PluginError {
    /// The bytes are not a valid configuration for the type
    #[error("Failed to decode '{type_name}' middleware: {source}")]
    Decode {
        type_name: String,
        #[source]
        source: serde_json::Error,
    },

    /// The configuration decoded but failed the plugin's validation
    #[error("Invalid '{type_name}' middleware: {message}")]
    Invalid { type_name: String, message: String },
}

/// Errors registering a spec.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum RegistryError {
    #[error("Middleware type '{type_name}' is already registered")]
    DuplicateType { type_name: String },

    #[error("Invalid middleware spec: {message}")]
    InvalidSpec { message: String },
}

type ConvertFn = Arc<dyn Fn(Value) -> Result<Arc<dyn Middleware>, PluginError> + Send + Sync>;

/// Registration record for one middleware kind.
#[derive(Clone)]
pub struct MiddlewareSpec {
    type_name: String,
    convert: Option<ConvertFn>,
}

impl MiddlewareSpec {
    /// Start a spec for the given type tag; a conversion must be attached
    /// before the spec can be registered.
    pub fn new(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            convert: None,
        }
    }

    /// Attach the conversion from the plugin's configuration type `C` into its
    /// middleware value.
    pub fn with_conversion<C, M, E, F>(mut self, convert: F) -> Self
    where
        C: DeserializeOwned,
        M: Middleware,
        E: fmt::Display,
        F: Fn(C) -> Result<M, E> + Send + Sync + 'static,
    {
        let type_name = self.type_name.clone();
        let convert: ConvertFn = Arc::new(move |value: Value| -> Result<Arc<dyn Middleware>, PluginError> {
            let config: C = serde_json::from_value(value).map_err(|source| PluginError::Decode {
                type_name: type_name.clone(),
                source,
            })?;
            let middleware = convert(config).map_err(|e| PluginError::Invalid {
                type_name: type_name.clone(),
                message: e.to_string(),
            })?;
            Ok(Arc::new(middleware))
        });
        self.convert = Some(convert);
        self
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// Decode `bytes` into the plugin's configuration and run its conversion.
    pub fn from_json(&self, bytes: &[u8]) -> Result<Arc<dyn Middleware>, PluginError> {
        let value: Value = serde_json::from_slice(bytes).map_err(|source| PluginError::Decode {
            type_name: self.type_name.clone(),
            source,
        })?;
        self.from_value(value)
    }

    /// Same as [`from_json`](Self::from_json) for an already parsed document.
    pub fn from_value(&self, value: Value) -> Result<Arc<dyn Middleware>, PluginError> {
        match &self.convert {
            Some(convert) => convert(value),
            None => Err(PluginError::Invalid {
                type_name: self.type_name.clone(),
                message: "no conversion registered".to_string(),
            }),
        }
    }
}

impl fmt::Debug for MiddlewareSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MiddlewareSpec")
            .field("type_name", &self.type_name)
            .field("has_conversion", &self.convert.is_some())
            .finish()
    }
}

/// Set of middleware specs keyed by type tag.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    specs: HashMap<String, MiddlewareSpec>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a spec under its type tag.
    pub fn add_spec(&mut self, spec: MiddlewareSpec) -> Result<(), RegistryError> {
        if spec.type_name.is_empty() {
            return Err(RegistryError::InvalidSpec {
                message: "type can not be empty".to_string(),
            });
        }
        if spec.type_name.contains('/') {
            return Err(RegistryError::InvalidSpec {
                message: format!("type '{}' can not contain '/'", spec.type_name),
            });
        }
        if spec.convert.is_none() {
            return Err(RegistryError::InvalidSpec {
                message: format!("type '{}' has no conversion function", spec.type_name),
            });
        }
        if self.specs.contains_key(&spec.type_name) {
            return Err(RegistryError::DuplicateType {
                type_name: spec.type_name,
            });
        }
        tracing::debug!(middleware_type = %spec.type_name, "Registered middleware spec");
        self.specs.insert(spec.type_name.clone(), spec);
        Ok(())
    }

    pub fn get_spec(&self, type_name: &str) -> Option<&MiddlewareSpec> {
        self.specs.get(type_name)
    }

    /// All registered specs, in no particular order.
    pub fn get_specs(&self) -> Vec<&MiddlewareSpec> {
        self.specs.values().collect()
    }
}
