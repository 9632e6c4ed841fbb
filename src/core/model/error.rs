use thiserror::Error;

use crate::core::plugin::PluginError;

/// Validation result type alias
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Validation error types
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Invalid field '{field}': {message}")]
    InvalidField { field: String, message: String },

    #[error("Unsupported {field} '{value}', supported values are {supported}")]
    Unsupported {
        field: String,
        value: String,
        supported: String,
    },

    #[error("Validation failed: {message}")]
    ValidationFailed { message: String },
}

impl ValidationError {
    pub(crate) fn invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        ValidationError::InvalidField {
            field: field.into(),
            message: message.into(),
        }
    }

    pub(crate) fn missing(field: impl Into<String>) -> Self {
        ValidationError::MissingField {
            field: field.into(),
        }
    }

    /// Fold several errors into one `ValidationFailed`.
    pub fn aggregate(mut errors: Vec<ValidationError>) -> ValidationResult<()> {
        if errors.len() <= 1 {
            return errors.pop().map_or(Ok(()), Err);
        }
        Err(ValidationError::ValidationFailed {
            message: errors
                .iter()
                .enumerate()
                .map(|(i, e)| format!("{}. {e}", i + 1))
                .collect::<Vec<_>>()
                .join("; "),
        })
    }
}

/// Errors decoding model documents that embed middleware configuration.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum DecodeError {
    #[error("Malformed document: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Middleware type '{type_name}' is not registered")]
    UnknownMiddleware { type_name: String },

    #[error(transparent)]
    Plugin(#[from] PluginError),

    #[error(transparent)]
    Validation(#[from] ValidationError),
}

/// Reject identifiers that would break the slash-delimited key layout.
pub(crate) fn validate_id(field: &str, id: &str) -> ValidationResult<()> {
    if id.contains('/') {
        return Err(ValidationError::invalid(field, format!("'{id}' can not contain '/'")));
    }
    Ok(())
}

/// Like [`validate_id`] but the identifier must also be present.
pub(crate) fn validate_required_id(field: &str, id: &str) -> ValidationResult<()> {
    if id.is_empty() {
        return Err(ValidationError::missing(field));
    }
    validate_id(field, id)
}
