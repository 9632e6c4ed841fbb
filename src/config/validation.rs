use tracing_subscriber::EnvFilter;

use crate::{
    config::models::StoreSettings,
    core::model::{ValidationError, ValidationResult},
};

/// Settings validator
pub struct SettingsValidator;

impl SettingsValidator {
    /// Validate all settings, reporting every problem at once
    pub fn validate(settings: &StoreSettings) -> ValidationResult<()> {
        let mut errors = Vec::new();

        if let Err(e) = Self::validate_key_prefix(&settings.key_prefix) {
            errors.push(e);
        }

        if settings.event_buffer == 0 {
            errors.push(ValidationError::InvalidField {
                field: "event_buffer".to_string(),
                message: "must be greater than 0".to_string(),
            });
        }

        if settings.watch_history == 0 {
            errors.push(ValidationError::InvalidField {
                field: "watch_history".to_string(),
                message: "must be greater than 0".to_string(),
            });
        }

        if let Err(e) = EnvFilter::try_new(&settings.logging.level) {
            errors.push(ValidationError::InvalidField {
                field: "logging.level".to_string(),
                message: e.to_string(),
            });
        }

        ValidationError::aggregate(errors)
    }

    fn validate_key_prefix(prefix: &str) -> ValidationResult<()> {
        if !prefix.starts_with('/') {
            return Err(ValidationError::InvalidField {
                field: "key_prefix".to_string(),
                message: format!("'{prefix}' must start with '/'"),
            });
        }
        if prefix.len() > 1 && prefix.ends_with('/') {
            return Err(ValidationError::InvalidField {
                field: "key_prefix".to_string(),
                message: format!("'{prefix}' must not end with '/'"),
            });
        }
        if prefix.contains("//") {
            return Err(ValidationError::InvalidField {
                field: "key_prefix".to_string(),
                message: format!("'{prefix}' contains an empty segment"),
            });
        }
        Ok(())
    }
}
