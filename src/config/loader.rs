use std::path::Path;

use config::{Config, Environment, File, FileFormat};
use eyre::{Context, Result};

use crate::config::{models::StoreSettings, validation::SettingsValidator};

/// Prefix of environment variables overriding file settings, e.g.
/// `SWITCHYARD_KEY_PREFIX` or `SWITCHYARD_LOGGING__LEVEL`.
pub const ENV_PREFIX: &str = "SWITCHYARD";

/// Load and validate settings from a file using the config crate.
/// Supports multiple formats: YAML, JSON, TOML, etc.
pub fn load_settings(path: &str) -> Result<StoreSettings> {
    let settings = load_settings_unchecked(path)?;
    SettingsValidator::validate(&settings)
        .with_context(|| format!("Invalid settings in {path}"))?;
    Ok(settings)
}

/// Load settings without validation
pub fn load_settings_unchecked(path: &str) -> Result<StoreSettings> {
    let settings_path = Path::new(path);

    // Determine file format based on extension
    let format = match settings_path.extension().and_then(|ext| ext.to_str()) {
        Some("yaml") | Some("yml") => FileFormat::Yaml,
        Some("json") => FileFormat::Json,
        Some("toml") => FileFormat::Toml,
        _ => FileFormat::Yaml,
    };

    let raw = Config::builder()
        .add_source(File::new(path, format))
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        )
        .build()
        .with_context(|| format!("Failed to build settings from {}", settings_path.display()))?;

    raw.try_deserialize().with_context(|| {
        format!(
            "Failed to deserialize settings from {}",
            settings_path.display()
        )
    })
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempfile::NamedTempFile;

    use super::*;

    #[test]
    fn test_load_yaml_settings() {
        let yaml_content = r#"
key_prefix: "/proxy/config"
event_buffer: 64
logging:
  level: debug
  json: true
"#;

        let mut temp_file = NamedTempFile::with_suffix(".yaml").unwrap();
        write!(temp_file, "{}", yaml_content).unwrap();

        let settings = load_settings(temp_file.path().to_str().unwrap()).unwrap();
        assert_eq!(settings.key_prefix, "/proxy/config");
        assert_eq!(settings.event_buffer, 64);
        assert_eq!(settings.watch_history, 1000);
        assert_eq!(settings.logging.level, "debug");
        assert!(settings.logging.json);
    }

    #[test]
    fn test_load_toml_settings() {
        let toml_content = r#"
key_prefix = "/lb"
watch_history = 10
"#;

        let mut temp_file = NamedTempFile::with_suffix(".toml").unwrap();
        write!(temp_file, "{}", toml_content).unwrap();

        let settings = load_settings(temp_file.path().to_str().unwrap()).unwrap();
        assert_eq!(settings.key_prefix, "/lb");
        assert_eq!(settings.watch_history, 10);
        assert_eq!(settings.event_buffer, 1024);
    }

    #[test]
    fn test_invalid_settings_are_rejected() {
        let mut temp_file = NamedTempFile::with_suffix(".json").unwrap();
        write!(temp_file, r#"{{"key_prefix": "no-slash", "event_buffer": 0}}"#).unwrap();

        let path = temp_file.path().to_str().unwrap();
        assert!(load_settings(path).is_err());
        assert!(load_settings_unchecked(path).is_ok());
    }

    #[test]
    fn test_missing_file() {
        assert!(load_settings("/definitely/not/here.yaml").is_err());
    }
}
