use eyre::{Result, WrapErr};
use tracing_subscriber::{EnvFilter, Registry, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::LoggingConfig;

/// Initialize structured logging with JSON output
pub fn init_tracing() -> Result<()> {
    Registry::default()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(false)
                .with_span_list(true)
                .with_target(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true),
        )
        .try_init()
        .wrap_err("Failed to install JSON subscriber")?;

    tracing::info!("Switchyard structured logging initialized");
    Ok(())
}

/// Initialize console-friendly logging for development
pub fn init_console_tracing() -> Result<()> {
    Registry::default()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(
            tracing_subscriber::fmt::layer()
                .pretty()
                .with_target(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true),
        )
        .try_init()
        .wrap_err("Failed to install console subscriber")?;

    tracing::info!("Switchyard console logging initialized");
    Ok(())
}

/// Initialize tracing with custom configuration
pub fn init_tracing_with_config(level: &str, json_format: bool, include_spans: bool) -> Result<()> {
    let env_filter =
        EnvFilter::try_new(level).wrap_err_with(|| format!("Invalid log level: {level}"))?;

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    let installed = if json_format {
        Registry::default()
            .with(env_filter)
            .with(
                fmt_layer
                    .json()
                    .with_current_span(include_spans)
                    .with_span_list(include_spans),
            )
            .try_init()
    } else {
        Registry::default()
            .with(env_filter)
            .with(fmt_layer.pretty().with_ansi(true))
            .try_init()
    };
    installed.wrap_err("Failed to install subscriber")?;

    tracing::info!(level, json = json_format, spans = include_spans, "Switchyard logging initialized");
    Ok(())
}

/// Initialize tracing from the `[logging]` settings section.
pub fn init_from_settings(logging: &LoggingConfig) -> Result<()> {
    init_tracing_with_config(&logging.level, logging.json, logging.include_spans)
}

/// Span wrapping a long-running component such as a change watcher.
pub fn component_span(component: &str) -> tracing::Span {
    tracing::info_span!("component", name = component)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_from_settings() {
        let logging = LoggingConfig {
            level: "debug".to_string(),
            json: true,
            include_spans: true,
        };
        assert!(init_from_settings(&logging).is_ok());
        // A second global subscriber is refused rather than panicking.
        assert!(init_console_tracing().is_err());
    }

    #[test]
    fn test_invalid_level_is_rejected() {
        assert!(init_tracing_with_config("switchyard=loud", false, false).is_err());
    }

    #[test]
    fn test_component_span() {
        let span = component_span("change_watcher");
        // Disabled when no subscriber is installed yet; the name is static metadata.
        if let Some(meta) = span.metadata() {
            assert_eq!(meta.name(), "component");
        }
    }
}
