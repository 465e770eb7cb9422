/*!
 * Logging functionality for Portwarden.
 *
 * This module provides tracing setup and span helpers for consistent logging
 * across the governor hierarchy.
 */
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::LoggingConfig;
use crate::error::{Error, Result};

/// Initialize the logging system with default configuration
pub fn init() -> Result<()> {
    init_with_filter("info")
}

/// Initialize the logging system with a specific filter
///
/// # Arguments
///
/// * `filter` - The log filter string (e.g., "info", "debug", "portwarden_engine=trace")
pub fn init_with_filter(filter: &str) -> Result<()> {
    init_with_config(&LoggingConfig {
        level: filter.to_string(),
        ..LoggingConfig::default()
    })
}

/// Initialize the logging system from the logging section of the configuration
///
/// `RUST_LOG` takes precedence over the configured level when it is set.
pub fn init_with_config(config: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.level));

    let result = if config.json_format {
        tracing_subscriber::registry()
            .with(fmt::layer().json().with_target(config.with_target))
            .with(filter)
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer().with_target(config.with_target))
            .with(filter)
            .try_init()
    };

    result.map_err(|e| Error::runtime(format!("Failed to initialize logging: {}", e)))
}

/// A type alias for a tracing span
pub type Span = tracing::Span;

/// Create a new span for a component
///
/// # Arguments
///
/// * `name` - The name of the component
/// * `id` - An optional ID for the component instance
pub fn component_span(name: &str, id: Option<&str>) -> Span {
    match id {
        Some(id) => tracing::info_span!("component", name = %name, id = %id),
        None => tracing::info_span!("component", name = %name),
    }
}

/// Create a new span for an operation
///
/// # Arguments
///
/// * `name` - The name of the operation
/// * `component` - The component performing the operation
pub fn operation_span(name: &str, component: &str) -> Span {
    tracing::info_span!("operation", name = %name, component = %component)
}
