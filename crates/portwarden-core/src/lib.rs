/*!
 * Portwarden Core
 *
 * This crate provides the shared plumbing for the Portwarden workspace:
 * configuration, logging, the typed event bus, identifiers, the bounded
 * append-only log and async helpers.
 */

#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod event;
pub mod logging;
pub mod prelude;
pub mod types;
pub mod utils;

/// Re-export of dependencies that are part of the public API
pub mod deps {
    pub use anyhow;
    pub use chrono;
    pub use futures;
    pub use serde;
    pub use tokio;
    pub use tracing;
    pub use uuid;
}

/// Portwarden core crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library initialization
pub fn init() -> Result<(), error::Error> {
    logging::init()?;
    tracing::info!("Portwarden Core {} initialized", VERSION);
    Ok(())
}
