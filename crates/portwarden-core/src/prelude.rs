/*!
 * Prelude module for Portwarden Core.
 *
 * This module re-exports commonly used types and functions from the core
 * crate to make them easier to import.
 */

// Re-export error types
pub use crate::error::{Error, Result};

// Re-export core types
pub use crate::types::{BoundedLog, Id, Sequenced, Timestamp};

// Re-export event types
pub use crate::event::{EventBus, EventReceiver, Priority, SharedEventBus, TypedEvent};

// Re-export config types
pub use crate::config::{ArbitrationStrategy, Config, ConfigBuilder, SharedConfig};

// Re-export utility functions
pub use crate::utils::{bounded, capped_backoff, spawn_and_log, with_timeout};

// Re-export logging macros
pub use tracing::{debug, error, info, trace, warn};

// Re-export core initialization
pub use crate::init;
