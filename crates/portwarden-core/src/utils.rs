/*!
 * Utility functions and helpers for Portwarden.
 *
 * This module provides the async helpers shared by the governor levels:
 * bounded waits, backoff arithmetic and logged background tasks.
 */
use std::future::Future;
use std::time::Duration;

use tokio::time::timeout;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Hard ceiling applied to every bounded wait, whatever the configuration says
pub const HARD_TIMEOUT_CEILING: Duration = Duration::from_secs(30);

/// Clamp a configured timeout to [`HARD_TIMEOUT_CEILING`]
pub fn bounded(duration: Duration) -> Duration {
    duration.min(HARD_TIMEOUT_CEILING)
}

/// Run a future with a timeout
///
/// # Arguments
///
/// * `duration` - The timeout duration, clamped to the hard ceiling
/// * `future` - The future to run
///
/// # Returns
///
/// The result of the future, or a timeout error if the timeout is reached
pub async fn with_timeout<F, T>(duration: Duration, future: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match timeout(bounded(duration), future).await {
        Ok(result) => result,
        Err(_) => Err(Error::timeout(format!(
            "Operation timed out after {:?}",
            bounded(duration)
        ))),
    }
}

/// Linear backoff with a capped attempt count.
///
/// Returns `base × min(attempt, max_attempts)`; attempt 0 is treated as 1.
pub fn capped_backoff(base: Duration, attempt: u32, max_attempts: u32) -> Duration {
    let factor = attempt.clamp(1, max_attempts.max(1));
    base.saturating_mul(factor)
}

/// Create a task that runs in the background and logs any errors
///
/// # Arguments
///
/// * `name` - A name for the task (for logging)
/// * `fut` - The future to run
pub fn spawn_and_log<F, T, E>(name: &str, fut: F) -> tokio::task::JoinHandle<()>
where
    F: Future<Output = std::result::Result<T, E>> + Send + 'static,
    T: Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    let task_name = name.to_string();
    tokio::spawn(async move {
        match fut.await {
            Ok(_) => {
                debug!("Task '{}' completed successfully", task_name);
            }
            Err(e) => {
                warn!("Task '{}' failed: {}", task_name, e);
            }
        }
    })
}

/// Convert a Duration to milliseconds, saturating at `u64::MAX`
pub fn duration_to_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
