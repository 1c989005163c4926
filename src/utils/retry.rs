//! Retry utilities: backoff builders.
//!
//! Uses `backon` for exponential backoff with jitter. Only connection
//! establishment is retried; coordination writes fail the in-flight call.

use std::time::Duration;

use backon::ExponentialBuilder;

/// Backoff for coordination service connection at startup.
///
/// - Min delay: 100ms
/// - Max delay: 5s
/// - Max attempts: 30
/// - Jitter enabled
pub fn connection_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(100))
        .with_max_delay(Duration::from_secs(5))
        .with_max_times(30)
        .with_jitter()
}
