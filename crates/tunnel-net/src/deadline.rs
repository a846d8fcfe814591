//! Deadlines for suspension points.
//!
//! Every await on the network is bounded. The timer lives inside the
//! combined future, so it is released as soon as either side settles.

use crate::error::{NetError, Result};
use std::future::Future;
use std::time::Duration;

/// Timeout applied when the caller does not configure one.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(30_000);

/// Run `future` under a deadline.
///
/// A zero `duration` disables the deadline and awaits the future as is.
pub async fn with_timeout<F, T>(duration: Duration, future: F) -> Result<T>
where
    F: Future<Output = T>,
{
    if duration.is_zero() {
        return Ok(future.await);
    }

    tokio::time::timeout(duration, future)
        .await
        .map_err(|_| NetError::Timeout {
            ms: duration.as_millis(),
        })
}

/// Suspend for `duration`, or for [`DEFAULT_TIMEOUT`] when none is given.
pub async fn sleep(duration: Option<Duration>) {
    tokio::time::sleep(duration.unwrap_or(DEFAULT_TIMEOUT)).await;
}
