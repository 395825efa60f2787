//! Bounded retry with a fixed delay between attempts.

use std::future::Future;
use std::time::Duration;

use tracing::debug;

/// Call `op` up to `max_attempts` times (at least once). After a failure that
/// `retryable` accepts, wait `delay` and try again; any other failure, or the
/// last attempt's failure, is returned as is.
pub async fn retry<T, E, F, Fut, P>(
    max_attempts: u32,
    delay: Duration,
    mut retryable: P,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: FnMut(&E) -> bool,
{
    let max_attempts = max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < max_attempts && retryable(&e) => {
                debug!(attempt, max_attempts, "attempt failed, retrying in {delay:?}");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
