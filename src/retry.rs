//! Retry of transient database faults with exponential backoff.

use std::future::Future;

use crate::error::HhiError;
use crate::models::RetryPolicy;

/// Run `operation` until it succeeds, fails permanently or exhausts the retries of `policy`.
///
/// Only errors for which [HhiError::is_transient] holds are retried.
///
/// # Arguments
///
/// * `policy`: Retry settings
/// * `what`: Short description of the operation, used in log events
/// * `operation`: Closure producing a new attempt
pub async fn with_backoff<T, F, Fut>(
    policy: &RetryPolicy,
    what: &str,
    mut operation: F,
) -> Result<T, HhiError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, HhiError>>,
{
    let mut attempt = 0;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt < policy.max_retries => {
                attempt += 1;
                let delay = policy.backoff(attempt);
                tracing::warn!(
                    "{} failed ({}), retry {}/{} in {:?}",
                    what,
                    err,
                    attempt,
                    policy.max_retries,
                    delay
                );
                tokio::time::sleep(delay).await;
            }
            Err(err) => return Err(err),
        }
    }
}
