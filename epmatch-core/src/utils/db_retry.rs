//! Lock-contention retry for store writes
//!
//! SQLite reports a competing writer as "database is locked". Such errors are
//! retried with doubling delays until the `store_max_lock_wait_ms` budget is
//! spent; every other error goes straight back to the caller.

use epmatch_common::{Error, Result};
use std::future::Future;
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

const INITIAL_BACKOFF: Duration = Duration::from_millis(10);
const MAX_BACKOFF: Duration = Duration::from_millis(1000);

/// Run `operation` until it succeeds, fails with a non-lock error, or the budget runs out
///
/// On budget exhaustion the last lock error is returned as-is so the batch
/// layer can still classify it as transient.
pub async fn retry_on_lock<F, Fut, T>(operation_name: &str, max_wait_ms: u64, mut operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let budget = Duration::from_millis(max_wait_ms);
    let started = Instant::now();
    let mut backoff = INITIAL_BACKOFF;
    let mut attempts: u32 = 0;

    loop {
        attempts += 1;
        let err: Error = match operation().await {
            Ok(value) => {
                if attempts > 1 {
                    debug!(
                        operation = operation_name,
                        attempts,
                        waited_ms = started.elapsed().as_millis(),
                        "Write went through after lock contention"
                    );
                }
                return Ok(value);
            }
            Err(err) if err.is_database_locked() => err,
            Err(err) => return Err(err),
        };

        let waited = started.elapsed();
        let Some(remaining) = budget.checked_sub(waited).filter(|r| !r.is_zero()) else {
            error!(
                operation = operation_name,
                attempts,
                waited_ms = waited.as_millis(),
                max_wait_ms,
                "Giving up on locked database"
            );
            return Err(err);
        };

        let delay = backoff.min(remaining);
        warn!(
            operation = operation_name,
            attempts,
            delay_ms = delay.as_millis(),
            "Database locked, backing off"
        );
        tokio::time::sleep(delay).await;
        backoff = (backoff * 2).min(MAX_BACKOFF);
    }
}
