//! Bounded retries for transient storage failures.

use crate::config::RetryConfig;
use crate::error::StorageError;
use log::{error, warn};
use std::future::Future;
use tokio::time::{Duration, sleep};

/// Delay before retry number `attempt + 1`.
///
/// Starts at `initial_delay` and doubles per attempt up to `max_delay`, then
/// moves by up to 10% either way. The result never exceeds `max_delay`.
pub(crate) fn backoff_delay(config: &RetryConfig, attempt: u32) -> Duration {
    jitter(base_delay(config, attempt), config.max_delay)
}

fn base_delay(config: &RetryConfig, attempt: u32) -> Duration {
    let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
    config
        .initial_delay
        .saturating_mul(factor)
        .min(config.max_delay)
}

fn jitter(delay: Duration, ceiling: Duration) -> Duration {
    use rand::Rng;

    let millis = delay.as_millis() as u64;
    let spread = millis / 10;
    if spread == 0 {
        return delay;
    }
    let offset = rand::thread_rng().gen_range(0..=2 * spread);
    let jittered = (millis + offset).saturating_sub(spread).max(1);
    Duration::from_millis(jittered).min(ceiling)
}

/// Runs `call`, retrying it while it fails with a transient error.
///
/// # Arguments
/// * `config` - How many retries to allow and how long to wait between them.
/// * `operation` - Names the call in log output.
/// * `call` - Starts a fresh attempt each time it is invoked.
///
/// # Returns
/// The first successful result, the first non-transient error, or the last
/// transient error once `config.max_retries` retries are used up.
pub async fn retry_transient<T, F, Fut>(
    config: &RetryConfig,
    operation: &str,
    mut call: F,
) -> Result<T, StorageError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StorageError>>,
{
    let mut attempt = 0;
    loop {
        match call().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < config.max_retries => {
                let delay = backoff_delay(config, attempt);
                warn!(
                    "{} failed (attempt {}/{}): {}. Retrying in {:?}",
                    operation,
                    attempt + 1,
                    config.max_retries + 1,
                    e,
                    delay
                );
                sleep(delay).await;
                attempt += 1;
            }
            Err(e) => {
                if e.is_transient() {
                    error!(
                        "{} failed after {} attempts: {}",
                        operation,
                        attempt + 1,
                        e
                    );
                }
                return Err(e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_config(max_retries: u32) -> RetryConfig {
        RetryConfig {
            max_retries,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
        }
    }

    #[test]
    fn default_backoff_doubles_up_to_ten_seconds() {
        let config = RetryConfig::default();
        let delays: Vec<Duration> = (0..7).map(|attempt| base_delay(&config, attempt)).collect();
        assert_eq!(
            delays,
            [200, 400, 800, 1600, 3200, 6400, 10_000].map(Duration::from_millis)
        );
    }

    #[test]
    fn huge_attempt_counts_stay_at_the_cap() {
        let config = RetryConfig::default();
        assert_eq!(base_delay(&config, 31), config.max_delay);
        assert_eq!(base_delay(&config, 100), config.max_delay);
        assert!(backoff_delay(&config, 100) <= config.max_delay);
    }

    #[test]
    fn first_default_retry_waits_about_200ms() {
        let config = RetryConfig::default();
        for _ in 0..100 {
            let delay = backoff_delay(&config, 0);
            assert!(
                delay >= Duration::from_millis(180) && delay <= Duration::from_millis(220),
                "{:?} is more than 10% away from 200ms",
                delay
            );
        }
    }

    #[test]
    fn millisecond_delays_are_used_as_is() {
        let config = fast_config(3);
        assert_eq!(backoff_delay(&config, 0), Duration::from_millis(1));
        assert_eq!(backoff_delay(&config, 2), Duration::from_millis(4));
    }

    #[tokio::test]
    async fn transient_errors_are_retried_until_success() {
        let calls = AtomicU32::new(0);
        let result = retry_transient(&fast_config(3), "write batch", || async {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(StorageError::Unavailable("connection reset".into()))
            } else {
                Ok(7)
            }
        })
        .await;
        assert_eq!(result, Ok(7));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retries_are_bounded() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = retry_transient(&fast_config(2), "add column", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(StorageError::Unavailable("down".into()))
        })
        .await;
        assert!(matches!(result, Err(StorageError::Unavailable(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = retry_transient(&fast_config(5), "drop column", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(StorageError::conflict("t", "c", "missing"))
        })
        .await;
        assert!(matches!(result, Err(StorageError::SchemaConflict { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
