//! Transactional runtime.
//!
//! `with_retrying_tx!` runs a body inside a database transaction with bounded
//! retry. Only transient SQLSTATE failures (serialization, deadlock) retry;
//! a downcast [`TransactionError`](crate::error::TransactionError) surfaces
//! immediately. Exhausted retries collapse to `Conflict`.

use crate::config::RetryConfig;

/// Exponential backoff with the configured cap; jitter is added at the call
/// site so this stays deterministic for tests.
pub fn backoff_delay_ms(attempt: u32, retry: &RetryConfig) -> u64 {
    let shift = attempt.saturating_sub(1).min(16);
    let raw = retry.initial_backoff_ms.saturating_mul(1u64 << shift);
    raw.min(retry.max_backoff_ms)
}

macro_rules! with_retrying_tx {
    ($pool:expr, $retry:expr, $tx_var:ident, $body:block) => {{
        let retry: &$crate::config::RetryConfig = $retry;
        let mut attempt: u32 = 1;
        loop {
            let mut $tx_var = $pool.begin().await?;

            // Row locks are taken explicitly with FOR UPDATE; READ COMMITTED
            // is the matching isolation level.
            sqlx::Executor::execute(
                &mut *$tx_var,
                sqlx::query("SET TRANSACTION ISOLATION LEVEL READ COMMITTED"),
            )
            .await?;

            let result: anyhow::Result<_> = async { $body }.await;

            match result {
                Ok(value) => {
                    $tx_var.commit().await?;
                    break Ok(value);
                }
                Err(e) => {
                    $tx_var.rollback().await.ok();

                    if $crate::error::is_retryable_error(&e) {
                        if attempt < retry.max_retries {
                            let jitter: u64 =
                                rand::Rng::gen_range(&mut rand::thread_rng(), 0..10);
                            let delay_ms =
                                $crate::runtime::backoff_delay_ms(attempt, retry) + jitter;
                            tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;
                            attempt += 1;
                            continue;
                        }
                        tracing::warn!(attempts = attempt, error = %e, "transaction retries exhausted");
                        break Err(anyhow::Error::new(
                            $crate::error::TransactionError::Conflict(format!(
                                "transaction failed after {attempt} attempts: {e}"
                            )),
                        ));
                    }
                    break Err(e);
                }
            }
        }
    }};
}
pub(crate) use with_retrying_tx;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_then_caps() {
        let retry = RetryConfig {
            max_retries: 5,
            initial_backoff_ms: 10,
            max_backoff_ms: 50,
        };
        assert_eq!(backoff_delay_ms(1, &retry), 10);
        assert_eq!(backoff_delay_ms(2, &retry), 20);
        assert_eq!(backoff_delay_ms(3, &retry), 40);
        assert_eq!(backoff_delay_ms(4, &retry), 50);
        assert_eq!(backoff_delay_ms(10, &retry), 50);
    }

    #[test]
    fn backoff_survives_large_attempts() {
        let retry = RetryConfig::default();
        // shift is clamped; no overflow panic at absurd attempt numbers
        assert_eq!(backoff_delay_ms(u32::MAX, &retry), retry.max_backoff_ms);
    }
}
