//! Bounded retry of provider calls

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;

use crate::transfer::error::{ProviderError, Result, TransferError};

/// Retry label of exporter calls
pub const EXPORT_CALL: &str = "export";
/// Retry label of importer calls
pub const IMPORT_CALL: &str = "import";

/// How often, and how far apart, a failed provider call is repeated
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum RetryStrategy {
    NoRetry,
    Uniform {
        max_attempts: u32,
        interval_ms: u64,
    },
    Exponential {
        max_attempts: u32,
        initial_interval_ms: u64,
        multiplier: f64,
    },
}

impl Default for RetryStrategy {
    fn default() -> Self {
        RetryStrategy::Exponential {
            max_attempts: 5,
            initial_interval_ms: 200,
            multiplier: 2.0,
        }
    }
}

impl RetryStrategy {
    /// Total attempts, including the first call
    pub fn max_attempts(&self) -> u32 {
        match self {
            RetryStrategy::NoRetry => 1,
            RetryStrategy::Uniform { max_attempts, .. }
            | RetryStrategy::Exponential { max_attempts, .. } => (*max_attempts).max(1),
        }
    }

    /// Wait before the attempt following `attempt` (1-based)
    pub fn delay(&self, attempt: u32) -> Duration {
        match self {
            RetryStrategy::NoRetry => Duration::ZERO,
            RetryStrategy::Uniform { interval_ms, .. } => Duration::from_millis(*interval_ms),
            RetryStrategy::Exponential {
                initial_interval_ms,
                multiplier,
                ..
            } => {
                let exp = attempt.saturating_sub(1) as i32;
                let ms = *initial_interval_ms as f64 * multiplier.powi(exp);
                Duration::from_millis(ms.min(u64::MAX as f64) as u64)
            }
        }
    }
}

/// Call `f` until it succeeds or the attempt budget runs out
///
/// The budget is the smaller of the strategy's and the error's own limit,
/// so errors that cannot succeed on a repeat are surfaced at once.
pub async fn retry_call<T, F, Fut>(strategy: &RetryStrategy, label: &str, mut f: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, ProviderError>>,
{
    let mut attempt = 1;
    loop {
        match f().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                let limit = err
                    .attempt_limit()
                    .map_or(strategy.max_attempts(), |l| l.min(strategy.max_attempts()));
                if attempt >= limit {
                    return Err(TransferError::RetriesExhausted {
                        label: label.to_string(),
                        attempts: attempt,
                        source: err,
                    });
                }

                let delay = strategy.delay(attempt);
                log::warn!(
                    "{} failed (attempt {}/{}), retrying in {:?}: {}",
                    label,
                    attempt,
                    limit,
                    delay,
                    err
                );
                sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
