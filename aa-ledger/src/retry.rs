//! Bounded retries for vendor requests.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use crate::traits::{LedgerError, TransportError};

/// Retry configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Delay before the first retry (ms)
    pub delay_ms: u64,
    /// Growth factor of the delay; 1.0 keeps it fixed
    pub multiplier: f64,
    /// Upper bound for a single delay (ms)
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 4,
            delay_ms: 5000,
            multiplier: 1.0,
            max_delay_ms: 60_000,
        }
    }
}

/// Retry policy applied to transient transport failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    /// Create a policy from configuration.
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// A policy with a fixed delay between attempts.
    pub fn fixed(max_retries: u32, delay: Duration) -> Self {
        Self::new(RetryConfig {
            max_retries,
            delay_ms: delay.as_millis() as u64,
            multiplier: 1.0,
            ..RetryConfig::default()
        })
    }

    /// A policy whose delay grows by `multiplier` after each retry.
    pub fn exponential(max_retries: u32, initial: Duration, multiplier: f64) -> Self {
        Self::new(RetryConfig {
            max_retries,
            delay_ms: initial.as_millis() as u64,
            multiplier,
            ..RetryConfig::default()
        })
    }

    /// Underlying configuration.
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Maximum retries after the first attempt.
    pub fn max_retries(&self) -> u32 {
        self.config.max_retries
    }

    /// Delay before retry number `retry` (0-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = self.config.multiplier.max(1.0).powi(retry as i32);
        let millis = (self.config.delay_ms as f64 * factor).min(self.config.max_delay_ms as f64);
        Duration::from_millis(millis as u64)
    }

    /// Run `op` until it succeeds, fails permanently, or runs out of retries.
    pub async fn run<T, F, Fut>(&self, command: &str, mut op: F) -> Result<T, LedgerError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, TransportError>>,
    {
        let mut retry = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if !e.is_transient() => {
                    debug!(command = %command, error = %e, "Permanent transport error");
                    return Err(LedgerError::Transport(e));
                }
                Err(e) if retry >= self.config.max_retries => {
                    return Err(LedgerError::RetriesExhausted {
                        command: command.to_string(),
                        attempts: retry + 1,
                        last_error: e,
                    });
                }
                Err(e) => {
                    let delay = self.delay_for(retry);
                    warn!(
                        command = %command,
                        error = %e,
                        retry = retry + 1,
                        delay_ms = delay.as_millis() as u64,
                        "Transient transport error, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    retry += 1;
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}
