//! Exponential backoff for relay connectivity

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use bm_core::config::{BackoffConfig, RetryConfig};
use bm_core::traits::{RelayConnection, RelayTransport};
use bm_core::{ConnectionError, RelayTarget};

/// Exponential backoff with jitter for reconnection attempts
pub struct ExponentialBackoff {
    initial: Duration,
    /// Current delay
    current: Duration,
    max: Duration,
    multiplier: f64,
    /// Jitter factor (0.0 to 1.0)
    jitter: f64,
}

impl ExponentialBackoff {
    pub fn from_config(config: &BackoffConfig) -> Self {
        Self::new(config.initial, config.max, config.multiplier, config.jitter)
    }

    pub fn new(initial: Duration, max: Duration, multiplier: f64, jitter: f64) -> Self {
        Self {
            initial,
            current: initial,
            max,
            multiplier,
            jitter,
        }
    }

    /// Get the next delay and advance the backoff
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;

        let next = Duration::from_secs_f64(self.current.as_secs_f64() * self.multiplier);
        self.current = std::cmp::min(next, self.max);

        let jitter_amount = delay.as_secs_f64() * self.jitter * rand::random::<f64>();
        delay + Duration::from_secs_f64(jitter_amount)
    }

    /// Start over from the initial delay
    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

/// Connect to the relay, retrying transient failures.
///
/// Authentication and host key failures are returned immediately. After
/// `max_attempts` transient failures the last one is surfaced as
/// `RelayUnreachable`. Cancellation ends the wait early with
/// `ConnectionLost`.
pub async fn connect_with_retry(
    transport: &dyn RelayTransport,
    target: &RelayTarget,
    retry: &RetryConfig,
    cancel: &CancellationToken,
) -> Result<Box<dyn RelayConnection>, ConnectionError> {
    let mut backoff = ExponentialBackoff::from_config(&retry.backoff);
    let mut last_error = String::new();

    for attempt in 1..=retry.max_attempts {
        let result = tokio::select! {
            _ = cancel.cancelled() => return Err(ConnectionError::ConnectionLost("cancelled".into())),
            result = transport.connect(target) => result,
        };

        match result {
            Ok(conn) => {
                if attempt > 1 {
                    tracing::info!("Connected to relay {} after {} attempts", target, attempt);
                } else {
                    tracing::info!("Connected to relay {}", target);
                }
                return Ok(conn);
            }
            Err(e) if !e.is_transient() => {
                tracing::error!("Relay connection to {} failed: {}", target, e);
                return Err(e);
            }
            Err(e) => {
                last_error = e.to_string();
                if attempt == retry.max_attempts {
                    break;
                }
                let delay = backoff.next_delay();
                tracing::warn!(
                    "Relay connection attempt {}/{} failed: {}. Retrying in {:?}",
                    attempt,
                    retry.max_attempts,
                    e,
                    delay
                );
                tokio::select! {
                    _ = cancel.cancelled() => return Err(ConnectionError::ConnectionLost("cancelled".into())),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }

    Err(ConnectionError::RelayUnreachable {
        attempts: retry.max_attempts,
        reason: last_error,
    })
}
