use crate::traits::error::{Result, RobustSocketError};
use std::future::Future;
use std::time::{Duration, Instant};
use tracing::debug;

/// Trait for shaping the delays between reconnection attempts
///
/// How long to keep trying is not the policy's concern: the retry loop is
/// bounded by a deadline, and the policy only decides how the attempts are
/// spaced out within it.
pub trait ReconnectPolicy: Send + Sync {
    /// Get the delay before the next reconnection attempt
    ///
    /// # Arguments
    /// * `attempt` - The reconnection attempt number (0-indexed)
    fn next_delay(&self, attempt: usize) -> Duration;
}

/// Exponential backoff reconnection policy
///
/// Delays between reconnection attempts grow exponentially:
/// initial_delay * 2^attempt, capped at max_delay
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    initial_delay: Duration,
    max_delay: Duration,
}

impl ExponentialBackoff {
    /// Create a new exponential backoff policy
    ///
    /// # Arguments
    /// * `initial_delay` - The delay before the second attempt
    /// * `max_delay` - The maximum delay between attempts
    pub fn new(initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            initial_delay,
            max_delay,
        }
    }
}

impl ReconnectPolicy for ExponentialBackoff {
    fn next_delay(&self, attempt: usize) -> Duration {
        let initial = self.initial_delay.as_millis() as u64;
        let delay = initial.saturating_mul(2u64.saturating_pow(attempt.min(u32::MAX as usize) as u32));
        Duration::from_millis(delay.min(self.max_delay.as_millis() as u64))
    }
}

/// Fixed delay reconnection policy
///
/// Always waits the same amount of time between reconnection attempts
#[derive(Debug, Clone)]
pub struct FixedDelay {
    delay: Duration,
}

impl FixedDelay {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

impl ReconnectPolicy for FixedDelay {
    fn next_delay(&self, _attempt: usize) -> Duration {
        self.delay
    }
}

/// Run `attempt` until it succeeds or the deadline passes.
///
/// A deadline at or before the current instant means exactly one attempt,
/// not bounded in time. Otherwise every attempt is cut off at the deadline,
/// and between failed attempts the loop sleeps `policy.next_delay(n)` -
/// unless the sleep itself would land past the deadline, in which case the
/// loop gives up with [`RobustSocketError::ReconnectFailed`].
pub async fn retry_until<T, F, Fut>(
    deadline: Instant,
    policy: &dyn ReconnectPolicy,
    mut attempt: F,
) -> Result<T>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempts: usize = 0;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let outcome = if attempts == 0 && remaining.is_zero() {
            attempt(attempts).await
        } else {
            match tokio::time::timeout(remaining, attempt(attempts)).await {
                Ok(outcome) => outcome,
                Err(_) => Err(RobustSocketError::ConnectionClosed(
                    "connect attempt cut off at the deadline".into(),
                )),
            }
        };
        attempts += 1;

        let error = match outcome {
            Ok(value) => return Ok(value),
            Err(error) => error,
        };
        debug!("connect attempt {} failed: {}", attempts, error);

        let delay = policy.next_delay(attempts - 1);
        if Instant::now() + delay >= deadline {
            return Err(RobustSocketError::ReconnectFailed {
                attempts,
                reason: error.to_string(),
            });
        }
        tokio::time::sleep(delay).await;
    }
}
