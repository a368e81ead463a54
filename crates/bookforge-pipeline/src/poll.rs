//! Bounded polling for batch jobs.

use std::time::Duration;

use bookforge_llm::{BatchHandle, BatchStatus, GenerationService};
use bookforge_types::{BookforgeError, Result};

use crate::events::{BookEvent, EventEmitter};

/// Delay policy between successive status checks.
#[derive(Debug, Clone, PartialEq)]
pub enum BackoffPolicy {
    Fixed(Duration),
    /// base * 2^attempt, capped at max.
    Exponential { base: Duration, max: Duration },
    None,
}

impl BackoffPolicy {
    /// Delay before the next check after `attempt` (0-indexed) checks.
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        match self {
            BackoffPolicy::Fixed(d) => *d,
            BackoffPolicy::Exponential { base, max } => {
                let exponent = u32::try_from(attempt).unwrap_or(u32::MAX);
                let base_ms = u64::try_from(base.as_millis()).unwrap_or(u64::MAX);
                let millis = base_ms.saturating_mul(2u64.saturating_pow(exponent));
                Duration::from_millis(millis).min(*max)
            }
            BackoffPolicy::None => Duration::ZERO,
        }
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        BackoffPolicy::Fixed(Duration::from_secs(30))
    }
}

/// How a batch job is waited on. `max_wait: None` polls until a terminal
/// status.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PollPolicy {
    pub interval: BackoffPolicy,
    pub max_wait: Option<Duration>,
}

impl PollPolicy {
    pub fn fixed(interval: Duration) -> Self {
        Self {
            interval: BackoffPolicy::Fixed(interval),
            max_wait: None,
        }
    }

    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = Some(max_wait);
        self
    }
}

/// Poll `handle` until it completes.
///
/// Retryable errors from a status check count as "still pending". Returns
/// `BatchFailed` on a failed job and `PollTimeout` once the next sleep would
/// exceed `max_wait`.
pub async fn wait_for_batch(
    service: &dyn GenerationService,
    handle: &BatchHandle,
    policy: &PollPolicy,
    events: &EventEmitter,
) -> Result<()> {
    let mut waited = Duration::ZERO;
    let mut attempt = 0usize;

    loop {
        let status = match service.poll_status(handle).await {
            Ok(status) => status,
            Err(e) if e.is_retryable() => {
                tracing::warn!(job_id = %handle.job_id, attempt, error = %e, "Batch status check failed, will poll again");
                BatchStatus::Pending
            }
            Err(e) => return Err(e),
        };

        events.emit(BookEvent::BatchPolled {
            job_id: handle.job_id.clone(),
            attempt,
            status: format!("{status:?}").to_lowercase(),
        });

        match status {
            BatchStatus::Completed => {
                tracing::info!(job_id = %handle.job_id, attempts = attempt + 1, "Batch completed");
                return Ok(());
            }
            BatchStatus::Failed => {
                tracing::error!(job_id = %handle.job_id, "Batch failed");
                return Err(BookforgeError::BatchFailed {
                    job_id: handle.job_id.clone(),
                });
            }
            BatchStatus::Pending => {}
        }

        let delay = policy.interval.delay_for_attempt(attempt);
        if let Some(max_wait) = policy.max_wait {
            if waited.saturating_add(delay) > max_wait {
                return Err(BookforgeError::PollTimeout {
                    job_id: handle.job_id.clone(),
                    waited_ms: waited.as_millis() as u64,
                });
            }
        }
        tracing::debug!(job_id = %handle.job_id, attempt, delay_ms = %delay.as_millis(), "Batch pending");
        tokio::time::sleep(delay).await;
        waited = waited.saturating_add(delay);
        attempt = attempt.saturating_add(1);
    }
}
