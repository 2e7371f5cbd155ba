//! Runs one externally-delegated stage under a wall-clock timeout and a
//! retry policy, returning a typed outcome for the controller to apply.
//!
//! The timeout covers the whole stage including retries and backoff sleeps.
//! When it fires the in-flight future is dropped, which abandons the side
//! effect (child processes are spawned with `kill_on_drop`).

use std::future::Future;
use std::time::{Duration, Instant};

use super::db::now_rfc3339;
use super::models::{StageName, StageTiming};
use crate::errors::StageError;

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first. `1` means no retry.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Source host and inference calls: 3 attempts, exponential backoff.
    pub fn network() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }

    /// Local analysis: a single attempt.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Delay before attempt `attempt + 1`, where `attempt` is 1-based.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Result of one stage execution plus the bookkeeping the ledger records.
#[derive(Debug)]
pub struct StageOutcome<T> {
    pub stage: StageName,
    pub result: Result<T, StageError>,
    pub attempts: u32,
    pub started_at: String,
    pub elapsed: Duration,
}

impl<T> StageOutcome<T> {
    /// Timing entry with the outcome label derived from the result.
    pub fn timing(&self) -> StageTiming {
        let outcome = match &self.result {
            Ok(_) => "ok".to_string(),
            Err(e) => e.kind().as_str().to_string(),
        };
        self.timing_with(outcome)
    }

    pub fn timing_with(&self, outcome: impl Into<String>) -> StageTiming {
        StageTiming {
            stage: self.stage,
            started_at: self.started_at.clone(),
            duration_ms: self.elapsed.as_millis() as i64,
            outcome: outcome.into(),
        }
    }
}

/// Execute `op` until it succeeds, fails non-retryably, exhausts the policy,
/// or the stage timeout elapses. `op` receives the 1-based attempt number.
pub async fn execute<T, F, Fut>(
    stage: StageName,
    timeout: Duration,
    policy: &RetryPolicy,
    mut op: F,
) -> StageOutcome<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, StageError>>,
{
    let started_at = now_rfc3339();
    let start = Instant::now();
    let mut attempts = 0u32;

    let attempt_loop = async {
        loop {
            attempts += 1;
            match op(attempts).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempts < policy.max_attempts => {
                    let delay = policy.backoff(attempts);
                    tracing::warn!(
                        stage = %stage,
                        attempt = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "stage attempt failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    };

    let result = match tokio::time::timeout(timeout, attempt_loop).await {
        Ok(result) => result,
        Err(_) => {
            tracing::warn!(stage = %stage, timeout_ms = timeout.as_millis() as u64, "stage timed out");
            Err(StageError::Timeout(timeout))
        }
    };

    StageOutcome {
        stage,
        result,
        attempts,
        started_at,
        elapsed: start.elapsed(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_network() -> RetryPolicy {
        RetryPolicy {
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
            ..RetryPolicy::network()
        }
    }

    #[test]
    fn test_backoff_is_exponential_and_capped() {
        let policy = RetryPolicy::network();
        assert_eq!(policy.backoff(1), Duration::from_millis(500));
        assert_eq!(policy.backoff(2), Duration::from_secs(1));
        assert_eq!(policy.backoff(3), Duration::from_secs(2));
        assert_eq!(policy.backoff(10), Duration::from_secs(8));
    }

    #[tokio::test]
    async fn test_success_on_first_attempt() {
        let outcome = execute(StageName::Clone, Duration::from_secs(1), &fast_network(), |_| async {
            Ok::<_, StageError>(7)
        })
        .await;
        assert_eq!(outcome.result.unwrap(), 7);
        assert_eq!(outcome.attempts, 1);
    }

    #[tokio::test]
    async fn test_transient_errors_retry_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let outcome = execute(StageName::File, Duration::from_secs(1), &fast_network(), move |_| {
            let c = c.clone();
            async move {
                if c.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(StageError::transient("503"))
                } else {
                    Ok("filed")
                }
            }
        })
        .await;
        assert_eq!(outcome.result.unwrap(), "filed");
        assert_eq!(outcome.attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_transient_errors_exhaust_after_three_attempts() {
        let outcome = execute(StageName::Assess, Duration::from_secs(1), &fast_network(), |_| async {
            Err::<(), _>(StageError::transient("429"))
        })
        .await;
        assert!(matches!(outcome.result, Err(StageError::Transient(_))));
        assert_eq!(outcome.attempts, 3);
        assert_eq!(outcome.timing().outcome, "transient_failure");
    }

    #[tokio::test]
    async fn test_fatal_error_is_not_retried() {
        let outcome = execute(StageName::File, Duration::from_secs(1), &fast_network(), |_| async {
            Err::<(), _>(StageError::fatal("401 Unauthorized"))
        })
        .await;
        assert!(matches!(outcome.result, Err(StageError::Fatal(_))));
        assert_eq!(outcome.attempts, 1);
    }

    #[tokio::test]
    async fn test_no_retry_policy_runs_once() {
        let outcome = execute(StageName::Analyze, Duration::from_secs(1), &RetryPolicy::none(), |_| async {
            Err::<(), _>(StageError::transient("flaky"))
        })
        .await;
        assert_eq!(outcome.attempts, 1);
    }

    #[tokio::test]
    async fn test_timeout_abandons_stage() {
        let outcome = execute(StageName::Clone, Duration::from_millis(50), &RetryPolicy::none(), |_| async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok::<_, StageError>(())
        })
        .await;
        assert!(matches!(outcome.result, Err(StageError::Timeout(_))));
        assert_eq!(outcome.timing().outcome, "timeout");
    }
}
