//! Concurrency governor.
//!
//! Two throttles, independent of each other: a semaphore bounds how many
//! extraction calls are outstanding at once, and a pacing gate enforces a
//! minimum spacing between call issuances. Retryable failures get capped
//! exponential backoff with both an attempt cap and a total time budget;
//! exceeding either reclassifies the item instead of retrying forever.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use rand::Rng;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{ExtractError, GovernorError};

/// Explicit retry bounds, consumed here rather than buried in library
/// defaults so tests can exhaust them deterministically.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts per item, including the first.
    pub max_attempts: u32,
    /// Total retry time budget per item.
    pub max_elapsed: Duration,
    /// First backoff delay; doubles per attempt.
    pub base_delay: Duration,
    /// Ceiling on a single backoff delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            max_elapsed: Duration::from_secs(60),
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

/// Governor settings.
#[derive(Debug, Clone)]
pub struct GovernorConfig {
    /// Ceiling on concurrently outstanding calls.
    pub max_concurrent: usize,
    /// Minimum spacing between call issuances.
    pub pacing_delay: Duration,
    pub retry: RetryPolicy,
}

/// Gates extraction calls: ceiling, pacing, bounded retries.
pub struct Governor {
    semaphore: Semaphore,
    /// Earliest instant the next call may be issued. Held across the wait so
    /// issuances are strictly serialized.
    next_issue: Mutex<Instant>,
    pacing_delay: Duration,
    retry: RetryPolicy,
    in_flight: AtomicUsize,
}

impl Governor {
    pub fn new(config: GovernorConfig) -> Self {
        Self {
            semaphore: Semaphore::new(config.max_concurrent.max(1)),
            next_issue: Mutex::new(Instant::now()),
            pacing_delay: config.pacing_delay,
            retry: config.retry,
            in_flight: AtomicUsize::new(0),
        }
    }

    /// Instrumentation hook: calls currently holding a concurrency slot.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Run one governed call: acquire a slot, pace, retry retryable
    /// failures under the policy bounds. Fatal failures pass through
    /// immediately; exhausted bounds come back as
    /// [`GovernorError::Exhausted`].
    pub async fn run<T, F, Fut>(&self, label: &str, op: F) -> Result<T, GovernorError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, ExtractError>>,
    {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| GovernorError::Fatal("governor semaphore closed".into()))?;

        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let _guard = InFlightGuard(&self.in_flight);

        let started = Instant::now();
        let mut attempt: u32 = 0;

        loop {
            self.pace().await;
            attempt += 1;

            match op().await {
                Ok(value) => return Ok(value),
                Err(ExtractError::Fatal(reason)) => {
                    return Err(GovernorError::Fatal(reason));
                }
                Err(ExtractError::Retryable(reason)) => {
                    let elapsed = started.elapsed();
                    if attempt >= self.retry.max_attempts || elapsed >= self.retry.max_elapsed {
                        warn!(
                            %label,
                            attempt,
                            elapsed_secs = elapsed.as_secs_f64(),
                            reason = %reason,
                            "Retries exhausted, reclassifying as failed-permanent"
                        );
                        return Err(GovernorError::Exhausted {
                            attempts: attempt,
                            last_error: reason,
                        });
                    }

                    let delay = self.backoff_delay(attempt);
                    debug!(
                        %label,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        reason = %reason,
                        "Retryable failure, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Wait until the pacing gate opens, then claim the next slot.
    async fn pace(&self) {
        if self.pacing_delay.is_zero() {
            return;
        }
        let mut next_issue = self.next_issue.lock().await;
        let earliest = *next_issue;
        if earliest > Instant::now() {
            tokio::time::sleep_until(earliest).await;
        }
        *next_issue = Instant::now() + self.pacing_delay;
    }

    /// Capped exponential delay with jitter: 2^(attempt-1) * base, capped,
    /// scaled by a random factor in [0.5, 1.0].
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let doubled = self
            .retry
            .base_delay
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)));
        let capped = doubled.min(self.retry.max_delay);
        let jitter = rand::thread_rng().gen_range(0.5..=1.0);
        capped.mul_f64(jitter)
    }
}

struct InFlightGuard<'a>(&'a AtomicUsize);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;
    use std::sync::atomic::AtomicU32;

    fn governor(max_concurrent: usize, pacing: Duration, retry: RetryPolicy) -> Arc<Governor> {
        Arc::new(Governor::new(GovernorConfig {
            max_concurrent,
            pacing_delay: pacing,
            retry,
        }))
    }

    fn fast_retry(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            max_elapsed: Duration::from_secs(60),
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
        }
    }

    #[tokio::test]
    async fn success_passes_value_through() {
        let gov = governor(2, Duration::ZERO, fast_retry(3));
        let result: Result<u32, _> = gov.run("item", || async { Ok(7) }).await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(gov.in_flight(), 0);
    }

    #[tokio::test]
    async fn always_transient_exhausts_at_attempt_cap() {
        let gov = governor(1, Duration::ZERO, fast_retry(3));
        let calls = Arc::new(AtomicU32::new(0));

        let calls2 = Arc::clone(&calls);
        let result: Result<(), _> = gov
            .run("item", move || {
                let calls = Arc::clone(&calls2);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(ExtractError::Retryable("still flaky".into()))
                }
            })
            .await;

        match result.unwrap_err() {
            GovernorError::Exhausted {
                attempts,
                last_error,
            } => {
                assert_eq!(attempts, 3);
                assert_eq!(last_error, "still flaky");
            }
            other => panic!("expected Exhausted, got {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn time_budget_cuts_off_before_attempt_cap() {
        let gov = governor(
            1,
            Duration::ZERO,
            RetryPolicy {
                max_attempts: 100,
                max_elapsed: Duration::from_millis(250),
                base_delay: Duration::from_millis(100),
                max_delay: Duration::from_secs(5),
            },
        );

        let result: Result<(), _> = gov
            .run("item", || async { Err(ExtractError::Retryable("no".into())) })
            .await;

        match result.unwrap_err() {
            GovernorError::Exhausted { attempts, .. } => {
                assert!(attempts < 100, "time budget should fire first");
                assert!(attempts >= 2);
            }
            other => panic!("expected Exhausted, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn fatal_failure_is_not_retried() {
        let gov = governor(1, Duration::ZERO, fast_retry(5));
        let calls = Arc::new(AtomicU32::new(0));

        let calls2 = Arc::clone(&calls);
        let result: Result<(), _> = gov
            .run("item", move || {
                let calls = Arc::clone(&calls2);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(ExtractError::Fatal("401".into()))
                }
            })
            .await;

        assert!(matches!(result.unwrap_err(), GovernorError::Fatal(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn ceiling_is_never_exceeded() {
        let gov = governor(3, Duration::ZERO, fast_retry(1));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for i in 0..12 {
            let gov = Arc::clone(&gov);
            let peak = Arc::clone(&peak);
            handles.push(tokio::spawn(async move {
                let gov2 = Arc::clone(&gov);
                gov.run(&format!("item {i}"), move || {
                    let gov = Arc::clone(&gov2);
                    let peak = Arc::clone(&peak);
                    async move {
                        peak.fetch_max(gov.in_flight(), Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        Ok(())
                    }
                })
                .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let observed = peak.load(Ordering::SeqCst);
        assert!(observed <= 3, "ceiling exceeded: {observed}");
        assert!(observed >= 2, "load never overlapped: {observed}");
        assert_eq!(gov.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn pacing_spaces_issuances() {
        let gov = governor(10, Duration::from_millis(50), fast_retry(1));
        let start = Instant::now();

        let (a, b, c) = tokio::join!(
            gov.run("a", || async { Ok(()) }),
            gov.run("b", || async { Ok(()) }),
            gov.run("c", || async { Ok(()) }),
        );
        a.unwrap();
        b.unwrap();
        c.unwrap();

        // Three issuances need at least two pacing gaps.
        assert!(start.elapsed() >= Duration::from_millis(100));
    }

    #[tokio::test]
    async fn transient_then_success_recovers() {
        let gov = governor(1, Duration::ZERO, fast_retry(3));
        let calls = Arc::new(AtomicU32::new(0));

        let calls2 = Arc::clone(&calls);
        let result = gov
            .run("item", move || {
                let calls = Arc::clone(&calls2);
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(ExtractError::Retryable("blip".into()))
                    } else {
                        Ok("done")
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
