use std::time::Duration;

use log::warn;
use rand::Rng;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::{BackoffPolicy, ErrorClass, FetchError};

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry once the delay elapsed.
    RetryAfter(Duration),
    /// Retry right away.
    RetryImmediately,
    /// Give up, the error is terminal for the call.
    Fail,
}

/// The exponential delay before the `retry`-th retry (1-based), capped at the policy maximum.
pub fn exponential_delay(policy: &BackoffPolicy, retry: u32) -> Duration {
    let factor = 2u32.saturating_pow(retry.saturating_sub(1).min(31));

    policy.base_delay.saturating_mul(factor).min(policy.max_delay)
}

/// Stretches a delay by up to 50%, without exceeding `max_delay`.
///
/// Since the exponential delays double, a jittered delay never exceeds the next un-jittered one.
fn jittered(delay: Duration, max_delay: Duration) -> Duration {
    let stretch = rand::thread_rng().gen_range(0.0..=0.5);

    delay.mul_f64(1.0 + stretch).min(max_delay)
}

/// The retry controller of one upstream call.
///
/// It only counts the attempts of its own call and is dropped with it; the shared
/// cancellation token tells it not to retry anymore.
#[derive(Debug)]
pub struct BackoffController {
    /// The retry policy.
    policy: BackoffPolicy,

    /// The run cancellation token.
    cancellation: CancellationToken,

    /// Describes the call in retry events, as `key=value` pairs.
    label: String,

    /// The number of failed attempts so far.
    attempts: u32,
}

impl BackoffController {
    /// Creates a new `BackoffController` instance.
    pub fn new(policy: BackoffPolicy, cancellation: CancellationToken, label: &str) -> Self {
        Self {
            policy,
            cancellation,
            label: label.to_string(),
            attempts: 0,
        }
    }

    /// Retrieves the number of failed attempts.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Records a failed attempt and decides whether and when to retry it.
    pub fn decide(&mut self, error: &FetchError) -> RetryDecision {
        self.attempts += 1;
        let retry_after = match error.class() {
            ErrorClass::Transient => None,
            ErrorClass::Throttled(retry_after) => retry_after,
            ErrorClass::Permanent | ErrorClass::RunFatal | ErrorClass::Cancelled => {
                return RetryDecision::Fail;
            }
        };
        if self.cancellation.is_cancelled() {
            warn!(
                "Retry abandoned: {} attempt={} reason=cancelled cause=\"{error}\"",
                self.label, self.attempts
            );
            return RetryDecision::Fail;
        }
        if self.attempts >= self.policy.max_attempts {
            return RetryDecision::Fail;
        }

        let decision = match retry_after {
            Some(delay) if delay.is_zero() => RetryDecision::RetryImmediately,
            Some(delay) => RetryDecision::RetryAfter(delay),
            None => {
                let delay = exponential_delay(&self.policy, self.attempts);
                RetryDecision::RetryAfter(if self.policy.with_jitter {
                    jittered(delay, self.policy.max_delay)
                } else {
                    delay
                })
            }
        };
        let delay = match decision {
            RetryDecision::RetryAfter(delay) => delay,
            _ => Duration::ZERO,
        };
        warn!(
            "Retry event: {} attempt={}/{} delay={delay:?} cause=\"{error}\"",
            self.label, self.attempts, self.policy.max_attempts
        );

        decision
    }

    /// Sleeps for the delay, returning `false` if the run was cancelled meanwhile.
    pub async fn wait(&self, delay: Duration) -> bool {
        tokio::select! {
            _ = self.cancellation.cancelled() => false,
            _ = sleep(delay) => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(max_attempts: u32, with_jitter: bool) -> BackoffPolicy {
        BackoffPolicy {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            max_attempts,
            with_jitter,
        }
    }

    fn transient() -> FetchError {
        FetchError::TransientNetwork("connection reset".to_string())
    }

    fn throttled(retry_after: Option<Duration>) -> FetchError {
        FetchError::Throttled {
            retry_after,
            message: "slow down".to_string(),
        }
    }

    #[test]
    fn exponential_delays_double_up_to_the_cap() {
        let policy = policy(10, false);

        let delays = (1..=6)
            .map(|retry| exponential_delay(&policy, retry).as_secs())
            .collect::<Vec<_>>();

        assert_eq!(vec![1, 2, 4, 8, 10, 10], delays);
        assert_eq!(Duration::from_secs(10), exponential_delay(&policy, 100));
    }

    #[test]
    fn retry_delays_are_non_decreasing() {
        for _ in 0..50 {
            let mut controller =
                BackoffController::new(policy(12, true), CancellationToken::new(), "test");
            let mut previous = Duration::ZERO;
            for _ in 0..11 {
                match controller.decide(&transient()) {
                    RetryDecision::RetryAfter(delay) => {
                        assert!(delay >= previous, "{delay:?} < {previous:?}");
                        assert!(delay <= Duration::from_secs(10));
                        previous = delay;
                    }
                    decision => panic!("Unexpected decision {decision:?}"),
                }
            }
        }
    }

    #[test]
    fn retry_after_takes_precedence_over_the_schedule() {
        let mut controller =
            BackoffController::new(policy(10, true), CancellationToken::new(), "test");
        for _ in 0..3 {
            controller.decide(&transient());
        }

        let decision = controller.decide(&throttled(Some(Duration::from_secs(7))));

        assert_eq!(RetryDecision::RetryAfter(Duration::from_secs(7)), decision);
    }

    #[test]
    fn throttling_without_hint_follows_the_schedule() {
        let mut controller =
            BackoffController::new(policy(10, false), CancellationToken::new(), "test");

        assert_eq!(
            RetryDecision::RetryAfter(Duration::from_secs(1)),
            controller.decide(&throttled(None))
        );
        assert_eq!(
            RetryDecision::RetryAfter(Duration::from_secs(2)),
            controller.decide(&throttled(None))
        );
    }

    #[test]
    fn zero_retry_after_retries_immediately() {
        let mut controller =
            BackoffController::new(policy(10, true), CancellationToken::new(), "test");

        assert_eq!(
            RetryDecision::RetryImmediately,
            controller.decide(&throttled(Some(Duration::ZERO)))
        );
    }

    #[test]
    fn non_retryable_errors_fail_immediately() {
        for error in [
            FetchError::PermanentRequest("not found".to_string()),
            FetchError::Malformed("eof".to_string()),
            FetchError::Unauthorized("bad credentials".to_string()),
            FetchError::Cancelled,
        ] {
            let mut controller =
                BackoffController::new(policy(10, true), CancellationToken::new(), "test");

            assert_eq!(RetryDecision::Fail, controller.decide(&error));
            assert_eq!(1, controller.attempts());
        }
    }

    #[test]
    fn fails_once_attempts_are_exhausted() {
        let mut controller =
            BackoffController::new(policy(3, false), CancellationToken::new(), "test");

        assert_ne!(RetryDecision::Fail, controller.decide(&transient()));
        assert_ne!(RetryDecision::Fail, controller.decide(&transient()));
        assert_eq!(RetryDecision::Fail, controller.decide(&transient()));
        assert_eq!(3, controller.attempts());
    }

    #[test]
    fn does_not_retry_once_cancelled() {
        let cancellation = CancellationToken::new();
        let mut controller = BackoffController::new(policy(10, true), cancellation.clone(), "test");
        cancellation.cancel();

        assert_eq!(RetryDecision::Fail, controller.decide(&transient()));
    }

    #[tokio::test(start_paused = true)]
    async fn wait_is_interrupted_by_cancellation() {
        let cancellation = CancellationToken::new();
        let controller = BackoffController::new(policy(10, true), cancellation.clone(), "test");

        assert!(controller.wait(Duration::from_secs(5)).await);

        cancellation.cancel();
        assert!(!controller.wait(Duration::from_secs(5)).await);
    }
}
