//! Retry scheduling for transaction functions.
//!
//! Exponential backoff with jitter: first delay 1 s, doubling per attempt,
//! ±20 % jitter, capped at 30 s per delay, bounded overall by the configured
//! retry budget. Which errors are worth replaying is decided by the error
//! taxonomy; an acquisition timeout additionally gets one free retry on the
//! very first attempt.

use std::time::{Duration, Instant};

use rand::Rng;

use crate::error::Error;

/// Backoff parameters. The defaults are the documented driver behaviour;
/// only the total budget is commonly tuned.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub initial_delay: Duration,
    pub multiplier: f64,
    pub jitter: f64,
    pub max_delay: Duration,
    pub max_retry_time: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            multiplier: 2.0,
            jitter: 0.2,
            max_delay: Duration::from_secs(30),
            max_retry_time: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    pub fn with_budget(max_retry_time: Duration) -> Self {
        Self {
            max_retry_time,
            ..Self::default()
        }
    }
}

/// What to do with a failed attempt.
#[derive(Debug)]
pub(crate) enum RetryDecision {
    /// Sleep this long, then replay.
    Retry(Duration),
    /// The error is not retryable; surface it as-is.
    Fatal,
    /// Retryable, but the budget is spent.
    BudgetExhausted,
}

/// Mutable backoff state for one transaction function execution.
pub(crate) struct Backoff {
    policy: RetryPolicy,
    started: Instant,
    base_delay: Duration,
    attempts: u32,
    suppressed: Vec<Error>,
}

impl Backoff {
    pub fn new(policy: RetryPolicy) -> Self {
        let base_delay = policy.initial_delay;
        Self {
            policy,
            started: Instant::now(),
            base_delay,
            attempts: 0,
            suppressed: Vec::new(),
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn decide(&mut self, error: &Error) -> RetryDecision {
        let first_attempt = self.attempts == 0;
        self.attempts += 1;

        let retryable = error.is_retryable()
            || (first_attempt && matches!(error, Error::AcquisitionTimeout(_)));
        if !retryable {
            return RetryDecision::Fatal;
        }

        let delay = jittered(self.base_delay, self.policy.jitter);
        if self.started.elapsed() + delay > self.policy.max_retry_time {
            return RetryDecision::BudgetExhausted;
        }
        self.base_delay = Duration::from_secs_f64(
            (self.base_delay.as_secs_f64() * self.policy.multiplier)
                .min(self.policy.max_delay.as_secs_f64()),
        );
        RetryDecision::Retry(delay)
    }

    /// Park a retryable error that will ride along if the budget runs out.
    pub fn suppress(&mut self, error: Error) {
        self.suppressed.push(error);
    }

    /// Wrap the final error together with the suppressed earlier attempts.
    pub fn exhaust(self, last: Error) -> Error {
        Error::RetriesExhausted {
            attempts: self.attempts,
            last: Box::new(last),
            suppressed: self.suppressed,
        }
    }
}

fn jittered(base: Duration, jitter: f64) -> Duration {
    let factor = 1.0 + rand::thread_rng().gen_range(-jitter..=jitter);
    Duration::from_secs_f64(base.as_secs_f64() * factor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ServerError;

    fn transient() -> Error {
        Error::Server(ServerError::new(
            "Neo.TransientError.Transaction.DeadlockDetected",
            "deadlock",
        ))
    }

    fn policy() -> RetryPolicy {
        RetryPolicy::with_budget(Duration::from_secs(120))
    }

    #[test]
    fn delays_follow_doubling_with_bounded_jitter() {
        let mut backoff = Backoff::new(policy());
        let mut expected_base = 1.0f64;
        for _ in 0..5 {
            match backoff.decide(&transient()) {
                RetryDecision::Retry(delay) => {
                    let secs = delay.as_secs_f64();
                    assert!(
                        secs >= expected_base * 0.8 - 1e-9 && secs <= expected_base * 1.2 + 1e-9,
                        "delay {secs}s outside ±20% of {expected_base}s"
                    );
                    expected_base *= 2.0;
                }
                other => panic!("expected retry, got {other:?}"),
            }
        }
    }

    #[test]
    fn per_delay_cap_is_thirty_seconds() {
        let mut backoff = Backoff::new(RetryPolicy::with_budget(Duration::from_secs(100_000)));
        let mut last = Duration::ZERO;
        for _ in 0..12 {
            if let RetryDecision::Retry(delay) = backoff.decide(&transient()) {
                last = delay;
            }
        }
        // 1 · 2^11 would be far past the cap; jitter allows at most +20 %.
        assert!(last.as_secs_f64() <= 30.0 * 1.2 + 1e-9);
    }

    #[test]
    fn fatal_errors_do_not_retry() {
        let mut backoff = Backoff::new(policy());
        let fatal = Error::Server(ServerError::new(
            "Neo.ClientError.Statement.SyntaxError",
            "bad",
        ));
        assert!(matches!(backoff.decide(&fatal), RetryDecision::Fatal));
        assert!(matches!(
            backoff.decide(&Error::Protocol("garbled".into())),
            RetryDecision::Fatal
        ));
    }

    #[test]
    fn acquisition_timeout_retries_only_on_first_attempt() {
        let mut backoff = Backoff::new(policy());
        let timeout = Error::AcquisitionTimeout(Duration::from_secs(1));
        assert!(matches!(
            backoff.decide(&timeout),
            RetryDecision::Retry(_)
        ));
        let timeout = Error::AcquisitionTimeout(Duration::from_secs(1));
        assert!(matches!(backoff.decide(&timeout), RetryDecision::Fatal));
    }

    #[test]
    fn budget_exhaustion_reports_suppressed_attempts() {
        // Zero budget: the first retryable error already exceeds it.
        let mut backoff = Backoff::new(RetryPolicy::with_budget(Duration::ZERO));
        assert!(matches!(
            backoff.decide(&transient()),
            RetryDecision::BudgetExhausted
        ));
        backoff.suppress(transient());
        let err = backoff.exhaust(transient());
        match err {
            Error::RetriesExhausted {
                attempts,
                suppressed,
                last,
            } => {
                assert_eq!(attempts, 1);
                assert_eq!(suppressed.len(), 1);
                assert!(last.to_string().contains("DeadlockDetected"));
            }
            other => panic!("expected RetriesExhausted, got {other}"),
        }
    }

    #[test]
    fn service_and_session_errors_are_retryable() {
        let mut backoff = Backoff::new(policy());
        assert!(matches!(
            backoff.decide(&Error::ServiceUnavailable("down".into())),
            RetryDecision::Retry(_)
        ));
        assert!(matches!(
            backoff.decide(&Error::SessionExpired("moved".into())),
            RetryDecision::Retry(_)
        ));
    }
}
