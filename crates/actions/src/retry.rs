//! Retry with exponential backoff behind a circuit breaker, recording every attempt.

use std::future::Future;
use std::time::Duration;

use neura_core::config::DownstreamConfig;
use neura_core::metrics::MetricsRegistry;
use neura_core::domain::response::{
    AttemptRecord, AttemptStatus, BreakerState, ToolExecutionSummary, ToolKind,
};
use rand::Rng;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::breaker::CircuitBreaker;
use crate::error::ActionError;
use crate::transport::TransportError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles for each later one.
    pub backoff: Duration,
    /// Upper bound of random extra delay added to each backoff.
    pub jitter: Duration,
    /// Bound on a single attempt, enforced regardless of transport.
    pub attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Duration::from_millis(1_000),
            jitter: Duration::ZERO,
            attempt_timeout: Duration::from_secs(25),
        }
    }
}

impl From<&DownstreamConfig> for RetryPolicy {
    fn from(config: &DownstreamConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            backoff: config.backoff(),
            jitter: Duration::ZERO,
            attempt_timeout: config.timeout(),
        }
    }
}

impl RetryPolicy {
    /// `backoff * 2^(attempt - 1)` for the 1-based attempt that just failed.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let base = self.backoff.saturating_mul(1_u32 << exponent);
        if self.jitter.is_zero() {
            return base;
        }
        let extra_ms = rand::thread_rng().gen_range(0..=self.jitter.as_millis() as u64);
        base + Duration::from_millis(extra_ms)
    }
}

/// Outcome of one generator call plus the ordered per-attempt trail.
///
/// An open breaker yields an empty trail and `ActionError::CircuitOpen`; a
/// cache hit yields an empty trail and `cache_hit = true`.
#[derive(Clone, Debug, PartialEq)]
pub struct AttemptLog<T> {
    pub target: String,
    pub attempts: Vec<AttemptRecord>,
    pub outcome: Result<T, ActionError>,
    pub cache_hit: bool,
    pub request_id: Option<String>,
}

impl<T> AttemptLog<T> {
    pub fn cached(target: impl Into<String>, value: T) -> Self {
        Self {
            target: target.into(),
            attempts: Vec::new(),
            outcome: Ok(value),
            cache_hit: true,
            request_id: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }

    pub fn total_latency_ms(&self) -> u64 {
        self.attempts.iter().map(|record| record.latency_ms).sum()
    }

    pub fn last_breaker_state(&self) -> Option<BreakerState> {
        match (&self.outcome, self.attempts.last()) {
            (Err(ActionError::CircuitOpen { .. }), _) => Some(BreakerState::Open),
            (_, Some(record)) => Some(record.breaker_state),
            (_, None) => None,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> AttemptLog<U> {
        AttemptLog {
            target: self.target,
            attempts: self.attempts,
            outcome: self.outcome.map(f),
            cache_hit: self.cache_hit,
            request_id: self.request_id,
        }
    }

    pub fn summary(&self, name: impl Into<String>, kind: ToolKind) -> ToolExecutionSummary {
        ToolExecutionSummary {
            name: name.into(),
            kind,
            success: self.is_success(),
            latency_ms: self.total_latency_ms(),
            attempts: self.attempts.len() as u32,
            request_id: self.request_id.clone(),
            error_message: self.outcome.as_ref().err().map(ToString::to_string),
            breaker_state: self.last_breaker_state(),
            cache_hit: self.cache_hit,
            trail: self.attempts.clone(),
        }
    }

    pub fn into_result(self) -> Result<T, ActionError> {
        self.outcome
    }
}

impl<'a, T> IntoIterator for &'a AttemptLog<T> {
    type Item = &'a AttemptRecord;
    type IntoIter = std::slice::Iter<'a, AttemptRecord>;

    fn into_iter(self) -> Self::IntoIter {
        self.attempts.iter()
    }
}

/// Runs `call` until it succeeds, attempts run out, or the breaker opens.
///
/// `call` receives the 1-based attempt number. Each attempt is bounded by
/// `policy.attempt_timeout`; a timed-out attempt counts as a failure.
/// Every attempt feeds `<target>.latency` and `<target>.success` or
/// `<target>.failure` in `metrics`; breaker rejections count as
/// `<target>.circuit_open`.
pub async fn run_with_retry<T, F, Fut>(
    breaker: &CircuitBreaker,
    policy: &RetryPolicy,
    metrics: &MetricsRegistry,
    mut call: F,
) -> AttemptLog<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, TransportError>>,
{
    let target = breaker.target().to_owned();
    if breaker.is_open() {
        warn!(event_name = "action.breaker.rejected", target = %target, "circuit breaker open");
        metrics.increment(&format!("{target}.circuit_open"));
        return AttemptLog {
            outcome: Err(ActionError::CircuitOpen { target: target.clone() }),
            target,
            attempts: Vec::new(),
            cache_hit: false,
            request_id: None,
        };
    }

    let max_attempts = policy.max_attempts.max(1);
    let mut attempts = Vec::with_capacity(max_attempts as usize);
    let mut attempt = 0;
    loop {
        attempt += 1;
        let started = Instant::now();
        let result = match tokio::time::timeout(policy.attempt_timeout, call(attempt)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout(policy.attempt_timeout.as_millis() as u64)),
        };
        let latency_ms = started.elapsed().as_millis() as u64;
        metrics.observe(&format!("{target}.latency"), latency_ms as f64);

        match result {
            Ok(value) => {
                breaker.record_success();
                metrics.increment(&format!("{target}.success"));
                attempts.push(AttemptRecord {
                    attempt,
                    latency_ms,
                    breaker_state: BreakerState::Closed,
                    status: AttemptStatus::Success,
                });
                debug!(
                    event_name = "action.attempt.succeeded",
                    target = %target,
                    attempt,
                    latency_ms,
                    "downstream call succeeded"
                );
                return AttemptLog {
                    target,
                    attempts,
                    outcome: Ok(value),
                    cache_hit: false,
                    request_id: None,
                };
            }
            Err(error) => {
                let breaker_state = breaker.record_failure();
                metrics.increment(&format!("{target}.failure"));
                attempts.push(AttemptRecord {
                    attempt,
                    latency_ms,
                    breaker_state,
                    status: AttemptStatus::Error { error: error.to_string() },
                });
                warn!(
                    event_name = "action.attempt.failed",
                    target = %target,
                    attempt,
                    max_attempts,
                    latency_ms,
                    breaker_state = breaker_state.as_str(),
                    error = %error,
                    "downstream call failed"
                );

                if attempt >= max_attempts || breaker_state == BreakerState::Open {
                    return AttemptLog {
                        outcome: Err(ActionError::Exhausted {
                            target: target.clone(),
                            attempts: attempt,
                            last_error: error,
                        }),
                        target,
                        attempts,
                        cache_hit: false,
                        request_id: None,
                    };
                }

                tokio::time::sleep(policy.delay_for_attempt(attempt)).await;
            }
        }
    }
}
