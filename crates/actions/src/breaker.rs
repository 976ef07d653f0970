//! Per-target circuit breaker with a lazy cooldown reset.
//!
//! The breaker opens once consecutive failures reach the threshold. There is
//! no timer: the first state check after the cooldown has elapsed closes it
//! again with a zeroed failure count, which makes the next call the trial call.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use neura_core::config::DownstreamConfig;
use neura_core::domain::response::BreakerState;
use neura_core::Clock;
use serde::Serialize;
use tracing::{info, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BreakerConfig {
    pub threshold: u32,
    pub cooldown: Duration,
}

impl From<&DownstreamConfig> for BreakerConfig {
    fn from(config: &DownstreamConfig) -> Self {
        Self { threshold: config.breaker_threshold, cooldown: config.breaker_cooldown() }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakerSnapshot {
    pub target: String,
    pub state: BreakerState,
    pub failures: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub opened_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct CircuitState {
    failures: u32,
    opened_at: Option<DateTime<Utc>>,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    target: String,
    config: BreakerConfig,
    clock: Arc<dyn Clock>,
    state: Mutex<CircuitState>,
}

impl CircuitBreaker {
    pub fn new(target: impl Into<String>, config: BreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            target: target.into(),
            config: BreakerConfig { threshold: config.threshold.max(1), ..config },
            clock,
            state: Mutex::new(CircuitState::default()),
        }
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    /// Whether calls must be rejected right now. Closes the breaker when the
    /// cooldown has strictly elapsed.
    pub fn is_open(&self) -> bool {
        let mut state = self.lock();
        let Some(opened_at) = state.opened_at else {
            return false;
        };
        if self.cooled_down(opened_at) {
            state.failures = 0;
            state.opened_at = None;
            info!(
                event_name = "action.breaker.reset",
                target = %self.target,
                "circuit breaker cooldown elapsed; next call tries the target"
            );
            return false;
        }
        true
    }

    pub fn record_success(&self) {
        let mut state = self.lock();
        state.failures = 0;
        state.opened_at = None;
    }

    /// Counts a failed attempt and returns the resulting state.
    pub fn record_failure(&self) -> BreakerState {
        let mut state = self.lock();
        state.failures = state.failures.saturating_add(1);
        if state.failures >= self.config.threshold {
            state.opened_at = Some(self.clock.now());
            warn!(
                event_name = "action.breaker.opened",
                target = %self.target,
                failures = state.failures,
                cooldown_ms = self.config.cooldown.as_millis() as u64,
                "circuit breaker opened"
            );
            return BreakerState::Open;
        }
        BreakerState::Closed
    }

    /// Read-only view. A breaker whose cooldown elapsed but has not been
    /// tried yet reports `HalfOpen`.
    pub fn snapshot(&self) -> BreakerSnapshot {
        let state = self.lock();
        let breaker_state = match state.opened_at {
            None => BreakerState::Closed,
            Some(opened_at) if self.cooled_down(opened_at) => BreakerState::HalfOpen,
            Some(_) => BreakerState::Open,
        };
        BreakerSnapshot {
            target: self.target.clone(),
            state: breaker_state,
            failures: state.failures,
            opened_at: state.opened_at,
        }
    }

    fn cooled_down(&self, opened_at: DateTime<Utc>) -> bool {
        let since = self.clock.now() - opened_at;
        since.to_std().map(|elapsed| elapsed > self.config.cooldown).unwrap_or(false)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CircuitState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
