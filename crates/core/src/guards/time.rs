//! Per-request deadlines split into total, model-call and tool-call phases.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::warn;

use crate::clock::Clock;
use crate::domain::request::PhaseTimeouts;
use crate::errors::ErrorCode;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Total,
    Llm,
    Tool,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Total => "total",
            Self::Llm => "llm",
            Self::Tool => "tool",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Deadlines {
    pub total: DateTime<Utc>,
    pub llm: DateTime<Utc>,
    pub tool: DateTime<Utc>,
}

impl Deadlines {
    pub fn for_phase(&self, phase: Phase) -> DateTime<Utc> {
        match phase {
            Phase::Total => self.total,
            Phase::Llm => self.llm,
            Phase::Tool => self.tool,
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum TimeGuardError {
    #[error("{phase} deadline exceeded by {overrun_ms} ms")]
    PhaseExceeded { phase: Phase, overrun_ms: u64 },
    #[error("no deadlines registered for correlation id `{correlation_id}`")]
    NotRegistered { correlation_id: String },
}

impl TimeGuardError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::PhaseExceeded { phase: Phase::Total, .. } => ErrorCode::TotalTimeout,
            Self::PhaseExceeded { phase: Phase::Llm, .. } => ErrorCode::LlmTimeout,
            Self::PhaseExceeded { phase: Phase::Tool, .. } => ErrorCode::ToolTimeout,
            Self::NotRegistered { .. } => ErrorCode::TimeGuardNotRegistered,
        }
    }
}

/// Tracks absolute deadlines per correlation id.
///
/// Phases are checked independently; callers check `Total` at top-level
/// checkpoints. A failed check does not cancel work already in flight.
#[derive(Debug)]
pub struct TimeGuard {
    clock: Arc<dyn Clock>,
    deadlines: Mutex<HashMap<String, Deadlines>>,
}

impl TimeGuard {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock, deadlines: Mutex::new(HashMap::new()) }
    }

    pub fn init(&self, correlation_id: &str, timeouts: &PhaseTimeouts) -> Deadlines {
        let now = self.clock.now();
        let after = |millis: u64| {
            now.checked_add_signed(Duration::milliseconds(millis.min(i64::MAX as u64) as i64))
                .unwrap_or(DateTime::<Utc>::MAX_UTC)
        };
        let deadlines = Deadlines {
            total: after(timeouts.total),
            llm: after(timeouts.llm),
            tool: after(timeouts.tool),
        };
        self.lock().insert(correlation_id.to_string(), deadlines);
        deadlines
    }

    pub fn assert_within_phase(
        &self,
        correlation_id: &str,
        phase: Phase,
    ) -> Result<(), TimeGuardError> {
        let deadline = self.deadlines(correlation_id)?.for_phase(phase);
        let now = self.clock.now();
        if now > deadline {
            let overrun_ms = (now - deadline).num_milliseconds().max(0) as u64;
            warn!(
                event_name = "guard.time.deadline_exceeded",
                correlation_id,
                phase = phase.as_str(),
                overrun_ms,
                "phase deadline exceeded"
            );
            return Err(TimeGuardError::PhaseExceeded { phase, overrun_ms });
        }
        Ok(())
    }

    /// Time left before the phase deadline, zero once it has passed.
    pub fn remaining(
        &self,
        correlation_id: &str,
        phase: Phase,
    ) -> Result<StdDuration, TimeGuardError> {
        let deadline = self.deadlines(correlation_id)?.for_phase(phase);
        Ok((deadline - self.clock.now()).to_std().unwrap_or(StdDuration::ZERO))
    }

    pub fn deadlines(&self, correlation_id: &str) -> Result<Deadlines, TimeGuardError> {
        self.lock().get(correlation_id).copied().ok_or_else(|| TimeGuardError::NotRegistered {
            correlation_id: correlation_id.to_string(),
        })
    }

    /// Releases the tracked entry. Returns whether one existed.
    pub fn complete(&self, correlation_id: &str) -> bool {
        self.lock().remove(correlation_id).is_some()
    }

    pub fn tracked(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Deadlines>> {
        self.deadlines.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
