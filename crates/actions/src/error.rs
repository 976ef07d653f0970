use neura_core::errors::{ApplicationError, ErrorCode};
use thiserror::Error;

use crate::transport::TransportError;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ActionError {
    #[error("circuit breaker open for `{target}`")]
    CircuitOpen { target: String },
    #[error("`{target}` failed after {attempts} attempt(s): {last_error}")]
    Exhausted {
        target: String,
        attempts: u32,
        #[source]
        last_error: TransportError,
    },
    #[error("`{target}` is not configured: {reason}")]
    NotConfigured { target: String, reason: String },
}

impl ActionError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::CircuitOpen { .. } => ErrorCode::CircuitOpen,
            Self::Exhausted { .. } => ErrorCode::DownstreamFailed,
            Self::NotConfigured { .. } => ErrorCode::InternalError,
        }
    }

    pub fn target(&self) -> &str {
        match self {
            Self::CircuitOpen { target }
            | Self::Exhausted { target, .. }
            | Self::NotConfigured { target, .. } => target,
        }
    }
}

impl From<ActionError> for ApplicationError {
    fn from(error: ActionError) -> Self {
        match error {
            ActionError::CircuitOpen { target } => Self::CircuitOpen { target },
            ActionError::Exhausted { target, attempts, last_error } => {
                Self::Downstream { target, attempts, message: last_error.to_string() }
            }
            ActionError::NotConfigured { target, reason } => {
                Self::Configuration(format!("{target}: {reason}"))
            }
        }
    }
}
