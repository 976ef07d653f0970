use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::domain::request::ValidationError;
use crate::guards::cost::CostGuardError;
use crate::guards::time::TimeGuardError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    ValidationFailed,
    CostCapExceeded,
    DailyBudgetExceeded,
    TotalTimeout,
    LlmTimeout,
    ToolTimeout,
    TimeGuardNotRegistered,
    CircuitOpen,
    DownstreamFailed,
    StreamFailed,
    InternalError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ValidationFailed => "VALIDATION_FAILED",
            Self::CostCapExceeded => "COST_CAP_EXCEEDED",
            Self::DailyBudgetExceeded => "DAILY_BUDGET_EXCEEDED",
            Self::TotalTimeout => "TOTAL_TIMEOUT",
            Self::LlmTimeout => "LLM_TIMEOUT",
            Self::ToolTimeout => "TOOL_TIMEOUT",
            Self::TimeGuardNotRegistered => "TIME_GUARD_NOT_REGISTERED",
            Self::CircuitOpen => "CIRCUIT_OPEN",
            Self::DownstreamFailed => "DOWNSTREAM_FAILED",
            Self::StreamFailed => "STREAM_FAILED",
            Self::InternalError => "INTERNAL_ERROR",
        }
    }

    /// Whether re-submitting the same request (same idempotency key) may succeed.
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            Self::TotalTimeout
                | Self::LlmTimeout
                | Self::ToolTimeout
                | Self::CircuitOpen
                | Self::DownstreamFailed
                | Self::StreamFailed
        )
    }

    pub fn interface_kind(&self) -> InterfaceErrorKind {
        match self {
            Self::ValidationFailed => InterfaceErrorKind::BadRequest,
            Self::CostCapExceeded | Self::DailyBudgetExceeded => {
                InterfaceErrorKind::PaymentRequired
            }
            Self::TotalTimeout | Self::LlmTimeout | Self::ToolTimeout => {
                InterfaceErrorKind::GatewayTimeout
            }
            Self::CircuitOpen => InterfaceErrorKind::ServiceUnavailable,
            Self::DownstreamFailed => InterfaceErrorKind::BadGateway,
            Self::TimeGuardNotRegistered | Self::StreamFailed | Self::InternalError => {
                InterfaceErrorKind::Internal
            }
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, Error, PartialEq)]
pub enum ApplicationError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Cost(#[from] CostGuardError),
    #[error(transparent)]
    Time(#[from] TimeGuardError),
    #[error("circuit breaker open for `{target}`")]
    CircuitOpen { target: String },
    #[error("downstream `{target}` failed after {attempts} attempt(s): {message}")]
    Downstream { target: String, attempts: u32, message: String },
    #[error("configuration failure: {0}")]
    Configuration(String),
}

impl ApplicationError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Validation(_) => ErrorCode::ValidationFailed,
            Self::Cost(error) => error.code(),
            Self::Time(error) => error.code(),
            Self::CircuitOpen { .. } => ErrorCode::CircuitOpen,
            Self::Downstream { .. } => ErrorCode::DownstreamFailed,
            Self::Configuration(_) => ErrorCode::InternalError,
        }
    }

    pub fn details(&self) -> Option<Value> {
        match self {
            Self::Validation(error) => Some(serde_json::json!({ "issues": error.issues })),
            Self::Cost(error) => serde_json::to_value(error.context()).ok(),
            Self::CircuitOpen { target } => Some(serde_json::json!({ "target": target })),
            Self::Downstream { target, attempts, .. } => {
                Some(serde_json::json!({ "target": target, "attempts": attempts }))
            }
            Self::Time(_) | Self::Configuration(_) => None,
        }
    }

    pub fn into_interface(self, correlation_id: impl Into<String>) -> InterfaceError {
        let code = self.code();
        InterfaceError {
            kind: code.interface_kind(),
            code,
            message: self.to_string(),
            details: self.details(),
            correlation_id: correlation_id.into(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InterfaceErrorKind {
    BadRequest,
    PaymentRequired,
    ServiceUnavailable,
    GatewayTimeout,
    BadGateway,
    Internal,
}

impl InterfaceErrorKind {
    pub fn status_code(&self) -> u16 {
        match self {
            Self::BadRequest => 400,
            Self::PaymentRequired => 402,
            Self::ServiceUnavailable => 503,
            Self::GatewayTimeout => 504,
            Self::BadGateway => 502,
            Self::Internal => 500,
        }
    }

    pub fn user_message(&self) -> &'static str {
        match self {
            Self::BadRequest => "The request could not be processed. Check inputs and try again.",
            Self::PaymentRequired => "The request exceeds its cost allowance.",
            Self::ServiceUnavailable => {
                "The downstream service is temporarily unavailable. Please retry shortly."
            }
            Self::GatewayTimeout => "The request ran out of time.",
            Self::BadGateway => "The downstream service failed to complete the action.",
            Self::Internal => "An unexpected internal error occurred.",
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq)]
#[error("{code}: {message}")]
pub struct InterfaceError {
    pub kind: InterfaceErrorKind,
    pub code: ErrorCode,
    pub message: String,
    pub details: Option<Value>,
    pub correlation_id: String,
}

/// JSON body returned to callers for rejected requests.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GuardErrorPayload {
    pub error: ErrorCode,
    pub message: String,
    pub retryable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
    pub correlation_id: String,
}

impl InterfaceError {
    pub fn status_code(&self) -> u16 {
        self.kind.status_code()
    }

    pub fn payload(&self) -> GuardErrorPayload {
        GuardErrorPayload {
            error: self.code,
            message: self.message.clone(),
            retryable: self.code.retryable(),
            details: self.details.clone(),
            correlation_id: self.correlation_id.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::domain::request::ValidationError;
    use crate::errors::{ApplicationError, ErrorCode, InterfaceErrorKind};
    use crate::guards::time::{Phase, TimeGuardError};

    #[test]
    fn validation_error_maps_to_bad_request() {
        let interface =
            ApplicationError::from(ValidationError { issues: vec!["userId is required".into()] })
                .into_interface("req-1");

        assert_eq!(interface.kind, InterfaceErrorKind::BadRequest);
        assert_eq!(interface.status_code(), 400);
        assert_eq!(interface.correlation_id, "req-1");
        assert_eq!(
            interface.kind.user_message(),
            "The request could not be processed. Check inputs and try again."
        );
    }

    #[test]
    fn circuit_open_maps_to_service_unavailable_and_is_retryable() {
        let interface = ApplicationError::CircuitOpen { target: "search".to_owned() }
            .into_interface("req-2");

        assert_eq!(interface.status_code(), 503);
        let payload = interface.payload();
        assert_eq!(payload.error, ErrorCode::CircuitOpen);
        assert!(payload.retryable);
        assert_eq!(payload.details.as_ref().map(|d| d["target"].clone()), Some("search".into()));
    }

    #[test]
    fn timeouts_map_to_gateway_timeout_with_phase_code() {
        let interface = ApplicationError::from(TimeGuardError::PhaseExceeded {
            phase: Phase::Tool,
            overrun_ms: 12,
        })
        .into_interface("req-3");

        assert_eq!(interface.code, ErrorCode::ToolTimeout);
        assert_eq!(interface.status_code(), 504);
    }

    #[test]
    fn payload_serializes_code_as_wire_string() {
        let payload = ApplicationError::Configuration("missing base url".to_owned())
            .into_interface("req-4")
            .payload();
        let json = serde_json::to_value(&payload).expect("payload serializes");

        assert_eq!(json["error"], "INTERNAL_ERROR");
        assert_eq!(json["correlationId"], "req-4");
        assert_eq!(json["retryable"], false);
        assert!(json.get("details").is_none());
    }
}
