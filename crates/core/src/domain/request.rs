use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub const ENVELOPE_VERSION: &str = "1.0";
pub const MIN_IDEMPOTENCY_KEY_LEN: usize = 8;
pub const MIN_PHASE_TIMEOUT_MS: u64 = 1_000;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestEnvelope {
    pub version: String,
    pub agent_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub department_id: Option<String>,
    pub user_id: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    pub limits: Limits,
    pub idempotency_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<Mode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_tools: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_route: Option<PreferredRoute>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Limits {
    pub max_prompt_tokens: u64,
    pub max_completion_tokens: u64,
    #[serde(rename = "costCapEUR")]
    pub cost_cap_eur: f64,
    pub timeout_ms: PhaseTimeouts,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseTimeouts {
    pub total: u64,
    pub llm: u64,
    pub tool: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    Invoke,
    Stream,
    Task,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PreferredRoute {
    Azure,
    Local,
    Auto,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_prompt_tokens: 6_000,
            max_completion_tokens: 4_000,
            cost_cap_eur: 0.05,
            timeout_ms: PhaseTimeouts { total: 180_000, llm: 120_000, tool: 45_000 },
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("request validation failed: {}", issues.join("; "))]
pub struct ValidationError {
    pub issues: Vec<String>,
}

impl RequestEnvelope {
    pub fn is_streaming(&self) -> bool {
        matches!(self.mode, Some(Mode::Stream))
    }

    /// Checks every envelope invariant and reports all violations at once.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let mut issues = Vec::new();

        if self.version != ENVELOPE_VERSION {
            issues.push(format!("version must be `{ENVELOPE_VERSION}`"));
        }
        if self.agent_id.trim().chars().count() < 3 {
            issues.push("agentId must be at least 3 characters".to_owned());
        }
        if self.user_id.trim().is_empty() {
            issues.push("userId is required".to_owned());
        }
        if self.message.is_empty() {
            issues.push("message is required".to_owned());
        }
        if self.idempotency_key.chars().count() < MIN_IDEMPOTENCY_KEY_LEN {
            issues.push(format!(
                "idempotencyKey must be at least {MIN_IDEMPOTENCY_KEY_LEN} characters"
            ));
        }
        if let Some(token) = &self.resume_token {
            if token.chars().count() < 8 {
                issues.push("resumeToken must be at least 8 characters".to_owned());
            }
        }
        issues.extend(self.limits.violations());

        if issues.is_empty() {
            Ok(())
        } else {
            Err(ValidationError { issues })
        }
    }
}

impl Limits {
    fn violations(&self) -> Vec<String> {
        let mut issues = Vec::new();
        if self.max_prompt_tokens == 0 {
            issues.push("limits.maxPromptTokens must be at least 1".to_owned());
        }
        if self.max_completion_tokens == 0 {
            issues.push("limits.maxCompletionTokens must be at least 1".to_owned());
        }
        if !self.cost_cap_eur.is_finite() || self.cost_cap_eur < 0.0 {
            issues.push("limits.costCapEUR must be a finite number >= 0".to_owned());
        }
        for (phase, value) in [
            ("total", self.timeout_ms.total),
            ("llm", self.timeout_ms.llm),
            ("tool", self.timeout_ms.tool),
        ] {
            if value < MIN_PHASE_TIMEOUT_MS {
                issues.push(format!(
                    "limits.timeoutMs.{phase} must be at least {MIN_PHASE_TIMEOUT_MS}"
                ));
            }
        }
        issues
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::{Limits, RequestEnvelope, ENVELOPE_VERSION};

    pub fn request(agent_id: &str, message: &str) -> RequestEnvelope {
        RequestEnvelope {
            version: ENVELOPE_VERSION.to_string(),
            agent_id: agent_id.to_string(),
            department_id: None,
            user_id: "user-1".to_owned(),
            message: message.to_string(),
            metadata: None,
            limits: Limits::default(),
            idempotency_key: "idem-key-0001".to_owned(),
            resume_token: None,
            mode: None,
            allow_tools: None,
            preferred_route: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::fixtures::request;
    use super::{Mode, RequestEnvelope};

    #[test]
    fn default_request_is_valid() {
        assert_eq!(request("cfo-agent", "hello").validate(), Ok(()));
    }

    #[test]
    fn reports_every_violation() {
        let mut bad = request("x", "");
        bad.idempotency_key = "short".to_owned();
        bad.limits.cost_cap_eur = -1.0;
        bad.limits.timeout_ms.tool = 999;

        let error = bad.validate().expect_err("request should be rejected");
        assert_eq!(error.issues.len(), 5, "issues: {:?}", error.issues);
        assert!(error.to_string().contains("idempotencyKey must be at least 8"));
        assert!(error.to_string().contains("limits.timeoutMs.tool"));
    }

    #[test]
    fn nan_cost_cap_is_rejected() {
        let mut bad = request("cfo-agent", "hello");
        bad.limits.cost_cap_eur = f64::NAN;
        assert!(bad.validate().is_err());
    }

    #[test]
    fn deserializes_wire_field_names() {
        let envelope: RequestEnvelope = serde_json::from_value(json!({
            "version": "1.0",
            "agentId": "cfo-agent",
            "userId": "u-1",
            "message": "quarterly outlook",
            "limits": {
                "maxPromptTokens": 100,
                "maxCompletionTokens": 50,
                "costCapEUR": 0.01,
                "timeoutMs": {"total": 5000, "llm": 4000, "tool": 2000}
            },
            "idempotencyKey": "abcdefgh",
            "mode": "stream"
        }))
        .expect("envelope should deserialize");

        assert_eq!(envelope.limits.cost_cap_eur, 0.01);
        assert_eq!(envelope.mode, Some(Mode::Stream));
        assert!(envelope.is_streaming());
        assert_eq!(envelope.validate(), Ok(()));
    }
}
