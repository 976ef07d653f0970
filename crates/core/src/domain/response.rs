use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::request::{RequestEnvelope, ENVELOPE_VERSION};
use crate::errors::ErrorCode;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    Success,
    Error,
    HitlRequired,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseEnvelope {
    pub version: String,
    pub agent_id: String,
    pub user_id: String,
    pub correlation_id: String,
    pub status: ResponseStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<ModelInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diagnostics: Option<Diagnostics>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    #[serde(rename = "costEUR")]
    pub cost_eur: f64,
}

impl Usage {
    pub fn new(prompt_tokens: u64, completion_tokens: u64, cost_eur: f64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
            cost_eur,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ModelTier {
    Premium,
    Economy,
    DeepReasoning,
    DeepReasoningLite,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelInfo {
    pub id: String,
    pub tier: ModelTier,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub complexity: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half-open",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolKind {
    Webhook,
    Search,
    Finance,
    Model,
}

/// One downstream call attempt, tagged by outcome.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttemptRecord {
    pub attempt: u32,
    pub latency_ms: u64,
    pub breaker_state: BreakerState,
    #[serde(flatten)]
    pub status: AttemptStatus,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AttemptStatus {
    Success,
    Error { error: String },
}

impl AttemptRecord {
    pub fn is_success(&self) -> bool {
        matches!(self.status, AttemptStatus::Success)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolExecutionSummary {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ToolKind,
    pub success: bool,
    pub latency_ms: u64,
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub breaker_state: Option<BreakerState>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub cache_hit: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub trail: Vec<AttemptRecord>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Diagnostics {
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub checkpoints: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolExecutionSummary>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
    pub retryable: bool,
}

/// Accumulates guard and generator metadata for one request.
///
/// The builder is consumed by [`ResponseBuilder::success`] or
/// [`ResponseBuilder::failure`], so an envelope is finalized exactly once.
#[derive(Clone, Debug)]
pub struct ResponseBuilder {
    agent_id: String,
    user_id: String,
    correlation_id: String,
    started_at: DateTime<Utc>,
    checkpoints: Vec<String>,
    warnings: Vec<String>,
    tools: Vec<ToolExecutionSummary>,
    usage: Option<Usage>,
    model: Option<ModelInfo>,
    resume_token: Option<String>,
    checksum: Option<String>,
}

impl ResponseBuilder {
    pub fn new(
        request: &RequestEnvelope,
        correlation_id: impl Into<String>,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            agent_id: request.agent_id.clone(),
            user_id: request.user_id.clone(),
            correlation_id: correlation_id.into(),
            started_at,
            checkpoints: Vec::new(),
            warnings: Vec::new(),
            tools: Vec::new(),
            usage: None,
            model: None,
            resume_token: None,
            checksum: None,
        }
    }

    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    pub fn checkpoint(&mut self, name: impl Into<String>) -> &mut Self {
        self.checkpoints.push(name.into());
        self
    }

    pub fn warn(&mut self, warning: impl Into<String>) -> &mut Self {
        self.warnings.push(warning.into());
        self
    }

    pub fn tool(&mut self, summary: ToolExecutionSummary) -> &mut Self {
        self.tools.push(summary);
        self
    }

    pub fn usage(&mut self, usage: Usage) -> &mut Self {
        self.usage = Some(usage);
        self
    }

    pub fn model(&mut self, model: ModelInfo) -> &mut Self {
        self.model = Some(model);
        self
    }

    pub fn resume_token(&mut self, token: impl Into<String>) -> &mut Self {
        self.resume_token = Some(token.into());
        self
    }

    pub fn checksum(&mut self, checksum: impl Into<String>) -> &mut Self {
        self.checksum = Some(checksum.into());
        self
    }

    pub fn success(
        self,
        output: impl Into<String>,
        completed_at: DateTime<Utc>,
    ) -> ResponseEnvelope {
        let mut envelope = self.finish(ResponseStatus::Success, completed_at);
        envelope.output = Some(output.into());
        envelope
    }

    pub fn hitl_required(
        self,
        reason: impl Into<String>,
        completed_at: DateTime<Utc>,
    ) -> ResponseEnvelope {
        let mut envelope = self.finish(ResponseStatus::HitlRequired, completed_at);
        envelope.output = Some(reason.into());
        envelope.usage = None;
        envelope
    }

    /// `usage` and `model` are dropped: they only accompany successful calls.
    pub fn failure(
        self,
        code: ErrorCode,
        message: impl Into<String>,
        completed_at: DateTime<Utc>,
    ) -> ResponseEnvelope {
        let mut envelope = self.finish(ResponseStatus::Error, completed_at);
        envelope.usage = None;
        envelope.model = None;
        envelope.error = Some(ErrorBody {
            code: code.as_str().to_string(),
            message: message.into(),
            retryable: code.retryable(),
        });
        envelope
    }

    fn finish(self, status: ResponseStatus, completed_at: DateTime<Utc>) -> ResponseEnvelope {
        let duration_ms = (completed_at - self.started_at).num_milliseconds().max(0) as u64;
        ResponseEnvelope {
            version: ENVELOPE_VERSION.to_string(),
            agent_id: self.agent_id,
            user_id: self.user_id,
            correlation_id: self.correlation_id,
            status,
            output: None,
            resume_token: self.resume_token,
            usage: self.usage,
            model: self.model,
            diagnostics: Some(Diagnostics {
                started_at: self.started_at,
                completed_at: Some(completed_at),
                duration_ms: Some(duration_ms),
                checkpoints: self.checkpoints,
                warnings: self.warnings,
                checksum: self.checksum,
                tools: self.tools,
            }),
            error: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};

    use super::{
        AttemptRecord, AttemptStatus, BreakerState, ModelInfo, ModelTier, ResponseBuilder,
        ResponseStatus, Usage,
    };
    use crate::domain::request::fixtures::request;
    use crate::errors::ErrorCode;

    #[test]
    fn success_envelope_carries_usage_and_duration() {
        let started = Utc::now();
        let mut builder = ResponseBuilder::new(&request("cfo-agent", "hi"), "corr-1", started);
        builder.checkpoint("cost_guard").usage(Usage::new(10, 5, 0.001)).model(ModelInfo {
            id: "gpt-4o-mini".to_owned(),
            tier: ModelTier::Economy,
            reason: "requested".to_owned(),
            complexity: None,
            trigger: None,
        });

        let envelope = builder.success("done", started + Duration::milliseconds(250));
        let json = serde_json::to_value(&envelope).expect("serializes");

        assert_eq!(envelope.status, ResponseStatus::Success);
        assert_eq!(json["usage"]["totalTokens"], 15);
        assert_eq!(json["usage"]["costEUR"], 0.001);
        assert_eq!(json["model"]["tier"], "economy");
        assert_eq!(json["diagnostics"]["durationMs"], 250);
        assert_eq!(json["diagnostics"]["checkpoints"][0], "cost_guard");
        assert!(json.get("error").is_none());
    }

    #[test]
    fn failure_envelope_drops_usage_and_sets_error() {
        let started = Utc::now();
        let mut builder = ResponseBuilder::new(&request("cfo-agent", "hi"), "corr-2", started);
        builder.usage(Usage::new(1, 1, 0.0));

        let envelope = builder.failure(ErrorCode::DownstreamFailed, "boom", started);

        assert_eq!(envelope.status, ResponseStatus::Error);
        assert!(envelope.usage.is_none());
        let error = envelope.error.expect("error body");
        assert_eq!(error.code, "DOWNSTREAM_FAILED");
        assert!(error.retryable);
    }

    #[test]
    fn attempt_record_serializes_tagged_status() {
        let record = AttemptRecord {
            attempt: 2,
            latency_ms: 40,
            breaker_state: BreakerState::Open,
            status: AttemptStatus::Error { error: "HTTP 502".to_owned() },
        };
        let json = serde_json::to_value(&record).expect("serializes");

        assert_eq!(json["status"], "error");
        assert_eq!(json["error"], "HTTP 502");
        assert_eq!(json["breakerState"], "open");
        assert_eq!(json["latencyMs"], 40);
    }
}
