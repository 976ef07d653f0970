//! Request pipeline: guards around one downstream action, then response assembly.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use neura_actions::{ActionError, ActionSet, BreakerSnapshot, Transport};
use neura_core::domain::response::ModelInfo;
use neura_core::errors::InterfaceError;
use neura_core::guards::GuardContext;
use neura_core::{
    resume, ApplicationError, Clock, CostGuard, ErrorCode, GatewayConfig, IdempotencyCache,
    MetricsRegistry, Phase, PriceTable, RequestEnvelope, ResponseBuilder, ResponseEnvelope, Reuse,
    TimeGuard, ToolKind,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::sse::{SseChannel, StreamError};

/// Counter bumped each time a daily budget turns a request away.
pub const BUDGET_HIT_COUNTER: &str = "cost.budget_hit";

/// Downstream target already resolved by the caller.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum ActionTarget {
    Model {
        #[serde(default, rename = "modelId", skip_serializing_if = "Option::is_none")]
        model_id: Option<String>,
    },
    Webhook {
        #[serde(rename = "webhookId")]
        webhook_id: String,
        #[serde(default)]
        payload: Value,
    },
    Search {
        query: String,
        #[serde(default)]
        filters: BTreeMap<String, String>,
    },
    Finance {
        symbol: String,
    },
}

impl ActionTarget {
    pub fn kind(&self) -> ToolKind {
        match self {
            Self::Model { .. } => ToolKind::Model,
            Self::Webhook { .. } => ToolKind::Webhook,
            Self::Search { .. } => ToolKind::Search,
            Self::Finance { .. } => ToolKind::Finance,
        }
    }

    /// Deadline that bounds the downstream call.
    pub fn phase(&self) -> Phase {
        match self {
            Self::Model { .. } => Phase::Llm,
            _ => Phase::Tool,
        }
    }
}

/// A request that passed validation and the cost guard.
#[derive(Clone, Debug)]
pub struct Admission {
    pub request: RequestEnvelope,
    pub target: ActionTarget,
    pub correlation_id: String,
    pub guard: GuardContext,
    pub started_at: DateTime<Utc>,
}

/// Failure after admission. The envelope carries the diagnostics gathered so
/// far, including the per-attempt trail of the failed action.
#[derive(Clone, Debug)]
pub struct ExecutionFailure {
    pub error: InterfaceError,
    pub envelope: ResponseEnvelope,
}

pub struct Gateway {
    cost: CostGuard,
    time: TimeGuard,
    idempotency: IdempotencyCache<ResponseEnvelope>,
    actions: ActionSet,
    metrics: Arc<MetricsRegistry>,
    clock: Arc<dyn Clock>,
    default_model: String,
}

impl Gateway {
    pub fn new(
        cost: CostGuard,
        time: TimeGuard,
        idempotency: IdempotencyCache<ResponseEnvelope>,
        actions: ActionSet,
        metrics: Arc<MetricsRegistry>,
        clock: Arc<dyn Clock>,
        default_model: impl Into<String>,
    ) -> Self {
        Self {
            cost,
            time,
            idempotency,
            actions: actions.with_metrics(metrics.clone()),
            metrics,
            clock,
            default_model: default_model.into(),
        }
    }

    pub fn from_config(
        config: &GatewayConfig,
        transport: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let prices = PriceTable::default();
        let metrics = Arc::new(MetricsRegistry::new());
        let budget_hits = metrics.clone();
        let cost = CostGuard::new(prices.clone(), clock.clone())
            .with_daily_budgets(config.guards.daily_budgets.clone())
            .on_budget_hit(Arc::new(move |_agent_id: &str, _context: &GuardContext| {
                budget_hits.increment(BUDGET_HIT_COUNTER);
            }));
        let ttl_secs = config.guards.idempotency_ttl_secs.min(i64::MAX as u64) as i64;
        let idempotency = IdempotencyCache::new(
            chrono::Duration::seconds(ttl_secs),
            config.guards.idempotency_max_entries,
            clock.clone(),
        );
        let actions = ActionSet::from_config(config, prices, transport, clock.clone());
        Self::new(
            cost,
            TimeGuard::new(clock.clone()),
            idempotency,
            actions,
            metrics,
            clock,
            config.guards.default_model.clone(),
        )
    }

    pub fn breakers(&self) -> Vec<BreakerSnapshot> {
        self.actions.breakers()
    }

    pub fn metrics(&self) -> &MetricsRegistry {
        &self.metrics
    }

    pub fn cost_guard(&self) -> &CostGuard {
        &self.cost
    }

    /// Validates the envelope and enforces the cost caps. Nothing downstream
    /// runs for a rejected request.
    pub fn admit(
        &self,
        request: RequestEnvelope,
        target: ActionTarget,
    ) -> Result<Admission, InterfaceError> {
        let correlation_id = uuid::Uuid::new_v4().to_string();
        let reject = |error: ApplicationError| {
            warn!(
                event_name = "gateway.request.rejected",
                correlation_id = %correlation_id,
                agent_id = %request.agent_id,
                error_code = error.code().as_str(),
                error = %error,
                "request rejected before execution"
            );
            error.into_interface(correlation_id.clone())
        };

        request.validate().map_err(|error| reject(error.into()))?;
        let model_id = self.model_for(&target);
        let guard = self
            .cost
            .assert_within_caps(&request, &model_id)
            .map_err(|error| reject(error.into()))?;

        info!(
            event_name = "gateway.request.admitted",
            correlation_id = %correlation_id,
            agent_id = %request.agent_id,
            target = ?target.kind(),
            estimated_cost_eur = guard.estimated_cost_eur,
            "request admitted"
        );
        Ok(Admission { request, target, correlation_id, guard, started_at: self.clock.now() })
    }

    /// Runs an admitted request once per idempotency key. Failures are not
    /// cached, so a retry with the same key runs again.
    pub async fn execute(
        &self,
        admission: Admission,
    ) -> Result<Reuse<ResponseEnvelope>, ExecutionFailure> {
        let correlation_id = admission.correlation_id.clone();
        let key = admission.request.idempotency_key.clone();
        self.time.init(&correlation_id, &admission.request.limits.timeout_ms);

        let outcome = self.idempotency.try_get_or_set(&key, || self.run(&admission)).await;
        self.time.complete(&correlation_id);

        if let Ok(reuse) = &outcome {
            info!(
                event_name = "gateway.request.completed",
                correlation_id = %correlation_id,
                reused = reuse.reused,
                "request completed"
            );
        }
        outcome
    }

    /// Relays an admitted request over `channel` as `start`, `token`,
    /// `usage` and `done` events, or a single `error` event.
    pub async fn stream(
        &self,
        admission: Admission,
        channel: SseChannel,
    ) -> Result<(), StreamError> {
        let correlation_id = admission.correlation_id.clone();
        let start = json!({
            "correlationId": correlation_id,
            "agentId": admission.request.agent_id,
            "estimatedCostEUR": admission.guard.estimated_cost_eur,
        });
        channel.start(Some(start)).await?;

        let relayed = match self.execute(admission).await {
            Ok(Reuse { reused, value }) => self.relay_success(&channel, reused, value).await,
            Err(failure) => {
                let code = failure.error.code.as_str();
                channel.error(Some(code), &failure.error.message).await
            }
        };
        if let Err(error) = &relayed {
            warn!(
                event_name = "stream.aborted",
                correlation_id = %correlation_id,
                error_code = ErrorCode::StreamFailed.as_str(),
                error = %error,
                "stream ended early"
            );
            channel.close();
        }
        relayed
    }

    async fn relay_success(
        &self,
        channel: &SseChannel,
        reused: bool,
        envelope: ResponseEnvelope,
    ) -> Result<(), StreamError> {
        let output = envelope.output.clone().unwrap_or_default();
        for chunk in output.split_inclusive(' ') {
            channel.token(chunk).await?;
        }
        if let Some(usage) = &envelope.usage {
            channel.usage(usage).await?;
        }
        let resume_token = channel
            .resume_token(Some(json!({ "correlationId": envelope.correlation_id })))
            .await;
        channel
            .end(Some(json!({
                "status": envelope.status,
                "correlationId": envelope.correlation_id,
                "resumeToken": resume_token,
                "reused": reused,
            })))
            .await
    }

    fn model_for(&self, target: &ActionTarget) -> String {
        match target {
            ActionTarget::Model { model_id: Some(model_id) } if !model_id.trim().is_empty() => {
                model_id.clone()
            }
            _ => self.default_model.clone(),
        }
    }

    async fn run(&self, admission: &Admission) -> Result<ResponseEnvelope, ExecutionFailure> {
        let Admission { request, target, correlation_id, guard, started_at } = admission;
        let mut builder = ResponseBuilder::new(request, correlation_id.as_str(), *started_at);
        builder.checkpoint("guards.admitted");
        if !self.cost.prices().is_known(&guard.model_id) {
            builder.warn(format!(
                "model `{}` has no price entry; estimated with fallback pricing",
                guard.model_id
            ));
        }
        builder.checksum(resume::hash_context(&json!({
            "agentId": request.agent_id,
            "message": request.message,
            "target": target,
        })));

        match self.dispatch(request, target, correlation_id, &guard.model_id, &mut builder).await {
            Ok(output) => {
                let resume_payload = json!({
                    "correlationId": correlation_id,
                    "idempotencyKey": request.idempotency_key,
                });
                builder.resume_token(resume::encode("invoke", resume_payload));
                Ok(builder.success(output, self.clock.now()))
            }
            Err(error) => {
                warn!(
                    event_name = "gateway.request.failed",
                    correlation_id = %correlation_id,
                    agent_id = %request.agent_id,
                    error_code = error.code().as_str(),
                    error = %error,
                    "request failed during execution"
                );
                let envelope = builder.failure(error.code(), error.to_string(), self.clock.now());
                let error = error.into_interface(correlation_id.as_str());
                Err(ExecutionFailure { error, envelope })
            }
        }
    }

    async fn dispatch(
        &self,
        request: &RequestEnvelope,
        target: &ActionTarget,
        correlation_id: &str,
        model_id: &str,
        builder: &mut ResponseBuilder,
    ) -> Result<String, ApplicationError> {
        self.time.assert_within_phase(correlation_id, Phase::Total)?;
        builder.checkpoint("phase.total");

        let output = match target {
            ActionTarget::Model { model_id: requested } => {
                let generator =
                    self.actions.model.as_ref().ok_or_else(|| not_configured("model"))?;
                let log = generator
                    .complete(model_id, &request.message, request.limits.max_completion_tokens)
                    .await;
                builder.tool(log.summary(model_id, ToolKind::Model));
                let reply = log.into_result()?;
                self.cost.register_actual_spend(&request.agent_id, reply.usage.cost_eur);
                builder.usage(reply.usage.clone()).model(ModelInfo {
                    id: reply.model_id.clone(),
                    tier: reply.tier,
                    reason: model_reason(requested.as_deref()).to_string(),
                    complexity: None,
                    trigger: None,
                });
                reply.content
            }
            ActionTarget::Webhook { webhook_id, payload } => {
                let generator =
                    self.actions.webhook.as_ref().ok_or_else(|| not_configured("webhook"))?;
                let log = generator
                    .execute(webhook_id, payload.clone(), Some(&request.idempotency_key))
                    .await;
                builder.tool(log.summary(webhook_id.as_str(), ToolKind::Webhook));
                log.into_result()?.to_string()
            }
            ActionTarget::Search { query, filters } => {
                let generator =
                    self.actions.search.as_ref().ok_or_else(|| not_configured("search"))?;
                let log = generator.run(query, filters).await;
                builder.tool(log.summary("search", ToolKind::Search));
                to_output(&log.into_result()?)
            }
            ActionTarget::Finance { symbol } => {
                let generator =
                    self.actions.finance.as_ref().ok_or_else(|| not_configured("finance"))?;
                let log = generator.get_snapshot(symbol).await;
                builder.tool(log.summary(symbol.as_str(), ToolKind::Finance));
                to_output(&log.into_result()?)
            }
        };

        let phase = target.phase();
        self.time.assert_within_phase(correlation_id, phase)?;
        builder.checkpoint(format!("phase.{phase}"));
        self.time.assert_within_phase(correlation_id, Phase::Total)?;
        Ok(output)
    }
}

fn not_configured(target: &str) -> ApplicationError {
    ActionError::NotConfigured {
        target: target.to_owned(),
        reason: format!("{target}.base_url is not set"),
    }
    .into()
}

fn model_reason(requested: Option<&str>) -> &'static str {
    match requested {
        Some(model_id) if !model_id.trim().is_empty() => "requested by caller",
        _ => "gateway default model",
    }
}

fn to_output<T: Serialize>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_default()
}
