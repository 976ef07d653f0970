use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use neura_actions::{
    ActionSet, BreakerConfig, CircuitBreaker, FinanceGenerator, ModelGenerator, OutboundRequest,
    RetryPolicy, SearchGenerator, Transport, TransportError, TransportResponse, WebhookGenerator,
};
use neura_core::domain::request::{Limits, RequestEnvelope, ENVELOPE_VERSION};
use neura_core::domain::response::ModelTier;
use neura_core::{
    CostGuard, IdempotencyCache, ManualClock, ModelPrice, PriceTable, ResponseEnvelope, TimeGuard,
};
use serde_json::Value;
use tokio::sync::Mutex;

use crate::gateway::Gateway;

#[derive(Default)]
pub struct ScriptedTransport {
    state: Mutex<ScriptedState>,
    /// Moves the manual clock forward on every call to simulate slow targets.
    latency: Option<(ManualClock, i64)>,
}

#[derive(Default)]
struct ScriptedState {
    responses: VecDeque<Result<Value, TransportError>>,
    requests: Vec<OutboundRequest>,
}

impl ScriptedTransport {
    pub fn with_script(responses: Vec<Result<Value, TransportError>>) -> Self {
        Self {
            state: Mutex::new(ScriptedState { responses: responses.into(), requests: Vec::new() }),
            latency: None,
        }
    }

    pub fn with_latency(mut self, clock: &ManualClock, millis: i64) -> Self {
        self.latency = Some((clock.clone(), millis));
        self
    }

    pub async fn calls(&self) -> usize {
        self.state.lock().await.requests.len()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&self, request: OutboundRequest) -> Result<TransportResponse, TransportError> {
        if let Some((clock, millis)) = &self.latency {
            clock.advance_ms(*millis);
        }
        let mut state = self.state.lock().await;
        state.requests.push(request);
        state
            .responses
            .pop_front()
            .unwrap_or(Ok(Value::Null))
            .map(|body| TransportResponse { status: 200, body })
    }
}

pub fn unavailable() -> TransportError {
    TransportError::Status { status: 503, body: "busy".to_owned() }
}

/// Priced so that 4000 completion tokens cost exactly 0.40 EUR.
pub fn flat_prices() -> PriceTable {
    PriceTable::default().with_price(
        "flat-model",
        ModelPrice {
            prompt_per_million: 0.0,
            completion_per_million: 100.0,
            tier: ModelTier::Economy,
        },
    )
}

pub fn request(agent_id: &str, idempotency_key: &str, message: &str) -> RequestEnvelope {
    RequestEnvelope {
        version: ENVELOPE_VERSION.to_string(),
        agent_id: agent_id.to_string(),
        department_id: None,
        user_id: "user-1".to_owned(),
        message: message.to_string(),
        metadata: None,
        limits: Limits { cost_cap_eur: 1.0, ..Limits::default() },
        idempotency_key: idempotency_key.to_string(),
        resume_token: None,
        mode: None,
        allow_tools: None,
        preferred_route: None,
    }
}

/// Gateway whose generators all talk to `transport`, one attempt each,
/// with breakers that open after two failures.
pub fn gateway(transport: Arc<ScriptedTransport>, clock: &ManualClock) -> Gateway {
    let clock_handle: Arc<ManualClock> = Arc::new(clock.clone());
    let breaker = |target: &str| {
        CircuitBreaker::new(
            target,
            BreakerConfig { threshold: 2, cooldown: Duration::from_secs(60) },
            clock_handle.clone(),
        )
    };
    let policy = RetryPolicy {
        max_attempts: 1,
        backoff: Duration::ZERO,
        jitter: Duration::ZERO,
        attempt_timeout: Duration::from_secs(5),
    };

    let actions = ActionSet {
        webhook: Some(WebhookGenerator::new(
            transport.clone(),
            "https://hook.example",
            breaker("webhook"),
            policy,
        )),
        search: Some(SearchGenerator::new(
            transport.clone(),
            "https://search.example",
            6,
            breaker("search"),
            policy,
            chrono::Duration::seconds(300),
            clock_handle.clone(),
        )),
        finance: Some(FinanceGenerator::new(
            transport.clone(),
            "https://quotes.example",
            breaker("finance"),
            policy,
            chrono::Duration::seconds(60),
            clock_handle.clone(),
        )),
        model: Some(ModelGenerator::new(
            transport,
            "https://llm.example/v1",
            flat_prices(),
            breaker("model"),
            policy,
        )),
    };

    Gateway::new(
        CostGuard::new(flat_prices(), clock_handle.clone()).with_daily_budget("budget-agent", 1.0),
        TimeGuard::new(clock_handle.clone()),
        IdempotencyCache::<ResponseEnvelope>::new(
            chrono::Duration::hours(24),
            100,
            clock_handle.clone(),
        ),
        actions,
        Arc::default(),
        clock_handle,
        "flat-model",
    )
}
