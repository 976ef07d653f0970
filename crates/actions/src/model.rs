//! OpenAI-compatible chat completion client.

use std::sync::Arc;

use neura_core::config::ModelConfig;
use neura_core::metrics::MetricsRegistry;
use neura_core::domain::response::ModelTier;
use neura_core::{naive_token_estimate, Clock, PriceTable, Usage};
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::info;

use crate::breaker::{BreakerSnapshot, CircuitBreaker};
use crate::error::ActionError;
use crate::retry::{run_with_retry, AttemptLog, RetryPolicy};
use crate::transport::{OutboundRequest, Transport, TransportError};

pub const TARGET: &str = "model";

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelReply {
    pub model_id: String,
    pub content: String,
    pub tier: ModelTier,
    pub usage: Usage,
}

pub struct ModelGenerator {
    transport: Arc<dyn Transport>,
    base_url: String,
    api_key: Option<SecretString>,
    prices: PriceTable,
    breaker: CircuitBreaker,
    policy: RetryPolicy,
    metrics: Arc<MetricsRegistry>,
}

impl ModelGenerator {
    pub fn new(
        transport: Arc<dyn Transport>,
        base_url: impl Into<String>,
        prices: PriceTable,
        breaker: CircuitBreaker,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            transport,
            base_url: base_url.into(),
            api_key: None,
            prices,
            breaker,
            policy,
            metrics: Arc::default(),
        }
    }

    pub fn from_config(
        config: &ModelConfig,
        prices: PriceTable,
        transport: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ActionError> {
        let base_url = config.base_url.clone().ok_or_else(|| ActionError::NotConfigured {
            target: TARGET.to_owned(),
            reason: "model.base_url is not set".to_owned(),
        })?;
        let breaker = CircuitBreaker::new(TARGET, (&config.downstream).into(), clock);
        let mut generator =
            Self::new(transport, base_url, prices, breaker, RetryPolicy::from(&config.downstream));
        generator.api_key = config.api_key.clone();
        Ok(generator)
    }

    pub fn with_api_key(mut self, api_key: SecretString) -> Self {
        self.api_key = Some(api_key);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsRegistry>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn breaker(&self) -> BreakerSnapshot {
        self.breaker.snapshot()
    }

    /// Sends a single-turn completion and prices the reply.
    ///
    /// Token counts come from the provider's `usage` block; when it is
    /// missing they are estimated from the prompt and the returned text.
    pub async fn complete(
        &self,
        model_id: &str,
        prompt: &str,
        max_completion_tokens: u64,
    ) -> AttemptLog<ModelReply> {
        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        let body = json!({
            "model": model_id,
            "messages": [{ "role": "user", "content": prompt }],
            "max_tokens": max_completion_tokens,
        });
        let mut request = OutboundRequest::post(url, body)
            .header("Content-Type", "application/json")
            .timeout(self.policy.attempt_timeout);
        if let Some(api_key) = &self.api_key {
            request =
                request.header("Authorization", format!("Bearer {}", api_key.expose_secret()));
        }

        info!(event_name = "action.model.complete", model_id, "requesting chat completion");

        run_with_retry(&self.breaker, &self.policy, &self.metrics, |_attempt| {
            let request = request.clone();
            async move {
                let response = self.transport.send(request).await?;
                self.parse_reply(model_id, prompt, &response.body)
            }
        })
        .await
    }

    fn parse_reply(
        &self,
        model_id: &str,
        prompt: &str,
        body: &Value,
    ) -> Result<ModelReply, TransportError> {
        let content = body
            .pointer("/choices/0/message/content")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                TransportError::Decode("completion has no `choices[0].message.content`".to_owned())
            })?
            .to_owned();

        let reported = |key: &str| body.get("usage").and_then(|usage| usage.get(key)?.as_u64());
        let prompt_tokens =
            reported("prompt_tokens").unwrap_or_else(|| naive_token_estimate(prompt));
        let completion_tokens =
            reported("completion_tokens").unwrap_or_else(|| naive_token_estimate(&content));

        let price = self.prices.price_for(model_id);
        Ok(ModelReply {
            model_id: body.get("model").and_then(Value::as_str).unwrap_or(model_id).to_owned(),
            content,
            tier: price.tier,
            usage: Usage::new(
                prompt_tokens,
                completion_tokens,
                price.cost_eur(prompt_tokens, completion_tokens),
            ),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use neura_core::domain::response::ModelTier;
    use neura_core::{ManualClock, PriceTable};
    use serde_json::json;

    use super::ModelGenerator;
    use crate::breaker::{BreakerConfig, CircuitBreaker};
    use crate::retry::RetryPolicy;
    use crate::transport::{HttpTransport, TransportError};

    fn generator() -> ModelGenerator {
        let breaker = CircuitBreaker::new(
            "model",
            BreakerConfig { threshold: 3, cooldown: std::time::Duration::from_secs(1) },
            Arc::new(ManualClock::default()),
        );
        ModelGenerator::new(
            Arc::new(HttpTransport::default()),
            "https://llm.example/v1",
            PriceTable::default(),
            breaker,
            RetryPolicy::default(),
        )
    }

    #[test]
    fn prices_reported_usage() {
        let reply = generator()
            .parse_reply(
                "gpt-4o-mini",
                "hello",
                &json!({
                    "choices": [{"message": {"content": "hi there"}}],
                    "usage": {"prompt_tokens": 1_000_000, "completion_tokens": 1_000_000}
                }),
            )
            .expect("reply parses");

        assert_eq!(reply.content, "hi there");
        assert_eq!(reply.tier, ModelTier::Economy);
        assert_eq!(reply.usage.total_tokens, 2_000_000);
        assert!((reply.usage.cost_eur - 0.70).abs() < 1e-9);
    }

    #[test]
    fn estimates_missing_usage() {
        let reply = generator()
            .parse_reply(
                "unknown-model",
                "one two three",
                &json!({"choices": [{"message": {"content": "four five"}}]}),
            )
            .expect("reply parses");

        assert_eq!(reply.usage.prompt_tokens, 3);
        assert_eq!(reply.usage.completion_tokens, 2);
        assert_eq!(reply.tier, ModelTier::Premium);
    }

    #[test]
    fn missing_content_is_a_decode_error() {
        let result = generator().parse_reply("gpt-4o", "hi", &json!({"choices": []}));
        assert!(matches!(result, Err(TransportError::Decode(_))));
    }
}
