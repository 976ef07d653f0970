//! Automation webhook runner.

use std::sync::Arc;

use neura_core::config::WebhookConfig;
use neura_core::metrics::MetricsRegistry;
use neura_core::signing::sign_payload;
use neura_core::Clock;
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;
use tracing::info;

use crate::breaker::{BreakerSnapshot, CircuitBreaker};
use crate::error::ActionError;
use crate::retry::{run_with_retry, AttemptLog, RetryPolicy};
use crate::transport::{OutboundRequest, Transport};

pub const TARGET: &str = "webhook";
pub const SIGNATURE_HEADER: &str = "X-Signature";
pub const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

pub struct WebhookGenerator {
    transport: Arc<dyn Transport>,
    base_url: String,
    api_key: Option<SecretString>,
    hmac_secret: Option<SecretString>,
    breaker: CircuitBreaker,
    policy: RetryPolicy,
    metrics: Arc<MetricsRegistry>,
}

impl WebhookGenerator {
    pub fn new(
        transport: Arc<dyn Transport>,
        base_url: impl Into<String>,
        breaker: CircuitBreaker,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            transport,
            base_url: base_url.into(),
            api_key: None,
            hmac_secret: None,
            breaker,
            policy,
            metrics: Arc::default(),
        }
    }

    pub fn from_config(
        config: &WebhookConfig,
        transport: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ActionError> {
        let base_url = config.base_url.clone().ok_or_else(|| ActionError::NotConfigured {
            target: TARGET.to_owned(),
            reason: "webhook.base_url is not set".to_owned(),
        })?;
        let breaker = CircuitBreaker::new(TARGET, (&config.downstream).into(), clock);
        let mut generator =
            Self::new(transport, base_url, breaker, RetryPolicy::from(&config.downstream));
        generator.api_key = config.api_key.clone();
        generator.hmac_secret = config.hmac_secret.clone();
        Ok(generator)
    }

    pub fn with_api_key(mut self, api_key: SecretString) -> Self {
        self.api_key = Some(api_key);
        self
    }

    pub fn with_hmac_secret(mut self, secret: SecretString) -> Self {
        self.hmac_secret = Some(secret);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsRegistry>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn breaker(&self) -> BreakerSnapshot {
        self.breaker.snapshot()
    }

    /// Posts `payload` to the webhook, retrying per policy.
    ///
    /// The idempotency header is the caller's key when given, otherwise a
    /// generated `make-<uuid>` that stays the same across retries.
    pub async fn execute(
        &self,
        webhook_id: &str,
        payload: Value,
        idempotency_key: Option<&str>,
    ) -> AttemptLog<Value> {
        let url = resolve_url(&self.base_url, webhook_id);
        let idempotency = idempotency_key
            .filter(|key| !key.trim().is_empty())
            .map(str::to_owned)
            .unwrap_or_else(|| format!("make-{}", uuid::Uuid::new_v4()));

        let mut request = OutboundRequest::post(&url, payload.clone())
            .header("Content-Type", "application/json")
            .header(IDEMPOTENCY_HEADER, idempotency.as_str())
            .timeout(self.policy.attempt_timeout);
        if let Some(api_key) = &self.api_key {
            request =
                request.header("Authorization", format!("Bearer {}", api_key.expose_secret()));
        }
        if let Some(secret) = &self.hmac_secret {
            let body = serde_json::to_vec(&payload).unwrap_or_default();
            request = request
                .header(SIGNATURE_HEADER, sign_payload(secret.expose_secret().as_bytes(), &body));
        }

        info!(
            event_name = "action.webhook.execute",
            url = %url,
            idempotency_key = %idempotency,
            "executing automation webhook"
        );

        let mut log = run_with_retry(&self.breaker, &self.policy, &self.metrics, |_attempt| {
            let request = request.clone();
            async move { self.transport.send(request).await.map(|response| response.body) }
        })
        .await;
        log.request_id = Some(idempotency);
        log
    }
}

/// Absolute `http(s)` ids are used verbatim; anything else is joined onto the base URL.
pub fn resolve_url(base_url: &str, webhook_id: &str) -> String {
    if webhook_id.starts_with("http://") || webhook_id.starts_with("https://") {
        return webhook_id.to_owned();
    }
    format!("{}/{}", base_url.trim_end_matches('/'), webhook_id.trim_start_matches('/'))
}
