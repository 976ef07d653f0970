//! Action generators - resilient clients for the gateway's downstream targets
//!
//! Every generator runs the same loop: check the per-target circuit breaker,
//! try the call up to `max_attempts` times with exponential backoff, and hand
//! back an [`AttemptLog`] holding the outcome plus one record per attempt.
//!
//! - **Webhook** (`webhook`) - signed, idempotent automation calls
//! - **Search** (`search`) - semantic search with a result cache
//! - **Finance** (`finance`) - market quotes with a per-symbol snapshot cache
//! - **Model** (`model`) - chat completions priced from the price table
//!
//! Network access goes through the [`Transport`] trait so tests can script
//! downstream behaviour without sockets.

pub mod breaker;
pub mod error;
pub mod finance;
pub mod model;
pub mod retry;
pub mod search;
pub mod transport;
pub mod webhook;

use std::sync::Arc;

use neura_core::{Clock, GatewayConfig, MetricsRegistry, PriceTable};
use tracing::info;

pub use breaker::{BreakerConfig, BreakerSnapshot, CircuitBreaker};
pub use error::ActionError;
pub use finance::{FinanceGenerator, FinancialSnapshot, PricePoint};
pub use model::{ModelGenerator, ModelReply};
pub use retry::{run_with_retry, AttemptLog, RetryPolicy};
pub use search::{SearchGenerator, SearchHit};
pub use transport::{
    HttpTransport, Method, OutboundRequest, Transport, TransportError, TransportResponse,
};
pub use webhook::WebhookGenerator;

/// The generators a gateway instance can dispatch to. A target without a
/// configured base URL is left out.
#[derive(Default)]
pub struct ActionSet {
    pub webhook: Option<WebhookGenerator>,
    pub search: Option<SearchGenerator>,
    pub finance: Option<FinanceGenerator>,
    pub model: Option<ModelGenerator>,
}

impl ActionSet {
    pub fn from_config(
        config: &GatewayConfig,
        prices: PriceTable,
        transport: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let webhook =
            WebhookGenerator::from_config(&config.webhook, transport.clone(), clock.clone());
        let search = SearchGenerator::from_config(&config.search, transport.clone(), clock.clone());
        let finance =
            FinanceGenerator::from_config(&config.finance, transport.clone(), clock.clone());
        let model = ModelGenerator::from_config(&config.model, prices, transport, clock);
        let set = Self {
            webhook: webhook.ok(),
            search: search.ok(),
            finance: finance.ok(),
            model: model.ok(),
        };
        info!(
            event_name = "action.set.configured",
            webhook = set.webhook.is_some(),
            search = set.search.is_some(),
            finance = set.finance.is_some(),
            model = set.model.is_some(),
            "action generators configured"
        );
        set
    }

    /// Points every configured generator at one shared registry.
    pub fn with_metrics(self, metrics: Arc<MetricsRegistry>) -> Self {
        Self {
            webhook: self.webhook.map(|generator| generator.with_metrics(metrics.clone())),
            search: self.search.map(|generator| generator.with_metrics(metrics.clone())),
            finance: self.finance.map(|generator| generator.with_metrics(metrics.clone())),
            model: self.model.map(|generator| generator.with_metrics(metrics)),
        }
    }

    /// Snapshots of every configured generator's breaker.
    pub fn breakers(&self) -> Vec<BreakerSnapshot> {
        [
            self.webhook.as_ref().map(WebhookGenerator::breaker),
            self.search.as_ref().map(SearchGenerator::breaker),
            self.finance.as_ref().map(FinanceGenerator::breaker),
            self.model.as_ref().map(ModelGenerator::breaker),
        ]
        .into_iter()
        .flatten()
        .collect()
    }
}
