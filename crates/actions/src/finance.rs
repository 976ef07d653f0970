//! Market data client with a per-symbol snapshot cache.

use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use neura_core::config::FinanceConfig;
use neura_core::metrics::MetricsRegistry;
use neura_core::{Clock, TtlCache};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::breaker::{BreakerSnapshot, CircuitBreaker};
use crate::error::ActionError;
use crate::retry::{run_with_retry, AttemptLog, RetryPolicy};
use crate::transport::{OutboundRequest, Transport, TransportError};

pub const TARGET: &str = "finance";
const CACHE_CAPACITY: usize = 1_024;
const DEFAULT_CURRENCY: &str = "USD";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinancialSnapshot {
    pub symbol: String,
    pub price: f64,
    pub currency: String,
    pub change24h: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub market_cap: Option<f64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub time_series: Vec<PricePoint>,
    pub fetched_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PricePoint {
    pub ts: DateTime<Utc>,
    pub value: f64,
}

pub struct FinanceGenerator {
    transport: Arc<dyn Transport>,
    base_url: String,
    api_key: Option<SecretString>,
    breaker: CircuitBreaker,
    policy: RetryPolicy,
    metrics: Arc<MetricsRegistry>,
    clock: Arc<dyn Clock>,
    cache: Mutex<TtlCache<FinancialSnapshot>>,
}

impl FinanceGenerator {
    pub fn new(
        transport: Arc<dyn Transport>,
        base_url: impl Into<String>,
        breaker: CircuitBreaker,
        policy: RetryPolicy,
        cache_ttl: ChronoDuration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            transport,
            base_url: base_url.into(),
            api_key: None,
            breaker,
            policy,
            metrics: Arc::default(),
            cache: Mutex::new(TtlCache::new(cache_ttl, CACHE_CAPACITY, clock.clone())),
            clock,
        }
    }

    pub fn from_config(
        config: &FinanceConfig,
        transport: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ActionError> {
        let base_url = config.base_url.clone().ok_or_else(|| ActionError::NotConfigured {
            target: TARGET.to_owned(),
            reason: "finance.base_url is not set".to_owned(),
        })?;
        let breaker = CircuitBreaker::new(TARGET, (&config.downstream).into(), clock.clone());
        let mut generator = Self::new(
            transport,
            base_url,
            breaker,
            RetryPolicy::from(&config.downstream),
            ChronoDuration::seconds(config.cache_ttl_secs.min(i64::MAX as u64) as i64),
            clock,
        );
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

    /// Returns the cached snapshot while it is fresh; otherwise fetches
    /// `GET {base}/quotes/{symbol}` behind the breaker.
    pub async fn get_snapshot(&self, symbol: &str) -> AttemptLog<FinancialSnapshot> {
        let symbol = symbol.trim().to_uppercase();
        let cached = self.cache.lock().unwrap_or_else(PoisonError::into_inner).get(&symbol);
        if let Some(snapshot) = cached {
            debug!(event_name = "action.finance.cache_hit", symbol = %symbol, "cached quote");
            self.metrics.increment("finance.cache_hit");
            return AttemptLog::cached(TARGET, snapshot);
        }

        let url = format!("{}/quotes/{symbol}", self.base_url.trim_end_matches('/'));
        let mut request = OutboundRequest::get(url).timeout(self.policy.attempt_timeout);
        if let Some(api_key) = &self.api_key {
            request = request.header("x-api-key", api_key.expose_secret());
        }

        let log = run_with_retry(&self.breaker, &self.policy, &self.metrics, |_attempt| {
            let request = request.clone();
            let symbol = symbol.as_str();
            async move {
                let response = self.transport.send(request).await?;
                normalise(symbol, &response.body, self.clock.now())
            }
        })
        .await;

        if let Ok(snapshot) = &log.outcome {
            let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
            cache.insert(symbol, snapshot.clone());
        }
        log
    }
}

fn normalise(
    symbol: &str,
    body: &Value,
    fetched_at: DateTime<Utc>,
) -> Result<FinancialSnapshot, TransportError> {
    if !body.is_object() {
        return Err(TransportError::Decode(format!("quote for `{symbol}` is not an object")));
    }
    let number = |keys: &[&str]| keys.iter().find_map(|key| body.get(*key).and_then(Value::as_f64));

    let time_series = match body.get("timeSeries") {
        Some(Value::Array(points)) => points
            .iter()
            .map(|point| PricePoint {
                ts: ["ts", "timestamp"]
                    .iter()
                    .find_map(|key| point.get(*key).and_then(parse_timestamp))
                    .unwrap_or(fetched_at),
                value: ["value", "price"]
                    .iter()
                    .find_map(|key| point.get(*key).and_then(Value::as_f64))
                    .unwrap_or(0.0),
            })
            .collect(),
        _ => Vec::new(),
    };

    Ok(FinancialSnapshot {
        symbol: body.get("symbol").and_then(Value::as_str).unwrap_or(symbol).to_owned(),
        price: number(&["price", "value"]).unwrap_or(0.0),
        currency: body
            .get("currency")
            .and_then(Value::as_str)
            .filter(|currency| !currency.is_empty())
            .unwrap_or(DEFAULT_CURRENCY)
            .to_owned(),
        change24h: number(&["change24h", "change"]).unwrap_or(0.0),
        market_cap: number(&["marketCap"]),
        time_series,
        fetched_at,
    })
}

/// Accepts RFC 3339 strings and unix epoch milliseconds.
fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(text) => {
            DateTime::parse_from_rfc3339(text).ok().map(|parsed| parsed.with_timezone(&Utc))
        }
        Value::Number(number) => Utc.timestamp_millis_opt(number.as_i64()?).single(),
        _ => None,
    }
}
