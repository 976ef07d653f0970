//! Semantic search client with a read-through result cache.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::Duration as ChronoDuration;
use neura_core::config::SearchConfig;
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

pub const TARGET: &str = "search";
const CACHE_CAPACITY: usize = 512;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub id: String,
    pub score: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snippet: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

pub struct SearchGenerator {
    transport: Arc<dyn Transport>,
    base_url: String,
    api_key: Option<SecretString>,
    top_k: u32,
    breaker: CircuitBreaker,
    policy: RetryPolicy,
    metrics: Arc<MetricsRegistry>,
    cache: Mutex<TtlCache<Vec<SearchHit>>>,
}

impl SearchGenerator {
    pub fn new(
        transport: Arc<dyn Transport>,
        base_url: impl Into<String>,
        top_k: u32,
        breaker: CircuitBreaker,
        policy: RetryPolicy,
        cache_ttl: ChronoDuration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            transport,
            base_url: base_url.into(),
            api_key: None,
            top_k,
            breaker,
            policy,
            metrics: Arc::default(),
            cache: Mutex::new(TtlCache::new(cache_ttl, CACHE_CAPACITY, clock)),
        }
    }

    pub fn from_config(
        config: &SearchConfig,
        transport: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ActionError> {
        let base_url = config.base_url.clone().ok_or_else(|| ActionError::NotConfigured {
            target: TARGET.to_owned(),
            reason: "search.base_url is not set".to_owned(),
        })?;
        let breaker = CircuitBreaker::new(TARGET, (&config.downstream).into(), clock.clone());
        let mut generator = Self::new(
            transport,
            base_url,
            config.top_k,
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

    /// `GET {base}/search?q=&top=` plus filters. Cached results skip the
    /// breaker and the network.
    pub async fn run(
        &self,
        query: &str,
        filters: &BTreeMap<String, String>,
    ) -> AttemptLog<Vec<SearchHit>> {
        let cache_key = cache_key(query, filters, self.top_k);
        let cached = self.cache.lock().unwrap_or_else(PoisonError::into_inner).get(&cache_key);
        if let Some(hits) = cached {
            debug!(event_name = "action.search.cache_hit", query, "serving cached search results");
            self.metrics.increment("search.cache_hit");
            return AttemptLog::cached(TARGET, hits);
        }

        let url = format!("{}/search", self.base_url.trim_end_matches('/'));
        let mut request = OutboundRequest::get(url)
            .query_param("q", query)
            .query_param("top", self.top_k.to_string())
            .timeout(self.policy.attempt_timeout);
        for (name, value) in filters {
            request = request.query_param(name.as_str(), value.as_str());
        }
        if let Some(api_key) = &self.api_key {
            request = request.header("x-api-key", api_key.expose_secret());
        }

        let log = run_with_retry(&self.breaker, &self.policy, &self.metrics, |_attempt| {
            let request = request.clone();
            async move {
                let response = self.transport.send(request).await?;
                parse_hits(&response.body)
            }
        })
        .await;

        if let Ok(hits) = &log.outcome {
            self.metrics.observe("search.result_count", hits.len() as f64);
            let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
            cache.insert(cache_key, hits.clone());
        }
        log
    }
}

fn cache_key(query: &str, filters: &BTreeMap<String, String>, top_k: u32) -> String {
    serde_json::json!({ "q": query, "filters": filters, "top": top_k }).to_string()
}

/// Missing ids fall back to the result index, missing scores to zero.
fn parse_hits(body: &Value) -> Result<Vec<SearchHit>, TransportError> {
    let results = match body.get("results") {
        None | Some(Value::Null) => return Ok(Vec::new()),
        Some(Value::Array(items)) => items,
        Some(other) => {
            return Err(TransportError::Decode(format!("`results` is not an array: {other}")))
        }
    };
    Ok(results
        .iter()
        .enumerate()
        .map(|(index, item)| SearchHit {
            id: match item.get("id") {
                Some(Value::String(id)) => id.clone(),
                Some(Value::Number(id)) => id.to_string(),
                _ => index.to_string(),
            },
            score: item.get("score").and_then(Value::as_f64).unwrap_or(0.0),
            source: item.get("source").and_then(Value::as_str).map(str::to_owned),
            snippet: item.get("snippet").and_then(Value::as_str).map(str::to_owned),
            metadata: item.get("metadata").filter(|value| !value.is_null()).cloned(),
        })
        .collect())
}
