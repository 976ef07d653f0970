//! The seam between action generators and the network.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

#[derive(Clone, Debug, PartialEq)]
pub struct OutboundRequest {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub query: Vec<(String, String)>,
    pub body: Option<Value>,
    pub timeout: Duration,
}

impl OutboundRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::Get, url.into(), None)
    }

    pub fn post(url: impl Into<String>, body: Value) -> Self {
        Self::new(Method::Post, url.into(), Some(body))
    }

    fn new(method: Method, url: String, body: Option<Value>) -> Self {
        Self {
            method,
            url,
            headers: Vec::new(),
            query: Vec::new(),
            body,
            timeout: Duration::from_secs(30),
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn query_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((name.into(), value.into()));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Case-insensitive header lookup.
    pub fn header_value(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct TransportResponse {
    pub status: u16,
    pub body: Value,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("network failure: {0}")]
    Network(String),
    #[error("request timed out after {0} ms")]
    Timeout(u64),
    #[error("downstream returned status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("could not decode downstream response: {0}")]
    Decode(String),
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: OutboundRequest) -> Result<TransportResponse, TransportError>;
}

/// `reqwest`-backed transport. Non-2xx statuses are failures; an empty body
/// decodes to `Value::Null`.
#[derive(Clone, Debug, Default)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: OutboundRequest) -> Result<TransportResponse, TransportError> {
        let timeout_ms = request.timeout.as_millis() as u64;
        let mut builder = match request.method {
            Method::Get => self.client.get(&request.url),
            Method::Post => self.client.post(&request.url),
        };
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder.timeout(request.timeout).send().await.map_err(|error| {
            if error.is_timeout() {
                TransportError::Timeout(timeout_ms)
            } else {
                TransportError::Network(error.to_string())
            }
        })?;

        let status = response.status();
        let bytes = response.bytes().await.map_err(|error| {
            if error.is_timeout() {
                TransportError::Timeout(timeout_ms)
            } else {
                TransportError::Network(error.to_string())
            }
        })?;

        if !status.is_success() {
            return Err(TransportError::Status {
                status: status.as_u16(),
                body: String::from_utf8_lossy(&bytes).chars().take(512).collect(),
            });
        }

        let body = if bytes.iter().all(u8::is_ascii_whitespace) {
            Value::Null
        } else {
            serde_json::from_slice(&bytes)
                .map_err(|error| TransportError::Decode(error.to_string()))?
        };
        Ok(TransportResponse { status: status.as_u16(), body })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::{Method, OutboundRequest};

    #[test]
    fn builder_collects_headers_and_query() {
        let request = OutboundRequest::post("https://hook.example/run", json!({"a": 1}))
            .header("Idempotency-Key", "idem-key-0001")
            .query_param("q", "revenue")
            .timeout(Duration::from_millis(250));

        assert_eq!(request.method, Method::Post);
        assert_eq!(request.header_value("idempotency-key"), Some("idem-key-0001"));
        assert_eq!(request.header_value("x-missing"), None);
        assert_eq!(request.query, vec![("q".to_owned(), "revenue".to_owned())]);
        assert_eq!(request.timeout, Duration::from_millis(250));
    }
}
