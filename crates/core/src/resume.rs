//! Opaque resume tokens and context fingerprints.
//!
//! A resume token is a hex-encoded JSON document `{scope, payload, ts}`. It is
//! opaque to callers; the gateway only uses it to correlate a reconnect with
//! a stream position and never replays from it.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::signing::{decode_hex, encode_hex, sha256_hex};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResumeDocument {
    pub scope: String,
    pub payload: Value,
    /// Milliseconds since the unix epoch at encoding time.
    pub ts: i64,
}

pub fn encode(scope: &str, payload: Value) -> String {
    let document =
        ResumeDocument { scope: scope.to_string(), payload, ts: Utc::now().timestamp_millis() };
    // Serializing a struct of strings, numbers and a `Value` cannot fail.
    let raw = serde_json::to_vec(&document).unwrap_or_default();
    encode_hex(&raw)
}

pub fn decode(token: &str) -> Option<ResumeDocument> {
    let bytes = decode_hex(token.trim())?;
    serde_json::from_slice(&bytes).ok()
}

/// `sha256:<hex>` over the JSON serialization of `context`.
pub fn hash_context<T: Serialize>(context: &T) -> String {
    let json = serde_json::to_vec(context).unwrap_or_default();
    format!("sha256:{}", sha256_hex(&json))
}
