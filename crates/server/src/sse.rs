//! Server-sent event channel with heartbeats and bounded backpressure.
//!
//! Frames go through a bounded queue to the response body. A write first
//! tries the queue directly; when it is full the writer waits up to the
//! drain timeout for the consumer to catch up, and a timeout tears the
//! stream down instead of dropping the frame.

use std::convert::Infallible;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::Stream;
use neura_core::config::StreamingConfig;
use neura_core::resume;
use neura_core::Clock;
use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StreamSettings {
    pub retry: Duration,
    pub heartbeat_interval: Duration,
    pub drain_timeout: Duration,
    /// Frames queued before a write has to wait for the consumer.
    pub buffer: usize,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            retry: Duration::from_millis(2_500),
            heartbeat_interval: Duration::from_millis(15_000),
            drain_timeout: Duration::from_millis(10_000),
            buffer: 64,
        }
    }
}

impl From<&StreamingConfig> for StreamSettings {
    fn from(config: &StreamingConfig) -> Self {
        Self {
            retry: Duration::from_millis(config.retry_ms),
            heartbeat_interval: Duration::from_millis(config.heartbeat_interval_ms),
            drain_timeout: Duration::from_millis(config.drain_timeout_ms),
            buffer: config.buffer,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StreamError {
    #[error("SSE backpressure: drain timeout")]
    DrainTimeout,
    #[error("stream consumer disconnected")]
    Disconnected,
}

/// Position of the last emitted token.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct Cursor {
    pub index: u64,
    /// Unix epoch milliseconds of the last token.
    pub ts: i64,
}

/// Writer half of a stream. Clones share the same cursor and close state.
#[derive(Clone)]
pub struct SseChannel {
    inner: Arc<Inner>,
}

struct Inner {
    settings: StreamSettings,
    clock: Arc<dyn Clock>,
    started_at: DateTime<Utc>,
    sender: Mutex<Option<mpsc::Sender<String>>>,
    cursor: tokio::sync::Mutex<Cursor>,
    started: AtomicBool,
    closed: AtomicBool,
    heartbeat: Mutex<Option<JoinHandle<()>>>,
}

/// Reader half; feeds the HTTP response body.
pub struct FrameStream {
    receiver: mpsc::Receiver<String>,
}

impl FrameStream {
    pub async fn next_frame(&mut self) -> Option<String> {
        self.receiver.recv().await
    }

    pub fn into_body_stream(self) -> impl Stream<Item = Result<String, Infallible>> + Send {
        futures::stream::unfold(self.receiver, |mut receiver| async move {
            receiver.recv().await.map(|frame| (Ok(frame), receiver))
        })
    }
}

pub fn channel(settings: StreamSettings, clock: Arc<dyn Clock>) -> (SseChannel, FrameStream) {
    let (sender, receiver) = mpsc::channel(settings.buffer.max(1));
    let started_at = clock.now();
    let inner = Inner {
        settings,
        started_at,
        cursor: tokio::sync::Mutex::new(Cursor { index: 0, ts: started_at.timestamp_millis() }),
        clock,
        sender: Mutex::new(Some(sender)),
        started: AtomicBool::new(false),
        closed: AtomicBool::new(false),
        heartbeat: Mutex::new(None),
    };
    (SseChannel { inner: Arc::new(inner) }, FrameStream { receiver })
}

impl SseChannel {
    /// Sends the `retry:` directive, the optional `start` event, and starts
    /// the heartbeat. Only the first call has any effect.
    pub async fn start(&self, payload: Option<Value>) -> Result<(), StreamError> {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.write(format!("retry: {}\n\n", self.inner.settings.retry.as_millis())).await?;
        if let Some(payload) = payload {
            self.event("start", &payload).await?;
        }
        self.spawn_heartbeat();
        Ok(())
    }

    pub async fn event<T: Serialize>(&self, name: &str, data: &T) -> Result<(), StreamError> {
        let data = serde_json::to_string(data).unwrap_or_else(|_| "{}".to_owned());
        self.write(format!("event: {name}\ndata: {data}\n\n")).await
    }

    /// Emits one token with the next cursor. Concurrent callers are
    /// serialised so frames leave in cursor order.
    pub async fn token(&self, content: &str) -> Result<Cursor, StreamError> {
        let mut cursor = self.inner.cursor.lock().await;
        let ts = self.inner.clock.now().timestamp_millis();
        let next = Cursor { index: cursor.index + 1, ts };
        self.event("token", &json!({ "content": content, "cursor": next })).await?;
        *cursor = next;
        Ok(next)
    }

    pub async fn usage<T: Serialize>(&self, payload: &T) -> Result<(), StreamError> {
        self.event("usage", payload).await
    }

    /// Emits `done` and closes the stream.
    pub async fn end(&self, payload: Option<Value>) -> Result<(), StreamError> {
        let result = self.event("done", &payload.unwrap_or_else(|| json!({}))).await;
        self.close();
        result
    }

    /// Emits `error` and closes the stream.
    pub async fn error(&self, code: Option<&str>, message: &str) -> Result<(), StreamError> {
        let mut payload = json!({ "message": message });
        if let Some(code) = code {
            payload["code"] = json!(code);
        }
        let result = self.event("error", &payload).await;
        self.close();
        result
    }

    pub async fn comment(&self, text: &str) -> Result<(), StreamError> {
        self.write(format!(": {text}\n\n")).await
    }

    pub async fn cursor(&self) -> Cursor {
        *self.inner.cursor.lock().await
    }

    /// Opaque token over the current cursor and the stream start time.
    pub async fn resume_token(&self, additional: Option<Value>) -> String {
        let cursor = self.cursor().await;
        resume::encode(
            "sse",
            json!({
                "cursor": cursor,
                "startedAt": self.inner.started_at.timestamp_millis(),
                "additional": additional,
            }),
        )
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Stops the heartbeat and ends the body once queued frames are read.
    /// Closing twice is a no-op.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let heartbeat = self.inner.heartbeat.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(handle) = heartbeat {
            handle.abort();
        }
        self.inner.sender.lock().unwrap_or_else(PoisonError::into_inner).take();
    }

    async fn write(&self, frame: String) -> Result<(), StreamError> {
        if self.is_closed() {
            return Ok(());
        }
        let sender = self.inner.sender.lock().unwrap_or_else(PoisonError::into_inner).clone();
        let Some(sender) = sender else {
            return Ok(());
        };

        let frame = match sender.try_send(frame) {
            Ok(()) => return Ok(()),
            Err(TrySendError::Closed(_)) => {
                self.close();
                return Err(StreamError::Disconnected);
            }
            Err(TrySendError::Full(frame)) => frame,
        };

        debug!(event_name = "stream.backpressure", "stream buffer full; waiting for drain");
        match tokio::time::timeout(self.inner.settings.drain_timeout, sender.send(frame)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => {
                self.close();
                Err(StreamError::Disconnected)
            }
            Err(_) => {
                warn!(
                    event_name = "stream.drain_timeout",
                    drain_timeout_ms = self.inner.settings.drain_timeout.as_millis() as u64,
                    "stream consumer did not drain in time"
                );
                self.close();
                Err(StreamError::DrainTimeout)
            }
        }
    }

    fn spawn_heartbeat(&self) {
        let period = self.inner.settings.heartbeat_interval;
        if period.is_zero() {
            return;
        }
        let channel = self.clone();
        let handle = tokio::spawn(async move {
            let mut ticks = interval_at(Instant::now() + period, period);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticks.tick().await;
                if channel.is_closed() {
                    break;
                }
                let now = channel.inner.clock.now().timestamp_millis();
                if channel.comment(&format!("heartbeat {now}")).await.is_err() {
                    break;
                }
            }
        });

        let mut slot = self.inner.heartbeat.lock().unwrap_or_else(PoisonError::into_inner);
        if self.is_closed() {
            handle.abort();
        } else {
            *slot = Some(handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use neura_core::{resume, Clock, ManualClock};
    use serde_json::json;

    use super::{channel, StreamError, StreamSettings};

    fn settings(buffer: usize) -> StreamSettings {
        StreamSettings { buffer, ..StreamSettings::default() }
    }

    #[tokio::test]
    async fn emits_frames_in_order_and_ends_the_body() {
        let (stream, mut frames) = channel(settings(16), Arc::new(ManualClock::default()));

        stream.start(Some(json!({"correlationId": "corr-1"}))).await.expect("start");
        for word in ["a", "b", "c"] {
            stream.token(word).await.expect("token");
        }
        stream.usage(&json!({"totalTokens": 3})).await.expect("usage");
        stream.end(None).await.expect("end");

        let mut received = Vec::new();
        while let Some(frame) = frames.next_frame().await {
            received.push(frame);
        }

        assert_eq!(received[0], "retry: 2500\n\n");
        assert_eq!(received[1], "event: start\ndata: {\"correlationId\":\"corr-1\"}\n\n");
        for (offset, index) in (1..=3).enumerate() {
            assert!(received[2 + offset].starts_with("event: token\n"));
            assert!(received[2 + offset].contains(&format!("\"index\":{index}")));
        }
        assert!(received[5].starts_with("event: usage\n"));
        assert_eq!(received[6], "event: done\ndata: {}\n\n");
        assert_eq!(received.len(), 7);
    }

    #[tokio::test]
    async fn cursor_is_strictly_increasing() {
        let (stream, _frames) = channel(settings(16), Arc::new(ManualClock::default()));

        let mut indices = Vec::new();
        for _ in 0..5 {
            indices.push(stream.token("x").await.expect("token").index);
        }

        assert_eq!(indices, vec![1, 2, 3, 4, 5]);
        assert_eq!(stream.cursor().await.index, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_consumer_fails_with_drain_timeout() {
        let (stream, _frames) = channel(settings(1), Arc::new(ManualClock::default()));

        stream.token("fits").await.expect("first frame fits the buffer");
        let result = stream.token("blocked").await;

        assert_eq!(result, Err(StreamError::DrainTimeout));
        assert_eq!(StreamError::DrainTimeout.to_string(), "SSE backpressure: drain timeout");
        assert!(stream.is_closed());
        assert_eq!(stream.cursor().await.index, 1, "failed token does not advance the cursor");
    }

    #[tokio::test(start_paused = true)]
    async fn slow_consumer_within_drain_timeout_loses_nothing() {
        let (stream, mut frames) = channel(settings(1), Arc::new(ManualClock::default()));

        let reader = tokio::spawn(async move {
            let mut received = Vec::new();
            tokio::time::sleep(Duration::from_secs(2)).await;
            while let Some(frame) = frames.next_frame().await {
                received.push(frame);
            }
            received
        });

        stream.token("one").await.expect("token");
        stream.token("two").await.expect("token waits for drain");
        stream.end(None).await.expect("end");

        let received = reader.await.expect("reader task");
        assert_eq!(received.len(), 3);
    }

    #[tokio::test]
    async fn dropped_consumer_reports_disconnect() {
        let (stream, frames) = channel(settings(4), Arc::new(ManualClock::default()));
        drop(frames);

        assert_eq!(stream.token("lost").await, Err(StreamError::Disconnected));
        assert!(stream.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_comments_flow_until_close() {
        let (stream, mut frames) = channel(settings(16), Arc::new(ManualClock::default()));
        stream.start(None).await.expect("start");
        assert_eq!(frames.next_frame().await.as_deref(), Some("retry: 2500\n\n"));

        tokio::time::sleep(Duration::from_millis(15_001)).await;
        let heartbeat = frames.next_frame().await.expect("heartbeat frame");
        assert!(heartbeat.starts_with(": heartbeat "));
        assert!(heartbeat.ends_with("\n\n"));

        stream.close();
        stream.close();
        stream.end(Some(json!({"ignored": true}))).await.expect("end after close is a no-op");
        assert_eq!(frames.next_frame().await, None);
    }

    #[tokio::test]
    async fn resume_token_encodes_cursor_and_start() {
        let clock = ManualClock::default();
        let (stream, _frames) = channel(settings(16), Arc::new(clock.clone()));
        stream.token("a").await.expect("token");
        stream.token("b").await.expect("token");

        let token = stream.resume_token(Some(json!({"agentId": "fin-agent"}))).await;
        let document = resume::decode(&token).expect("token decodes");

        assert_eq!(document.scope, "sse");
        assert_eq!(document.payload["cursor"]["index"], 2);
        assert_eq!(document.payload["startedAt"], clock.now().timestamp_millis());
        assert_eq!(document.payload["additional"]["agentId"], "fin-agent");
    }
}
