//! Downlink publishing and per-user reply pacing.
//!
//! The publisher serializes one chunk into the gateway's `sendtext` JSON
//! object and hands it to the transport, fire-and-forget. The pacer owns the
//! inter-chunk delay: one reply's chunks go out strictly in order, at most
//! one in-flight reply per user (a newer reply cancels the old one), and
//! nothing here ever blocks the inbound-processing path.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;

use crate::chunker::chunk_text;
use crate::envelope::parse_node_ref;
use crate::error::TransportError;

/// Transport-facing publish contract. The MQTT client implements this; tests
/// substitute a recording sink.
#[async_trait]
pub trait MeshSink: Send + Sync {
    async fn publish(&self, payload: serde_json::Value) -> Result<(), TransportError>;
}

/// Where a reply goes: the user's node, through the gateway that last
/// heard them, on the channel they used.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyTarget {
    pub user: u32,
    pub gateway: String,
    pub channel: u32,
}

/// Serializes chunks into outbound envelopes and publishes them.
pub struct Downlink {
    sink: Arc<dyn MeshSink>,
}

impl Downlink {
    pub fn new(sink: Arc<dyn MeshSink>) -> Self {
        Self { sink }
    }

    /// Publish one text frame to `target`. Failures are logged and dropped;
    /// partial delivery of a chunked reply is an accepted degradation.
    pub async fn send_text(&self, target: &ReplyTarget, text: &str) {
        let Some(gateway_id) = parse_node_ref(&target.gateway) else {
            tracing::warn!(gateway = %target.gateway, "unparseable gateway id, dropping downlink");
            return;
        };

        let payload = serde_json::json!({
            "from": gateway_id,
            "to": target.user,
            "channel": target.channel,
            "type": "sendtext",
            "payload": text,
        });

        if let Err(e) = self.sink.publish(payload).await {
            tracing::warn!(user = target.user, error = %e, "downlink publish failed");
        }
    }
}

struct InFlight {
    generation: u64,
    handle: JoinHandle<()>,
}

/// Paces chunked replies: per-user serialized, cancel-and-restart.
pub struct ReplyPacer {
    downlink: Arc<Downlink>,
    chunk_max_bytes: usize,
    delay: Duration,
    inflight: Arc<Mutex<HashMap<u32, InFlight>>>,
    next_generation: AtomicU64,
}

impl ReplyPacer {
    pub fn new(downlink: Arc<Downlink>, chunk_max_bytes: usize, delay: Duration) -> Self {
        Self {
            downlink,
            chunk_max_bytes,
            delay,
            inflight: Arc::new(Mutex::new(HashMap::new())),
            next_generation: AtomicU64::new(0),
        }
    }

    /// Queue a reply for paced delivery. If an earlier reply to the same
    /// user is still going out, it is cancelled and its remaining chunks
    /// are discarded silently.
    pub fn send(&self, target: ReplyTarget, text: String) {
        let chunks = chunk_text(&text, self.chunk_max_bytes);
        if chunks.is_empty() {
            return;
        }

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let user = target.user;
        let downlink = Arc::clone(&self.downlink);
        let delay = self.delay;
        let inflight = Arc::clone(&self.inflight);

        // Hold the lock across the swap so the new task cannot observe the
        // map before its own entry is present.
        let mut map = self.inflight.lock().unwrap();
        if let Some(old) = map.remove(&user) {
            if !old.handle.is_finished() {
                tracing::debug!(user, "superseding in-flight reply");
                old.handle.abort();
            }
        }

        let handle = tokio::spawn(async move {
            let total = chunks.len();
            for (i, chunk) in chunks.into_iter().enumerate() {
                downlink.send_text(&target, &chunk.text).await;
                if i + 1 < total {
                    tokio::time::sleep(delay).await;
                }
            }
            let mut map = inflight.lock().unwrap();
            if map.get(&user).is_some_and(|f| f.generation == generation) {
                map.remove(&user);
            }
        });

        map.insert(user, InFlight { generation, handle });
    }

    /// Number of replies currently being paced out.
    pub fn in_flight(&self) -> usize {
        self.inflight.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Sink that records every published payload.
    #[derive(Default)]
    struct RecordingSink {
        published: Mutex<Vec<serde_json::Value>>,
    }

    impl RecordingSink {
        fn texts(&self) -> Vec<String> {
            self.published
                .lock()
                .unwrap()
                .iter()
                .map(|v| v["payload"].as_str().unwrap_or_default().to_string())
                .collect()
        }
    }

    #[async_trait]
    impl MeshSink for RecordingSink {
        async fn publish(&self, payload: serde_json::Value) -> Result<(), TransportError> {
            self.published.lock().unwrap().push(payload);
            Ok(())
        }
    }

    fn target(user: u32) -> ReplyTarget {
        ReplyTarget {
            user,
            gateway: "!a1b2c3d4".into(),
            channel: 0,
        }
    }

    async fn settle(sink: &RecordingSink, expect_at_least: usize) {
        for _ in 0..200 {
            if sink.published.lock().unwrap().len() >= expect_at_least {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    #[tokio::test]
    async fn downlink_builds_sendtext_envelope() {
        let sink = Arc::new(RecordingSink::default());
        let downlink = Downlink::new(sink.clone());

        downlink.send_text(&target(99), "Hi there!").await;

        let published = sink.published.lock().unwrap();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0]["from"], 0xa1b2_c3d4_u32);
        assert_eq!(published[0]["to"], 99);
        assert_eq!(published[0]["channel"], 0);
        assert_eq!(published[0]["type"], "sendtext");
        assert_eq!(published[0]["payload"], "Hi there!");
    }

    #[tokio::test]
    async fn downlink_drops_frame_on_bad_gateway() {
        let sink = Arc::new(RecordingSink::default());
        let downlink = Downlink::new(sink.clone());

        let bad = ReplyTarget {
            user: 1,
            gateway: "!nothex".into(),
            channel: 0,
        };
        downlink.send_text(&bad, "hello").await;
        assert!(sink.published.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn pacer_sends_chunks_in_order() {
        let sink = Arc::new(RecordingSink::default());
        let pacer = ReplyPacer::new(
            Arc::new(Downlink::new(sink.clone())),
            20,
            Duration::from_millis(1200),
        );

        let text = "This is sentence one. This is sentence two.";
        pacer.send(target(7), text.into());
        settle(&sink, 6).await;

        let texts = sink.texts();
        assert!(texts.len() > 1);
        for (i, t) in texts.iter().enumerate() {
            assert!(t.starts_with(&format!("[{}/{}] ", i + 1, texts.len())));
        }
        assert_eq!(pacer.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn newer_reply_supersedes_older_one() {
        let sink = Arc::new(RecordingSink::default());
        let pacer = ReplyPacer::new(
            Arc::new(Downlink::new(sink.clone())),
            16,
            Duration::from_millis(1200),
        );

        pacer.send(target(7), "old old old old old old old old old old".into());
        pacer.send(target(7), "fresh".into());
        settle(&sink, 1).await;
        tokio::time::sleep(Duration::from_secs(30)).await;

        let texts = sink.texts();
        // The superseding reply arrives complete, and nothing trails it.
        assert_eq!(texts.last().map(String::as_str), Some("fresh"));
        assert_eq!(texts.iter().filter(|t| t.contains("fresh")).count(), 1);
        assert_eq!(pacer.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn distinct_users_pace_concurrently() {
        let sink = Arc::new(RecordingSink::default());
        let pacer = ReplyPacer::new(
            Arc::new(Downlink::new(sink.clone())),
            180,
            Duration::from_millis(1200),
        );

        pacer.send(target(1), "for user one".into());
        pacer.send(target(2), "for user two".into());
        settle(&sink, 2).await;

        let published = sink.published.lock().unwrap();
        let users: Vec<u64> = published.iter().map(|v| v["to"].as_u64().unwrap()).collect();
        assert!(users.contains(&1));
        assert!(users.contains(&2));
    }
}
