//! Request log fan-out.
//!
//! Each completed inbound request publishes exactly one event. The bus
//! keeps a bounded ring of recent events, forwards live events to SSE
//! subscribers with drop-when-full semantics, and hands persistence to a
//! detached task so the request path never waits on the store.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::store::ConfigStore;

const SUBSCRIBER_BUFFER: usize = 64;
const PERSIST_DEADLINE: Duration = Duration::from_secs(5);

pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct LogEvent {
    pub ts_ms: u64,
    pub request_id: String,
    pub facade: String,
    pub request_model: String,
    pub upstream_model: String,
    pub provider_type: String,
    pub pool_id: u64,
    pub provider_id: u64,
    pub credential_id: u64,
    pub client_key: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub src_ip: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub user_agent: String,
    #[serde(default, skip_serializing_if = "crate::proto::is_false")]
    pub is_test: bool,
    #[serde(default, skip_serializing_if = "crate::proto::is_false")]
    pub stream: bool,
    #[serde(default)]
    pub request_bytes: u64,
    #[serde(default)]
    pub response_bytes: u64,
    #[serde(default)]
    pub input_tokens: i64,
    #[serde(default)]
    pub output_tokens: i64,
    pub status: u16,
    pub latency_ms: u64,
    #[serde(default)]
    pub ttft_ms: u64,
    #[serde(default)]
    pub tps: f64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
}

struct BusInner {
    ring: VecDeque<LogEvent>,
    subscribers: Vec<mpsc::Sender<LogEvent>>,
}

pub struct LogBus {
    inner: Mutex<BusInner>,
    ring_cap: usize,
    store: Option<Arc<dyn ConfigStore>>,
}

impl LogBus {
    pub fn new(store: Option<Arc<dyn ConfigStore>>, ring_cap: usize) -> Self {
        let ring_cap = if ring_cap == 0 { 500 } else { ring_cap };
        Self {
            inner: Mutex::new(BusInner {
                ring: VecDeque::with_capacity(ring_cap),
                subscribers: Vec::new(),
            }),
            ring_cap,
            store,
        }
    }

    /// Pushes into the ring, forwards to subscribers without blocking, and
    /// queues asynchronous persistence. Never fails.
    pub fn publish(&self, event: LogEvent) {
        {
            let mut inner = self.inner.lock().expect("log bus poisoned");
            if inner.ring.len() == self.ring_cap {
                inner.ring.pop_front();
            }
            inner.ring.push_back(event.clone());
            inner.subscribers.retain(|sub| {
                match sub.try_send(event.clone()) {
                    Ok(()) => true,
                    // Slow subscriber: drop this event, keep the channel.
                    Err(mpsc::error::TrySendError::Full(_)) => true,
                    Err(mpsc::error::TrySendError::Closed(_)) => false,
                }
            });
        }

        if let Some(store) = self.store.clone() {
            tokio::spawn(async move {
                let outcome =
                    tokio::time::timeout(PERSIST_DEADLINE, store.insert_log(&event)).await;
                match outcome {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => tracing::warn!(error = %err, "failed to persist log event"),
                    Err(_) => tracing::warn!("log event persistence timed out"),
                }
            });
        }
    }

    /// Registers a subscriber and returns the current ring snapshot plus a
    /// live channel.
    pub fn subscribe(&self) -> (Vec<LogEvent>, mpsc::Receiver<LogEvent>) {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        let mut inner = self.inner.lock().expect("log bus poisoned");
        let snapshot = inner.ring.iter().cloned().collect();
        inner.subscribers.push(tx);
        (snapshot, rx)
    }

    pub fn recent(&self) -> Vec<LogEvent> {
        let inner = self.inner.lock().expect("log bus poisoned");
        inner.ring.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(request_id: &str) -> LogEvent {
        LogEvent {
            ts_ms: now_millis(),
            request_id: request_id.to_string(),
            facade: "openai".to_string(),
            status: 200,
            ..LogEvent::default()
        }
    }

    #[tokio::test]
    async fn ring_drops_oldest_at_capacity() {
        let bus = LogBus::new(None, 2);
        bus.publish(event("a"));
        bus.publish(event("b"));
        bus.publish(event("c"));
        let recent = bus.recent();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].request_id, "b");
        assert_eq!(recent[1].request_id, "c");
    }

    #[tokio::test]
    async fn subscriber_sees_snapshot_then_live_events() {
        let bus = LogBus::new(None, 10);
        bus.publish(event("old"));
        let (snapshot, mut rx) = bus.subscribe();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].request_id, "old");
        bus.publish(event("live"));
        let got = rx.recv().await.unwrap();
        assert_eq!(got.request_id, "live");
    }

    #[tokio::test]
    async fn closed_subscriber_is_pruned() {
        let bus = LogBus::new(None, 10);
        let (_, rx) = bus.subscribe();
        drop(rx);
        bus.publish(event("x"));
        bus.publish(event("y"));
        assert_eq!(bus.recent().len(), 2);
        assert_eq!(bus.inner.lock().unwrap().subscribers.len(), 0);
    }

    #[tokio::test]
    async fn full_subscriber_drops_events_without_blocking() {
        let bus = LogBus::new(None, 1000);
        let (_, mut rx) = bus.subscribe();
        for i in 0..(SUBSCRIBER_BUFFER + 10) {
            bus.publish(event(&format!("e{i}")));
        }
        // The channel holds at most SUBSCRIBER_BUFFER events; the rest were
        // dropped, but the subscriber stays registered.
        let mut received = 0;
        while rx.try_recv().is_ok() {
            received += 1;
        }
        assert_eq!(received, SUBSCRIBER_BUFFER);
        assert_eq!(bus.inner.lock().unwrap().subscribers.len(), 1);
    }
}
