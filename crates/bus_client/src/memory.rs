//! In-process bus used by tests and degraded local runs.
//!
//! Delivery semantics mirror the NATS client: per-subject ordering from a
//! single publisher, at-most-once for subscriptions, and a capture log
//! standing in for the durable stream.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::mpsc;

use crate::bus::{Bus, BusMessage, Subscription};
use crate::error::{BusError, Result};
use crate::subjects::{ensure_publish_subject, subject_matches};

#[derive(Default)]
pub struct MemoryBus {
    /// Subscription pattern -> senders registered under it.
    topics: DashMap<String, Vec<mpsc::UnboundedSender<BusMessage>>>,
    /// Everything published through `publish_stream`, in order.
    stream_log: Mutex<Vec<BusMessage>>,
    /// When set, every publish fails with `Unavailable`.
    fail_publishes: AtomicBool,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Toggle publish failures to exercise unavailable-bus paths.
    pub fn fail_publishes(&self, fail: bool) {
        self.fail_publishes.store(fail, Ordering::SeqCst);
    }

    /// Messages captured on a durable stream subject, in publish order.
    pub fn stream_messages(&self, subject: &str) -> Vec<BusMessage> {
        self.stream_log
            .lock()
            .expect("stream log poisoned")
            .iter()
            .filter(|msg| msg.subject == subject)
            .cloned()
            .collect()
    }

    fn check_publishable(&self, subject: &str) -> Result<()> {
        ensure_publish_subject(subject)?;
        if self.fail_publishes.load(Ordering::SeqCst) {
            return Err(BusError::Unavailable("publish failure injected".to_string()));
        }
        Ok(())
    }

    fn deliver(&self, subject: &str, headers: &[(String, String)], payload: &Bytes) {
        for mut entry in self.topics.iter_mut() {
            if !subject_matches(entry.key(), subject) {
                continue;
            }
            entry.value_mut().retain(|tx| {
                tx.send(BusMessage {
                    subject: subject.to_string(),
                    payload: payload.clone(),
                    headers: headers.to_vec(),
                })
                .is_ok()
            });
        }
    }
}

#[async_trait]
impl Bus for MemoryBus {
    async fn publish(&self, subject: &str, payload: Bytes) -> Result<()> {
        self.check_publishable(subject)?;
        self.deliver(subject, &[], &payload);
        Ok(())
    }

    async fn publish_with_headers(
        &self,
        subject: &str,
        headers: &[(String, String)],
        payload: Bytes,
    ) -> Result<()> {
        self.check_publishable(subject)?;
        self.deliver(subject, headers, &payload);
        Ok(())
    }

    async fn subscribe(&self, subject: &str) -> Result<Subscription> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.topics.entry(subject.to_string()).or_default().push(tx);
        Ok(Subscription::new(rx, None))
    }

    async fn publish_stream(&self, subject: &str, payload: Bytes) -> Result<()> {
        self.check_publishable(subject)?;
        let msg = BusMessage {
            subject: subject.to_string(),
            payload: payload.clone(),
            headers: Vec::new(),
        };
        self.stream_log.lock().expect("stream log poisoned").push(msg);
        // Durable subjects are observable by live subscribers too.
        self.deliver(subject, &[], &payload);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delivers_in_publish_order() {
        let bus = MemoryBus::new();
        let mut sub = bus.subscribe("chat.request").await.unwrap();

        for i in 0..5 {
            bus.publish("chat.request", Bytes::from(format!("m{}", i)))
                .await
                .unwrap();
        }

        for i in 0..5 {
            let msg = sub.next().await.unwrap();
            assert_eq!(msg.payload, Bytes::from(format!("m{}", i)));
        }
    }

    #[tokio::test]
    async fn wildcard_subscriptions_receive_matching_subjects() {
        let bus = MemoryBus::new();
        let mut sub = bus.subscribe("resp.*").await.unwrap();

        bus.publish("resp.abc", Bytes::from_static(b"yes")).await.unwrap();
        bus.publish("other.abc", Bytes::from_static(b"no")).await.unwrap();

        let msg = sub.next().await.unwrap();
        assert_eq!(msg.subject, "resp.abc");
    }

    #[tokio::test]
    async fn headers_travel_with_the_message() {
        let bus = MemoryBus::new();
        let mut sub = bus.subscribe("chat.request").await.unwrap();

        let headers = vec![("Reply".to_string(), "resp.1".to_string())];
        bus.publish_with_headers("chat.request", &headers, Bytes::from_static(b"{}"))
            .await
            .unwrap();

        let msg = sub.next().await.unwrap();
        assert_eq!(msg.header("Reply"), Some("resp.1"));
        assert_eq!(msg.header("reply"), Some("resp.1"));
        assert_eq!(msg.header("Ack"), None);
    }

    #[tokio::test]
    async fn wildcard_publish_subjects_are_refused() {
        let bus = MemoryBus::new();

        let err = bus
            .publish("resp.*", Bytes::from_static(b"{}"))
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::InvalidSubject(_)));

        let err = bus
            .publish_stream("memory.>", Bytes::from_static(b"{}"))
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::InvalidSubject(_)));
        assert!(bus.stream_messages("memory.>").is_empty());
    }

    #[tokio::test]
    async fn injected_failures_surface_as_unavailable() {
        let bus = MemoryBus::new();
        bus.fail_publishes(true);

        let err = bus
            .publish("chat.request", Bytes::from_static(b"{}"))
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::Unavailable(_)));

        bus.fail_publishes(false);
        bus.publish("chat.request", Bytes::from_static(b"{}"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn stream_publishes_are_captured() {
        let bus = MemoryBus::new();
        bus.publish_stream("memory.raw", Bytes::from_static(b"a"))
            .await
            .unwrap();
        bus.publish_stream("memory.raw", Bytes::from_static(b"b"))
            .await
            .unwrap();
        bus.publish_stream("other.stream", Bytes::from_static(b"c"))
            .await
            .unwrap();

        let captured = bus.stream_messages("memory.raw");
        assert_eq!(captured.len(), 2);
        assert_eq!(captured[0].payload, Bytes::from_static(b"a"));
        assert_eq!(captured[1].payload, Bytes::from_static(b"b"));
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let bus = MemoryBus::new();
        let sub = bus.subscribe("chat.request").await.unwrap();
        sub.unsubscribe();

        // The dropped receiver is pruned on the next publish.
        bus.publish("chat.request", Bytes::from_static(b"{}"))
            .await
            .unwrap();
        assert!(bus.topics.get("chat.request").unwrap().is_empty());
    }
}
