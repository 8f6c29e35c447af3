//! The bus abstraction: message shape, subscriptions, and the [`Bus`] trait.

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::Result;

/// A single message delivered on a subject.
#[derive(Debug, Clone)]
pub struct BusMessage {
    /// Subject the message arrived on.
    pub subject: String,
    /// Raw payload bytes.
    pub payload: Bytes,
    /// Flattened message headers as (name, value) pairs.
    pub headers: Vec<(String, String)>,
}

impl BusMessage {
    /// Look up the first header with the given name (case-insensitive).
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// An active subscription feeding an ordered in-memory channel.
///
/// Messages are yielded in arrival order; per-subject delivery is serialized
/// by construction. Dropping the subscription ceases delivery.
#[derive(Debug)]
pub struct Subscription {
    rx: mpsc::UnboundedReceiver<BusMessage>,
    pump: Option<JoinHandle<()>>,
}

impl Subscription {
    pub(crate) fn new(
        rx: mpsc::UnboundedReceiver<BusMessage>,
        pump: Option<JoinHandle<()>>,
    ) -> Self {
        Self { rx, pump }
    }

    /// Wait for the next message. `None` means the subscription ended.
    pub async fn next(&mut self) -> Option<BusMessage> {
        self.rx.recv().await
    }

    /// Cease delivery. Messages already queued are discarded.
    pub fn unsubscribe(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
        self.rx.close();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Uniform access to the pub-sub substrate.
///
/// Ordering of messages on a single subject from a single publisher is
/// preserved; across publishers it is unspecified.
#[async_trait]
pub trait Bus: Send + Sync {
    /// Fire-and-forget publish to an ephemeral subject.
    async fn publish(&self, subject: &str, payload: Bytes) -> Result<()>;

    /// Publish with string headers attached.
    async fn publish_with_headers(
        &self,
        subject: &str,
        headers: &[(String, String)],
        payload: Bytes,
    ) -> Result<()>;

    /// Subscribe to every message arriving on `subject` until unsubscribed.
    async fn subscribe(&self, subject: &str) -> Result<Subscription>;

    /// Publish to the durable, replayable stream.
    async fn publish_stream(&self, subject: &str, payload: Bytes) -> Result<()>;
}
