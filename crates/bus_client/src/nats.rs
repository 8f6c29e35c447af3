//! NATS-backed bus: core pub-sub for ephemeral subjects, JetStream for the
//! durable raw-memory stream.

use std::time::Duration;

use async_nats::jetstream;
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::bus::{Bus, BusMessage, Subscription};
use crate::error::{BusError, Result};
use crate::subjects::ensure_publish_subject;

/// Reconnect backoff: exponential from `base`, capped at `cap`.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    pub base: Duration,
    pub cap: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(2),
            cap: Duration::from_secs(30),
        }
    }
}

impl ReconnectConfig {
    fn delay(&self, attempts: usize) -> Duration {
        let factor = 1u32 << attempts.min(8) as u32;
        self.base.saturating_mul(factor).min(self.cap)
    }
}

/// Wrapper around the NATS client with a JetStream context for the durable
/// stream subject.
#[derive(Clone)]
pub struct NatsBus {
    client: async_nats::Client,
    jetstream: jetstream::Context,
}

impl NatsBus {
    /// Connect, failing fast when the server is unreachable (strict startup).
    pub async fn connect(url: &str) -> Result<Self> {
        info!("connecting to bus at {}", url);
        let client = Self::options(ReconnectConfig::default()).connect(url).await?;
        Ok(Self::from_client(client))
    }

    /// Connect in degraded mode: returns immediately and keeps retrying the
    /// initial connection with backoff. Publishes fail fast until connected.
    pub async fn connect_lenient(url: &str, reconnect: ReconnectConfig) -> Result<Self> {
        info!("connecting to bus at {} (lenient)", url);
        let client = Self::options(reconnect)
            .retry_on_initial_connect()
            .connect(url)
            .await?;
        Ok(Self::from_client(client))
    }

    fn options(reconnect: ReconnectConfig) -> async_nats::ConnectOptions {
        async_nats::ConnectOptions::new()
            .reconnect_delay_callback(move |attempts| reconnect.delay(attempts))
    }

    fn from_client(client: async_nats::Client) -> Self {
        let jetstream = jetstream::new(client.clone());
        Self { client, jetstream }
    }

    fn ensure_connected(&self) -> Result<()> {
        match self.client.connection_state() {
            async_nats::connection::State::Connected => Ok(()),
            state => Err(BusError::Unavailable(format!("not connected: {:?}", state))),
        }
    }
}

#[async_trait]
impl Bus for NatsBus {
    async fn publish(&self, subject: &str, payload: Bytes) -> Result<()> {
        ensure_publish_subject(subject)?;
        self.ensure_connected()?;
        self.client.publish(subject.to_string(), payload).await?;
        Ok(())
    }

    async fn publish_with_headers(
        &self,
        subject: &str,
        headers: &[(String, String)],
        payload: Bytes,
    ) -> Result<()> {
        ensure_publish_subject(subject)?;
        self.ensure_connected()?;
        let mut map = async_nats::HeaderMap::new();
        for (name, value) in headers {
            map.insert(name.as_str(), value.as_str());
        }
        self.client
            .publish_with_headers(subject.to_string(), map, payload)
            .await?;
        Ok(())
    }

    async fn subscribe(&self, subject: &str) -> Result<Subscription> {
        debug!("subscribing to {}", subject);
        let mut subscriber = self.client.subscribe(subject.to_string()).await?;
        let (tx, rx) = mpsc::unbounded_channel();

        // Pump task: dropping the Subscription aborts it, which drops the
        // inner subscriber and sends the UNSUB.
        let pump = tokio::spawn(async move {
            while let Some(msg) = subscriber.next().await {
                let headers = msg.headers.as_ref().map(flatten_headers).unwrap_or_default();
                let delivered = tx.send(BusMessage {
                    subject: msg.subject.to_string(),
                    payload: msg.payload,
                    headers,
                });
                if delivered.is_err() {
                    break;
                }
            }
        });

        Ok(Subscription::new(rx, Some(pump)))
    }

    async fn publish_stream(&self, subject: &str, payload: Bytes) -> Result<()> {
        ensure_publish_subject(subject)?;
        self.ensure_connected()?;
        self.jetstream
            .publish(subject.to_string(), payload)
            .await
            .map_err(|e| BusError::Stream(e.to_string()))?
            .await
            .map_err(|e| BusError::Stream(e.to_string()))?;
        Ok(())
    }
}

fn flatten_headers(map: &async_nats::HeaderMap) -> Vec<(String, String)> {
    map.iter()
        .flat_map(|(name, values)| {
            values
                .iter()
                .map(move |value| (name.to_string(), value.to_string()))
        })
        .collect()
}
