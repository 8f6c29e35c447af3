//! The streaming dispatcher: accepts a chat request, fans it out to exactly
//! one worker over the bus, and relays the chunk stream back through the
//! caller's sink while mirroring state to the session cache and the durable
//! raw-memory stream.
//!
//! Each dispatch subscribes to its fresh reply subject *before* publishing
//! the request, so the first worker chunk cannot be lost, then drives a
//! single relay loop with two timers (idle-between-chunks and total
//! lifetime) and a cooperative cancel signal.

use std::sync::Arc;
use std::time::Duration;

use bus_client::Bus;
use bytes::Bytes;
use chrono::Utc;
use metrics::{counter, gauge};
use session_cache::{HotBufferEntry, MessageRole, SessionStore};
use tokio::time::{sleep, sleep_until, Instant};
use tracing::{debug, info, warn};

use crate::error::{GatewayError, Result};
use crate::protocol::{
    ChatRequest, Chunk, ChunkFrame, RawMemoryRecord, RequestEnvelope, ACK_HEADER, ERROR_HEADER,
    REPLY_HEADER,
};
use crate::sink::ChunkSink;
use crate::ticket::{ConnectionId, StreamTicket, TicketRegistry};

/// Dispatcher subjects and timers.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Well-known subject the workers consume.
    pub request_subject: String,
    /// Durable stream subject for the memory worker.
    pub raw_memory_subject: String,
    /// Maximum silence between chunks before the ticket fails.
    pub idle_chunk_timeout: Duration,
    /// Maximum total ticket lifetime.
    pub total_ticket_timeout: Duration,
    /// How long a cancelled ticket keeps draining for its terminal chunk.
    pub drain_timeout: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            request_subject: "chat.request".to_string(),
            raw_memory_subject: "memory.raw".to_string(),
            idle_chunk_timeout: Duration::from_secs(120),
            total_ticket_timeout: Duration::from_secs(600),
            drain_timeout: Duration::from_secs(10),
        }
    }
}

/// How a relay finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Terminal chunk relayed; one raw-memory record published.
    Completed,
    /// Client went away; the stream was drained without further delivery.
    Cancelled,
    /// A ticket timer fired; the sink received a terminal error chunk.
    TimedOut,
    /// The worker reported an error envelope or its stream vanished.
    WorkerError,
}

/// An admitted dispatch: ticket registered, reply subscriptions live,
/// request published and mirrored. Must be driven by [`Dispatcher::relay`].
#[derive(Debug)]
pub struct ActiveDispatch {
    ticket: Arc<StreamTicket>,
    replies: bus_client::Subscription,
    acks: bus_client::Subscription,
    envelope: RequestEnvelope,
    started: Instant,
    requested_at_ms: i64,
}

impl ActiveDispatch {
    pub fn ticket_id(&self) -> &str {
        &self.ticket.ticket_id
    }
}

/// The protocol engine shared by the WebSocket edge and the HTTP enqueue
/// surface.
pub struct Dispatcher {
    bus: Arc<dyn Bus>,
    cache: Arc<dyn SessionStore>,
    registry: TicketRegistry,
    config: DispatcherConfig,
}

impl Dispatcher {
    pub fn new(bus: Arc<dyn Bus>, cache: Arc<dyn SessionStore>, config: DispatcherConfig) -> Self {
        Self {
            bus,
            cache,
            registry: TicketRegistry::new(),
            config,
        }
    }

    pub fn registry(&self) -> &TicketRegistry {
        &self.registry
    }

    /// Cancel every in-flight ticket belonging to a closed connection. Each
    /// ticket finishes its drain phase before releasing its subscriptions.
    pub fn cancel_connection(&self, connection: ConnectionId) {
        self.registry.cancel_connection(connection);
    }

    /// Full dispatch: admission through relay.
    pub async fn dispatch(
        &self,
        identity: &auth::Identity,
        request: ChatRequest,
        connection: Option<ConnectionId>,
        sink: &dyn ChunkSink,
    ) -> Result<DispatchOutcome> {
        let active = self.begin(identity, request, connection).await?;
        Ok(self.relay(active, sink).await)
    }

    /// Admission, ticket allocation, subscribe-first, request publish, and
    /// the hot-buffer / raw-memory mirrors. A failed request publish rolls
    /// the admission back so a retry is not refused with `Conflict`.
    pub async fn begin(
        &self,
        identity: &auth::Identity,
        request: ChatRequest,
        connection: Option<ConnectionId>,
    ) -> Result<ActiveDispatch> {
        if request.text.trim().is_empty() {
            return Err(GatewayError::BadRequest("empty message".to_string()));
        }
        if request.conversation_id.trim().is_empty() {
            return Err(GatewayError::BadRequest("missing room_id".to_string()));
        }
        let owner = match &request.owner {
            Some(owner) if owner != &identity.subject => {
                return Err(GatewayError::BadRequest("owner mismatch".to_string()));
            }
            _ => identity.subject.clone(),
        };

        let ticket = self
            .registry
            .admit(&owner, &request.conversation_id, connection)
            .ok_or(GatewayError::Conflict)?;

        // Subscribe before publishing so no chunk can slip past us.
        let replies = match self.bus.subscribe(&ticket.reply_subject).await {
            Ok(sub) => sub,
            Err(e) => {
                self.registry.retire(&ticket);
                return Err(GatewayError::Unavailable(e));
            }
        };
        let acks = match self.bus.subscribe(&ticket.ack_subject).await {
            Ok(sub) => sub,
            Err(e) => {
                self.registry.retire(&ticket);
                return Err(GatewayError::Unavailable(e));
            }
        };

        let envelope = RequestEnvelope {
            conversation_id: request.conversation_id.clone(),
            text: request.text.clone(),
            model_id: request.model_id.clone(),
            owner,
            ticket_id: ticket.ticket_id.clone(),
        };
        let payload = match serde_json::to_vec(&envelope) {
            Ok(payload) => Bytes::from(payload),
            Err(e) => {
                self.registry.retire(&ticket);
                return Err(GatewayError::Internal(e.to_string()));
            }
        };

        let headers = [
            (REPLY_HEADER.to_string(), ticket.reply_subject.clone()),
            (ACK_HEADER.to_string(), ticket.ack_subject.clone()),
        ];
        if let Err(e) = self
            .bus
            .publish_with_headers(&self.config.request_subject, &headers, payload.clone())
            .await
        {
            self.registry.retire(&ticket);
            return Err(GatewayError::Unavailable(e));
        }

        counter!("gateway_dispatches_total").increment(1);
        gauge!("gateway_active_tickets").set(self.registry.active_count() as f64);
        info!(
            ticket = %ticket.ticket_id,
            conversation = %envelope.conversation_id,
            owner = %envelope.owner,
            "dispatch admitted"
        );

        // Mirrors are best-effort: a degraded cache or stream never blocks
        // the relay path.
        let user_entry =
            HotBufferEntry::new(&envelope.conversation_id, MessageRole::User, &envelope.text);
        if let Err(e) = self
            .cache
            .append_message(&envelope.conversation_id, &user_entry)
            .await
        {
            warn!(ticket = %ticket.ticket_id, "hot-buffer append failed: {}", e);
        }
        if let Err(e) = self
            .bus
            .publish_stream(&self.config.raw_memory_subject, payload)
            .await
        {
            warn!(ticket = %ticket.ticket_id, "raw-memory mirror failed: {}", e);
        }

        Ok(ActiveDispatch {
            ticket,
            replies,
            acks,
            envelope,
            started: Instant::now(),
            requested_at_ms: Utc::now().timestamp_millis(),
        })
    }

    /// Drive the relay loop until the stream terminates, a timer fires, or
    /// the client goes away. Chunks are forwarded in bus arrival order; the
    /// dispatcher never reorders.
    pub async fn relay(&self, active: ActiveDispatch, sink: &dyn ChunkSink) -> DispatchOutcome {
        let ActiveDispatch {
            ticket,
            mut replies,
            acks,
            envelope,
            started,
            requested_at_ms,
        } = active;

        let mut cancel = ticket.cancel_signal();
        let mut sequence: u64 = 0;
        let mut response = String::new();

        let idle = sleep(self.config.idle_chunk_timeout);
        tokio::pin!(idle);
        let total = sleep_until(started + self.config.total_ticket_timeout);
        tokio::pin!(total);
        let drain = sleep(self.config.drain_timeout);
        tokio::pin!(drain);

        let mut draining = ticket.is_cancelled();
        if draining {
            drain
                .as_mut()
                .reset(Instant::now() + self.config.drain_timeout);
        }

        let outcome = loop {
            tokio::select! {
                biased;

                _ = cancel.changed(), if !draining => {
                    debug!(ticket = %ticket.ticket_id, "cancelled, draining");
                    draining = true;
                    drain.as_mut().reset(Instant::now() + self.config.drain_timeout);
                }

                _ = &mut drain, if draining => {
                    debug!(ticket = %ticket.ticket_id, "drain deadline, forcing unsubscribe");
                    break DispatchOutcome::Cancelled;
                }

                maybe = replies.next() => {
                    let Some(msg) = maybe else {
                        warn!(ticket = %ticket.ticket_id, "reply subscription ended unexpectedly");
                        if !draining {
                            sink.deliver(&error_chunk(&ticket, sequence, "unavailable")).await;
                        }
                        break DispatchOutcome::WorkerError;
                    };
                    idle.as_mut().reset(Instant::now() + self.config.idle_chunk_timeout);

                    let flagged_error = msg
                        .header(ERROR_HEADER)
                        .map(|v| v.eq_ignore_ascii_case("true"))
                        .unwrap_or(false);
                    let mut frame: ChunkFrame = match serde_json::from_slice(&msg.payload) {
                        Ok(frame) => frame,
                        Err(e) => {
                            // At-most-once delivery: a garbled chunk is a gap.
                            warn!(ticket = %ticket.ticket_id, "undecodable chunk dropped: {}", e);
                            continue;
                        }
                    };
                    if flagged_error && frame.error.is_none() {
                        frame.error = Some("worker error".to_string());
                    }

                    let failed = frame.error.is_some();
                    let terminal = frame.is_terminal();
                    frame.id = Some(ticket.ticket_id.clone());
                    if !failed {
                        response.push_str(&frame.delta_text());
                    }

                    let chunk = Chunk {
                        ticket_id: ticket.ticket_id.clone(),
                        sequence,
                        terminal,
                        frame,
                    };
                    sequence += 1;
                    counter!("gateway_chunks_relayed_total").increment(1);

                    if !draining && !sink.deliver(&chunk).await {
                        debug!(ticket = %ticket.ticket_id, "sink closed, draining");
                        ticket.cancel();
                        draining = true;
                        drain.as_mut().reset(Instant::now() + self.config.drain_timeout);
                    }

                    if terminal {
                        if draining {
                            // The worker finished anyway; keep the hot buffer
                            // consistent but publish no memory record.
                            if !failed && !response.is_empty() {
                                self.append_assistant(&envelope, &response).await;
                            }
                            break DispatchOutcome::Cancelled;
                        }
                        if failed {
                            counter!("gateway_worker_errors_total").increment(1);
                            break DispatchOutcome::WorkerError;
                        }
                        self.append_assistant(&envelope, &response).await;
                        self.publish_record(&envelope, &response, requested_at_ms).await;
                        break DispatchOutcome::Completed;
                    }
                }

                _ = &mut idle, if !draining => {
                    warn!(ticket = %ticket.ticket_id, "idle chunk timeout");
                    counter!("gateway_ticket_timeouts_total").increment(1);
                    sink.deliver(&error_chunk(&ticket, sequence, "timeout")).await;
                    break DispatchOutcome::TimedOut;
                }

                _ = &mut total, if !draining => {
                    warn!(ticket = %ticket.ticket_id, "total ticket timeout");
                    counter!("gateway_ticket_timeouts_total").increment(1);
                    sink.deliver(&error_chunk(&ticket, sequence, "timeout")).await;
                    break DispatchOutcome::TimedOut;
                }
            }
        };

        replies.unsubscribe();
        acks.unsubscribe();
        self.registry.retire(&ticket);
        gauge!("gateway_active_tickets").set(self.registry.active_count() as f64);
        info!(ticket = %ticket.ticket_id, outcome = ?outcome, chunks = sequence, "ticket retired");

        outcome
    }

    async fn append_assistant(&self, envelope: &RequestEnvelope, response: &str) {
        let entry = HotBufferEntry::new(
            &envelope.conversation_id,
            MessageRole::Assistant,
            response,
        );
        if let Err(e) = self
            .cache
            .append_message(&envelope.conversation_id, &entry)
            .await
        {
            warn!(
                conversation = %envelope.conversation_id,
                "hot-buffer append failed: {}", e
            );
        }
    }

    async fn publish_record(
        &self,
        envelope: &RequestEnvelope,
        response: &str,
        requested_at_ms: i64,
    ) {
        let record = RawMemoryRecord {
            conversation_id: envelope.conversation_id.clone(),
            owner: envelope.owner.clone(),
            request_text: envelope.text.clone(),
            response_text: response.to_string(),
            model_id: envelope.model_id.clone(),
            requested_at_ms,
            completed_at_ms: Utc::now().timestamp_millis(),
        };
        match serde_json::to_vec(&record) {
            Ok(payload) => {
                if let Err(e) = self
                    .bus
                    .publish_stream(&self.config.raw_memory_subject, Bytes::from(payload))
                    .await
                {
                    warn!(
                        conversation = %envelope.conversation_id,
                        "raw-memory record publish failed: {}", e
                    );
                }
            }
            Err(e) => warn!("raw-memory record serialization failed: {}", e),
        }
    }
}

fn error_chunk(ticket: &StreamTicket, sequence: u64, reason: &str) -> Chunk {
    let mut frame = ChunkFrame::terminal_error(reason);
    frame.id = Some(ticket.ticket_id.clone());
    Chunk {
        ticket_id: ticket.ticket_id.clone(),
        sequence,
        terminal: true,
        frame,
    }
}
