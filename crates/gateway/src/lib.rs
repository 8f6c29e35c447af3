//! LLM chat gateway: a request-reply streaming dispatcher over a pub-sub
//! bus with an authenticated WebSocket edge.
//!
//! ```text
//! client ──ws frame──▶ edge ──admit──▶ dispatcher ──publish──▶ chat.request
//!                                          │
//!                           worker streams resp.<ticket>
//!                                          │
//! client ◀──ws frames── edge ◀──sink── relay loop
//! ```
//!
//! In parallel, every exchange is mirrored to the session-cache hot buffer
//! and, on completion, published once to the durable raw-memory stream for
//! the memory worker.
//!
//! ## Ordering and delivery
//!
//! - Per ticket, chunks reach the client in bus arrival order with strictly
//!   ascending sequence numbers; the dispatcher never reorders.
//! - Distinct conversations on one socket interleave freely; the registry
//!   refuses overlapping dispatches for the same (owner, conversation).
//! - Ephemeral delivery is at-most-once; the raw-memory stream is
//!   at-least-once and its consumers are idempotent.

pub mod api;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod protocol;
pub mod sink;
pub mod ticket;
pub mod ws_server;

pub use api::api_router;
pub use config::{Config, ConfigError};
pub use dispatcher::{ActiveDispatch, DispatchOutcome, Dispatcher, DispatcherConfig};
pub use error::{GatewayError, Result};
pub use protocol::{ChatRequest, Chunk, ChunkFrame, InboundChatFrame, RawMemoryRecord};
pub use sink::{ChunkSink, NullSink, WsSink};
pub use ticket::{ConnectionId, StreamTicket, TicketRegistry};
pub use ws_server::{ws_router, AppState};
