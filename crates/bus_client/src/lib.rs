//! Pub-sub bus access for the chat gateway.
//!
//! Wraps the NATS client behind the [`Bus`] trait so the dispatcher can run
//! against the real bus or the in-process [`MemoryBus`] in tests and
//! degraded local setups. Ephemeral subjects are at-most-once; the durable
//! stream (`publish_stream`) is at-least-once and consumers must be
//! idempotent.

pub mod bus;
pub mod error;
pub mod memory;
pub mod nats;
pub mod subjects;

pub use bus::{Bus, BusMessage, Subscription};
pub use error::{BusError, Result};
pub use memory::MemoryBus;
pub use nats::{NatsBus, ReconnectConfig};
