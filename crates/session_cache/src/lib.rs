//! Session cache: per-conversation hot message buffers and per-user
//! key/value preferences.
//!
//! The [`SessionStore`] trait is the seam the dispatcher and the HTTP edge
//! depend on; [`RedisSessionCache`] is the production implementation and
//! [`MemorySessionCache`] backs tests and degraded local runs. Cache
//! failures are surfaced to the caller, who decides whether they are fatal
//! (the dispatcher treats them as warnings).

pub mod entry;
pub mod error;
pub mod keys;
pub mod memory;
pub mod redis_store;
pub mod store;

pub use entry::{HotBufferEntry, MessageRole};
pub use error::{CacheError, Result};
pub use memory::MemorySessionCache;
pub use redis_store::RedisSessionCache;
pub use store::{CacheConfig, SessionStore};
