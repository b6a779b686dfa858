//! Message bus and key-value store contracts for arbiter.
//!
//! The engine never talks to a concrete broker or database. It is handed
//! an [`EventLog`] per topic and a [`KeyValueStore`], and this crate ships
//! in-memory implementations of both for tests and local simulation.
//!
//! # Key Types
//!
//! - [`EventLog`] - Trait for appending events and creating consumers
//! - [`EventConsumer`] - Trait for polling events with offset tracking
//! - [`InMemoryEventLog`] - Live-tailing in-memory event log
//! - [`KeyValueStore`] - Trait for TTL-bounded record storage
//! - [`InMemoryKeyValueStore`] - In-memory store with lazy expiry

pub mod error;
pub mod kv;
pub mod memory;
pub mod traits;

// Re-exports
pub use error::{Error, Result};
pub use kv::{InMemoryKeyValueStore, KeyValueStore};
pub use memory::InMemoryEventLog;
pub use traits::{EventBatch, EventConsumer, EventLog, Offset, SeekPosition};
