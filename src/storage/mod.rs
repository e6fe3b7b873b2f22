//! Storage layer.
//!
//! - [`KeyValueStore`]: the command surface every backend implements
//! - [`RedisStore`]: the production backend
//! - [`MemoryStore`]: an in-process backend for tests and local runs
//! - [`ConnectionManager`]: health caching and background reconnection

// Allow significant_drop_tightening - guards are held for a single statement.
#![allow(clippy::significant_drop_tightening)]

mod connection;
mod memory;
mod redis;
mod traits;

pub use connection::{ConnectionManager, ConnectionState, ReconnectPolicy};
pub use memory::MemoryStore;
pub use redis::RedisStore;
pub use traits::{IndexedWrite, KeyValueStore};
