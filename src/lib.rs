//! # Bookshelf
//!
//! A small record-keeping service for books.
//!
//! Clients submit books over HTTP, books are persisted in a key-value store
//! (Redis in production), and the listing view rebuilds the whole collection
//! in creation order.
//!
//! ## Layout
//!
//! - [`storage`]: the [`KeyValueStore`] seam, its Redis and in-memory
//!   implementations, and the [`ConnectionManager`] that keeps the store
//!   connection healthy
//! - [`services`]: the [`BookStore`] that encodes books into hashes and keeps
//!   the ordering index
//! - [`http`]: the axum router exposing `/records`
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use bookshelf::{BookStore, ConnectionManager, NewBook, ReconnectPolicy};
//! use bookshelf::storage::MemoryStore;
//!
//! let manager = Arc::new(ConnectionManager::new(MemoryStore::new(), ReconnectPolicy::default()));
//! let books = BookStore::new(Arc::clone(&manager));
//! let id = books.create(NewBook::new("Dune", "5", "Herbert", "Desert planet.")).await?;
//! ```

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![warn(missing_docs)]
#![forbid(unsafe_code)]
#![allow(clippy::multiple_crate_versions)]

use thiserror::Error as ThisError;

pub mod config;
pub mod http;
pub mod models;
pub mod observability;
pub mod services;
pub mod storage;

pub use config::BookshelfConfig;
pub use models::{Book, BookField, BookId, BookRecord, NewBook};
pub use services::BookStore;
pub use storage::{ConnectionManager, ConnectionState, KeyValueStore, ReconnectPolicy};

/// Error type for bookshelf operations.
///
/// # Error Variant Triggers
///
/// | Variant | Raised When | HTTP |
/// |---------|-------------|------|
/// | `Validation` | A required book field is missing or empty | 400 |
/// | `StoreUnavailable` | Connect or probe failed, or reconnection is exhausted | 500 |
/// | `NotFound` | A single-record read hit an absent key | 404 |
/// | `OperationFailed` | Anything else (bad replies, config, I/O) | 500 |
#[derive(Debug, ThisError)]
pub enum Error {
    /// One or more required fields were missing or empty.
    ///
    /// Fields are always listed in the order `title, rating, author, blurb`.
    #[error("{}", validation_message(.missing))]
    Validation {
        /// The missing fields.
        missing: Vec<BookField>,
    },

    /// The store could not be reached.
    ///
    /// Connect failures and probe failures are both reported here; callers
    /// cannot tell "never connected" from "lost connection".
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    /// A requested record does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// An operation failed for an unexpected reason.
    #[error("operation '{operation}' failed: {cause}")]
    OperationFailed {
        /// The operation that failed.
        operation: String,
        /// The underlying cause.
        cause: String,
    },
}

impl Error {
    /// Returns the HTTP status code this error maps to.
    #[must_use]
    pub const fn status_code(&self) -> u16 {
        match self {
            Self::Validation { .. } => 400,
            Self::NotFound(_) => 404,
            Self::StoreUnavailable(_) | Self::OperationFailed { .. } => 500,
        }
    }

    /// Returns `true` if the error means the store connection is gone.
    #[must_use]
    pub const fn is_unavailable(&self) -> bool {
        matches!(self, Self::StoreUnavailable(_))
    }
}

fn validation_message(missing: &[BookField]) -> String {
    let names: Vec<&str> = missing.iter().map(|f| f.as_str()).collect();
    match names.as_slice() {
        [] => "all fields are required".to_string(),
        [one] => format!("missing required field: {one}"),
        many => format!("missing required fields: {}", many.join(", ")),
    }
}

/// Result type alias for bookshelf operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Returns the current Unix timestamp in milliseconds.
///
/// Falls back to 0 if the system clock is before the Unix epoch.
#[must_use]
pub fn current_timestamp_millis() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}
