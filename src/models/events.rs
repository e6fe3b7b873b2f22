//! Connection lifecycle events for logging and metrics.

use crate::current_timestamp_millis;
use uuid::Uuid;

/// Shared event metadata.
#[derive(Debug, Clone)]
pub struct EventMeta {
    /// Unique identifier for this event.
    pub event_id: String,
    /// Event source component.
    pub source: &'static str,
    /// Timestamp (Unix epoch milliseconds).
    pub timestamp: u64,
}

impl EventMeta {
    /// Creates new event metadata using the current timestamp.
    #[must_use]
    pub fn new(source: &'static str) -> Self {
        Self {
            event_id: Uuid::new_v4().to_string(),
            source,
            timestamp: current_timestamp_millis(),
        }
    }
}

/// Events emitted by the connection manager.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// A connection was established and answered a probe.
    Connected {
        /// Event metadata.
        meta: EventMeta,
    },
    /// The store stopped answering.
    Disconnected {
        /// Event metadata.
        meta: EventMeta,
        /// Why the connection was considered lost.
        reason: String,
    },
    /// A background reconnection attempt failed.
    ReconnectFailed {
        /// Event metadata.
        meta: EventMeta,
        /// 1-based attempt number.
        attempt: u32,
        /// The failure reported by the store.
        reason: String,
    },
    /// The retry bound was exceeded; reconnection stopped.
    Exhausted {
        /// Event metadata.
        meta: EventMeta,
        /// Number of attempts made.
        attempts: u32,
    },
    /// Reconnection was re-armed by an explicit reset.
    Reset {
        /// Event metadata.
        meta: EventMeta,
    },
}

impl ConnectionEvent {
    /// Returns the event type as a string.
    #[must_use]
    pub const fn event_type(&self) -> &'static str {
        match self {
            Self::Connected { .. } => "connected",
            Self::Disconnected { .. } => "disconnected",
            Self::ReconnectFailed { .. } => "reconnect_failed",
            Self::Exhausted { .. } => "exhausted",
            Self::Reset { .. } => "reset",
        }
    }

    /// Returns the event metadata.
    #[must_use]
    pub const fn meta(&self) -> &EventMeta {
        match self {
            Self::Connected { meta }
            | Self::Disconnected { meta, .. }
            | Self::ReconnectFailed { meta, .. }
            | Self::Exhausted { meta, .. }
            | Self::Reset { meta } => meta,
        }
    }
}
