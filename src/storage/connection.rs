//! Store connection lifecycle.
//!
//! The [`ConnectionManager`] owns the one store connection a process uses.
//! It keeps a cached health flag so the hot path costs a single atomic load,
//! and runs a background supervisor that reconnects after a health loss.
//!
//! # Reconnection States
//!
//! ```text
//!                 probe ok
//! +------------+ ----------> +---------+
//! | Connecting |             | Healthy |
//! +------------+ <---------- +---------+
//!       |        health loss
//!       | attempts > max
//!       v
//! +-----------+   reset()
//! | Exhausted | ----------> Connecting
//! +-----------+
//! ```
//!
//! While `Exhausted`, [`ConnectionManager::ensure_healthy`] fails at once
//! with [`Error::StoreUnavailable`] and nothing retries until
//! [`ConnectionManager::reset`] is called. An inline probe that was already
//! in flight when the cycle ran out still counts: its success moves the
//! manager to `Healthy` and re-arms the supervisor.
//!
//! The health flag and the state only change together, under the state lock.

use super::traits::KeyValueStore;
use crate::config::ReconnectConfig;
use crate::models::{ConnectionEvent, EventMeta};
use crate::observability::EventBus;
use crate::{Error, Result};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::{Notify, broadcast, watch};
use tokio::task::JoinHandle;

const EVENT_SOURCE: &str = "connection_manager";

/// Background reconnection policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Delay before each attempt.
    pub interval: Duration,
    /// Attempts made before the manager gives up.
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        ReconnectConfig::default().into()
    }
}

impl From<ReconnectConfig> for ReconnectPolicy {
    fn from(config: ReconnectConfig) -> Self {
        Self {
            interval: config.interval,
            max_attempts: config.max_attempts,
        }
    }
}

impl ReconnectPolicy {
    /// Sets the delay between attempts.
    #[must_use]
    pub const fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Sets the attempt bound.
    #[must_use]
    pub const fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }
}

/// Connection state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not (yet) healthy; `attempt` counts background attempts in this cycle.
    Connecting {
        /// Background attempts made so far in the current cycle.
        attempt: u32,
    },
    /// The last probe succeeded and no failure has been seen since.
    Healthy,
    /// The retry bound was exceeded. Terminal until [`ConnectionManager::reset`].
    Exhausted,
}

impl ConnectionState {
    /// Returns the state as a numeric value for metrics.
    ///
    /// - 0: Healthy
    /// - 1: Connecting
    /// - 2: Exhausted
    #[must_use]
    pub const fn state_value(&self) -> u8 {
        match self {
            Self::Healthy => 0,
            Self::Connecting { .. } => 1,
            Self::Exhausted => 2,
        }
    }

    /// Returns the state name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Connecting { .. } => "connecting",
            Self::Exhausted => "exhausted",
        }
    }
}

#[derive(Debug, Default)]
struct Signals {
    health_lost: Notify,
    reset: Notify,
}

/// Owns the store connection and its health.
///
/// Construct once at startup, share behind an [`Arc`], call
/// [`spawn_supervisor`](Self::spawn_supervisor) to enable background
/// reconnection, and call [`shutdown`](Self::shutdown) before exit.
pub struct ConnectionManager<S: KeyValueStore> {
    store: S,
    policy: ReconnectPolicy,
    healthy: AtomicBool,
    closed: AtomicBool,
    state: Mutex<ConnectionState>,
    signals: Arc<Signals>,
    shutdown_tx: watch::Sender<bool>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    events: EventBus,
}

impl<S: KeyValueStore> ConnectionManager<S> {
    /// Creates a manager for `store`. Does not connect.
    #[must_use]
    pub fn new(store: S, policy: ReconnectPolicy) -> Self {
        let (shutdown_tx, _rx) = watch::channel(false);
        Self {
            store,
            policy,
            healthy: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            state: Mutex::new(ConnectionState::Connecting { attempt: 0 }),
            signals: Arc::new(Signals::default()),
            shutdown_tx,
            supervisor: Mutex::new(None),
            events: EventBus::default(),
        }
    }

    /// Returns the underlying store.
    pub const fn store(&self) -> &S {
        &self.store
    }

    /// Returns the reconnection policy.
    pub const fn policy(&self) -> ReconnectPolicy {
        self.policy
    }

    /// Returns the cached health flag.
    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    /// Returns a snapshot of the state machine.
    pub fn state(&self) -> ConnectionState {
        *self.lock_state()
    }

    /// Subscribes to connection events.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    /// Returns the event bus connection events are published on.
    pub const fn events(&self) -> &EventBus {
        &self.events
    }

    fn lock_state(&self) -> MutexGuard<'_, ConnectionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record_state(&self, state: ConnectionState) {
        metrics::gauge!("store_connection_state", "backend" => self.store.name())
            .set(f64::from(state.state_value()));
    }

    /// Guarantees the store answered a probe since the last health loss.
    ///
    /// Returns immediately when the cached flag is set. Otherwise connects if
    /// the transport is closed, sends a probe, and sets the flag on success.
    /// Safe to call before every store operation.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StoreUnavailable`] if the connect or the probe fails,
    /// if reconnection is exhausted, or after [`shutdown`](Self::shutdown).
    /// The flag stays unset, so the next call repeats the full check.
    pub async fn ensure_healthy(&self) -> Result<()> {
        if self.is_healthy() {
            return Ok(());
        }
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::StoreUnavailable(
                "connection manager is shut down".to_string(),
            ));
        }
        if self.state() == ConnectionState::Exhausted {
            return Err(Error::StoreUnavailable(format!(
                "{} reconnection attempts exhausted after {} tries; manual reset required",
                self.store.name(),
                self.policy.max_attempts
            )));
        }

        match self.probe().await {
            Ok(()) => {
                self.mark_healthy();
                Ok(())
            },
            Err(e) => {
                tracing::warn!(backend = self.store.name(), error = %e, "Store health check failed");
                self.signals.health_lost.notify_one();
                Err(Error::StoreUnavailable(format!(
                    "{} is not connected, check the store server: {e}",
                    self.store.name()
                )))
            },
        }
    }

    /// Connects if needed and sends one probe.
    async fn probe(&self) -> Result<()> {
        if !self.store.is_open() {
            tracing::info!(
                backend = self.store.name(),
                "Store connection is closed, attempting to connect"
            );
            self.store.connect().await?;
        }
        self.store.ping().await
    }

    fn mark_healthy(&self) {
        let (was_healthy, was_exhausted) = {
            let mut state = self.lock_state();
            let was_exhausted = *state == ConnectionState::Exhausted;
            *state = ConnectionState::Healthy;
            (self.healthy.swap(true, Ordering::AcqRel), was_exhausted)
        };
        self.record_state(ConnectionState::Healthy);
        if was_exhausted {
            // Supervisor is parked waiting for a reset.
            self.signals.reset.notify_one();
        }
        if !was_healthy {
            tracing::info!(backend = self.store.name(), "Store connected");
            self.events.publish(ConnectionEvent::Connected {
                meta: EventMeta::new(EVENT_SOURCE),
            });
        }
    }

    /// Clears the health flag after a connection-level failure.
    fn report_health_loss(&self, reason: &str) {
        let (was_healthy, state) = {
            let mut state = self.lock_state();
            if *state == ConnectionState::Healthy {
                *state = ConnectionState::Connecting { attempt: 0 };
            }
            (self.healthy.swap(false, Ordering::AcqRel), *state)
        };
        self.record_state(state);
        if was_healthy {
            tracing::warn!(backend = self.store.name(), reason, "Store connection lost");
            self.events.publish(ConnectionEvent::Disconnected {
                meta: EventMeta::new(EVENT_SOURCE),
                reason: reason.to_string(),
            });
        }
        self.signals.health_lost.notify_one();
    }

    /// Records the start of a background attempt.
    ///
    /// Returns `false` without touching the state if the manager is healthy.
    fn begin_attempt(&self, attempt: u32) -> bool {
        {
            let mut state = self.lock_state();
            if self.healthy.load(Ordering::Acquire) {
                return false;
            }
            *state = ConnectionState::Connecting { attempt };
        }
        self.record_state(ConnectionState::Connecting { attempt });
        true
    }

    /// Ends the cycle unless a probe succeeded in the meantime.
    ///
    /// Returns `true` if the manager is now exhausted.
    fn mark_exhausted(&self, attempts: u32) -> bool {
        {
            let mut state = self.lock_state();
            if self.healthy.load(Ordering::Acquire) {
                return false;
            }
            *state = ConnectionState::Exhausted;
        }
        self.record_state(ConnectionState::Exhausted);
        tracing::error!(
            backend = self.store.name(),
            attempts,
            "Too many reconnection attempts, stopping reconnection"
        );
        self.events.publish(ConnectionEvent::Exhausted {
            meta: EventMeta::new(EVENT_SOURCE),
            attempts,
        });
        true
    }

    /// Runs one store command, recording metrics and watching for disconnects.
    ///
    /// A [`Error::StoreUnavailable`] result clears the health flag and wakes
    /// the reconnection supervisor. The error itself is returned unchanged;
    /// the command is never retried here.
    pub async fn execute<'a, T, F, Fut>(&'a self, operation: &'static str, call: F) -> Result<T>
    where
        F: FnOnce(&'a S) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let result = call(&self.store).await;
        let status = match &result {
            Ok(_) => "success",
            Err(e) if e.is_unavailable() => {
                self.report_health_loss(&e.to_string());
                "unavailable"
            },
            Err(_) => "error",
        };
        metrics::counter!(
            "store_requests_total",
            "backend" => self.store.name(),
            "operation" => operation,
            "status" => status
        )
        .increment(1);
        result
    }

    /// Re-arms reconnection after exhaustion.
    ///
    /// Returns `true` if the manager was exhausted.
    pub fn reset(&self) -> bool {
        {
            let mut state = self.lock_state();
            if *state != ConnectionState::Exhausted {
                return false;
            }
            *state = ConnectionState::Connecting { attempt: 0 };
        }
        self.record_state(ConnectionState::Connecting { attempt: 0 });
        tracing::info!(backend = self.store.name(), "Store reconnection reset");
        self.events.publish(ConnectionEvent::Reset {
            meta: EventMeta::new(EVENT_SOURCE),
        });
        self.signals.reset.notify_one();
        self.signals.health_lost.notify_one();
        true
    }

    /// Starts the background reconnection supervisor.
    ///
    /// Must be called from within a Tokio runtime. Calling it again while a
    /// supervisor is running has no effect.
    pub fn spawn_supervisor(self: &Arc<Self>) {
        let mut slot = self
            .supervisor
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if slot.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }
        let task = supervise(
            Arc::downgrade(self),
            Arc::clone(&self.signals),
            self.shutdown_tx.subscribe(),
        );
        *slot = Some(tokio::spawn(task));
    }

    /// Stops the supervisor and closes the store connection.
    ///
    /// After shutdown every [`ensure_healthy`](Self::ensure_healthy) call fails.
    pub async fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
        self.shutdown_tx.send_replace(true);
        let handle = self
            .supervisor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "Reconnection supervisor ended abnormally");
            }
        }
        self.healthy.store(false, Ordering::Release);
        self.store.disconnect().await;
        tracing::info!(backend = self.store.name(), "Store connection closed");
    }
}

/// Resolves once shutdown is requested or the manager is gone.
async fn wait_for_shutdown(rx: &mut watch::Receiver<bool>) {
    while !*rx.borrow_and_update() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}

/// Background reconnection loop.
///
/// Holds only a weak reference between steps so dropping the last manager
/// handle ends the task.
async fn supervise<S: KeyValueStore>(
    manager: Weak<ConnectionManager<S>>,
    signals: Arc<Signals>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            () = signals.health_lost.notified() => {},
            () = wait_for_shutdown(&mut shutdown) => return,
        }

        let Some(policy) = manager.upgrade().map(|m| m.policy) else {
            return;
        };

        let mut recovered = false;
        for attempt in 1..=policy.max_attempts {
            {
                let Some(m) = manager.upgrade() else { return };
                if !m.begin_attempt(attempt) {
                    recovered = true;
                    break;
                }
                tracing::warn!(
                    backend = m.store.name(),
                    attempt,
                    max_attempts = policy.max_attempts,
                    "Store connection failed, retrying in {}s",
                    policy.interval.as_secs()
                );
            }

            tokio::select! {
                () = tokio::time::sleep(policy.interval) => {},
                () = wait_for_shutdown(&mut shutdown) => return,
            }

            let Some(m) = manager.upgrade() else { return };
            if m.is_healthy() {
                recovered = true;
                break;
            }
            metrics::counter!("store_reconnect_attempts_total", "backend" => m.store.name())
                .increment(1);
            match m.probe().await {
                Ok(()) => {
                    m.mark_healthy();
                    recovered = true;
                    break;
                },
                Err(e) => {
                    m.events.publish(ConnectionEvent::ReconnectFailed {
                        meta: EventMeta::new(EVENT_SOURCE),
                        attempt,
                        reason: e.to_string(),
                    });
                },
            }
        }

        if recovered {
            continue;
        }

        {
            let Some(m) = manager.upgrade() else { return };
            if !m.mark_exhausted(policy.max_attempts) {
                continue;
            }
        }

        tokio::select! {
            () = signals.reset.notified() => {},
            () = wait_for_shutdown(&mut shutdown) => return,
        }
    }
}
