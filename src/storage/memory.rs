//! In-process key-value store.
//!
//! Mirrors the subset of Redis semantics the record store relies on: hashes,
//! sorted sets ordered by score then member, and `MULTI`-style paired writes.
//! It can be switched "offline" to exercise connection handling, and counts
//! connect and probe calls so tests can assert on round trips.

use super::traits::{IndexedWrite, KeyValueStore};
use crate::{Error, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

#[derive(Debug, Default)]
struct State {
    open: bool,
    hashes: HashMap<String, HashMap<String, String>>,
    sorted_sets: HashMap<String, HashMap<String, f64>>,
    read_delays: HashMap<String, Duration>,
    ping_delay: Option<Duration>,
}

/// In-memory [`KeyValueStore`].
#[derive(Debug)]
pub struct MemoryStore {
    state: Mutex<State>,
    available: AtomicBool,
    connects: AtomicUsize,
    pings: AtomicUsize,
}

impl MemoryStore {
    /// Creates an empty, reachable store that is not yet connected.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            available: AtomicBool::new(true),
            connects: AtomicUsize::new(0),
            pings: AtomicUsize::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Makes the store reachable or unreachable.
    ///
    /// Going offline also drops the open transport, like a server restart.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
        if !available {
            self.lock().open = false;
        }
    }

    /// Drops the open transport without making the store unreachable.
    pub fn drop_connection(&self) {
        self.lock().open = false;
    }

    /// Returns how many connect attempts were made.
    #[must_use]
    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Returns how many probes were sent.
    #[must_use]
    pub fn ping_count(&self) -> usize {
        self.pings.load(Ordering::SeqCst)
    }

    /// Deletes a key of any type, bypassing the connection checks.
    pub fn delete_key(&self, key: &str) -> bool {
        let mut state = self.lock();
        let hash = state.hashes.remove(key).is_some();
        let set = state.sorted_sets.remove(key).is_some();
        hash || set
    }

    /// Removes one hash field, bypassing the connection checks.
    pub fn remove_hash_field(&self, key: &str, field: &str) -> bool {
        self.lock()
            .hashes
            .get_mut(key)
            .is_some_and(|hash| hash.remove(field).is_some())
    }

    /// Delays every read of `key` by `delay`.
    pub fn set_read_delay(&self, key: impl Into<String>, delay: Duration) {
        self.lock().read_delays.insert(key.into(), delay);
    }

    /// Delays every probe reply by `delay`.
    ///
    /// The outcome is decided when the probe is sent, so a reply already in
    /// flight still succeeds if the store goes offline during the delay.
    pub fn set_ping_delay(&self, delay: Duration) {
        self.lock().ping_delay = Some(delay);
    }

    /// Returns every key currently stored, sorted.
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        let state = self.lock();
        let mut keys: Vec<String> = state
            .hashes
            .keys()
            .chain(state.sorted_sets.keys())
            .cloned()
            .collect();
        keys.sort();
        keys
    }

    fn check_open(&self, state: &State) -> Result<()> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(Error::StoreUnavailable("connection refused".to_string()));
        }
        if !state.open {
            return Err(Error::StoreUnavailable("connection is closed".to_string()));
        }
        Ok(())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyValueStore for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn is_open(&self) -> bool {
        self.lock().open
    }

    async fn connect(&self) -> Result<()> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if !self.available.load(Ordering::SeqCst) {
            return Err(Error::StoreUnavailable("connection refused".to_string()));
        }
        self.lock().open = true;
        Ok(())
    }

    async fn disconnect(&self) {
        self.lock().open = false;
    }

    async fn ping(&self) -> Result<()> {
        self.pings.fetch_add(1, Ordering::SeqCst);
        let (outcome, delay) = {
            let state = self.lock();
            (self.check_open(&state), state.ping_delay)
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        outcome
    }

    async fn write_indexed(&self, write: IndexedWrite<'_>) -> Result<()> {
        let mut state = self.lock();
        self.check_open(&state)?;
        let hash = state.hashes.entry(write.key.to_string()).or_default();
        for (field, value) in write.fields {
            hash.insert(field.clone(), value.clone());
        }
        state
            .sorted_sets
            .entry(write.index_key.to_string())
            .or_default()
            .insert(write.member.to_string(), write.score);
        Ok(())
    }

    async fn read_hash(&self, key: &str) -> Result<HashMap<String, String>> {
        let delay = {
            let state = self.lock();
            self.check_open(&state)?;
            state.read_delays.get(key).copied()
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let state = self.lock();
        self.check_open(&state)?;
        Ok(state.hashes.get(key).cloned().unwrap_or_default())
    }

    async fn key_exists(&self, key: &str) -> Result<bool> {
        let state = self.lock();
        self.check_open(&state)?;
        Ok(state.hashes.contains_key(key) || state.sorted_sets.contains_key(key))
    }

    async fn sorted_members(&self, key: &str) -> Result<Vec<(String, f64)>> {
        let state = self.lock();
        self.check_open(&state)?;
        let mut members: Vec<(String, f64)> = state
            .sorted_sets
            .get(key)
            .map(|set| set.iter().map(|(m, s)| (m.clone(), *s)).collect())
            .unwrap_or_default();
        members.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        Ok(members)
    }

    async fn sorted_len(&self, key: &str) -> Result<usize> {
        let state = self.lock();
        self.check_open(&state)?;
        Ok(state.sorted_sets.get(key).map_or(0, HashMap::len))
    }

    async fn sorted_remove(&self, key: &str, members: &[String]) -> Result<usize> {
        let mut state = self.lock();
        self.check_open(&state)?;
        let Some(set) = state.sorted_sets.get_mut(key) else {
            return Ok(0);
        };
        let removed = members.iter().filter(|m| set.remove(*m).is_some()).count();
        if set.is_empty() {
            state.sorted_sets.remove(key);
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[tokio::test]
    async fn test_commands_require_connection() {
        let store = MemoryStore::new();
        assert!(!store.is_open());
        let err = store.read_hash("Book:1").await.unwrap_err();
        assert!(err.is_unavailable());

        store.connect().await.unwrap();
        assert!(store.is_open());
        assert!(store.read_hash("Book:1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_offline_store_refuses_connect_and_ping() {
        let store = MemoryStore::new();
        store.connect().await.unwrap();
        store.set_available(false);
        assert!(!store.is_open());
        assert!(store.connect().await.is_err());
        assert!(store.ping().await.is_err());
        assert_eq!(store.connect_count(), 2);
        assert_eq!(store.ping_count(), 1);
    }

    #[tokio::test]
    async fn test_sorted_members_ascend_by_score_then_member() {
        let store = MemoryStore::new();
        store.connect().await.unwrap();
        for (member, score) in [("c", 3.0), ("a", 1.0), ("b2", 2.0), ("b1", 2.0)] {
            store
                .write_indexed(IndexedWrite {
                    key: &format!("Book:{member}"),
                    fields: &fields(&[("title", member)]),
                    index_key: "books",
                    member,
                    score,
                })
                .await
                .unwrap();
        }
        let members: Vec<String> = store
            .sorted_members("books")
            .await
            .unwrap()
            .into_iter()
            .map(|(m, _)| m)
            .collect();
        assert_eq!(members, vec!["a", "b1", "b2", "c"]);
        assert_eq!(store.sorted_len("books").await.unwrap(), 4);
        assert_eq!(store.sorted_len("absent").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_sorted_remove_counts_only_present_members() {
        let store = MemoryStore::new();
        store.connect().await.unwrap();
        store
            .write_indexed(IndexedWrite {
                key: "Book:1",
                fields: &fields(&[("title", "x")]),
                index_key: "books",
                member: "1",
                score: 1.0,
            })
            .await
            .unwrap();
        let removed = store
            .sorted_remove("books", &["1".to_string(), "2".to_string()])
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.sorted_len("books").await.unwrap(), 0);
        assert!(!store.key_exists("books").await.unwrap());
        assert!(store.key_exists("Book:1").await.unwrap());
    }
}
