//! Key-value store trait.

use crate::Result;
use std::collections::HashMap;
use std::future::Future;

/// A hash write paired with its ordering-index entry.
///
/// Implementations must apply both halves as one unit: either the hash and
/// the sorted-set member both become visible, or neither does.
#[derive(Debug, Clone, Copy)]
pub struct IndexedWrite<'a> {
    /// Key of the hash to write.
    pub key: &'a str,
    /// Field/value pairs stored in the hash.
    pub fields: &'a [(String, String)],
    /// Key of the sorted set.
    pub index_key: &'a str,
    /// Member added to the sorted set.
    pub member: &'a str,
    /// Score of the member.
    pub score: f64,
}

/// Trait for key-value store backends.
///
/// This is the only way the rest of the crate reaches the store. It covers
/// the transport lifecycle (`is_open`, `connect`, `disconnect`, `ping`) and
/// the handful of hash and sorted-set commands the record store needs.
///
/// Connection-level failures must be reported as
/// [`Error::StoreUnavailable`](crate::Error::StoreUnavailable) so that the
/// connection manager can tell them apart from other failures.
pub trait KeyValueStore: Send + Sync + 'static {
    /// Returns a short backend name for logs and metrics.
    fn name(&self) -> &'static str;

    /// Returns `true` if a transport is currently established.
    fn is_open(&self) -> bool;

    /// Establishes the transport, replacing any existing one.
    fn connect(&self) -> impl Future<Output = Result<()>> + Send;

    /// Drops the transport. Never fails.
    fn disconnect(&self) -> impl Future<Output = ()> + Send;

    /// Sends a liveness probe.
    fn ping(&self) -> impl Future<Output = Result<()>> + Send;

    /// Writes a hash and its ordering-index entry atomically.
    fn write_indexed(&self, write: IndexedWrite<'_>) -> impl Future<Output = Result<()>> + Send;

    /// Reads all fields of a hash; an absent key yields an empty map.
    fn read_hash(&self, key: &str)
    -> impl Future<Output = Result<HashMap<String, String>>> + Send;

    /// Returns `true` if the key exists.
    fn key_exists(&self, key: &str) -> impl Future<Output = Result<bool>> + Send;

    /// Returns every member of a sorted set with its score, ascending by score.
    fn sorted_members(&self, key: &str) -> impl Future<Output = Result<Vec<(String, f64)>>> + Send;

    /// Returns the number of members in a sorted set; an absent key yields 0.
    fn sorted_len(&self, key: &str) -> impl Future<Output = Result<usize>> + Send;

    /// Removes members from a sorted set, returning how many were removed.
    fn sorted_remove(
        &self,
        key: &str,
        members: &[String],
    ) -> impl Future<Output = Result<usize>> + Send;
}
