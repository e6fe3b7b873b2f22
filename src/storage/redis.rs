//! Redis key-value store.
//!
//! Uses a single multiplexed async connection shared by every request. The
//! connection is cached in a `Mutex<Option<_>>` and cloned per command; it is
//! dropped whenever a command fails at the connection level, so the next
//! `connect` starts fresh.
//!
//! # Command Timeout
//!
//! Every connect and command is bounded by the configured timeout (5 seconds
//! by default). A timeout is treated as a connection failure.

use super::traits::{IndexedWrite, KeyValueStore};
use crate::config::StoreConfig;
use crate::{Error, Result};
use redis::aio::MultiplexedConnection;
use redis::{Client, RedisError, RedisResult};
use secrecy::{ExposeSecret, SecretString};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

/// Default timeout for Redis operations.
const REDIS_TIMEOUT: Duration = Duration::from_secs(5);

/// Redis-backed [`KeyValueStore`].
pub struct RedisStore {
    /// Redis client (holds the parsed connection info, no socket).
    client: Client,
    /// Cached connection for reuse.
    connection: Mutex<Option<MultiplexedConnection>>,
    /// Per-command timeout.
    timeout: Duration,
}

impl RedisStore {
    /// Creates a store for the given URL. Does not connect.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL cannot be parsed.
    pub fn new(connection_url: &SecretString, timeout: Duration) -> Result<Self> {
        let client =
            Client::open(connection_url.expose_secret()).map_err(|e| Error::OperationFailed {
                operation: "redis_open".to_string(),
                cause: e.to_string(),
            })?;

        Ok(Self {
            client,
            connection: Mutex::new(None),
            timeout,
        })
    }

    /// Creates a store from configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the configured URL cannot be parsed.
    pub fn from_config(config: &StoreConfig) -> Result<Self> {
        Self::new(&config.connection_url(), config.timeout)
    }

    /// Creates a store for `redis://localhost:6379` with the default timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL cannot be parsed.
    pub fn with_defaults() -> Result<Self> {
        Self::new(
            &SecretString::from("redis://localhost:6379/".to_string()),
            REDIS_TIMEOUT,
        )
    }

    fn cached_connection(&self) -> Result<MultiplexedConnection> {
        self.connection
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| Error::StoreUnavailable("redis connection is closed".to_string()))
    }

    fn invalidate(&self) {
        self.connection
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    /// Maps a Redis error, dropping the cached connection for transport failures.
    fn map_error(&self, operation: &'static str, e: &RedisError) -> Error {
        if e.is_io_error()
            || e.is_connection_dropped()
            || e.is_connection_refusal()
            || e.is_timeout()
        {
            self.invalidate();
            Error::StoreUnavailable(format!("redis {operation}: {e}"))
        } else {
            Error::OperationFailed {
                operation: format!("redis_{operation}"),
                cause: e.to_string(),
            }
        }
    }

    /// Runs one command against the cached connection under the timeout.
    async fn run<T, F, Fut>(&self, operation: &'static str, command: F) -> Result<T>
    where
        F: FnOnce(MultiplexedConnection) -> Fut,
        Fut: Future<Output = RedisResult<T>>,
    {
        let conn = self.cached_connection()?;
        match tokio::time::timeout(self.timeout, command(conn)).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(self.map_error(operation, &e)),
            Err(_) => {
                self.invalidate();
                Err(Error::StoreUnavailable(format!(
                    "redis {operation} timed out after {}ms",
                    self.timeout.as_millis()
                )))
            },
        }
    }
}

impl KeyValueStore for RedisStore {
    fn name(&self) -> &'static str {
        "redis"
    }

    fn is_open(&self) -> bool {
        self.connection
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    async fn connect(&self) -> Result<()> {
        let conn = tokio::time::timeout(
            self.timeout,
            self.client.get_multiplexed_async_connection(),
        )
        .await
        .map_err(|_| {
            Error::StoreUnavailable(format!(
                "redis connect timed out after {}ms",
                self.timeout.as_millis()
            ))
        })?
        .map_err(|e| Error::StoreUnavailable(format!("redis connect: {e}")))?;

        *self.connection.lock().unwrap_or_else(PoisonError::into_inner) = Some(conn);
        Ok(())
    }

    async fn disconnect(&self) {
        self.invalidate();
    }

    async fn ping(&self) -> Result<()> {
        let reply: String = self
            .run("ping", |mut conn| async move {
                redis::cmd("PING").query_async::<String>(&mut conn).await
            })
            .await?;
        if reply.eq_ignore_ascii_case("PONG") {
            Ok(())
        } else {
            Err(Error::StoreUnavailable(format!(
                "unexpected PING reply: {reply}"
            )))
        }
    }

    async fn write_indexed(&self, write: IndexedWrite<'_>) -> Result<()> {
        let mut pipe = redis::pipe();
        pipe.atomic().cmd("HSET").arg(write.key);
        for (field, value) in write.fields {
            pipe.arg(field).arg(value);
        }
        pipe.ignore()
            .cmd("ZADD")
            .arg(write.index_key)
            .arg(write.score)
            .arg(write.member)
            .ignore();

        self.run("write_indexed", |mut conn| async move {
            pipe.query_async::<()>(&mut conn).await
        })
        .await
    }

    async fn read_hash(&self, key: &str) -> Result<HashMap<String, String>> {
        self.run("hgetall", |mut conn| async move {
            redis::cmd("HGETALL")
                .arg(key)
                .query_async::<HashMap<String, String>>(&mut conn)
                .await
        })
        .await
    }

    async fn key_exists(&self, key: &str) -> Result<bool> {
        self.run("exists", |mut conn| async move {
            redis::cmd("EXISTS")
                .arg(key)
                .query_async::<bool>(&mut conn)
                .await
        })
        .await
    }

    async fn sorted_members(&self, key: &str) -> Result<Vec<(String, f64)>> {
        self.run("zrange", |mut conn| async move {
            redis::cmd("ZRANGE")
                .arg(key)
                .arg(0)
                .arg(-1)
                .arg("WITHSCORES")
                .query_async::<Vec<(String, f64)>>(&mut conn)
                .await
        })
        .await
    }

    async fn sorted_len(&self, key: &str) -> Result<usize> {
        self.run("zcard", |mut conn| async move {
            redis::cmd("ZCARD")
                .arg(key)
                .query_async::<usize>(&mut conn)
                .await
        })
        .await
    }

    async fn sorted_remove(&self, key: &str, members: &[String]) -> Result<usize> {
        if members.is_empty() {
            return Ok(0);
        }
        self.run("zrem", |mut conn| async move {
            redis::cmd("ZREM")
                .arg(key)
                .arg(members)
                .query_async::<usize>(&mut conn)
                .await
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_rejects_invalid_url() {
        let result = RedisStore::new(
            &SecretString::from("not a url".to_string()),
            REDIS_TIMEOUT,
        );
        assert!(matches!(result, Err(Error::OperationFailed { .. })));
    }

    #[test]
    fn test_new_does_not_connect() {
        let store = RedisStore::with_defaults().unwrap();
        assert!(!store.is_open());
    }

    #[tokio::test]
    async fn test_commands_without_connection_are_unavailable() {
        let store = RedisStore::with_defaults().unwrap();
        let err = store.read_hash("Book:1").await.unwrap_err();
        assert!(err.is_unavailable());
    }

    #[tokio::test]
    async fn test_connect_to_closed_port_is_unavailable() {
        // Port 1 is reserved and refuses connections on loopback.
        let store = RedisStore::new(
            &SecretString::from("redis://127.0.0.1:1/".to_string()),
            Duration::from_millis(500),
        )
        .unwrap();
        let err = store.connect().await.unwrap_err();
        assert!(err.is_unavailable());
        assert!(!store.is_open());
    }
}
