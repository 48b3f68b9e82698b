//! Redis storage backend
//!
//! Counters map to `INCRBYFLOAT`, TTLs to `PX` expiry, and the atomic
//! scripts run server-side as Lua so a state transition is one indivisible
//! step even across processes. Concurrent callers share one multiplexed
//! connection, which pipelines their commands on the wire.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};

use super::{Script, Storage, StorageError, StorageResult};

/// Remote storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteStorageConfig {
    /// Redis server URL, e.g. `redis://127.0.0.1:6379/0`.
    pub url: String,
}

impl Default for RemoteStorageConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
        }
    }
}

/// Redis-backed storage.
///
/// The connection manager transparently reconnects; failures while the
/// server is unreachable surface as retryable [`StorageError::Connection`]
/// values rather than being masked.
pub struct RemoteStorage {
    conn: ConnectionManager,
    scripts: HashMap<Script, redis::Script>,
}

const EXTEND_IF_MATCH_LUA: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    redis.call('PEXPIRE', KEYS[1], ARGV[2])
    return 1
end
return 0
"#;

const DELETE_IF_MATCH_LUA: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    redis.call('DEL', KEYS[1])
    return 1
end
return 0
"#;

impl RemoteStorage {
    /// Connect to the configured server.
    pub async fn connect(config: RemoteStorageConfig) -> StorageResult<Self> {
        let client = redis::Client::open(config.url.as_str())?;
        let conn = ConnectionManager::new(client).await?;

        let scripts = [
            Script::TokenBucketAcquire,
            Script::TokenBucketRelease,
            Script::TokenBucketPeek,
            Script::LeakyBucketAcquire,
            Script::LeakyBucketRelease,
            Script::LeakyBucketPeek,
            Script::SlidingWindowAcquire,
            Script::SlidingWindowCount,
        ]
        .into_iter()
        .map(|s| (s, redis::Script::new(s.lua())))
        .collect();

        Ok(Self { conn, scripts })
    }

    fn parse_reply(script: Script, raw: Vec<String>) -> StorageResult<Vec<f64>> {
        raw.into_iter()
            .map(|field| {
                field.parse().map_err(|_| {
                    StorageError::Script(format!("{:?}: non-numeric reply field", script))
                })
            })
            .collect()
    }
}

#[async_trait]
impl Storage for RemoteStorage {
    async fn get(&self, key: &str) -> StorageResult<Option<String>> {
        let value: Option<String> = redis::cmd("GET")
            .arg(key)
            .query_async(&mut self.conn.clone())
            .await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StorageResult<()> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(ttl.as_millis().max(1) as u64);
        }
        cmd.query_async::<_, ()>(&mut self.conn.clone()).await?;
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Option<Duration>) -> StorageResult<bool> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value).arg("NX");
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(ttl.as_millis().max(1) as u64);
        }
        let reply: Option<String> = cmd.query_async(&mut self.conn.clone()).await?;
        Ok(reply.is_some())
    }

    async fn delete(&self, key: &str) -> StorageResult<bool> {
        let removed: i64 = redis::cmd("DEL")
            .arg(key)
            .query_async(&mut self.conn.clone())
            .await?;
        Ok(removed > 0)
    }

    async fn exists(&self, key: &str) -> StorageResult<bool> {
        let found: i64 = redis::cmd("EXISTS")
            .arg(key)
            .query_async(&mut self.conn.clone())
            .await?;
        Ok(found > 0)
    }

    async fn incr(&self, key: &str, delta: f64) -> StorageResult<f64> {
        let value: f64 = redis::cmd("INCRBYFLOAT")
            .arg(key)
            .arg(delta)
            .query_async(&mut self.conn.clone())
            .await?;
        Ok(value)
    }

    async fn ttl(&self, key: &str) -> StorageResult<Option<Duration>> {
        let millis: i64 = redis::cmd("PTTL")
            .arg(key)
            .query_async(&mut self.conn.clone())
            .await?;
        if millis < 0 {
            return Ok(None);
        }
        Ok(Some(Duration::from_millis(millis as u64)))
    }

    async fn extend_if_match(&self, key: &str, value: &str, ttl: Duration) -> StorageResult<bool> {
        let extended: i64 = redis::Script::new(EXTEND_IF_MATCH_LUA)
            .key(key)
            .arg(value)
            .arg(ttl.as_millis().max(1) as u64)
            .invoke_async(&mut self.conn.clone())
            .await?;
        Ok(extended > 0)
    }

    async fn delete_if_match(&self, key: &str, value: &str) -> StorageResult<bool> {
        let removed: i64 = redis::Script::new(DELETE_IF_MATCH_LUA)
            .key(key)
            .arg(value)
            .invoke_async(&mut self.conn.clone())
            .await?;
        Ok(removed > 0)
    }

    async fn run_script(
        &self,
        script: Script,
        keys: &[&str],
        args: &[f64],
    ) -> StorageResult<Vec<f64>> {
        let prepared = self
            .scripts
            .get(&script)
            .ok_or_else(|| StorageError::Script(format!("{:?}: unregistered script", script)))?;

        let mut invocation = prepared.prepare_invoke();
        for key in keys {
            invocation.key(*key);
        }
        for arg in args {
            invocation.arg(*arg);
        }

        let raw: Vec<String> = invocation.invoke_async(&mut self.conn.clone()).await?;
        Self::parse_reply(script, raw)
    }
}
