//! In-memory storage backend
//!
//! A single-lock map with lazy TTL enforcement and LRU eviction at
//! `max_size`. Atomic scripts execute natively under the lock with the
//! injected clock, mirroring the remote backend's server-side execution.

use std::collections::VecDeque;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::clock::{Clock, SystemClock};

use super::{Script, Storage, StorageError, StorageResult};

/// Local storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalStorageConfig {
    /// Maximum number of keys held before LRU eviction kicks in.
    pub max_size: usize,
}

impl Default for LocalStorageConfig {
    fn default() -> Self {
        Self { max_size: 10_000 }
    }
}

/// Stored value: either a plain string (scalars, encoded bucket state) or a
/// sorted series of instants (sliding windows).
#[derive(Debug, Clone)]
enum Entry {
    Text(String),
    Series(VecDeque<f64>),
}

#[derive(Debug, Clone)]
struct Stored {
    entry: Entry,
    expires_at: Option<Instant>,
}

impl Stored {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.map_or(false, |at| at <= now)
    }
}

/// In-memory storage backend.
///
/// All mutating operations serialize through one mutex; expiry is enforced
/// lazily on access, so an expired key is indistinguishable from a missing
/// one. Eviction drops the least recently accessed key; a limiter bucket
/// evicted this way is re-created full on next use.
pub struct LocalStorage {
    map: Mutex<LruCache<String, Stored>>,
    clock: Arc<dyn Clock>,
    epoch: Instant,
}

impl LocalStorage {
    /// Create a backend with the wall clock.
    pub fn new(config: LocalStorageConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Create a backend reading time from `clock`.
    pub fn with_clock(config: LocalStorageConfig, clock: Arc<dyn Clock>) -> Self {
        let capacity = NonZeroUsize::new(config.max_size).unwrap_or(NonZeroUsize::MIN);
        let epoch = clock.now();
        Self {
            map: Mutex::new(LruCache::new(capacity)),
            clock,
            epoch,
        }
    }

    fn now(&self) -> Instant {
        self.clock.now()
    }

    /// Seconds since this instance's epoch; the timestamp basis for script
    /// state. Only differences matter, so the basis never leaves the backend.
    fn now_secs(&self) -> f64 {
        self.now().duration_since(self.epoch).as_secs_f64()
    }

    /// Drop the key if its TTL has passed, so callers below only ever see
    /// live entries.
    fn prune_expired(map: &mut LruCache<String, Stored>, key: &str, now: Instant) {
        let expired = map.peek(key).map_or(false, |s| s.is_expired(now));
        if expired {
            map.pop(key);
        }
    }

    fn decode_bucket(key: &str, raw: &str) -> StorageResult<(f64, f64)> {
        let (balance, ts) = raw
            .split_once('|')
            .ok_or_else(|| StorageError::corrupt(key, "missing '|' separator"))?;
        let balance: f64 = balance
            .parse()
            .map_err(|_| StorageError::corrupt(key, "non-numeric balance"))?;
        let ts: f64 = ts
            .parse()
            .map_err(|_| StorageError::corrupt(key, "non-numeric timestamp"))?;
        Ok((balance, ts))
    }

    fn encode_bucket(balance: f64, ts: f64) -> String {
        format!("{}|{}", balance, ts)
    }

    fn arg(args: &[f64], idx: usize, script: Script) -> StorageResult<f64> {
        args.get(idx).copied().ok_or_else(|| {
            StorageError::Script(format!("{:?}: missing argument {}", script, idx))
        })
    }

    fn key(keys: &[&str], script: Script) -> StorageResult<String> {
        keys.first()
            .map(|k| k.to_string())
            .ok_or_else(|| StorageError::Script(format!("{:?}: missing key", script)))
    }

    /// Read the live bucket state for a script, or `None` when absent.
    fn bucket_state(
        map: &mut LruCache<String, Stored>,
        key: &str,
        now: Instant,
    ) -> StorageResult<Option<(f64, f64)>> {
        Self::prune_expired(map, key, now);
        match map.get(key) {
            None => Ok(None),
            Some(stored) => match &stored.entry {
                Entry::Text(raw) => Self::decode_bucket(key, raw).map(Some),
                Entry::Series(_) => Err(StorageError::corrupt(key, "expected bucket state")),
            },
        }
    }

    fn run_token_bucket_acquire(&self, keys: &[&str], args: &[f64]) -> StorageResult<Vec<f64>> {
        let script = Script::TokenBucketAcquire;
        let key = Self::key(keys, script)?;
        let permits = Self::arg(args, 0, script)?;
        let burst = Self::arg(args, 1, script)?;
        let rate = Self::arg(args, 2, script)?;
        let ttl = Self::arg(args, 3, script)?;

        let now = self.now();
        let now_secs = self.now_secs();
        let mut map = self.map.lock();
        let (balance, last) = Self::bucket_state(&mut map, &key, now)?.unwrap_or((burst, now_secs));
        let mut balance = (balance + (now_secs - last).max(0.0) * rate).min(burst);
        let accepted = if balance >= permits {
            balance -= permits;
            1.0
        } else {
            0.0
        };
        map.put(
            key,
            Stored {
                entry: Entry::Text(Self::encode_bucket(balance, now_secs)),
                expires_at: Some(now + Duration::from_secs_f64(ttl.max(0.0))),
            },
        );
        Ok(vec![accepted, balance])
    }

    fn run_token_bucket_release(&self, keys: &[&str], args: &[f64]) -> StorageResult<Vec<f64>> {
        let script = Script::TokenBucketRelease;
        let key = Self::key(keys, script)?;
        let permits = Self::arg(args, 0, script)?;
        let burst = Self::arg(args, 1, script)?;
        let ttl = Self::arg(args, 2, script)?;

        let now = self.now();
        let now_secs = self.now_secs();
        let mut map = self.map.lock();
        // A release against an absent bucket leaves it full; the refill
        // timestamp is preserved otherwise.
        let (balance, last) = match Self::bucket_state(&mut map, &key, now)? {
            Some((balance, last)) => ((balance + permits).min(burst), last),
            None => (burst, now_secs),
        };
        map.put(
            key,
            Stored {
                entry: Entry::Text(Self::encode_bucket(balance, last)),
                expires_at: Some(now + Duration::from_secs_f64(ttl.max(0.0))),
            },
        );
        Ok(vec![balance])
    }

    fn run_token_bucket_peek(&self, keys: &[&str], args: &[f64]) -> StorageResult<Vec<f64>> {
        let script = Script::TokenBucketPeek;
        let key = Self::key(keys, script)?;
        let burst = Self::arg(args, 0, script)?;
        let rate = Self::arg(args, 1, script)?;

        let now = self.now();
        let now_secs = self.now_secs();
        let mut map = self.map.lock();
        match Self::bucket_state(&mut map, &key, now)? {
            None => Ok(vec![burst, -1.0]),
            Some((balance, last)) => {
                let age = (now_secs - last).max(0.0);
                Ok(vec![(balance + age * rate).min(burst), age])
            }
        }
    }

    fn run_leaky_bucket_acquire(&self, keys: &[&str], args: &[f64]) -> StorageResult<Vec<f64>> {
        let script = Script::LeakyBucketAcquire;
        let key = Self::key(keys, script)?;
        let permits = Self::arg(args, 0, script)?;
        let capacity = Self::arg(args, 1, script)?;
        let rate = Self::arg(args, 2, script)?;
        let ttl = Self::arg(args, 3, script)?;

        let now = self.now();
        let now_secs = self.now_secs();
        let mut map = self.map.lock();
        let (level, last) = Self::bucket_state(&mut map, &key, now)?.unwrap_or((0.0, now_secs));
        let mut level = (level - (now_secs - last).max(0.0) * rate).max(0.0);
        let accepted = if level + permits <= capacity {
            level += permits;
            1.0
        } else {
            0.0
        };
        map.put(
            key,
            Stored {
                entry: Entry::Text(Self::encode_bucket(level, now_secs)),
                expires_at: Some(now + Duration::from_secs_f64(ttl.max(0.0))),
            },
        );
        Ok(vec![accepted, level])
    }

    fn run_leaky_bucket_release(&self, keys: &[&str], args: &[f64]) -> StorageResult<Vec<f64>> {
        let script = Script::LeakyBucketRelease;
        let key = Self::key(keys, script)?;
        let permits = Self::arg(args, 0, script)?;
        let ttl = Self::arg(args, 1, script)?;

        let now = self.now();
        let now_secs = self.now_secs();
        let mut map = self.map.lock();
        let (level, last) = match Self::bucket_state(&mut map, &key, now)? {
            Some((level, last)) => ((level - permits).max(0.0), last),
            None => (0.0, now_secs),
        };
        map.put(
            key,
            Stored {
                entry: Entry::Text(Self::encode_bucket(level, last)),
                expires_at: Some(now + Duration::from_secs_f64(ttl.max(0.0))),
            },
        );
        Ok(vec![level])
    }

    fn run_leaky_bucket_peek(&self, keys: &[&str], args: &[f64]) -> StorageResult<Vec<f64>> {
        let script = Script::LeakyBucketPeek;
        let key = Self::key(keys, script)?;
        let rate = Self::arg(args, 0, script)?;

        let now = self.now();
        let now_secs = self.now_secs();
        let mut map = self.map.lock();
        match Self::bucket_state(&mut map, &key, now)? {
            None => Ok(vec![0.0, -1.0]),
            Some((level, last)) => {
                let age = (now_secs - last).max(0.0);
                Ok(vec![(level - age * rate).max(0.0), age])
            }
        }
    }

    fn window_series<'a>(
        map: &'a mut LruCache<String, Stored>,
        key: &str,
        now: Instant,
    ) -> StorageResult<Option<&'a mut VecDeque<f64>>> {
        Self::prune_expired(map, key, now);
        match map.get_mut(key) {
            None => Ok(None),
            Some(stored) => match &mut stored.entry {
                Entry::Series(series) => Ok(Some(series)),
                Entry::Text(_) => Err(StorageError::corrupt(key, "expected window series")),
            },
        }
    }

    fn run_sliding_window_acquire(&self, keys: &[&str], args: &[f64]) -> StorageResult<Vec<f64>> {
        let script = Script::SlidingWindowAcquire;
        let key = Self::key(keys, script)?;
        let permits = Self::arg(args, 0, script)? as usize;
        let rate = Self::arg(args, 1, script)? as usize;
        let per = Self::arg(args, 2, script)?;

        let now = self.now();
        let now_secs = self.now_secs();
        let horizon = now_secs - per;
        let mut map = self.map.lock();

        let mut series = match Self::window_series(&mut map, &key, now)? {
            Some(series) => std::mem::take(series),
            None => VecDeque::new(),
        };
        while series.front().map_or(false, |&ts| ts <= horizon) {
            series.pop_front();
        }
        let accepted = if series.len() + permits <= rate {
            for _ in 0..permits {
                series.push_back(now_secs);
            }
            1.0
        } else {
            0.0
        };
        let count = series.len() as f64;
        map.put(
            key,
            Stored {
                entry: Entry::Series(series),
                expires_at: Some(now + Duration::from_secs_f64((per * 2.0).max(0.0))),
            },
        );
        Ok(vec![accepted, count])
    }

    fn run_sliding_window_count(&self, keys: &[&str], args: &[f64]) -> StorageResult<Vec<f64>> {
        let script = Script::SlidingWindowCount;
        let key = Self::key(keys, script)?;
        let per = Self::arg(args, 0, script)?;

        let now = self.now();
        let horizon = self.now_secs() - per;
        let mut map = self.map.lock();
        let count = match Self::window_series(&mut map, &key, now)? {
            None => 0,
            Some(series) => {
                while series.front().map_or(false, |&ts| ts <= horizon) {
                    series.pop_front();
                }
                series.len()
            }
        };
        Ok(vec![count as f64])
    }
}

#[async_trait]
impl Storage for LocalStorage {
    async fn get(&self, key: &str) -> StorageResult<Option<String>> {
        let now = self.now();
        let mut map = self.map.lock();
        Self::prune_expired(&mut map, key, now);
        match map.get(key) {
            None => Ok(None),
            Some(stored) => match &stored.entry {
                Entry::Text(value) => Ok(Some(value.clone())),
                Entry::Series(_) => Err(StorageError::corrupt(key, "expected string value")),
            },
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StorageResult<()> {
        let now = self.now();
        let mut map = self.map.lock();
        map.put(
            key.to_string(),
            Stored {
                entry: Entry::Text(value.to_string()),
                expires_at: ttl.map(|d| now + d),
            },
        );
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Option<Duration>) -> StorageResult<bool> {
        let now = self.now();
        let mut map = self.map.lock();
        Self::prune_expired(&mut map, key, now);
        if map.contains(key) {
            return Ok(false);
        }
        map.put(
            key.to_string(),
            Stored {
                entry: Entry::Text(value.to_string()),
                expires_at: ttl.map(|d| now + d),
            },
        );
        Ok(true)
    }

    async fn delete(&self, key: &str) -> StorageResult<bool> {
        let now = self.now();
        let mut map = self.map.lock();
        Self::prune_expired(&mut map, key, now);
        Ok(map.pop(key).is_some())
    }

    async fn exists(&self, key: &str) -> StorageResult<bool> {
        let now = self.now();
        let mut map = self.map.lock();
        Self::prune_expired(&mut map, key, now);
        Ok(map.contains(key))
    }

    async fn incr(&self, key: &str, delta: f64) -> StorageResult<f64> {
        let now = self.now();
        let mut map = self.map.lock();
        Self::prune_expired(&mut map, key, now);
        let (current, expires_at) = match map.peek(key) {
            None => (0.0, None),
            Some(stored) => match &stored.entry {
                Entry::Text(value) => {
                    let parsed: f64 = value
                        .parse()
                        .map_err(|_| StorageError::corrupt(key, "non-numeric counter"))?;
                    (parsed, stored.expires_at)
                }
                Entry::Series(_) => {
                    return Err(StorageError::corrupt(key, "expected numeric value"))
                }
            },
        };
        let next = current + delta;
        map.put(
            key.to_string(),
            Stored {
                entry: Entry::Text(next.to_string()),
                expires_at,
            },
        );
        Ok(next)
    }

    async fn ttl(&self, key: &str) -> StorageResult<Option<Duration>> {
        let now = self.now();
        let mut map = self.map.lock();
        Self::prune_expired(&mut map, key, now);
        Ok(map
            .peek(key)
            .and_then(|stored| stored.expires_at)
            .map(|at| at.duration_since(now)))
    }

    async fn extend_if_match(&self, key: &str, value: &str, ttl: Duration) -> StorageResult<bool> {
        let now = self.now();
        let mut map = self.map.lock();
        Self::prune_expired(&mut map, key, now);
        match map.get_mut(key) {
            Some(stored) => match &stored.entry {
                Entry::Text(current) if current == value => {
                    stored.expires_at = Some(now + ttl);
                    Ok(true)
                }
                _ => Ok(false),
            },
            None => Ok(false),
        }
    }

    async fn delete_if_match(&self, key: &str, value: &str) -> StorageResult<bool> {
        let now = self.now();
        let mut map = self.map.lock();
        Self::prune_expired(&mut map, key, now);
        let matches = matches!(
            map.peek(key),
            Some(Stored { entry: Entry::Text(current), .. }) if current == value
        );
        if matches {
            map.pop(key);
        }
        Ok(matches)
    }

    async fn run_script(
        &self,
        script: Script,
        keys: &[&str],
        args: &[f64],
    ) -> StorageResult<Vec<f64>> {
        match script {
            Script::TokenBucketAcquire => self.run_token_bucket_acquire(keys, args),
            Script::TokenBucketRelease => self.run_token_bucket_release(keys, args),
            Script::TokenBucketPeek => self.run_token_bucket_peek(keys, args),
            Script::LeakyBucketAcquire => self.run_leaky_bucket_acquire(keys, args),
            Script::LeakyBucketRelease => self.run_leaky_bucket_release(keys, args),
            Script::LeakyBucketPeek => self.run_leaky_bucket_peek(keys, args),
            Script::SlidingWindowAcquire => self.run_sliding_window_acquire(keys, args),
            Script::SlidingWindowCount => self.run_sliding_window_count(keys, args),
        }
    }
}
