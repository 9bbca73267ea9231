//! Key-value cache store abstraction
//!
//! Provides a trait-based abstraction over the cache backend shared by the
//! token resolver and the SWR wrapper. Implementations include:
//! - RedisStore: remote Redis (or Redis-compatible) store behind a connection pool
//! - MemoryStore: process-local map with per-entry expiry (tests, dev)
//! - NoopStore: cache disabled; every read misses, every write is dropped
//!
//! The backend is picked once, at construction time, by [`create_store`].
//! Keys are namespaced with `:` separators, e.g. `token:page:1234` or
//! `meta:campaigns:user-1:act_42`.

use crate::config::CacheConfig;
use crate::{RelayError, Result};
use async_trait::async_trait;
use deadpool_redis::{Pool, Runtime};
use redis::AsyncCommands;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;

/// Trait for cache store operations
///
/// All operations are fallible so callers can tell an unreachable backend
/// from a miss. Values are opaque bytes; see [`get_json`] and [`set_json`]
/// for typed access.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Retrieve a value
    ///
    /// Returns None if the key doesn't exist or has expired.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Store a value that expires after `ttl`
    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()>;

    /// Delete a value
    ///
    /// Returns Ok(()) even if the key doesn't exist (idempotent).
    async fn delete(&self, key: &str) -> Result<()>;

    /// Delete every key matching a glob pattern
    ///
    /// Pattern syntax follows Redis `KEYS`; see [`glob_match`].
    /// Returns the number of keys removed; zero matches is not an error.
    async fn delete_pattern(&self, pattern: &str) -> Result<usize>;

    /// Short name of the backend for status output
    fn mode(&self) -> &'static str;

    /// Whether writes are retained at all
    fn is_enabled(&self) -> bool {
        true
    }
}

/// Read and decode a JSON value
///
/// Bytes that fail to decode are reported as a serialization error;
/// callers treat that the same as a miss.
pub async fn get_json<T: DeserializeOwned>(store: &dyn CacheStore, key: &str) -> Result<Option<T>> {
    match store.get(key).await? {
        Some(bytes) => {
            let value = serde_json::from_slice(&bytes).map_err(|e| {
                RelayError::serialization(format!("Failed to decode cached value {}: {}", key, e))
            })?;
            Ok(Some(value))
        }
        None => Ok(None),
    }
}

/// Encode a value as JSON and store it
pub async fn set_json<T: Serialize + ?Sized>(
    store: &dyn CacheStore,
    key: &str,
    value: &T,
    ttl: Duration,
) -> Result<()> {
    let bytes = serde_json::to_vec(value).map_err(|e| {
        RelayError::serialization(format!("Failed to encode value for {}: {}", key, e))
    })?;
    store.set(key, &bytes, ttl).await
}

/// Match a key against a Redis-style glob pattern
///
/// Supports `*` (any run of characters, including `:`), `?` (one character),
/// `[abc]`, `[^abc]`, `[a-z]` and `\` to escape the next character.
pub fn glob_match(pattern: &str, key: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let s: Vec<char> = key.chars().collect();

    let (mut pi, mut si) = (0usize, 0usize);
    // (pattern index after the last `*`, key index it was tried at)
    let mut star: Option<(usize, usize)> = None;

    while si < s.len() {
        let step = if pi < p.len() {
            match p[pi] {
                '*' => {
                    while pi < p.len() && p[pi] == '*' {
                        pi += 1;
                    }
                    star = Some((pi, si));
                    continue;
                }
                '?' => Some(pi + 1),
                '[' => match_class(&p, pi, s[si]),
                '\\' if pi + 1 < p.len() => (p[pi + 1] == s[si]).then_some(pi + 2),
                c => (c == s[si]).then_some(pi + 1),
            }
        } else {
            None
        };

        match step {
            Some(next) => {
                pi = next;
                si += 1;
            }
            None => match star {
                Some((star_pi, star_si)) => {
                    pi = star_pi;
                    si = star_si + 1;
                    star = Some((star_pi, star_si + 1));
                }
                None => return false,
            },
        }
    }

    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }
    pi == p.len()
}

/// Match one character against the class starting at `p[start] == '['`
///
/// Returns the pattern index after the closing `]` when the character matches.
fn match_class(p: &[char], start: usize, c: char) -> Option<usize> {
    let mut i = start + 1;
    let negate = i < p.len() && p[i] == '^';
    if negate {
        i += 1;
    }

    let mut matched = false;
    while i < p.len() && p[i] != ']' {
        if p[i] == '\\' && i + 1 < p.len() {
            matched |= p[i + 1] == c;
            i += 2;
        } else if i + 2 < p.len() && p[i + 1] == '-' && p[i + 2] != ']' {
            let (lo, hi) = if p[i] <= p[i + 2] {
                (p[i], p[i + 2])
            } else {
                (p[i + 2], p[i])
            };
            matched |= lo <= c && c <= hi;
            i += 3;
        } else {
            matched |= p[i] == c;
            i += 1;
        }
    }

    // An unterminated class runs to the end of the pattern
    let next = if i < p.len() { i + 1 } else { i };
    (matched != negate).then_some(next)
}

/// Redis-backed cache store
///
/// Uses `GET`, `SET key value EX ttl`, `DEL` and `KEYS pattern`. Pattern
/// deletes scan the whole keyspace, which is fine for a dedicated cache
/// instance but O(n) on large shared deployments.
#[derive(Clone)]
pub struct RedisStore {
    pool: Pool,
}

impl RedisStore {
    /// Create a pooled store for `url`
    ///
    /// When `token` is given and the URL carries no password, the token is
    /// used as the connection password.
    pub fn new(url: &str, token: Option<&str>, pool_size: usize, timeout: Duration) -> Result<Self> {
        let url = connection_url(url, token)?;

        let mut redis_config = deadpool_redis::Config::from_url(url);
        let mut pool_config = deadpool_redis::PoolConfig::new(pool_size);
        pool_config.timeouts.wait = Some(timeout);
        pool_config.timeouts.create = Some(timeout);
        pool_config.timeouts.recycle = Some(timeout);
        redis_config.pool = Some(pool_config);

        let pool = redis_config
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| RelayError::cache(format!("Failed to create Redis pool: {}", e)))?;

        Ok(Self { pool })
    }

    /// Check that a connection can be obtained
    pub async fn ping(&self) -> Result<()> {
        self.pool.get().await?;
        Ok(())
    }
}

/// Build the connection URL, injecting the auth token as the password
fn connection_url(url: &str, token: Option<&str>) -> Result<String> {
    let mut parsed = url::Url::parse(url)
        .map_err(|e| RelayError::config(format!("Invalid cache URL: {}", e)))?;

    if !matches!(parsed.scheme(), "redis" | "rediss") {
        return Err(RelayError::config(format!(
            "Unsupported cache URL scheme '{}' (expected redis:// or rediss://)",
            parsed.scheme()
        )));
    }

    if let Some(token) = token.filter(|t| !t.is_empty()) {
        if parsed.password().is_none() {
            parsed
                .set_password(Some(token))
                .map_err(|_| RelayError::config("Cache URL cannot carry a password"))?;
        }
    }

    Ok(parsed.into())
}

#[async_trait]
impl CacheStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.pool.get().await?;
        let value: Option<Vec<u8>> = conn.get(key).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()> {
        let mut conn = self.pool.get().await?;
        // EX 0 is rejected by Redis
        let ttl_secs = ttl.as_secs().max(1);
        conn.set_ex::<_, _, ()>(key, value, ttl_secs).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.pool.get().await?;
        conn.del::<_, ()>(key).await?;
        Ok(())
    }

    async fn delete_pattern(&self, pattern: &str) -> Result<usize> {
        let mut conn = self.pool.get().await?;
        let keys: Vec<String> = conn.keys(pattern).await?;
        if keys.is_empty() {
            return Ok(0);
        }
        let deleted: usize = conn.del(&keys).await?;
        Ok(deleted)
    }

    fn mode(&self) -> &'static str {
        "redis"
    }
}

struct MemoryEntry {
    value: Vec<u8>,
    expires_at: Instant,
}

/// Process-local cache store
///
/// Entries expire lazily on read. Uses `tokio::time::Instant`, so tests can
/// drive expiry with a paused clock.
#[derive(Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, MemoryEntry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live (unexpired) entries
    pub async fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .read()
            .await
            .values()
            .filter(|e| e.expires_at > now)
            .count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Sorted list of live keys
    pub async fn keys(&self) -> Vec<String> {
        let now = Instant::now();
        let mut keys: Vec<String> = self
            .entries
            .read()
            .await
            .iter()
            .filter(|(_, e)| e.expires_at > now)
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        keys
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        {
            let entries = self.entries.read().await;
            match entries.get(key) {
                Some(entry) if entry.expires_at > Instant::now() => {
                    return Ok(Some(entry.value.clone()));
                }
                Some(_) => {}
                None => return Ok(None),
            }
        }

        // Expired - drop it
        self.entries.write().await.remove(key);
        Ok(None)
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()> {
        let entry = MemoryEntry {
            value: value.to_vec(),
            expires_at: Instant::now() + ttl,
        };
        self.entries.write().await.insert(key.to_string(), entry);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.write().await.remove(key);
        Ok(())
    }

    async fn delete_pattern(&self, pattern: &str) -> Result<usize> {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        let before = entries.len();
        let mut live_removed = 0;
        entries.retain(|key, entry| {
            if glob_match(pattern, key) {
                if entry.expires_at > now {
                    live_removed += 1;
                }
                false
            } else {
                true
            }
        });
        tracing::debug!(
            pattern = %pattern,
            removed = before - entries.len(),
            "memory store pattern delete"
        );
        Ok(live_removed)
    }

    fn mode(&self) -> &'static str {
        "memory"
    }
}

/// Cache store used when no backend is configured
///
/// Turns every cached operation into a passthrough to the upstream fetch.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopStore;

#[async_trait]
impl CacheStore for NoopStore {
    async fn get(&self, _key: &str) -> Result<Option<Vec<u8>>> {
        Ok(None)
    }

    async fn set(&self, _key: &str, _value: &[u8], _ttl: Duration) -> Result<()> {
        Ok(())
    }

    async fn delete(&self, _key: &str) -> Result<()> {
        Ok(())
    }

    async fn delete_pattern(&self, _pattern: &str) -> Result<usize> {
        Ok(0)
    }

    fn mode(&self) -> &'static str {
        "disabled"
    }

    fn is_enabled(&self) -> bool {
        false
    }
}

/// Factory function to create the configured CacheStore implementation
///
/// Without a cache URL the store is a [`NoopStore`] and the library runs in
/// passthrough mode. A URL that cannot be turned into a pool also falls back
/// to passthrough; startup never fails because of the cache. An unreachable
/// but valid backend is kept: its operations degrade individually and
/// recover once it comes back.
pub async fn create_store(config: &CacheConfig) -> Arc<dyn CacheStore> {
    let Some(url) = config.url.as_deref().filter(|u| !u.is_empty()) else {
        tracing::info!("No cache backend configured, running in passthrough mode");
        return Arc::new(NoopStore);
    };

    let store = match RedisStore::new(
        url,
        config.token.as_deref(),
        config.pool_size,
        Duration::from_millis(config.timeout_ms),
    ) {
        Ok(store) => store,
        Err(e) => {
            tracing::warn!(error = %e, "Failed to create cache backend, running in passthrough mode");
            return Arc::new(NoopStore);
        }
    };

    match store.ping().await {
        Ok(()) => tracing::info!("Connected to cache backend"),
        Err(e) => tracing::warn!(error = %e, "Cache backend unreachable, operations will degrade until it recovers"),
    }

    Arc::new(store)
}
