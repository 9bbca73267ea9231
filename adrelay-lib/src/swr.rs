//! Stale-while-revalidate cache wrapper
//!
//! Wraps an expensive upstream fetch with two cache entries per key:
//! - `key`: the last fetched value
//! - `key:meta`: `{"timestamp": <ms>}` of the fetch that produced it
//!
//! Both are written together with the stale-retention TTL. A value without
//! its meta entry is treated as a miss.
//!
//! Reads are fresh (served from cache), stale (served from cache while a
//! background task refetches) or a miss (fetched synchronously). Store
//! failures never reach the caller; they degrade to a miss and are logged.

use crate::clock::{Clock, SystemClock};
use crate::storage::{get_json, set_json, CacheStore};
use crate::types::{SwrResponse, SwrState};
use crate::{RelayError, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

#[derive(Debug, Serialize, Deserialize)]
struct SwrMeta {
    timestamp: i64,
}

/// Storage key holding the fetch timestamp for `key`
pub fn meta_key(key: &str) -> String {
    format!("{}:meta", key)
}

fn has_glob_chars(pattern: &str) -> bool {
    pattern.contains(['*', '?', '['])
}

/// Stale-while-revalidate cache over a [`CacheStore`]
///
/// Cloning is cheap; clones share the store, the clock and the set of
/// in-flight background refreshes.
#[derive(Clone)]
pub struct SwrCache {
    store: Arc<dyn CacheStore>,
    clock: Arc<dyn Clock>,
    tasks: TaskTracker,
    refreshing: Arc<Mutex<HashSet<String>>>,
    accepting: Arc<AtomicBool>,
    /// Serializes draining so a `wait_idle` cannot reopen after `shutdown`
    drain: Arc<tokio::sync::Mutex<()>>,
    fetch_timeout: Option<Duration>,
}

/// Removes a key from the in-flight set when the refresh task ends, even if
/// the fetch panicked.
struct RefreshGuard {
    key: String,
    refreshing: Arc<Mutex<HashSet<String>>>,
}

impl Drop for RefreshGuard {
    fn drop(&mut self) {
        self.refreshing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.key);
    }
}

impl SwrCache {
    pub fn new(store: Arc<dyn CacheStore>) -> Self {
        Self::with_clock(store, Arc::new(SystemClock))
    }

    pub fn with_clock(store: Arc<dyn CacheStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            tasks: TaskTracker::new(),
            refreshing: Arc::new(Mutex::new(HashSet::new())),
            accepting: Arc::new(AtomicBool::new(true)),
            drain: Arc::new(tokio::sync::Mutex::new(())),
            fetch_timeout: None,
        }
    }

    /// Bound every fetch (foreground and background) by `timeout`
    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = Some(timeout);
        self
    }

    pub fn store(&self) -> &Arc<dyn CacheStore> {
        &self.store
    }

    /// Fetch through the cache with stale-while-revalidate semantics
    ///
    /// `ttl_secs` is the freshness window and `stale_ttl_secs` the outer
    /// retention window; `ttl_secs > stale_ttl_secs` is rejected up front.
    ///
    /// Errors from `fetch` propagate only when it runs synchronously (miss
    /// or passthrough). A failed background refresh is logged and dropped.
    pub async fn get_with_swr<T, F, Fut>(
        &self,
        key: &str,
        ttl_secs: u64,
        stale_ttl_secs: u64,
        fetch: F,
    ) -> Result<SwrResponse<T>>
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        if ttl_secs > stale_ttl_secs {
            return Err(RelayError::config(format!(
                "fresh TTL ({}s) must not exceed stale TTL ({}s) for {}",
                ttl_secs, stale_ttl_secs, key
            )));
        }

        if !self.store.is_enabled() {
            let data = self.run_fetch(fetch).await?;
            return Ok(SwrResponse::fresh(data));
        }

        let state = self.state_of(key, ttl_secs, stale_ttl_secs).await;
        if state != SwrState::Missing {
            if let Some(data) = self.read_data::<T>(key).await {
                if state == SwrState::Fresh {
                    debug!(key = %key, "swr fresh hit");
                    return Ok(SwrResponse::fresh(data));
                }

                let revalidating = self.spawn_refresh(key, stale_ttl_secs, fetch);
                debug!(key = %key, revalidating, "swr stale hit");
                return Ok(SwrResponse {
                    data,
                    is_stale: true,
                    revalidating,
                });
            }
        }

        debug!(key = %key, "swr miss");
        let data = self.run_fetch(fetch).await?;
        self.write(key, &data, stale_ttl_secs).await;
        Ok(SwrResponse::fresh(data))
    }

    /// Plain read-through cache without a stale window
    pub async fn get_or_fetch<T, F, Fut>(&self, key: &str, ttl_secs: u64, fetch: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if self.store.is_enabled() {
            match get_json::<T>(self.store.as_ref(), key).await {
                Ok(Some(data)) => {
                    debug!(key = %key, "cache hit");
                    return Ok(data);
                }
                Ok(None) => debug!(key = %key, "cache miss"),
                Err(e) => warn!(key = %key, error = %e, "Cache read failed, fetching"),
            }
        }

        let data = self.run_fetch(fetch).await?;

        if self.store.is_enabled() {
            if let Err(e) =
                set_json(self.store.as_ref(), key, &data, Duration::from_secs(ttl_secs)).await
            {
                warn!(key = %key, error = %e, "Cache write failed");
            }
        }

        Ok(data)
    }

    /// Delete a key or every key matching a glob pattern
    ///
    /// The timestamp entries of matched keys go with them. Returns the
    /// number of store keys removed; a pattern matching nothing yields 0.
    pub async fn invalidate(&self, pattern: &str) -> usize {
        if !self.store.is_enabled() {
            return 0;
        }

        if !has_glob_chars(pattern) {
            let mut removed = 0;
            for key in [pattern.to_string(), meta_key(pattern)] {
                match self.store.get(&key).await {
                    Ok(Some(_)) => {}
                    Ok(None) => continue,
                    Err(e) => {
                        warn!(key = %key, error = %e, "Cache read failed during invalidation");
                    }
                }
                match self.store.delete(&key).await {
                    Ok(()) => removed += 1,
                    Err(e) => warn!(key = %key, error = %e, "Cache delete failed"),
                }
            }
            debug!(key = %pattern, removed, "cache key invalidated");
            return removed;
        }

        let mut removed = 0;
        for p in [pattern.to_string(), meta_key(pattern)] {
            match self.store.delete_pattern(&p).await {
                Ok(n) => removed += n,
                Err(e) => warn!(pattern = %p, error = %e, "Cache pattern delete failed"),
            }
        }
        debug!(pattern = %pattern, removed, "cache pattern invalidated");
        removed
    }

    /// Freshness of `key` as the next `get_with_swr` would see it
    pub async fn swr_state(&self, key: &str, ttl_secs: u64, stale_ttl_secs: u64) -> SwrState {
        self.state_of(key, ttl_secs, stale_ttl_secs).await
    }

    /// Number of background refreshes currently running
    pub fn in_flight(&self) -> usize {
        self.tasks.len()
    }

    /// Wait until every background refresh spawned so far has finished
    pub async fn wait_idle(&self) {
        let _drain = self.drain.lock().await;
        self.tasks.close();
        self.tasks.wait().await;
        if self.accepting.load(Ordering::SeqCst) {
            self.tasks.reopen();
        }
    }

    /// Stop starting background refreshes and wait for running ones
    ///
    /// Stale hits after shutdown still return stale data but do not refetch.
    pub async fn shutdown(&self) {
        {
            let _drain = self.drain.lock().await;
            self.accepting.store(false, Ordering::SeqCst);
            self.tasks.close();
        }
        self.tasks.wait().await;
    }

    async fn state_of(&self, key: &str, ttl_secs: u64, stale_ttl_secs: u64) -> SwrState {
        let timestamp = match get_json::<SwrMeta>(self.store.as_ref(), &meta_key(key)).await {
            Ok(meta) => meta.map(|m| m.timestamp),
            Err(e) => {
                warn!(key = %key, error = %e, "Cache meta read failed, treating as miss");
                None
            }
        };
        let age_ms = timestamp.map(|ts| self.clock.now_ms() - ts);
        SwrState::from_age(age_ms, ttl_secs, stale_ttl_secs)
    }

    async fn read_data<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        match get_json::<T>(self.store.as_ref(), key).await {
            Ok(data) => data,
            Err(e) => {
                warn!(key = %key, error = %e, "Cache data read failed, treating as miss");
                None
            }
        }
    }

    async fn run_fetch<T, F, Fut>(&self, fetch: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        match self.fetch_timeout {
            Some(limit) => tokio::time::timeout(limit, fetch()).await.map_err(|_| {
                RelayError::upstream(format!("fetch timed out after {}ms", limit.as_millis()))
            })?,
            None => fetch().await,
        }
    }

    async fn write<T: Serialize>(&self, key: &str, data: &T, stale_ttl_secs: u64) {
        write_entry(
            self.store.as_ref(),
            self.clock.as_ref(),
            key,
            data,
            stale_ttl_secs,
        )
        .await;
    }

    /// Start a background refresh for `key`
    ///
    /// Returns whether a refresh is now running for the key, either the one
    /// just spawned or one already in flight.
    fn spawn_refresh<T, F, Fut>(&self, key: &str, stale_ttl_secs: u64, fetch: F) -> bool
    where
        T: Serialize + Send + Sync + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        if !self.accepting.load(Ordering::SeqCst) {
            debug!(key = %key, "shutting down, skipping background refresh");
            return false;
        }

        {
            let mut refreshing = self
                .refreshing
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if !refreshing.insert(key.to_string()) {
                debug!(key = %key, "background refresh already in flight");
                return true;
            }
        }

        let guard = RefreshGuard {
            key: key.to_string(),
            refreshing: Arc::clone(&self.refreshing),
        };
        let store = Arc::clone(&self.store);
        let clock = Arc::clone(&self.clock);
        let timeout = self.fetch_timeout;

        self.tasks.spawn(async move {
            let key = guard.key.as_str();

            let result = match timeout {
                Some(limit) => match tokio::time::timeout(limit, fetch()).await {
                    Ok(result) => result,
                    Err(_) => Err(RelayError::upstream(format!(
                        "fetch timed out after {}ms",
                        limit.as_millis()
                    ))),
                },
                None => fetch().await,
            };

            match result {
                Ok(data) => {
                    write_entry(store.as_ref(), clock.as_ref(), key, &data, stale_ttl_secs).await;
                    debug!(key = %key, "background refresh complete");
                }
                Err(e) => warn!(key = %key, error = %e, "Background refresh failed"),
            }
        });
        true
    }
}

/// Write the value and its timestamp, data first
///
/// If the meta write fails the value is orphaned and reads treat it as a miss.
async fn write_entry<T: Serialize>(
    store: &dyn CacheStore,
    clock: &dyn Clock,
    key: &str,
    data: &T,
    stale_ttl_secs: u64,
) {
    let ttl = Duration::from_secs(stale_ttl_secs);
    if let Err(e) = set_json(store, key, data, ttl).await {
        warn!(key = %key, error = %e, "Cache write failed");
        return;
    }
    let meta = SwrMeta {
        timestamp: clock.now_ms(),
    };
    if let Err(e) = set_json(store, &meta_key(key), &meta, ttl).await {
        warn!(key = %key, error = %e, "Cache meta write failed");
    }
}
