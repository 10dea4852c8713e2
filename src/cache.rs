//! Deduplicating result cache for image loads
//!
//! Concurrent requests for the same key share a single execution of the
//! producer. The first caller for a key becomes the originator: it registers a
//! ticket and spawns the producer as an independent task. Later callers find
//! the ticket and subscribe to its broadcast channel. Once the producer
//! finishes, the outcome is stored (success and failure with separate TTLs),
//! the ticket is released and every subscriber receives the same value.
//!
//! Because the producer runs in its own task with a detached context, a caller
//! that gives up (client disconnect, request deadline) only stops its own wait.
//!
//! The store is split into independently locked shards. The entry and byte
//! budgets apply to the cache as a whole; when either is exceeded the least
//! recently used entries are evicted, whichever shard holds them.

use crate::config::CacheConfig;
use crate::context::RequestContext;
use crate::error::{PartialError, RelayError};
use crate::metrics::RelayMetrics;
use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Outcome of a load, shared between all callers of one key
pub type LoadOutcome = std::result::Result<Bytes, PartialError>;

/// Only one message is ever sent per ticket.
const BROADCAST_CHANNEL_CAPACITY: usize = 1;

struct CacheEntry {
    outcome: LoadOutcome,
    size: usize,
    expires_at: Instant,
    last_accessed: Instant,
}

#[derive(Default)]
struct Shard {
    entries: HashMap<String, CacheEntry>,
}

/// Cache statistics for monitoring
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub total_entries: usize,
    pub total_bytes: usize,
    pub hits: u64,
    pub misses: u64,
    pub suppressed: u64,
    pub evictions: u64,
    pub in_flight: usize,
}

struct CacheInner {
    shards: Vec<RwLock<Shard>>,
    tickets: DashMap<String, broadcast::Sender<LoadOutcome>>,
    max_entries: usize,
    max_bytes: usize,
    entries: AtomicUsize,
    bytes: AtomicUsize,
    hits: AtomicU64,
    misses: AtomicU64,
    suppressed: AtomicU64,
    evictions: AtomicU64,
    metrics: Option<RelayMetrics>,
}

/// Single-flight TTL/LRU cache of load outcomes
///
/// Cloning is cheap and every clone shares the same store.
#[derive(Clone)]
pub struct DedupCache {
    inner: Arc<CacheInner>,
}

impl DedupCache {
    /// Create a new DedupCache
    ///
    /// # Arguments
    /// * `max_entries` - Maximum number of stored outcomes
    /// * `max_bytes` - Maximum aggregate size of stored buffers
    /// * `shards` - Number of independently locked partitions
    ///
    /// The budgets bound the whole cache, not each shard.
    pub fn new(max_entries: usize, max_bytes: usize, shards: usize) -> Self {
        let shards = shards.max(1);
        DedupCache {
            inner: Arc::new(CacheInner {
                shards: (0..shards).map(|_| RwLock::new(Shard::default())).collect(),
                tickets: DashMap::new(),
                max_entries: max_entries.max(1),
                max_bytes,
                entries: AtomicUsize::new(0),
                bytes: AtomicUsize::new(0),
                hits: AtomicU64::new(0),
                misses: AtomicU64::new(0),
                suppressed: AtomicU64::new(0),
                evictions: AtomicU64::new(0),
                metrics: None,
            }),
        }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(config.max_entries, config.max_bytes, config.shards)
    }

    /// Report lookups and evictions to `metrics` as well as to [`CacheStats`].
    ///
    /// Must be called before the cache is shared.
    pub fn with_metrics(mut self, metrics: RelayMetrics) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.metrics = Some(metrics);
        } else {
            warn!("DedupCache already shared, metrics not attached");
        }
        self
    }

    /// Get cache statistics
    pub fn get_stats(&self) -> CacheStats {
        CacheStats {
            total_entries: self.inner.entries.load(Ordering::Relaxed),
            total_bytes: self.inner.bytes.load(Ordering::Relaxed),
            hits: self.inner.hits.load(Ordering::Relaxed),
            misses: self.inner.misses.load(Ordering::Relaxed),
            suppressed: self.inner.suppressed.load(Ordering::Relaxed),
            evictions: self.inner.evictions.load(Ordering::Relaxed),
            in_flight: self.inner.tickets.len(),
        }
    }

    /// Resolve `key`, running `produce` at most once across concurrent callers
    ///
    /// # Arguments
    /// * `ctx` - Caller context; bounds only this caller's wait
    /// * `key` - Cache key, usually the image identifier
    /// * `timeout` - Deadline for the shared producer, zero for none
    /// * `result_ttl` - Lifetime of a successful outcome, zero to skip storing it
    /// * `error_ttl` - Lifetime of a failed outcome, zero to skip storing it
    /// * `produce` - Computes the outcome from a context detached from `ctx`
    ///
    /// # Returns
    /// The stored, shared or freshly produced outcome. `Cancelled` or
    /// `Timeout` when `ctx` finishes first; the shared work keeps running.
    pub async fn resolve<F, Fut>(
        &self,
        ctx: &RequestContext,
        key: &str,
        timeout: Duration,
        result_ttl: Duration,
        error_ttl: Duration,
        produce: F,
    ) -> LoadOutcome
    where
        F: FnOnce(RequestContext) -> Fut,
        Fut: Future<Output = LoadOutcome> + Send + 'static,
    {
        if let Some(outcome) = self.lookup(key) {
            return outcome;
        }

        let mut rx = match self.inner.tickets.entry(key.to_string()) {
            Entry::Occupied(occupied) => {
                self.inner.suppressed.fetch_add(1, Ordering::Relaxed);
                if let Some(ref metrics) = self.inner.metrics {
                    metrics.record_cache_suppressed();
                }
                debug!(key = %key, "joining in-flight load");
                occupied.get().subscribe()
            }
            Entry::Vacant(vacant) => {
                // A producer may have stored its outcome and released the ticket
                // between the first lookup and taking the entry.
                if let Some(outcome) = self.lookup(key) {
                    return outcome;
                }
                if let Some(err) = ctx.err() {
                    return Err(err.into());
                }

                self.inner.misses.fetch_add(1, Ordering::Relaxed);
                if let Some(ref metrics) = self.inner.metrics {
                    metrics.record_cache_miss();
                }

                let (tx, rx) = broadcast::channel(BROADCAST_CHANNEL_CAPACITY);
                vacant.insert(tx.clone());

                let fill_ctx = ctx.detached().with_timeout(timeout);
                let fut = produce(fill_ctx.clone());
                let cache = self.clone();
                let key = key.to_string();
                tokio::spawn(async move {
                    let outcome = run_producer(&fill_ctx, fut).await;
                    cache.complete(&key, tx, outcome, result_ttl, error_ttl);
                });
                rx
            }
        };

        match ctx.run(rx.recv()).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => Err(RelayError::InternalError(format!(
                "load for {} ended without an outcome: {}",
                key, e
            ))
            .into()),
            Err(err) => {
                debug!(key = %key, error = %err, "stopped waiting for load");
                Err(err.into())
            }
        }
    }

    /// Store the outcome, release the ticket and notify subscribers, in that
    /// order, so that a caller who misses the ticket finds the stored value.
    fn complete(
        &self,
        key: &str,
        tx: broadcast::Sender<LoadOutcome>,
        outcome: LoadOutcome,
        result_ttl: Duration,
        error_ttl: Duration,
    ) {
        let ttl = match &outcome {
            Ok(_) => result_ttl,
            Err(e) if e.error.is_cancellation() => Duration::ZERO,
            Err(_) => error_ttl,
        };
        if !ttl.is_zero() {
            self.store(key, outcome.clone(), ttl);
        }

        self.inner.tickets.remove(key);
        // No receivers left is fine: every caller may have given up.
        let _ = tx.send(outcome);
    }

    fn shard_for(&self, key: &str) -> &RwLock<Shard> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let idx = (hasher.finish() as usize) % self.inner.shards.len();
        &self.inner.shards[idx]
    }

    /// Look up a live entry, dropping it if it has expired
    fn lookup(&self, key: &str) -> Option<LoadOutcome> {
        let now = Instant::now();
        let mut shard = match self.shard_for(key).write() {
            Ok(shard) => shard,
            Err(e) => {
                warn!(key = %key, error = ?e, "cache shard lock poisoned");
                return None;
            }
        };

        let (hit, expired) = match shard.entries.get_mut(key) {
            Some(entry) if entry.expires_at > now => {
                entry.last_accessed = now;
                (Some(entry.outcome.clone()), false)
            }
            Some(_) => (None, true),
            None => (None, false),
        };
        if expired {
            self.remove_entry(&mut shard, key);
            debug!(key = %key, "cache entry expired");
        }
        drop(shard);

        if hit.is_some() {
            self.inner.hits.fetch_add(1, Ordering::Relaxed);
            if let Some(ref metrics) = self.inner.metrics {
                metrics.record_cache_hit();
            }
            debug!(key = %key, "cache hit");
        }
        hit
    }

    fn store(&self, key: &str, outcome: LoadOutcome, ttl: Duration) {
        let size = match &outcome {
            Ok(buf) => buf.len(),
            Err(e) => e.buf.len(),
        };
        if size > self.inner.max_bytes {
            debug!(key = %key, size, "outcome larger than cache, not stored");
            return;
        }

        let now = Instant::now();
        {
            let mut shard = match self.shard_for(key).write() {
                Ok(shard) => shard,
                Err(e) => {
                    warn!(key = %key, error = ?e, "cache shard lock poisoned");
                    return;
                }
            };

            self.remove_entry(&mut shard, key);

            let expired: Vec<String> = shard
                .entries
                .iter()
                .filter(|(_, entry)| entry.expires_at <= now)
                .map(|(k, _)| k.clone())
                .collect();
            for k in &expired {
                self.remove_entry(&mut shard, k);
            }
            if !expired.is_empty() {
                debug!("dropped {} expired cache entries", expired.len());
            }

            shard.entries.insert(
                key.to_string(),
                CacheEntry {
                    outcome,
                    size,
                    expires_at: now + ttl,
                    last_accessed: now,
                },
            );
            self.inner.entries.fetch_add(1, Ordering::Relaxed);
            self.inner.bytes.fetch_add(size, Ordering::Relaxed);
        }

        while self.over_budget() {
            if !self.evict_lru(key) {
                break;
            }
        }
    }

    fn over_budget(&self) -> bool {
        self.inner.entries.load(Ordering::Relaxed) > self.inner.max_entries
            || self.inner.bytes.load(Ordering::Relaxed) > self.inner.max_bytes
    }

    /// Remove `key` from a locked shard, keeping the totals in step
    fn remove_entry(&self, shard: &mut Shard, key: &str) -> Option<CacheEntry> {
        let entry = shard.entries.remove(key)?;
        self.inner.entries.fetch_sub(1, Ordering::Relaxed);
        self.inner.bytes.fetch_sub(entry.size, Ordering::Relaxed);
        Some(entry)
    }

    /// Evict the least recently used entry across all shards, sparing `keep`
    ///
    /// Shards are locked one at a time. Returns false when nothing could be
    /// evicted.
    fn evict_lru(&self, keep: &str) -> bool {
        let mut oldest: Option<(Instant, usize, String)> = None;
        for (idx, shard) in self.inner.shards.iter().enumerate() {
            let Ok(shard) = shard.read() else {
                continue;
            };
            let candidate = shard
                .entries
                .iter()
                .filter(|(k, _)| k.as_str() != keep)
                .min_by_key(|(_, entry)| entry.last_accessed);
            if let Some((k, entry)) = candidate {
                if oldest.as_ref().map_or(true, |(at, _, _)| entry.last_accessed < *at) {
                    oldest = Some((entry.last_accessed, idx, k.clone()));
                }
            }
        }

        let Some((last_accessed, idx, victim)) = oldest else {
            return false;
        };
        let Ok(mut shard) = self.inner.shards[idx].write() else {
            return false;
        };
        // Touched since the scan: leave it and let the caller look again.
        if shard
            .entries
            .get(&victim)
            .is_some_and(|entry| entry.last_accessed != last_accessed)
        {
            return true;
        }
        if self.remove_entry(&mut shard, &victim).is_some() {
            self.inner.evictions.fetch_add(1, Ordering::Relaxed);
            if let Some(ref metrics) = self.inner.metrics {
                metrics.record_eviction();
            }
            debug!(key = %victim, "LRU eviction");
        }
        true
    }
}

/// Run the producer in its own task so a panic surfaces as an error, and
/// abort it when its deadline passes.
async fn run_producer<Fut>(ctx: &RequestContext, fut: Fut) -> LoadOutcome
where
    Fut: Future<Output = LoadOutcome> + Send + 'static,
{
    let mut handle = tokio::spawn(fut);
    tokio::select! {
        joined = &mut handle => match joined {
            Ok(outcome) => outcome,
            Err(e) => Err(RelayError::InternalError(format!("load task failed: {}", e)).into()),
        },
        err = ctx.done() => {
            handle.abort();
            Err(err.into())
        }
    }
}
