//! Answer cache with single-flight computation and lazy invalidation.
//!
//! [`QueryCache::get_or_compute`] is the only way answers enter the cache:
//!
//! 1. Look the key up in the [`CacheStore`]. A valid entry is a hit.
//! 2. On a miss, join the in-flight computation for the same key if there
//!    is one; otherwise spawn it as a task and register it.
//! 3. The task re-checks the store, runs `compute`, stores a successful
//!    result, and deregisters itself (also on panic). An answer found by the
//!    re-check is reported as a hit.
//!
//! The computation is a spawned task shared through a [`Shared`] future, and
//! every caller waiting on it holds a waiter registration. A caller that
//! times out or disconnects drops its registration; the task keeps running
//! for the others. When the last waiter goes away the task is aborted and
//! deregistered, which releases whatever it holds (a concurrency permit, an
//! open provider request).
//!
//! # Validity
//!
//! An entry is valid while its key carries the local corpus epoch, its
//! corpus version equals the current [`CorpusVersion`], and its TTL has not
//! elapsed. All three are checked on read. Stale and expired entries are
//! removed there; entries from another epoch belong to another process
//! sharing the store and are left alone. Nothing ever sweeps the store.
//! Entries live at a *slot* derived from the key without its corpus epoch
//! or version, so a newer answer for the same query replaces the older one
//! in place.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::task::AbortHandle;
use tracing::{debug, warn};

use crate::error::PipelineError;
use crate::metrics::{MetricsCollector, Outcome, Stage};
use crate::models::{ContextPassage, CorpusVersion};

// ============ Keys ============

/// How query text is normalised into a cache key.
#[derive(Debug, Clone)]
pub struct KeyRules {
    /// Keep letter case as typed. Default: `false` (lower-case).
    pub case_sensitive: bool,
    /// Collapse runs of whitespace to one space and trim. Default: `true`.
    pub collapse_whitespace: bool,
    /// Distinguish keys by `top_k`. Default: `true`.
    pub include_top_k: bool,
}

impl Default for KeyRules {
    fn default() -> Self {
        Self {
            case_sensitive: false,
            collapse_whitespace: true,
            include_top_k: true,
        }
    }
}

/// Deterministic cache key for a query against one corpus version.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueryKey {
    pub query_text: String,
    /// Identity of the corpus the version counts in; see [`CorpusVersion`].
    #[serde(default)]
    pub corpus_epoch: String,
    pub corpus_version: u64,
    pub top_k: Option<usize>,
    pub model_id: String,
}

impl QueryKey {
    pub fn new(
        query: &str,
        corpus_epoch: &str,
        corpus_version: u64,
        top_k: usize,
        model_id: &str,
        rules: &KeyRules,
    ) -> Self {
        let mut text = if rules.collapse_whitespace {
            query.split_whitespace().collect::<Vec<_>>().join(" ")
        } else {
            query.to_string()
        };
        if !rules.case_sensitive {
            text = text.to_lowercase();
        }
        Self {
            query_text: text,
            corpus_epoch: corpus_epoch.to_string(),
            corpus_version,
            top_k: rules.include_top_k.then_some(top_k),
            model_id: model_id.to_string(),
        }
    }

    /// Storage slot: SHA-256 over everything except the corpus epoch and
    /// version.
    pub fn slot(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.model_id.as_bytes());
        hasher.update([0u8]);
        hasher.update(self.top_k.map(|k| k.to_string()).unwrap_or_default().as_bytes());
        hasher.update([0u8]);
        hasher.update(self.query_text.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    fn same_query(&self, other: &QueryKey) -> bool {
        self.query_text == other.query_text
            && self.top_k == other.top_k
            && self.model_id == other.model_id
    }
}

// ============ Entries and stores ============

/// A cached answer with its provenance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: QueryKey,
    pub answer: String,
    pub retrieved_chunk_ids: Vec<String>,
    #[serde(default)]
    pub passages: Vec<ContextPassage>,
    pub created_at: DateTime<Utc>,
    /// Time to live in milliseconds; `0` never expires.
    pub ttl_ms: u64,
}

impl CacheEntry {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        if self.ttl_ms == 0 {
            return false;
        }
        let age = now.signed_duration_since(self.created_at);
        age.num_milliseconds() >= self.ttl_ms as i64
    }
}

/// Backing storage for cache entries, keyed by [`QueryKey::slot`].
///
/// Implementations enforce their own capacity. Errors are never fatal: the
/// cache layer logs them and carries on as if the entry were absent.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Backend name for logs and stats (e.g. `"memory"`, `"redis"`).
    fn name(&self) -> &str;
    async fn get(&self, slot: &str) -> Result<Option<CacheEntry>>;
    async fn put(&self, slot: &str, entry: CacheEntry) -> Result<()>;
    async fn remove(&self, slot: &str) -> Result<()>;
    async fn len(&self) -> Result<usize>;
}

/// Bounded in-process store with least-recently-used eviction.
pub struct InMemoryCacheStore {
    entries: Mutex<LruCache<String, CacheEntry>>,
    evictions: AtomicU64,
}

impl InMemoryCacheStore {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            evictions: AtomicU64::new(0),
        }
    }

    /// Entries dropped to make room for newer ones.
    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl CacheStore for InMemoryCacheStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn get(&self, slot: &str) -> Result<Option<CacheEntry>> {
        Ok(self.entries.lock().get(slot).cloned())
    }

    async fn put(&self, slot: &str, entry: CacheEntry) -> Result<()> {
        let displaced = self.entries.lock().push(slot.to_string(), entry);
        if let Some((old_slot, _)) = displaced {
            if old_slot != slot {
                self.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }
        Ok(())
    }

    async fn remove(&self, slot: &str) -> Result<()> {
        self.entries.lock().pop(slot);
        Ok(())
    }

    async fn len(&self) -> Result<usize> {
        Ok(self.entries.lock().len())
    }
}

// ============ Cache layer ============

/// What a successful computation produces.
#[derive(Debug, Clone, PartialEq)]
pub struct Computed {
    pub answer: String,
    pub retrieved_chunk_ids: Vec<String>,
    /// The context the answer was generated from, best match first.
    pub passages: Vec<ContextPassage>,
}

/// How a [`QueryCache::get_or_compute`] call was satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheOutcome {
    /// Served from a valid stored entry, possibly one found after joining
    /// or starting a computation.
    Hit,
    /// This call started the computation.
    Computed,
    /// This call joined a computation started by another caller.
    Shared,
}

#[derive(Debug, Clone)]
pub struct CachedAnswer {
    pub answer: String,
    pub retrieved_chunk_ids: Vec<String>,
    pub passages: Vec<ContextPassage>,
    pub outcome: CacheOutcome,
}

impl CachedAnswer {
    fn new(computed: Computed, outcome: CacheOutcome) -> Self {
        Self {
            answer: computed.answer,
            retrieved_chunk_ids: computed.retrieved_chunk_ids,
            passages: computed.passages,
            outcome,
        }
    }
}

impl From<CacheEntry> for Computed {
    fn from(entry: CacheEntry) -> Self {
        Self {
            answer: entry.answer,
            retrieved_chunk_ids: entry.retrieved_chunk_ids,
            passages: entry.passages,
        }
    }
}

/// Cache layer parameters, decoupled from application config.
#[derive(Debug, Clone)]
pub struct CacheParams {
    pub ttl: Duration,
    pub key_rules: KeyRules,
}

impl Default for CacheParams {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(600),
            key_rules: KeyRules::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    pub backend: String,
    pub hits: u64,
    pub misses: u64,
    pub shared_waits: u64,
    pub stale_evictions: u64,
    pub expirations: u64,
    pub stale_results_skipped: u64,
    pub store_errors: u64,
    pub in_flight: usize,
    pub entries: Option<usize>,
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    shared_waits: AtomicU64,
    stale_evictions: AtomicU64,
    expirations: AtomicU64,
    stale_results_skipped: AtomicU64,
    store_errors: AtomicU64,
}

/// What a flight resolves to. `reused` marks an answer the flight found in
/// the store instead of computing it.
#[derive(Clone)]
struct Landed {
    computed: Computed,
    reused: bool,
}

type Flight = Shared<BoxFuture<'static, Result<Landed, PipelineError>>>;

struct InFlight {
    id: u64,
    flight: Flight,
    waiters: usize,
    abort: AbortHandle,
}

pub struct QueryCache {
    store: Arc<dyn CacheStore>,
    corpus: Arc<CorpusVersion>,
    metrics: Arc<MetricsCollector>,
    params: CacheParams,
    in_flight: Mutex<HashMap<QueryKey, InFlight>>,
    next_flight_id: AtomicU64,
    counters: Counters,
}

impl QueryCache {
    pub fn new(
        store: Arc<dyn CacheStore>,
        corpus: Arc<CorpusVersion>,
        metrics: Arc<MetricsCollector>,
        params: CacheParams,
    ) -> Self {
        Self {
            store,
            corpus,
            metrics,
            params,
            in_flight: Mutex::new(HashMap::new()),
            next_flight_id: AtomicU64::new(0),
            counters: Counters::default(),
        }
    }

    pub fn key_rules(&self) -> &KeyRules {
        &self.params.key_rules
    }

    /// Build a key for `query` against the current corpus version.
    pub fn key_for(&self, query: &str, top_k: usize, model_id: &str) -> QueryKey {
        QueryKey::new(
            query,
            self.corpus.epoch(),
            self.corpus.current(),
            top_k,
            model_id,
            &self.params.key_rules,
        )
    }

    /// Return the cached answer for `key`, or compute it at most once.
    ///
    /// Concurrent calls with an equal key share one invocation of `compute`
    /// and receive identical results, including identical errors. A failed
    /// computation is not cached; the next call computes again. Dropping
    /// the returned future withdraws this caller from the computation.
    pub async fn get_or_compute<F, Fut>(
        self: &Arc<Self>,
        key: QueryKey,
        compute: F,
    ) -> Result<CachedAnswer, PipelineError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Computed, PipelineError>> + Send + 'static,
    {
        let started = Instant::now();

        if let Some(entry) = self.lookup(&key).await {
            self.record_hit(started.elapsed());
            return Ok(CachedAnswer::new(entry.into(), CacheOutcome::Hit));
        }
        let lookup_latency = started.elapsed();

        let (flight, outcome, mut waiter) = {
            let mut in_flight = self.in_flight.lock();
            let (flight, outcome, id) = match in_flight.entry(key.clone()) {
                Entry::Occupied(mut joined) => {
                    let joined = joined.get_mut();
                    joined.waiters += 1;
                    self.counters.shared_waits.fetch_add(1, Ordering::Relaxed);
                    (joined.flight.clone(), CacheOutcome::Shared, joined.id)
                }
                Entry::Vacant(slot) => {
                    let id = self.next_flight_id.fetch_add(1, Ordering::Relaxed);
                    let (flight, abort) = self.launch(key.clone(), id, compute);
                    slot.insert(InFlight {
                        id,
                        flight: flight.clone(),
                        waiters: 1,
                        abort,
                    });
                    (flight, CacheOutcome::Computed, id)
                }
            };
            let waiter = WaiterGuard {
                cache: Arc::clone(self),
                key,
                id,
                lookup_latency,
                settled: false,
            };
            (flight, outcome, waiter)
        };

        let landed = flight.await;
        match &landed {
            Ok(landed) if landed.reused => {
                waiter.settled = true;
                self.record_hit(started.elapsed());
            }
            _ => waiter.settle_as_miss(),
        }
        let landed = landed?;
        let outcome = if landed.reused {
            CacheOutcome::Hit
        } else {
            outcome
        };
        Ok(CachedAnswer::new(landed.computed, outcome))
    }

    fn record_hit(&self, latency: Duration) {
        self.counters.hits.fetch_add(1, Ordering::Relaxed);
        self.metrics
            .record(Stage::CacheHit, latency, Outcome::Success);
    }

    fn record_miss(&self, latency: Duration) {
        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        self.metrics
            .record(Stage::CacheMiss, latency, Outcome::Success);
    }

    /// Spawn the computation for `key`. Must be called with the in-flight
    /// lock held so the task cannot deregister before it is registered.
    fn launch<F, Fut>(self: &Arc<Self>, key: QueryKey, id: u64, compute: F) -> (Flight, AbortHandle)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Computed, PipelineError>> + Send + 'static,
    {
        let cache = Arc::clone(self);
        let handle = tokio::spawn(async move { cache.run_flight(key, id, compute).await });
        let abort = handle.abort_handle();

        let flight = async move {
            match handle.await {
                Ok(result) => result,
                Err(join_err) => Err(PipelineError::Internal(format!(
                    "answer computation aborted: {}",
                    join_err
                ))),
            }
        }
        .boxed()
        .shared();
        (flight, abort)
    }

    async fn run_flight<F, Fut>(
        self: Arc<Self>,
        key: QueryKey,
        id: u64,
        compute: F,
    ) -> Result<Landed, PipelineError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Computed, PipelineError>>,
    {
        let _registration = FlightGuard {
            cache: Arc::clone(&self),
            key: key.clone(),
            id,
        };

        // A previous flight may have stored the answer between our lookup
        // and our registration.
        if let Some(entry) = self.lookup(&key).await {
            debug!(slot = %key.slot(), "answer stored by a previous flight");
            return Ok(Landed {
                computed: entry.into(),
                reused: true,
            });
        }

        let computed = compute().await?;
        self.store_result(&key, &computed).await;
        Ok(Landed {
            computed,
            reused: false,
        })
    }

    async fn store_result(&self, key: &QueryKey, computed: &Computed) {
        let current = self.corpus.current();
        if key.corpus_version != current {
            self.counters
                .stale_results_skipped
                .fetch_add(1, Ordering::Relaxed);
            debug!(
                key_version = key.corpus_version,
                current, "corpus changed during computation; not caching"
            );
            return;
        }

        let started = Instant::now();
        let entry = CacheEntry {
            key: key.clone(),
            answer: computed.answer.clone(),
            retrieved_chunk_ids: computed.retrieved_chunk_ids.clone(),
            passages: computed.passages.clone(),
            created_at: Utc::now(),
            ttl_ms: self.params.ttl.as_millis() as u64,
        };
        match self.store.put(&key.slot(), entry).await {
            Ok(()) => {
                self.metrics
                    .record(Stage::CacheStore, started.elapsed(), Outcome::Success);
            }
            Err(e) => {
                self.counters.store_errors.fetch_add(1, Ordering::Relaxed);
                self.metrics
                    .record(Stage::CacheStore, started.elapsed(), Outcome::Error);
                warn!(backend = self.store.name(), error = %e, "failed to store answer");
            }
        }
    }

    /// Fetch a valid entry, removing it if stale or expired.
    async fn lookup(&self, key: &QueryKey) -> Option<CacheEntry> {
        let slot = key.slot();
        let entry = match self.store.get(&slot).await {
            Ok(Some(entry)) => entry,
            Ok(None) => return None,
            Err(e) => {
                self.counters.store_errors.fetch_add(1, Ordering::Relaxed);
                self.metrics
                    .record(Stage::CacheStore, Duration::ZERO, Outcome::Error);
                warn!(backend = self.store.name(), error = %e, "cache lookup failed");
                return None;
            }
        };

        if !entry.key.same_query(key) {
            return None;
        }

        // Versions from another epoch count in a different corpus; the
        // entry says nothing about ours.
        if entry.key.corpus_epoch != self.corpus.epoch() {
            debug!(
                slot = %slot,
                entry_epoch = %entry.key.corpus_epoch,
                "ignoring cache entry from another corpus"
            );
            return None;
        }

        let current = self.corpus.current();
        if entry.key.corpus_version != current {
            self.counters.stale_evictions.fetch_add(1, Ordering::Relaxed);
            debug!(
                slot = %slot,
                entry_version = entry.key.corpus_version,
                current, "evicting stale cache entry"
            );
            self.remove_quietly(&slot).await;
            return None;
        }

        if entry.is_expired(Utc::now()) {
            self.counters.expirations.fetch_add(1, Ordering::Relaxed);
            self.remove_quietly(&slot).await;
            return None;
        }

        Some(entry)
    }

    async fn remove_quietly(&self, slot: &str) {
        if let Err(e) = self.store.remove(slot).await {
            self.counters.store_errors.fetch_add(1, Ordering::Relaxed);
            warn!(backend = self.store.name(), error = %e, "failed to remove cache entry");
        }
    }

    /// Number of keys currently being computed.
    pub fn in_flight(&self) -> usize {
        self.in_flight.lock().len()
    }

    pub async fn stats(&self) -> CacheStats {
        let entries = match self.store.len().await {
            Ok(n) => Some(n),
            Err(e) => {
                warn!(backend = self.store.name(), error = %e, "cache size unavailable");
                None
            }
        };
        let c = &self.counters;
        CacheStats {
            backend: self.store.name().to_string(),
            hits: c.hits.load(Ordering::Relaxed),
            misses: c.misses.load(Ordering::Relaxed),
            shared_waits: c.shared_waits.load(Ordering::Relaxed),
            stale_evictions: c.stale_evictions.load(Ordering::Relaxed),
            expirations: c.expirations.load(Ordering::Relaxed),
            stale_results_skipped: c.stale_results_skipped.load(Ordering::Relaxed),
            store_errors: c.store_errors.load(Ordering::Relaxed),
            in_flight: self.in_flight(),
            entries,
        }
    }
}

/// Deregisters a flight when its task ends, however it ends.
struct FlightGuard {
    cache: Arc<QueryCache>,
    key: QueryKey,
    id: u64,
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        let mut in_flight = self.cache.in_flight.lock();
        if in_flight.get(&self.key).is_some_and(|f| f.id == self.id) {
            in_flight.remove(&self.key);
        }
    }
}

/// One caller's interest in a flight.
///
/// Dropping the last waiter of a flight that is still registered aborts its
/// task. A waiter dropped before its answer arrived counts as a miss.
struct WaiterGuard {
    cache: Arc<QueryCache>,
    key: QueryKey,
    id: u64,
    lookup_latency: Duration,
    settled: bool,
}

impl WaiterGuard {
    fn settle_as_miss(&mut self) {
        self.settled = true;
        self.cache.record_miss(self.lookup_latency);
    }
}

impl Drop for WaiterGuard {
    fn drop(&mut self) {
        if !self.settled {
            self.cache.record_miss(self.lookup_latency);
        }

        let abandoned = {
            let mut in_flight = self.cache.in_flight.lock();
            match in_flight.get_mut(&self.key) {
                Some(flight) if flight.id == self.id => {
                    flight.waiters = flight.waiters.saturating_sub(1);
                    if flight.waiters == 0 {
                        in_flight.remove(&self.key)
                    } else {
                        None
                    }
                }
                _ => None,
            }
        };
        if let Some(flight) = abandoned {
            debug!(slot = %self.key.slot(), "all waiters gone; aborting computation");
            flight.abort.abort();
        }
    }
}
