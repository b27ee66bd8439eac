use crate::metrics::Metrics;
use crate::types::Plan;
use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Deterministic hash identifying a cacheable request (lowercase hex SHA-256).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn new(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 hex characters, for log lines.
    pub fn short(&self) -> &str {
        self.0.get(..12).unwrap_or(&self.0)
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A cached plan plus its bookkeeping.
///
/// The plan sits behind an `Arc` and is never mutated in place; readers get
/// a deep copy, so eviction is safe at any time.
#[derive(Debug, Clone)]
pub struct PlanCacheEntry {
    pub fingerprint: Fingerprint,
    pub plan: Arc<Plan>,
    pub created_at: Instant,
    pub last_accessed_at: Instant,
    pub hit_count: u64,
    pub ttl: Duration,
}

impl PlanCacheEntry {
    fn new(fingerprint: Fingerprint, plan: Plan, ttl: Duration) -> Self {
        let now = Instant::now();
        Self {
            fingerprint,
            plan: Arc::new(plan),
            created_at: now,
            last_accessed_at: now,
            hit_count: 0,
            ttl,
        }
    }

    pub fn is_expired_at(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.created_at) >= self.ttl
    }
}

/// Fingerprint-keyed plan cache with bounded-size LRU eviction and TTL.
///
/// One lock serializes every structural change (insert, evict, recency
/// update); plan copies are taken outside the lock.
pub struct PlanCache {
    entries: Mutex<LruCache<Fingerprint, PlanCacheEntry>>,
    ttl: Duration,
    metrics: Option<Arc<Metrics>>,
}

impl PlanCache {
    /// A capacity of zero is treated as one.
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            ttl,
            metrics: None,
        }
    }

    /// Count evictions in `metrics`.
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn capacity(&self) -> usize {
        self.entries.lock().cap().get()
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Whether a live entry exists. Does not touch recency.
    pub fn contains(&self, fingerprint: &Fingerprint) -> bool {
        let entries = self.entries.lock();
        entries
            .peek(fingerprint)
            .is_some_and(|e| !e.is_expired_at(Instant::now()))
    }

    /// Bookkeeping for an entry without touching recency.
    pub fn peek(&self, fingerprint: &Fingerprint) -> Option<PlanCacheEntry> {
        self.entries.lock().peek(fingerprint).cloned()
    }

    /// Look up a plan. On a hit, returns a deep copy with every task reset
    /// to `Pending`, bumps `hit_count` and marks the entry most recently
    /// used. Expired entries are dropped and reported as a miss.
    pub fn get(&self, fingerprint: &Fingerprint) -> Option<Plan> {
        let now = Instant::now();
        let plan = {
            let mut entries = self.entries.lock();
            let expired = entries.peek(fingerprint)?.is_expired_at(now);
            if expired {
                entries.pop(fingerprint);
                drop(entries);
                debug!(fingerprint = fingerprint.short(), "Cached plan expired");
                self.count_evictions(1);
                return None;
            }
            let entry = entries.get_mut(fingerprint)?;
            entry.hit_count += 1;
            entry.last_accessed_at = now;
            Arc::clone(&entry.plan)
        };
        Some(plan.fresh_copy())
    }

    /// Insert or replace a plan. At capacity, the least recently used entry
    /// is evicted first; its fingerprint is returned.
    pub fn put(&self, fingerprint: Fingerprint, plan: Plan) -> Option<Fingerprint> {
        let entry = PlanCacheEntry::new(fingerprint.clone(), plan.fresh_copy(), self.ttl);
        let evicted = {
            let mut entries = self.entries.lock();
            match entries.push(fingerprint.clone(), entry) {
                Some((old, _)) if old != fingerprint => Some(old),
                _ => None,
            }
        };
        if let Some(old) = &evicted {
            debug!(evicted = old.short(), "Plan cache at capacity, evicted LRU entry");
            self.count_evictions(1);
        }
        evicted
    }

    /// Remove every entry past its TTL. Returns how many were removed.
    pub fn evict_expired(&self) -> usize {
        let now = Instant::now();
        let removed = {
            let mut entries = self.entries.lock();
            let expired: Vec<Fingerprint> = entries
                .iter()
                .filter(|(_, e)| e.is_expired_at(now))
                .map(|(fp, _)| fp.clone())
                .collect();
            for fp in &expired {
                entries.pop(fp);
            }
            expired.len()
        };
        if removed > 0 {
            self.count_evictions(removed);
        }
        removed
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    /// Run [`PlanCache::evict_expired`] every `interval` until the handle
    /// is aborted.
    pub fn spawn_expiry_task(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let removed = self.evict_expired();
                if removed > 0 {
                    info!(removed, remaining = self.len(), "Plan cache expiry sweep");
                }
            }
        })
    }

    fn count_evictions(&self, count: usize) {
        if let Some(metrics) = &self.metrics {
            metrics.record_cache_evictions(count);
        }
    }
}
