//! # Cache Manager Module
//!
//! ## Purpose
//! Public-facing core API of the mirror. Resolves lookups against the
//! persistent store, classifies hit/stale/miss, enqueues fetch jobs,
//! answers tag searches, and reports operational statistics.
//!
//! ## Input/Output Specification
//! - **Input**: anime identifiers, tag queries, raw-document streams
//! - **Output**: lookup classifications, lazy search results, stats
//!
//! ## Key Features
//! - Lookups never fail: read faults downgrade to `Miss` and are logged
//! - Miss/stale lookups enqueue a fetch and return immediately; callers
//!   never wait on the throttle or the quota
//! - Unexpired negative-cache markers suppress re-enqueueing
//! - `bulk_index` populates the store directly, bypassing network and quota

use crate::config::{FetcherConfig, SearchConfig};
use crate::document;
use crate::errors::Result;
use crate::queue::JobQueue;
use crate::quota::QuotaTracker;
use crate::storage::{ReconcileReport, RecordIter, Store};
use crate::{AnimeId, AnimeRecord};
use chrono::{DateTime, Duration, Utc};
use futures::{Stream, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Outcome of a cache lookup
#[derive(Debug)]
pub enum Lookup {
    /// Fresh record served from the cache
    Hit(AnimeRecord),
    /// Record served from the cache; a refresh has been queued
    Stale(AnimeRecord),
    /// Nothing cached; a fetch has been queued unless negative-cached
    Miss,
}

/// Record age classification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Freshness {
    Fresh,
    Stale,
}

fn freshness(fetched_at: DateTime<Utc>, now: DateTime<Utc>, threshold: Duration) -> Freshness {
    if now - fetched_at > threshold {
        Freshness::Stale
    } else {
        Freshness::Fresh
    }
}

/// Operational statistics snapshot
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    /// Indexed anime in the cache
    pub cached_anime: usize,
    /// Jobs waiting in the fetch queue
    pub queue_depth: usize,
    /// Whether a fetch is currently in flight
    pub in_flight: bool,
    /// Upstream calls consumed today
    pub quota_used: u32,
    /// Configured daily call limit
    pub daily_limit: u32,
    /// Next UTC-midnight quota reset
    pub next_reset: DateTime<Utc>,
    /// Active negative-cache markers
    pub negative_cached: usize,
    /// Whether the worker halted on an upstream authentication failure
    pub worker_halted: bool,
}

/// Outcome of a bulk indexing run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BulkIndexReport {
    /// Documents stored and indexed
    pub indexed: usize,
    /// Documents rejected by the parser
    pub failed: usize,
}

/// Public cache API shared by the gateway and the seed importer
#[derive(Clone)]
pub struct CacheManager {
    store: Arc<Store>,
    queue: Arc<JobQueue>,
    quota: Arc<Mutex<QuotaTracker>>,
    halted: Arc<AtomicBool>,
    staleness: Duration,
    min_tag_weight: u32,
}

impl CacheManager {
    pub fn new(
        store: Arc<Store>,
        queue: Arc<JobQueue>,
        quota: Arc<Mutex<QuotaTracker>>,
        halted: Arc<AtomicBool>,
        fetcher: &FetcherConfig,
        search: &SearchConfig,
    ) -> Self {
        Self {
            store,
            queue,
            quota,
            halted,
            staleness: fetcher.staleness_threshold(),
            min_tag_weight: search.min_tag_weight,
        }
    }

    /// Resolve a lookup. Never fails; read faults downgrade to `Miss`.
    ///
    /// Miss and stale outcomes enqueue a fetch and return immediately; the
    /// caller is expected to poll again later.
    pub async fn lookup(&self, aid: AnimeId) -> Lookup {
        if aid == 0 {
            tracing::debug!("Rejecting lookup for invalid aid 0");
            return Lookup::Miss;
        }

        let now = Utc::now();
        match self.store.get_record(aid) {
            Ok(Some(record)) => match freshness(record.fetched_at, now, self.staleness) {
                Freshness::Fresh => Lookup::Hit(record),
                Freshness::Stale => {
                    self.enqueue_fetch(aid);
                    Lookup::Stale(record)
                }
            },
            Ok(None) => {
                self.enqueue_unless_negative_cached(aid, now);
                Lookup::Miss
            }
            Err(e) => {
                tracing::warn!("Read fault for aid {}, downgrading to Miss: {}", aid, e);
                self.enqueue_fetch(aid);
                Lookup::Miss
            }
        }
    }

    /// Enqueue a fetch unless an unexpired negative-cache marker suppresses
    /// it.
    fn enqueue_unless_negative_cached(&self, aid: AnimeId, now: DateTime<Utc>) {
        match self.store.get_marker(aid) {
            Ok(Some(marker)) if !marker.is_expired(now) => {
                tracing::debug!(
                    "Fetch for aid {} suppressed by negative cache until {}",
                    aid,
                    marker.expires_at
                );
            }
            Ok(_) => {
                self.enqueue_fetch(aid);
            }
            Err(e) => {
                tracing::warn!("Negative-cache read fault for aid {}: {}", aid, e);
                self.enqueue_fetch(aid);
            }
        }
    }

    /// Idempotent fetch enqueue: a no-op while a job for the identifier is
    /// queued or in flight. Returns whether a new job was added.
    pub fn enqueue_fetch(&self, aid: AnimeId) -> bool {
        let added = self.queue.enqueue(aid);
        if added {
            tracing::debug!("Queued fetch for aid {}", aid);
        }
        added
    }

    /// Lazy, finite, restartable search over the index.
    ///
    /// A record matches when any of its tags equals any query tag
    /// (case-insensitively) at or above the configured minimum weight.
    /// Mature records are excluded unless `allow_mature` is set.
    pub fn search(&self, tags: &[String], allow_mature: bool) -> TagSearch {
        TagSearch {
            inner: self.store.iter_records(),
            wanted: tags.iter().map(|t| t.trim().to_string()).collect(),
            allow_mature,
            min_weight: self.min_tag_weight,
        }
    }

    /// Raw document bytes for an identifier, when cached.
    pub fn raw_document(&self, aid: AnimeId) -> Result<Option<Vec<u8>>> {
        self.store.get_raw(aid)
    }

    /// Consistent operational snapshot.
    pub fn stats(&self) -> CacheStats {
        let today = Utc::now().date_naive();
        let (snapshot, daily_limit, next_reset) = {
            let mut quota = self.quota.lock();
            (
                quota.snapshot(today),
                quota.daily_limit(),
                quota.next_reset(today),
            )
        };

        CacheStats {
            cached_anime: self.store.record_count(),
            queue_depth: self.queue.depth(),
            in_flight: self.queue.in_flight().is_some(),
            quota_used: snapshot.count_used,
            daily_limit,
            next_reset,
            negative_cached: self.store.negative_count(),
            worker_halted: self.halted.load(Ordering::SeqCst),
        }
    }

    /// Index a stream of raw documents directly, bypassing the network path
    /// and the quota. Used by the external seed importer when the store is
    /// empty at first startup.
    ///
    /// Documents the parser rejects are counted and skipped; storage faults
    /// abort the run.
    pub async fn bulk_index<S>(&self, docs: S) -> Result<BulkIndexReport>
    where
        S: Stream<Item = (AnimeId, Vec<u8>)>,
    {
        futures::pin_mut!(docs);

        let mut report = BulkIndexReport::default();
        while let Some((aid, raw)) = docs.next().await {
            match document::parse_document(aid, &raw) {
                Ok(parsed) => {
                    let record = parsed.into_record(aid, Utc::now(), 0);
                    self.store.put_document(&record, &raw).await?;
                    report.indexed += 1;
                    if report.indexed % 1000 == 0 {
                        tracing::info!("Bulk index progress: {} documents", report.indexed);
                    }
                }
                Err(e) => {
                    report.failed += 1;
                    tracing::warn!("Bulk index skipping aid {}: {}", aid, e);
                }
            }
        }

        self.store.flush().await?;
        tracing::info!(
            "Bulk index complete: {} indexed, {} failed",
            report.indexed,
            report.failed
        );
        Ok(report)
    }

    /// Run a reconciliation pass over the raw store.
    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        self.store.reconcile(Utc::now()).await
    }
}

/// Lazy search cursor; restartable by calling [`CacheManager::search`]
/// again.
pub struct TagSearch {
    inner: RecordIter,
    wanted: Vec<String>,
    allow_mature: bool,
    min_weight: u32,
}

impl Iterator for TagSearch {
    type Item = AnimeRecord;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let record = self.inner.next()?;
            if record.mature && !self.allow_mature {
                continue;
            }
            if record.matches_tags(&self.wanted, self.min_weight) {
                return Some(record);
            }
        }
    }
}
