//! # Fetch Worker Module
//!
//! ## Purpose
//! Single serialized background task that drains the fetch queue. Enforces
//! the global minimum spacing between upstream calls and the daily quota,
//! invokes the upstream client, and writes results raw-first into the
//! persistent store.
//!
//! ## Key Features
//! - Upstream calls are never issued in parallel; pacing is a correctness
//!   requirement of the upstream service
//! - Quota exhaustion suspends fetching until the next UTC day; queued jobs
//!   remain pending and none are dropped
//! - Transient failures retry with exponential backoff up to the configured
//!   attempt budget, then negative-cache
//! - Confirmed-missing identifiers are negative-cached immediately
//! - An upstream authentication failure halts the loop entirely; the cache
//!   keeps serving existing data
//!
//! Per-job state machine: `Queued → InFlight → {Persisted |
//! RequeuedWithBackoff → InFlight | FailedPermanent}`.

use crate::config::FetcherConfig;
use crate::document;
use crate::queue::{Dequeue, FetchJob, JobQueue};
use crate::quota::QuotaTracker;
use crate::storage::Store;
use crate::upstream::{FetchError, UpstreamClient};
use crate::{AnimeId, FailureKind, FailureMarker};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::time::{Duration, Instant};

/// Result of one worker cycle
#[derive(Debug)]
pub enum StepOutcome {
    /// Document fetched, persisted, and indexed
    Fetched(AnimeId),
    /// Transient failure; job requeued with backoff
    Requeued(AnimeId),
    /// Job dropped and a failure marker written
    NegativeCached(AnimeId),
    /// Queue is empty
    Idle,
    /// All queued jobs are backing off until the given instant
    WaitUntil(Instant),
    /// Daily quota spent; suspend until the given reset time
    QuotaExhausted(DateTime<Utc>),
    /// Worker halted after an upstream authentication failure
    Halted,
}

/// Rate-limited fetch worker
pub struct FetchWorker {
    client: Arc<dyn UpstreamClient>,
    store: Arc<Store>,
    queue: Arc<JobQueue>,
    quota: Arc<Mutex<QuotaTracker>>,
    halted: Arc<AtomicBool>,
    config: FetcherConfig,
    last_call: Option<Instant>,
}

impl FetchWorker {
    pub fn new(
        client: Arc<dyn UpstreamClient>,
        store: Arc<Store>,
        queue: Arc<JobQueue>,
        quota: Arc<Mutex<QuotaTracker>>,
        halted: Arc<AtomicBool>,
        config: FetcherConfig,
    ) -> Self {
        Self {
            client,
            store,
            queue,
            quota,
            halted,
            config,
            last_call: None,
        }
    }

    /// Drain the queue until halted. Sleeps rather than polls: on an empty
    /// queue it waits for an enqueue notification, on backoff for the
    /// eligibility instant, on quota exhaustion for the UTC day reset.
    pub async fn run(mut self) {
        tracing::info!("Fetch worker started");
        loop {
            match self.step().await {
                StepOutcome::Fetched(_)
                | StepOutcome::Requeued(_)
                | StepOutcome::NegativeCached(_) => {}
                StepOutcome::Idle => self.queue.notified().await,
                StepOutcome::WaitUntil(at) => tokio::time::sleep_until(at).await,
                StepOutcome::QuotaExhausted(reset_at) => {
                    tracing::info!("Daily quota exhausted, suspending fetches until {}", reset_at);
                    let wait = (reset_at - Utc::now())
                        .to_std()
                        .unwrap_or(Duration::from_secs(1));
                    tokio::time::sleep(wait).await;
                }
                StepOutcome::Halted => {
                    tracing::error!(
                        "Fetch worker halted: upstream authentication failure, operator action required"
                    );
                    return;
                }
            }
        }
    }

    /// Run one cycle: gate on quota, dequeue, pace, fetch, persist or
    /// reclassify.
    pub async fn step(&mut self) -> StepOutcome {
        if self.halted.load(Ordering::SeqCst) {
            return StepOutcome::Halted;
        }

        // Quota gate before dequeueing, so suspended jobs stay pending.
        {
            let today = Utc::now().date_naive();
            let mut quota = self.quota.lock();
            if !quota.can_consume(today) {
                return StepOutcome::QuotaExhausted(quota.next_reset(today));
            }
        }

        let mut job = match self.queue.pop_ready() {
            Dequeue::Ready(job) => job,
            Dequeue::NotBefore(at) => return StepOutcome::WaitUntil(at),
            Dequeue::Empty => return StepOutcome::Idle,
        };

        // Global pacing across all identifiers.
        if let Some(last) = self.last_call {
            tokio::time::sleep_until(last + Duration::from_secs(self.config.throttle_seconds))
                .await;
        }
        self.last_call = Some(Instant::now());

        tracing::debug!("Fetching aid {} (attempt {})", job.aid, job.attempt_count + 1);
        let result = self.client.fetch(job.aid).await;
        job.attempt_count += 1;

        // Every completed upstream call counts against the quota, successful
        // or not.
        self.consume_quota();

        match result {
            Ok(raw) => self.persist(job, raw).await,
            Err(FetchError::Transient { details }) => self.backoff_or_drop(job, &details),
            Err(FetchError::NotFound) => self.negative_cache(job, FailureKind::NotFound),
            Err(FetchError::Auth { details }) => {
                self.halted.store(true, Ordering::SeqCst);
                tracing::error!(
                    "Upstream authentication failure fetching aid {}: {}",
                    job.aid,
                    details
                );
                // The job keeps its place for whenever fetching resumes.
                self.queue.requeue_front(job);
                StepOutcome::Halted
            }
        }
    }

    fn consume_quota(&self) {
        let today = Utc::now().date_naive();
        let mut quota = self.quota.lock();
        quota.consume(today);
        let snapshot = quota.snapshot(today);
        if let Err(e) = self.store.save_quota(&snapshot) {
            tracing::warn!("Failed to persist quota snapshot: {}", e);
        }
    }

    /// Parse and persist a fetched document: raw blob first, then the index
    /// row.
    async fn persist(&self, job: FetchJob, raw: Vec<u8>) -> StepOutcome {
        match document::parse_document(job.aid, &raw) {
            Ok(parsed) => {
                let record = parsed.into_record(job.aid, Utc::now(), job.attempt_count);
                match self.store.put_document(&record, &raw).await {
                    Ok(()) => {
                        self.queue.complete(job.aid);
                        tracing::info!("Cached aid {} ({} bytes)", job.aid, raw.len());
                        StepOutcome::Fetched(job.aid)
                    }
                    Err(e) => {
                        tracing::error!("Failed to persist aid {}: {}", job.aid, e);
                        self.backoff_or_drop(job, &e.to_string())
                    }
                }
            }
            Err(e) => {
                // A 200 response that does not parse is treated as transient;
                // it must never reach the store.
                tracing::warn!("Unparseable document for aid {}: {}", job.aid, e);
                self.backoff_or_drop(job, &e.to_string())
            }
        }
    }

    /// Requeue with exponential backoff, or negative-cache once the attempt
    /// budget is spent.
    fn backoff_or_drop(&self, mut job: FetchJob, details: &str) -> StepOutcome {
        if job.attempt_count >= self.config.max_attempts {
            tracing::warn!(
                "Giving up on aid {} after {} attempts: {}",
                job.aid,
                job.attempt_count,
                details
            );
            return self.negative_cache(job, FailureKind::RetriesExhausted);
        }

        let delay = backoff_delay(&self.config, job.attempt_count);
        tracing::warn!(
            "Transient failure for aid {} (attempt {}): {}; retrying in {}s",
            job.aid,
            job.attempt_count,
            details,
            delay.as_secs()
        );
        let aid = job.aid;
        job.not_before = Some(Instant::now() + delay);
        self.queue.requeue(job);
        StepOutcome::Requeued(aid)
    }

    /// Drop the job and write a failure marker so lookups report `Miss`
    /// without looping forever.
    fn negative_cache(&self, job: FetchJob, kind: FailureKind) -> StepOutcome {
        let now = Utc::now();
        let ttl = match kind {
            FailureKind::NotFound => self.config.not_found_ttl(),
            FailureKind::RetriesExhausted => self.config.retry_exhausted_ttl(),
        };
        let marker = FailureMarker {
            kind,
            recorded_at: now,
            expires_at: now + ttl,
            attempts: job.attempt_count,
        };
        if let Err(e) = self.store.put_marker(job.aid, &marker) {
            tracing::error!("Failed to write failure marker for aid {}: {}", job.aid, e);
        }
        self.queue.complete(job.aid);
        tracing::warn!(
            "Negative-cached aid {} ({:?}) until {}",
            job.aid,
            kind,
            marker.expires_at
        );
        StepOutcome::NegativeCached(job.aid)
    }
}

/// Exponential backoff: base × 2^(attempt−1), capped.
fn backoff_delay(config: &FetcherConfig, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    let secs = config
        .backoff_base_seconds
        .saturating_mul(1u64 << exponent)
        .min(config.backoff_cap_seconds);
    Duration::from_secs(secs)
}
