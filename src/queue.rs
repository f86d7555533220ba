//! # Fetch Queue Module
//!
//! ## Purpose
//! Deduplicated FIFO of identifiers awaiting an upstream fetch. An
//! identifier is tracked from the moment it is enqueued until its job is
//! completed or dropped, so at most one job per identifier is ever pending
//! or in flight.
//!
//! ## Key Features
//! - Idempotent enqueue across both queued and in-flight jobs
//! - FIFO ordering among ready jobs; a job waiting out a backoff window
//!   does not block jobs behind it
//! - Wake-up notification for the worker so draining never busy-polls

use crate::AnimeId;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use tokio::sync::Notify;
use tokio::time::Instant;

/// One pending upstream fetch
#[derive(Debug, Clone)]
pub struct FetchJob {
    /// Identifier to fetch
    pub aid: AnimeId,
    /// When the job was first enqueued
    pub enqueued_at: DateTime<Utc>,
    /// Upstream attempts consumed so far
    pub attempt_count: u32,
    /// Earliest instant the job may run again (backoff), if any
    pub not_before: Option<Instant>,
}

/// Result of a dequeue attempt
#[derive(Debug)]
pub enum Dequeue {
    /// A job is ready to run; it is now in flight
    Ready(FetchJob),
    /// Jobs exist but all are backing off until the given instant
    NotBefore(Instant),
    /// The queue is empty
    Empty,
}

/// FIFO queue with dedup; pure state, no synchronization
#[derive(Debug, Default)]
pub struct FetchQueue {
    queue: VecDeque<FetchJob>,
    tracked: HashSet<AnimeId>,
    in_flight: Option<AnimeId>,
}

impl FetchQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a new job unless the identifier is already queued or in
    /// flight. Returns whether a job was added.
    pub fn enqueue(&mut self, aid: AnimeId, now: DateTime<Utc>) -> bool {
        if !self.tracked.insert(aid) {
            return false;
        }
        self.queue.push_back(FetchJob {
            aid,
            enqueued_at: now,
            attempt_count: 0,
            not_before: None,
        });
        true
    }

    /// Take the first ready job, marking it in flight.
    ///
    /// Relative order of the remaining jobs is preserved.
    pub fn pop_ready(&mut self, now: Instant) -> Dequeue {
        if self.queue.is_empty() {
            return Dequeue::Empty;
        }

        let ready_idx = self
            .queue
            .iter()
            .position(|job| job.not_before.map_or(true, |t| t <= now));

        match ready_idx {
            Some(idx) => {
                let job = self.queue.remove(idx).expect("index from position");
                self.in_flight = Some(job.aid);
                Dequeue::Ready(job)
            }
            None => {
                let earliest = self
                    .queue
                    .iter()
                    .filter_map(|job| job.not_before)
                    .min()
                    .expect("non-empty queue with no ready job has backoff times");
                Dequeue::NotBefore(earliest)
            }
        }
    }

    /// Drop an identifier's job after it was persisted or negative-cached.
    pub fn complete(&mut self, aid: AnimeId) {
        self.tracked.remove(&aid);
        if self.in_flight == Some(aid) {
            self.in_flight = None;
        }
    }

    /// Return an in-flight job to the back of the queue (backoff path).
    ///
    /// The identifier stays tracked throughout, so concurrent enqueues
    /// remain no-ops.
    pub fn requeue(&mut self, job: FetchJob) {
        if self.in_flight == Some(job.aid) {
            self.in_flight = None;
        }
        self.queue.push_back(job);
    }

    /// Return an in-flight job to the front of the queue, preserving its
    /// position (worker halt path).
    pub fn requeue_front(&mut self, job: FetchJob) {
        if self.in_flight == Some(job.aid) {
            self.in_flight = None;
        }
        self.queue.push_front(job);
    }

    /// Number of queued (not in-flight) jobs.
    pub fn depth(&self) -> usize {
        self.queue.len()
    }

    /// Identifier currently in flight, if any.
    pub fn in_flight(&self) -> Option<AnimeId> {
        self.in_flight
    }

    /// Whether the identifier has a pending or in-flight job.
    pub fn is_tracked(&self, aid: AnimeId) -> bool {
        self.tracked.contains(&aid)
    }
}

/// Thread-safe queue shared between the cache manager and the worker
pub struct JobQueue {
    inner: Mutex<FetchQueue>,
    notify: Notify,
}

impl JobQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(FetchQueue::new()),
            notify: Notify::new(),
        }
    }

    /// Idempotent enqueue; wakes the worker when a job was added.
    pub fn enqueue(&self, aid: AnimeId) -> bool {
        let added = self.inner.lock().enqueue(aid, Utc::now());
        if added {
            self.notify.notify_one();
        }
        added
    }

    pub fn pop_ready(&self) -> Dequeue {
        self.inner.lock().pop_ready(Instant::now())
    }

    pub fn complete(&self, aid: AnimeId) {
        self.inner.lock().complete(aid);
    }

    pub fn requeue(&self, job: FetchJob) {
        self.inner.lock().requeue(job);
    }

    pub fn requeue_front(&self, job: FetchJob) {
        self.inner.lock().requeue_front(job);
    }

    pub fn depth(&self) -> usize {
        self.inner.lock().depth()
    }

    pub fn in_flight(&self) -> Option<AnimeId> {
        self.inner.lock().in_flight()
    }

    pub fn is_tracked(&self, aid: AnimeId) -> bool {
        self.inner.lock().is_tracked(aid)
    }

    /// Wait until a job is enqueued.
    pub async fn notified(&self) {
        self.notify.notified().await;
    }
}

impl Default for JobQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Duration;

    #[test]
    fn test_enqueue_is_idempotent() {
        let mut queue = FetchQueue::new();
        assert!(queue.enqueue(1, Utc::now()));
        for _ in 0..10 {
            assert!(!queue.enqueue(1, Utc::now()));
        }
        assert_eq!(queue.depth(), 1);
    }

    #[test]
    fn test_fifo_ordering() {
        let mut queue = FetchQueue::new();
        for aid in [5, 2, 9] {
            queue.enqueue(aid, Utc::now());
        }
        let now = Instant::now();
        for expected in [5, 2, 9] {
            match queue.pop_ready(now) {
                Dequeue::Ready(job) => {
                    assert_eq!(job.aid, expected);
                    queue.complete(job.aid);
                }
                other => panic!("expected ready job, got {:?}", other),
            }
        }
        assert!(matches!(queue.pop_ready(now), Dequeue::Empty));
    }

    #[test]
    fn test_in_flight_blocks_reenqueue_until_complete() {
        let mut queue = FetchQueue::new();
        queue.enqueue(1, Utc::now());
        let job = match queue.pop_ready(Instant::now()) {
            Dequeue::Ready(job) => job,
            other => panic!("expected ready job, got {:?}", other),
        };
        assert_eq!(queue.in_flight(), Some(1));
        assert!(!queue.enqueue(1, Utc::now()));

        queue.complete(job.aid);
        assert!(queue.enqueue(1, Utc::now()));
    }

    #[test]
    fn test_backoff_job_does_not_block_ready_jobs() {
        let mut queue = FetchQueue::new();
        let now = Instant::now();

        queue.enqueue(1, Utc::now());
        let mut job = match queue.pop_ready(now) {
            Dequeue::Ready(job) => job,
            other => panic!("expected ready job, got {:?}", other),
        };
        job.attempt_count += 1;
        job.not_before = Some(now + Duration::from_secs(60));
        queue.requeue(job);

        queue.enqueue(2, Utc::now());
        match queue.pop_ready(now) {
            Dequeue::Ready(job) => assert_eq!(job.aid, 2),
            other => panic!("expected aid 2 ready, got {:?}", other),
        }
        queue.complete(2);

        // Only the backing-off job remains.
        match queue.pop_ready(now) {
            Dequeue::NotBefore(t) => assert!(t > now),
            other => panic!("expected backoff wait, got {:?}", other),
        }

        // Once the window passes the job is ready again with its attempts.
        match queue.pop_ready(now + Duration::from_secs(61)) {
            Dequeue::Ready(job) => {
                assert_eq!(job.aid, 1);
                assert_eq!(job.attempt_count, 1);
            }
            other => panic!("expected aid 1 ready, got {:?}", other),
        }
    }

    #[test]
    fn test_requeue_front_preserves_position() {
        let mut queue = FetchQueue::new();
        queue.enqueue(1, Utc::now());
        queue.enqueue(2, Utc::now());
        let job = match queue.pop_ready(Instant::now()) {
            Dequeue::Ready(job) => job,
            other => panic!("expected ready job, got {:?}", other),
        };
        queue.requeue_front(job);
        match queue.pop_ready(Instant::now()) {
            Dequeue::Ready(job) => assert_eq!(job.aid, 1),
            other => panic!("expected aid 1 first, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_job_queue_notifies_worker() {
        let queue = JobQueue::new();
        queue.enqueue(1);
        // The permit is stored, so an already-sent notification is not lost.
        queue.notified().await;
    }
}
