//! # AniDB Metadata Mirror
//!
//! ## Overview
//! This library implements a durable local mirror for AniDB anime metadata.
//! Lookups are served from an embedded cache; misses and stale entries are
//! refreshed by a single background worker that paces upstream calls and
//! enforces a hard daily call quota.
//!
//! ## Architecture
//! The system is composed of several key modules:
//! - `upstream`: AniDB HTTP API client with failure classification
//! - `document`: parsing of raw AniDB XML into derived record fields
//! - `storage`: persistent raw-document store and searchable index
//! - `quota`: daily upstream-call quota tracking with UTC-day reset
//! - `queue`: deduplicated FIFO of pending fetch jobs
//! - `worker`: rate-limited background fetch loop
//! - `manager`: public cache API (lookup, search, stats, bulk index)
//! - `config`: configuration management and settings
//! - `errors`: centralized error handling and types
//!
//! ## Input/Output Specification
//! - **Input**: anime identifiers (lookups), tag queries, raw XML documents
//! - **Output**: cached records, queued-fetch acknowledgments, search results
//! - **Guarantees**: upstream calls are serialized, throttled, and bounded by
//!   a daily quota; the index is always reconstructible from the raw store
//!
//! ## Usage
//! ```rust,no_run
//! use anidb_mirror::manager::{CacheManager, Lookup};
//!
//! # async fn example(manager: CacheManager) {
//! match manager.lookup(1).await {
//!     Lookup::Hit(record) => println!("{:?}", record.title),
//!     Lookup::Stale(record) => println!("stale: {:?}", record.title),
//!     Lookup::Miss => println!("queued for fetching"),
//! }
//! # }
//! ```

// Core modules
pub mod config;
pub mod document;
pub mod errors;
pub mod manager;
pub mod queue;
pub mod quota;
pub mod storage;
pub mod upstream;
pub mod worker;

// Re-exports for convenience
pub use config::Config;
pub use errors::{MirrorError, Result};
pub use manager::{CacheManager, CacheStats, Lookup};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Unique identifier for anime entries (AniDB `aid`, always positive)
pub type AnimeId = u32;

/// A single weighted tag attached to an anime
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagEntry {
    /// Tag name as reported by AniDB
    pub name: String,
    /// Tag weight (0-600); higher means more strongly associated
    pub weight: u32,
}

/// A relation between two anime entries (sequel, prequel, side story, ...)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relation {
    /// Identifier of the related anime
    pub related_aid: AnimeId,
    /// Relation type as reported by AniDB
    pub kind: String,
}

/// Indexed record for one anime, derived entirely from its raw document
///
/// This is the row stored in the searchable index. The raw XML blob is kept
/// separately and the whole record can be re-derived from it at any time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnimeRecord {
    /// AniDB anime identifier
    pub aid: AnimeId,
    /// Main title, when the document carries one
    pub title: Option<String>,
    /// When the raw document was last fetched or indexed
    pub fetched_at: DateTime<Utc>,
    /// Weighted tags
    pub tags: Vec<TagEntry>,
    /// Relations to other anime
    pub relations: Vec<Relation>,
    /// Whether the entry carries mature (18+) content markers
    pub mature: bool,
    /// Upstream fetch attempts consumed for the most recent refresh
    pub attempt_count: u32,
}

impl AnimeRecord {
    /// True when any tag matches `wanted` at or above the given weight.
    pub fn matches_tags(&self, wanted: &[String], min_weight: u32) -> bool {
        self.tags.iter().any(|tag| {
            tag.weight >= min_weight && wanted.iter().any(|w| tag.name.eq_ignore_ascii_case(w))
        })
    }
}

/// Reason a fetch was negative-cached
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    /// Upstream confirmed the identifier does not exist
    NotFound,
    /// Transient failures exhausted the configured attempt budget
    RetriesExhausted,
}

/// Negative-cache marker recording a failed fetch with its own expiry
///
/// While a marker is unexpired, lookups report `Miss` without re-enqueueing
/// the identifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureMarker {
    /// Why the identifier was negative-cached
    pub kind: FailureKind,
    /// When the marker was written
    pub recorded_at: DateTime<Utc>,
    /// When the marker stops suppressing fetches
    pub expires_at: DateTime<Utc>,
    /// Attempts consumed before giving up
    pub attempts: u32,
}

impl FailureMarker {
    /// Whether the marker no longer suppresses fetches at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}
