//! # Storage Management Module
//!
//! ## Purpose
//! Handles persistent storage of raw AniDB documents and the searchable
//! index of derived fields using an embedded database.
//!
//! ## Input/Output Specification
//! - **Input**: raw XML blobs, derived index rows, failure markers, quota state
//! - **Output**: persistent storage, retrieval operations, reconciliation
//! - **Storage**: Sled embedded database with one tree per concern
//!
//! ## Key Features
//! - Raw-document blobs written durably before their index rows, so a crash
//!   between the two leaves only an orphaned blob
//! - Reconciliation rebuilds missing index rows from raw blobs alone; this is
//!   also the contract the external bulk-seed importer relies on
//! - Negative-cache markers kept in their own tree so index rebuilds are exact
//! - Optional gzip compression for raw blobs

use crate::config::StorageConfig;
use crate::document;
use crate::errors::{MirrorError, Result};
use crate::quota::QuotaState;
use crate::{AnimeId, AnimeRecord, FailureMarker};
use chrono::{DateTime, Utc};

const QUOTA_KEY: &[u8] = b"quota";
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Persistent store for raw documents, index rows, and service state
pub struct Store {
    config: StorageConfig,
    db: sled::Db,
    raw: sled::Tree,
    index: sled::Tree,
    negative: sled::Tree,
    state: sled::Tree,
}

/// Outcome of one reconciliation pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Raw blobs scanned
    pub scanned: usize,
    /// Index rows rebuilt from orphaned raw blobs
    pub healed: usize,
    /// Raw blobs whose content could not be parsed (left in place)
    pub parse_failures: usize,
    /// Index rows with no corresponding raw blob (reported, not touched)
    pub dangling_rows: usize,
}

impl Store {
    /// Open the store, creating the database directory if needed.
    pub async fn open(config: StorageConfig) -> Result<Self> {
        if let Some(parent) = config.db_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let db = sled::open(&config.db_path)?;
        let raw = db.open_tree("anime_raw")?;
        let index = db.open_tree("anime_index")?;
        let negative = db.open_tree("negative_cache")?;
        let state = db.open_tree("service_state")?;

        let store = Self {
            config,
            db,
            raw,
            index,
            negative,
            state,
        };

        tracing::info!(
            "Storage opened with {} indexed anime, {} negative-cache entries",
            store.record_count(),
            store.negative_count()
        );

        Ok(store)
    }

    fn key(aid: AnimeId) -> [u8; 4] {
        aid.to_be_bytes()
    }

    fn aid_from_key(key: &[u8]) -> Result<AnimeId> {
        let bytes: [u8; 4] = key.try_into().map_err(|_| MirrorError::StorageInconsistency {
            details: format!("Malformed storage key of length {}", key.len()),
        })?;
        Ok(u32::from_be_bytes(bytes))
    }

    /// Store a raw document blob without touching the index.
    ///
    /// The blob is durable on return. Callers that cannot parse documents
    /// (e.g. a seed importer) may rely on [`Store::reconcile`] to derive the
    /// index row later.
    pub async fn put_raw(&self, aid: AnimeId, raw: &[u8]) -> Result<()> {
        let blob = if self.config.enable_compression {
            compress(raw)?
        } else {
            raw.to_vec()
        };
        self.raw.insert(Self::key(aid), blob)?;
        self.db.flush_async().await?;
        Ok(())
    }

    /// Store a document: raw blob first (durably), then the index row.
    ///
    /// Also clears any negative-cache marker for the identifier.
    pub async fn put_document(&self, record: &AnimeRecord, raw: &[u8]) -> Result<()> {
        self.put_raw(record.aid, raw).await?;

        let row = bincode::serialize(record)?;
        self.index.insert(Self::key(record.aid), row)?;
        self.clear_marker(record.aid)?;

        tracing::debug!("Stored document for aid {} ({} bytes raw)", record.aid, raw.len());
        Ok(())
    }

    /// Retrieve the raw document for an identifier.
    pub fn get_raw(&self, aid: AnimeId) -> Result<Option<Vec<u8>>> {
        match self.raw.get(Self::key(aid))? {
            Some(blob) => Ok(Some(decompress(&blob)?)),
            None => Ok(None),
        }
    }

    /// Retrieve the index row for an identifier.
    pub fn get_record(&self, aid: AnimeId) -> Result<Option<AnimeRecord>> {
        match self.index.get(Self::key(aid))? {
            Some(row) => Ok(Some(bincode::deserialize(&row)?)),
            None => Ok(None),
        }
    }

    /// Number of indexed anime.
    pub fn record_count(&self) -> usize {
        self.index.len()
    }

    /// Number of active negative-cache markers.
    pub fn negative_count(&self) -> usize {
        self.negative.len()
    }

    /// Write a negative-cache marker.
    pub fn put_marker(&self, aid: AnimeId, marker: &FailureMarker) -> Result<()> {
        let value = bincode::serialize(marker)?;
        self.negative.insert(Self::key(aid), value)?;
        Ok(())
    }

    /// Read the negative-cache marker for an identifier, if any.
    pub fn get_marker(&self, aid: AnimeId) -> Result<Option<FailureMarker>> {
        match self.negative.get(Self::key(aid))? {
            Some(value) => Ok(Some(bincode::deserialize(&value)?)),
            None => Ok(None),
        }
    }

    /// Remove the negative-cache marker for an identifier.
    pub fn clear_marker(&self, aid: AnimeId) -> Result<()> {
        self.negative.remove(Self::key(aid))?;
        Ok(())
    }

    /// Load the persisted quota snapshot, if any.
    pub fn load_quota(&self) -> Result<Option<QuotaState>> {
        match self.state.get(QUOTA_KEY)? {
            Some(value) => Ok(Some(bincode::deserialize(&value)?)),
            None => Ok(None),
        }
    }

    /// Persist the quota snapshot.
    pub fn save_quota(&self, quota: &QuotaState) -> Result<()> {
        let value = bincode::serialize(quota)?;
        self.state.insert(QUOTA_KEY, value)?;
        Ok(())
    }

    /// Lazy iterator over all index rows in identifier order.
    ///
    /// Undecodable rows are logged and skipped so a single bad row cannot
    /// take down a search.
    pub fn iter_records(&self) -> RecordIter {
        RecordIter {
            inner: self.index.iter(),
        }
    }

    /// Restore raw-store/index consistency by rescanning the raw store.
    ///
    /// Every raw blob without an index row is parsed and re-indexed with
    /// `now` as its fetch time; the network is never contacted. Index rows
    /// without a raw blob are reported but left alone.
    pub async fn reconcile(&self, now: DateTime<Utc>) -> Result<ReconcileReport> {
        let mut report = ReconcileReport::default();

        for item in self.raw.iter() {
            let (key, _) = item?;
            report.scanned += 1;

            let aid = Self::aid_from_key(&key)?;
            if self.index.get(&key)?.is_some() {
                continue;
            }

            let raw = match self.get_raw(aid)? {
                Some(raw) => raw,
                None => continue,
            };

            match document::parse_document(aid, &raw) {
                Ok(parsed) => {
                    let record = parsed.into_record(aid, now, 0);
                    let row = bincode::serialize(&record)?;
                    self.index.insert(&key, row)?;
                    report.healed += 1;
                    tracing::info!("Reconciled orphaned raw document for aid {}", aid);
                }
                Err(e) => {
                    report.parse_failures += 1;
                    tracing::warn!("Cannot reconcile raw document for aid {}: {}", aid, e);
                }
            }
        }

        for item in self.index.iter() {
            let (key, _) = item?;
            if self.raw.get(&key)?.is_none() {
                let aid = Self::aid_from_key(&key)?;
                report.dangling_rows += 1;
                tracing::warn!("Index row for aid {} has no raw document", aid);
            }
        }

        if report.healed > 0 {
            self.db.flush_async().await?;
        }

        Ok(report)
    }

    /// Flush all pending writes to disk.
    pub async fn flush(&self) -> Result<()> {
        self.db.flush_async().await?;
        Ok(())
    }

    /// Health check: exercise a write/read/remove cycle on the state tree.
    pub async fn health_check(&self) -> Result<()> {
        let test_key = b"health_check";
        self.state.insert(test_key, b"ok")?;
        let value = self.state.get(test_key)?;
        if value.is_none() {
            return Err(MirrorError::StorageInconsistency {
                details: "Health check value not found after write".to_string(),
            });
        }
        self.state.remove(test_key)?;
        Ok(())
    }
}

/// Lazy iterator over index rows; restartable by calling
/// [`Store::iter_records`] again.
pub struct RecordIter {
    inner: sled::Iter,
}

impl Iterator for RecordIter {
    type Item = AnimeRecord;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match self.inner.next()? {
                Ok((_, row)) => match bincode::deserialize(&row) {
                    Ok(record) => return Some(record),
                    Err(e) => {
                        tracing::warn!("Skipping undecodable index row: {}", e);
                        continue;
                    }
                },
                Err(e) => {
                    tracing::warn!("Index iteration error: {}", e);
                    return None;
                }
            }
        }
    }
}

/// Gzip-compress a raw blob.
fn compress(data: &[u8]) -> Result<Vec<u8>> {
    use std::io::Write;

    let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

/// Transparently decompress a stored blob.
///
/// Sniffs the gzip magic so blobs written before a compression-setting
/// change stay readable.
fn decompress(data: &[u8]) -> Result<Vec<u8>> {
    use std::io::Read;

    if data.starts_with(&GZIP_MAGIC) {
        let mut decoder = flate2::read::GzDecoder::new(data);
        let mut out = Vec::new();
        decoder.read_to_end(&mut out)?;
        Ok(out)
    } else {
        Ok(data.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageConfig;
    use crate::{FailureKind, TagEntry};

    const SAMPLE: &str = r#"<anime id="1"><titles>
        <title type="main">Seikai no Monshou</title></titles>
        <tags><tag weight="600"><name>space opera</name></tag></tags>
    </anime>"#;

    async fn open_store(compression: bool) -> (Store, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(StorageConfig {
            db_path: dir.path().join("db"),
            enable_compression: compression,
        })
        .await
        .unwrap();
        (store, dir)
    }

    fn sample_record(aid: AnimeId) -> AnimeRecord {
        AnimeRecord {
            aid,
            title: Some("Seikai no Monshou".to_string()),
            fetched_at: Utc::now(),
            tags: vec![TagEntry {
                name: "space opera".to_string(),
                weight: 600,
            }],
            relations: Vec::new(),
            mature: false,
            attempt_count: 0,
        }
    }

    #[tokio::test]
    async fn test_document_round_trip() {
        for compression in [true, false] {
            let (store, _dir) = open_store(compression).await;
            let record = sample_record(1);
            store.put_document(&record, SAMPLE.as_bytes()).await.unwrap();

            let raw = store.get_raw(1).unwrap().unwrap();
            assert_eq!(raw, SAMPLE.as_bytes());

            let loaded = store.get_record(1).unwrap().unwrap();
            assert_eq!(loaded.aid, 1);
            assert_eq!(loaded.title.as_deref(), Some("Seikai no Monshou"));
            assert_eq!(loaded.tags, record.tags);
            assert_eq!(store.record_count(), 1);
        }
    }

    #[tokio::test]
    async fn test_reconcile_heals_orphaned_raw_documents() {
        let (store, _dir) = open_store(true).await;

        // Raw blob written but the index row never committed.
        store.put_raw(1, SAMPLE.as_bytes()).await.unwrap();
        assert!(store.get_record(1).unwrap().is_none());

        let report = store.reconcile(Utc::now()).await.unwrap();
        assert_eq!(report.scanned, 1);
        assert_eq!(report.healed, 1);
        assert_eq!(report.parse_failures, 0);

        let record = store.get_record(1).unwrap().unwrap();
        assert_eq!(record.title.as_deref(), Some("Seikai no Monshou"));
        assert_eq!(record.tags[0].weight, 600);

        // A second pass finds nothing to heal.
        let report = store.reconcile(Utc::now()).await.unwrap();
        assert_eq!(report.healed, 0);
        assert_eq!(store.record_count(), 1);
    }

    #[tokio::test]
    async fn test_reconcile_counts_unparseable_blobs() {
        let (store, _dir) = open_store(false).await;
        store.put_raw(2, b"<anime><broken").await.unwrap();

        let report = store.reconcile(Utc::now()).await.unwrap();
        assert_eq!(report.parse_failures, 1);
        assert_eq!(report.healed, 0);
        // The blob stays in place for a later repair.
        assert!(store.get_raw(2).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_marker_round_trip_and_clear_on_store() {
        let (store, _dir) = open_store(true).await;
        let marker = FailureMarker {
            kind: FailureKind::NotFound,
            recorded_at: Utc::now(),
            expires_at: Utc::now() + chrono::Duration::days(30),
            attempts: 1,
        };
        store.put_marker(3, &marker).unwrap();
        assert_eq!(store.get_marker(3).unwrap().unwrap().kind, FailureKind::NotFound);
        assert_eq!(store.negative_count(), 1);

        // A successful store clears the marker.
        store
            .put_document(&sample_record(3), SAMPLE.as_bytes())
            .await
            .unwrap();
        assert!(store.get_marker(3).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_quota_snapshot_round_trip() {
        let (store, _dir) = open_store(true).await;
        assert!(store.load_quota().unwrap().is_none());

        let state = QuotaState {
            date: chrono::NaiveDate::from_ymd_opt(2026, 8, 7).unwrap(),
            count_used: 42,
        };
        store.save_quota(&state).unwrap();
        assert_eq!(store.load_quota().unwrap().unwrap(), state);
    }

    #[tokio::test]
    async fn test_iter_records_in_identifier_order() {
        let (store, _dir) = open_store(true).await;
        for aid in [300u32, 1, 20] {
            store
                .put_document(&sample_record(aid), SAMPLE.as_bytes())
                .await
                .unwrap();
        }
        let ids: Vec<AnimeId> = store.iter_records().map(|r| r.aid).collect();
        assert_eq!(ids, vec![1, 20, 300]);
    }

    #[tokio::test]
    async fn test_health_check() {
        let (store, _dir) = open_store(true).await;
        store.health_check().await.unwrap();
    }
}
