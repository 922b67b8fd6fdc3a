//! Historical bar cache and gap detection.
//!
//! [`BarCache`] fronts a [`BarStore`] backend and keeps the advisory sync
//! status registry current: successful upserts mark a series synced,
//! failed backfill attempts mark it failed. Gap detection answers which
//! sub-ranges of a window still need a backfill fetch.

mod gaps;
mod postgres;
mod store;
mod sync;

pub use gaps::find_gaps;
pub use postgres::PostgresBarStore;
pub use store::{BarStore, InMemoryBarStore};
pub use sync::SyncStatusRegistry;

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::data::types::{Bar, Gap, SyncStatus, Timeframe};
use crate::error::CacheResult;

/// Historical bar cache.
///
/// Shared by two writer roles (live reconciliation and backfill); all
/// writes are idempotent upserts keyed on (instrument, timeframe, bucket
/// start), so the roles never conflict.
pub struct BarCache {
    store: Arc<dyn BarStore>,
    sync: SyncStatusRegistry,
}

impl BarCache {
    pub fn new(store: Arc<dyn BarStore>) -> Self {
        Self {
            store,
            sync: SyncStatusRegistry::new(),
        }
    }

    /// Cache backed by the in-memory store.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemoryBarStore::new()))
    }

    /// Insert or replace bars and mark the series synced on success.
    pub async fn upsert_bars(
        &self,
        instrument_id: &str,
        timeframe: Timeframe,
        bars: &[Bar],
    ) -> CacheResult<usize> {
        match self.store.upsert_bars(instrument_id, timeframe, bars).await {
            Ok(written) => {
                if written > 0 {
                    self.sync.mark_synced(instrument_id, timeframe, Utc::now());
                }
                Ok(written)
            }
            Err(e) => {
                self.sync
                    .mark_failed(instrument_id, timeframe, e.to_string());
                Err(e)
            }
        }
    }

    /// Bars with `start <= bucket_start < end`, ascending.
    pub async fn query(
        &self,
        instrument_id: &str,
        timeframe: Timeframe,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> CacheResult<Vec<Bar>> {
        self.store.query(instrument_id, timeframe, start, end).await
    }

    /// Uncovered sub-ranges of the window, timeframe-aligned.
    pub async fn find_gaps(
        &self,
        instrument_id: &str,
        timeframe: Timeframe,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> CacheResult<Vec<Gap>> {
        let aligned_start = timeframe.align(start);
        let aligned_end = timeframe.align_up(end);
        let bars = self
            .store
            .query(instrument_id, timeframe, aligned_start, aligned_end)
            .await?;
        Ok(gaps::find_gaps(&bars, timeframe, start, end))
    }

    /// Earliest and latest cached bucket starts, if any.
    pub async fn coverage(
        &self,
        instrument_id: &str,
        timeframe: Timeframe,
    ) -> CacheResult<Option<(DateTime<Utc>, DateTime<Utc>)>> {
        self.store.coverage(instrument_id, timeframe).await
    }

    /// Advisory freshness for a series.
    pub fn sync_status(&self, instrument_id: &str, timeframe: Timeframe) -> Option<SyncStatus> {
        self.sync.get(instrument_id, timeframe)
    }

    /// All tracked sync statuses, for UI freshness indicators.
    pub fn sync_statuses(&self) -> Vec<SyncStatus> {
        self.sync.all()
    }

    /// Record a backfill in flight for a series.
    pub fn mark_syncing(&self, instrument_id: &str, timeframe: Timeframe) {
        self.sync.mark_syncing(instrument_id, timeframe);
    }

    /// Record a failed backfill attempt for a series.
    pub fn mark_sync_failed(&self, instrument_id: &str, timeframe: Timeframe, detail: String) {
        self.sync.mark_failed(instrument_id, timeframe, detail);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::types::SyncState;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn ts(seconds: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(seconds * 1_000).unwrap()
    }

    fn bar(bucket_seconds: i64) -> Bar {
        Bar::new(
            "ESZ5",
            Timeframe::OneMinute,
            ts(bucket_seconds),
            dec!(100),
            dec!(101),
            dec!(99),
            dec!(100),
            dec!(1),
        )
    }

    #[tokio::test]
    async fn test_upsert_marks_synced() {
        let cache = BarCache::in_memory();
        assert!(cache.sync_status("ESZ5", Timeframe::OneMinute).is_none());

        cache
            .upsert_bars("ESZ5", Timeframe::OneMinute, &[bar(0)])
            .await
            .unwrap();

        let status = cache.sync_status("ESZ5", Timeframe::OneMinute).unwrap();
        assert_eq!(status.state, SyncState::Synced);
        assert!(status.last_synced.is_some());
    }

    #[tokio::test]
    async fn test_empty_upsert_does_not_touch_status() {
        let cache = BarCache::in_memory();
        cache
            .upsert_bars("ESZ5", Timeframe::OneMinute, &[])
            .await
            .unwrap();
        assert!(cache.sync_status("ESZ5", Timeframe::OneMinute).is_none());
    }

    #[tokio::test]
    async fn test_find_gaps_through_cache() {
        let cache = BarCache::in_memory();
        cache
            .upsert_bars("ESZ5", Timeframe::OneMinute, &[bar(0), bar(180)])
            .await
            .unwrap();

        let gaps = cache
            .find_gaps("ESZ5", Timeframe::OneMinute, ts(0), ts(300))
            .await
            .unwrap();
        assert_eq!(
            gaps,
            vec![Gap::new(ts(60), ts(180)), Gap::new(ts(240), ts(300))]
        );
    }

    #[tokio::test]
    async fn test_mark_sync_failed_read_back() {
        let cache = BarCache::in_memory();
        cache.mark_sync_failed("ESZ5", Timeframe::OneMinute, "gateway 500".to_string());

        let status = cache.sync_status("ESZ5", Timeframe::OneMinute).unwrap();
        assert_eq!(status.state, SyncState::Failed);
        assert_eq!(status.error_detail.as_deref(), Some("gateway 500"));
    }
}
