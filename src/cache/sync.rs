//! Sync status bookkeeping.
//!
//! One advisory [`SyncStatus`] row per (instrument, timeframe), updated
//! after every cache write or failed fetch. The UI reads these for data
//! freshness indicators; queries never depend on them.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use crate::data::types::{SyncState, SyncStatus, Timeframe};

type SeriesKey = (String, Timeframe);

/// Registry of sync status rows.
#[derive(Default)]
pub struct SyncStatusRegistry {
    statuses: RwLock<HashMap<SeriesKey, SyncStatus>>,
}

impl SyncStatusRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a backfill in flight.
    pub fn mark_syncing(&self, instrument_id: &str, timeframe: Timeframe) {
        self.update(instrument_id, timeframe, |status| {
            status.state = SyncState::Syncing;
        });
    }

    /// Record a successful cache write.
    pub fn mark_synced(&self, instrument_id: &str, timeframe: Timeframe, at: DateTime<Utc>) {
        self.update(instrument_id, timeframe, |status| {
            status.state = SyncState::Synced;
            status.last_synced = Some(at);
            status.error_detail = None;
        });
    }

    /// Record a failed backfill or write attempt.
    pub fn mark_failed(&self, instrument_id: &str, timeframe: Timeframe, detail: String) {
        self.update(instrument_id, timeframe, |status| {
            status.state = SyncState::Failed;
            status.error_detail = Some(detail);
        });
    }

    /// Current status for a series, if any sync activity happened.
    pub fn get(&self, instrument_id: &str, timeframe: Timeframe) -> Option<SyncStatus> {
        self.statuses
            .read()
            .get(&(instrument_id.to_string(), timeframe))
            .cloned()
    }

    /// All tracked statuses.
    pub fn all(&self) -> Vec<SyncStatus> {
        self.statuses.read().values().cloned().collect()
    }

    fn update(&self, instrument_id: &str, timeframe: Timeframe, apply: impl FnOnce(&mut SyncStatus)) {
        let mut statuses = self.statuses.write();
        let status = statuses
            .entry((instrument_id.to_string(), timeframe))
            .or_insert_with(|| SyncStatus::new(instrument_id, timeframe));
        apply(status);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_synced_then_failed_keeps_last_synced() {
        let registry = SyncStatusRegistry::new();
        let at = Utc::now();

        registry.mark_synced("ESZ5", Timeframe::OneMinute, at);
        let status = registry.get("ESZ5", Timeframe::OneMinute).unwrap();
        assert_eq!(status.state, SyncState::Synced);
        assert_eq!(status.last_synced, Some(at));
        assert!(status.error_detail.is_none());

        registry.mark_failed("ESZ5", Timeframe::OneMinute, "fetch 503".to_string());
        let status = registry.get("ESZ5", Timeframe::OneMinute).unwrap();
        assert_eq!(status.state, SyncState::Failed);
        assert_eq!(status.error_detail.as_deref(), Some("fetch 503"));
        // The last successful sync timestamp survives a later failure
        assert_eq!(status.last_synced, Some(at));
    }

    #[test]
    fn test_syncing_transition() {
        let registry = SyncStatusRegistry::new();
        registry.mark_syncing("ESZ5", Timeframe::OneMinute);
        assert_eq!(
            registry.get("ESZ5", Timeframe::OneMinute).unwrap().state,
            SyncState::Syncing
        );
    }

    #[test]
    fn test_unknown_series_is_none() {
        let registry = SyncStatusRegistry::new();
        assert!(registry.get("ESZ5", Timeframe::OneMinute).is_none());
    }

    #[test]
    fn test_series_tracked_separately() {
        let registry = SyncStatusRegistry::new();
        registry.mark_synced("ESZ5", Timeframe::OneMinute, Utc::now());
        registry.mark_failed("ESZ5", Timeframe::OneHour, "boom".to_string());

        assert_eq!(
            registry.get("ESZ5", Timeframe::OneMinute).unwrap().state,
            SyncState::Synced
        );
        assert_eq!(
            registry.get("ESZ5", Timeframe::OneHour).unwrap().state,
            SyncState::Failed
        );
        assert_eq!(registry.all().len(), 2);
    }
}
