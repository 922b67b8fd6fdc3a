//! Bar storage backends.
//!
//! Storage is keyed on (instrument, timeframe, bucket start); an upsert
//! with an existing key replaces the stored bar atomically. That is the
//! whole write model: live-to-historical reconciliation, corrections and
//! backfill all go through the same idempotent path, so concurrent writer
//! roles never need a lock beyond the single-upsert guarantee of the
//! backend.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::debug;

use crate::data::types::{Bar, Timeframe};
use crate::error::CacheResult;

/// Persistent bar storage interface.
#[async_trait]
pub trait BarStore: Send + Sync {
    /// Insert or replace bars. Returns the number of bars written. Each
    /// bar write is all-or-nothing; a failure never corrupts previously
    /// stored bars.
    async fn upsert_bars(
        &self,
        instrument_id: &str,
        timeframe: Timeframe,
        bars: &[Bar],
    ) -> CacheResult<usize>;

    /// Bars with `start <= bucket_start < end`, ascending by bucket start.
    async fn query(
        &self,
        instrument_id: &str,
        timeframe: Timeframe,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> CacheResult<Vec<Bar>>;

    /// Earliest and latest cached bucket starts for a series, if any.
    async fn coverage(
        &self,
        instrument_id: &str,
        timeframe: Timeframe,
    ) -> CacheResult<Option<(DateTime<Utc>, DateTime<Utc>)>>;
}

type SeriesKey = (String, Timeframe);

/// In-memory bar store.
///
/// The default backend: a per-series BTreeMap keyed by bucket start, so
/// upserts are plain inserts and range queries are ordered scans.
#[derive(Default)]
pub struct InMemoryBarStore {
    series: RwLock<HashMap<SeriesKey, BTreeMap<DateTime<Utc>, Bar>>>,
}

impl InMemoryBarStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total bars stored across all series.
    pub fn len(&self) -> usize {
        self.series.read().values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl BarStore for InMemoryBarStore {
    async fn upsert_bars(
        &self,
        instrument_id: &str,
        timeframe: Timeframe,
        bars: &[Bar],
    ) -> CacheResult<usize> {
        if bars.is_empty() {
            return Ok(0);
        }

        let mut series = self.series.write();
        let slot = series
            .entry((instrument_id.to_string(), timeframe))
            .or_default();
        for bar in bars {
            slot.insert(bar.bucket_start, bar.clone());
        }

        debug!(
            "Upserted {} bar(s) for {} {}",
            bars.len(),
            instrument_id,
            timeframe
        );
        Ok(bars.len())
    }

    async fn query(
        &self,
        instrument_id: &str,
        timeframe: Timeframe,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> CacheResult<Vec<Bar>> {
        let series = self.series.read();
        let bars = series
            .get(&(instrument_id.to_string(), timeframe))
            .map(|slot| slot.range(start..end).map(|(_, bar)| bar.clone()).collect())
            .unwrap_or_default();
        Ok(bars)
    }

    async fn coverage(
        &self,
        instrument_id: &str,
        timeframe: Timeframe,
    ) -> CacheResult<Option<(DateTime<Utc>, DateTime<Utc>)>> {
        let series = self.series.read();
        let slot = match series.get(&(instrument_id.to_string(), timeframe)) {
            Some(slot) if !slot.is_empty() => slot,
            _ => return Ok(None),
        };

        let first = slot.keys().next().copied();
        let last = slot.keys().next_back().copied();
        Ok(first.zip(last))
    }
}
