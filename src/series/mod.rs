//! Series merging for presentation.
//!
//! Blends cached historical bars with the aggregator's live output into
//! one deduplicated, time-ordered series that is safe to hand straight to
//! a chart renderer.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::aggregator::BarAggregator;
use crate::cache::BarCache;
use crate::data::types::{Bar, Timeframe};
use crate::error::CacheResult;

/// Which sources feed the rendered series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RenderMode {
    /// Cached bars only
    Historical,
    /// Live aggregator output only
    Live,
    /// Cached history with live bars layered on top; live wins ties
    Hybrid,
}

/// Merges cache and aggregator output into one render-safe series.
pub struct SeriesMerger {
    cache: Arc<BarCache>,
    aggregator: Arc<BarAggregator>,
}

impl SeriesMerger {
    pub fn new(cache: Arc<BarCache>, aggregator: Arc<BarAggregator>) -> Self {
        Self { cache, aggregator }
    }

    /// Render the bar series for a window.
    ///
    /// The output has strictly increasing, unique bucket starts. When both
    /// sources cover a bucket in hybrid mode, the live bar wins: live bars
    /// are appended after historical ones and deduplication keeps the
    /// later occurrence. Malformed bars are dropped with a warning; one
    /// bad bar must not blank the whole chart.
    pub async fn render_series(
        &self,
        instrument_id: &str,
        timeframe: Timeframe,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        mode: RenderMode,
    ) -> CacheResult<Vec<Bar>> {
        let mut source = match mode {
            RenderMode::Historical => self.cached_window(instrument_id, timeframe, start, end).await?,
            RenderMode::Live => self.live_window(instrument_id, timeframe, start, end),
            RenderMode::Hybrid => {
                let mut bars = self.cached_window(instrument_id, timeframe, start, end).await?;
                bars.extend(self.live_window(instrument_id, timeframe, start, end));
                bars
            }
        };

        // Stable sort keeps source order within a bucket, so the
        // later-appended (live) bar survives deduplication.
        source.sort_by_key(|bar| bar.bucket_start);

        let mut merged: Vec<Bar> = Vec::with_capacity(source.len());
        for bar in source {
            match merged.last_mut() {
                Some(last) if last.bucket_start == bar.bucket_start => *last = bar,
                _ => merged.push(bar),
            }
        }

        merged.retain(|bar| {
            if bar.is_well_formed() {
                true
            } else {
                warn!(
                    "Dropping malformed bar for {} {} at {}: O{} H{} L{} C{} V{}",
                    bar.instrument_id,
                    bar.timeframe,
                    bar.bucket_start,
                    bar.open,
                    bar.high,
                    bar.low,
                    bar.close,
                    bar.volume
                );
                false
            }
        });

        Ok(merged)
    }

    async fn cached_window(
        &self,
        instrument_id: &str,
        timeframe: Timeframe,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> CacheResult<Vec<Bar>> {
        self.cache.query(instrument_id, timeframe, start, end).await
    }

    fn live_window(
        &self,
        instrument_id: &str,
        timeframe: Timeframe,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Vec<Bar> {
        if timeframe != self.aggregator.timeframe() {
            return Vec::new();
        }
        self.aggregator
            .live_series(instrument_id)
            .into_iter()
            .filter(|bar| bar.bucket_start >= start && bar.bucket_start < end)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AggregatorSettings;
    use crate::data::types::Tick;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn ts(seconds: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(seconds * 1_000).unwrap()
    }

    fn cached_bar(bucket_seconds: i64, close: rust_decimal::Decimal) -> Bar {
        Bar::new(
            "ESZ5",
            Timeframe::OneMinute,
            ts(bucket_seconds),
            close,
            close,
            close,
            close,
            dec!(10),
        )
    }

    async fn merger_with(
        cached: &[Bar],
        live_ticks: &[(i64, rust_decimal::Decimal)],
    ) -> SeriesMerger {
        let cache = Arc::new(BarCache::in_memory());
        if !cached.is_empty() {
            cache
                .upsert_bars("ESZ5", Timeframe::OneMinute, cached)
                .await
                .unwrap();
        }

        let aggregator = Arc::new(BarAggregator::new(&AggregatorSettings::default()));
        for (seconds, price) in live_ticks {
            aggregator.on_tick(&Tick::trade("ESZ5", ts(*seconds), *price, None));
        }

        SeriesMerger::new(cache, aggregator)
    }

    #[tokio::test]
    async fn test_historical_mode_cache_only() {
        let merger = merger_with(
            &[cached_bar(0, dec!(100)), cached_bar(60, dec!(101))],
            &[(125, dec!(200))],
        )
        .await;

        let series = merger
            .render_series("ESZ5", Timeframe::OneMinute, ts(0), ts(300), RenderMode::Historical)
            .await
            .unwrap();

        assert_eq!(series.len(), 2);
        assert!(series.iter().all(|bar| bar.close < dec!(200)));
    }

    #[tokio::test]
    async fn test_live_mode_aggregator_only() {
        let merger = merger_with(&[cached_bar(0, dec!(100))], &[(125, dec!(200))]).await;

        let series = merger
            .render_series("ESZ5", Timeframe::OneMinute, ts(0), ts(300), RenderMode::Live)
            .await
            .unwrap();

        assert_eq!(series.len(), 1);
        assert_eq!(series[0].bucket_start, ts(120));
        assert_eq!(series[0].close, dec!(200));
    }

    #[tokio::test]
    async fn test_hybrid_live_wins_ties() {
        // Cache and the live aggregator both cover bucket [60,120)
        let merger = merger_with(
            &[cached_bar(0, dec!(100)), cached_bar(60, dec!(101))],
            &[(65, dec!(500))],
        )
        .await;

        let series = merger
            .render_series("ESZ5", Timeframe::OneMinute, ts(0), ts(300), RenderMode::Hybrid)
            .await
            .unwrap();

        assert_eq!(series.len(), 2);
        assert_eq!(series[0].close, dec!(100)); // cache-only bucket
        assert_eq!(series[1].bucket_start, ts(60));
        assert_eq!(series[1].close, dec!(500)); // live bar replaced cached
    }

    #[tokio::test]
    async fn test_hybrid_unique_increasing_buckets() {
        let merger = merger_with(
            &[
                cached_bar(0, dec!(100)),
                cached_bar(60, dec!(101)),
                cached_bar(120, dec!(102)),
            ],
            &[(65, dec!(201)), (125, dec!(202)), (185, dec!(203))],
        )
        .await;

        let series = merger
            .render_series("ESZ5", Timeframe::OneMinute, ts(0), ts(300), RenderMode::Hybrid)
            .await
            .unwrap();

        assert_eq!(series.len(), 4);
        for pair in series.windows(2) {
            assert!(pair[0].bucket_start < pair[1].bucket_start);
        }
    }

    #[tokio::test]
    async fn test_malformed_bar_dropped_not_fatal() {
        let mut broken = cached_bar(60, dec!(101));
        broken.high = dec!(90); // below open/close

        let merger = merger_with(&[cached_bar(0, dec!(100)), broken], &[]).await;

        let series = merger
            .render_series("ESZ5", Timeframe::OneMinute, ts(0), ts(300), RenderMode::Historical)
            .await
            .unwrap();

        assert_eq!(series.len(), 1);
        assert_eq!(series[0].bucket_start, ts(0));
    }

    #[tokio::test]
    async fn test_window_filter_applies_to_live_bars() {
        let merger = merger_with(&[], &[(65, dec!(200)), (305, dec!(201))]).await;

        let series = merger
            .render_series("ESZ5", Timeframe::OneMinute, ts(0), ts(300), RenderMode::Live)
            .await
            .unwrap();

        // The open bar at bucket 300 falls outside [0, 300)
        assert_eq!(series.len(), 1);
        assert_eq!(series[0].bucket_start, ts(60));
    }

    #[tokio::test]
    async fn test_timeframe_mismatch_yields_no_live_bars() {
        let merger = merger_with(&[], &[(65, dec!(200))]).await;

        let series = merger
            .render_series("ESZ5", Timeframe::FiveMinutes, ts(0), ts(600), RenderMode::Hybrid)
            .await
            .unwrap();
        assert!(series.is_empty());
    }
}
