//! Gap backfill.
//!
//! The gap detector advises which ranges are missing; the executor drives
//! the external fetch collaborator over those ranges and writes the
//! results back through the cache. A failed gap is recorded in sync status
//! and does not stop the remaining gaps from filling.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::BarCache;
use crate::data::types::{Bar, Gap, Timeframe};
use crate::error::{retry_with_backoff, CacheResult, FetchError};

/// External historical-bar fetch collaborator: given a gap, looks the bars
/// up against the broker gateway's historical endpoint.
#[async_trait]
pub trait BarFetcher: Send + Sync {
    async fn fetch_bars(
        &self,
        instrument_id: &str,
        timeframe: Timeframe,
        gap: &Gap,
    ) -> Result<Vec<Bar>, FetchError>;
}

/// Outcome for one gap.
#[derive(Debug, Clone)]
pub struct GapFill {
    pub gap: Gap,
    pub bars_written: usize,
    /// Failure detail when the fetch or write failed
    pub error: Option<String>,
}

impl GapFill {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// Summary of one backfill run.
#[derive(Debug, Clone)]
pub struct BackfillReport {
    pub id: Uuid,
    pub instrument_id: String,
    pub timeframe: Timeframe,
    pub fills: Vec<GapFill>,
}

impl BackfillReport {
    /// True when every detected gap was filled.
    pub fn is_complete(&self) -> bool {
        self.fills.iter().all(GapFill::succeeded)
    }

    pub fn bars_written(&self) -> usize {
        self.fills.iter().map(|f| f.bars_written).sum()
    }

    pub fn failed_gaps(&self) -> usize {
        self.fills.iter().filter(|f| !f.succeeded()).count()
    }
}

const FETCH_RETRIES: u32 = 3;
const FETCH_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Fills cache gaps through a [`BarFetcher`].
pub struct BackfillExecutor {
    cache: Arc<BarCache>,
    fetcher: Arc<dyn BarFetcher>,
}

impl BackfillExecutor {
    pub fn new(cache: Arc<BarCache>, fetcher: Arc<dyn BarFetcher>) -> Self {
        Self { cache, fetcher }
    }

    /// Detect gaps in the window and fill each one.
    ///
    /// Transient fetch failures are retried; a gap that still fails marks
    /// the series' sync status failed and shows up in the report, while
    /// the remaining gaps are still attempted.
    pub async fn fill_gaps(
        &self,
        instrument_id: &str,
        timeframe: Timeframe,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> CacheResult<BackfillReport> {
        let gaps = self
            .cache
            .find_gaps(instrument_id, timeframe, start, end)
            .await?;

        let mut report = BackfillReport {
            id: Uuid::new_v4(),
            instrument_id: instrument_id.to_string(),
            timeframe,
            fills: Vec::with_capacity(gaps.len()),
        };

        if gaps.is_empty() {
            debug!("{} {} window fully covered", instrument_id, timeframe);
            return Ok(report);
        }

        info!(
            "Backfilling {} gap(s) for {} {}",
            gaps.len(),
            instrument_id,
            timeframe
        );

        for gap in gaps {
            self.cache.mark_syncing(instrument_id, timeframe);
            report.fills.push(self.fill_one(instrument_id, timeframe, gap).await);
        }

        Ok(report)
    }

    async fn fill_one(&self, instrument_id: &str, timeframe: Timeframe, gap: Gap) -> GapFill {
        let fetched = retry_with_backoff(
            || self.fetcher.fetch_bars(instrument_id, timeframe, &gap),
            FETCH_RETRIES,
            FETCH_RETRY_DELAY,
        )
        .await;

        match fetched {
            Ok(bars) => {
                match self.cache.upsert_bars(instrument_id, timeframe, &bars).await {
                    Ok(written) => {
                        debug!(
                            "Filled gap {} .. {} with {} bar(s)",
                            gap.start, gap.end, written
                        );
                        GapFill {
                            gap,
                            bars_written: written,
                            error: None,
                        }
                    }
                    Err(e) => {
                        warn!("Cache write for gap {} .. {} failed: {}", gap.start, gap.end, e);
                        // upsert_bars already marked the series failed
                        GapFill {
                            gap,
                            bars_written: 0,
                            error: Some(e.to_string()),
                        }
                    }
                }
            }
            Err(e) => {
                warn!("Fetch for gap {} .. {} failed: {}", gap.start, gap.end, e);
                self.cache
                    .mark_sync_failed(instrument_id, timeframe, e.to_string());
                GapFill {
                    gap,
                    bars_written: 0,
                    error: Some(e.to_string()),
                }
            }
        }
    }
}
