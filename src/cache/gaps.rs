//! Gap detection over cached bar coverage.
//!
//! A gap is a timeframe-aligned sub-range of a query window with no cached
//! bar, computed so a backfill fetch can request exactly the missing
//! buckets.

use chrono::{DateTime, Duration, Utc};

use crate::data::types::{Bar, Gap, Timeframe};

/// Find uncovered sub-ranges of `[start, end)` given the cached bars for
/// that window, sorted ascending by bucket start.
///
/// The window is aligned outward (start down, end up) before scanning:
/// - empty input: the whole window is one gap
/// - leading gap when the first bar starts after the window start
/// - interior gap wherever consecutive bars are more than one interval
///   apart
/// - trailing gap when the last bar ends before the window end
pub fn find_gaps(
    bars: &[Bar],
    timeframe: Timeframe,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Vec<Gap> {
    let window_start = timeframe.align(start);
    let window_end = timeframe.align_up(end);
    if window_start >= window_end {
        return Vec::new();
    }

    if bars.is_empty() {
        return vec![Gap::new(window_start, window_end)];
    }

    let interval = Duration::milliseconds(timeframe.as_millis());
    let mut gaps = Vec::new();

    let first = bars[0].bucket_start;
    if first > window_start {
        gaps.push(Gap::new(window_start, first));
    }

    for pair in bars.windows(2) {
        let prev_end = pair[0].bucket_start + interval;
        let next_start = pair[1].bucket_start;
        if next_start > prev_end {
            gaps.push(Gap::new(prev_end, next_start));
        }
    }

    let covered_end = bars[bars.len() - 1].bucket_start + interval;
    if covered_end < window_end {
        gaps.push(Gap::new(covered_end, window_end));
    }

    gaps
}
