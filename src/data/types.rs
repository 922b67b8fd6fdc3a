use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

// =================================================================
// Connection state
// =================================================================

/// Connection status for the gateway link.
///
/// Owned exclusively by the connection manager; every transition is
/// published as a [`crate::connection::ConnectionEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ConnectionState {
    /// Not connected
    #[default]
    Disconnected,
    /// Initial connection in progress
    Connecting,
    /// Connected and ready
    Connected,
    /// Reconnecting after transport loss
    Reconnecting,
    /// Reconnection policy exhausted
    Error,
}

impl ConnectionState {
    /// Returns true if the gateway is ready for subscribe/unsubscribe calls.
    pub fn is_ready(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    /// Returns true if the connection is in a terminal error state.
    pub fn is_error(&self) -> bool {
        matches!(self, ConnectionState::Error)
    }

    /// Returns true if a connection attempt is in flight.
    pub fn is_connecting(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting | ConnectionState::Reconnecting
        )
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Reconnecting => write!(f, "reconnecting"),
            ConnectionState::Error => write!(f, "error"),
        }
    }
}

// =================================================================
// Stream kinds and subscription state
// =================================================================

/// Kind of per-instrument data stream offered by the gateway.
///
/// Subscription attempts run in [`StreamKind::priority_order`]; depth is
/// optional and a depth failure never fails the overall subscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    /// Best bid/ask quotes (L1)
    Quote,
    /// Trade prints (last price)
    Trade,
    /// Order book depth (L2), best effort
    Depth,
}

impl StreamKind {
    /// All stream kinds in subscription priority order.
    pub fn priority_order() -> [StreamKind; 3] {
        [StreamKind::Quote, StreamKind::Trade, StreamKind::Depth]
    }

    /// Gateway channel name for this kind.
    pub fn channel_name(&self) -> &'static str {
        match self {
            StreamKind::Quote => "quote",
            StreamKind::Trade => "trade",
            StreamKind::Depth => "depth",
        }
    }
}

impl std::fmt::Display for StreamKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.channel_name())
    }
}

/// Per-kind subscription progress, exposed so callers and tests can see
/// exactly which streams degraded instead of inferring it from errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum StreamState {
    /// No attempt made yet
    #[default]
    NotAttempted,
    /// Attempt in flight
    Subscribing,
    /// Stream is live
    Subscribed,
    /// Attempt failed or timed out; not retried this connection epoch
    Unsupported,
}

impl StreamState {
    pub fn is_subscribed(&self) -> bool {
        matches!(self, StreamState::Subscribed)
    }
}

/// Subscription record for one actively watched instrument.
///
/// Created on the first subscribe request, destroyed on unsubscribe or
/// connection teardown.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    /// Instrument identifier
    pub instrument_id: String,
    /// Quote stream state
    pub quote: StreamState,
    /// Trade stream state
    pub trade: StreamState,
    /// Depth stream state
    pub depth: StreamState,
    /// True when the coarse whole-instrument fallback carries this
    /// subscription because no individual stream kind succeeded
    pub fallback_active: bool,
    /// When the subscription was created
    pub created_at: DateTime<Utc>,
}

impl Subscription {
    pub fn new(instrument_id: impl Into<String>) -> Self {
        Self {
            instrument_id: instrument_id.into(),
            quote: StreamState::NotAttempted,
            trade: StreamState::NotAttempted,
            depth: StreamState::NotAttempted,
            fallback_active: false,
            created_at: Utc::now(),
        }
    }

    /// State for a given stream kind.
    pub fn state(&self, kind: StreamKind) -> StreamState {
        match kind {
            StreamKind::Quote => self.quote,
            StreamKind::Trade => self.trade,
            StreamKind::Depth => self.depth,
        }
    }

    /// Set the state for a given stream kind.
    pub fn set_state(&mut self, kind: StreamKind, state: StreamState) {
        match kind {
            StreamKind::Quote => self.quote = state,
            StreamKind::Trade => self.trade = state,
            StreamKind::Depth => self.depth = state,
        }
    }

    /// Kinds currently subscribed.
    pub fn subscribed_kinds(&self) -> Vec<StreamKind> {
        StreamKind::priority_order()
            .into_iter()
            .filter(|k| self.state(*k).is_subscribed())
            .collect()
    }

    /// True if any stream kind (or the coarse fallback) delivers data.
    pub fn is_active(&self) -> bool {
        self.fallback_active || !self.subscribed_kinds().is_empty()
    }
}

// =================================================================
// Ticks
// =================================================================

/// A single incoming price update from the streaming gateway.
///
/// Ticks are transient: they are consumed by the bar aggregator immediately
/// and never persisted as-is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    /// Instrument identifier
    pub instrument_id: String,
    /// Event timestamp
    pub timestamp: DateTime<Utc>,
    /// Last trade price, if this tick carries one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last: Option<Decimal>,
    /// Best bid price
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bid: Option<Decimal>,
    /// Best ask price
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ask: Option<Decimal>,
    /// Traded size, when the gateway reports one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size_hint: Option<Decimal>,
}

impl Tick {
    /// Tick carrying a last trade price.
    pub fn trade(
        instrument_id: impl Into<String>,
        timestamp: DateTime<Utc>,
        last: Decimal,
        size_hint: Option<Decimal>,
    ) -> Self {
        Self {
            instrument_id: instrument_id.into(),
            timestamp,
            last: Some(last),
            bid: None,
            ask: None,
            size_hint,
        }
    }

    /// Tick carrying a bid/ask quote.
    pub fn quote(
        instrument_id: impl Into<String>,
        timestamp: DateTime<Utc>,
        bid: Decimal,
        ask: Decimal,
    ) -> Self {
        Self {
            instrument_id: instrument_id.into(),
            timestamp,
            last: None,
            bid: Some(bid),
            ask: Some(ask),
            size_hint: None,
        }
    }

    /// Price used for aggregation: last trade price when present, otherwise
    /// the bid/ask midpoint. `None` means the tick is unusable and dropped.
    pub fn effective_price(&self) -> Option<Decimal> {
        if let Some(last) = self.last {
            return Some(last);
        }
        match (self.bid, self.ask) {
            (Some(bid), Some(ask)) => Some((bid + ask) / Decimal::TWO),
            _ => None,
        }
    }

    /// Volume contribution: the reported size when available, otherwise a
    /// count of one per tick.
    pub fn volume_increment(&self) -> Decimal {
        self.size_hint.unwrap_or(Decimal::ONE)
    }
}

// =================================================================
// Timeframes and bars
// =================================================================

/// Fixed bar interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Timeframe {
    #[serde(rename = "1m")]
    OneMinute,
    #[serde(rename = "5m")]
    FiveMinutes,
    #[serde(rename = "15m")]
    FifteenMinutes,
    #[serde(rename = "30m")]
    ThirtyMinutes,
    #[serde(rename = "1h")]
    OneHour,
    #[serde(rename = "4h")]
    FourHours,
    #[serde(rename = "1d")]
    OneDay,
}

impl Timeframe {
    /// Interval width in milliseconds.
    pub fn as_millis(&self) -> i64 {
        match self {
            Timeframe::OneMinute => 60_000,
            Timeframe::FiveMinutes => 300_000,
            Timeframe::FifteenMinutes => 900_000,
            Timeframe::ThirtyMinutes => 1_800_000,
            Timeframe::OneHour => 3_600_000,
            Timeframe::FourHours => 14_400_000,
            Timeframe::OneDay => 86_400_000,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Timeframe::OneMinute => "1m",
            Timeframe::FiveMinutes => "5m",
            Timeframe::FifteenMinutes => "15m",
            Timeframe::ThirtyMinutes => "30m",
            Timeframe::OneHour => "1h",
            Timeframe::FourHours => "4h",
            Timeframe::OneDay => "1d",
        }
    }

    /// Parse the short form produced by [`Timeframe::as_str`].
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "1m" => Some(Timeframe::OneMinute),
            "5m" => Some(Timeframe::FiveMinutes),
            "15m" => Some(Timeframe::FifteenMinutes),
            "30m" => Some(Timeframe::ThirtyMinutes),
            "1h" => Some(Timeframe::OneHour),
            "4h" => Some(Timeframe::FourHours),
            "1d" => Some(Timeframe::OneDay),
            _ => None,
        }
    }

    /// Bucket start containing `timestamp`: epoch milliseconds floored to
    /// the interval width.
    pub fn align(&self, timestamp: DateTime<Utc>) -> DateTime<Utc> {
        let width = self.as_millis();
        let floored = timestamp.timestamp_millis().div_euclid(width) * width;
        Utc.timestamp_millis_opt(floored).unwrap()
    }

    /// Smallest bucket boundary at or after `timestamp`.
    pub fn align_up(&self, timestamp: DateTime<Utc>) -> DateTime<Utc> {
        let aligned = self.align(timestamp);
        if aligned == timestamp {
            aligned
        } else {
            aligned + chrono::Duration::milliseconds(self.as_millis())
        }
    }
}

impl std::fmt::Display for Timeframe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One OHLCV bar.
///
/// A live bar is mutable inside the aggregator until its bucket elapses;
/// once sealed it is immutable and corrections arrive as replacement bars
/// with the same `bucket_start` (upsert semantics).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    /// Instrument identifier
    pub instrument_id: String,
    /// Bar interval
    pub timeframe: Timeframe,
    /// Timeframe-aligned bucket start; unique per (instrument, timeframe)
    pub bucket_start: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
}

impl Bar {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        instrument_id: impl Into<String>,
        timeframe: Timeframe,
        bucket_start: DateTime<Utc>,
        open: Decimal,
        high: Decimal,
        low: Decimal,
        close: Decimal,
        volume: Decimal,
    ) -> Self {
        Self {
            instrument_id: instrument_id.into(),
            timeframe,
            bucket_start,
            open,
            high,
            low,
            close,
            volume,
        }
    }

    /// Exclusive end of this bar's bucket.
    pub fn bucket_end(&self) -> DateTime<Utc> {
        self.bucket_start + chrono::Duration::milliseconds(self.timeframe.as_millis())
    }

    /// Invariant check: `low <= min(open, close) <= max(open, close) <= high`
    /// and a non-negative volume. Bars failing this are dropped by the
    /// series merger rather than rendered.
    pub fn is_well_formed(&self) -> bool {
        let body_high = self.open.max(self.close);
        let body_low = self.open.min(self.close);
        self.high >= body_high
            && self.low <= body_low
            && self.high >= self.low
            && self.volume >= Decimal::ZERO
    }
}

// =================================================================
// Gaps and sync status
// =================================================================

/// A sub-range of a query window with no cached bar coverage.
///
/// Derived, never persisted. Boundaries are timeframe-aligned so a backfill
/// fetch requests exactly the missing buckets. `end` is exclusive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Gap {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl Gap {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    /// Number of missing buckets for the given timeframe.
    pub fn bucket_count(&self, timeframe: Timeframe) -> i64 {
        (self.end - self.start).num_milliseconds() / timeframe.as_millis()
    }
}

/// Synchronization state for one (instrument, timeframe) cache slice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncState {
    /// No sync attempted yet
    #[default]
    Pending,
    /// A backfill is in flight
    Syncing,
    /// Last write succeeded
    Synced,
    /// Last backfill attempt failed
    Failed,
}

impl SyncState {
    /// True when the cached range can be treated as current.
    pub fn is_synced(&self) -> bool {
        matches!(self, SyncState::Synced)
    }
}

/// Advisory freshness metadata for one (instrument, timeframe).
///
/// Updated after every cache write or failed fetch; read by the gap
/// detector's callers to decide whether a range is trustworthy. Not a
/// correctness guarantee for queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncStatus {
    pub instrument_id: String,
    pub timeframe: Timeframe,
    pub last_synced: Option<DateTime<Utc>>,
    pub state: SyncState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
}

impl SyncStatus {
    pub fn new(instrument_id: impl Into<String>, timeframe: Timeframe) -> Self {
        Self {
            instrument_id: instrument_id.into(),
            timeframe,
            last_synced: None,
            state: SyncState::Pending,
            error_detail: None,
        }
    }
}
