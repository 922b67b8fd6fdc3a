//! Real-time OHLCV bar aggregation.
//!
//! Consumes the tick stream and synthesizes fixed-interval bars. One open
//! bar per instrument lives in a keyed store owned by the aggregator
//! instance; a bar seals when a tick arrives for a later bucket (or when
//! the timer sweep finds its bucket elapsed), at which point it is emitted
//! on the sealed-bar channel and becomes immutable.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use tokio::sync::broadcast;
use tracing::debug;

use crate::config::AggregatorSettings;
use crate::data::types::{Bar, Tick, Timeframe};
use crate::error::AggregationError;

const SEALED_CHANNEL_CAPACITY: usize = 1_024;

/// Accumulates ticks into one open bar.
#[derive(Debug, Clone)]
struct BarBuilder {
    instrument_id: String,
    timeframe: Timeframe,
    bucket_start: DateTime<Utc>,
    open: Decimal,
    high: Decimal,
    low: Decimal,
    close: Decimal,
    volume: Decimal,
}

impl BarBuilder {
    fn new(
        instrument_id: String,
        timeframe: Timeframe,
        bucket_start: DateTime<Utc>,
        price: Decimal,
        volume: Decimal,
    ) -> Self {
        Self {
            instrument_id,
            timeframe,
            bucket_start,
            open: price,
            high: price,
            low: price,
            close: price,
            volume,
        }
    }

    fn apply(&mut self, price: Decimal, volume: Decimal) {
        if price > self.high {
            self.high = price;
        }
        if price < self.low {
            self.low = price;
        }
        self.close = price;
        self.volume += volume;
    }

    fn bucket_end(&self) -> DateTime<Utc> {
        self.bucket_start + chrono::Duration::milliseconds(self.timeframe.as_millis())
    }

    fn build(&self) -> Bar {
        Bar {
            instrument_id: self.instrument_id.clone(),
            timeframe: self.timeframe,
            bucket_start: self.bucket_start,
            open: self.open,
            high: self.high,
            low: self.low,
            close: self.close,
            volume: self.volume,
        }
    }
}

/// Per-instrument aggregation state.
#[derive(Debug, Default)]
struct InstrumentState {
    open_bar: Option<BarBuilder>,
    /// Recently sealed bars, newest last, trimmed to the lookback
    sealed: VecDeque<Bar>,
}

/// Tick-to-bar aggregator for one timeframe across many instruments.
///
/// Ticks for a single instrument must arrive in delivery order (the
/// gateway sends events serially per socket); instruments are independent.
pub struct BarAggregator {
    timeframe: Timeframe,
    lookback_bars: usize,
    instruments: RwLock<HashMap<String, InstrumentState>>,
    sealed_tx: broadcast::Sender<Bar>,
}

impl BarAggregator {
    pub fn new(settings: &AggregatorSettings) -> Self {
        let (sealed_tx, _) = broadcast::channel(SEALED_CHANNEL_CAPACITY);
        Self {
            timeframe: settings.timeframe,
            lookback_bars: settings.lookback_bars,
            instruments: RwLock::new(HashMap::new()),
            sealed_tx,
        }
    }

    pub fn timeframe(&self) -> Timeframe {
        self.timeframe
    }

    /// Subscribe to sealed-bar events for incremental chart updates.
    pub fn sealed(&self) -> broadcast::Receiver<Bar> {
        self.sealed_tx.subscribe()
    }

    /// Process one tick. Returns the bar this tick sealed, if any.
    ///
    /// Ticks without a usable price are dropped. Ticks whose bucket lies
    /// before the open bar's bucket are dropped too: sealed bars are
    /// immutable, so out-of-order delivery never mutates history.
    pub fn on_tick(&self, tick: &Tick) -> Option<Bar> {
        let price = match tick.effective_price() {
            Some(price) => price,
            None => {
                let anomaly = AggregationError::NoUsablePrice {
                    instrument: tick.instrument_id.clone(),
                };
                debug!("Dropping tick: {}", anomaly);
                return None;
            }
        };
        let volume = tick.volume_increment();
        let bucket = self.timeframe.align(tick.timestamp);

        let mut instruments = self.instruments.write();
        let state = instruments.entry(tick.instrument_id.clone()).or_default();

        let sealed = match &mut state.open_bar {
            Some(open) if bucket == open.bucket_start => {
                open.apply(price, volume);
                None
            }
            Some(open) if bucket < open.bucket_start => {
                let anomaly = AggregationError::OutOfOrder {
                    instrument: tick.instrument_id.clone(),
                    tick_bucket: bucket,
                    open_bucket: open.bucket_start,
                };
                debug!("Dropping tick: {}", anomaly);
                None
            }
            Some(open) => {
                // Tick belongs to a later bucket: seal and roll
                let sealed = open.build();
                *open = BarBuilder::new(
                    tick.instrument_id.clone(),
                    self.timeframe,
                    bucket,
                    price,
                    volume,
                );
                Some(sealed)
            }
            None => {
                state.open_bar = Some(BarBuilder::new(
                    tick.instrument_id.clone(),
                    self.timeframe,
                    bucket,
                    price,
                    volume,
                ));
                None
            }
        };

        if let Some(bar) = &sealed {
            Self::retain_sealed(state, bar.clone(), self.lookback_bars);
            let _ = self.sealed_tx.send(bar.clone());
        }

        sealed
    }

    /// Seal any open bars whose bucket has fully elapsed at `now`.
    ///
    /// Run from a periodic sweep so quiet instruments still deliver their
    /// final bar instead of waiting for the next tick.
    pub fn seal_elapsed(&self, now: DateTime<Utc>) -> Vec<Bar> {
        let mut sealed = Vec::new();
        let mut instruments = self.instruments.write();

        for state in instruments.values_mut() {
            let elapsed = state
                .open_bar
                .as_ref()
                .map(|open| now >= open.bucket_end())
                .unwrap_or(false);
            if elapsed {
                if let Some(open) = state.open_bar.take() {
                    let bar = open.build();
                    Self::retain_sealed(state, bar.clone(), self.lookback_bars);
                    sealed.push(bar);
                }
            }
        }

        for bar in &sealed {
            let _ = self.sealed_tx.send(bar.clone());
        }

        sealed
    }

    /// The currently open (still mutable) bar for an instrument.
    pub fn current_bar(&self, instrument_id: &str) -> Option<Bar> {
        self.instruments
            .read()
            .get(instrument_id)
            .and_then(|state| state.open_bar.as_ref().map(BarBuilder::build))
    }

    /// Live view of an instrument: recently sealed bars followed by the
    /// open bar. This is the aggregator-side input to the series merger.
    pub fn live_series(&self, instrument_id: &str) -> Vec<Bar> {
        let instruments = self.instruments.read();
        let Some(state) = instruments.get(instrument_id) else {
            return Vec::new();
        };

        let mut bars: Vec<Bar> = state.sealed.iter().cloned().collect();
        if let Some(open) = &state.open_bar {
            bars.push(open.build());
        }
        bars
    }

    /// Forget all per-instrument state, e.g. on connection teardown.
    pub fn clear(&self) {
        self.instruments.write().clear();
    }

    fn retain_sealed(state: &mut InstrumentState, bar: Bar, lookback: usize) {
        state.sealed.push_back(bar);
        while state.sealed.len() > lookback {
            state.sealed.pop_front();
        }
    }
}
