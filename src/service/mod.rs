//! Market data service.
//!
//! The glue between the transport event stream and the rest of the
//! pipeline: pumps ticks into the aggregator, reconciles sealed bars into
//! the historical cache, and sweeps quiet instruments so their final bars
//! still seal. Holds no per-instrument state of its own; losing this task
//! loses nothing that a restart does not rebuild.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::broadcast;
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::aggregator::BarAggregator;
use crate::cache::BarCache;
use crate::config::AggregatorSettings;
use crate::data::types::Bar;
use crate::gateway::{GatewayEvent, GatewayTransport};

/// Drives the tick-to-cache pipeline for one connection.
pub struct MarketDataService {
    transport: Arc<dyn GatewayTransport>,
    aggregator: Arc<BarAggregator>,
    cache: Arc<BarCache>,
    sweep_interval: std::time::Duration,
    shutdown_tx: broadcast::Sender<()>,
}

impl MarketDataService {
    pub fn new(
        transport: Arc<dyn GatewayTransport>,
        aggregator: Arc<BarAggregator>,
        cache: Arc<BarCache>,
        settings: &AggregatorSettings,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(4);
        Self {
            transport,
            aggregator,
            cache,
            sweep_interval: settings.seal_sweep_interval(),
            shutdown_tx,
        }
    }

    /// Sender used to stop the pump task.
    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    /// Spawn the pump task. Returns its join handle.
    pub fn start(&self) -> tokio::task::JoinHandle<()> {
        let transport = Arc::clone(&self.transport);
        let aggregator = Arc::clone(&self.aggregator);
        let cache = Arc::clone(&self.cache);
        let sweep_interval = self.sweep_interval;
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut events = transport.events();
            let mut sweep = interval(sweep_interval);
            info!("Market data pump started");

            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        info!("Market data pump stopped");
                        return;
                    }
                    _ = sweep.tick() => {
                        let sealed = aggregator.seal_elapsed(Utc::now());
                        for bar in sealed {
                            Self::reconcile(&cache, bar).await;
                        }
                    }
                    event = events.recv() => {
                        match event {
                            Ok(GatewayEvent::Tick(tick)) => {
                                if let Some(sealed) = aggregator.on_tick(&tick) {
                                    Self::reconcile(&cache, sealed).await;
                                }
                            }
                            Ok(GatewayEvent::ProbeAck) => {}
                            Ok(GatewayEvent::Disconnected { reason }) => {
                                // The connection manager handles recovery;
                                // aggregation state stays valid across a
                                // reconnect since bucket math only depends
                                // on event timestamps.
                                debug!("Pump observed disconnect: {}", reason);
                            }
                            Err(broadcast::error::RecvError::Lagged(missed)) => {
                                warn!("Market data pump lagged, {} events dropped", missed);
                            }
                            Err(broadcast::error::RecvError::Closed) => {
                                info!("Gateway event stream closed, pump exiting");
                                return;
                            }
                        }
                    }
                }
            }
        })
    }

    /// Write one sealed bar through to the historical cache. Failures are
    /// logged and dropped: the bar still lives in the aggregator's live
    /// window, and the gap it leaves behind is exactly what the backfill
    /// path repairs.
    async fn reconcile(cache: &BarCache, bar: Bar) {
        let instrument_id = bar.instrument_id.clone();
        let timeframe = bar.timeframe;
        if let Err(e) = cache
            .upsert_bars(&instrument_id, timeframe, std::slice::from_ref(&bar))
            .await
        {
            warn!(
                "Failed to reconcile sealed bar for {} {} at {}: {}",
                instrument_id, timeframe, bar.bucket_start, e
            );
        }
    }
}
