//! End-to-end pipeline test over the public API: fake gateway transport →
//! connection manager → subscription coordinator → tick stream → bar
//! aggregator → historical cache → merged series.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use rust_decimal_macros::dec;
use tokio::sync::broadcast;
use tokio::time::timeout;

use marketfeed::aggregator::BarAggregator;
use marketfeed::cache::BarCache;
use marketfeed::config::{AggregatorSettings, ConnectionSettings, SubscriptionSettings};
use marketfeed::connection::{ConnectionEvent, ConnectionManager};
use marketfeed::data::types::{ConnectionState, StreamKind, StreamState, Tick, Timeframe};
use marketfeed::error::TransportResult;
use marketfeed::gateway::{Credentials, GatewayEvent, GatewayTransport};
use marketfeed::series::{RenderMode, SeriesMerger};
use marketfeed::subscription::SubscriptionCoordinator;

/// Scriptable in-process gateway.
struct FakeGateway {
    events_tx: broadcast::Sender<GatewayEvent>,
    fail_kinds: HashSet<StreamKind>,
    /// Number of open() calls to fail before succeeding
    open_failures: Mutex<u32>,
    open_calls: Mutex<u32>,
}

impl FakeGateway {
    fn new() -> Self {
        let (events_tx, _) = broadcast::channel(1_024);
        Self {
            events_tx,
            fail_kinds: HashSet::new(),
            open_failures: Mutex::new(0),
            open_calls: Mutex::new(0),
        }
    }

    fn push_tick(&self, tick: Tick) {
        let _ = self.events_tx.send(GatewayEvent::Tick(tick));
    }

    fn drop_connection(&self, reason: &str) {
        let _ = self.events_tx.send(GatewayEvent::Disconnected {
            reason: reason.to_string(),
        });
    }
}

#[async_trait]
impl GatewayTransport for FakeGateway {
    async fn open(&self, _credentials: &Credentials) -> TransportResult<()> {
        *self.open_calls.lock() += 1;
        let mut failures = self.open_failures.lock();
        if *failures > 0 {
            *failures -= 1;
            return Err(marketfeed::error::TransportError::Connection(
                "gateway unavailable".to_string(),
            ));
        }
        Ok(())
    }

    async fn close(&self) -> TransportResult<()> {
        Ok(())
    }

    async fn probe(&self) -> TransportResult<()> {
        let _ = self.events_tx.send(GatewayEvent::ProbeAck);
        Ok(())
    }

    async fn subscribe(&self, _instrument_id: &str, kind: StreamKind) -> TransportResult<()> {
        if self.fail_kinds.contains(&kind) {
            Err(marketfeed::error::TransportError::Connection(format!(
                "{} stream not offered",
                kind
            )))
        } else {
            Ok(())
        }
    }

    async fn subscribe_instrument(&self, _instrument_id: &str) -> TransportResult<()> {
        Ok(())
    }

    async fn unsubscribe(&self, _instrument_id: &str, _kind: StreamKind) -> TransportResult<()> {
        Ok(())
    }

    async fn unsubscribe_instrument(&self, _instrument_id: &str) -> TransportResult<()> {
        Ok(())
    }

    fn events(&self) -> broadcast::Receiver<GatewayEvent> {
        self.events_tx.subscribe()
    }

    fn is_open(&self) -> bool {
        true
    }
}

fn ts(seconds: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(seconds * 1_000).unwrap()
}

async fn next_state(
    events: &mut broadcast::Receiver<ConnectionEvent>,
) -> ConnectionState {
    timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("timed out waiting for connection event")
        .expect("event channel closed")
        .state
}

#[tokio::test]
async fn test_full_pipeline_tick_to_rendered_series() {
    let mut gateway = FakeGateway::new();
    gateway.fail_kinds.insert(StreamKind::Depth);
    let gateway = Arc::new(gateway);

    let connection = ConnectionManager::new(
        gateway.clone() as Arc<dyn GatewayTransport>,
        ConnectionSettings::default(),
    );
    let mut state_events = connection.events();

    // Connect: Connecting then Connected
    connection
        .connect(Credentials::new("session-token"))
        .await
        .expect("connect");
    assert_eq!(next_state(&mut state_events).await, ConnectionState::Connecting);
    assert_eq!(next_state(&mut state_events).await, ConnectionState::Connected);
    assert!(connection.last_activity().is_some());

    // Subscribe with depth degraded
    let coordinator = SubscriptionCoordinator::new(
        gateway.clone() as Arc<dyn GatewayTransport>,
        connection.clone(),
        &SubscriptionSettings::default(),
    );
    let subscription = coordinator.subscribe("ESZ5").await.expect("subscribe");
    assert_eq!(subscription.quote, StreamState::Subscribed);
    assert_eq!(subscription.trade, StreamState::Subscribed);
    assert_eq!(subscription.depth, StreamState::Unsupported);

    // Drive the tick stream through the aggregator
    let aggregator = Arc::new(BarAggregator::new(&AggregatorSettings::default()));
    let cache = Arc::new(BarCache::in_memory());
    let mut gateway_events = gateway.events();

    // Historical context already cached for bucket [0, 60); the live feed
    // will re-deliver that bucket with a different close, and live wins.
    cache
        .upsert_bars(
            "ESZ5",
            Timeframe::OneMinute,
            &[marketfeed::data::types::Bar::new(
                "ESZ5",
                Timeframe::OneMinute,
                ts(0),
                dec!(4500),
                dec!(4500),
                dec!(4500),
                dec!(4500),
                dec!(10),
            )],
        )
        .await
        .unwrap();

    for tick in [
        Tick::trade("ESZ5", ts(5), dec!(4501), Some(dec!(2))),
        Tick::trade("ESZ5", ts(30), dec!(4503), Some(dec!(1))),
        Tick::quote("ESZ5", ts(70), dec!(4504), dec!(4506)),
        Tick::trade("ESZ5", ts(95), dec!(4507), Some(dec!(3))),
    ] {
        gateway.push_tick(tick);
    }

    let mut sealed = Vec::new();
    for _ in 0..4 {
        let event = timeout(Duration::from_secs(5), gateway_events.recv())
            .await
            .expect("timed out waiting for gateway event")
            .expect("gateway event channel closed");
        if let GatewayEvent::Tick(tick) = event {
            if let Some(bar) = aggregator.on_tick(&tick) {
                sealed.push(bar);
            }
        }
    }

    // The tick at t=70 sealed bucket [0, 60)
    assert_eq!(sealed.len(), 1);
    assert_eq!(sealed[0].bucket_start, ts(0));
    assert_eq!(sealed[0].open, dec!(4501));
    assert_eq!(sealed[0].close, dec!(4503));
    assert_eq!(sealed[0].volume, dec!(3));

    // Live-to-historical reconciliation: sealed bars are upserted
    cache
        .upsert_bars("ESZ5", Timeframe::OneMinute, &sealed)
        .await
        .unwrap();

    // Hybrid render: unique increasing buckets, live open bar included
    let merger = SeriesMerger::new(cache.clone(), aggregator.clone());
    let series = merger
        .render_series("ESZ5", Timeframe::OneMinute, ts(0), ts(300), RenderMode::Hybrid)
        .await
        .unwrap();

    assert_eq!(series.len(), 2);
    assert_eq!(series[0].bucket_start, ts(0));
    assert_eq!(series[0].close, dec!(4503)); // live sealed bar beat the cached 4500
    assert_eq!(series[1].bucket_start, ts(60));
    assert_eq!(series[1].close, dec!(4507)); // still-open live bar
    assert!(series.windows(2).all(|w| w[0].bucket_start < w[1].bucket_start));

    // Sync status reflects the writes
    let status = cache
        .sync_status("ESZ5", Timeframe::OneMinute)
        .expect("sync status");
    assert!(status.state.is_synced());

    // Teardown
    coordinator.unsubscribe("ESZ5").await;
    connection.disconnect().await;
    assert_eq!(connection.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_transport_loss_triggers_reconnect() {
    let gateway = Arc::new(FakeGateway::new());
    let connection = ConnectionManager::new(
        gateway.clone() as Arc<dyn GatewayTransport>,
        ConnectionSettings::default(),
    );
    let mut state_events = connection.events();

    connection
        .connect(Credentials::new("session-token"))
        .await
        .expect("connect");
    assert_eq!(next_state(&mut state_events).await, ConnectionState::Connecting);
    assert_eq!(next_state(&mut state_events).await, ConnectionState::Connected);

    // The transport drops; the first retry is immediate and succeeds
    gateway.drop_connection("socket reset by peer");
    assert_eq!(next_state(&mut state_events).await, ConnectionState::Reconnecting);
    assert_eq!(next_state(&mut state_events).await, ConnectionState::Connected);
    assert_eq!(*gateway.open_calls.lock(), 2);
}

#[tokio::test]
async fn test_reconnect_survives_transient_open_failures() {
    let gateway = Arc::new(FakeGateway::new());
    // First reconnect attempt fails, the backed-off second one succeeds
    let mut settings = ConnectionSettings::default();
    settings.reconnect_base_ms = 10; // keep the test fast

    let connection = ConnectionManager::new(
        gateway.clone() as Arc<dyn GatewayTransport>,
        settings,
    );
    let mut state_events = connection.events();

    connection
        .connect(Credentials::new("session-token"))
        .await
        .expect("connect");
    assert_eq!(next_state(&mut state_events).await, ConnectionState::Connecting);
    assert_eq!(next_state(&mut state_events).await, ConnectionState::Connected);

    *gateway.open_failures.lock() = 1;
    gateway.drop_connection("gateway restart");

    assert_eq!(next_state(&mut state_events).await, ConnectionState::Reconnecting);
    assert_eq!(next_state(&mut state_events).await, ConnectionState::Connected);
    // initial connect + failed retry + successful retry
    assert_eq!(*gateway.open_calls.lock(), 3);
}

#[tokio::test]
async fn test_resubscribe_after_reconnect() {
    let gateway = Arc::new(FakeGateway::new());
    let connection = ConnectionManager::new(
        gateway.clone() as Arc<dyn GatewayTransport>,
        ConnectionSettings::default(),
    );
    let mut state_events = connection.events();

    connection
        .connect(Credentials::new("session-token"))
        .await
        .expect("connect");
    assert_eq!(next_state(&mut state_events).await, ConnectionState::Connecting);
    assert_eq!(next_state(&mut state_events).await, ConnectionState::Connected);

    let coordinator = SubscriptionCoordinator::new(
        gateway.clone() as Arc<dyn GatewayTransport>,
        connection.clone(),
        &SubscriptionSettings::default(),
    );
    coordinator.subscribe("ESZ5").await.expect("subscribe");
    coordinator.subscribe("NQZ5").await.expect("subscribe");

    let watched = coordinator.active_instruments();
    gateway.drop_connection("socket reset");
    assert_eq!(next_state(&mut state_events).await, ConnectionState::Reconnecting);

    // Subscriptions are destroyed on teardown; callers re-subscribe once
    // the manager reports Connected again. Nothing is queued meanwhile.
    coordinator.clear();
    assert_eq!(coordinator.subscription_count(), 0);

    assert_eq!(next_state(&mut state_events).await, ConnectionState::Connected);
    for instrument in &watched {
        coordinator.subscribe(instrument).await.expect("resubscribe");
    }
    assert_eq!(coordinator.subscription_count(), 2);
}
