//! Connection manager.
//!
//! Owns the single persistent gateway connection: the state machine, the
//! reconnect policy and the health check. Transport failures never reach
//! callers as errors; they surface as state transitions on the event
//! channel. Callers observe state, not exceptions.

use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::ConnectionSettings;
use crate::data::types::ConnectionState;
use crate::error::{TransportError, TransportResult};
use crate::gateway::{Credentials, GatewayEvent, GatewayTransport};

const STATE_CHANNEL_CAPACITY: usize = 64;

/// State-change notification: the new state plus a human-readable message
/// suitable for direct display. The UI layer never sees raw transport
/// errors.
#[derive(Debug, Clone)]
pub struct ConnectionEvent {
    pub state: ConnectionState,
    pub message: String,
}

/// Opaque handle returned by [`ConnectionManager::connect`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionHandle {
    pub id: Uuid,
    pub opened_at: DateTime<Utc>,
}

/// Manages one persistent gateway connection.
///
/// State machine: Disconnected → Connecting → Connected; Connected →
/// Reconnecting on transport loss; Reconnecting → Connected on success or →
/// Error after the retry allowance runs out; any state → Disconnected on
/// explicit disconnect.
///
/// Cheap to clone; clones share the same connection.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

struct Inner {
    transport: Arc<dyn GatewayTransport>,
    config: ConnectionSettings,
    state: RwLock<ConnectionState>,
    credentials: Mutex<Option<Credentials>>,
    events_tx: broadcast::Sender<ConnectionEvent>,
    shutdown_tx: broadcast::Sender<()>,
    /// Epoch milliseconds of the last inbound transport event
    last_activity_ms: AtomicI64,
    reconnect_attempts: AtomicU32,
}

impl ConnectionManager {
    pub fn new(transport: Arc<dyn GatewayTransport>, config: ConnectionSettings) -> Self {
        let (events_tx, _) = broadcast::channel(STATE_CHANNEL_CAPACITY);
        let (shutdown_tx, _) = broadcast::channel(4);
        Self {
            inner: Arc::new(Inner {
                transport,
                config,
                state: RwLock::new(ConnectionState::Disconnected),
                credentials: Mutex::new(None),
                events_tx,
                shutdown_tx,
                last_activity_ms: AtomicI64::new(0),
                reconnect_attempts: AtomicU32::new(0),
            }),
        }
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.inner.state.read()
    }

    /// Subscribe to state-change events.
    pub fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.events_tx.subscribe()
    }

    /// Timestamp of the last inbound transport event.
    pub fn last_activity(&self) -> Option<DateTime<Utc>> {
        self.inner.last_activity()
    }

    /// Reconnect attempts since the last successful connect.
    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.reconnect_attempts.load(Ordering::SeqCst)
    }

    /// Backoff before reconnect attempt `attempt` (0-based): the first
    /// retry is immediate, then the delay doubles from the base up to the
    /// cap. Resets to attempt 0 after every successful reconnect.
    pub fn reconnect_delay(&self, attempt: u32) -> Duration {
        self.inner.reconnect_delay(attempt)
    }

    /// Establish the connection.
    ///
    /// Suspends until the transport reports connected. A failed initial
    /// attempt transitions to the error state and returns the transport
    /// error; once connected, all transport trouble surfaces as state
    /// events and the reconnect policy, never as errors to callers.
    pub async fn connect(&self, credentials: Credentials) -> TransportResult<ConnectionHandle> {
        {
            let state = self.state();
            if state.is_ready() || state.is_connecting() {
                return Err(TransportError::AlreadyConnected(state));
            }
        }

        let inner = &self.inner;
        *inner.credentials.lock() = Some(credentials.clone());
        inner.set_state(ConnectionState::Connecting, "Connecting to gateway");

        match inner.transport.open(&credentials).await {
            Ok(()) => {
                inner.touch();
                inner.reconnect_attempts.store(0, Ordering::SeqCst);
                inner.set_state(ConnectionState::Connected, "Connected to gateway");

                tokio::spawn(Inner::supervise(Arc::clone(inner)));

                Ok(ConnectionHandle {
                    id: Uuid::new_v4(),
                    opened_at: Utc::now(),
                })
            }
            Err(e) => {
                inner.set_state(ConnectionState::Error, &format!("Connection failed: {}", e));
                Err(e)
            }
        }
    }

    /// Tear the connection down. Safe to call from any state.
    pub async fn disconnect(&self) {
        let inner = &self.inner;
        let _ = inner.shutdown_tx.send(());
        // Leave the ready state before closing the socket so the close
        // event from the transport is not mistaken for a lost connection.
        inner.set_state(ConnectionState::Disconnected, "Disconnected");
        if let Err(e) = inner.transport.close().await {
            debug!("Transport close during disconnect failed: {}", e);
        }
        *inner.credentials.lock() = None;
    }
}

impl Inner {
    fn reconnect_delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let ms = self
            .config
            .reconnect_base_ms
            .saturating_mul(2u64.saturating_pow(attempt.min(16)));
        Duration::from_millis(ms.min(self.config.reconnect_max_ms))
    }

    fn last_activity(&self) -> Option<DateTime<Utc>> {
        match self.last_activity_ms.load(Ordering::Relaxed) {
            0 => None,
            ms => Utc.timestamp_millis_opt(ms).single(),
        }
    }

    /// Supervisor loop: pumps transport events for liveness accounting and
    /// disconnect detection, and runs the periodic health check.
    async fn supervise(self: Arc<Self>) {
        let mut events = self.transport.events();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut probe_timer = interval(self.config.probe_interval());
        probe_timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick fires immediately; consume it so probes start one
        // interval after connect.
        probe_timer.tick().await;

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    debug!("Connection supervisor shutting down");
                    break;
                }
                _ = probe_timer.tick() => {
                    self.run_health_check().await;
                }
                event = events.recv() => {
                    match event {
                        Ok(event) => {
                            self.touch();
                            if let GatewayEvent::Disconnected { reason } = event {
                                self.handle_transport_loss(&reason).await;
                                if self.state_is_error() {
                                    break;
                                }
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            warn!("Connection supervisor lagged, {} events dropped", missed);
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            self.handle_transport_loss("event stream closed").await;
                            break;
                        }
                    }
                }
            }
        }
    }

    /// Liveness probe plus stale-connection diagnostics.
    ///
    /// The transport layer is trusted to surface real failures itself, so a
    /// quiet-but-open connection only produces a warning.
    async fn run_health_check(&self) {
        if !self.state.read().is_ready() {
            return;
        }

        match timeout(self.config.probe_timeout(), self.transport.probe()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Liveness probe failed: {}", e),
            Err(_) => warn!(
                "Liveness probe timed out after {:?}",
                self.config.probe_timeout()
            ),
        }

        if let Some(last) = self.last_activity() {
            let idle = Utc::now() - last;
            if idle > self.config.idle_warning() {
                warn!(
                    "Gateway connected but no inbound activity for {}s",
                    idle.num_seconds()
                );
            }
        }
    }

    /// Transport dropped out from under an established connection: switch
    /// to Reconnecting and run the backoff loop.
    async fn handle_transport_loss(&self, reason: &str) {
        if !self.state.read().is_ready() {
            return;
        }

        self.set_state(
            ConnectionState::Reconnecting,
            &format!("Connection lost: {}", reason),
        );
        self.reconnect_loop().await;
    }

    async fn reconnect_loop(&self) {
        let credentials = match self.credentials.lock().clone() {
            Some(c) => c,
            None => {
                // disconnect() raced us; nothing to reconnect to
                return;
            }
        };

        let mut shutdown_rx = self.shutdown_tx.subscribe();

        for attempt in 0..self.config.max_reconnect_attempts {
            self.reconnect_attempts.store(attempt + 1, Ordering::SeqCst);
            let delay = self.reconnect_delay(attempt);

            tokio::select! {
                _ = shutdown_rx.recv() => {
                    debug!("Reconnect loop canceled by shutdown");
                    return;
                }
                _ = tokio::time::sleep(delay) => {}
            }

            debug!("Reconnect attempt {} after {:?} backoff", attempt + 1, delay);

            match self.transport.open(&credentials).await {
                Ok(()) => {
                    self.touch();
                    self.reconnect_attempts.store(0, Ordering::SeqCst);
                    self.set_state(
                        ConnectionState::Connected,
                        &format!("Reconnected after {} attempt(s)", attempt + 1),
                    );
                    return;
                }
                Err(e) => {
                    debug!("Reconnect attempt {} failed: {}", attempt + 1, e);
                }
            }
        }

        self.set_state(
            ConnectionState::Error,
            &format!(
                "Gave up reconnecting after {} attempts",
                self.config.max_reconnect_attempts
            ),
        );
    }

    fn state_is_error(&self) -> bool {
        self.state.read().is_error()
    }

    fn touch(&self) {
        self.last_activity_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    fn set_state(&self, state: ConnectionState, message: &str) {
        *self.state.write() = state;
        info!("Connection state: {} ({})", state, message);
        let _ = self.events_tx.send(ConnectionEvent {
            state,
            message: message.to_string(),
        });
    }
}
