//! Subscription coordinator.
//!
//! Subscribes and unsubscribes per-instrument data streams on top of an
//! established connection, tolerating partial gateway capability. Stream
//! kinds are attempted in priority order from a data-driven cascade, so
//! supporting a new gateway variant means a different attempt list, not new
//! branching.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::SubscriptionSettings;
use crate::connection::ConnectionManager;
use crate::data::types::{StreamKind, StreamState, Subscription};
use crate::error::{SubscriptionError, SubscriptionResult};
use crate::gateway::GatewayTransport;

/// One step of the subscribe cascade.
#[derive(Debug, Clone, Copy)]
pub struct StreamAttempt {
    pub kind: StreamKind,
    pub timeout: Duration,
    /// Optional attempts never count toward overall failure and log at
    /// debug on error
    pub optional: bool,
}

/// Build the default cascade: quote and trade are required, depth is best
/// effort.
fn default_cascade(settings: &SubscriptionSettings) -> Vec<StreamAttempt> {
    vec![
        StreamAttempt {
            kind: StreamKind::Quote,
            timeout: settings.stream_timeout(),
            optional: false,
        },
        StreamAttempt {
            kind: StreamKind::Trade,
            timeout: settings.stream_timeout(),
            optional: false,
        },
        StreamAttempt {
            kind: StreamKind::Depth,
            timeout: settings.depth_timeout(),
            optional: true,
        },
    ]
}

/// Coordinates per-instrument subscriptions against the gateway.
pub struct SubscriptionCoordinator {
    transport: Arc<dyn GatewayTransport>,
    connection: ConnectionManager,
    cascade: Vec<StreamAttempt>,
    fallback_timeout: Duration,
    subscriptions: RwLock<HashMap<String, Subscription>>,
}

impl SubscriptionCoordinator {
    pub fn new(
        transport: Arc<dyn GatewayTransport>,
        connection: ConnectionManager,
        settings: &SubscriptionSettings,
    ) -> Self {
        Self {
            transport,
            connection,
            cascade: default_cascade(settings),
            fallback_timeout: settings.stream_timeout(),
            subscriptions: RwLock::new(HashMap::new()),
        }
    }

    /// Replace the attempt cascade, for gateways with different stream
    /// support.
    pub fn with_cascade(mut self, cascade: Vec<StreamAttempt>) -> Self {
        self.cascade = cascade;
        self
    }

    /// Subscribe an instrument.
    ///
    /// Idempotent: an already-subscribed instrument returns its existing
    /// [`Subscription`] without touching the gateway. Requires the
    /// connection to be in the Connected state; requests are never queued.
    pub async fn subscribe(&self, instrument_id: &str) -> SubscriptionResult<Subscription> {
        if let Some(existing) = self.subscriptions.read().get(instrument_id) {
            debug!("{} already subscribed, returning existing", instrument_id);
            return Ok(existing.clone());
        }

        let state = self.connection.state();
        if !state.is_ready() {
            return Err(SubscriptionError::NotConnected { state });
        }

        let mut subscription = Subscription::new(instrument_id);
        let mut failed: Vec<StreamKind> = Vec::new();

        for attempt in &self.cascade {
            subscription.set_state(attempt.kind, StreamState::Subscribing);

            match timeout(
                attempt.timeout,
                self.transport.subscribe(instrument_id, attempt.kind),
            )
            .await
            {
                Ok(Ok(())) => {
                    debug!("{} {} stream subscribed", instrument_id, attempt.kind);
                    subscription.set_state(attempt.kind, StreamState::Subscribed);
                }
                Ok(Err(e)) => {
                    subscription.set_state(attempt.kind, StreamState::Unsupported);
                    if attempt.optional {
                        debug!(
                            "{} {} stream unavailable (optional): {}",
                            instrument_id, attempt.kind, e
                        );
                    } else {
                        warn!("{} {} stream failed: {}", instrument_id, attempt.kind, e);
                        failed.push(attempt.kind);
                    }
                }
                Err(_) => {
                    subscription.set_state(attempt.kind, StreamState::Unsupported);
                    if attempt.optional {
                        debug!(
                            "{} {} stream timed out after {:?} (optional)",
                            instrument_id, attempt.kind, attempt.timeout
                        );
                    } else {
                        warn!(
                            "{} {} stream timed out after {:?}",
                            instrument_id, attempt.kind, attempt.timeout
                        );
                        failed.push(attempt.kind);
                    }
                }
            }
        }

        if subscription.subscribed_kinds().is_empty() {
            // Nothing stream-level worked; fall back to one coarse
            // whole-instrument subscription.
            match timeout(
                self.fallback_timeout,
                self.transport.subscribe_instrument(instrument_id),
            )
            .await
            {
                Ok(Ok(())) => {
                    info!("{} subscribed via whole-instrument fallback", instrument_id);
                    subscription.fallback_active = true;
                }
                Ok(Err(e)) => {
                    warn!("{} whole-instrument fallback failed: {}", instrument_id, e);
                    return Err(SubscriptionError::AllStreamsFailed {
                        instrument: instrument_id.to_string(),
                        failed,
                    });
                }
                Err(_) => {
                    warn!(
                        "{} whole-instrument fallback timed out after {:?}",
                        instrument_id, self.fallback_timeout
                    );
                    return Err(SubscriptionError::AllStreamsFailed {
                        instrument: instrument_id.to_string(),
                        failed,
                    });
                }
            }
        }

        info!(
            "{} subscribed (streams: {:?}, fallback: {})",
            instrument_id,
            subscription.subscribed_kinds(),
            subscription.fallback_active
        );

        self.subscriptions
            .write()
            .insert(instrument_id.to_string(), subscription.clone());

        Ok(subscription)
    }

    /// Unsubscribe an instrument.
    ///
    /// Best effort: each stream kind is released independently and upstream
    /// failures are logged, never returned, because the caller cannot
    /// usefully react and the connection manager may already be tearing
    /// down. The local record is always removed.
    pub async fn unsubscribe(&self, instrument_id: &str) {
        let subscription = match self.subscriptions.write().remove(instrument_id) {
            Some(s) => s,
            None => {
                debug!("{} was not subscribed, nothing to do", instrument_id);
                return;
            }
        };

        if !self.connection.state().is_ready() {
            debug!(
                "{} unsubscribe: connection not ready, skipping upstream calls",
                instrument_id
            );
            return;
        }

        for kind in subscription.subscribed_kinds() {
            match timeout(
                self.fallback_timeout,
                self.transport.unsubscribe(instrument_id, kind),
            )
            .await
            {
                Ok(Ok(())) => debug!("{} {} stream unsubscribed", instrument_id, kind),
                Ok(Err(e)) => warn!("{} {} unsubscribe failed: {}", instrument_id, kind, e),
                Err(_) => warn!("{} {} unsubscribe timed out", instrument_id, kind),
            }
        }

        if subscription.fallback_active {
            match timeout(
                self.fallback_timeout,
                self.transport.unsubscribe_instrument(instrument_id),
            )
            .await
            {
                Ok(Ok(())) => debug!("{} whole-instrument unsubscribed", instrument_id),
                Ok(Err(e)) => warn!(
                    "{} whole-instrument unsubscribe failed: {}",
                    instrument_id, e
                ),
                Err(_) => warn!("{} whole-instrument unsubscribe timed out", instrument_id),
            }
        }

        info!("{} unsubscribed", instrument_id);
    }

    /// Current subscription record for an instrument.
    pub fn subscription(&self, instrument_id: &str) -> Option<Subscription> {
        self.subscriptions.read().get(instrument_id).cloned()
    }

    /// Instruments currently subscribed. Callers use this to re-subscribe
    /// after the connection manager reports a reconnect.
    pub fn active_instruments(&self) -> Vec<String> {
        self.subscriptions.read().keys().cloned().collect()
    }

    /// Drop all local subscription records. Called on connection teardown;
    /// the gateway forgets server-side subscriptions with the socket.
    pub fn clear(&self) {
        let mut subscriptions = self.subscriptions.write();
        if !subscriptions.is_empty() {
            info!(
                "Clearing {} subscription(s) on connection teardown",
                subscriptions.len()
            );
            subscriptions.clear();
        }
    }

    /// Number of active subscriptions.
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.read().len()
    }
}
