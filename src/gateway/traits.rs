//! Transport trait and event types.

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::data::types::{StreamKind, Tick};
use crate::error::TransportResult;

/// Credentials passed to [`GatewayTransport::open`], supplied by the
/// external token provider.
#[derive(Debug, Clone)]
pub struct Credentials {
    /// Session token or API key
    pub token: String,
    /// Optional account identifier, for gateways that scope streams
    pub account: Option<String>,
}

impl Credentials {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            account: None,
        }
    }

    pub fn with_account(mut self, account: impl Into<String>) -> Self {
        self.account = Some(account.into());
        self
    }
}

/// Inbound events from the gateway transport.
///
/// Delivered serially per connection; any event counts as connection
/// activity for liveness accounting.
#[derive(Debug, Clone)]
pub enum GatewayEvent {
    /// A price update for a subscribed instrument
    Tick(Tick),
    /// Reply to a liveness probe
    ProbeAck,
    /// The transport lost its connection
    Disconnected { reason: String },
}

/// A streaming connection to the broker's market-data gateway.
///
/// Implementations own the socket lifecycle for a single connection epoch:
/// `open` establishes it, `close` tears it down, and inbound traffic is
/// fanned out through the broadcast channel returned by `events`.
/// Reconnection policy is the connection manager's job, not the
/// transport's.
#[async_trait]
pub trait GatewayTransport: Send + Sync {
    /// Establish the connection and authenticate.
    async fn open(&self, credentials: &Credentials) -> TransportResult<()>;

    /// Close the connection and release resources.
    async fn close(&self) -> TransportResult<()>;

    /// Send a liveness probe. The reply arrives as
    /// [`GatewayEvent::ProbeAck`] on the event stream.
    async fn probe(&self) -> TransportResult<()>;

    /// Request one data stream kind for an instrument.
    async fn subscribe(&self, instrument_id: &str, kind: StreamKind) -> TransportResult<()>;

    /// Coarse whole-instrument subscription, used as a fallback when no
    /// individual stream kind succeeds.
    async fn subscribe_instrument(&self, instrument_id: &str) -> TransportResult<()>;

    /// Stop one data stream kind for an instrument.
    async fn unsubscribe(&self, instrument_id: &str, kind: StreamKind) -> TransportResult<()>;

    /// Stop a coarse whole-instrument subscription.
    async fn unsubscribe_instrument(&self, instrument_id: &str) -> TransportResult<()>;

    /// Subscribe to the inbound event stream. Every caller gets an
    /// independent receiver.
    fn events(&self) -> broadcast::Receiver<GatewayEvent>;

    /// True while the underlying connection is up.
    fn is_open(&self) -> bool;
}
