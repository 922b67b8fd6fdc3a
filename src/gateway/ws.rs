//! WebSocket gateway transport.
//!
//! Handles the socket lifecycle for one connection epoch: connect,
//! authenticate, decode inbound frames into [`GatewayEvent`]s, answer
//! ping/pong. Reconnection is driven by the connection manager.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use rust_decimal::Decimal;
use serde::Deserialize;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, Mutex};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use super::traits::{Credentials, GatewayEvent, GatewayTransport};
use crate::data::types::{StreamKind, Tick};
use crate::error::{TransportError, TransportResult};

/// Type alias for the WebSocket connection.
pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

type WsSink = SplitSink<WsStream, Message>;

const EVENT_CHANNEL_CAPACITY: usize = 4_096;

/// WebSocket implementation of [`GatewayTransport`].
pub struct WsTransport {
    ws_url: String,
    events_tx: broadcast::Sender<GatewayEvent>,
    write: Arc<Mutex<Option<WsSink>>>,
    connected: Arc<AtomicBool>,
    shutdown_tx: broadcast::Sender<()>,
}

impl WsTransport {
    pub fn new(ws_url: impl Into<String>) -> Self {
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (shutdown_tx, _) = broadcast::channel(4);
        Self {
            ws_url: ws_url.into(),
            events_tx,
            write: Arc::new(Mutex::new(None)),
            connected: Arc::new(AtomicBool::new(false)),
            shutdown_tx,
        }
    }

    /// Send a JSON command frame over the socket.
    async fn send_command(&self, payload: serde_json::Value) -> TransportResult<()> {
        let mut guard = self.write.lock().await;
        let sink = guard
            .as_mut()
            .ok_or_else(|| TransportError::Closed("socket not open".to_string()))?;

        sink.send(Message::Text(payload.to_string()))
            .await
            .map_err(|e| TransportError::Send(e.to_string()))
    }

    /// Read-side pump: decodes inbound frames and fans them out until the
    /// socket drops or shutdown is signaled.
    async fn run_reader(
        mut read: SplitStream<WsStream>,
        events_tx: broadcast::Sender<GatewayEvent>,
        write: Arc<Mutex<Option<WsSink>>>,
        connected: Arc<AtomicBool>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) {
        let disconnect_reason: String;

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    debug!("Gateway reader shutting down");
                    connected.store(false, Ordering::SeqCst);
                    return;
                }
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            if let Some(event) = parse_frame(&text) {
                                let _ = events_tx.send(event);
                            }
                        }
                        Some(Ok(Message::Binary(data))) => {
                            // Some gateway builds send JSON as binary frames
                            if let Ok(text) = String::from_utf8(data) {
                                if let Some(event) = parse_frame(&text) {
                                    let _ = events_tx.send(event);
                                }
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            debug!("Received ping, sending pong");
                            if let Some(sink) = write.lock().await.as_mut() {
                                if let Err(e) = sink.send(Message::Pong(data)).await {
                                    warn!("Failed to send pong: {}", e);
                                }
                            }
                        }
                        Some(Ok(Message::Pong(_))) => {
                            let _ = events_tx.send(GatewayEvent::ProbeAck);
                        }
                        Some(Ok(Message::Close(frame))) => {
                            info!("Gateway closed the connection: {:?}", frame);
                            disconnect_reason = "closed by gateway".to_string();
                            break;
                        }
                        Some(Ok(Message::Frame(_))) => {
                            // Raw frame, ignore
                        }
                        Some(Err(e)) => {
                            warn!("Gateway socket error: {}", e);
                            disconnect_reason = e.to_string();
                            break;
                        }
                        None => {
                            info!("Gateway stream ended");
                            disconnect_reason = "stream ended".to_string();
                            break;
                        }
                    }
                }
            }
        }

        connected.store(false, Ordering::SeqCst);
        *write.lock().await = None;
        let _ = events_tx.send(GatewayEvent::Disconnected {
            reason: disconnect_reason,
        });
    }
}

#[async_trait]
impl GatewayTransport for WsTransport {
    async fn open(&self, credentials: &Credentials) -> TransportResult<()> {
        url::Url::parse(&self.ws_url)
            .map_err(|e| TransportError::Endpoint(format!("{}: {}", self.ws_url, e)))?;

        debug!("Connecting to gateway: {}", self.ws_url);
        let (ws_stream, _response) = connect_async(&self.ws_url)
            .await
            .map_err(|e| TransportError::Connection(e.to_string()))?;

        let (mut sink, read) = ws_stream.split();

        let mut auth = serde_json::json!({ "op": "auth", "token": credentials.token });
        if let Some(account) = &credentials.account {
            auth["account"] = serde_json::Value::String(account.clone());
        }
        sink.send(Message::Text(auth.to_string()))
            .await
            .map_err(|e| TransportError::Authentication(e.to_string()))?;

        *self.write.lock().await = Some(sink);
        self.connected.store(true, Ordering::SeqCst);
        info!("Gateway connected: {}", self.ws_url);

        tokio::spawn(Self::run_reader(
            read,
            self.events_tx.clone(),
            Arc::clone(&self.write),
            Arc::clone(&self.connected),
            self.shutdown_tx.subscribe(),
        ));

        Ok(())
    }

    async fn close(&self) -> TransportResult<()> {
        let _ = self.shutdown_tx.send(());
        if let Some(mut sink) = self.write.lock().await.take() {
            let _ = sink.close().await;
        }
        self.connected.store(false, Ordering::SeqCst);
        info!("Gateway connection closed");
        Ok(())
    }

    async fn probe(&self) -> TransportResult<()> {
        let mut guard = self.write.lock().await;
        let sink = guard
            .as_mut()
            .ok_or_else(|| TransportError::Closed("socket not open".to_string()))?;
        sink.send(Message::Ping(Vec::new()))
            .await
            .map_err(|e| TransportError::Send(e.to_string()))
    }

    async fn subscribe(&self, instrument_id: &str, kind: StreamKind) -> TransportResult<()> {
        self.send_command(command_payload(
            "subscribe",
            instrument_id,
            Some(kind.channel_name()),
        ))
        .await
    }

    async fn subscribe_instrument(&self, instrument_id: &str) -> TransportResult<()> {
        self.send_command(command_payload("subscribe", instrument_id, None))
            .await
    }

    async fn unsubscribe(&self, instrument_id: &str, kind: StreamKind) -> TransportResult<()> {
        self.send_command(command_payload(
            "unsubscribe",
            instrument_id,
            Some(kind.channel_name()),
        ))
        .await
    }

    async fn unsubscribe_instrument(&self, instrument_id: &str) -> TransportResult<()> {
        self.send_command(command_payload("unsubscribe", instrument_id, None))
            .await
    }

    fn events(&self) -> broadcast::Receiver<GatewayEvent> {
        self.events_tx.subscribe()
    }

    fn is_open(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

/// Build a subscribe/unsubscribe command frame. A missing channel means the
/// coarse whole-instrument form.
fn command_payload(op: &str, instrument_id: &str, channel: Option<&str>) -> serde_json::Value {
    match channel {
        Some(channel) => serde_json::json!({
            "op": op,
            "instrument": instrument_id,
            "channel": channel,
        }),
        None => serde_json::json!({
            "op": op,
            "instrument": instrument_id,
        }),
    }
}

/// Inbound frame shapes the gateway sends.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WsFrame {
    Tick(TickFrame),
    Pong,
}

#[derive(Debug, Deserialize)]
struct TickFrame {
    instrument: String,
    /// Event time in epoch milliseconds
    ts: i64,
    #[serde(default)]
    last: Option<Decimal>,
    #[serde(default)]
    bid: Option<Decimal>,
    #[serde(default)]
    ask: Option<Decimal>,
    #[serde(default)]
    size: Option<Decimal>,
}

/// Decode one text frame. Unknown or malformed frames are dropped with a
/// debug log; a single bad frame must not take down the reader.
fn parse_frame(text: &str) -> Option<GatewayEvent> {
    match serde_json::from_str::<WsFrame>(text) {
        Ok(WsFrame::Tick(frame)) => {
            let timestamp = Utc.timestamp_millis_opt(frame.ts).single()?;
            Some(GatewayEvent::Tick(Tick {
                instrument_id: frame.instrument,
                timestamp,
                last: frame.last,
                bid: frame.bid,
                ask: frame.ask,
                size_hint: frame.size,
            }))
        }
        Ok(WsFrame::Pong) => Some(GatewayEvent::ProbeAck),
        Err(e) => {
            debug!("Dropping unparseable gateway frame: {}", e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_parse_trade_tick_frame() {
        let event = parse_frame(
            r#"{"type":"tick","instrument":"ESZ5","ts":60000,"last":"4500.25","size":"2"}"#,
        )
        .unwrap();

        match event {
            GatewayEvent::Tick(tick) => {
                assert_eq!(tick.instrument_id, "ESZ5");
                assert_eq!(tick.timestamp.timestamp_millis(), 60_000);
                assert_eq!(tick.last, Some(dec!(4500.25)));
                assert_eq!(tick.size_hint, Some(dec!(2)));
                assert!(tick.bid.is_none());
            }
            other => panic!("expected tick, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_quote_tick_frame() {
        let event = parse_frame(
            r#"{"type":"tick","instrument":"ESZ5","ts":60000,"bid":"4500.00","ask":"4500.50"}"#,
        )
        .unwrap();

        match event {
            GatewayEvent::Tick(tick) => {
                assert_eq!(tick.effective_price(), Some(dec!(4500.25)));
            }
            other => panic!("expected tick, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_pong_frame() {
        let event = parse_frame(r#"{"type":"pong"}"#).unwrap();
        assert!(matches!(event, GatewayEvent::ProbeAck));
    }

    #[test]
    fn test_parse_malformed_frame_dropped() {
        assert!(parse_frame("not json").is_none());
        assert!(parse_frame(r#"{"type":"unknown"}"#).is_none());
        assert!(parse_frame(r#"{"type":"tick","instrument":"ESZ5"}"#).is_none());
    }

    #[test]
    fn test_command_payload_with_channel() {
        let payload = command_payload("subscribe", "ESZ5", Some("quote"));
        assert_eq!(payload["op"], "subscribe");
        assert_eq!(payload["instrument"], "ESZ5");
        assert_eq!(payload["channel"], "quote");
    }

    #[test]
    fn test_command_payload_whole_instrument() {
        let payload = command_payload("unsubscribe", "ESZ5", None);
        assert_eq!(payload["op"], "unsubscribe");
        assert!(payload.get("channel").is_none());
    }
}
