//! WebSocket transport.
//!
//! One session frame per WebSocket message. The connection runs on a
//! spawned task that owns both halves of the stream; the handle talks to it
//! over an unbounded command channel.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::identifiers::SessionId;
use crate::protocol::{Data, SessionPacket, decode_packet, encode_packet};

use super::{
    Timestamp, Transport, TransportEvent, TransportEventSender, TransportKind, TransportOptions,
};

// ============================================================================
// Types
// ============================================================================

/// Commands for the connection task.
enum WsCommand {
    /// Write a batch of frames.
    Send(Vec<SessionPacket>),
    /// Close the socket.
    Close,
}

/// Flags shared between the handle and the connection task.
#[derive(Debug, Default)]
struct WsState {
    open: AtomicBool,
    writable: AtomicBool,
    closed: AtomicBool,
}

// ============================================================================
// WebSocketTransport
// ============================================================================

/// WebSocket transport backed by tokio-tungstenite.
pub struct WebSocketTransport {
    options: TransportOptions,
    events: TransportEventSender,
    timestamp: Timestamp,
    supports_binary: bool,
    state: Arc<WsState>,
    command_tx: Option<mpsc::UnboundedSender<WsCommand>>,
}

impl WebSocketTransport {
    /// Creates an unopened transport.
    #[must_use]
    pub fn new(options: TransportOptions, events: TransportEventSender) -> Self {
        let supports_binary = !options.force_base64;
        Self {
            options,
            events,
            timestamp: Timestamp::new(),
            supports_binary,
            state: Arc::new(WsState::default()),
            command_tx: None,
        }
    }

    /// Returns the connection URI.
    #[must_use]
    pub fn uri(&mut self) -> String {
        let token = self
            .options
            .timestamp_requests
            .unwrap_or(false)
            .then(|| self.timestamp.next());
        self.options
            .uri(TransportKind::WebSocket, self.supports_binary, token.as_deref())
    }
}

impl Transport for WebSocketTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::WebSocket
    }

    fn supports_binary(&self) -> bool {
        self.supports_binary
    }

    fn is_writable(&self) -> bool {
        self.state.writable.load(Ordering::Acquire)
    }

    fn open(&mut self) {
        if self.command_tx.is_some() {
            return;
        }

        let uri = self.uri();
        debug!(%uri, "Opening WebSocket transport");

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        self.command_tx = Some(command_tx);

        tokio::spawn(run_connection(
            uri,
            self.options.extra_headers.clone(),
            self.supports_binary,
            command_rx,
            self.events.clone(),
            Arc::clone(&self.state),
        ));
    }

    fn send(&mut self, packets: Vec<SessionPacket>) -> Result<()> {
        if !self.state.open.load(Ordering::Acquire) || self.state.closed.load(Ordering::Acquire)
        {
            return Err(Error::transport("transport not open"));
        }

        let command_tx = self
            .command_tx
            .as_ref()
            .ok_or_else(|| Error::transport("transport not open"))?;

        self.state.writable.store(false, Ordering::Release);
        command_tx
            .send(WsCommand::Send(packets))
            .map_err(|_| Error::ConnectionClosed)
    }

    fn set_session_id(&mut self, sid: &SessionId) {
        self.options.set_query("sid", sid.as_str());
    }

    fn close(&mut self) {
        if self.state.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.state.writable.store(false, Ordering::Release);

        if let Some(command_tx) = &self.command_tx {
            let _ = command_tx.send(WsCommand::Close);
        }
        let _ = self.events.send(TransportEvent::Close);
    }
}

// ============================================================================
// Connection Task
// ============================================================================

/// Emits an event unless the handle already closed the transport.
fn emit(state: &WsState, events: &TransportEventSender, event: TransportEvent) {
    if state.closed.load(Ordering::Acquire) {
        trace!(?event, "Dropping event after close");
        return;
    }
    let _ = events.send(event);
}

/// Connects and pumps frames until either side closes.
async fn run_connection(
    uri: String,
    headers: Vec<(String, String)>,
    supports_binary: bool,
    mut command_rx: mpsc::UnboundedReceiver<WsCommand>,
    events: TransportEventSender,
    state: Arc<WsState>,
) {
    let request = match build_request(&uri, &headers) {
        Ok(request) => request,
        Err(e) => {
            emit(&state, &events, TransportEvent::Error(e));
            return;
        }
    };

    let stream = match connect_async(request).await {
        Ok((stream, _response)) => stream,
        Err(e) => {
            warn!(error = %e, "WebSocket connect failed");
            emit(&state, &events, TransportEvent::Error(Error::WebSocket(e)));
            return;
        }
    };

    let (mut ws_write, mut ws_read) = stream.split();

    if state.closed.load(Ordering::Acquire) {
        let _ = ws_write.close().await;
        return;
    }

    state.open.store(true, Ordering::Release);
    state.writable.store(true, Ordering::Release);
    emit(&state, &events, TransportEvent::Open);

    loop {
        tokio::select! {
            message = ws_read.next() => {
                let data = match message {
                    Some(Ok(Message::Text(text))) => Data::Text(text.as_str().to_string()),
                    Some(Ok(Message::Binary(bytes))) => Data::Binary(bytes.to_vec()),
                    Some(Ok(Message::Close(_))) | None => {
                        debug!("WebSocket closed by remote");
                        emit(&state, &events, TransportEvent::Close);
                        break;
                    }
                    Some(Err(e)) => {
                        emit(&state, &events, TransportEvent::Error(Error::WebSocket(e)));
                        break;
                    }
                    // Ping, Pong, raw frames
                    Some(Ok(_)) => continue,
                };

                match decode_packet(&data) {
                    Ok(packet) => emit(&state, &events, TransportEvent::Packet(packet)),
                    Err(e) => emit(&state, &events, TransportEvent::Error(e)),
                }
            }

            command = command_rx.recv() => {
                match command {
                    Some(WsCommand::Send(packets)) => {
                        let count = packets.len();
                        let mut failed = None;
                        for packet in &packets {
                            let message = match encode_packet(packet, supports_binary) {
                                Data::Text(text) => Message::Text(text.into()),
                                Data::Binary(bytes) => Message::Binary(bytes.into()),
                            };
                            if let Err(e) = ws_write.send(message).await {
                                failed = Some(e);
                                break;
                            }
                        }

                        if let Some(e) = failed {
                            emit(&state, &events, TransportEvent::Error(Error::WebSocket(e)));
                            break;
                        }

                        trace!(count, "WebSocket batch written");
                        state.writable.store(true, Ordering::Release);
                        emit(&state, &events, TransportEvent::Drain);
                    }

                    Some(WsCommand::Close) | None => {
                        let _ = ws_write.close().await;
                        break;
                    }
                }
            }
        }
    }

    state.open.store(false, Ordering::Release);
    state.writable.store(false, Ordering::Release);
    debug!("WebSocket task terminated");
}

/// Builds the handshake request with extra headers.
fn build_request(
    uri: &str,
    headers: &[(String, String)],
) -> Result<tokio_tungstenite::tungstenite::handshake::client::Request> {
    let mut request = uri.into_client_request()?;
    for (name, value) in headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| Error::config(format!("invalid header name '{name}': {e}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| Error::config(format!("invalid header value: {e}")))?;
        request.headers_mut().insert(name, value);
    }
    Ok(request)
}

// ============================================================================
// Tests
// ============================================================================
