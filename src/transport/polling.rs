//! HTTP long-polling transport.
//!
//! Reads are long-lived `GET` requests returning a batch of frames; writes
//! are `POST` requests carrying a batch. Both run on a worker task owned by
//! the transport handle.
//!
//! # Pausing
//!
//! ```text
//! pause() ──► Pausing ──(poll done && write done)──► Paused ──► TransportEvent::Paused
//! ```
//!
//! A paused transport issues no further requests until `resume()`.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::actor::join_opt;
use crate::error::{Error, Result};
use crate::identifiers::SessionId;
use crate::protocol::{
    Data, SessionPacket, SessionPacketKind, decode_payload, encode_packet, encode_payload,
};

use super::{
    Timestamp, Transport, TransportEvent, TransportEventSender, TransportKind, TransportOptions,
};

// ============================================================================
// Constants
// ============================================================================

/// Content type of binary batches.
const BINARY_CONTENT_TYPE: &str = "application/octet-stream";

/// Content type of text batches.
const TEXT_CONTENT_TYPE: &str = "text/plain;charset=UTF-8";

// ============================================================================
// HttpClient
// ============================================================================

/// Minimal async HTTP client used by the polling transport.
#[async_trait]
pub trait HttpClient: Send + Sync {
    /// Issues a `GET` request.
    async fn get(&self, url: &str, headers: &[(String, String)]) -> Result<HttpResponse>;

    /// Issues a `POST` request.
    async fn post(
        &self,
        url: &str,
        headers: &[(String, String)],
        body: Vec<u8>,
    ) -> Result<HttpResponse>;
}

/// A minimal HTTP response.
#[derive(Debug, Clone, Default)]
pub struct HttpResponse {
    /// HTTP status code.
    pub status: u16,
    /// Response body.
    pub body: Vec<u8>,
    /// Response headers with lowercase names.
    pub headers: Vec<(String, String)>,
}

impl HttpResponse {
    /// Creates a `200` response with a text body.
    #[must_use]
    pub fn text(body: impl Into<String>) -> Self {
        Self {
            status: 200,
            body: body.into().into_bytes(),
            headers: vec![("content-type".to_string(), TEXT_CONTENT_TYPE.to_string())],
        }
    }

    /// Creates a `200` response with a binary body.
    #[must_use]
    pub fn binary(body: Vec<u8>) -> Self {
        Self {
            status: 200,
            body,
            headers: vec![("content-type".to_string(), BINARY_CONTENT_TYPE.to_string())],
        }
    }

    /// Looks up a header by name (case-insensitive).
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        let lower = name.to_lowercase();
        self.headers
            .iter()
            .find(|(k, _)| k == &lower)
            .map(|(_, v)| v.as_str())
    }

    /// Returns `true` for a `2xx` status.
    #[inline]
    #[must_use]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Interprets the body as a batch.
    fn into_data(self) -> Result<Data> {
        let binary = self
            .header("content-type")
            .is_some_and(|ct| ct.starts_with(BINARY_CONTENT_TYPE));
        if binary {
            Ok(Data::Binary(self.body))
        } else {
            String::from_utf8(self.body)
                .map(Data::Text)
                .map_err(|e| Error::protocol_decode(format!("invalid utf-8 payload: {e}")))
        }
    }
}

// ============================================================================
// ReqwestHttpClient
// ============================================================================

/// A reqwest-backed [`HttpClient`].
#[derive(Debug, Clone, Default)]
pub struct ReqwestHttpClient {
    inner: reqwest::Client,
}

impl ReqwestHttpClient {
    /// Creates a client with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: reqwest::Client::new(),
        }
    }

    /// Creates a client with a per-request timeout.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Http`] if the client cannot be built.
    pub fn with_timeout(timeout: Duration) -> Result<Self> {
        Ok(Self {
            inner: reqwest::Client::builder()
                .use_rustls_tls()
                .timeout(timeout)
                .build()?,
        })
    }

    async fn execute(&self, builder: reqwest::RequestBuilder) -> Result<HttpResponse> {
        let response = builder.send().await?;
        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_lowercase(), v.to_string()))
            })
            .collect();
        let body = response.bytes().await?.to_vec();

        Ok(HttpResponse {
            status,
            body,
            headers,
        })
    }
}

#[async_trait]
impl HttpClient for ReqwestHttpClient {
    async fn get(&self, url: &str, headers: &[(String, String)]) -> Result<HttpResponse> {
        let mut builder = self.inner.get(url);
        for (name, value) in headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        self.execute(builder).await
    }

    async fn post(
        &self,
        url: &str,
        headers: &[(String, String)],
        body: Vec<u8>,
    ) -> Result<HttpResponse> {
        let mut builder = self.inner.post(url);
        for (name, value) in headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        self.execute(builder.body(body)).await
    }
}

// ============================================================================
// Types
// ============================================================================

/// Commands for the polling worker.
#[derive(Debug)]
enum PollCommand {
    Send(Vec<SessionPacket>),
    Pause,
    Resume,
    SetSessionId(SessionId),
    Close,
}

/// Flags shared between the handle and the worker.
#[derive(Debug, Default)]
struct PollState {
    open: AtomicBool,
    writable: AtomicBool,
    closed: AtomicBool,
}

/// Worker lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PollReady {
    Opening,
    Open,
    Pausing,
    Paused,
}

/// The `sid` field of a handshake frame.
#[derive(Deserialize)]
struct HandshakeSid {
    sid: SessionId,
}

// ============================================================================
// PollingTransport
// ============================================================================

/// HTTP long-polling transport.
pub struct PollingTransport {
    options: TransportOptions,
    http: Arc<dyn HttpClient>,
    events: TransportEventSender,
    supports_binary: bool,
    state: Arc<PollState>,
    command_tx: Option<mpsc::UnboundedSender<PollCommand>>,
}

impl PollingTransport {
    /// Creates an unopened transport.
    #[must_use]
    pub fn new(
        options: TransportOptions,
        http: Arc<dyn HttpClient>,
        events: TransportEventSender,
    ) -> Self {
        let supports_binary = !options.force_base64;
        Self {
            options,
            http,
            events,
            supports_binary,
            state: Arc::new(PollState::default()),
            command_tx: None,
        }
    }

    fn command(&self, command: PollCommand) {
        if let Some(command_tx) = &self.command_tx {
            let _ = command_tx.send(command);
        }
    }
}

impl Transport for PollingTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Polling
    }

    fn supports_binary(&self) -> bool {
        self.supports_binary
    }

    fn supports_pause(&self) -> bool {
        true
    }

    fn is_writable(&self) -> bool {
        self.state.writable.load(Ordering::Acquire)
    }

    fn open(&mut self) {
        if self.command_tx.is_some() {
            return;
        }

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        self.command_tx = Some(command_tx);

        let worker = PollingWorker {
            options: self.options.clone(),
            http: Arc::clone(&self.http),
            events: self.events.clone(),
            state: Arc::clone(&self.state),
            supports_binary: self.supports_binary,
            timestamp: Timestamp::new(),
            ready: PollReady::Opening,
            poll: None,
            write: None,
        };
        tokio::spawn(worker.run(command_rx));
    }

    fn send(&mut self, packets: Vec<SessionPacket>) -> Result<()> {
        if !self.state.open.load(Ordering::Acquire) || self.state.closed.load(Ordering::Acquire)
        {
            return Err(Error::transport("transport not open"));
        }

        self.state.writable.store(false, Ordering::Release);
        self.command_tx
            .as_ref()
            .ok_or_else(|| Error::transport("transport not open"))?
            .send(PollCommand::Send(packets))
            .map_err(|_| Error::ConnectionClosed)
    }

    fn pause(&mut self) {
        self.command(PollCommand::Pause);
    }

    fn resume(&mut self) {
        self.command(PollCommand::Resume);
    }

    fn set_session_id(&mut self, sid: &SessionId) {
        self.options.set_query("sid", sid.as_str());
        self.command(PollCommand::SetSessionId(sid.clone()));
    }

    fn close(&mut self) {
        if self.state.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.state.writable.store(false, Ordering::Release);
        self.command(PollCommand::Close);
        let _ = self.events.send(TransportEvent::Close);
    }
}

// ============================================================================
// PollingWorker
// ============================================================================

/// Request loop owned by one polling transport.
struct PollingWorker {
    options: TransportOptions,
    http: Arc<dyn HttpClient>,
    events: TransportEventSender,
    state: Arc<PollState>,
    supports_binary: bool,
    timestamp: Timestamp,
    ready: PollReady,
    poll: Option<JoinHandle<Result<HttpResponse>>>,
    write: Option<JoinHandle<Result<HttpResponse>>>,
}

/// Whether the worker keeps running.
#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

impl PollingWorker {
    async fn run(mut self, mut command_rx: mpsc::UnboundedReceiver<PollCommand>) {
        self.start_poll();

        loop {
            let flow = tokio::select! {
                command = command_rx.recv() => self.on_command(command),
                result = join_opt(&mut self.poll) => {
                    let result = result.unwrap_or_else(|e| Err(Error::transport(e.to_string())));
                    self.on_poll_complete(result)
                }
                result = join_opt(&mut self.write) => {
                    let result = result.unwrap_or_else(|e| Err(Error::transport(e.to_string())));
                    self.on_write_complete(result)
                }
            };

            if flow == Flow::Stop {
                break;
            }
        }

        if let Some(poll) = self.poll.take() {
            poll.abort();
        }
        self.state.open.store(false, Ordering::Release);
        self.state.writable.store(false, Ordering::Release);
        debug!("Polling worker terminated");
    }

    fn emit(&self, event: TransportEvent) {
        if self.state.closed.load(Ordering::Acquire) {
            trace!(?event, "Dropping event after close");
            return;
        }
        let _ = self.events.send(event);
    }

    fn uri(&mut self) -> String {
        let token = self
            .options
            .timestamp_requests
            .unwrap_or(true)
            .then(|| self.timestamp.next());
        self.options
            .uri(TransportKind::Polling, self.supports_binary, token.as_deref())
    }

    fn start_poll(&mut self) {
        let uri = self.uri();
        let http = Arc::clone(&self.http);
        let headers = self.options.extra_headers.clone();
        trace!(%uri, "Polling");
        self.poll = Some(tokio::spawn(async move { http.get(&uri, &headers).await }));
    }

    fn start_write(&mut self, packets: Vec<SessionPacket>) {
        let (body, content_type) = match encode_payload(&packets, self.supports_binary) {
            Data::Text(text) => (text.into_bytes(), TEXT_CONTENT_TYPE),
            Data::Binary(bytes) => (bytes, BINARY_CONTENT_TYPE),
        };
        self.spawn_post(body, content_type);
    }

    fn spawn_post(&mut self, body: Vec<u8>, content_type: &str) {
        let uri = self.uri();
        let http = Arc::clone(&self.http);
        let mut headers = self.options.extra_headers.clone();
        headers.push(("content-type".to_string(), content_type.to_string()));
        self.write = Some(tokio::spawn(async move {
            http.post(&uri, &headers, body).await
        }));
    }

    fn on_command(&mut self, command: Option<PollCommand>) -> Flow {
        match command {
            Some(PollCommand::Send(packets)) => self.start_write(packets),
            Some(PollCommand::Pause) => {
                self.ready = PollReady::Pausing;
                self.maybe_paused();
            }
            Some(PollCommand::Resume) => {
                if matches!(self.ready, PollReady::Pausing | PollReady::Paused) {
                    self.ready = PollReady::Open;
                    if self.poll.is_none() {
                        self.start_poll();
                    }
                }
            }
            Some(PollCommand::SetSessionId(sid)) => {
                self.options.set_query("sid", sid.as_str());
            }
            Some(PollCommand::Close) => {
                self.send_close_frame();
                return Flow::Stop;
            }
            // Handle dropped after an upgrade; the session lives on elsewhere.
            None => {
                debug!("Polling handle released");
                return Flow::Stop;
            }
        }
        Flow::Continue
    }

    /// Notifies the server, fire-and-forget.
    fn send_close_frame(&mut self) {
        if self.ready == PollReady::Opening {
            return;
        }
        let frame = SessionPacket::new(SessionPacketKind::Close);
        let body = match encode_packet(&frame, false) {
            Data::Text(text) => format!("{}:{text}", text.len()).into_bytes(),
            Data::Binary(bytes) => bytes,
        };
        let uri = self.uri();
        let http = Arc::clone(&self.http);
        let headers = self.options.extra_headers.clone();
        tokio::spawn(async move {
            if let Err(e) = http.post(&uri, &headers, body).await {
                debug!(error = %e, "Close frame not delivered");
            }
        });
    }

    fn on_poll_complete(&mut self, result: Result<HttpResponse>) -> Flow {
        let data = match result.and_then(|response| {
            if response.is_success() {
                response.into_data()
            } else {
                Err(Error::transport(format!(
                    "xhr poll error: status {}",
                    response.status
                )))
            }
        }) {
            Ok(data) => data,
            Err(e) => {
                warn!(error = %e, "Poll failed");
                self.emit(TransportEvent::Error(e));
                return Flow::Continue;
            }
        };

        for decoded in decode_payload(&data) {
            let packet = match decoded {
                Ok(packet) => packet,
                Err(e) => {
                    self.emit(TransportEvent::Error(e));
                    return Flow::Continue;
                }
            };

            if self.ready == PollReady::Opening {
                self.ready = PollReady::Open;
                self.state.open.store(true, Ordering::Release);
                self.state.writable.store(true, Ordering::Release);
                self.emit(TransportEvent::Open);
            }

            match packet.kind {
                SessionPacketKind::Close => {
                    debug!("Server closed polling session");
                    self.emit(TransportEvent::Close);
                    return Flow::Stop;
                }
                SessionPacketKind::Open => {
                    if let Some(handshake) = packet
                        .text()
                        .and_then(|text| serde_json::from_str::<HandshakeSid>(text).ok())
                    {
                        self.options.set_query("sid", handshake.sid.as_str());
                    }
                }
                _ => {}
            }

            self.emit(TransportEvent::Packet(packet));
        }

        match self.ready {
            PollReady::Open => self.start_poll(),
            PollReady::Pausing => self.maybe_paused(),
            PollReady::Opening | PollReady::Paused => {}
        }
        Flow::Continue
    }

    fn on_write_complete(&mut self, result: Result<HttpResponse>) -> Flow {
        match result {
            Ok(response) if response.is_success() => {
                self.state.writable.store(true, Ordering::Release);
                self.emit(TransportEvent::Drain);
                if self.ready == PollReady::Pausing {
                    self.maybe_paused();
                }
            }
            Ok(response) => {
                self.emit(TransportEvent::Error(Error::transport(format!(
                    "xhr post error: status {}",
                    response.status
                ))));
            }
            Err(e) => {
                warn!(error = %e, "Write failed");
                self.emit(TransportEvent::Error(e));
            }
        }
        Flow::Continue
    }

    fn maybe_paused(&mut self) {
        if self.ready == PollReady::Pausing && self.poll.is_none() && self.write.is_none() {
            self.ready = PollReady::Paused;
            debug!("Polling transport paused");
            self.emit(TransportEvent::Paused);
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
