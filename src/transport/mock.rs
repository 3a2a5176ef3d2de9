//! In-memory transports for engine and manager tests.
//!
//! [`MockFactory`] hands every created transport's [`MockHandle`] to the
//! test, which plays the server side: it injects events and inspects what
//! the engine sent.

use std::sync::{Arc, OnceLock};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::Mutex;
use rustc_hash::FxHashSet;
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::identifiers::SessionId;
use crate::protocol::{SessionPacket, SessionPacketKind};

use super::{
    Transport, TransportEvent, TransportEventSender, TransportFactory, TransportKind,
    TransportOptions,
};

// ============================================================================
// Logging
// ============================================================================

/// Routes crate logs to the test writer, filtered by `RUST_LOG`.
pub(crate) fn init_tracing() {
    static ONCE: OnceLock<()> = OnceLock::new();
    ONCE.get_or_init(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    });
}

// ============================================================================
// MockHandle
// ============================================================================

#[derive(Debug, Default)]
struct MockShared {
    sent: Mutex<Vec<SessionPacket>>,
    opened: AtomicBool,
    closed: AtomicBool,
    paused: AtomicBool,
    sid: Mutex<Option<SessionId>>,
}

/// Test-side view of one mock transport.
#[derive(Debug, Clone)]
pub(crate) struct MockHandle {
    pub kind: TransportKind,
    pub options: TransportOptions,
    events: TransportEventSender,
    shared: Arc<MockShared>,
}

impl MockHandle {
    /// Injects a raw event.
    pub fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }

    /// Simulates the channel opening.
    pub fn open(&self) {
        self.emit(TransportEvent::Open);
    }

    /// Delivers a frame from the server.
    pub fn receive(&self, packet: SessionPacket) {
        self.emit(TransportEvent::Packet(packet));
    }

    /// Delivers the standard handshake.
    pub fn handshake(&self, sid: &str, upgrades: &[&str], ping_interval: u64, ping_timeout: u64) {
        let upgrades = upgrades
            .iter()
            .map(|u| format!("\"{u}\""))
            .collect::<Vec<_>>()
            .join(",");
        let json = format!(
            r#"{{"sid":"{sid}","upgrades":[{upgrades}],"pingInterval":{ping_interval},"pingTimeout":{ping_timeout}}}"#
        );
        self.open();
        self.receive(SessionPacket::with_data(SessionPacketKind::Open, json));
    }

    /// Returns every frame sent so far.
    pub fn sent(&self) -> Vec<SessionPacket> {
        self.shared.sent.lock().clone()
    }

    pub fn is_opened(&self) -> bool {
        self.shared.opened.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    pub fn is_paused(&self) -> bool {
        self.shared.paused.load(Ordering::Acquire)
    }

    pub fn session_id(&self) -> Option<SessionId> {
        self.shared.sid.lock().clone()
    }
}

// ============================================================================
// MockTransport
// ============================================================================

/// Transport that records writes and drains immediately.
struct MockTransport {
    kind: TransportKind,
    events: TransportEventSender,
    shared: Arc<MockShared>,
}

impl Transport for MockTransport {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    fn supports_binary(&self) -> bool {
        true
    }

    fn supports_pause(&self) -> bool {
        self.kind == TransportKind::Polling
    }

    fn is_writable(&self) -> bool {
        !self.shared.closed.load(Ordering::Acquire) && !self.shared.paused.load(Ordering::Acquire)
    }

    fn open(&mut self) {
        self.shared.opened.store(true, Ordering::Release);
    }

    fn send(&mut self, packets: Vec<SessionPacket>) -> Result<()> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(Error::transport("transport not open"));
        }
        self.shared.sent.lock().extend(packets);
        let _ = self.events.send(TransportEvent::Drain);
        Ok(())
    }

    fn pause(&mut self) {
        self.shared.paused.store(true, Ordering::Release);
        let _ = self.events.send(TransportEvent::Paused);
    }

    fn resume(&mut self) {
        self.shared.paused.store(false, Ordering::Release);
    }

    fn set_session_id(&mut self, sid: &SessionId) {
        *self.shared.sid.lock() = Some(sid.clone());
    }

    fn close(&mut self) {
        self.shared.closed.store(true, Ordering::Release);
    }
}

// ============================================================================
// MockFactory
// ============================================================================

/// Factory producing [`MockTransport`]s.
pub(crate) struct MockFactory {
    created_tx: mpsc::UnboundedSender<MockHandle>,
    failing: Mutex<FxHashSet<TransportKind>>,
    attempts: AtomicUsize,
}

impl MockFactory {
    /// Creates a factory and the stream of created transports.
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<MockHandle>) {
        init_tracing();
        let (created_tx, created_rx) = mpsc::unbounded_channel();
        let factory = Arc::new(Self {
            created_tx,
            failing: Mutex::new(FxHashSet::default()),
            attempts: AtomicUsize::new(0),
        });
        (factory, created_rx)
    }

    /// Makes construction of `kind` fail.
    pub fn fail(&self, kind: TransportKind) {
        self.failing.lock().insert(kind);
    }

    /// Lets construction of `kind` succeed again.
    pub fn heal(&self, kind: TransportKind) {
        self.failing.lock().remove(&kind);
    }

    /// Number of `create` calls, failed ones included.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::Acquire)
    }
}

impl TransportFactory for MockFactory {
    fn create(
        &self,
        kind: TransportKind,
        options: TransportOptions,
        events: TransportEventSender,
    ) -> Result<Box<dyn Transport>> {
        self.attempts.fetch_add(1, Ordering::AcqRel);
        if self.failing.lock().contains(&kind) {
            return Err(Error::transport(format!("{kind} unavailable")));
        }

        let shared = Arc::new(MockShared::default());
        let _ = self.created_tx.send(MockHandle {
            kind,
            options,
            events: events.clone(),
            shared: Arc::clone(&shared),
        });

        Ok(Box::new(MockTransport {
            kind,
            events,
            shared,
        }))
    }
}
