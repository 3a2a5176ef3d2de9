//! Engine actor.
//!
//! One spawned task owns the active transport, the probe transport, the
//! write buffer and both heartbeat deadlines. Every state change happens
//! inside [`EngineActor::run`]; handles only enqueue commands.

// ============================================================================
// Imports
// ============================================================================

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::actor::{recv_opt, sleep_until_opt};
use crate::error::{Error, Result};
use crate::identifiers::SessionId;
use crate::protocol::session::PROBE;
use crate::protocol::{Data, SessionPacket, SessionPacketKind};
use crate::transport::{
    Transport, TransportEvent, TransportEventReceiver, TransportFactory, TransportKind,
    TransportMemory,
};

use super::{EngineCommand, EngineEvent, EngineOptions, EngineStatus, Handshake, ReadyState};

// ============================================================================
// Types
// ============================================================================

/// A transport together with its event stream.
struct Channel {
    transport: Box<dyn Transport>,
    events: TransportEventReceiver,
}

impl Channel {
    fn kind(&self) -> TransportKind {
        self.transport.kind()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProbePhase {
    /// Waiting for the candidate to open.
    Opening,
    /// `ping "probe"` sent.
    AwaitingPong,
    /// Active transport asked to pause.
    Pausing,
}

/// Candidate transport under test.
struct Probe {
    channel: Channel,
    phase: ProbePhase,
}

/// What a pending `close()` waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CloseWait {
    None,
    Drain,
    Upgrade,
}

// ============================================================================
// EngineActor
// ============================================================================

pub(crate) struct EngineActor {
    options: EngineOptions,
    factory: Arc<dyn TransportFactory>,
    memory: TransportMemory,
    status: Arc<RwLock<EngineStatus>>,
    events: mpsc::UnboundedSender<EngineEvent>,

    ready_state: ReadyState,
    id: Option<SessionId>,
    active: Option<Channel>,

    write_buffer: Vec<SessionPacket>,
    /// Frames handed to the transport and not yet drained.
    prev_buffer_len: usize,

    upgrades: VecDeque<TransportKind>,
    probe: Option<Probe>,
    upgrading: bool,

    /// `(ping_interval, ping_timeout)` from the handshake.
    heartbeat: Option<(Duration, Duration)>,
    ping_at: Option<Instant>,
    timeout_at: Option<Instant>,

    close_wait: CloseWait,
}

impl EngineActor {
    pub(crate) fn new(
        options: EngineOptions,
        factory: Arc<dyn TransportFactory>,
        memory: TransportMemory,
        status: Arc<RwLock<EngineStatus>>,
        events: mpsc::UnboundedSender<EngineEvent>,
    ) -> Self {
        Self {
            options,
            factory,
            memory,
            status,
            events,
            ready_state: ReadyState::Opening,
            id: None,
            active: None,
            write_buffer: Vec::new(),
            prev_buffer_len: 0,
            upgrades: VecDeque::new(),
            probe: None,
            upgrading: false,
            heartbeat: None,
            ping_at: None,
            timeout_at: None,
            close_wait: CloseWait::None,
        }
    }

    /// Runs until the session is closed.
    pub(crate) async fn run(mut self, mut command_rx: mpsc::UnboundedReceiver<EngineCommand>) {
        self.open_initial();
        self.publish();

        let mut commands_open = true;

        while self.ready_state != ReadyState::Closed {
            tokio::select! {
                command = command_rx.recv(), if commands_open => {
                    match command {
                        Some(EngineCommand::Send(packets)) => self.send_packets(packets),
                        Some(EngineCommand::Close) => self.close(),
                        None => {
                            debug!("All engine handles dropped");
                            commands_open = false;
                            self.close();
                        }
                    }
                }

                event = recv_opt(self.active.as_mut().map(|c| &mut c.events)) => {
                    self.on_transport_event(event);
                }

                event = recv_opt(self.probe.as_mut().map(|p| &mut p.channel.events)) => {
                    self.on_probe_event(event);
                }

                () = sleep_until_opt(self.ping_at) => self.on_ping_interval(),

                () = sleep_until_opt(self.timeout_at) => {
                    warn!(sid = ?self.id, "Heartbeat missed");
                    self.on_close("ping timeout", None);
                }
            }

            self.publish();
        }

        debug!("Engine actor terminated");
    }

    // ========================================================================
    // Status
    // ========================================================================

    fn publish(&self) {
        let mut status = self.status.write();
        status.ready_state = self.ready_state;
        status.id.clone_from(&self.id);
        status.transport = self.active.as_ref().map(Channel::kind);
        status.upgrading = self.upgrading;
    }

    fn emit(&self, event: EngineEvent) {
        self.publish();
        let _ = self.events.send(event);
    }

    fn active_kind(&self) -> Option<TransportKind> {
        self.active.as_ref().map(Channel::kind)
    }

    // ========================================================================
    // Transport Selection
    // ========================================================================

    fn create_transport(&self, kind: TransportKind) -> Result<Channel> {
        let (tx, rx) = mpsc::unbounded_channel();
        let options = self.options.transport_options(kind, self.id.as_ref());
        let transport = self.factory.create(kind, options, tx)?;
        Ok(Channel {
            transport,
            events: rx,
        })
    }

    /// Opens the first constructible transport.
    fn open_initial(&mut self) {
        let mut candidates: VecDeque<TransportKind> =
            self.options.transports.iter().copied().collect();

        if self.options.remember_upgrade
            && self.memory.prior_websocket_success()
            && self.options.allows(TransportKind::WebSocket)
        {
            candidates.retain(|kind| *kind != TransportKind::WebSocket);
            candidates.push_front(TransportKind::WebSocket);
        }

        while let Some(kind) = candidates.pop_front() {
            match self.create_transport(kind) {
                Ok(mut channel) => {
                    debug!(transport = %kind, "Opening engine");
                    channel.transport.open();
                    self.active = Some(channel);
                    return;
                }
                Err(e) => {
                    warn!(transport = %kind, error = %e, "Transport unavailable, trying next");
                }
            }
        }

        self.on_error(Error::NoTransportsAvailable);
    }

    // ========================================================================
    // Active Transport Events
    // ========================================================================

    fn on_transport_event(&mut self, event: Option<TransportEvent>) {
        match event {
            Some(TransportEvent::Open) => trace!(transport = ?self.active_kind(), "Transport open"),
            Some(TransportEvent::Packet(packet)) => self.on_packet(packet),
            Some(TransportEvent::Drain) => self.on_drain(),
            Some(TransportEvent::Paused) => self.on_paused(),
            Some(TransportEvent::Error(e)) => self.on_error(e),
            Some(TransportEvent::Close) | None => self.on_close("transport close", None),
        }
    }

    fn on_packet(&mut self, packet: SessionPacket) {
        match self.ready_state {
            ReadyState::Opening => {
                if packet.kind == SessionPacketKind::Open {
                    self.on_handshake(&packet);
                } else {
                    self.on_error(Error::handshake(format!(
                        "expected open packet, got {}",
                        packet.kind
                    )));
                }
                return;
            }
            ReadyState::Closed => {
                trace!(kind = %packet.kind, "Packet after close ignored");
                return;
            }
            ReadyState::Open | ReadyState::Closing => {}
        }

        trace!(kind = %packet.kind, "Packet received");
        self.on_heartbeat(None);

        match packet.kind {
            SessionPacketKind::Open => debug!("Repeated handshake ignored"),
            SessionPacketKind::Close => {
                debug!("Server closed the session");
                self.on_close("transport close", None);
            }
            SessionPacketKind::Pong => {
                self.set_ping();
                self.emit(EngineEvent::Pong);
            }
            SessionPacketKind::Message => {
                let data = packet.data.unwrap_or_else(|| Data::Text(String::new()));
                self.emit(EngineEvent::Message(data));
            }
            SessionPacketKind::Ping | SessionPacketKind::Upgrade | SessionPacketKind::Noop => {}
        }
    }

    fn on_handshake(&mut self, packet: &SessionPacket) {
        let handshake = match Handshake::parse(packet.data.as_ref()) {
            Ok(handshake) => handshake,
            Err(e) => {
                self.on_error(e);
                return;
            }
        };

        info!(
            sid = %handshake.sid,
            ping_interval = handshake.ping_interval,
            ping_timeout = handshake.ping_timeout,
            upgrades = ?handshake.upgrades,
            "Handshake received"
        );

        if let Some(active) = self.active.as_mut() {
            active.transport.set_session_id(&handshake.sid);
        }
        let active_kind = self.active_kind();

        self.id = Some(handshake.sid.clone());
        self.upgrades = handshake
            .filter_upgrades(&self.options.transports)
            .into_iter()
            .filter(|kind| Some(*kind) != active_kind)
            .collect();
        self.heartbeat = Some((handshake.ping_interval(), handshake.ping_timeout()));

        self.emit(EngineEvent::Handshake(handshake));
        self.on_open();

        if self.ready_state == ReadyState::Closed {
            return;
        }
        self.set_ping();
    }

    fn on_open(&mut self) {
        self.ready_state = ReadyState::Open;
        let kind = self.active_kind();
        self.memory
            .set_prior_websocket_success(kind == Some(TransportKind::WebSocket));

        debug!(transport = ?kind, "Engine open");
        self.emit(EngineEvent::Open);
        self.flush();

        let can_pause = self
            .active
            .as_ref()
            .is_some_and(|c| c.transport.supports_pause());
        if self.ready_state == ReadyState::Open && self.options.upgrade && can_pause {
            self.start_next_probe();
        }
    }

    fn on_drain(&mut self) {
        let evicted = self.prev_buffer_len.min(self.write_buffer.len());
        self.write_buffer.drain(..evicted);
        self.prev_buffer_len = 0;

        if !self.write_buffer.is_empty() {
            self.flush();
            return;
        }

        self.emit(EngineEvent::Drain);

        if self.close_wait == CloseWait::Drain {
            if self.upgrading {
                self.close_wait = CloseWait::Upgrade;
            } else {
                self.on_close("forced close", None);
            }
        }
    }

    // ========================================================================
    // Heartbeat
    // ========================================================================

    /// Re-arms the pong deadline; `None` uses interval plus timeout.
    fn on_heartbeat(&mut self, timeout: Option<Duration>) {
        if let Some((interval, ping_timeout)) = self.heartbeat {
            self.timeout_at = Some(Instant::now() + timeout.unwrap_or(interval + ping_timeout));
        }
    }

    fn set_ping(&mut self) {
        if let Some((interval, _)) = self.heartbeat {
            self.ping_at = Some(Instant::now() + interval);
        }
    }

    fn on_ping_interval(&mut self) {
        self.ping_at = None;
        trace!("Sending ping");
        self.send_packets(vec![SessionPacket::new(SessionPacketKind::Ping)]);
        self.emit(EngineEvent::Ping);

        if let Some((_, ping_timeout)) = self.heartbeat {
            self.on_heartbeat(Some(ping_timeout));
        }
    }

    // ========================================================================
    // Writing
    // ========================================================================

    fn send_packets(&mut self, packets: Vec<SessionPacket>) {
        if matches!(self.ready_state, ReadyState::Closing | ReadyState::Closed) {
            trace!(count = packets.len(), "Engine closing, packets dropped");
            return;
        }
        self.write_buffer.extend(packets);
        self.flush();
    }

    fn flush(&mut self) {
        if !matches!(self.ready_state, ReadyState::Open | ReadyState::Closing)
            || self.upgrading
            || self.prev_buffer_len > 0
            || self.write_buffer.is_empty()
        {
            return;
        }

        let Some(active) = self.active.as_mut() else {
            return;
        };
        if !active.transport.is_writable() {
            return;
        }

        let packets = self.write_buffer.clone();
        self.prev_buffer_len = packets.len();
        trace!(count = packets.len(), "Flushing write buffer");

        if let Err(e) = active.transport.send(packets) {
            self.prev_buffer_len = 0;
            self.on_error(e);
        }
    }

    // ========================================================================
    // Upgrade Probe
    // ========================================================================

    fn start_next_probe(&mut self) {
        if self.ready_state != ReadyState::Open || self.probe.is_some() {
            return;
        }

        while let Some(kind) = self.upgrades.pop_front() {
            debug!(transport = %kind, "Probing transport");
            self.memory.set_prior_websocket_success(false);

            match self.create_transport(kind) {
                Ok(mut channel) => {
                    channel.transport.open();
                    self.probe = Some(Probe {
                        channel,
                        phase: ProbePhase::Opening,
                    });
                    return;
                }
                Err(e) => {
                    warn!(transport = %kind, error = %e, "Probe transport unavailable");
                    self.emit(EngineEvent::UpgradeError(Error::probe(
                        kind,
                        format!("probe error: {e}"),
                    )));
                }
            }
        }
    }

    fn on_probe_event(&mut self, event: Option<TransportEvent>) {
        let Some((kind, phase)) = self.probe.as_ref().map(|p| (p.channel.kind(), p.phase)) else {
            return;
        };

        match (event, phase) {
            (Some(TransportEvent::Open), ProbePhase::Opening) => self.on_probe_open(kind),
            (Some(TransportEvent::Packet(packet)), ProbePhase::AwaitingPong) => {
                self.on_probe_packet(kind, &packet);
            }
            (Some(TransportEvent::Error(e)), _) => self.fail_probe(format!("probe error: {e}")),
            (Some(TransportEvent::Close) | None, _) => self.fail_probe("transport closed"),
            (Some(event), _) => trace!(transport = %kind, ?event, "Probe event ignored"),
        }
    }

    fn on_probe_open(&mut self, kind: TransportKind) {
        let probe_binary = self
            .probe
            .as_ref()
            .is_some_and(|p| p.channel.transport.supports_binary());
        let active_binary = self
            .active
            .as_ref()
            .is_some_and(|c| c.transport.supports_binary());

        if self.options.only_binary_upgrades && !probe_binary && active_binary {
            self.fail_probe("probe error: binary not supported");
            return;
        }

        debug!(transport = %kind, "Probe open, sending ping");
        let sent = match self.probe.as_mut() {
            Some(probe) => {
                probe.phase = ProbePhase::AwaitingPong;
                probe
                    .channel
                    .transport
                    .send(vec![SessionPacket::with_data(SessionPacketKind::Ping, PROBE)])
            }
            None => return,
        };

        if let Err(e) = sent {
            self.fail_probe(format!("probe error: {e}"));
        }
    }

    fn on_probe_packet(&mut self, kind: TransportKind, packet: &SessionPacket) {
        if !packet.is_probe(SessionPacketKind::Pong) {
            debug!(transport = %kind, packet = ?packet.kind, "Unexpected probe reply");
            self.fail_probe("probe error");
            return;
        }

        debug!(transport = %kind, "Probe answered, pausing current transport");
        if let Some(probe) = self.probe.as_mut() {
            probe.phase = ProbePhase::Pausing;
        }
        self.upgrading = true;
        self.emit(EngineEvent::Upgrading(kind));
        self.memory
            .set_prior_websocket_success(kind == TransportKind::WebSocket);

        if let Some(active) = self.active.as_mut() {
            active.transport.pause();
        }
    }

    /// Swaps in the probe once the active transport is idle.
    fn on_paused(&mut self) {
        let pausing = self
            .probe
            .as_ref()
            .is_some_and(|p| p.phase == ProbePhase::Pausing);
        if !pausing {
            trace!("Pause notification ignored");
            return;
        }

        let Some(probe) = self.probe.take() else {
            return;
        };
        let kind = probe.channel.kind();

        // The old transport is released, not closed: closing it would end
        // the session on the server.
        let previous = self.active.replace(probe.channel);
        drop(previous);

        info!(sid = ?self.id, transport = %kind, "Transport upgraded");

        let sent = match self.active.as_mut() {
            Some(active) => active
                .transport
                .send(vec![SessionPacket::new(SessionPacketKind::Upgrade)]),
            None => Ok(()),
        };
        self.upgrading = false;
        if let Err(e) = sent {
            self.on_error(e);
            return;
        }

        self.upgrades.clear();
        self.emit(EngineEvent::Upgrade(kind));

        if self.close_wait == CloseWait::Upgrade {
            self.on_close("forced close", None);
            return;
        }
        self.flush();
    }

    fn fail_probe(&mut self, message: impl Into<String>) {
        let Some(mut probe) = self.probe.take() else {
            return;
        };
        let kind = probe.channel.kind();
        probe.channel.transport.close();

        if probe.phase == ProbePhase::Pausing
            && let Some(active) = self.active.as_mut()
        {
            active.transport.resume();
        }

        let was_upgrading = std::mem::replace(&mut self.upgrading, false);
        if kind == TransportKind::WebSocket {
            self.memory.set_prior_websocket_success(false);
        }

        let error = Error::probe(kind, message);
        debug!(transport = %kind, error = %error, "Upgrade probe failed");
        self.emit(EngineEvent::UpgradeError(error));

        if self.close_wait == CloseWait::Upgrade {
            self.on_close("forced close", None);
            return;
        }
        if was_upgrading {
            self.flush();
        }
        self.start_next_probe();
    }

    // ========================================================================
    // Closing
    // ========================================================================

    fn close(&mut self) {
        if !matches!(self.ready_state, ReadyState::Opening | ReadyState::Open) {
            return;
        }

        debug!(
            buffered = self.write_buffer.len(),
            upgrading = self.upgrading,
            "Closing engine"
        );
        if self.ready_state == ReadyState::Opening {
            self.write_buffer.clear();
            self.prev_buffer_len = 0;
            self.on_close("forced close", None);
            return;
        }

        self.ready_state = ReadyState::Closing;

        if !self.write_buffer.is_empty() {
            self.close_wait = CloseWait::Drain;
        } else if self.upgrading {
            self.close_wait = CloseWait::Upgrade;
        } else {
            self.on_close("forced close", None);
        }
    }

    fn on_error(&mut self, error: Error) {
        warn!(error = %error, "Engine error");
        self.memory.set_prior_websocket_success(false);
        let description = error.to_string();
        self.emit(EngineEvent::Error(error));
        self.on_close("transport error", Some(description));
    }

    fn on_close(&mut self, reason: &str, description: Option<String>) {
        if self.ready_state == ReadyState::Closed {
            return;
        }

        info!(sid = ?self.id, reason, "Engine closed");

        self.ping_at = None;
        self.timeout_at = None;
        self.close_wait = CloseWait::None;
        self.upgrading = false;

        if let Some(mut probe) = self.probe.take() {
            let kind = probe.channel.kind();
            probe.channel.transport.close();
            self.emit(EngineEvent::UpgradeError(Error::probe(kind, "socket closed")));
        }

        if let Some(mut active) = self.active.take() {
            active.transport.close();
        }

        self.ready_state = ReadyState::Closed;
        self.id = None;
        self.upgrades.clear();

        self.emit(EngineEvent::Close {
            reason: reason.to_string(),
            description,
        });

        self.write_buffer.clear();
        self.prev_buffer_len = 0;
    }
}

// ============================================================================
// Tests
// ============================================================================
