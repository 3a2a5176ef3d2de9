//! Manager actor.
//!
//! One spawned task owns the engine, the packet codec, every namespace's
//! protocol state and the connect/reconnect timers. Handles only enqueue
//! [`ManagerCommand`]s.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;

use rustc_hash::FxHashMap;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::actor::{recv_opt, sleep_until_opt};
use crate::engine::{Engine, EngineEvent, EngineEventReceiver};
use crate::error::{Error, Result};
use crate::events::ClientEvent;
use crate::identifiers::SessionId;
use crate::protocol::{Data, Decoder, Encoder, Packet, PacketKind, ROOT_NAMESPACE};
use crate::socket::state::{CLIENT_DISCONNECT, NamespaceState, SERVER_DISCONNECT};

use super::{ManagerCommand, ManagerShared, ManagerState};

// ============================================================================
// Types
// ============================================================================

/// The engine together with its event stream.
struct Session {
    engine: Engine,
    events: EngineEventReceiver,
}

/// An in-flight connection attempt.
#[derive(Default)]
struct PendingConnect {
    waiters: Vec<oneshot::Sender<Result<()>>>,
    /// Started by a `connect()` caller rather than implicitly.
    awaited: bool,
    /// Started by the reconnection timer.
    reconnect: bool,
}

// ============================================================================
// ManagerActor
// ============================================================================

pub(crate) struct ManagerActor {
    shared: Arc<ManagerShared>,
    command_tx: mpsc::WeakUnboundedSender<ManagerCommand>,

    session: Option<Session>,
    encoder: Encoder,
    decoder: Decoder,

    namespaces: FxHashMap<String, NamespaceState>,
    /// Namespaces that joined and were not destroyed, in join order.
    connecting: Vec<String>,

    state: ManagerState,
    pending: Option<PendingConnect>,
    connect_deadline: Option<Instant>,

    reconnect_at: Option<Instant>,
    reconnecting: bool,
    skip_reconnect: bool,

    last_ping: Option<Instant>,
}

impl ManagerActor {
    pub(crate) fn new(
        shared: Arc<ManagerShared>,
        command_tx: mpsc::WeakUnboundedSender<ManagerCommand>,
    ) -> Self {
        Self {
            shared,
            command_tx,
            session: None,
            encoder: Encoder::new(),
            decoder: Decoder::new(),
            namespaces: FxHashMap::default(),
            connecting: Vec::new(),
            state: ManagerState::Closed,
            pending: None,
            connect_deadline: None,
            reconnect_at: None,
            reconnecting: false,
            skip_reconnect: false,
            last_ping: None,
        }
    }

    /// Runs until every handle is dropped.
    pub(crate) async fn run(mut self, mut command_rx: mpsc::UnboundedReceiver<ManagerCommand>) {
        loop {
            tokio::select! {
                command = command_rx.recv() => match command {
                    Some(command) => self.on_command(command),
                    None => break,
                },

                event = recv_opt(self.session.as_mut().map(|s| &mut s.events)) => {
                    self.on_engine_event(event);
                }

                () = sleep_until_opt(self.connect_deadline) => self.on_connect_timeout(),

                () = sleep_until_opt(self.reconnect_at) => self.on_reconnect_timer(),
            }

            self.publish();
        }

        if let Some(session) = self.session.take() {
            session.engine.close();
        }
        debug!("Manager actor terminated");
    }

    // ========================================================================
    // Status
    // ========================================================================

    fn publish(&self) {
        let mut status = self.shared.status.write();
        status.ready_state = self.state;
        status.engine_id = self.engine_id();
        status.reconnecting = self.reconnecting;
    }

    fn engine_id(&self) -> Option<SessionId> {
        match self.state {
            ManagerState::Open => self.session.as_ref().and_then(|s| s.engine.id()),
            _ => None,
        }
    }

    /// Broadcasts to the manager and every namespace.
    fn emit_all(&self, event: &ClientEvent) {
        self.publish();
        self.shared.events.emit(event);
        for namespace in self.namespaces.values() {
            namespace.emit_lifecycle(event);
        }
    }

    // ========================================================================
    // Commands
    // ========================================================================

    fn on_command(&mut self, command: ManagerCommand) {
        match command {
            ManagerCommand::Connect(waiter) => self.connect(waiter, false),
            ManagerCommand::Disconnect => self.disconnect(),
            ManagerCommand::Register(shared) => {
                let namespace = shared.namespace.clone();
                trace!(%namespace, "Registering namespace");
                self.namespaces
                    .entry(namespace)
                    .or_insert_with(|| NamespaceState::new(shared));
            }
            ManagerCommand::OpenSocket(namespace) => self.open_socket(&namespace),
            ManagerCommand::CloseSocket(namespace) => self.close_socket(&namespace),
            ManagerCommand::Emit {
                namespace,
                packet,
                ack,
            } => {
                let Some(state) = self.namespaces.get_mut(&namespace) else {
                    debug!(%namespace, "Emit on unknown namespace");
                    return;
                };
                if let Some(packet) = state.emit(packet, ack) {
                    self.write(&packet);
                }
            }
            ManagerCommand::Packet(packet) => self.write(&packet),
            ManagerCommand::CancelAck { namespace, id } => {
                if let Some(state) = self.namespaces.get_mut(&namespace)
                    && state.cancel_ack(id)
                {
                    trace!(%namespace, %id, "Acknowledgement cancelled");
                }
            }
        }
    }

    // ========================================================================
    // Connecting
    // ========================================================================

    fn connect(&mut self, waiter: Option<oneshot::Sender<Result<()>>>, reconnect: bool) {
        match self.state {
            ManagerState::Open => {
                if let Some(waiter) = waiter {
                    let _ = waiter.send(Ok(()));
                }
                return;
            }
            ManagerState::Opening => {
                if let Some(pending) = self.pending.as_mut() {
                    pending.waiters.extend(waiter);
                }
                return;
            }
            ManagerState::Closed => {}
        }

        // A previous engine may still be closing after `disconnect`.
        if self.session.is_some() {
            self.on_close("forced close");
        }

        // A manual connect during a backoff wait takes over that attempt.
        let reconnect = reconnect || self.reconnecting;
        self.reconnect_at = None;
        self.skip_reconnect = false;

        let options = self.shared.options.read().clone();
        info!(uri = %self.shared.uri, reconnect, "Connecting");

        self.state = ManagerState::Opening;
        self.pending = Some(PendingConnect {
            awaited: waiter.is_some(),
            waiters: waiter.into_iter().collect(),
            reconnect,
        });

        match Engine::open(
            options.engine,
            Arc::clone(&self.shared.factory),
            self.shared.memory.clone(),
        ) {
            Ok((engine, events)) => {
                self.session = Some(Session { engine, events });
                self.connect_deadline = options.timeout.map(|timeout| Instant::now() + timeout);
            }
            Err(error) => self.on_connect_error(error.to_string(), None),
        }
    }

    fn on_open(&mut self) {
        info!(sid = ?self.session.as_ref().and_then(|s| s.engine.id()), "Manager open");
        self.connect_deadline = None;
        self.state = ManagerState::Open;
        self.publish();
        self.shared.events.emit(&ClientEvent::Open);

        let requests: Vec<Packet> = self
            .namespaces
            .values()
            .filter(|state| state.is_subscribed())
            .filter_map(NamespaceState::on_open)
            .collect();
        for packet in &requests {
            self.write(packet);
        }

        if let Some(pending) = self.pending.take() {
            for waiter in pending.waiters {
                let _ = waiter.send(Ok(()));
            }
            if pending.reconnect {
                self.on_reconnect();
            }
        }
    }

    fn on_connect_error(&mut self, message: String, timeout_ms: Option<u64>) {
        warn!(%message, "Connect error");
        self.cleanup();
        self.state = ManagerState::Closed;
        self.emit_all(&ClientEvent::ConnectError {
            message: message.clone(),
        });

        let pending = self.pending.take().unwrap_or_default();
        for waiter in pending.waiters {
            let error = match timeout_ms {
                Some(timeout_ms) => Error::connection_timeout(timeout_ms),
                None => Error::data("Connection Error", message.clone()),
            };
            let _ = waiter.send(Err(error));
        }

        if pending.reconnect {
            self.reconnecting = false;
            self.emit_all(&ClientEvent::ReconnectError { message });
            self.reconnect();
        } else if !pending.awaited {
            self.maybe_reconnect_on_open();
        }
    }

    fn on_connect_timeout(&mut self) {
        self.connect_deadline = None;
        let timeout_ms = self
            .shared
            .options
            .read()
            .timeout
            .map_or(0, |timeout| u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX));
        debug!(timeout_ms, "Connect attempt timed out");

        self.on_connect_error("timeout".to_string(), Some(timeout_ms));
        self.emit_all(&ClientEvent::ConnectTimeout { timeout_ms });
    }

    /// Drops the engine and per-session codec state.
    fn cleanup(&mut self) {
        trace!("Cleaning up session");
        if let Some(session) = self.session.take() {
            session.engine.close();
        }
        self.connect_deadline = None;
        self.decoder.reset();
        self.last_ping = None;
    }

    // ========================================================================
    // Disconnecting
    // ========================================================================

    fn disconnect(&mut self) {
        debug!(state = ?self.state, "Manager disconnect");
        self.skip_reconnect = true;
        self.reconnecting = false;
        self.reconnect_at = None;

        if self.state == ManagerState::Opening {
            self.cleanup();
            if let Some(pending) = self.pending.take() {
                for waiter in pending.waiters {
                    let _ = waiter.send(Err(Error::ConnectionClosed));
                }
            }
        }

        self.shared.backoff.lock().reset();
        self.state = ManagerState::Closed;
        if let Some(session) = &self.session {
            session.engine.close();
        }
    }

    fn on_close(&mut self, reason: &str) {
        info!(%reason, "Manager closed");
        self.cleanup();
        self.shared.backoff.lock().reset();
        self.state = ManagerState::Closed;
        self.publish();
        self.shared.events.emit(&ClientEvent::Close {
            reason: reason.to_string(),
        });

        for state in self.namespaces.values_mut() {
            if state.is_subscribed() {
                state.on_close(reason);
            }
        }

        if self.shared.options.read().reconnection && !self.skip_reconnect {
            self.reconnect();
        }
    }

    // ========================================================================
    // Reconnection
    // ========================================================================

    fn maybe_reconnect_on_open(&mut self) {
        let reconnection = self.shared.options.read().reconnection;
        let attempts = self.shared.backoff.lock().attempts();
        if !self.reconnecting && reconnection && attempts == 0 {
            self.reconnect();
        }
    }

    fn reconnect(&mut self) {
        if self.reconnecting || self.skip_reconnect {
            return;
        }

        let max_attempts = self.shared.options.read().reconnection_attempts;
        let (delay, attempt) = {
            let mut backoff = self.shared.backoff.lock();
            if max_attempts.is_some_and(|max| backoff.attempts() >= max) {
                backoff.reset();
                (None, 0)
            } else {
                let delay = backoff.duration();
                (Some(delay), backoff.attempts())
            }
        };

        let Some(delay) = delay else {
            warn!("Reconnection attempts exhausted");
            self.reconnecting = false;
            self.emit_all(&ClientEvent::ReconnectFailed);
            return;
        };

        debug!(attempt, delay_ms = delay.as_millis(), "Scheduling reconnect");
        self.reconnecting = true;
        self.reconnect_at = Some(Instant::now() + delay);
        self.emit_all(&ClientEvent::ReconnectAttempt { attempt });
        self.emit_all(&ClientEvent::Reconnecting { attempt });
    }

    fn on_reconnect_timer(&mut self) {
        self.reconnect_at = None;
        if self.skip_reconnect {
            return;
        }
        debug!("Attempting reconnect");
        self.connect(None, true);
    }

    fn on_reconnect(&mut self) {
        let attempt = {
            let mut backoff = self.shared.backoff.lock();
            let attempt = backoff.attempts();
            backoff.reset();
            attempt
        };
        info!(attempt, "Reconnected");
        self.reconnecting = false;

        let sid = self.engine_id();
        for state in self.namespaces.values().filter(|s| s.is_subscribed()) {
            state.update_id(sid.as_ref());
        }
        self.emit_all(&ClientEvent::Reconnect { attempt });
    }

    // ========================================================================
    // Engine Events
    // ========================================================================

    fn on_engine_event(&mut self, event: Option<EngineEvent>) {
        let Some(event) = event else {
            debug!("Engine event stream ended");
            self.session = None;
            match self.state {
                ManagerState::Opening => {
                    self.on_connect_error("transport close".to_string(), None);
                }
                _ => self.on_close("transport close"),
            }
            return;
        };

        match event {
            EngineEvent::Open => self.on_open(),
            EngineEvent::Message(data) => self.on_data(data),
            EngineEvent::Ping => {
                self.last_ping = Some(Instant::now());
                self.emit_all(&ClientEvent::Ping);
            }
            EngineEvent::Pong => {
                let latency_ms = self.last_ping.map_or(0, |sent| {
                    u64::try_from(sent.elapsed().as_millis()).unwrap_or(u64::MAX)
                });
                self.emit_all(&ClientEvent::Pong { latency_ms });
            }
            EngineEvent::Error(error) => {
                if self.state == ManagerState::Opening {
                    self.on_connect_error(error.to_string(), None);
                } else {
                    warn!(%error, "Engine error");
                    self.emit_all(&ClientEvent::Error {
                        message: error.to_string(),
                    });
                }
            }
            EngineEvent::Close {
                reason,
                description,
            } => {
                debug!(%reason, ?description, "Engine closed");
                self.session = None;
                if self.state == ManagerState::Opening {
                    self.on_connect_error(reason, None);
                } else {
                    self.on_close(&reason);
                }
            }
            EngineEvent::Upgrade(kind) => debug!(transport = %kind, "Engine upgraded"),
            EngineEvent::UpgradeError(error) => debug!(%error, "Engine upgrade failed"),
            EngineEvent::Handshake(_)
            | EngineEvent::Upgrading(_)
            | EngineEvent::Drain => {}
        }
    }

    fn on_data(&mut self, data: Data) {
        match self.decoder.add(data) {
            Ok(Some(packet)) => self.on_packet(packet),
            Ok(None) => {}
            Err(error) => {
                warn!(%error, "Undecodable packet");
                self.decoder.reset();
                self.emit_all(&ClientEvent::Error {
                    message: error.to_string(),
                });
            }
        }
    }

    fn on_packet(&mut self, packet: Packet) {
        trace!(kind = %packet.kind, namespace = %packet.namespace, "Packet received");

        let targets: Vec<String> =
            if packet.kind == PacketKind::Error && packet.namespace == ROOT_NAMESPACE {
                self.namespaces
                    .values()
                    .filter(|state| state.is_subscribed())
                    .map(|state| state.namespace().to_string())
                    .collect()
            } else {
                vec![packet.namespace.clone()]
            };

        let sid = self.engine_id();
        let command_tx = self.command_tx.upgrade();

        for namespace in targets {
            let Some(state) = self.namespaces.get_mut(&namespace) else {
                debug!(%namespace, "Packet for unknown namespace");
                continue;
            };
            if !state.is_subscribed() {
                trace!(%namespace, "Packet for inactive namespace");
                continue;
            }

            let outcome = state.on_packet(packet.clone(), sid.as_ref(), command_tx.as_ref());
            for outbound in &outcome.outbound {
                self.write(outbound);
            }
            if outcome.server_disconnect {
                self.destroy_socket(&namespace);
                if let Some(state) = self.namespaces.get_mut(&namespace) {
                    state.on_close(SERVER_DISCONNECT);
                }
            }
        }
    }

    // ========================================================================
    // Namespaces
    // ========================================================================

    fn open_socket(&mut self, namespace: &str) {
        let manager_open = self.state == ManagerState::Open;
        let Some(state) = self.namespaces.get_mut(namespace) else {
            debug!(%namespace, "Open on unknown namespace");
            return;
        };
        if state.is_connected() {
            return;
        }

        let request = state.open(manager_open);
        if !self.connecting.iter().any(|n| n == namespace) {
            self.connecting.push(namespace.to_string());
        }
        if let Some(packet) = request {
            self.write(&packet);
        }
        self.connect(None, false);
    }

    fn close_socket(&mut self, namespace: &str) {
        let Some(state) = self.namespaces.get_mut(namespace) else {
            debug!(%namespace, "Close on unknown namespace");
            return;
        };

        let (packet, was_connected) = state.disconnect();
        if let Some(packet) = packet {
            self.write(&packet);
        }
        self.destroy_socket(namespace);
        if was_connected && let Some(state) = self.namespaces.get_mut(namespace) {
            state.on_close(CLIENT_DISCONNECT);
        }
    }

    /// Detaches a namespace; the last one out closes the manager.
    fn destroy_socket(&mut self, namespace: &str) {
        if let Some(state) = self.namespaces.get_mut(namespace) {
            state.destroy();
        }
        self.connecting.retain(|n| n != namespace);
        if self.connecting.is_empty() {
            debug!(%namespace, "Last namespace left");
            self.disconnect();
        }
    }

    // ========================================================================
    // Writing
    // ========================================================================

    /// Encodes and hands a packet to the engine.
    fn write(&self, packet: &Packet) {
        let Some(session) = &self.session else {
            debug!(kind = %packet.kind, namespace = %packet.namespace, "No engine, packet dropped");
            return;
        };
        let frames = self.encoder.encode(packet);
        trace!(kind = %packet.kind, frames = frames.len(), "Writing packet");
        if let Err(error) = session.engine.send_all(frames) {
            debug!(%error, "Engine gone, packet dropped");
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use parking_lot::Mutex;
    use serde_json::json;
    use tokio::time::{sleep, timeout};

    use crate::manager::{Manager, ManagerOptions};
    use crate::protocol::{Payload, SessionPacket, SessionPacketKind};
    use crate::transport::mock::{MockFactory, MockHandle};
    use crate::transport::{TransportFactory, TransportKind};

    struct Harness {
        manager: Manager,
        events: mpsc::UnboundedReceiver<ClientEvent>,
        factory: Arc<MockFactory>,
        created: mpsc::UnboundedReceiver<MockHandle>,
        _sub: crate::events::Subscription,
    }

    fn start(options: ManagerOptions) -> Harness {
        start_with(options, |_| {})
    }

    fn start_with(options: ManagerOptions, configure: impl FnOnce(&MockFactory)) -> Harness {
        let (factory, created) = MockFactory::new();
        configure(factory.as_ref());
        let dyn_factory: Arc<dyn TransportFactory> = factory.clone();
        let manager =
            Manager::with_factory("http://localhost:3000", options, dyn_factory).expect("manager");

        let (tx, events) = mpsc::unbounded_channel();
        let sub = manager.on(move |event| {
            let _ = tx.send(event.clone());
        });

        Harness {
            manager,
            events,
            factory,
            created,
            _sub: sub,
        }
    }

    impl Harness {
        async fn transport(&mut self) -> MockHandle {
            timeout(Duration::from_secs(5), self.created.recv())
                .await
                .expect("transport timeout")
                .expect("factory alive")
        }

        async fn wait_event(&mut self, matches: impl Fn(&ClientEvent) -> bool) -> ClientEvent {
            loop {
                let event = timeout(Duration::from_secs(120), self.events.recv())
                    .await
                    .expect("event timeout")
                    .expect("manager alive");
                if matches(&event) {
                    return event;
                }
            }
        }

        async fn open(&mut self) -> MockHandle {
            let polling = self.transport().await;
            polling.handshake("abc", &[], 25_000, 5_000);
            self.wait_event(|e| matches!(e, ClientEvent::Open)).await;
            polling
        }
    }

    fn options() -> ManagerOptions {
        ManagerOptions::new().with_transports([TransportKind::Polling])
    }

    fn sent_messages(transport: &MockHandle) -> Vec<String> {
        transport
            .sent()
            .into_iter()
            .filter(|packet| packet.kind == SessionPacketKind::Message)
            .filter_map(|packet| packet.text().map(str::to_string))
            .collect()
    }

    async fn wait_until(condition: impl Fn() -> bool) {
        timeout(Duration::from_secs(5), async {
            while !condition() {
                sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .expect("condition not reached");
    }

    #[tokio::test]
    async fn test_connect_resolves_on_open() {
        let mut h = start(options().with_auto_connect(false));
        let manager = h.manager.clone();
        let connect = tokio::spawn(async move { manager.connect().await });

        let polling = h.transport().await;
        polling.handshake("abc", &[], 25_000, 5_000);

        connect.await.expect("join").expect("connect");
        assert_eq!(h.manager.ready_state(), ManagerState::Open);
        assert_eq!(h.manager.engine_id().map(|id| id.as_str().to_string()), Some("abc".to_string()));

        h.manager.connect().await.expect("already open");
    }

    #[tokio::test]
    async fn test_root_emit_with_ack_round_trip() {
        let mut h = start(options());
        let socket = h.manager.socket("/");
        let replies = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&replies);
        socket
            .emit_with_ack("chat", vec![Payload::from(json!({"msg": "hi"}))], move |args| {
                sink.lock().push(args);
            })
            .expect("emit");

        let polling = h.open().await;
        assert!(sent_messages(&polling).is_empty());

        polling.receive(SessionPacket::message("0"));
        wait_until(|| sent_messages(&polling) == vec![r#"20["chat",{"msg":"hi"}]"#.to_string()])
            .await;
        assert!(socket.connected());
        assert_eq!(socket.id().as_deref(), Some("abc"));

        polling.receive(SessionPacket::message(r#"30["ok"]"#));
        wait_until(|| replies.lock().len() == 1).await;
        assert_eq!(replies.lock()[0], vec![Payload::from("ok")]);
    }

    #[tokio::test]
    async fn test_namespace_connect_sent_on_open() {
        let mut h = start(options());
        let socket = h.manager.socket_with_query("/chat", "token=1");
        let polling = h.open().await;

        wait_until(|| sent_messages(&polling) == vec!["0/chat?token=1,".to_string()]).await;
        assert!(!socket.connected());

        polling.receive(SessionPacket::message("0/chat"));
        wait_until(|| socket.connected()).await;
        assert_eq!(socket.id().as_deref(), Some("/chat#abc"));
    }

    #[tokio::test]
    async fn test_outbound_order_preserved_across_connect() {
        let mut h = start(options());
        let socket = h.manager.socket("/chat");
        for n in 0..3i64 {
            socket.emit("n", vec![Payload::from(n)]).expect("emit");
        }
        let polling = h.open().await;
        wait_until(|| sent_messages(&polling).len() == 1).await;

        polling.receive(SessionPacket::message("0/chat"));
        socket.emit("n", vec![Payload::from(3i64)]).expect("emit");

        let expected: Vec<String> = std::iter::once("0/chat,".to_string())
            .chain((0..4).map(|n| format!(r#"2/chat,["n",{n}]"#)))
            .collect();
        wait_until(|| sent_messages(&polling) == expected).await;
    }

    #[tokio::test]
    async fn test_inbound_event_dispatched_with_ack() {
        let mut h = start(options());
        let socket = h.manager.socket("/");
        let _sub = socket
            .on("question", |event| {
                if let Some(ack) = &event.ack {
                    ack.send(vec![Payload::from(42i64)]);
                }
            })
            .expect("subscribe");

        let polling = h.open().await;
        polling.receive(SessionPacket::message("0"));
        polling.receive(SessionPacket::message(r#"27["question"]"#));

        wait_until(|| sent_messages(&polling) == vec!["37[42]".to_string()]).await;
    }

    #[tokio::test]
    async fn test_server_disconnect_of_last_namespace_closes_manager() {
        let mut h = start(options());
        let socket = h.manager.socket("/");
        let (tx, mut lifecycle) = mpsc::unbounded_channel();
        let _sub = socket.on_lifecycle(move |event| {
            let _ = tx.send(event.clone());
        });

        let polling = h.open().await;
        polling.receive(SessionPacket::message("0"));
        wait_until(|| socket.connected()).await;

        polling.receive(SessionPacket::message("1"));
        loop {
            let event = timeout(Duration::from_secs(5), lifecycle.recv())
                .await
                .expect("lifecycle timeout")
                .expect("socket alive");
            if let ClientEvent::Disconnect { reason } = event {
                assert_eq!(reason, "io server disconnect");
                break;
            }
        }
        wait_until(|| polling.is_closed()).await;
        assert!(!socket.connected());
    }

    #[tokio::test]
    async fn test_client_disconnect_sends_packet() {
        let mut h = start(options());
        let socket = h.manager.socket("/chat");
        let polling = h.open().await;
        polling.receive(SessionPacket::message("0/chat"));
        wait_until(|| socket.connected()).await;

        socket.disconnect().expect("disconnect");
        wait_until(|| sent_messages(&polling).last().map(String::as_str) == Some("1/chat,")).await;
        wait_until(|| !socket.connected()).await;
    }

    #[tokio::test]
    async fn test_decode_error_broadcast() {
        let mut h = start(options());
        let _socket = h.manager.socket("/");
        let polling = h.open().await;

        polling.receive(SessionPacket::with_data(SessionPacketKind::Message, vec![1u8, 2]));
        let event = h.wait_event(|e| matches!(e, ClientEvent::Error { .. })).await;
        let ClientEvent::Error { message } = event else {
            unreachable!();
        };
        assert!(message.contains("binary"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnection_bound() {
        let mut h = start_with(options().with_reconnection_attempts(3), |factory| {
            factory.fail(TransportKind::Polling);
        });

        let attempts = Arc::new(Mutex::new(0u32));
        let counter = Arc::clone(&attempts);
        let _sub = h.manager.on(move |event| {
            if matches!(event, ClientEvent::ReconnectAttempt { .. }) {
                *counter.lock() += 1;
            }
        });

        h.wait_event(|e| matches!(e, ClientEvent::ReconnectFailed)).await;
        assert_eq!(*attempts.lock(), 3);
        assert_eq!(h.factory.attempts(), 4);
        assert_eq!(h.manager.ready_state(), ManagerState::Closed);
        assert!(!h.manager.is_reconnecting());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_after_transport_close() {
        let mut h = start(options().with_randomization_factor(0.0));
        let socket = h.manager.socket("/");
        let polling = h.open().await;
        polling.receive(SessionPacket::message("0"));
        wait_until(|| socket.connected()).await;

        polling.emit(crate::transport::TransportEvent::Close);
        let event = h.wait_event(|e| matches!(e, ClientEvent::Close { .. })).await;
        assert_eq!(
            event,
            ClientEvent::Close {
                reason: "transport close".to_string()
            }
        );
        let event = h.wait_event(|e| matches!(e, ClientEvent::ReconnectAttempt { .. })).await;
        assert_eq!(event, ClientEvent::ReconnectAttempt { attempt: 1 });
        assert!(h.manager.is_reconnecting());

        let second = h.transport().await;
        second.handshake("def", &[], 25_000, 5_000);
        let event = h.wait_event(|e| matches!(e, ClientEvent::Reconnect { .. })).await;
        assert_eq!(event, ClientEvent::Reconnect { attempt: 1 });
        assert!(!h.manager.is_reconnecting());
        assert_eq!(socket.id().as_deref(), Some("def"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_succeeds_once_transport_recovers() {
        let mut h = start_with(options(), |factory| {
            factory.fail(TransportKind::Polling);
        });
        let event = h.wait_event(|e| matches!(e, ClientEvent::ReconnectAttempt { .. })).await;
        assert_eq!(event, ClientEvent::ReconnectAttempt { attempt: 1 });

        h.factory.heal(TransportKind::Polling);
        let polling = h.transport().await;
        polling.handshake("abc", &[], 25_000, 5_000);

        let event = h.wait_event(|e| matches!(e, ClientEvent::Reconnect { .. })).await;
        assert_eq!(event, ClientEvent::Reconnect { attempt: 1 });
        assert_eq!(h.manager.ready_state(), ManagerState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout() {
        let mut h = start(options().with_timeout(Some(Duration::from_millis(500))).with_reconnection(false));
        let _polling = h.transport().await;

        let event = h.wait_event(|e| matches!(e, ClientEvent::ConnectError { .. })).await;
        assert_eq!(
            event,
            ClientEvent::ConnectError {
                message: "timeout".to_string()
            }
        );
        let event = h.wait_event(|e| matches!(e, ClientEvent::ConnectTimeout { .. })).await;
        assert_eq!(event, ClientEvent::ConnectTimeout { timeout_ms: 500 });
        assert_eq!(h.manager.ready_state(), ManagerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_awaited_connect_failure_does_not_reconnect() {
        let h = start_with(options().with_auto_connect(false), |factory| {
            factory.fail(TransportKind::Polling);
        });

        let error = h.manager.connect().await.unwrap_err();
        assert!(matches!(error, Error::Data { .. }));

        sleep(Duration::from_secs(30)).await;
        assert_eq!(h.factory.attempts(), 1);
        assert!(!h.manager.is_reconnecting());
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_cancels_pending_reconnect() {
        let mut h = start_with(options(), |factory| {
            factory.fail(TransportKind::Polling);
        });
        h.wait_event(|e| matches!(e, ClientEvent::ReconnectAttempt { .. })).await;
        assert!(h.manager.is_reconnecting());

        h.manager.disconnect();
        sleep(Duration::from_secs(60)).await;
        assert_eq!(h.factory.attempts(), 1);
        assert!(!h.manager.is_reconnecting());
    }

    #[tokio::test]
    async fn test_socket_is_cached_per_namespace() {
        let h = start(options().with_auto_connect(false));
        let first = h.manager.socket("chat");
        let second = h.manager.socket("/chat");
        assert_eq!(first.namespace(), "/chat");
        assert_eq!(second.namespace(), "/chat");
        assert!(h.manager.has_namespace("/chat"));
        assert!(!h.manager.has_namespace("/"));
    }

    #[tokio::test]
    async fn test_setters_propagate_to_backoff() {
        let h = start(options().with_auto_connect(false));
        h.manager.set_reconnection_delay(Duration::from_millis(10));
        h.manager.set_reconnection_delay_max(Duration::from_millis(20));
        h.manager.set_randomization_factor(2.0);

        let backoff = *h.manager.shared.backoff.lock();
        assert_eq!(backoff.min(), Duration::from_millis(10));
        assert_eq!(backoff.max(), Duration::from_millis(20));
        assert!((backoff.jitter() - 1.0).abs() < f64::EPSILON);
        assert_eq!(h.manager.options().reconnection_delay, Duration::from_millis(10));
    }
}
