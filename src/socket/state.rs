//! Namespace protocol state.
//!
//! Lives inside the manager actor. Methods return the packets to transmit;
//! the manager encodes and writes them, so ordering stays FIFO.

use std::collections::VecDeque;
use std::sync::Arc;

use rustc_hash::FxHashMap;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::events::ClientEvent;
use crate::identifiers::{AckId, SessionId};
use crate::manager::ManagerCommand;
use crate::protocol::{Packet, PacketKind, Payload, ROOT_NAMESPACE};

use super::{Ack, AckCallback, IncomingEvent, SocketShared};

// ============================================================================
// Constants
// ============================================================================

/// Disconnect reason after [`Socket::disconnect`](super::Socket::disconnect).
pub(crate) const CLIENT_DISCONNECT: &str = "io client disconnect";

/// Disconnect reason after a server `Disconnect` packet.
pub(crate) const SERVER_DISCONNECT: &str = "io server disconnect";

// ============================================================================
// PacketOutcome
// ============================================================================

/// Result of handling one inbound packet.
#[derive(Debug, Default)]
pub(crate) struct PacketOutcome {
    /// Packets to write, in order.
    pub outbound: Vec<Packet>,
    /// The server closed the namespace.
    pub server_disconnect: bool,
}

// ============================================================================
// NamespaceState
// ============================================================================

pub(crate) struct NamespaceState {
    shared: Arc<SocketShared>,
    subscribed: bool,
    connected: bool,
    acks: FxHashMap<AckId, AckCallback>,
    receive_buffer: VecDeque<IncomingEvent>,
    send_buffer: VecDeque<Packet>,
}

impl NamespaceState {
    pub(crate) fn new(shared: Arc<SocketShared>) -> Self {
        Self {
            shared,
            subscribed: false,
            connected: false,
            acks: FxHashMap::default(),
            receive_buffer: VecDeque::new(),
            send_buffer: VecDeque::new(),
        }
    }

    #[inline]
    pub(crate) fn namespace(&self) -> &str {
        &self.shared.namespace
    }

    #[cfg(test)]
    pub(crate) fn shared(&self) -> &Arc<SocketShared> {
        &self.shared
    }

    /// Returns `true` while the socket follows manager events.
    #[inline]
    pub(crate) fn is_subscribed(&self) -> bool {
        self.subscribed
    }

    #[inline]
    pub(crate) fn is_connected(&self) -> bool {
        self.connected
    }

    #[cfg(test)]
    pub(crate) fn pending_acks(&self) -> usize {
        self.acks.len()
    }

    /// Broadcasts a lifecycle event to this namespace's listeners.
    pub(crate) fn emit_lifecycle(&self, event: &ClientEvent) {
        self.shared.lifecycle.emit(event);
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Starts following the manager.
    ///
    /// Returns the connect packet when the manager is already open.
    pub(crate) fn open(&mut self, manager_open: bool) -> Option<Packet> {
        if self.connected {
            return None;
        }
        self.subscribed = true;
        let packet = if manager_open { self.on_open() } else { None };
        self.emit_lifecycle(&ClientEvent::Connecting);
        packet
    }

    /// Manager reached `Open`; non-root namespaces request to join.
    pub(crate) fn on_open(&self) -> Option<Packet> {
        if self.namespace() == ROOT_NAMESPACE {
            return None;
        }
        trace!(namespace = %self.namespace(), "Requesting namespace");
        Some(Packet::connect(
            self.namespace().to_string(),
            self.shared.query.clone(),
        ))
    }

    /// Manager or namespace closed.
    pub(crate) fn on_close(&mut self, reason: &str) {
        debug!(namespace = %self.namespace(), %reason, "Namespace closed");
        self.connected = false;
        {
            let mut status = self.shared.status.write();
            status.connected = false;
            status.id = None;
        }
        self.emit_lifecycle(&ClientEvent::Disconnect {
            reason: reason.to_string(),
        });
    }

    /// Stops following the manager.
    pub(crate) fn destroy(&mut self) {
        self.subscribed = false;
    }

    /// Leaves the namespace.
    ///
    /// Returns the disconnect packet (if connected) and whether the socket
    /// was connected. The caller follows up with [`destroy`](Self::destroy)
    /// and, for a connected socket, [`on_close`](Self::on_close).
    pub(crate) fn disconnect(&mut self) -> (Option<Packet>, bool) {
        if self.connected {
            trace!(namespace = %self.namespace(), "Sending disconnect");
            (Some(Packet::disconnect(self.namespace().to_string())), true)
        } else {
            (None, false)
        }
    }

    /// Recomputes the socket id after the manager learned a new session.
    pub(crate) fn update_id(&self, sid: Option<&SessionId>) {
        let id = sid.map(|sid| self.socket_id(sid));
        self.shared.status.write().id = id;
    }

    fn socket_id(&self, sid: &SessionId) -> String {
        if self.namespace() == ROOT_NAMESPACE {
            sid.as_str().to_string()
        } else {
            format!("{}#{}", self.namespace(), sid)
        }
    }

    // ========================================================================
    // Outbound
    // ========================================================================

    /// Queues an outbound event.
    ///
    /// Returns the packet when it can go out now.
    pub(crate) fn emit(&mut self, packet: Packet, ack: Option<AckCallback>) -> Option<Packet> {
        if let Some(callback) = ack
            && let Some(id) = packet.id
        {
            self.acks.insert(id, callback);
        }

        if self.connected {
            Some(packet)
        } else {
            trace!(namespace = %self.namespace(), "Buffering outbound packet");
            self.send_buffer.push_back(packet);
            None
        }
    }

    /// Forgets a pending acknowledgement.
    pub(crate) fn cancel_ack(&mut self, id: AckId) -> bool {
        self.acks.remove(&id).is_some()
    }

    // ========================================================================
    // Inbound
    // ========================================================================

    /// Handles a packet addressed to this namespace.
    pub(crate) fn on_packet(
        &mut self,
        packet: Packet,
        sid: Option<&SessionId>,
        command_tx: Option<&mpsc::UnboundedSender<ManagerCommand>>,
    ) -> PacketOutcome {
        let mut outcome = PacketOutcome::default();
        match packet.kind {
            PacketKind::Connect => outcome.outbound = self.on_connect(sid),
            PacketKind::Event | PacketKind::BinaryEvent => self.on_event(packet, command_tx),
            PacketKind::Ack | PacketKind::BinaryAck => self.on_ack(packet),
            PacketKind::Disconnect => {
                debug!(namespace = %self.namespace(), "Server disconnected namespace");
                outcome.server_disconnect = true;
            }
            PacketKind::Error => self.on_error(&packet),
        }
        outcome
    }

    fn on_connect(&mut self, sid: Option<&SessionId>) -> Vec<Packet> {
        debug!(namespace = %self.namespace(), "Namespace connected");
        self.connected = true;
        {
            let mut status = self.shared.status.write();
            status.connected = true;
            status.id = sid.map(|sid| self.socket_id(sid));
        }
        self.emit_lifecycle(&ClientEvent::Connect);

        while let Some(event) = self.receive_buffer.pop_front() {
            self.shared.dispatch(&event);
        }
        self.send_buffer.drain(..).collect()
    }

    fn on_event(
        &mut self,
        packet: Packet,
        command_tx: Option<&mpsc::UnboundedSender<ManagerCommand>>,
    ) {
        let Packet { data, id, .. } = packet;
        let mut args = match data {
            Some(Payload::Array(args)) => args,
            _ => {
                debug!(namespace = %self.namespace(), "Event without argument array");
                return;
            }
        };
        if args.is_empty() {
            debug!(namespace = %self.namespace(), "Event without name");
            return;
        }
        let Payload::String(name) = args.remove(0) else {
            debug!(namespace = %self.namespace(), "Event name is not a string");
            return;
        };

        let ack = id.and_then(|id| {
            command_tx.map(|tx| Ack::new(self.namespace().to_string(), id, tx.clone()))
        });
        let event = IncomingEvent { name, args, ack };

        if self.connected {
            self.shared.dispatch(&event);
        } else {
            trace!(namespace = %self.namespace(), event = %event.name, "Buffering inbound event");
            self.receive_buffer.push_back(event);
        }
    }

    fn on_ack(&mut self, packet: Packet) {
        let Some(id) = packet.id else {
            debug!(namespace = %self.namespace(), "Ack without id");
            return;
        };
        match self.acks.remove(&id) {
            Some(callback) => {
                trace!(namespace = %self.namespace(), %id, "Calling ack");
                let args = match packet.data {
                    Some(Payload::Array(args)) => args,
                    Some(other) => vec![other],
                    None => Vec::new(),
                };
                callback(args);
            }
            None => debug!(namespace = %self.namespace(), %id, "Bad ack"),
        }
    }

    fn on_error(&self, packet: &Packet) {
        let message = match &packet.data {
            Some(Payload::String(text)) => text.clone(),
            Some(other) => other
                .to_json()
                .map_or_else(|| "server error".to_string(), |json| json.to_string()),
            None => "server error".to_string(),
        };
        debug!(namespace = %self.namespace(), %message, "Namespace error");
        self.emit_lifecycle(&ClientEvent::Error { message });
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};

    use parking_lot::Mutex;

    fn state(namespace: &str) -> NamespaceState {
        NamespaceState::new(Arc::new(SocketShared::new(namespace, None)))
    }

    fn event(namespace: &str, name: &str, id: Option<u64>) -> Packet {
        Packet::event(namespace, vec![Payload::from(name), Payload::from(1i64)], id.map(AckId::new))
    }

    fn lifecycle(state: &NamespaceState) -> (Arc<Mutex<Vec<ClientEvent>>>, crate::events::Subscription) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let sub = state
            .shared()
            .lifecycle
            .subscribe(move |event: &ClientEvent| sink.lock().push(event.clone()));
        (seen, sub)
    }

    #[test]
    fn test_root_namespace_sends_no_connect() {
        let mut root = state("/");
        assert!(root.open(true).is_none());
        assert!(root.is_subscribed());

        let mut chat = state("/chat");
        let packet = chat.open(true).expect("connect packet");
        assert_eq!(packet.kind, PacketKind::Connect);
        assert_eq!(packet.namespace, "/chat");
    }

    #[test]
    fn test_connect_query_is_carried() {
        let shared = Arc::new(SocketShared::new("/admin", Some("token=abc".to_string())));
        let state = NamespaceState::new(shared);
        let packet = state.on_open().expect("connect packet");
        assert_eq!(packet.query.as_deref(), Some("token=abc"));
    }

    #[test]
    fn test_outbound_buffered_until_connect() {
        let mut chat = state("/chat");
        let _ = chat.open(false);
        assert!(chat.emit(event("/chat", "a", None), None).is_none());
        assert!(chat.emit(event("/chat", "b", None), None).is_none());

        let sid = SessionId::new("abc");
        let outcome = chat.on_packet(Packet::new(PacketKind::Connect, "/chat"), Some(&sid), None);
        let names: Vec<_> = outcome
            .outbound
            .iter()
            .filter_map(|packet| packet.args().first().and_then(Payload::as_str).map(str::to_string))
            .collect();
        assert_eq!(names, vec!["a", "b"]);
        assert!(chat.is_connected());
        assert_eq!(chat.shared().status.read().id.as_deref(), Some("/chat#abc"));

        assert!(chat.emit(event("/chat", "c", None), None).is_some());
    }

    #[test]
    fn test_inbound_buffered_until_connect() {
        let mut root = state("/");
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        let _sub = root.shared().subscribe("tick", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let _ = root.on_packet(event("/", "tick", None), None, None);
        assert_eq!(seen.load(Ordering::SeqCst), 0);

        let sid = SessionId::new("xyz");
        let _ = root.on_packet(Packet::new(PacketKind::Connect, "/"), Some(&sid), None);
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert_eq!(root.shared().status.read().id.as_deref(), Some("xyz"));

        let _ = root.on_packet(event("/", "tick", None), None, None);
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_ack_callback_runs_once() {
        let mut root = state("/");
        let _ = root.on_packet(Packet::new(PacketKind::Connect, "/"), None, None);

        let calls = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&calls);
        let packet = Packet::event("/", vec![Payload::from("chat")], Some(AckId::new(0)));
        let sent = root.emit(packet, Some(Box::new(move |args: Vec<Payload>| sink.lock().push(args))));
        assert!(sent.is_some());
        assert_eq!(root.pending_acks(), 1);

        let reply = Packet::ack("/", vec![Payload::from("ok")], AckId::new(0));
        let _ = root.on_packet(reply.clone(), None, None);
        let _ = root.on_packet(reply, None, None);

        assert_eq!(calls.lock().len(), 1);
        assert_eq!(calls.lock()[0], vec![Payload::from("ok")]);
        assert_eq!(root.pending_acks(), 0);
    }

    #[test]
    fn test_cancel_ack() {
        let mut root = state("/");
        let packet = Packet::event("/", vec![Payload::from("slow")], Some(AckId::new(3)));
        let _ = root.emit(packet, Some(Box::new(|_: Vec<Payload>| panic!("cancelled ack called"))));
        assert!(root.cancel_ack(AckId::new(3)));
        assert!(!root.cancel_ack(AckId::new(3)));

        let _ = root.on_packet(Packet::ack("/", vec![], AckId::new(3)), None, None);
    }

    #[test]
    fn test_inbound_event_with_id_carries_ack() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut root = state("/");
        let _ = root.on_packet(Packet::new(PacketKind::Connect, "/"), None, None);

        let acked = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&acked);
        let _sub = root.shared().subscribe("question", move |event| {
            if let Some(ack) = &event.ack {
                assert_eq!(ack.id(), AckId::new(9));
                ack.send(vec![Payload::from(42i64)]);
                ack.send(vec![Payload::from(43i64)]);
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        let _ = root.on_packet(event("/", "question", Some(9)), None, Some(&tx));
        assert_eq!(acked.load(Ordering::SeqCst), 1);

        let Ok(ManagerCommand::Packet(reply)) = rx.try_recv() else {
            panic!("expected ack reply");
        };
        assert_eq!(reply.kind, PacketKind::Ack);
        assert_eq!(reply.id, Some(AckId::new(9)));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_server_disconnect_flagged() {
        let mut chat = state("/chat");
        let outcome = chat.on_packet(Packet::disconnect("/chat"), None, None);
        assert!(outcome.server_disconnect);
    }

    #[test]
    fn test_error_packet_emits_lifecycle_error() {
        let chat = state("/chat");
        let (seen, _sub) = lifecycle(&chat);
        let mut chat = chat;
        let mut packet = Packet::new(PacketKind::Error, "/chat");
        packet.data = Some(Payload::from("Not authorized"));
        let _ = chat.on_packet(packet, None, None);
        assert_eq!(
            seen.lock().as_slice(),
            &[ClientEvent::Error {
                message: "Not authorized".to_string()
            }]
        );
    }

    #[test]
    fn test_disconnect_only_when_connected() {
        let mut chat = state("/chat");
        assert_eq!(chat.disconnect(), (None, false));

        let _ = chat.on_packet(Packet::new(PacketKind::Connect, "/chat"), None, None);
        let (packet, was_connected) = chat.disconnect();
        assert!(was_connected);
        assert_eq!(packet.map(|p| p.kind), Some(PacketKind::Disconnect));
    }

    #[test]
    fn test_on_close_clears_status() {
        let mut root = state("/");
        let (seen, _sub) = lifecycle(&root);
        let sid = SessionId::new("s1");
        let _ = root.on_packet(Packet::new(PacketKind::Connect, "/"), Some(&sid), None);
        root.on_close(CLIENT_DISCONNECT);

        assert!(!root.is_connected());
        assert!(root.shared().status.read().id.is_none());
        assert_eq!(
            seen.lock().last(),
            Some(&ClientEvent::Disconnect {
                reason: "io client disconnect".to_string()
            })
        );
    }
}
