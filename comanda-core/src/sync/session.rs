//! The logical channel to the server.
//!
//! A [`ChannelSession`] owns the handler registry and the table of
//! outstanding acknowledgments. It outlives individual websocket
//! connections: the [`Transport`](super::Transport) attaches to it on every
//! successful connect and detaches on disconnect, while handlers registered
//! by consumers stay in place across reconnects.
//!
//! Consumers register with [`ChannelSession::on`] and keep the returned
//! [`Subscription`] for as long as they want events. Dropping it
//! deregisters the handler.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};

use super::error::SyncError;
use super::protocol::Packet;
use crate::task::lock;

/// Reserved event fired on every (re)connect.
pub const CONNECT_EVENT: &str = "connect";
/// Reserved event fired on every disconnect.
pub const DISCONNECT_EVENT: &str = "disconnect";

/// An event handler.
pub type Handler = Arc<dyn Fn(&Value) + Send + Sync>;

type HandlerId = u64;

struct SessionInner {
    handlers: Mutex<HashMap<String, Vec<(HandlerId, Handler)>>>,
    acks: Mutex<HashMap<u64, oneshot::Sender<Value>>>,
    outbound: Mutex<Option<mpsc::UnboundedSender<Packet>>>,
    connected: watch::Sender<bool>,
    next_handler: AtomicU64,
    next_ack: AtomicU64,
}

/// Shared handle to the channel. Cheap to clone.
#[derive(Clone)]
pub struct ChannelSession {
    inner: Arc<SessionInner>,
}

impl std::fmt::Debug for ChannelSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelSession")
            .field("connected", &self.is_connected())
            .field("pending_acks", &self.pending_acks())
            .finish()
    }
}

impl Default for ChannelSession {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelSession {
    /// Creates a disconnected session with no handlers.
    pub fn new() -> Self {
        let (connected, _) = watch::channel(false);
        Self {
            inner: Arc::new(SessionInner {
                handlers: Mutex::new(HashMap::new()),
                acks: Mutex::new(HashMap::new()),
                outbound: Mutex::new(None),
                connected,
                next_handler: AtomicU64::new(1),
                next_ack: AtomicU64::new(1),
            }),
        }
    }

    /// Returns true while a transport is attached and connected.
    pub fn is_connected(&self) -> bool {
        *self.inner.connected.borrow()
    }

    /// Watches connection state changes.
    pub fn connection_changes(&self) -> watch::Receiver<bool> {
        self.inner.connected.subscribe()
    }

    /// Registers a handler for `event`.
    ///
    /// The handler stays registered until the returned [`Subscription`] is
    /// dropped or passed to [`ChannelSession::off`].
    pub fn on<F>(&self, event: &str, handler: F) -> Subscription
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        let id = self.inner.next_handler.fetch_add(1, Ordering::Relaxed);
        lock(&self.inner.handlers)
            .entry(event.to_string())
            .or_default()
            .push((id, Arc::new(handler)));

        tracing::trace!(event, handler = id, "handler registered");

        Subscription {
            session: Arc::downgrade(&self.inner),
            event: event.to_string(),
            id,
        }
    }

    /// Deregisters a handler. Same as dropping the subscription.
    pub fn off(&self, subscription: Subscription) {
        drop(subscription);
    }

    /// Number of handlers currently registered for `event`.
    pub fn handler_count(&self, event: &str) -> usize {
        lock(&self.inner.handlers)
            .get(event)
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Number of emitted events still waiting for an acknowledgment.
    pub fn pending_acks(&self) -> usize {
        lock(&self.inner.acks).len()
    }

    /// Sends an event without expecting an acknowledgment.
    pub fn emit(&self, event: &str, payload: Value) -> Result<(), SyncError> {
        self.send(Packet::event(event, payload, None))
    }

    /// Sends an event and returns a handle resolving with the server's
    /// acknowledgment.
    ///
    /// The acknowledgment is delivered at most once. Dropping the returned
    /// [`PendingAck`] forgets the correlation, so a late acknowledgment is
    /// discarded.
    pub fn emit_with_ack(&self, event: &str, payload: Value) -> Result<PendingAck, SyncError> {
        let ack_id = self.inner.next_ack.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        lock(&self.inner.acks).insert(ack_id, tx);

        let pending = PendingAck {
            session: Arc::downgrade(&self.inner),
            ack_id,
            rx,
        };

        // On failure `pending` is dropped here, which removes the entry.
        self.send(Packet::event(event, payload, Some(ack_id)))?;
        Ok(pending)
    }

    fn send(&self, packet: Packet) -> Result<(), SyncError> {
        if !self.is_connected() {
            return Err(SyncError::ChannelDisconnected);
        }
        let outbound = lock(&self.inner.outbound);
        match outbound.as_ref() {
            Some(tx) => tx.send(packet).map_err(|_| SyncError::ChannelDisconnected),
            None => Err(SyncError::ChannelDisconnected),
        }
    }

    /// Attaches a transport, returning the queue of packets to write.
    ///
    /// Called by the transport once the socket handshake has completed,
    /// immediately before [`ChannelSession::mark_connected`].
    pub fn attach(&self) -> mpsc::UnboundedReceiver<Packet> {
        let (tx, rx) = mpsc::unbounded_channel();
        *lock(&self.inner.outbound) = Some(tx);
        rx
    }

    /// Marks the channel connected and fires the `connect` handlers.
    pub fn mark_connected(&self) {
        self.inner.connected.send_replace(true);
        tracing::debug!("channel connected");
        self.dispatch(CONNECT_EVENT, &Value::Null);
    }

    /// Detaches the transport, fails outstanding acknowledgments and fires
    /// the `disconnect` handlers.
    pub fn mark_disconnected(&self) {
        *lock(&self.inner.outbound) = None;
        let was_connected = self.inner.connected.send_replace(false);

        // Dropping the senders resolves every waiting PendingAck with
        // ChannelDisconnected.
        let dropped = std::mem::take(&mut *lock(&self.inner.acks));
        if !dropped.is_empty() {
            tracing::debug!(count = dropped.len(), "dropping unacknowledged requests");
        }
        drop(dropped);

        if was_connected {
            tracing::debug!("channel disconnected");
            self.dispatch(DISCONNECT_EVENT, &Value::Null);
        }
    }

    /// Routes one inbound packet to handlers or to a waiting acknowledgment.
    pub fn handle_packet(&self, packet: Packet) {
        match packet {
            Packet::Event { name, data, .. } => self.dispatch(&name, &data),
            Packet::Ack { ack_id, data } => self.resolve_ack(ack_id, data),
            other => tracing::trace!(packet = ?other, "ignoring control packet"),
        }
    }

    fn resolve_ack(&self, ack_id: u64, data: Value) {
        let waiter = lock(&self.inner.acks).remove(&ack_id);
        match waiter {
            Some(tx) => {
                // The receiver may already be gone; that is a late ack.
                let _ = tx.send(data);
            }
            None => tracing::debug!(ack_id, "ignoring late or unknown acknowledgment"),
        }
    }

    fn dispatch(&self, event: &str, data: &Value) {
        // Clone out of the lock so handlers may register, deregister or emit.
        let handlers: Vec<Handler> = lock(&self.inner.handlers)
            .get(event)
            .map(|list| list.iter().map(|(_, h)| h.clone()).collect())
            .unwrap_or_default();

        if handlers.is_empty() {
            tracing::trace!(event, "no handler for event");
            return;
        }
        for handler in handlers {
            handler(data);
        }
    }
}

/// Registration of one handler. Dropping it deregisters the handler.
#[must_use = "dropping a Subscription immediately deregisters its handler"]
#[derive(Debug)]
pub struct Subscription {
    session: Weak<SessionInner>,
    event: String,
    id: HandlerId,
}

impl Subscription {
    /// The event this subscription listens to.
    pub fn event(&self) -> &str {
        &self.event
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let Some(session) = self.session.upgrade() else {
            return;
        };
        let mut handlers = lock(&session.handlers);
        if let Some(list) = handlers.get_mut(&self.event) {
            list.retain(|(id, _)| *id != self.id);
            if list.is_empty() {
                handlers.remove(&self.event);
            }
        }
    }
}

/// An acknowledgment that has not arrived yet.
#[derive(Debug)]
pub struct PendingAck {
    session: Weak<SessionInner>,
    ack_id: u64,
    rx: oneshot::Receiver<Value>,
}

impl PendingAck {
    /// Correlation id carried on the wire.
    pub fn ack_id(&self) -> u64 {
        self.ack_id
    }

    /// Waits for the acknowledgment.
    ///
    /// Fails with [`SyncError::ChannelDisconnected`] if the connection drops
    /// first. Callers bound the wait with a timeout.
    pub async fn recv(mut self) -> Result<Value, SyncError> {
        (&mut self.rx)
            .await
            .map_err(|_| SyncError::ChannelDisconnected)
    }
}

impl Drop for PendingAck {
    fn drop(&mut self) {
        if let Some(session) = self.session.upgrade() {
            lock(&session.acks).remove(&self.ack_id);
        }
    }
}

/// In-process stand-in for a transport, used by tests across the crate.
#[cfg(test)]
pub(crate) mod loopback {
    use super::*;

    /// A connected session plus the queue of packets it wrote.
    pub(crate) struct Loopback {
        pub session: ChannelSession,
        pub sent: mpsc::UnboundedReceiver<Packet>,
    }

    impl Loopback {
        pub fn connected() -> Self {
            let session = ChannelSession::new();
            let sent = session.attach();
            session.mark_connected();
            Self { session, sent }
        }

        /// Drains every packet written so far.
        pub fn drain(&mut self) -> Vec<Packet> {
            let mut out = Vec::new();
            while let Ok(packet) = self.sent.try_recv() {
                out.push(packet);
            }
            out
        }

        /// Emitted events named `name`, draining the queue.
        pub fn drain_events(&mut self, name: &str) -> Vec<(Value, Option<u64>)> {
            self.drain()
                .into_iter()
                .filter_map(|packet| match packet {
                    Packet::Event {
                        name: event,
                        data,
                        ack_id,
                    } if event == name => Some((data, ack_id)),
                    _ => None,
                })
                .collect()
        }

        /// Waits for the next written packet.
        pub async fn next(&mut self) -> Packet {
            self.sent.recv().await.expect("session dropped")
        }

        /// Simulates a server push.
        pub fn push(&self, name: &str, data: Value) {
            self.session
                .handle_packet(Packet::event(name, data, None));
        }

        /// Simulates a server acknowledgment.
        pub fn ack(&self, ack_id: u64, data: Value) {
            self.session.handle_packet(Packet::Ack { ack_id, data });
        }

        /// Simulates a reconnect.
        pub fn reconnect(&mut self) {
            self.session.mark_disconnected();
            self.sent = self.session.attach();
            self.session.mark_connected();
        }
    }
}
