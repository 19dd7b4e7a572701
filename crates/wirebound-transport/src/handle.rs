//! The public connection handle.
//!
//! A `Connection` pairs the pure state machine from `wirebound-conn` with
//! the socket it shares, a condition variable for the blocking open, and
//! the application's callbacks. The I/O thread, the retry thread, and
//! application senders all funnel through the state mutex; the actions the
//! state machine returns are applied after the lock is released so no lock
//! is ever held across socket I/O.

use std::{
    net::{SocketAddr, UdpSocket},
    sync::{Arc, Condvar, Mutex, Weak},
    time::{Duration, Instant},
};

use tracing::error;
use wirebound_conn::{Action, ConnEvent, Connection as ConnState, ConnectionState, SendStatus};
use wirebound_core::error::{ErrorKind, Result};
use wirebound_protocol::packet::Packet;

use crate::{
    dispatch::{Dispatch, Shared},
    listener::Listener,
};

/// Names one connection among all those sharing a transport: the local
/// port plus the remote address and port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId {
    /// Local UDP port of the shared socket.
    pub local_port: u16,
    /// Remote endpoint.
    pub remote: SocketAddr,
}

type MessageCallback = Arc<dyn Fn(&[u8]) + Send + Sync>;
type ResetCallback = Arc<dyn Fn() + Send + Sync>;

/// One open (or opening, or closing) RDP connection.
///
/// Cheap to share: all methods take `&self`. Obtained from
/// [`crate::Transport::open`] or the accept callback of a
/// [`crate::Listener`].
pub struct Connection {
    id: ConnectionId,
    socket: Arc<UdpSocket>,
    shared: Arc<Shared>,
    /// Set on passively accepted connections; drives the accept callback
    /// when the handshake completes.
    accepted_via: Option<Arc<Listener>>,
    /// Back-reference to our own `Arc`, so events can carry a handle to
    /// the callback thread.
    self_ref: Weak<Connection>,
    state: Mutex<ConnState>,
    /// Signaled whenever the state machine opens or resets, waking
    /// blocked `open` callers.
    signal: Condvar,
    message_cb: Mutex<Option<MessageCallback>>,
    reset_cb: Mutex<Option<ResetCallback>>,
}

impl Connection {
    /// Builds the handle inside its own `Arc` (via `new_cyclic`) so event
    /// dispatch can clone it.
    pub(crate) fn new(
        id: ConnectionId,
        socket: Arc<UdpSocket>,
        shared: Arc<Shared>,
        accepted_via: Option<Arc<Listener>>,
        state: ConnState,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            id,
            socket,
            shared,
            accepted_via,
            self_ref: self_ref.clone(),
            state: Mutex::new(state),
            signal: Condvar::new(),
            message_cb: Mutex::new(None),
            reset_cb: Mutex::new(None),
        })
    }

    /// This connection's identity.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// The remote endpoint.
    pub fn remote_addr(&self) -> SocketAddr {
        self.id.remote
    }

    /// Local port of the shared socket.
    pub fn local_port(&self) -> u16 {
        self.id.local_port
    }

    /// Snapshot of the lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.state.lock().unwrap().state()
    }

    /// Whether payloads are delivered in send order.
    pub fn is_sequenced(&self) -> bool {
        self.state.lock().unwrap().is_sequenced()
    }

    /// Installs the message callback, replacing any previous one. Runs on
    /// the transport's callback thread.
    pub fn on_message(&self, callback: impl Fn(&[u8]) + Send + Sync + 'static) {
        *self.message_cb.lock().unwrap() = Some(Arc::new(callback));
    }

    /// Installs the reset callback, replacing any previous one. Invoked at
    /// most once, on the transport's callback thread.
    pub fn on_reset(&self, callback: impl Fn() + Send + Sync + 'static) {
        *self.reset_cb.lock().unwrap() = Some(Arc::new(callback));
    }

    /// Sends one message. Never blocks: a full outstanding window returns
    /// [`SendStatus::WindowFull`] and the message is not queued.
    pub fn send(&self, message: &[u8]) -> Result<SendStatus> {
        if self.shared.is_shutdown() {
            return Err(ErrorKind::Shutdown);
        }
        let now = Instant::now();
        let (status, actions) = self.state.lock().unwrap().send(message.to_vec(), now)?;
        self.apply_actions(actions);
        Ok(status)
    }

    /// Sends a batch of messages in one call; small ones share aggregate
    /// packets. Messages beyond the current window stay queued and go out
    /// as acks arrive.
    pub fn send_all(&self, messages: Vec<Vec<u8>>) -> Result<SendStatus> {
        if self.shared.is_shutdown() {
            return Err(ErrorKind::Shutdown);
        }
        let now = Instant::now();
        let (status, actions) = self.state.lock().unwrap().send_all(messages, now)?;
        self.apply_actions(actions);
        Ok(status)
    }

    /// Closes the connection: RST to the peer, close-wait here, one reset
    /// callback. Idempotent. The registry entry is purged by the retry
    /// sweep after the close-wait window.
    pub fn close(&self) {
        let actions = self.state.lock().unwrap().close(Instant::now());
        self.apply_actions(actions);
    }

    // ------------------------------------------------------------------
    // Transport-internal driving
    // ------------------------------------------------------------------

    /// Feeds one decoded packet through the state machine (I/O thread).
    pub(crate) fn handle_packet(&self, packet: Packet, now: Instant) {
        let actions = self.state.lock().unwrap().process_packet(packet, now);
        self.apply_actions(actions);
    }

    /// Runs one retry-sweep pass; true means purge this connection.
    pub(crate) fn sweep(&self, now: Instant) -> bool {
        let (actions, purge) = {
            let mut state = self.state.lock().unwrap();
            (state.tick(now), state.should_purge(now))
        };
        self.apply_actions(actions);
        purge
    }

    /// Blocks until the handshake settles: `Ok` on open, an error on
    /// reset or timeout. Closing the connection from another thread wakes
    /// the wait.
    pub(crate) fn wait_open(&self, timeout: Option<Duration>) -> Result<()> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.state.lock().unwrap();
        loop {
            match state.state() {
                ConnectionState::Open => return Ok(()),
                ConnectionState::CloseWait | ConnectionState::Closed => {
                    return Err(ErrorKind::OpenFailed("connection reset during handshake"));
                }
                ConnectionState::SynSent | ConnectionState::SynRcvd => {}
            }
            state = match deadline {
                None => self.signal.wait(state).unwrap(),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(ErrorKind::OpenFailed("handshake timed out"));
                    }
                    self.signal.wait_timeout(state, deadline - now).unwrap().0
                }
            };
        }
    }

    /// Applies state-machine actions: datagrams go to the socket (through
    /// the filter), events go to the callback queue. Called with the state
    /// lock released.
    pub(crate) fn apply_actions(&self, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::Send(mut bytes) => {
                    let passed =
                        self.shared.filter.lock().unwrap().on_send(&self.id.remote, &mut bytes);
                    if !passed {
                        continue;
                    }
                    if let Err(err) = self.socket.send_to(&bytes, self.id.remote) {
                        error!("error sending packet (to {}): {}", self.id.remote, err);
                    }
                }
                Action::Emit(ConnEvent::Opened) => {
                    self.signal.notify_all();
                    if let (Some(listener), Some(conn)) =
                        (&self.accepted_via, self.self_ref.upgrade())
                    {
                        let _ = self
                            .shared
                            .dispatch_tx
                            .send(Dispatch::Accepted { listener: listener.clone(), conn });
                    }
                }
                Action::Emit(ConnEvent::Message(payload)) => {
                    if let Some(conn) = self.self_ref.upgrade() {
                        let _ = self.shared.dispatch_tx.send(Dispatch::Message { conn, payload });
                    }
                }
                Action::Emit(ConnEvent::Reset) => {
                    self.signal.notify_all();
                    if let Some(conn) = self.self_ref.upgrade() {
                        let _ = self.shared.dispatch_tx.send(Dispatch::Reset { conn });
                    }
                }
            }
        }
    }

    pub(crate) fn invoke_message(&self, payload: &[u8]) {
        // Clone the handler out so a callback may re-install itself
        // without deadlocking on the slot.
        let callback = self.message_cb.lock().unwrap().clone();
        if let Some(callback) = callback {
            callback(payload);
        }
    }

    pub(crate) fn invoke_reset(&self) {
        let callback = self.reset_cb.lock().unwrap().clone();
        if let Some(callback) = callback {
            callback();
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("state", &self.state.lock().unwrap().state())
            .finish()
    }
}
