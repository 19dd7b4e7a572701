//! Listening sockets for inbound connections.

use std::{net::SocketAddr, sync::Arc, sync::Mutex};

use crate::handle::Connection;

type AcceptCallback = Arc<dyn Fn(Arc<Connection>) + Send + Sync>;

/// A UDP port accepting inbound RDP connections.
///
/// A SYN from an unknown identity on this port spawns a connection; once
/// its handshake completes the accept callback runs (on the callback
/// thread) exactly once for it. Any other packet from an unknown identity
/// is answered with RST and discarded.
pub struct Listener {
    local_addr: SocketAddr,
    accept_cb: Mutex<Option<AcceptCallback>>,
}

impl Listener {
    pub(crate) fn new(local_addr: SocketAddr) -> Self {
        Self { local_addr, accept_cb: Mutex::new(None) }
    }

    /// The bound local address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The bound local port (the listening half of connection identities).
    pub fn local_port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Installs the accept callback, replacing any previous one.
    ///
    /// Connections accepted before a callback is installed are simply not
    /// announced; install it before traffic is expected.
    pub fn on_accept(&self, callback: impl Fn(Arc<Connection>) + Send + Sync + 'static) {
        *self.accept_cb.lock().unwrap() = Some(Arc::new(callback));
    }

    pub(crate) fn notify_accept(&self, conn: Arc<Connection>) {
        let callback = self.accept_cb.lock().unwrap().clone();
        if let Some(callback) = callback {
            callback(conn);
        }
    }
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener").field("local_addr", &self.local_addr).finish()
    }
}
