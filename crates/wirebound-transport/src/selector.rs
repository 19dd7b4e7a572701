//! Readiness waiting over the registered UDP sockets.
//!
//! The sockets are non-blocking; the I/O thread parks here between drain
//! passes instead of spinning. Registering a socket (or shutting down)
//! must wake a parked wait immediately — that is the one capability the
//! dispatcher depends on, and the condvar provides it without a platform
//! poller: bindings performed while the I/O thread is parked take effect
//! on the very next pass.

use std::{
    collections::HashMap,
    net::UdpSocket,
    sync::{Arc, Condvar, Mutex},
    time::Duration,
};

#[derive(Debug, Default)]
struct SelectorState {
    sockets: HashMap<u16, Arc<UdpSocket>>,
    /// Bumped on every registry change so a parked wait can tell it was
    /// woken deliberately.
    version: u64,
    shutdown: bool,
}

/// Shared between the I/O thread (waiting) and binders (registering).
#[derive(Debug, Default)]
pub(crate) struct Selector {
    state: Mutex<SelectorState>,
    wake: Condvar,
}

impl Selector {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Adds a socket under its local port and wakes any parked wait.
    pub(crate) fn register(&self, port: u16, socket: Arc<UdpSocket>) {
        let mut state = self.state.lock().unwrap();
        state.sockets.insert(port, socket);
        state.version += 1;
        self.wake.notify_all();
    }

    /// Removes the socket for `port`. The socket itself closes when the
    /// last `Arc` drops.
    pub(crate) fn deregister(&self, port: u16) {
        let mut state = self.state.lock().unwrap();
        state.sockets.remove(&port);
        state.version += 1;
        self.wake.notify_all();
    }

    /// Stops all waiting permanently.
    pub(crate) fn shutdown(&self) {
        let mut state = self.state.lock().unwrap();
        state.shutdown = true;
        self.wake.notify_all();
    }

    /// Parks up to `timeout`, returning the current socket set, or `None`
    /// once shut down. Returns early when a socket is (de)registered.
    pub(crate) fn wait(&self, timeout: Duration) -> Option<Vec<(u16, Arc<UdpSocket>)>> {
        let mut state = self.state.lock().unwrap();
        if state.shutdown {
            return None;
        }
        let seen = state.version;
        let (state, _timed_out) = self
            .wake
            .wait_timeout_while(state, timeout, |s| !s.shutdown && s.version == seen)
            .unwrap();
        if state.shutdown {
            return None;
        }
        Some(state.sockets.iter().map(|(port, socket)| (*port, socket.clone())).collect())
    }
}
