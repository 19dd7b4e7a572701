//! Callback dispatch plumbing.
//!
//! Connections emit events on the I/O and retry threads; invoking
//! application callbacks there would let slow application code stall the
//! whole transport. Events are queued here instead and drained by the
//! dedicated callback thread.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex,
};

use crossbeam_channel::Sender;
use wirebound_core::filter::PacketFilter;

use crate::{handle::Connection, listener::Listener};

/// Work items for the callback thread.
pub(crate) enum Dispatch {
    /// A reassembled message ready for the connection's message callback.
    Message {
        /// Connection it arrived on.
        conn: Arc<Connection>,
        /// The application bytes.
        payload: Vec<u8>,
    },
    /// A passively accepted connection finished its handshake.
    Accepted {
        /// The listener that spawned it.
        listener: Arc<Listener>,
        /// The new connection.
        conn: Arc<Connection>,
    },
    /// The connection was reset.
    Reset {
        /// The connection that went down.
        conn: Arc<Connection>,
    },
    /// Transport shutdown sentinel; the callback thread exits.
    Shutdown,
}

/// State shared by the transport, its threads, and every handle it vends.
///
/// Deliberately free of the registry so `Connection → Shared` creates no
/// reference cycle back into the transport.
pub(crate) struct Shared {
    pub(crate) dispatch_tx: Sender<Dispatch>,
    pub(crate) filter: Mutex<Box<dyn PacketFilter>>,
    shutdown: AtomicBool,
}

impl Shared {
    pub(crate) fn new(dispatch_tx: Sender<Dispatch>, filter: Box<dyn PacketFilter>) -> Self {
        Self { dispatch_tx, filter: Mutex::new(filter), shutdown: AtomicBool::new(false) }
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    pub(crate) fn set_shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
    }
}
