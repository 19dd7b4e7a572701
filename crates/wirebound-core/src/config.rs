//! Configuration options to tune protocol and transport behavior.

use std::time::Duration;

use crate::constants::{DEFAULT_SEGMENT_SIZE, DEFAULT_WINDOW, MAX_FRAGMENTS_DEFAULT};

/// Configuration options to tune protocol and transport behavior.
///
/// All durations are wall-clock; sweeps run on the retry thread at
/// `retry_interval` granularity, so effective timing is quantized to it.
#[derive(Clone, Debug)]
pub struct Config {
    /// Age after which an unacknowledged packet is retransmitted.
    pub resend_threshold: Duration,
    /// Age of the oldest unacknowledged packet after which the connection
    /// is forced to reset (peer presumed unreachable).
    pub giveup_timeout: Duration,
    /// How long a connection lingers in close-wait before it is purged
    /// from the registry.
    pub close_wait_timeout: Duration,
    /// Idle time (nothing sent) after which an open connection emits a
    /// NUL keepalive.
    pub keepalive_interval: Duration,
    /// Period of the retry sweep thread.
    pub retry_interval: Duration,
    /// Outstanding-packet window advertised to the peer at handshake:
    /// how many unacknowledged packets we are prepared to receive.
    /// Inbound sequences more than twice this far ahead are rejected.
    /// Overridable per connection at `open`.
    pub max_outstanding: u16,
    /// Largest payload placed in a single packet; larger messages are
    /// fragmented.
    pub max_segment_size: u16,
    /// Max number of fragments one message may split into.
    pub max_fragments: u8,
    /// Age after which an incomplete fragment-reassembly group is dropped.
    pub reassembly_timeout: Duration,
    /// How long the I/O thread waits for readiness before re-checking
    /// registered sockets. Registration wakes the wait early.
    pub poll_timeout: Duration,
    /// Max datagrams drained from one socket per readiness iteration, so
    /// a busy socket cannot starve the others.
    pub drain_batch: usize,
    /// Socket receive buffer size in bytes (None = system default).
    pub socket_recv_buffer_size: Option<usize>,
    /// Socket send buffer size in bytes (None = system default).
    pub socket_send_buffer_size: Option<usize>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            resend_threshold: Duration::from_millis(500),
            giveup_timeout: Duration::from_secs(30),
            close_wait_timeout: Duration::from_secs(30),
            keepalive_interval: Duration::from_secs(30),
            retry_interval: Duration::from_millis(250),
            max_outstanding: DEFAULT_WINDOW,
            max_segment_size: DEFAULT_SEGMENT_SIZE,
            max_fragments: MAX_FRAGMENTS_DEFAULT,
            reassembly_timeout: Duration::from_secs(10),
            poll_timeout: Duration::from_millis(1),
            drain_batch: 64,
            socket_recv_buffer_size: None,
            socket_send_buffer_size: None,
        }
    }
}
