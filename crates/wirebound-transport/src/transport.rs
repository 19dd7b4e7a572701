//! The transport: socket registry, dispatcher threads, bind and open.

use std::{
    collections::HashMap,
    io,
    net::{Ipv4Addr, SocketAddr, ToSocketAddrs, UdpSocket},
    sync::{Arc, Mutex},
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use socket2::Socket as Socket2;
use tracing::{debug, error, warn};
use wirebound_conn::Connection as ConnState;
use wirebound_core::{
    config::Config,
    error::{ErrorKind, Result},
    filter::{NoOpFilter, PacketFilter},
};
use wirebound_protocol::{codec, packet::Packet};

use crate::{
    dispatch::{Dispatch, Shared},
    handle::{Connection, ConnectionId},
    listener::Listener,
    selector::Selector,
};

/// Options for [`Transport::open`].
#[derive(Debug, Clone, Default)]
pub struct OpenOptions {
    /// Require ordered delivery on this connection.
    pub sequenced: bool,
    /// Share (or bind) this local port instead of an ephemeral one.
    pub local_port: Option<u16>,
    /// Override the advertised receive window for this connection.
    pub recv_window: Option<u16>,
    /// Bound the blocking handshake wait. `None` waits until the
    /// handshake gives up and resets.
    pub timeout: Option<Duration>,
}

/// All sockets and connections of one RDP endpoint, plus the three threads
/// that drive them: the I/O readiness loop, the retry sweep, and the
/// callback dispatcher.
///
/// Everything is per-instance; two transports in one process never share
/// state, which is how the tests run a client and a server side by side.
/// Dropping the transport stops all three threads.
pub struct Transport {
    inner: Arc<Inner>,
    retry_stop: Option<Sender<()>>,
    threads: Vec<JoinHandle<()>>,
}

struct SocketEntry {
    socket: Arc<UdpSocket>,
    connections: HashMap<SocketAddr, Arc<Connection>>,
    listener: Option<Arc<Listener>>,
}

struct Inner {
    config: Config,
    selector: Selector,
    /// Local port → socket, its connections, and an optional listener.
    /// A socket is dropped (closed) only when both are gone.
    registry: Mutex<HashMap<u16, SocketEntry>>,
    shared: Arc<Shared>,
}

impl Transport {
    /// Creates a transport with the given configuration and starts its
    /// threads. No sockets are bound yet.
    pub fn new(config: Config) -> Result<Self> {
        Self::with_filter(config, Box::new(NoOpFilter))
    }

    /// Creates a transport whose datagrams all pass through `filter`,
    /// for inspection, mutation, or loss injection.
    pub fn with_filter(config: Config, filter: Box<dyn PacketFilter>) -> Result<Self> {
        let (dispatch_tx, dispatch_rx) = unbounded();
        let shared = Arc::new(Shared::new(dispatch_tx, filter));
        let inner = Arc::new(Inner {
            config,
            selector: Selector::new(),
            registry: Mutex::new(HashMap::new()),
            shared,
        });

        let (retry_stop, retry_stop_rx) = bounded(0);
        let mut threads = Vec::with_capacity(3);
        threads.push(spawn_named("wirebound-io", {
            let inner = inner.clone();
            move || io_loop(inner)
        })?);
        threads.push(spawn_named("wirebound-retry", {
            let inner = inner.clone();
            move || retry_loop(inner, retry_stop_rx)
        })?);
        threads.push(spawn_named("wirebound-callback", move || callback_loop(dispatch_rx))?);

        Ok(Transport { inner, retry_stop: Some(retry_stop), threads })
    }

    /// The configuration this transport runs with.
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Binds a listening socket for inbound connections.
    ///
    /// `local_port` of `None` picks an ephemeral port. Binding a port that
    /// already carries outbound connections attaches the listener to the
    /// existing socket; a port that already has a listener is refused.
    pub fn bind(&self, local_port: Option<u16>) -> Result<Arc<Listener>> {
        if self.inner.shared.is_shutdown() {
            return Err(ErrorKind::Shutdown);
        }
        let mut registry = self.inner.registry.lock().unwrap();

        if let Some(port) = local_port {
            if let Some(entry) = registry.get_mut(&port) {
                if entry.listener.is_some() {
                    return Err(ErrorKind::PortInUse(port));
                }
                let listener = Arc::new(Listener::new(entry.socket.local_addr()?));
                entry.listener = Some(listener.clone());
                return Ok(listener);
            }
        }

        let socket = Arc::new(bind_socket(local_port.unwrap_or(0), &self.inner.config)?);
        let local_addr = socket.local_addr()?;
        let listener = Arc::new(Listener::new(local_addr));
        registry.insert(
            local_addr.port(),
            SocketEntry {
                socket: socket.clone(),
                connections: HashMap::new(),
                listener: Some(listener.clone()),
            },
        );
        self.inner.selector.register(local_addr.port(), socket);
        Ok(listener)
    }

    /// Dials a peer and blocks until the connection opens.
    ///
    /// The SYN goes out immediately; the calling thread then waits on the
    /// handshake. Failure modes: the peer resets, the retry sweep gives
    /// up, `options.timeout` elapses, or the connection is closed from
    /// another thread — each wakes this call with an error.
    pub fn open(&self, remote: impl ToSocketAddrs, options: OpenOptions) -> Result<Arc<Connection>> {
        if self.inner.shared.is_shutdown() {
            return Err(ErrorKind::Shutdown);
        }
        let remote = remote
            .to_socket_addrs()?
            .next()
            .ok_or(ErrorKind::OpenFailed("could not resolve remote address"))?;

        let (conn, actions) = {
            let mut registry = self.inner.registry.lock().unwrap();

            let port = match options.local_port {
                Some(port) if registry.contains_key(&port) => port,
                requested => {
                    let socket =
                        Arc::new(bind_socket(requested.unwrap_or(0), &self.inner.config)?);
                    let port = socket.local_addr()?.port();
                    registry.insert(
                        port,
                        SocketEntry {
                            socket: socket.clone(),
                            connections: HashMap::new(),
                            listener: None,
                        },
                    );
                    self.inner.selector.register(port, socket);
                    port
                }
            };

            let entry = registry.get_mut(&port).expect("socket entry just ensured");
            if entry.connections.contains_key(&remote) {
                return Err(ErrorKind::OpenFailed("connection to this peer already exists"));
            }

            let mut config = self.inner.config.clone();
            if let Some(window) = options.recv_window {
                config.max_outstanding = window;
            }
            let (state, actions) =
                ConnState::open_active(config, options.sequenced, rand::random(), Instant::now());
            let conn = Connection::new(
                ConnectionId { local_port: port, remote },
                entry.socket.clone(),
                self.inner.shared.clone(),
                None,
                state,
            );
            entry.connections.insert(remote, conn.clone());
            (conn, actions)
        };

        conn.apply_actions(actions);
        match conn.wait_open(options.timeout) {
            Ok(()) => Ok(conn),
            Err(err) => {
                conn.close();
                Err(err)
            }
        }
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.inner.shared.set_shutdown();
        self.inner.selector.shutdown();
        // Dropping the stop sender ends the retry loop; the sentinel ends
        // the callback loop even while connection handles are still held.
        self.retry_stop.take();
        let _ = self.inner.shared.dispatch_tx.send(Dispatch::Shutdown);
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let registry = self.inner.registry.lock().unwrap();
        f.debug_struct("Transport").field("ports", &registry.keys().collect::<Vec<_>>()).finish()
    }
}

// ----------------------------------------------------------------------
// Threads
// ----------------------------------------------------------------------

fn spawn_named(
    name: &str,
    body: impl FnOnce() + Send + 'static,
) -> Result<JoinHandle<()>> {
    Ok(thread::Builder::new().name(name.to_string()).spawn(body)?)
}

/// I/O thread: park on the selector, then drain every registered socket.
fn io_loop(inner: Arc<Inner>) {
    // Largest datagram the 16-bit length field can describe, plus header.
    let mut buffer = vec![0u8; 65536];
    while let Some(sockets) = inner.selector.wait(inner.config.poll_timeout) {
        for (port, socket) in sockets {
            inner.drain_socket(port, &socket, &mut buffer);
        }
    }
}

/// Retry thread: periodic sweep until the transport drops.
fn retry_loop(inner: Arc<Inner>, stop: Receiver<()>) {
    loop {
        match stop.recv_timeout(inner.config.retry_interval) {
            Err(RecvTimeoutError::Timeout) => inner.sweep(Instant::now()),
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}

/// Callback thread: application code runs here, never on the I/O thread.
fn callback_loop(dispatch_rx: Receiver<Dispatch>) {
    for dispatch in dispatch_rx.iter() {
        match dispatch {
            Dispatch::Message { conn, payload } => conn.invoke_message(&payload),
            Dispatch::Accepted { listener, conn } => listener.notify_accept(conn),
            Dispatch::Reset { conn } => conn.invoke_reset(),
            Dispatch::Shutdown => break,
        }
    }
}

impl Inner {
    /// Reads at most `drain_batch` datagrams from one socket so a busy
    /// socket cannot starve the rest of the registry.
    fn drain_socket(&self, port: u16, socket: &Arc<UdpSocket>, buffer: &mut [u8]) {
        for _ in 0..self.config.drain_batch {
            let (len, remote) = match socket.recv_from(buffer) {
                Ok(received) => received,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    error!("error receiving on port {}: {}", port, err);
                    break;
                }
            };
            let now = Instant::now();

            let passed =
                self.shared.filter.lock().unwrap().on_receive(&remote, &mut buffer[..len]);
            if !passed {
                continue;
            }

            match codec::decode(&buffer[..len]) {
                Ok(packet) => self.route(port, socket, remote, packet, now),
                Err(err) => {
                    warn!("dropping undecodable datagram from {}: {}", remote, err);
                }
            }
        }
    }

    /// Finds the owning connection by identity, or hands unknown traffic
    /// to the port's listener.
    fn route(
        &self,
        port: u16,
        socket: &Arc<UdpSocket>,
        remote: SocketAddr,
        packet: Packet,
        now: Instant,
    ) {
        let (conn, listener) = {
            let registry = self.registry.lock().unwrap();
            match registry.get(&port) {
                Some(entry) => {
                    (entry.connections.get(&remote).cloned(), entry.listener.clone())
                }
                None => (None, None),
            }
        };

        if let Some(conn) = conn {
            conn.handle_packet(packet, now);
            return;
        }
        let Some(listener) = listener else {
            debug!("dropping packet from unknown peer {} on port {}", remote, port);
            return;
        };

        if packet.flags.is_syn() && !packet.flags.is_ack() {
            self.accept(port, socket, remote, &packet, listener, now);
        } else if !packet.flags.is_rst() {
            // Unknown identity, not an open attempt: refuse it. Stray
            // RSTs are dropped so two endpoints cannot ping-pong resets.
            let rst = codec::encode(&Packet::rst(0, packet.seq));
            self.send_raw(socket, remote, rst);
        }
    }

    /// Passive accept: spawn a connection seeded from the SYN.
    fn accept(
        &self,
        port: u16,
        socket: &Arc<UdpSocket>,
        remote: SocketAddr,
        syn: &Packet,
        listener: Arc<Listener>,
        now: Instant,
    ) {
        debug!("accepting connection from {} on port {}", remote, port);
        let (state, actions) =
            ConnState::open_passive(self.config.clone(), syn, rand::random(), now);
        let conn = Connection::new(
            ConnectionId { local_port: port, remote },
            socket.clone(),
            self.shared.clone(),
            Some(listener),
            state,
        );
        {
            let mut registry = self.registry.lock().unwrap();
            if let Some(entry) = registry.get_mut(&port) {
                entry.connections.insert(remote, conn.clone());
            }
        }
        conn.apply_actions(actions);
    }

    fn send_raw(&self, socket: &UdpSocket, remote: SocketAddr, mut bytes: Vec<u8>) {
        if !self.shared.filter.lock().unwrap().on_send(&remote, &mut bytes) {
            return;
        }
        if let Err(err) = socket.send_to(&bytes, remote) {
            error!("error sending packet (to {}): {}", remote, err);
        }
    }

    /// One retry pass over every connection: resend, giveup, keepalive,
    /// pending flush, reassembly expiry; then purge close-waited
    /// connections and tear down sockets nobody references.
    fn sweep(&self, now: Instant) {
        let snapshot: Vec<(u16, SocketAddr, Arc<Connection>)> = {
            let registry = self.registry.lock().unwrap();
            registry
                .iter()
                .flat_map(|(port, entry)| {
                    let port = *port;
                    entry
                        .connections
                        .iter()
                        .map(move |(remote, conn)| (port, *remote, conn.clone()))
                })
                .collect()
        };

        // One connection mutex at a time; never the registry lock as well.
        let mut purged = Vec::new();
        for (port, remote, conn) in snapshot {
            if conn.sweep(now) {
                purged.push((port, remote));
            }
        }

        if !purged.is_empty() {
            let mut registry = self.registry.lock().unwrap();
            for (port, remote) in purged {
                let Some(entry) = registry.get_mut(&port) else { continue };
                entry.connections.remove(&remote);
                debug!("purged close-waited connection to {} on port {}", remote, port);
                if entry.connections.is_empty() && entry.listener.is_none() {
                    registry.remove(&port);
                    self.selector.deregister(port);
                }
            }
        }
    }
}

// ----------------------------------------------------------------------
// Socket setup
// ----------------------------------------------------------------------

/// Applies configured socket options to a freshly bound socket.
fn apply_socket_options(socket: &UdpSocket, config: &Config) -> io::Result<()> {
    let socket2 = Socket2::from(socket.try_clone()?);
    if let Some(size) = config.socket_recv_buffer_size {
        socket2.set_recv_buffer_size(size)?;
    }
    if let Some(size) = config.socket_send_buffer_size {
        socket2.set_send_buffer_size(size)?;
    }
    // The UdpSocket keeps its own handle; socket2 wrapped a duplicate.
    Ok(())
}

fn bind_socket(port: u16, config: &Config) -> Result<UdpSocket> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port))?;
    socket.set_nonblocking(true)?;
    apply_socket_options(&socket, config)?;
    Ok(socket)
}
