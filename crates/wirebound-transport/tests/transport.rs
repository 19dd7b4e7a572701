//! End-to-end tests over real loopback sockets.
//!
//! A client transport and a server transport run side by side in one
//! process, each with its own threads, which is exactly what per-instance
//! registries exist for.

use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use crossbeam_channel::{unbounded, RecvTimeoutError};
use wirebound_core::{config::Config, error::ErrorKind, filter::PacketFilter};
use wirebound_transport::{Connection, OpenOptions, SendStatus, Transport};

/// Opt-in test logging: `RUST_LOG=wirebound=debug cargo test`.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// Short timings so failure scenarios finish in test time.
fn fast_config() -> Config {
    let mut config = Config::default();
    config.retry_interval = Duration::from_millis(25);
    config.resend_threshold = Duration::from_millis(75);
    config.giveup_timeout = Duration::from_millis(600);
    config.close_wait_timeout = Duration::from_millis(400);
    config
}

fn server_addr(listener_port: u16) -> SocketAddr {
    format!("127.0.0.1:{}", listener_port).parse().unwrap()
}

/// Binds a server that forwards every delivered message (and reset) of
/// every accepted connection onto channels.
fn echo_server(
    config: Config,
) -> (Transport, u16, crossbeam_channel::Receiver<Vec<u8>>, Arc<AtomicUsize>) {
    let transport = Transport::new(config).unwrap();
    let listener = transport.bind(None).unwrap();
    let port = listener.local_port();

    let (message_tx, message_rx) = unbounded();
    let resets = Arc::new(AtomicUsize::new(0));
    let reset_count = resets.clone();
    listener.on_accept(move |conn: Arc<Connection>| {
        let message_tx = message_tx.clone();
        conn.on_message(move |payload| {
            message_tx.send(payload.to_vec()).unwrap();
        });
        let reset_count = reset_count.clone();
        conn.on_reset(move || {
            reset_count.fetch_add(1, Ordering::SeqCst);
        });
    });

    (transport, port, message_rx, resets)
}

#[test]
fn open_send_receive_close() {
    init_tracing();
    let (server, port, messages, resets) = echo_server(fast_config());
    let client = Transport::new(fast_config()).unwrap();

    let conn = client
        .open(server_addr(port), OpenOptions { timeout: Some(Duration::from_secs(5)), ..Default::default() })
        .unwrap();
    assert!(conn.state().is_open());

    assert_eq!(conn.send(b"hello over rdp").unwrap(), SendStatus::Sent);
    let delivered = messages.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(delivered, b"hello over rdp");

    conn.close();
    // The server side observes exactly one reset.
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while resets.load(Ordering::SeqCst) == 0 && std::time::Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(resets.load(Ordering::SeqCst), 1);

    drop(client);
    drop(server);
}

#[test]
fn send_on_closed_connection_is_an_error() {
    let (_server, port, _messages, _resets) = echo_server(fast_config());
    let client = Transport::new(fast_config()).unwrap();

    let conn = client
        .open(server_addr(port), OpenOptions { timeout: Some(Duration::from_secs(5)), ..Default::default() })
        .unwrap();
    conn.close();
    assert!(matches!(conn.send(b"too late"), Err(ErrorKind::NotOpen)));
}

#[test]
fn large_message_fragments_and_reassembles() {
    let (_server, port, messages, _resets) = echo_server(fast_config());
    let client = Transport::new(fast_config()).unwrap();

    let conn = client
        .open(server_addr(port), OpenOptions { timeout: Some(Duration::from_secs(5)), ..Default::default() })
        .unwrap();

    let message: Vec<u8> = (0..4000usize).map(|i| (i % 256) as u8).collect();
    assert_eq!(conn.send(&message).unwrap(), SendStatus::Sent);

    let delivered = messages.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(delivered, message);
}

#[test]
fn batched_messages_arrive_individually_in_order() {
    let (_server, port, messages, _resets) = echo_server(fast_config());
    let client = Transport::new(fast_config()).unwrap();

    let conn = client
        .open(
            server_addr(port),
            OpenOptions {
                sequenced: true,
                timeout: Some(Duration::from_secs(5)),
                ..Default::default()
            },
        )
        .unwrap();

    let batch: Vec<Vec<u8>> = (0..5u8).map(|i| vec![i; 8]).collect();
    assert_eq!(conn.send_all(batch.clone()).unwrap(), SendStatus::Sent);

    for expected in &batch {
        let delivered = messages.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(&delivered, expected);
    }
}

#[test]
fn open_times_out_against_a_dead_port() {
    let client = Transport::new(fast_config()).unwrap();
    // Bind a socket with no listener attached anywhere near it; nothing
    // will ever answer the SYN.
    let dead = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
    let addr = dead.local_addr().unwrap();

    let started = std::time::Instant::now();
    let result = client.open(
        addr,
        OpenOptions { timeout: Some(Duration::from_millis(200)), ..Default::default() },
    );
    assert!(matches!(result, Err(ErrorKind::OpenFailed(_))));
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[test]
fn unanswered_connection_gives_up_and_resets() {
    let client = Transport::new(fast_config()).unwrap();
    let dead = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
    let addr = dead.local_addr().unwrap();

    // No open timeout: the blocking open is released by the giveup reset.
    let started = std::time::Instant::now();
    let result = client.open(addr, OpenOptions::default());
    assert!(matches!(result, Err(ErrorKind::OpenFailed(_))));
    // giveup (600ms) plus sweep jitter, well under the default 30s.
    assert!(started.elapsed() < Duration::from_secs(5));
}

/// Drops a deterministic share of outbound pure acks.
struct AckLossFilter {
    counter: usize,
}

impl AckLossFilter {
    fn is_pure_ack(bytes: &[u8]) -> bool {
        match wirebound_protocol::codec::decode(bytes) {
            Ok(packet) => {
                packet.flags.is_ack()
                    && !packet.flags.is_syn()
                    && !packet.flags.is_nul()
                    && !packet.flags.is_rst()
                    && packet.payload.is_empty()
            }
            Err(_) => false,
        }
    }
}

impl PacketFilter for AckLossFilter {
    fn on_receive(&mut self, _addr: &SocketAddr, _data: &mut [u8]) -> bool {
        true
    }

    fn on_send(&mut self, _addr: &SocketAddr, data: &mut Vec<u8>) -> bool {
        if Self::is_pure_ack(data) {
            self.counter += 1;
            // Every 3rd ack vanishes; harsher than the 5% the protocol
            // has to survive.
            return self.counter % 3 != 0;
        }
        true
    }
}

#[test]
fn delivery_completes_despite_lost_acks() {
    init_tracing();
    let server = Transport::with_filter(fast_config(), Box::new(AckLossFilter { counter: 0 }))
        .unwrap();
    let listener = server.bind(None).unwrap();
    let (message_tx, message_rx) = unbounded();
    listener.on_accept(move |conn: Arc<Connection>| {
        let message_tx = message_tx.clone();
        conn.on_message(move |payload| {
            message_tx.send(payload.to_vec()).unwrap();
        });
    });

    let client = Transport::new(fast_config()).unwrap();
    let conn = client
        .open(
            server_addr(listener.local_port()),
            OpenOptions { timeout: Some(Duration::from_secs(5)), ..Default::default() },
        )
        .unwrap();

    let sent: Vec<Vec<u8>> = (0..10u8).map(|i| vec![i; 32]).collect();
    for message in &sent {
        // Retry on backpressure; lost acks may keep the window full
        // briefly.
        loop {
            match conn.send(message).unwrap() {
                SendStatus::Sent => break,
                SendStatus::WindowFull => std::thread::sleep(Duration::from_millis(10)),
            }
        }
    }

    let mut delivered = Vec::new();
    loop {
        match message_rx.recv_timeout(Duration::from_secs(10)) {
            Ok(message) => {
                if !delivered.contains(&message) {
                    delivered.push(message);
                }
                if delivered.len() == sent.len() {
                    break;
                }
            }
            Err(RecvTimeoutError::Timeout) => panic!(
                "only {} of {} messages arrived within the giveup window",
                delivered.len(),
                sent.len()
            ),
            Err(RecvTimeoutError::Disconnected) => panic!("server dropped"),
        }
    }
    for message in &sent {
        assert!(delivered.contains(message));
    }
}

#[test]
fn two_clients_share_one_listener() {
    let (server, port, messages, _resets) = echo_server(fast_config());
    let client_a = Transport::new(fast_config()).unwrap();
    let client_b = Transport::new(fast_config()).unwrap();

    let conn_a = client_a
        .open(server_addr(port), OpenOptions { timeout: Some(Duration::from_secs(5)), ..Default::default() })
        .unwrap();
    let conn_b = client_b
        .open(server_addr(port), OpenOptions { timeout: Some(Duration::from_secs(5)), ..Default::default() })
        .unwrap();

    conn_a.send(b"from a").unwrap();
    conn_b.send(b"from b").unwrap();

    let mut received = Vec::new();
    for _ in 0..2 {
        received.push(messages.recv_timeout(Duration::from_secs(5)).unwrap());
    }
    assert!(received.contains(&b"from a".to_vec()));
    assert!(received.contains(&b"from b".to_vec()));
    drop(server);
}

#[test]
fn accepted_connection_reaches_the_accept_callback() {
    let server = Transport::new(fast_config()).unwrap();
    let listener = server.bind(None).unwrap();
    let accepted: Arc<Mutex<Vec<SocketAddr>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = accepted.clone();
    listener.on_accept(move |conn| {
        sink.lock().unwrap().push(conn.remote_addr());
    });

    let client = Transport::new(fast_config()).unwrap();
    let conn = client
        .open(
            server_addr(listener.local_port()),
            OpenOptions { timeout: Some(Duration::from_secs(5)), ..Default::default() },
        )
        .unwrap();

    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while accepted.lock().unwrap().is_empty() && std::time::Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    let accepted = accepted.lock().unwrap();
    assert_eq!(accepted.len(), 1);
    assert_eq!(accepted[0].port(), conn.local_port());
}
