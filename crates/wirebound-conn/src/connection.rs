//! The per-connection RDP state machine.
//!
//! One `Connection` tracks both directions of a single RDP conversation:
//! handshake progress, send sequencing and the unacked retransmission
//! queue, receive ordering with the eack set, outbound shaping, and
//! reassembly. Every entry point takes the current time and returns the
//! [`Action`]s the transport must apply; the connection itself never
//! touches a socket.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    time::Instant,
};

use tracing::{debug, warn};
use wirebound_core::{
    config::Config,
    error::{ErrorKind, Result},
};
use wirebound_protocol::{
    codec,
    packet::{Packet, SynParams},
    payload::{self, Payload},
    seq::{seq_at_least, seq_distance, seq_greater_than, SequenceNumber},
};

use crate::{
    event::{Action, ConnEvent},
    reassembly::Reassembly,
    shaper::Shaper,
    state::ConnectionState,
};

/// Outcome of a non-blocking send attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    /// The message was accepted and packetized (or queued behind a
    /// partially flushed batch).
    Sent,
    /// The outstanding window is full; try again after acks arrive.
    /// Not an error, and nothing was enqueued.
    WindowFull,
}

/// One transmitted-but-unacknowledged packet.
///
/// Retransmission replays `bytes` verbatim: same sequence number, same
/// header, no new sequence consumed.
#[derive(Debug)]
struct SentPacket {
    seq: SequenceNumber,
    bytes: Vec<u8>,
    /// First transmission, for giveup accounting.
    first_sent: Instant,
    /// Most recent (re)transmission, for resend pacing.
    last_sent: Instant,
}

/// State for one RDP connection sharing a UDP socket with others.
#[derive(Debug)]
pub struct Connection {
    config: Config,
    state: ConnectionState,
    /// Ordered delivery required on this connection (set by the initiator
    /// and carried in the SYN).
    sequenced: bool,

    // Send side.
    init_send_seq: SequenceNumber,
    next_send_seq: SequenceNumber,
    unacked_seq: SequenceNumber,
    /// Outstanding window granted by the peer's SYN.
    peer_window: u16,
    /// Largest payload the peer accepts per packet, from its SYN.
    peer_max_segment: u16,
    /// Unacknowledged packets in send order, oldest first.
    unacked: VecDeque<SentPacket>,
    shaper: Shaper,

    // Receive side.
    init_recv_seq: SequenceNumber,
    last_in_order: SequenceNumber,
    /// Window we advertised; inbound sequences more than twice this far
    /// ahead are invalid.
    recv_window: u16,
    /// Out-of-order sequences received and pending acknowledgment.
    eack_set: HashSet<SequenceNumber>,
    /// Payloads held back for in-order delivery; populated only when
    /// `sequenced`.
    ordering_queue: HashMap<SequenceNumber, Vec<u8>>,
    reassembly: Reassembly,

    last_send_activity: Instant,
    last_recv_activity: Instant,
    close_wait_since: Option<Instant>,
    reset_emitted: bool,
    opened_emitted: bool,
}

impl Connection {
    fn new(config: Config, sequenced: bool, init_seq: SequenceNumber, now: Instant) -> Self {
        let recv_window = config.max_outstanding;
        let peer_max_segment = config.max_segment_size;
        Connection {
            config,
            state: ConnectionState::Closed,
            sequenced,
            init_send_seq: init_seq,
            next_send_seq: init_seq,
            unacked_seq: init_seq,
            peer_window: recv_window,
            peer_max_segment,
            unacked: VecDeque::new(),
            shaper: Shaper::new(),
            init_recv_seq: 0,
            last_in_order: 0,
            recv_window,
            eack_set: HashSet::new(),
            ordering_queue: HashMap::new(),
            reassembly: Reassembly::new(),
            last_send_activity: now,
            last_recv_activity: now,
            close_wait_since: None,
            reset_emitted: false,
            opened_emitted: false,
        }
    }

    /// Active open: builds the connection in `SynSent` with its SYN on the
    /// wire (and in the unacked queue, so the sweep retransmits it).
    pub fn open_active(
        config: Config,
        sequenced: bool,
        init_seq: SequenceNumber,
        now: Instant,
    ) -> (Self, Vec<Action>) {
        let mut conn = Self::new(config, sequenced, init_seq, now);
        conn.state = ConnectionState::SynSent;
        let packet = Packet::syn(init_seq, conn.local_syn_params());
        let actions = vec![Action::Send(conn.transmit_tracked(packet, now))];
        (conn, actions)
    }

    /// Passive open: seeds a `SynRcvd` connection from a peer's SYN and
    /// answers with SYN+ACK. The caller has already verified `syn` carries
    /// the SYN flag and parameters.
    pub fn open_passive(
        config: Config,
        syn: &Packet,
        init_seq: SequenceNumber,
        now: Instant,
    ) -> (Self, Vec<Action>) {
        let params = syn.syn.expect("passive open requires SYN parameters");
        let mut conn = Self::new(config, params.sequenced, init_seq, now);
        conn.state = ConnectionState::SynRcvd;
        conn.peer_window = params.window;
        conn.peer_max_segment = params.max_segment;
        conn.init_recv_seq = syn.seq;
        conn.last_in_order = syn.seq;

        let reply = Packet::syn_ack(init_seq, syn.seq, conn.local_syn_params());
        let actions = vec![Action::Send(conn.transmit_tracked(reply, now))];
        (conn, actions)
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Whether this connection delivers in send order.
    pub fn is_sequenced(&self) -> bool {
        self.sequenced
    }

    /// Packets sent but not yet acknowledged.
    pub fn in_flight(&self) -> u32 {
        seq_distance(self.next_send_seq, self.unacked_seq)
    }

    /// Remaining room in the peer's outstanding window.
    pub fn window_available(&self) -> u32 {
        (self.peer_window as u32).saturating_sub(self.in_flight())
    }

    /// Queues one message for delivery to the peer.
    ///
    /// Returns [`SendStatus::WindowFull`] without queueing anything when
    /// the message's packets do not fit the outstanding window. Fails with
    /// [`ErrorKind::NotOpen`] outside the `Open` state.
    pub fn send(&mut self, message: Vec<u8>, now: Instant) -> Result<(SendStatus, Vec<Action>)> {
        if !self.state.is_open() {
            return Err(ErrorKind::NotOpen);
        }
        let needed = Shaper::packets_needed(message.len(), self.max_payload());
        if needed > self.config.max_fragments as usize {
            return Err(ErrorKind::MessageTooLarge(message.len()));
        }
        if needed as u32 > self.window_available() {
            return Ok((SendStatus::WindowFull, Vec::new()));
        }
        self.shaper.enqueue(message);
        let actions = self.flush(now);
        Ok((SendStatus::Sent, actions))
    }

    /// Queues a batch of messages in one call, letting small ones share
    /// aggregate packets. Messages that do not fit the current window stay
    /// queued and go out as acks open it.
    pub fn send_all(
        &mut self,
        messages: Vec<Vec<u8>>,
        now: Instant,
    ) -> Result<(SendStatus, Vec<Action>)> {
        if !self.state.is_open() {
            return Err(ErrorKind::NotOpen);
        }
        if self.window_available() == 0 {
            return Ok((SendStatus::WindowFull, Vec::new()));
        }
        let max_payload = self.max_payload();
        for message in &messages {
            if Shaper::packets_needed(message.len(), max_payload)
                > self.config.max_fragments as usize
            {
                return Err(ErrorKind::MessageTooLarge(message.len()));
            }
        }
        for message in messages {
            self.shaper.enqueue(message);
        }
        let actions = self.flush(now);
        Ok((SendStatus::Sent, actions))
    }

    /// Initiates a local close: RST to the peer, `CloseWait` here, one
    /// reset event. No-op if already closing.
    pub fn close(&mut self, now: Instant) -> Vec<Action> {
        let mut actions = Vec::new();
        if matches!(self.state, ConnectionState::Closed | ConnectionState::CloseWait) {
            return actions;
        }
        let rst = Packet::rst(self.next_send_seq, self.last_in_order);
        actions.push(Action::Send(codec::encode(&rst)));
        self.enter_close_wait(now, &mut actions);
        actions
    }

    /// Feeds one decoded inbound packet through the state machine.
    pub fn process_packet(&mut self, packet: Packet, now: Instant) -> Vec<Action> {
        let mut actions = Vec::new();
        self.last_recv_activity = now;

        if packet.flags.is_rst() {
            self.enter_close_wait(now, &mut actions);
            return actions;
        }
        if matches!(self.state, ConnectionState::CloseWait | ConnectionState::Closed) {
            return actions;
        }
        if self.state == ConnectionState::SynSent {
            self.handle_syn_reply(&packet, &mut actions);
            return actions;
        }
        if packet.flags.is_syn() {
            self.handle_duplicate_syn(&packet, now, &mut actions);
            return actions;
        }

        // Sequence validation comes first: a stale or invalid packet is
        // dropped whole, piggybacked ack included.
        let carries_seq = packet.flags.is_nul() || !packet.payload.is_empty();
        if carries_seq {
            if seq_at_least(self.last_in_order, packet.seq) {
                // Duplicate: the peer may have missed our ack. Repeat it,
                // never re-deliver.
                actions.push(self.pure_ack());
                return actions;
            }
            if seq_distance(packet.seq, self.last_in_order) > 2 * self.recv_window as u32 {
                warn!(
                    seq = packet.seq,
                    last_in_order = self.last_in_order,
                    "dropping packet beyond twice the receive window"
                );
                return actions;
            }
        }

        if packet.flags.is_ack() {
            self.apply_ack(packet.ack, &mut actions);
        }
        for eack in &packet.eacks {
            self.apply_eack(*eack);
        }

        if carries_seq {
            self.receive_in_sequence(packet, now, &mut actions);
        }
        actions
    }

    /// Periodic duties driven by the retry sweep: retransmission, giveup,
    /// pending flush, keepalive, reassembly expiry.
    pub fn tick(&mut self, now: Instant) -> Vec<Action> {
        let mut actions = Vec::new();
        if matches!(self.state, ConnectionState::CloseWait | ConnectionState::Closed) {
            return actions;
        }

        // Giveup beats retransmission: the peer is presumed unreachable.
        let gave_up = self
            .unacked
            .front()
            .is_some_and(|oldest| now.duration_since(oldest.first_sent) >= self.config.giveup_timeout);
        if gave_up {
            warn!(in_flight = self.in_flight(), "giving up on unacknowledged packets, resetting");
            let rst = Packet::rst(self.next_send_seq, self.last_in_order);
            actions.push(Action::Send(codec::encode(&rst)));
            self.enter_close_wait(now, &mut actions);
            return actions;
        }

        let mut resent = false;
        for entry in self.unacked.iter_mut() {
            if now.duration_since(entry.last_sent) >= self.config.resend_threshold {
                entry.last_sent = now;
                actions.push(Action::Send(entry.bytes.clone()));
                resent = true;
            }
        }
        if resent {
            self.last_send_activity = now;
        }

        if self.state.is_open() {
            actions.extend(self.flush(now));

            if now.duration_since(self.last_send_activity) >= self.config.keepalive_interval
                && self.window_available() > 0
            {
                let seq = self.consume_sequence();
                let nul = Packet::nul(seq, self.last_in_order);
                actions.push(Action::Send(self.transmit_tracked(nul, now)));
            }
        }

        self.reassembly.expire_stale(now, self.config.reassembly_timeout);
        actions
    }

    /// True once a `CloseWait` connection has lingered past the close-wait
    /// window and should be dropped from the registry.
    pub fn should_purge(&self, now: Instant) -> bool {
        match self.close_wait_since {
            Some(since) => now.duration_since(since) >= self.config.close_wait_timeout,
            None => false,
        }
    }

    // ------------------------------------------------------------------
    // Handshake
    // ------------------------------------------------------------------

    fn local_syn_params(&self) -> SynParams {
        SynParams {
            window: self.recv_window,
            max_segment: self.config.max_segment_size,
            sequenced: self.sequenced,
        }
    }

    fn handle_syn_reply(&mut self, packet: &Packet, actions: &mut Vec<Action>) {
        let acks_our_syn = packet.flags.is_ack() && seq_at_least(packet.ack, self.init_send_seq);
        let params = match packet.syn {
            Some(params) if acks_our_syn => params,
            _ => {
                debug!(flags = ?packet.flags, "ignoring packet while awaiting SYN reply");
                return;
            }
        };

        self.peer_window = params.window;
        self.peer_max_segment = params.max_segment;
        self.init_recv_seq = packet.seq;
        self.last_in_order = packet.seq;
        self.apply_ack(packet.ack, actions);
        self.state = ConnectionState::Open;
        self.emit_opened(actions);
        actions.push(self.pure_ack());
    }

    fn handle_duplicate_syn(&mut self, packet: &Packet, now: Instant, actions: &mut Vec<Action>) {
        if packet.seq != self.init_recv_seq {
            debug!(seq = packet.seq, "dropping SYN with unexpected sequence");
            return;
        }
        // The peer has not seen our answer. In SynRcvd the SYN+ACK is
        // still unacked: replay it. Once open, a fresh ack suffices.
        if let Some(entry) = self.unacked.iter_mut().find(|e| e.seq == self.init_send_seq) {
            entry.last_sent = now;
            actions.push(Action::Send(entry.bytes.clone()));
        } else {
            actions.push(self.pure_ack());
        }
    }

    // ------------------------------------------------------------------
    // Acknowledgment
    // ------------------------------------------------------------------

    fn apply_ack(&mut self, ack: SequenceNumber, actions: &mut Vec<Action>) {
        let advanced = ack.wrapping_add(1);
        if seq_greater_than(advanced, self.unacked_seq) {
            self.unacked_seq = advanced;
        }
        while let Some(front) = self.unacked.front() {
            if seq_at_least(ack, front.seq) {
                self.unacked.pop_front();
            } else {
                break;
            }
        }
        if self.state == ConnectionState::SynRcvd && seq_at_least(ack, self.init_send_seq) {
            self.state = ConnectionState::Open;
            self.emit_opened(actions);
        }
    }

    fn apply_eack(&mut self, eack: SequenceNumber) {
        // Selective ack: that one packet arrived; the window base stays.
        self.unacked.retain(|entry| entry.seq != eack);
    }

    // ------------------------------------------------------------------
    // Receive path
    // ------------------------------------------------------------------

    /// Accepts a validated data/NUL packet into the receive sequence.
    fn receive_in_sequence(&mut self, packet: Packet, now: Instant, actions: &mut Vec<Action>) {
        let seq = packet.seq;
        if seq == self.last_in_order.wrapping_add(1) {
            self.last_in_order = seq;
            if !packet.payload.is_empty() {
                self.deliver(packet.payload, now, actions);
            }
            // Pull any already-received successors out of the eack set.
            loop {
                let next = self.last_in_order.wrapping_add(1);
                if !self.eack_set.remove(&next) {
                    break;
                }
                self.last_in_order = next;
                if let Some(buffered) = self.ordering_queue.remove(&next) {
                    self.deliver(buffered, now, actions);
                }
            }
        } else if self.eack_set.insert(seq) {
            if !packet.payload.is_empty() {
                if self.sequenced {
                    self.ordering_queue.insert(seq, packet.payload);
                } else {
                    // Unsequenced connections hand payloads over as they
                    // arrive; the eack entry only suppresses retransmission.
                    self.deliver(packet.payload, now, actions);
                }
            }
        }

        actions.push(self.pure_ack());
    }

    fn deliver(&mut self, framed: Vec<u8>, now: Instant, actions: &mut Vec<Action>) {
        match payload::decode(&framed) {
            Ok(Payload::Message(message)) => {
                actions.push(Action::Emit(ConnEvent::Message(message)));
            }
            Ok(Payload::Fragment { group, index, count, bytes }) => {
                if let Some(message) = self.reassembly.insert(group, index, count, bytes, now) {
                    actions.push(Action::Emit(ConnEvent::Message(message)));
                }
            }
            Ok(Payload::Aggregate(messages)) => {
                for message in messages {
                    actions.push(Action::Emit(ConnEvent::Message(message)));
                }
            }
            Err(err) => warn!(%err, "dropping undecodable payload"),
        }
    }

    // ------------------------------------------------------------------
    // Transmission
    // ------------------------------------------------------------------

    fn max_payload(&self) -> usize {
        self.config.max_segment_size.min(self.peer_max_segment) as usize
    }

    fn consume_sequence(&mut self) -> SequenceNumber {
        let seq = self.next_send_seq;
        self.next_send_seq = self.next_send_seq.wrapping_add(1);
        seq
    }

    /// Encodes, tracks for retransmission, and stamps send activity.
    fn transmit_tracked(&mut self, packet: Packet, now: Instant) -> Vec<u8> {
        debug_assert!(packet.consumes_sequence());
        let bytes = codec::encode(&packet);
        self.unacked.push_back(SentPacket {
            seq: packet.seq,
            bytes: bytes.clone(),
            first_sent: now,
            last_sent: now,
        });
        self.last_send_activity = now;
        bytes
    }

    fn flush(&mut self, now: Instant) -> Vec<Action> {
        let mut actions = Vec::new();
        if self.shaper.is_empty() {
            return actions;
        }
        let budget = self.window_available() as usize;
        let max_payload = self.max_payload();
        for framed in self.shaper.next_payloads(max_payload, budget) {
            let seq = self.consume_sequence();
            let packet = Packet::data(seq, self.last_in_order, self.current_eacks(), framed);
            actions.push(Action::Send(self.transmit_tracked(packet, now)));
        }
        actions
    }

    fn pure_ack(&self) -> Action {
        let packet = Packet::ack(self.next_send_seq, self.last_in_order, self.current_eacks());
        Action::Send(codec::encode(&packet))
    }

    /// Out-of-order sequences to advertise, oldest first, capped to the
    /// count field.
    fn current_eacks(&self) -> Vec<SequenceNumber> {
        let mut eacks: Vec<SequenceNumber> = self.eack_set.iter().copied().collect();
        eacks.sort_unstable_by_key(|seq| seq.wrapping_sub(self.last_in_order));
        eacks.truncate(u8::MAX as usize);
        eacks
    }

    // ------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------

    fn enter_close_wait(&mut self, now: Instant, actions: &mut Vec<Action>) {
        if self.state != ConnectionState::CloseWait {
            debug!(state = ?self.state, "entering close-wait");
            self.state = ConnectionState::CloseWait;
            self.close_wait_since = Some(now);
        }
        if !self.reset_emitted {
            self.reset_emitted = true;
            actions.push(Action::Emit(ConnEvent::Reset));
        }
    }

    fn emit_opened(&mut self, actions: &mut Vec<Action>) {
        if !self.opened_emitted {
            self.opened_emitted = true;
            actions.push(Action::Emit(ConnEvent::Opened));
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn config() -> Config {
        Config::default()
    }

    fn now() -> Instant {
        Instant::now()
    }

    /// Runs a two-sided handshake and returns both open connections.
    fn open_pair(sequenced: bool) -> (Connection, Connection) {
        let start = now();
        let (mut initiator, actions) = Connection::open_active(config(), sequenced, 100, start);
        let syn = decode_sent(&actions[0]);

        let (mut acceptor, actions) = Connection::open_passive(config(), &syn, 500, start);
        let syn_ack = decode_sent(&actions[0]);

        let actions = initiator.process_packet(syn_ack, start);
        assert!(actions.contains(&Action::Emit(ConnEvent::Opened)));
        let ack = decode_sent(actions.last().unwrap());

        let actions = acceptor.process_packet(ack, start);
        assert!(actions.contains(&Action::Emit(ConnEvent::Opened)));

        assert!(initiator.state().is_open());
        assert!(acceptor.state().is_open());
        (initiator, acceptor)
    }

    fn decode_sent(action: &Action) -> Packet {
        match action {
            Action::Send(bytes) => codec::decode(bytes).unwrap(),
            other => panic!("expected a send action, got {:?}", other),
        }
    }

    fn sent_packets(actions: &[Action]) -> Vec<Packet> {
        actions
            .iter()
            .filter_map(|a| match a {
                Action::Send(bytes) => Some(codec::decode(bytes).unwrap()),
                Action::Emit(_) => None,
            })
            .collect()
    }

    fn messages(actions: &[Action]) -> Vec<Vec<u8>> {
        actions
            .iter()
            .filter_map(|a| match a {
                Action::Emit(ConnEvent::Message(m)) => Some(m.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn handshake_opens_both_sides() {
        let (initiator, acceptor) = open_pair(false);
        assert_eq!(initiator.in_flight(), 0);
        assert_eq!(acceptor.in_flight(), 0);
    }

    #[test]
    fn handshake_acks_clear_the_syn() {
        let (initiator, acceptor) = open_pair(false);
        // The initiator's SYN was acked by SYN+ACK; the acceptor's SYN+ACK
        // was acked by the final pure ack.
        assert_eq!(initiator.window_available(), initiator.peer_window as u32);
        assert_eq!(acceptor.unacked.len(), 0);
    }

    #[test]
    fn send_requires_open() {
        let start = now();
        let (mut conn, _) = Connection::open_active(config(), false, 1, start);
        assert!(matches!(conn.send(vec![1], start), Err(ErrorKind::NotOpen)));
    }

    #[test]
    fn message_travels_and_is_acked() {
        let (mut sender, mut receiver) = open_pair(false);
        let start = now();

        let (status, actions) = sender.send(b"payload".to_vec(), start).unwrap();
        assert_eq!(status, SendStatus::Sent);
        assert_eq!(sender.in_flight(), 1);

        let data = decode_sent(&actions[0]);
        let reply = receiver.process_packet(data, start);
        assert_eq!(messages(&reply), vec![b"payload".to_vec()]);

        // Feed the ack back: the sender's unacked queue drains.
        let ack = decode_sent(reply.last().unwrap());
        sender.process_packet(ack, start);
        assert_eq!(sender.in_flight(), 0);
    }

    #[test]
    fn window_full_is_backpressure_not_error() {
        let mut cfg = config();
        cfg.max_outstanding = 2;
        let start = now();

        // Build a pair where the acceptor only grants a window of 2.
        let (mut initiator, actions) = Connection::open_active(config(), false, 100, start);
        let syn = decode_sent(&actions[0]);
        let (mut acceptor, actions) = Connection::open_passive(cfg, &syn, 500, start);
        let syn_ack = decode_sent(&actions[0]);
        let actions = initiator.process_packet(syn_ack, start);
        acceptor.process_packet(decode_sent(actions.last().unwrap()), start);

        assert_eq!(initiator.window_available(), 2);
        assert!(matches!(initiator.send(vec![1], start), Ok((SendStatus::Sent, _))));
        assert!(matches!(initiator.send(vec![2], start), Ok((SendStatus::Sent, _))));
        assert!(matches!(initiator.send(vec![3], start), Ok((SendStatus::WindowFull, _))));
        assert_eq!(initiator.in_flight(), 2);
    }

    #[test]
    fn duplicate_data_is_reacked_but_not_redelivered() {
        let (mut sender, mut receiver) = open_pair(false);
        let start = now();

        let (_, actions) = sender.send(b"once".to_vec(), start).unwrap();
        let data = decode_sent(&actions[0]);

        let first = receiver.process_packet(data.clone(), start);
        assert_eq!(messages(&first).len(), 1);

        let replay = receiver.process_packet(data, start);
        assert!(messages(&replay).is_empty());
        // Still acknowledged so the sender stops retransmitting.
        let acks = sent_packets(&replay);
        assert_eq!(acks.len(), 1);
        assert!(acks[0].flags.is_ack());
    }

    #[test]
    fn out_of_order_nonsequenced_delivers_immediately() {
        let (mut sender, mut receiver) = open_pair(false);
        let start = now();

        let (_, a1) = sender.send(b"first".to_vec(), start).unwrap();
        let (_, a2) = sender.send(b"second".to_vec(), start).unwrap();
        let p1 = decode_sent(&a1[0]);
        let p2 = decode_sent(&a2[0]);

        // Deliver the second packet first.
        let out_of_order = receiver.process_packet(p2, start);
        assert_eq!(messages(&out_of_order), vec![b"second".to_vec()]);
        // Its sequence is advertised as an eack until the gap closes.
        let acks = sent_packets(&out_of_order);
        assert_eq!(acks[0].eacks.len(), 1);

        let fill = receiver.process_packet(p1, start);
        assert_eq!(messages(&fill), vec![b"first".to_vec()]);
        // Gap closed: no more eacks advertised.
        assert!(sent_packets(&fill)[0].eacks.is_empty());
    }

    #[test]
    fn out_of_order_sequenced_buffers_until_contiguous() {
        let (mut sender, mut receiver) = open_pair(true);
        let start = now();

        let (_, a1) = sender.send(b"first".to_vec(), start).unwrap();
        let (_, a2) = sender.send(b"second".to_vec(), start).unwrap();
        let (_, a3) = sender.send(b"third".to_vec(), start).unwrap();

        let p1 = decode_sent(&a1[0]);
        let p2 = decode_sent(&a2[0]);
        let p3 = decode_sent(&a3[0]);

        assert!(messages(&receiver.process_packet(p3, start)).is_empty());
        assert!(messages(&receiver.process_packet(p2, start)).is_empty());
        // The gap-filling packet releases everything, in order.
        let released = receiver.process_packet(p1, start);
        assert_eq!(
            messages(&released),
            vec![b"first".to_vec(), b"second".to_vec(), b"third".to_vec()]
        );
    }

    #[test]
    fn eack_purges_without_advancing_window_base() {
        let (mut sender, mut receiver) = open_pair(false);
        let start = now();

        let (_, a1) = sender.send(b"one".to_vec(), start).unwrap();
        let (_, a2) = sender.send(b"two".to_vec(), start).unwrap();
        let p2 = decode_sent(&a2[0]);
        let _p1 = decode_sent(&a1[0]);

        // Only the second packet arrives; the receiver's ack carries it as
        // an eack while the cumulative ack stays put.
        let reply = receiver.process_packet(p2, start);
        let ack = decode_sent(reply.last().unwrap());
        assert_eq!(ack.eacks.len(), 1);

        let base_before = sender.unacked_seq;
        sender.process_packet(ack, start);
        // The eacked packet left the retransmission queue, but the window
        // base did not move past the missing packet.
        assert_eq!(sender.unacked.len(), 1);
        assert_eq!(sender.unacked_seq, base_before);
    }

    #[test]
    fn repeated_rst_emits_reset_once() {
        let (mut conn, _) = open_pair(false);
        let start = now();
        let rst = Packet::rst(999, 0);

        let mut resets = 0;
        for _ in 0..3 {
            let actions = conn.process_packet(rst.clone(), start);
            resets += actions.iter().filter(|a| **a == Action::Emit(ConnEvent::Reset)).count();
        }
        assert_eq!(resets, 1);
        assert!(conn.state().is_closing());
    }

    #[test]
    fn local_close_sends_rst_and_resets_once() {
        let (mut conn, _) = open_pair(false);
        let start = now();

        let actions = conn.close(start);
        let packets = sent_packets(&actions);
        assert!(packets[0].flags.is_rst());
        assert_eq!(
            actions.iter().filter(|a| **a == Action::Emit(ConnEvent::Reset)).count(),
            1
        );
        // Closing again is a no-op.
        assert!(conn.close(start).is_empty());
    }

    #[test]
    fn resend_replays_identical_bytes() {
        let (mut sender, _receiver) = open_pair(false);
        let start = now();

        let (_, actions) = sender.send(b"retry me".to_vec(), start).unwrap();
        let Action::Send(original) = &actions[0] else { panic!("expected send") };

        let later = start + Duration::from_millis(600);
        let resent = sender.tick(later);
        let replayed: Vec<&Vec<u8>> = resent
            .iter()
            .filter_map(|a| match a {
                Action::Send(bytes) => Some(bytes),
                _ => None,
            })
            .collect();
        assert_eq!(replayed.len(), 1);
        assert_eq!(replayed[0], original);

        // Not old enough again right away.
        assert!(sender.tick(later + Duration::from_millis(100)).is_empty());
    }

    #[test]
    fn giveup_forces_reset() {
        let (mut sender, _receiver) = open_pair(false);
        let start = now();
        sender.send(b"never acked".to_vec(), start).unwrap();

        let later = start + Duration::from_secs(31);
        let actions = sender.tick(later);
        assert!(actions.iter().any(|a| matches!(a, Action::Emit(ConnEvent::Reset))));
        let packets = sent_packets(&actions);
        assert!(packets.iter().any(|p| p.flags.is_rst()));
        assert!(sender.state().is_closing());

        // Purged once the close-wait window passes.
        assert!(!sender.should_purge(later));
        assert!(sender.should_purge(later + Duration::from_secs(30)));
    }

    #[test]
    fn idle_open_connection_sends_keepalive() {
        let (mut conn, mut peer) = open_pair(false);
        let start = now();

        let later = start + Duration::from_secs(31);
        let actions = conn.tick(later);
        let packets = sent_packets(&actions);
        assert_eq!(packets.len(), 1);
        assert!(packets[0].flags.is_nul());

        // The keepalive consumes a sequence and is acknowledged like data.
        let reply = peer.process_packet(packets[0].clone(), later);
        assert!(messages(&reply).is_empty());
        let ack = decode_sent(reply.last().unwrap());
        conn.process_packet(ack, later);
        assert_eq!(conn.in_flight(), 0);
    }

    #[test]
    fn fragmented_message_round_trips() {
        let (mut sender, mut receiver) = open_pair(false);
        let start = now();
        let message: Vec<u8> = (0..4000u16).map(|i| (i % 251) as u8).collect();

        let (status, actions) = sender.send(message.clone(), start).unwrap();
        assert_eq!(status, SendStatus::Sent);
        let packets = sent_packets(&actions);
        assert_eq!(packets.len(), 4);

        // Deliver in a scrambled order.
        let mut delivered = Vec::new();
        for idx in [2usize, 0, 3, 1] {
            let reply = receiver.process_packet(packets[idx].clone(), start);
            delivered.extend(messages(&reply));
        }
        assert_eq!(delivered, vec![message]);
    }

    #[test]
    fn batched_small_messages_aggregate() {
        let (mut sender, mut receiver) = open_pair(false);
        let start = now();
        let batch = vec![b"alpha".to_vec(), b"beta".to_vec(), b"gamma".to_vec()];

        let (status, actions) = sender.send_all(batch.clone(), start).unwrap();
        assert_eq!(status, SendStatus::Sent);
        let packets = sent_packets(&actions);
        assert_eq!(packets.len(), 1, "three small messages share one packet");

        let reply = receiver.process_packet(packets[0].clone(), start);
        assert_eq!(messages(&reply), batch);
    }

    #[test]
    fn far_future_sequence_is_dropped() {
        let (mut sender, mut receiver) = open_pair(false);
        let start = now();

        let (_, actions) = sender.send(b"x".to_vec(), start).unwrap();
        let mut packet = decode_sent(&actions[0]);
        packet.seq = packet.seq.wrapping_add(10_000);

        let reply = receiver.process_packet(packet, start);
        // Invalid: no delivery, not even an ack.
        assert!(reply.is_empty());
    }
}
