use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use bytes::Bytes;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::packet_io::PacketIo;
use crate::peer_addr::PeerAddr;
use crate::segment::{Segment, SegmentFlags};

/// Retransmit timeout before the first RTT measurement exists.
const INITIAL_RETRANSMIT_TIMEOUT: Duration = Duration::from_secs(1);
const MIN_RETRANSMIT_TIMEOUT: Duration = Duration::from_millis(250);
const MAX_RETRANSMIT_TIMEOUT: Duration = Duration::from_secs(3);
const RTT_MOVING_AVG_NEW_WEIGHT: f64 = 0.5;

/// A segment resent this many times without an ack closes the stream.
const MAX_RETRANSMITS: u32 = 8;

/// Deliberately shorter than common NAT UDP binding timeouts: if nothing arrived for this long,
///  the path is gone and pretending otherwise only delays the reconnect.
const DEAD_AFTER: Duration = Duration::from_secs(15);

/// Idle Established streams probe the peer (and keep the NAT mapping warm) at this interval.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(10);

const TIMED_WAIT_TIMEOUT: Duration = Duration::from_secs(30);

/// Fixed advertised receive window in bytes. Small by design - this transport carries request /
///  response traffic between two desktop peers, not bulk pipes.
const RECEIVE_WINDOW: u16 = 16_384;

/// TCP's connection states, minus nothing: the full open and close handshakes apply even though
///  the carrier is UDP.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum StreamState {
    Closed,
    Listen,
    SynSent,
    SynRcvd,
    Established,
    FinWait1,
    FinWait2,
    Closing,
    TimedWait,
    CloseWait,
    LastAck,
}

impl StreamState {
    pub fn is_open(&self) -> bool {
        matches!(self, StreamState::Established | StreamState::CloseWait)
    }
}

/// Why a stream ended up in `Closed` without a clean handshake.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum CloseReason {
    /// retransmission exhaustion
    RetransmitLimit,
    /// nothing received for [DEAD_AFTER]
    PeerDead,
    /// peer sent RST
    Reset,
}

struct InFlight {
    segment: Segment,
    deadline: Instant,
    first_sent: Instant,
    retries: u32,
    retransmitted: bool,
}

struct ReliableStreamInner {
    peer_addr: PeerAddr,
    packet_io: Arc<PacketIo>,

    state: StreamState,
    close_reason: Option<CloseReason>,

    /// next sequence number to assign to outbound data
    send_next: u32,
    /// sequence number of our FIN once queued, for recognizing its ack
    fin_seq: Option<u32>,
    /// next sequence number expected from the peer
    recv_next: u32,
    peer_window: u16,

    /// sent but unacknowledged, keyed by sequence number
    unacked: BTreeMap<u32, InFlight>,
    /// sequenced but not yet sent (outside the peer's advertised window)
    pending_send: VecDeque<Segment>,
    /// received ahead of sequence, waiting for the gap to fill
    out_of_order: BTreeMap<u32, Segment>,
    /// in-order payload ready for the application
    readable: VecDeque<Bytes>,

    pending_ack: bool,
    last_received: Instant,
    last_sent: Instant,
    timed_wait_since: Option<Instant>,

    srtt: Option<Duration>,
    retransmit_timeout: Duration,
}

fn seq_lt(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}
fn seq_leq(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) <= 0
}

impl ReliableStreamInner {
    async fn send_segment(&mut self, segment: &Segment) {
        trace!("sending {:?} to {}", segment, self.peer_addr);
        self.packet_io.send_to(self.peer_addr, &segment.to_bytes()).await;
        self.last_sent = Instant::now();
    }

    async fn send_ack(&mut self) {
        let segment = Segment::control(SegmentFlags::ACK, self.send_next, self.recv_next, RECEIVE_WINDOW);
        self.send_segment(&segment).await;
        self.pending_ack = false;
    }

    /// Queue a segment that needs reliable delivery. It enters the unacked buffer when actually
    ///  sent by [flush].
    fn enqueue(&mut self, segment: Segment) {
        self.send_next = self.send_next.wrapping_add(segment.seq_len());
        self.pending_send.push_back(segment);
    }

    fn in_flight_bytes(&self) -> usize {
        self.unacked.values()
            .map(|f| f.segment.payload.len())
            .sum()
    }

    /// Send queued segments as far as the peer's advertised window allows.
    async fn flush(&mut self) {
        while let Some(front) = self.pending_send.front() {
            let is_handshake = front.flags.intersects(SegmentFlags::SYN | SegmentFlags::FIN);
            if !is_handshake && self.in_flight_bytes() + front.payload.len() > self.peer_window as usize {
                trace!("peer window full for {}, deferring send", self.peer_addr);
                break;
            }
            let mut segment = self.pending_send.pop_front().unwrap();
            // piggyback the current ack on everything that goes out
            if self.state != StreamState::SynSent {
                segment.flags |= SegmentFlags::ACK;
                segment.ack = self.recv_next;
            }
            self.send_segment(&segment).await;
            self.pending_ack = false;

            let now = Instant::now();
            self.unacked.insert(segment.seq, InFlight {
                segment,
                deadline: now + self.retransmit_timeout,
                first_sent: now,
                retries: 0,
                retransmitted: false,
            });
        }
    }

    /// A cumulative ack releases every segment that lies entirely below it.
    fn on_ack(&mut self, ack: u32) {
        let now = Instant::now();
        let released = self.unacked.keys()
            .filter(|&&seq| {
                let end = seq.wrapping_add(self.unacked.get(&seq).map(|f| f.segment.seq_len()).unwrap_or(0));
                seq_leq(end, ack)
            })
            .cloned()
            .collect::<Vec<_>>();

        for seq in released {
            if let Some(in_flight) = self.unacked.remove(&seq) {
                if !in_flight.retransmitted {
                    self.update_rtt(now - in_flight.first_sent);
                }
            }
        }
    }

    fn update_rtt(&mut self, sample: Duration) {
        let smoothed = match self.srtt {
            Some(prev) => prev.mul_f64(1.0 - RTT_MOVING_AVG_NEW_WEIGHT) + sample.mul_f64(RTT_MOVING_AVG_NEW_WEIGHT),
            None => sample,
        };
        self.srtt = Some(smoothed);
        self.retransmit_timeout = (smoothed * 2).clamp(MIN_RETRANSMIT_TIMEOUT, MAX_RETRANSMIT_TIMEOUT);
    }

    /// True if the ack covers our FIN.
    fn fin_acked(&self, ack: u32) -> bool {
        match self.fin_seq {
            Some(fin_seq) => seq_leq(fin_seq.wrapping_add(1), ack),
            None => false,
        }
    }

    /// Accept a segment's payload, buffering out-of-order arrivals. Returns true if the segment
    ///  carried a FIN and that FIN is next in sequence (i.e. all data before it was consumed).
    fn accept_payload(&mut self, segment: Segment) -> bool {
        let has_fin = segment.flags.contains(SegmentFlags::FIN);
        if segment.payload.is_empty() && !has_fin {
            return false;
        }

        if seq_lt(segment.seq, self.recv_next) {
            // duplicate - our ack got lost, re-ack
            trace!("duplicate segment {} from {}, re-acking", segment.seq, self.peer_addr);
            self.pending_ack = true;
            return false;
        }

        if segment.seq != self.recv_next {
            trace!("out-of-order segment {} from {} (expected {})", segment.seq, self.peer_addr, self.recv_next);
            self.out_of_order.insert(segment.seq, segment);
            self.pending_ack = true;
            return false;
        }

        let mut fin_reached = self.consume_in_order(segment);

        // drain any previously buffered segments that are now contiguous
        while let Some((&seq, _)) = self.out_of_order.first_key_value() {
            if seq != self.recv_next {
                break;
            }
            let (_, segment) = self.out_of_order.pop_first().unwrap();
            fin_reached |= self.consume_in_order(segment);
        }

        self.pending_ack = true;
        fin_reached
    }

    fn consume_in_order(&mut self, segment: Segment) -> bool {
        debug_assert_eq!(segment.seq, self.recv_next);
        let has_fin = segment.flags.contains(SegmentFlags::FIN);
        self.recv_next = self.recv_next.wrapping_add(segment.seq_len());
        if !segment.payload.is_empty() {
            self.readable.push_back(segment.payload);
        }
        has_fin
    }

    fn close_with(&mut self, reason: CloseReason) {
        warn!("stream to {} closed: {:?}", self.peer_addr, reason);
        self.close_reason = Some(reason);
        self.state = StreamState::Closed;
        self.pending_send.clear();
        self.unacked.clear();
    }

    fn transition(&mut self, to: StreamState) {
        trace!("stream to {}: {:?} -> {:?}", self.peer_addr, self.state, to);
        self.state = to;
    }
}

/// A byte stream with TCP semantics carried in datagrams that the demultiplexer feeds in from
///  the shared UDP socket. One instance per remote address; datagrams from anyone else are
///  rejected.
///
/// Nothing here runs on its own: the owner calls [ReliableStream::tick] about once a second,
///  which drives retransmission, delayed acks, keep-alive and the timed-wait expiry. All calls
///  return promptly.
pub struct ReliableStream {
    inner: Arc<RwLock<ReliableStreamInner>>,
}

impl ReliableStream {
    pub fn new(packet_io: Arc<PacketIo>, peer_addr: PeerAddr) -> ReliableStream {
        let now = Instant::now();
        ReliableStream {
            inner: Arc::new(RwLock::new(ReliableStreamInner {
                peer_addr,
                packet_io,
                state: StreamState::Closed,
                close_reason: None,
                send_next: 0,
                fin_seq: None,
                recv_next: 0,
                peer_window: RECEIVE_WINDOW,
                unacked: BTreeMap::new(),
                pending_send: VecDeque::new(),
                out_of_order: BTreeMap::new(),
                readable: VecDeque::new(),
                pending_ack: false,
                last_received: now,
                last_sent: now,
                timed_wait_since: None,
                srtt: None,
                retransmit_timeout: INITIAL_RETRANSMIT_TIMEOUT,
            })),
        }
    }

    pub async fn peer_addr(&self) -> PeerAddr {
        self.inner.read().await.peer_addr
    }

    pub async fn state(&self) -> StreamState {
        self.inner.read().await.state
    }

    pub async fn close_reason(&self) -> Option<CloseReason> {
        self.inner.read().await.close_reason
    }

    /// Number of sent segments still awaiting an ack.
    pub async fn in_flight(&self) -> usize {
        self.inner.read().await.unacked.len()
    }

    /// Start the active open handshake. Non-blocking: callers poll [ReliableStream::state] for
    ///  `Established`, or for `Closed` with a [CloseReason] on failure.
    pub async fn connect(&self) -> anyhow::Result<()> {
        let mut inner = self.inner.write().await;
        if inner.state != StreamState::Closed {
            bail!("connect on a stream in state {:?}", inner.state);
        }
        inner.close_reason = None;
        inner.send_next = rand::random();
        inner.last_received = Instant::now();
        debug!("connecting to {} with initial sequence {}", inner.peer_addr, inner.send_next);

        let syn = Segment::control(SegmentFlags::SYN, inner.send_next, 0, RECEIVE_WINDOW);
        inner.enqueue(syn);
        inner.transition(StreamState::SynSent);
        inner.flush().await;
        Ok(())
    }

    /// Passive open: wait for the peer's SYN.
    pub async fn listen(&self) -> anyhow::Result<()> {
        let mut inner = self.inner.write().await;
        if inner.state != StreamState::Closed {
            bail!("listen on a stream in state {:?}", inner.state);
        }
        inner.close_reason = None;
        inner.send_next = rand::random();
        inner.transition(StreamState::Listen);
        Ok(())
    }

    /// Begin the close handshake (or abandon a connect in progress).
    pub async fn close(&self) {
        let mut inner = self.inner.write().await;
        match inner.state {
            StreamState::Established | StreamState::SynRcvd => {
                let fin = Segment::control(SegmentFlags::FIN, inner.send_next, 0, RECEIVE_WINDOW);
                inner.fin_seq = Some(inner.send_next);
                inner.enqueue(fin);
                inner.transition(StreamState::FinWait1);
                inner.flush().await;
            }
            StreamState::CloseWait => {
                let fin = Segment::control(SegmentFlags::FIN, inner.send_next, 0, RECEIVE_WINDOW);
                inner.fin_seq = Some(inner.send_next);
                inner.enqueue(fin);
                inner.transition(StreamState::LastAck);
                inner.flush().await;
            }
            StreamState::Listen | StreamState::SynSent => {
                inner.transition(StreamState::Closed);
            }
            _ => {}
        }
    }

    /// Tear the stream down immediately, telling the peer.
    pub async fn reset(&self) {
        let mut inner = self.inner.write().await;
        if inner.state == StreamState::Closed || inner.state == StreamState::Listen {
            inner.transition(StreamState::Closed);
            return;
        }
        let rst = Segment::control(SegmentFlags::RST, inner.send_next, inner.recv_next, 0);
        inner.send_segment(&rst).await;
        inner.close_with(CloseReason::Reset);
    }

    /// Queue bytes for reliable in-order delivery. Large writes are split into segments of at
    ///  most [Segment::MAX_PAYLOAD] bytes; delivery happens as the peer's window opens.
    pub async fn write(&self, data: &[u8]) -> anyhow::Result<()> {
        let mut inner = self.inner.write().await;
        if !inner.state.is_open() {
            bail!("write on a stream in state {:?}", inner.state);
        }
        for chunk in data.chunks(Segment::MAX_PAYLOAD) {
            let segment = Segment::new(
                SegmentFlags::ACK,
                inner.send_next,
                inner.recv_next,
                RECEIVE_WINDOW,
                Bytes::copy_from_slice(chunk),
            );
            inner.enqueue(segment);
        }
        inner.flush().await;
        Ok(())
    }

    /// Drain the next chunk of in-order received data, if any.
    pub async fn read(&self) -> Option<Bytes> {
        self.inner.write().await.readable.pop_front()
    }

    /// Feed one raw datagram from the demultiplexer into the state machine.
    pub async fn on_datagram(&self, from: PeerAddr, data: &[u8]) {
        let mut inner = self.inner.write().await;
        if from != inner.peer_addr {
            // the demultiplexer routes by address, so this is a wiring bug rather than traffic
            warn!("dropping datagram from {} on stream bound to {}", from, inner.peer_addr);
            return;
        }

        let segment = match Segment::try_deser(&mut &data[..]) {
            Ok(s) => s,
            Err(e) => {
                debug!("undecodable segment from {}: {}", from, e);
                return;
            }
        };

        inner.last_received = Instant::now();

        if segment.flags.contains(SegmentFlags::RST) {
            inner.close_with(CloseReason::Reset);
            return;
        }
        inner.peer_window = segment.window;

        let has_syn = segment.flags.contains(SegmentFlags::SYN);
        let has_ack = segment.flags.contains(SegmentFlags::ACK);

        match inner.state {
            StreamState::Closed => {
                debug!("datagram from {} on closed stream, ignoring", from);
            }

            StreamState::Listen => {
                if has_syn {
                    inner.recv_next = segment.seq.wrapping_add(1);
                    let syn_ack = Segment::control(SegmentFlags::SYN | SegmentFlags::ACK, inner.send_next, inner.recv_next, RECEIVE_WINDOW);
                    inner.enqueue(syn_ack);
                    inner.transition(StreamState::SynRcvd);
                    inner.flush().await;
                }
            }

            StreamState::SynSent => {
                if has_syn && has_ack {
                    inner.on_ack(segment.ack);
                    inner.recv_next = segment.seq.wrapping_add(1);
                    inner.transition(StreamState::Established);
                    inner.send_ack().await;
                }
                else if has_syn {
                    // simultaneous open
                    inner.recv_next = segment.seq.wrapping_add(1);
                    let syn_ack = Segment::control(SegmentFlags::SYN | SegmentFlags::ACK, inner.send_next.wrapping_sub(1), inner.recv_next, RECEIVE_WINDOW);
                    inner.send_segment(&syn_ack).await;
                    inner.transition(StreamState::SynRcvd);
                }
            }

            StreamState::SynRcvd => {
                if has_ack {
                    inner.on_ack(segment.ack);
                    if inner.unacked.is_empty() {
                        inner.transition(StreamState::Established);
                    }
                }
                if inner.state == StreamState::Established {
                    let fin = inner.accept_payload(segment);
                    if fin {
                        inner.transition(StreamState::CloseWait);
                        inner.send_ack().await;
                    }
                }
            }

            StreamState::Established => {
                if has_ack {
                    inner.on_ack(segment.ack);
                }
                let fin = inner.accept_payload(segment);
                if fin {
                    inner.transition(StreamState::CloseWait);
                    inner.send_ack().await;
                }
            }

            StreamState::FinWait1 => {
                if has_ack {
                    inner.on_ack(segment.ack);
                }
                let our_fin_acked = has_ack && inner.fin_acked(segment.ack);
                let fin = inner.accept_payload(segment);
                match (fin, our_fin_acked) {
                    (true, true) => {
                        inner.timed_wait_since = Some(Instant::now());
                        inner.transition(StreamState::TimedWait);
                        inner.send_ack().await;
                    }
                    (true, false) => {
                        inner.transition(StreamState::Closing);
                        inner.send_ack().await;
                    }
                    (false, true) => {
                        inner.transition(StreamState::FinWait2);
                    }
                    (false, false) => {}
                }
            }

            StreamState::FinWait2 => {
                if has_ack {
                    inner.on_ack(segment.ack);
                }
                let fin = inner.accept_payload(segment);
                if fin {
                    inner.timed_wait_since = Some(Instant::now());
                    inner.transition(StreamState::TimedWait);
                    inner.send_ack().await;
                }
            }

            StreamState::Closing => {
                if has_ack {
                    inner.on_ack(segment.ack);
                    if inner.fin_acked(segment.ack) {
                        inner.timed_wait_since = Some(Instant::now());
                        inner.transition(StreamState::TimedWait);
                    }
                }
            }

            StreamState::CloseWait => {
                if has_ack {
                    inner.on_ack(segment.ack);
                }
                // peer's FIN was already consumed; anything else is duplicate traffic
                inner.accept_payload(segment);
            }

            StreamState::LastAck => {
                if has_ack && inner.fin_acked(segment.ack) {
                    inner.on_ack(segment.ack);
                    inner.transition(StreamState::Closed);
                }
            }

            StreamState::TimedWait => {
                if segment.flags.contains(SegmentFlags::FIN) {
                    // our final ack got lost
                    inner.send_ack().await;
                }
            }
        }
    }

    /// Cooperative tick, called about once a second: retransmission deadlines, pending acks,
    ///  outbound queue, keep-alive, liveness.
    pub async fn tick(&self) {
        let mut inner = self.inner.write().await;
        let now = Instant::now();

        match inner.state {
            StreamState::Closed | StreamState::Listen => return,
            StreamState::TimedWait => {
                if let Some(since) = inner.timed_wait_since {
                    if now - since >= TIMED_WAIT_TIMEOUT {
                        inner.transition(StreamState::Closed);
                    }
                }
                return;
            }
            _ => {}
        }

        if now - inner.last_received >= DEAD_AFTER {
            inner.close_with(CloseReason::PeerDead);
            return;
        }

        // retransmit everything whose deadline passed
        let due = inner.unacked.iter()
            .filter(|(_, f)| f.deadline <= now)
            .map(|(&seq, _)| seq)
            .collect::<Vec<_>>();
        for seq in due {
            let timeout = inner.retransmit_timeout;
            let exhausted = {
                let in_flight = inner.unacked.get_mut(&seq).unwrap();
                in_flight.retries += 1;
                in_flight.retransmitted = true;
                in_flight.deadline = now + timeout;
                in_flight.retries > MAX_RETRANSMITS
            };
            if exhausted {
                inner.close_with(CloseReason::RetransmitLimit);
                return;
            }
            let segment = inner.unacked.get(&seq).unwrap().segment.clone();
            debug!("retransmitting segment {} to {}", seq, inner.peer_addr);
            inner.send_segment(&segment).await;
        }

        inner.flush().await;

        if inner.pending_ack {
            inner.send_ack().await;
        }

        if inner.state == StreamState::Established && now - inner.last_sent >= KEEPALIVE_INTERVAL {
            inner.send_ack().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    async fn unconnected_io() -> Arc<PacketIo> {
        Arc::new(PacketIo::bind("127.0.0.1:0".parse().unwrap()).await.unwrap())
    }

    fn test_peer() -> PeerAddr {
        "127.0.0.1:45678".parse().unwrap()
    }

    /// Build a stream in Established state with known sequence numbers, by injecting the
    ///  passive-open handshake.
    async fn established_stream() -> (ReliableStream, u32) {
        let stream = ReliableStream::new(unconnected_io().await, test_peer());
        stream.listen().await.unwrap();

        let peer_isn = 1000u32;
        stream.on_datagram(test_peer(), &Segment::control(SegmentFlags::SYN, peer_isn, 0, 16_384).to_bytes()).await;
        assert_eq!(stream.state().await, StreamState::SynRcvd);

        let our_next = stream.inner.read().await.send_next;
        stream.on_datagram(test_peer(), &Segment::control(SegmentFlags::ACK, peer_isn + 1, our_next, 16_384).to_bytes()).await;
        assert_eq!(stream.state().await, StreamState::Established);
        (stream, peer_isn + 1)
    }

    #[tokio::test]
    async fn test_passive_open_handshake() {
        let (stream, _) = established_stream().await;
        assert_eq!(stream.in_flight().await, 0);
        assert!(stream.close_reason().await.is_none());
    }

    #[tokio::test]
    async fn test_active_open_handshake() {
        let stream = ReliableStream::new(unconnected_io().await, test_peer());
        stream.connect().await.unwrap();
        assert_eq!(stream.state().await, StreamState::SynSent);

        let our_next = stream.inner.read().await.send_next;
        let syn_ack = Segment::control(SegmentFlags::SYN | SegmentFlags::ACK, 7777, our_next, 16_384);
        stream.on_datagram(test_peer(), &syn_ack.to_bytes()).await;

        assert_eq!(stream.state().await, StreamState::Established);
        assert_eq!(stream.in_flight().await, 0);
    }

    #[tokio::test]
    async fn test_connect_twice_is_rejected() {
        let stream = ReliableStream::new(unconnected_io().await, test_peer());
        stream.connect().await.unwrap();
        assert!(stream.connect().await.is_err());
    }

    #[tokio::test]
    async fn test_in_order_delivery() {
        let (stream, peer_seq) = established_stream().await;

        let data = Segment::new(SegmentFlags::ACK, peer_seq, 0, 16_384, Bytes::from_static(b"hello "));
        stream.on_datagram(test_peer(), &data.to_bytes()).await;
        let data = Segment::new(SegmentFlags::ACK, peer_seq + 6, 0, 16_384, Bytes::from_static(b"world"));
        stream.on_datagram(test_peer(), &data.to_bytes()).await;

        assert_eq!(stream.read().await.unwrap().as_ref(), b"hello ");
        assert_eq!(stream.read().await.unwrap().as_ref(), b"world");
        assert!(stream.read().await.is_none());
    }

    #[tokio::test]
    async fn test_out_of_order_reassembly() {
        let (stream, peer_seq) = established_stream().await;

        let second = Segment::new(SegmentFlags::ACK, peer_seq + 6, 0, 16_384, Bytes::from_static(b"world"));
        stream.on_datagram(test_peer(), &second.to_bytes()).await;
        assert!(stream.read().await.is_none());

        let first = Segment::new(SegmentFlags::ACK, peer_seq, 0, 16_384, Bytes::from_static(b"hello "));
        stream.on_datagram(test_peer(), &first.to_bytes()).await;

        assert_eq!(stream.read().await.unwrap().as_ref(), b"hello ");
        assert_eq!(stream.read().await.unwrap().as_ref(), b"world");
    }

    #[tokio::test]
    async fn test_duplicate_data_is_dropped_and_reacked() {
        let (stream, peer_seq) = established_stream().await;

        let data = Segment::new(SegmentFlags::ACK, peer_seq, 0, 16_384, Bytes::from_static(b"once"));
        stream.on_datagram(test_peer(), &data.to_bytes()).await;
        stream.on_datagram(test_peer(), &data.to_bytes()).await;

        assert_eq!(stream.read().await.unwrap().as_ref(), b"once");
        assert!(stream.read().await.is_none());
        assert!(stream.inner.read().await.pending_ack);
    }

    #[tokio::test]
    async fn test_write_is_released_by_cumulative_ack() {
        let (stream, _) = established_stream().await;

        stream.write(b"some outbound data").await.unwrap();
        assert_eq!(stream.in_flight().await, 1);

        let (acked_to, peer_next) = {
            let inner = stream.inner.read().await;
            (inner.send_next, inner.recv_next)
        };
        stream.on_datagram(test_peer(), &Segment::control(SegmentFlags::ACK, peer_next, acked_to, 16_384).to_bytes()).await;
        assert_eq!(stream.in_flight().await, 0);
    }

    #[tokio::test]
    async fn test_large_write_is_segmented() {
        let (stream, _) = established_stream().await;
        stream.write(&vec![0xAB; Segment::MAX_PAYLOAD * 2 + 10]).await.unwrap();
        assert_eq!(stream.in_flight().await, 3);
    }

    #[tokio::test]
    async fn test_close_handshake_active_side() {
        let (stream, peer_seq) = established_stream().await;

        stream.close().await;
        assert_eq!(stream.state().await, StreamState::FinWait1);

        let fin_seq = stream.inner.read().await.fin_seq.unwrap();
        stream.on_datagram(test_peer(), &Segment::control(SegmentFlags::ACK, peer_seq, fin_seq.wrapping_add(1), 16_384).to_bytes()).await;
        assert_eq!(stream.state().await, StreamState::FinWait2);

        stream.on_datagram(test_peer(), &Segment::control(SegmentFlags::FIN | SegmentFlags::ACK, peer_seq, fin_seq.wrapping_add(1), 16_384).to_bytes()).await;
        assert_eq!(stream.state().await, StreamState::TimedWait);
    }

    #[tokio::test]
    async fn test_close_handshake_combined_fin_ack() {
        // the peer answers our FIN with a single segment that both acks it and carries its own
        let (stream, peer_seq) = established_stream().await;

        stream.close().await;
        assert_eq!(stream.state().await, StreamState::FinWait1);

        let fin_seq = stream.inner.read().await.fin_seq.unwrap();
        let fin_ack = Segment::control(SegmentFlags::FIN | SegmentFlags::ACK, peer_seq, fin_seq.wrapping_add(1), 16_384);
        stream.on_datagram(test_peer(), &fin_ack.to_bytes()).await;

        assert_eq!(stream.state().await, StreamState::TimedWait);
    }

    #[tokio::test]
    async fn test_close_handshake_passive_side() {
        let (stream, peer_seq) = established_stream().await;

        let fin = Segment::control(SegmentFlags::FIN | SegmentFlags::ACK, peer_seq, stream.inner.read().await.send_next, 16_384);
        stream.on_datagram(test_peer(), &fin.to_bytes()).await;
        assert_eq!(stream.state().await, StreamState::CloseWait);

        stream.close().await;
        assert_eq!(stream.state().await, StreamState::LastAck);

        let fin_seq = stream.inner.read().await.fin_seq.unwrap();
        stream.on_datagram(test_peer(), &Segment::control(SegmentFlags::ACK, peer_seq + 1, fin_seq.wrapping_add(1), 16_384).to_bytes()).await;
        assert_eq!(stream.state().await, StreamState::Closed);
        assert!(stream.close_reason().await.is_none());
    }

    #[tokio::test]
    async fn test_rst_closes_immediately() {
        let (stream, peer_seq) = established_stream().await;
        stream.on_datagram(test_peer(), &Segment::control(SegmentFlags::RST, peer_seq, 0, 0).to_bytes()).await;
        assert_eq!(stream.state().await, StreamState::Closed);
        assert_eq!(stream.close_reason().await, Some(CloseReason::Reset));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dead_peer_detection() {
        let (stream, _) = established_stream().await;

        tokio::time::sleep(Duration::from_secs(14)).await;
        stream.tick().await;
        assert_eq!(stream.state().await, StreamState::Established);

        tokio::time::sleep(Duration::from_secs(2)).await;
        stream.tick().await;
        assert_eq!(stream.state().await, StreamState::Closed);
        assert_eq!(stream.close_reason().await, Some(CloseReason::PeerDead));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retransmit_exhaustion_closes_stream() {
        let (stream, peer_seq) = established_stream().await;
        let handshake_next = stream.inner.read().await.send_next;
        stream.write(b"never acked").await.unwrap();

        for _ in 0..=MAX_RETRANSMITS {
            // keep the liveness check quiet - only acks of the payload go missing
            stream.on_datagram(test_peer(), &Segment::control(SegmentFlags::ACK, peer_seq, handshake_next, 16_384).to_bytes()).await;
            tokio::time::sleep(Duration::from_millis(1100)).await;
            stream.tick().await;
        }

        assert_eq!(stream.state().await, StreamState::Closed);
        assert_eq!(stream.close_reason().await, Some(CloseReason::RetransmitLimit));
    }

    #[tokio::test]
    async fn test_rejects_datagram_from_wrong_address() {
        let (stream, peer_seq) = established_stream().await;
        let other: PeerAddr = "127.0.0.2:9999".parse().unwrap();
        let data = Segment::new(SegmentFlags::ACK, peer_seq, 0, 16_384, Bytes::from_static(b"intruder"));
        stream.on_datagram(other, &data.to_bytes()).await;
        assert!(stream.read().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_wait_expires() {
        let (stream, peer_seq) = established_stream().await;
        stream.close().await;
        let fin_seq = stream.inner.read().await.fin_seq.unwrap();
        stream.on_datagram(test_peer(), &Segment::control(SegmentFlags::FIN | SegmentFlags::ACK, peer_seq, fin_seq.wrapping_add(1), 16_384).to_bytes()).await;
        assert_eq!(stream.state().await, StreamState::TimedWait);

        tokio::time::sleep(Duration::from_secs(31)).await;
        stream.tick().await;
        assert_eq!(stream.state().await, StreamState::Closed);
    }
}
