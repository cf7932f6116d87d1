use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use rustc_hash::FxHashMap;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::control::ControlPacket;
use crate::packet_io::{DatagramHandler, PacketIo};
use crate::peer_addr::PeerAddr;
use crate::reliable_stream::ReliableStream;
use crate::segment::Segment;
use crate::stun;
use crate::stun::{BindingRequest, BindingResponse, StunMessage};

/// NAT UDP mappings are commonly dropped after 30-60s of silence; refreshing at this interval
///  keeps the externally visible address stable between probe runs.
const STUN_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(25);

/// Consumer of STUN binding responses arriving on a socket (binding *requests* from friends are
///  answered by the demultiplexer itself).
#[cfg_attr(test, automock)]
#[async_trait]
pub trait StunHandler: Send + Sync + 'static {
    async fn on_binding_response(&self, from: PeerAddr, local_port: u16, response: BindingResponse);
}

/// Consumer of the fixed-size control datagrams (tunneler / connection notice / connect request).
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ControlHandler: Send + Sync + 'static {
    async fn on_control_packet(&self, from: PeerAddr, packet: ControlPacket);
}

struct DemuxInner {
    streams: FxHashMap<PeerAddr, Arc<ReliableStream>>,
    stun_handler: Option<Arc<dyn StunHandler>>,
    control_handler: Option<Arc<dyn ControlHandler>>,
    keepalive_target: Option<PeerAddr>,
    last_keepalive: Instant,
}

/// Owns one UDP socket and fans its traffic out: STUN to the probe, control datagrams to the
///  scheduler, stream segments to the [ReliableStream] registered for the sender address.
///
/// There is at most one stream per remote address - the protocol multiplexes by socket pair
///  alone, one logical friend connection per pair.
pub struct Demultiplexer {
    packet_io: Arc<PacketIo>,
    inner: RwLock<DemuxInner>,
}

impl Demultiplexer {
    pub fn new(packet_io: Arc<PacketIo>) -> Arc<Demultiplexer> {
        Arc::new(Demultiplexer {
            packet_io,
            inner: RwLock::new(DemuxInner {
                streams: FxHashMap::default(),
                stun_handler: None,
                control_handler: None,
                keepalive_target: None,
                last_keepalive: Instant::now(),
            }),
        })
    }

    pub fn packet_io(&self) -> Arc<PacketIo> {
        self.packet_io.clone()
    }

    pub async fn set_stun_handler(&self, handler: Arc<dyn StunHandler>) {
        self.inner.write().await.stun_handler = Some(handler);
    }

    pub async fn set_control_handler(&self, handler: Arc<dyn ControlHandler>) {
        self.inner.write().await.control_handler = Some(handler);
    }

    /// Register the one stream allowed for this remote address.
    pub async fn register_stream(&self, peer: PeerAddr, stream: Arc<ReliableStream>) -> anyhow::Result<()> {
        let mut inner = self.inner.write().await;
        if inner.streams.contains_key(&peer) {
            bail!("a stream for {} is already registered", peer);
        }
        debug!("registering stream for {}", peer);
        inner.streams.insert(peer, stream);
        Ok(())
    }

    pub async fn unregister_stream(&self, peer: PeerAddr) -> Option<Arc<ReliableStream>> {
        debug!("unregistering stream for {}", peer);
        self.inner.write().await.streams.remove(&peer)
    }

    pub async fn get_stream(&self, peer: PeerAddr) -> Option<Arc<ReliableStream>> {
        self.inner.read().await.streams.get(&peer).cloned()
    }

    /// While set, a STUN binding request is re-sent to this server every
    ///  [STUN_KEEPALIVE_INTERVAL] to keep the NAT mapping for our external address alive.
    pub async fn set_keepalive_target(&self, target: Option<PeerAddr>) {
        self.inner.write().await.keepalive_target = target;
    }

    pub async fn send_control_packet(&self, to: PeerAddr, packet: &ControlPacket) {
        self.packet_io.send_to(to, &packet.to_bytes()).await;
    }

    pub async fn send_stun_request(&self, to: PeerAddr, request: &BindingRequest) {
        self.packet_io.send_to(to, &request.to_bytes()).await;
    }

    /// Cooperative tick: STUN keep-alive plus a tick for every registered stream.
    pub async fn tick(&self) {
        let (target, due) = {
            let inner = self.inner.read().await;
            let due = Instant::now() - inner.last_keepalive >= STUN_KEEPALIVE_INTERVAL;
            (inner.keepalive_target, due)
        };
        if let (Some(target), true) = (target, due) {
            trace!("sending STUN keep-alive to {}", target);
            self.send_stun_request(target, &BindingRequest::new(None)).await;
            self.inner.write().await.last_keepalive = Instant::now();
        }

        let streams = self.inner.read().await.streams.values().cloned().collect::<Vec<_>>();
        for stream in streams {
            stream.tick().await;
        }
    }

    async fn handle_stun(&self, from: PeerAddr, data: &[u8]) {
        let message = match StunMessage::try_deser(data) {
            Ok(m) => m,
            Err(e) => {
                debug!("undecodable STUN message from {}: {}", from, e);
                return;
            }
        };

        match message {
            StunMessage::Request(request) => {
                // act as an impromptu reflector for the friend's reachability probe
                let reply_to = match request.response_port {
                    Some(port) => from.with_port(port),
                    None => from,
                };
                trace!("answering binding request from {} (reply to {})", from, reply_to);
                let response = BindingResponse::new(request.transaction_id, from);
                self.packet_io.send_to(reply_to, &response.to_bytes()).await;
            }
            StunMessage::Response(response) => {
                let handler = self.inner.read().await.stun_handler.clone();
                if let Some(handler) = handler {
                    handler.on_binding_response(from, self.packet_io.local_port(), response).await;
                }
            }
        }
    }
}

#[async_trait]
impl DatagramHandler for Demultiplexer {
    async fn on_datagram(&self, from: PeerAddr, data: Vec<u8>) {
        if ControlPacket::looks_like_control(&data) {
            match ControlPacket::try_deser(&data) {
                Ok(packet) => {
                    let handler = self.inner.read().await.control_handler.clone();
                    if let Some(handler) = handler {
                        handler.on_control_packet(from, packet).await;
                    }
                }
                Err(e) => debug!("undecodable control packet from {}: {}", from, e),
            }
            return;
        }

        if stun::looks_like_stun(&data) {
            self.handle_stun(from, &data).await;
            return;
        }

        if data.first() == Some(&Segment::MARKER) {
            let stream = self.inner.read().await.streams.get(&from).cloned();
            match stream {
                Some(stream) => stream.on_datagram(from, &data).await,
                None => debug!("stream segment from unknown sender {}, dropping", from),
            }
            return;
        }

        debug!("unclassifiable datagram ({} bytes) from {}, dropping", data.len(), from);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use crate::control::ControlKind;
    use crate::segment::SegmentFlags;
    use crate::stun::new_transaction_id;

    use super::*;

    async fn demux() -> Arc<Demultiplexer> {
        let io = Arc::new(PacketIo::bind("127.0.0.1:0".parse().unwrap()).await.unwrap());
        Demultiplexer::new(io)
    }

    struct CollectingControlHandler {
        packets: Mutex<Vec<(PeerAddr, ControlPacket)>>,
    }
    #[async_trait]
    impl ControlHandler for CollectingControlHandler {
        async fn on_control_packet(&self, from: PeerAddr, packet: ControlPacket) {
            self.packets.lock().unwrap().push((from, packet));
        }
    }

    struct CollectingStunHandler {
        responses: Mutex<Vec<(PeerAddr, u16, BindingResponse)>>,
    }
    #[async_trait]
    impl StunHandler for CollectingStunHandler {
        async fn on_binding_response(&self, from: PeerAddr, local_port: u16, response: BindingResponse) {
            self.responses.lock().unwrap().push((from, local_port, response));
        }
    }

    #[tokio::test]
    async fn test_routes_control_packets() {
        let demux = demux().await;
        let handler = Arc::new(CollectingControlHandler { packets: Mutex::new(Vec::new()) });
        demux.set_control_handler(handler.clone()).await;

        let sender: PeerAddr = "203.0.113.5:1680".parse().unwrap();
        let packet = ControlPacket::new(ControlKind::UdpTunneler, sender, 42);
        demux.on_datagram(sender, packet.to_bytes()).await;

        let packets = handler.packets.lock().unwrap();
        assert_eq!(packets.as_slice(), &[(sender, packet)]);
    }

    #[tokio::test]
    async fn test_routes_stun_responses() {
        let demux = demux().await;
        let handler = Arc::new(CollectingStunHandler { responses: Mutex::new(Vec::new()) });
        demux.set_stun_handler(handler.clone()).await;

        let server: PeerAddr = "198.51.100.1:3478".parse().unwrap();
        let response = BindingResponse::new(new_transaction_id(), "203.0.113.5:40210".parse().unwrap());
        demux.on_datagram(server, response.to_bytes()).await;

        let responses = handler.responses.lock().unwrap();
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].0, server);
        assert_eq!(responses[0].2, response);
    }

    #[tokio::test]
    async fn test_answers_binding_requests() {
        // a full round trip: peer A asks the demultiplexer's socket for its mapped address
        let asker = Arc::new(PacketIo::bind("127.0.0.1:0".parse().unwrap()).await.unwrap());
        let demux_io = Arc::new(PacketIo::bind("127.0.0.1:0".parse().unwrap()).await.unwrap());
        let demux = Demultiplexer::new(demux_io.clone());
        {
            let demux = demux.clone();
            tokio::spawn(async move { demux.packet_io().recv_loop(demux.clone()).await });
        }

        let asker_handler = Arc::new(CollectingStunHandler { responses: Mutex::new(Vec::new()) });
        let asker_demux = Demultiplexer::new(asker.clone());
        asker_demux.set_stun_handler(asker_handler.clone()).await;
        {
            let asker_demux = asker_demux.clone();
            tokio::spawn(async move { asker_demux.packet_io().recv_loop(asker_demux.clone()).await });
        }

        let request = BindingRequest::new(None);
        asker.send_to(demux_io.local_addr().unwrap(), &request.to_bytes()).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        let responses = asker_handler.responses.lock().unwrap();
        assert_eq!(responses.len(), 1);
        let (_, _, response) = responses[0];
        assert_eq!(response.transaction_id, request.transaction_id);
        assert_eq!(response.mapped, asker.local_addr().unwrap());
    }

    #[tokio::test]
    async fn test_routes_segments_to_registered_stream() {
        let demux = demux().await;
        let peer: PeerAddr = "127.0.0.1:7001".parse().unwrap();
        let io = Arc::new(PacketIo::bind("127.0.0.1:0".parse().unwrap()).await.unwrap());
        let stream = Arc::new(ReliableStream::new(io, peer));
        stream.listen().await.unwrap();
        demux.register_stream(peer, stream.clone()).await.unwrap();

        let syn = Segment::control(SegmentFlags::SYN, 123, 0, 16_384);
        demux.on_datagram(peer, syn.to_bytes()).await;

        assert_eq!(stream.state().await, crate::reliable_stream::StreamState::SynRcvd);
    }

    #[tokio::test]
    async fn test_one_stream_per_address() {
        let demux = demux().await;
        let peer: PeerAddr = "127.0.0.1:7001".parse().unwrap();
        let io = Arc::new(PacketIo::bind("127.0.0.1:0".parse().unwrap()).await.unwrap());
        demux.register_stream(peer, Arc::new(ReliableStream::new(io.clone(), peer))).await.unwrap();
        assert!(demux.register_stream(peer, Arc::new(ReliableStream::new(io, peer))).await.is_err());

        demux.unregister_stream(peer).await.unwrap();
    }

    #[tokio::test]
    async fn test_drops_segments_from_unknown_sender() {
        let demux = demux().await;
        let syn = Segment::control(SegmentFlags::SYN, 123, 0, 16_384);
        // no stream registered - must not panic
        demux.on_datagram("127.0.0.1:7009".parse().unwrap(), syn.to_bytes()).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stun_keepalive_interval() {
        let target_io = Arc::new(PacketIo::bind("127.0.0.1:0".parse().unwrap()).await.unwrap());

        let demux = demux().await;
        demux.set_keepalive_target(Some(target_io.local_addr().unwrap())).await;

        tokio::time::sleep(Duration::from_secs(10)).await;
        demux.tick().await;
        let not_yet = demux.inner.read().await.last_keepalive;

        tokio::time::sleep(Duration::from_secs(16)).await;
        demux.tick().await;
        let refreshed = demux.inner.read().await.last_keepalive;

        assert_eq!(Instant::now() - refreshed, Duration::ZERO);
        assert!(refreshed > not_yet);
    }
}
