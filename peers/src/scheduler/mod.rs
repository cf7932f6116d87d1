pub mod used_sockets;

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use num_enum::TryFromPrimitive;
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use transport::control::{ControlKind, ControlPacket};
use transport::demux::{ControlHandler, Demultiplexer};
use transport::peer_addr::PeerAddr;
use transport::reliable_stream::{ReliableStream, StreamState};

use crate::boundary::{CertificateCheck, FriendDirectory, FriendRecord, TcpConnector};
use crate::config::NodeConfig;
use crate::events::{CoreEvent, CoreEventNotifier};
use crate::probe::{ConnectionStatus, ConnectivityProbe};
use crate::scheduler::used_sockets::{ClaimOutcome, UsedSocketTable};

/// NAT UDP bindings and firewall holes go stale within a minute; the tunneler both keeps them
///  open and doubles as a connection invitation.
const TUNNELER_INTERVAL: Duration = Duration::from_secs(20);

/// A connected friend this silent is assumed gone even if the transport has not noticed.
const SILENCE_DISCONNECT: Duration = Duration::from_secs(300);

const SWEEP_INTERVAL: Duration = Duration::from_secs(600);
/// Behind a symmetric NAT nobody can reach us, so we must dial out much more insistently.
const SWEEP_INTERVAL_SYMMETRIC: Duration = Duration::from_secs(60);

/// Re-queue delay when another attempt currently holds the target socket.
const DEFER_RETRY: Duration = Duration::from_secs(5);

#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum FriendConnectState {
    /// Known but not signed up; never dialed.
    NotEnabled,
    NotConnected,
    InAttempt,
    ConnectedTcp,
    ConnectedUdp,
}

impl FriendConnectState {
    pub fn is_connected(&self) -> bool {
        matches!(self, FriendConnectState::ConnectedTcp | FriendConnectState::ConnectedUdp)
    }
}

/// In descending dispatch priority.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum AttemptType {
    TcpLocal,
    TcpExternal,
    TcpConnectBack,
    UdpConnect,
}

/// Outcome of a connection attempt, reported back by the collaborator that ran it.
#[derive(Clone, Copy, Eq, PartialEq, Debug, TryFromPrimitive)]
#[repr(u8)]
pub enum AttemptResult {
    Succeeded = 0,
    Refused = 1,
    TimedOut = 2,
    Unreachable = 3,
    Aborted = 4,
}

/// Everything the scheduler tracks about one friend. Friends are created and removed only by
///  directory sync; everything else mutates listings in place.
#[derive(Clone, Debug)]
pub struct FriendListing {
    pub friend_id: u32,
    pub cert_id: u64,
    pub name: String,
    pub signed_up: bool,

    pub state: FriendConnectState,
    pub local_addr: Option<PeerAddr>,
    pub external_addr: Option<PeerAddr>,

    pub last_contact: Option<Instant>,
    pub last_heard: Option<Instant>,

    pub want_tcp_local: bool,
    pub want_tcp_external: bool,
    pub want_tcp_connect_back: bool,
    pub want_udp: bool,

    pub retry_not_before: Option<Instant>,
    pub in_flight: Option<AttemptType>,
    /// Target of the in-flight attempt; the used-socket claim to release when it concludes.
    pub attempt_addr: Option<PeerAddr>,
    /// Address of the live connection; the used-socket entry to release on disconnect.
    pub connected_addr: Option<PeerAddr>,
}

impl FriendListing {
    fn from_record(record: FriendRecord) -> FriendListing {
        let enabled = record.signed_up;
        FriendListing {
            friend_id: record.friend_id,
            cert_id: record.cert_id,
            name: record.name,
            signed_up: record.signed_up,
            state: if enabled { FriendConnectState::NotConnected } else { FriendConnectState::NotEnabled },
            local_addr: record.local_addr,
            external_addr: record.external_addr,
            last_contact: None,
            last_heard: None,
            want_tcp_local: enabled,
            want_tcp_external: enabled,
            want_tcp_connect_back: enabled,
            want_udp: enabled,
            retry_not_before: None,
            in_flight: None,
            attempt_addr: None,
            connected_addr: None,
        }
    }

    fn set_all_want_flags(&mut self) {
        self.want_tcp_local = true;
        self.want_tcp_external = true;
        self.want_tcp_connect_back = true;
        self.want_udp = true;
    }

    fn clear_all_want_flags(&mut self) {
        self.want_tcp_local = false;
        self.want_tcp_external = false;
        self.want_tcp_connect_back = false;
        self.want_udp = false;
    }

    fn clear_want(&mut self, attempt: AttemptType) {
        match attempt {
            AttemptType::TcpLocal => self.want_tcp_local = false,
            AttemptType::TcpExternal => self.want_tcp_external = false,
            AttemptType::TcpConnectBack => self.want_tcp_connect_back = false,
            AttemptType::UdpConnect => self.want_udp = false,
        }
    }
}

struct SchedulerInner {
    friends: FxHashMap<u32, FriendListing>,
    used_sockets: UsedSocketTable,
    last_sweep: Instant,
    last_tunneler: Instant,
}

/// Decides, per friend, which transport to try and when, and enforces that at most one attempt
///  targets a given remote socket at a time.
///
/// The friends map and the used-socket table live under one lock: a socket claim and the
///  friend-state transition it belongs to are always made together.
pub struct PeerScheduler {
    demux: Arc<Demultiplexer>,
    probe: Arc<ConnectivityProbe>,
    directory: Arc<dyn FriendDirectory>,
    certs: Arc<dyn CertificateCheck>,
    tcp: Arc<dyn TcpConnector>,
    events: Arc<CoreEventNotifier>,

    own_friend_id: u32,
    subnet_mask: Ipv4Addr,

    inner: RwLock<SchedulerInner>,
}

impl PeerScheduler {
    pub fn new(
        config: &NodeConfig,
        demux: Arc<Demultiplexer>,
        probe: Arc<ConnectivityProbe>,
        directory: Arc<dyn FriendDirectory>,
        certs: Arc<dyn CertificateCheck>,
        tcp: Arc<dyn TcpConnector>,
        events: Arc<CoreEventNotifier>,
    ) -> Arc<PeerScheduler> {
        let now = Instant::now();
        Arc::new(PeerScheduler {
            demux,
            probe,
            directory,
            certs,
            tcp,
            events,
            own_friend_id: config.own_friend_id,
            subnet_mask: config.subnet_mask,
            inner: RwLock::new(SchedulerInner {
                friends: FxHashMap::default(),
                used_sockets: UsedSocketTable::default(),
                last_sweep: now,
                last_tunneler: now,
            }),
        })
    }

    /// Pull the friend list from the directory and merge it into the local listings. Friends
    ///  are only ever removed here, never by connection failures.
    pub async fn sync_friends(&self) {
        let records = self.directory.friends().await;
        let mut changed = false;

        let mut inner = self.inner.write().await;
        let mut seen = FxHashSet::default();
        for record in records {
            if !self.certs.is_known_certificate(record.cert_id).await {
                warn!("friend {} ({}) has unknown certificate {}, skipping", record.friend_id, record.name, record.cert_id);
                continue;
            }
            seen.insert(record.friend_id);

            match inner.friends.get_mut(&record.friend_id) {
                Some(listing) => {
                    if listing.local_addr != record.local_addr
                        || listing.external_addr != record.external_addr
                        || listing.signed_up != record.signed_up
                        || listing.name != record.name
                    {
                        changed = true;
                    }
                    listing.local_addr = record.local_addr;
                    listing.external_addr = record.external_addr;
                    listing.name = record.name;
                    if record.signed_up && !listing.signed_up {
                        listing.signed_up = true;
                        if listing.state == FriendConnectState::NotEnabled {
                            listing.state = FriendConnectState::NotConnected;
                            listing.set_all_want_flags();
                        }
                    }
                    if !record.signed_up && !listing.state.is_connected() {
                        listing.signed_up = false;
                        listing.state = FriendConnectState::NotEnabled;
                        listing.clear_all_want_flags();
                    }
                }
                None => {
                    debug!("new friend {} ({})", record.friend_id, record.name);
                    changed = true;
                    inner.friends.insert(record.friend_id, FriendListing::from_record(record));
                }
            }
        }

        let removed = inner.friends.keys()
            .filter(|id| !seen.contains(id))
            .copied()
            .collect::<Vec<_>>();
        for friend_id in removed {
            info!("friend {} was removed upstream", friend_id);
            changed = true;
            if let Some(listing) = inner.friends.remove(&friend_id) {
                for addr in [listing.attempt_addr, listing.connected_addr].into_iter().flatten() {
                    inner.used_sockets.release(addr);
                    self.demux.unregister_stream(addr).await;
                }
                if listing.state.is_connected() {
                    self.events.send_event(CoreEvent::FriendOffline(friend_id));
                }
            }
        }

        if changed {
            self.events.send_event(CoreEvent::FriendsChanged);
        }
    }

    pub async fn tick(&self) {
        let now = Instant::now();
        let probe_status = self.probe.status().await;
        let local_ip = self.probe.local_ip().await;
        let own_addr = self.own_addr(local_ip).await;

        let mut inner = self.inner.write().await;
        self.sweep_if_due(&mut inner, now, probe_status);
        self.check_silence(&mut inner, now).await;
        self.poll_udp_streams(&mut inner, now).await;
        self.dispatch_attempts(&mut inner, now, local_ip, own_addr).await;
        self.send_tunnelers(&mut inner, now, probe_status, own_addr).await;
    }

    /// The collaborator that ran a TCP attempt reports how it went.
    pub async fn report_attempt_result(&self, friend_id: u32, result: AttemptResult) {
        let now = Instant::now();
        let mut inner = self.inner.write().await;
        let SchedulerInner { friends, used_sockets, .. } = &mut *inner;
        let Some(listing) = friends.get_mut(&friend_id) else {
            debug!("attempt result {:?} for unknown friend {}", result, friend_id);
            return;
        };
        let (Some(attempt), Some(addr)) = (listing.in_flight.take(), listing.attempt_addr.take()) else {
            debug!("attempt result {:?} for friend {} with no attempt in flight", result, friend_id);
            return;
        };

        if result == AttemptResult::Succeeded {
            info!("friend {} connected via {:?} at {}", friend_id, attempt, addr);
            used_sockets.mark_connected(addr);
            listing.state = FriendConnectState::ConnectedTcp;
            listing.connected_addr = Some(addr);
            listing.last_contact = Some(now);
            listing.last_heard = Some(now);
            listing.clear_all_want_flags();
            self.events.send_event(CoreEvent::FriendOnline(friend_id));
        } else {
            debug!("{:?} attempt to friend {} at {} failed: {:?}", attempt, friend_id, addr, result);
            used_sockets.release(addr);
            listing.state = FriendConnectState::NotConnected;
            listing.retry_not_before = Some(now + backoff_for(attempt));
        }
    }

    /// The service layer saw traffic from this friend; pushes the silence deadline out.
    pub async fn report_heard_from(&self, friend_id: u32) {
        if let Some(listing) = self.inner.write().await.friends.get_mut(&friend_id) {
            listing.last_heard = Some(Instant::now());
        }
    }

    pub async fn retry_friend(&self, friend_id: u32) {
        if let Some(listing) = self.inner.write().await.friends.get_mut(&friend_id) {
            if listing.state == FriendConnectState::NotConnected {
                listing.set_all_want_flags();
                listing.retry_not_before = None;
            }
        }
    }

    /// Queue attempts for every disconnected friend. Want flags are idempotent: calling this
    ///  twice before the next tick still dispatches each attempt once.
    pub async fn retry_all(&self) {
        for listing in self.inner.write().await.friends.values_mut() {
            if listing.state == FriendConnectState::NotConnected {
                listing.set_all_want_flags();
                listing.retry_not_before = None;
            }
        }
    }

    pub async fn is_online(&self, friend_id: u32) -> bool {
        self.inner.read().await.friends.get(&friend_id)
            .map(|l| l.state.is_connected())
            .unwrap_or(false)
    }

    pub async fn online_list(&self) -> Vec<u32> {
        self.inner.read().await.friends.values()
            .filter(|l| l.state.is_connected())
            .map(|l| l.friend_id)
            .collect()
    }

    pub async fn signed_up_list(&self) -> Vec<u32> {
        self.inner.read().await.friends.values()
            .filter(|l| l.signed_up)
            .map(|l| l.friend_id)
            .collect()
    }

    pub async fn friend_list(&self) -> Vec<FriendListing> {
        self.inner.read().await.friends.values().cloned().collect()
    }

    pub async fn friend(&self, friend_id: u32) -> Option<FriendListing> {
        self.inner.read().await.friends.get(&friend_id).cloned()
    }

    async fn own_addr(&self, local_ip: Ipv4Addr) -> PeerAddr {
        match self.probe.external_addr().await {
            Some(addr) => addr,
            None => PeerAddr::new(local_ip, self.demux.packet_io().local_port()),
        }
    }

    fn sweep_if_due(&self, inner: &mut SchedulerInner, now: Instant, probe_status: ConnectionStatus) {
        let interval = if probe_status == ConnectionStatus::SymmetricNat {
            SWEEP_INTERVAL_SYMMETRIC
        } else {
            SWEEP_INTERVAL
        };
        if now - inner.last_sweep < interval {
            return;
        }
        inner.last_sweep = now;

        debug!("periodic retry sweep");
        for listing in inner.friends.values_mut() {
            if listing.state == FriendConnectState::NotConnected {
                listing.set_all_want_flags();
                listing.retry_not_before = None;
            }
        }
    }

    async fn check_silence(&self, inner: &mut SchedulerInner, now: Instant) {
        let SchedulerInner { friends, used_sockets, .. } = inner;
        let mut offline = Vec::new();
        for listing in friends.values_mut() {
            if !listing.state.is_connected() {
                continue;
            }
            let heard = listing.last_heard.unwrap_or(now);
            if now - heard < SILENCE_DISCONNECT {
                continue;
            }

            info!("nothing heard from friend {} for {:?}, marking disconnected", listing.friend_id, now - heard);
            let was_tcp = listing.state == FriendConnectState::ConnectedTcp;
            listing.state = FriendConnectState::NotConnected;
            if let Some(addr) = listing.connected_addr.take() {
                used_sockets.release(addr);
                if !was_tcp {
                    self.demux.unregister_stream(addr).await;
                }
            }
            if was_tcp {
                // reconnect right away; a TCP drop is usually transient
                listing.want_tcp_local = true;
                listing.want_tcp_external = true;
            } else {
                listing.want_udp = true;
            }
            listing.retry_not_before = None;
            offline.push(listing.friend_id);
        }
        for friend_id in offline {
            self.events.send_event(CoreEvent::FriendOffline(friend_id));
        }
    }

    /// Watch UDP handshakes in progress and established UDP connections; the stream objects
    ///  detect success and death themselves, this just translates it into friend state.
    async fn poll_udp_streams(&self, inner: &mut SchedulerInner, now: Instant) {
        let ids = inner.friends.keys().copied().collect::<Vec<_>>();
        for friend_id in ids {
            let (addr, connecting) = {
                let Some(listing) = inner.friends.get(&friend_id) else { continue };
                match (listing.state, listing.in_flight, listing.attempt_addr, listing.connected_addr) {
                    (FriendConnectState::InAttempt, Some(AttemptType::UdpConnect), Some(addr), _) => (addr, true),
                    (FriendConnectState::ConnectedUdp, _, _, Some(addr)) => (addr, false),
                    _ => continue,
                }
            };

            let stream_state = match self.demux.get_stream(addr).await {
                Some(stream) => Some(stream.state().await),
                None => None,
            };

            let SchedulerInner { friends, used_sockets, .. } = &mut *inner;
            let Some(listing) = friends.get_mut(&friend_id) else { continue };
            if connecting {
                match stream_state {
                    Some(StreamState::Established) => {
                        info!("friend {} connected via UDP at {}", friend_id, addr);
                        used_sockets.mark_connected(addr);
                        listing.state = FriendConnectState::ConnectedUdp;
                        listing.connected_addr = Some(addr);
                        listing.in_flight = None;
                        listing.attempt_addr = None;
                        listing.last_contact = Some(now);
                        listing.last_heard = Some(now);
                        listing.clear_all_want_flags();
                        self.events.send_event(CoreEvent::FriendOnline(friend_id));
                    }
                    Some(StreamState::Closed) | None => {
                        debug!("UDP connect to friend {} at {} failed", friend_id, addr);
                        self.demux.unregister_stream(addr).await;
                        used_sockets.release(addr);
                        listing.state = FriendConnectState::NotConnected;
                        listing.in_flight = None;
                        listing.attempt_addr = None;
                        listing.retry_not_before = Some(now + backoff_for(AttemptType::UdpConnect));
                    }
                    _ => {} // handshake still in progress
                }
            } else if stream_state.is_none() || stream_state == Some(StreamState::Closed) {
                info!("UDP connection to friend {} at {} is gone", friend_id, addr);
                self.demux.unregister_stream(addr).await;
                used_sockets.release(addr);
                listing.state = FriendConnectState::NotConnected;
                listing.connected_addr = None;
                listing.want_udp = true;
                listing.retry_not_before = Some(now + backoff_for(AttemptType::UdpConnect));
                self.events.send_event(CoreEvent::FriendOffline(friend_id));
            }
        }
    }

    async fn dispatch_attempts(&self, inner: &mut SchedulerInner, now: Instant, local_ip: Ipv4Addr, own_addr: PeerAddr) {
        let ids = inner.friends.keys().copied().collect::<Vec<_>>();
        for friend_id in ids {
            let decision = {
                let Some(listing) = inner.friends.get(&friend_id) else { continue };
                if listing.state != FriendConnectState::NotConnected {
                    continue;
                }
                if listing.retry_not_before.is_some_and(|t| now < t) {
                    continue;
                }
                pick_attempt(listing, local_ip, self.subnet_mask)
            };
            let Some((attempt, target)) = decision else { continue };

            match attempt {
                AttemptType::TcpConnectBack => {
                    // no local socket is targeted, just an invitation for the friend to dial us.
                    //  The retry deadline stays untouched: a UDP attempt queued alongside must
                    //  dispatch on the next tick, while the tunneler hole is still fresh
                    debug!("asking friend {} at {} to dial us back over TCP", friend_id, target);
                    let packet = ControlPacket::new(ControlKind::TcpConnectionRequest, own_addr, self.own_friend_id);
                    self.demux.send_control_packet(target, &packet).await;
                    if let Some(listing) = inner.friends.get_mut(&friend_id) {
                        listing.want_tcp_connect_back = false;
                    }
                }

                AttemptType::TcpLocal | AttemptType::TcpExternal => {
                    let SchedulerInner { friends, used_sockets, .. } = &mut *inner;
                    let Some(listing) = friends.get_mut(&friend_id) else { continue };
                    match used_sockets.try_claim(target) {
                        ClaimOutcome::Claimed => {
                            info!("dialing friend {} at {} ({:?})", friend_id, target, attempt);
                            listing.state = FriendConnectState::InAttempt;
                            listing.in_flight = Some(attempt);
                            listing.attempt_addr = Some(target);
                            self.tcp.begin_tcp_connect(friend_id, target).await;
                        }
                        ClaimOutcome::Deferred => {
                            listing.retry_not_before = Some(now + DEFER_RETRY);
                        }
                        ClaimOutcome::Moot => {
                            listing.clear_want(attempt);
                        }
                    }
                }

                AttemptType::UdpConnect => {
                    let SchedulerInner { friends, used_sockets, .. } = &mut *inner;
                    let Some(listing) = friends.get_mut(&friend_id) else { continue };
                    match used_sockets.try_claim(target) {
                        ClaimOutcome::Claimed => {
                            let stream = Arc::new(ReliableStream::new(self.demux.packet_io(), target));
                            if let Err(e) = self.demux.register_stream(target, stream.clone()).await {
                                debug!("cannot open a UDP stream to {}: {}", target, e);
                                used_sockets.release(target);
                                listing.retry_not_before = Some(now + DEFER_RETRY);
                                continue;
                            }
                            if let Err(e) = stream.connect().await {
                                debug!("UDP connect to {} failed to start: {}", target, e);
                                self.demux.unregister_stream(target).await;
                                used_sockets.release(target);
                                listing.retry_not_before = Some(now + DEFER_RETRY);
                                continue;
                            }
                            info!("starting UDP handshake with friend {} at {}", friend_id, target);
                            listing.state = FriendConnectState::InAttempt;
                            listing.in_flight = Some(AttemptType::UdpConnect);
                            listing.attempt_addr = Some(target);
                        }
                        ClaimOutcome::Deferred => {
                            listing.retry_not_before = Some(now + DEFER_RETRY);
                        }
                        ClaimOutcome::Moot => {
                            listing.want_udp = false;
                        }
                    }
                }
            }
        }
    }

    async fn send_tunnelers(&self, inner: &mut SchedulerInner, now: Instant, probe_status: ConnectionStatus, own_addr: PeerAddr) {
        if !probe_status.is_hole_punching() {
            return;
        }
        if now - inner.last_tunneler < TUNNELER_INTERVAL {
            return;
        }
        inner.last_tunneler = now;

        // established streams refresh their own NAT mapping with stream keep-alives; only
        //  friends without one need the tunneler
        let packet = ControlPacket::new(ControlKind::UdpTunneler, own_addr, self.own_friend_id);
        for listing in inner.friends.values() {
            if !matches!(listing.state, FriendConnectState::NotConnected | FriendConnectState::InAttempt) {
                continue;
            }
            if let Some(addr) = listing.external_addr {
                trace!("sending tunneler to friend {} at {}", listing.friend_id, addr);
                self.demux.send_control_packet(addr, &packet).await;
            }
        }
    }
}

/// Highest-priority attempt that is wanted and has a usable target address.
fn pick_attempt(listing: &FriendListing, local_ip: Ipv4Addr, subnet_mask: Ipv4Addr) -> Option<(AttemptType, PeerAddr)> {
    if listing.want_tcp_local {
        if let Some(local) = listing.local_addr {
            // only worth trying if it really is a LAN neighbor and the address adds anything
            //  over the external one
            if local.same_subnet(&PeerAddr::new(local_ip, 0), subnet_mask) && Some(local) != listing.external_addr {
                return Some((AttemptType::TcpLocal, local));
            }
        }
    }
    if listing.want_tcp_external {
        if let Some(external) = listing.external_addr {
            return Some((AttemptType::TcpExternal, external));
        }
    }
    if listing.want_tcp_connect_back {
        if let Some(external) = listing.external_addr {
            return Some((AttemptType::TcpConnectBack, external));
        }
    }
    if listing.want_udp {
        if let Some(external) = listing.external_addr {
            return Some((AttemptType::UdpConnect, external));
        }
    }
    None
}

fn backoff_for(attempt: AttemptType) -> Duration {
    match attempt {
        AttemptType::TcpLocal => Duration::from_secs(30),
        AttemptType::TcpExternal => Duration::from_secs(60),
        AttemptType::TcpConnectBack => Duration::from_secs(60),
        AttemptType::UdpConnect => Duration::from_secs(20),
    }
}

#[async_trait]
impl ControlHandler for PeerScheduler {
    async fn on_control_packet(&self, from: PeerAddr, packet: ControlPacket) {
        let probe_status = self.probe.status().await;
        let local_ip = self.probe.local_ip().await;
        let own_addr = self.own_addr(local_ip).await;

        let stale = {
            let mut inner = self.inner.write().await;
            let Some(listing) = inner.friends.get_mut(&packet.sender_friend_id) else {
                debug!("control packet from {} for unknown friend id {}, dropping", from, packet.sender_friend_id);
                return;
            };

            if listing.external_addr != Some(from) {
                debug!("control packet for friend {} came from {} instead of known {:?}",
                    packet.sender_friend_id, from, listing.external_addr);
                true
            } else {
                listing.last_heard = Some(Instant::now());
                match packet.kind {
                    ControlKind::UdpTunneler => {
                        trace!("tunneler from friend {} at {}", packet.sender_friend_id, from);
                        let notice = ControlPacket::new(ControlKind::UdpConnectionNotice, own_addr, self.own_friend_id);
                        self.demux.send_control_packet(from, &notice).await;
                        if !listing.state.is_connected() {
                            if probe_status.allows_inbound_tcp() {
                                listing.want_tcp_connect_back = true;
                            }
                            listing.want_udp = true;
                            listing.retry_not_before = None;
                        }
                    }
                    ControlKind::UdpConnectionNotice => {
                        trace!("connection notice from friend {} at {}", packet.sender_friend_id, from);
                        if !listing.state.is_connected() {
                            listing.want_udp = true;
                            listing.retry_not_before = None;
                        }
                    }
                    ControlKind::TcpConnectionRequest => {
                        trace!("TCP connect-back request from friend {} at {}", packet.sender_friend_id, from);
                        if !listing.state.is_connected() {
                            listing.want_tcp_external = true;
                            listing.retry_not_before = None;
                        }
                    }
                }
                false
            }
        };

        if stale {
            // the packet is not acted on - our view of the friend is outdated, fix that first
            self.directory.request_refresh().await;
        }
    }
}
