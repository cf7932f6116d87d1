pub mod upnp;

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rustc_hash::FxHashMap;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use transport::demux::{Demultiplexer, StunHandler};
use transport::packet_io::PacketIo;
use transport::peer_addr::PeerAddr;
use transport::stun::{BindingRequest, BindingResponse, TransactionId};

use crate::boundary::FriendDirectory;
use crate::config::NodeConfig;
use crate::events::{CoreEvent, CoreEventNotifier};
use crate::probe::upnp::{UpnpMapping, UpnpTask};

/// Most probe steps are a single STUN round trip; a missing answer is obvious quickly.
const STEP_TIMEOUT: Duration = Duration::from_secs(5);

/// UPnP discovery and the negative hole-punching tests need longer: "no answer" is the
///  interesting outcome there and must not be declared prematurely.
const LONG_STEP_TIMEOUT: Duration = Duration::from_secs(15);

/// A wall-clock gap between ticks this large means suspend/resume; all learned reachability
///  facts are stale then.
const RESTART_AFTER_GAP: Duration = Duration::from_secs(30);

const INTERFACE_CHECK_INTERVAL: Duration = Duration::from_secs(10);
const UPNP_REVALIDATE_INTERVAL: Duration = Duration::from_secs(300);

/// Two servers give independent observation points; the firewall-restriction test needs them.
const SUFFICIENT_STUN_SERVERS: usize = 2;

const MAX_FRIEND_PROBES: usize = 8;

/// Where the local peer stands in the reachability classification. Probing states advance
///  strictly forward (declaration order); a terminal state only changes through
///  [ConnectivityProbe::reset].
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Debug)]
pub enum ConnectionStatus {
    FindingStunFriends,
    FindingStunFallbackServers,
    StunningInitial,
    TryingUpnp,
    StunningUpnpTest,
    StunningMainPort,
    StunningUdpHolePunchingTest,
    StunningFirewallRestrictionTest,

    /// Our local address is directly reachable from the Internet.
    Unfirewalled,
    /// Behind NAT, but a (manually configured) port forwarding makes us reachable.
    PortForwarded,
    /// Behind NAT, reachable through a UPnP mapping we established ourselves.
    UpnpInUse,
    /// Full-cone NAT: a single outbound datagram opens the mapping for anyone.
    UdpHolePunching,
    /// Restricted-cone NAT: the mapping is stable but must be punched per destination.
    RestrictedConeUdpHolePunching,
    /// The NAT assigns a fresh mapping per destination; unreachable without outside help.
    SymmetricNat,
    /// Classification failed; treated as "probably fine" rather than as an error.
    Unknown,
}

impl ConnectionStatus {
    pub fn is_terminal(&self) -> bool {
        *self >= ConnectionStatus::Unfirewalled
    }

    /// True if friends can be expected to reach us by dialing TCP to our external address.
    pub fn allows_inbound_tcp(&self) -> bool {
        matches!(self,
            ConnectionStatus::Unfirewalled
            | ConnectionStatus::PortForwarded
            | ConnectionStatus::UpnpInUse)
    }

    /// True if UDP connections to us require active hole maintenance from our side.
    pub fn is_hole_punching(&self) -> bool {
        matches!(self,
            ConnectionStatus::UdpHolePunching
            | ConnectionStatus::RestrictedConeUdpHolePunching)
    }

    fn timeout(&self) -> Duration {
        match self {
            ConnectionStatus::TryingUpnp
            | ConnectionStatus::StunningUdpHolePunchingTest
            | ConnectionStatus::StunningFirewallRestrictionTest => LONG_STEP_TIMEOUT,
            _ => STEP_TIMEOUT,
        }
    }
}

/// A STUN request we sent and whose answer we still await. The whole table is cleared on every
///  state transition, so an answer arriving late is ignored rather than misattributed.
struct PendingStunTransaction {
    server: PeerAddr,
    server_name: String,
    expected_reply_port: u16,
}

struct ProbeInner {
    status: ConnectionStatus,
    status_since: Instant,
    last_tick: Instant,
    last_interface_check: Instant,

    local_ip: Ipv4Addr,
    external_addr: Option<PeerAddr>,

    /// Responders collected in the discovery steps; index 0 is the primary server.
    stun_servers: Vec<PeerAddr>,
    pending: FxHashMap<TransactionId, PendingStunTransaction>,

    /// Our main port's mapping as observed in the main-port probe, compared against the
    ///  firewall-restriction probe's observation to tell cone from symmetric NAT.
    main_port_mapping: Option<PeerAddr>,

    upnp_task: Option<UpnpTask>,
    upnp_mapping: Option<UpnpMapping>,
    upnp_checked: Instant,

    dns_task: Option<JoinHandle<Vec<PeerAddr>>>,
}

/// Classifies the local NAT/firewall situation with STUN round trips (against friends first,
///  well-known servers second) and obtains a usable external address, attempting UPnP
///  configuration where direct reachability fails. The classification script follows the
///  RFC 3489 NAT tests, adapted to the two local ports this node owns.
///
/// Driven entirely by [Self::tick] and inbound binding responses; no step ever blocks. Slow
///  operations (DNS, UPnP) run as spawned tasks polled for completion.
pub struct ConnectivityProbe {
    main_demux: Arc<Demultiplexer>,
    test_io: Arc<PacketIo>,
    directory: Arc<dyn FriendDirectory>,
    events: Arc<CoreEventNotifier>,

    auto_configure: bool,
    fallback_hosts: Vec<String>,
    /// Interface-change detection only applies when we bound to the wildcard address and had
    ///  to discover the local interface ourselves.
    detect_interface: bool,

    inner: RwLock<ProbeInner>,
}

impl ConnectivityProbe {
    pub fn new(
        config: &NodeConfig,
        main_demux: Arc<Demultiplexer>,
        test_io: Arc<PacketIo>,
        directory: Arc<dyn FriendDirectory>,
        events: Arc<CoreEventNotifier>,
    ) -> Arc<ConnectivityProbe> {
        let (local_ip, detect_interface) = match config.main_addr {
            SocketAddr::V4(a) if !a.ip().is_unspecified() => (*a.ip(), false),
            _ => (detect_local_ipv4().unwrap_or(Ipv4Addr::LOCALHOST), true),
        };

        let now = Instant::now();
        Arc::new(ConnectivityProbe {
            main_demux,
            test_io,
            directory,
            events,
            auto_configure: config.auto_configure,
            fallback_hosts: config.stun_fallback_hosts.clone(),
            detect_interface,
            inner: RwLock::new(ProbeInner {
                status: ConnectionStatus::FindingStunFriends,
                status_since: now,
                last_tick: now,
                last_interface_check: now,
                local_ip,
                external_addr: None,
                stun_servers: Vec::new(),
                pending: FxHashMap::default(),
                main_port_mapping: None,
                upnp_task: None,
                upnp_mapping: None,
                upnp_checked: now,
                dns_task: None,
            }),
        })
    }

    pub async fn status(&self) -> ConnectionStatus {
        self.inner.read().await.status
    }

    #[cfg(test)]
    pub(crate) async fn force_status(&self, status: ConnectionStatus) {
        self.inner.write().await.status = status;
    }

    pub async fn external_addr(&self) -> Option<PeerAddr> {
        self.inner.read().await.external_addr
    }

    pub async fn local_ip(&self) -> Ipv4Addr {
        self.inner.read().await.local_ip
    }

    fn main_port(&self) -> u16 {
        self.main_demux.packet_io().local_port()
    }

    pub async fn start(&self) {
        let mut inner = self.inner.write().await;
        self.enter(&mut inner, ConnectionStatus::FindingStunFriends).await;
    }

    /// Back to square one: forget every learned fact and run the whole classification again.
    pub async fn reset(&self) {
        info!("restarting reachability probe");
        let mut inner = self.inner.write().await;
        if let Some(task) = inner.upnp_task.take() {
            task.abort();
        }
        if let Some(mapping) = inner.upnp_mapping.take() {
            upnp::remove_mapping(mapping.external_port);
        }
        if let Some(task) = inner.dns_task.take() {
            task.abort();
        }
        inner.stun_servers.clear();
        inner.pending.clear();
        inner.external_addr = None;
        inner.main_port_mapping = None;
        inner.status = ConnectionStatus::FindingStunFriends;
        self.main_demux.set_keepalive_target(None).await;

        self.enter(&mut inner, ConnectionStatus::FindingStunFriends).await;
    }

    pub async fn tick(&self) {
        let now = Instant::now();
        let mut restart = false;
        {
            let mut inner = self.inner.write().await;

            // suspend/resume shows up as a gap between ticks
            let gap = now - inner.last_tick;
            inner.last_tick = now;
            if gap > RESTART_AFTER_GAP {
                warn!("{:?} gap between ticks, assuming suspend/resume", gap);
                restart = true;
            }

            if self.detect_interface && now - inner.last_interface_check >= INTERFACE_CHECK_INTERVAL {
                inner.last_interface_check = now;
                if let Some(ip) = detect_local_ipv4() {
                    if ip != inner.local_ip {
                        info!("local interface address changed from {} to {}", inner.local_ip, ip);
                        inner.local_ip = ip;
                        restart = true;
                    }
                }
            }

            if !restart {
                self.poll_background_tasks(&mut inner).await;
                self.check_step_timeout(&mut inner, now).await;
            }
        }
        if restart {
            self.reset().await;
        }
    }

    async fn poll_background_tasks(&self, inner: &mut ProbeInner) {
        if inner.status == ConnectionStatus::FindingStunFallbackServers
            && inner.dns_task.as_ref().is_some_and(|t| t.is_finished())
        {
            let task = inner.dns_task.take().unwrap();
            match task.await {
                Ok(servers) => {
                    for (i, server) in servers.into_iter().enumerate() {
                        self.send_probe(inner, server, format!("fallback-{}", i), false, None).await;
                    }
                }
                Err(e) => debug!("STUN fallback resolution task failed: {}", e),
            }
        }

        if inner.status == ConnectionStatus::TryingUpnp
            && inner.upnp_task.as_ref().is_some_and(|t| t.is_finished())
        {
            let task = inner.upnp_task.take().unwrap();
            match task.result().await {
                Ok(mapping) => {
                    inner.upnp_mapping = Some(mapping);
                    self.enter(inner, ConnectionStatus::StunningUpnpTest).await;
                }
                Err(e) => {
                    debug!("UPnP unavailable: {:#}", e);
                    self.enter(inner, ConnectionStatus::StunningMainPort).await;
                }
            }
        }

        if inner.status == ConnectionStatus::UpnpInUse {
            let now = Instant::now();
            if inner.upnp_task.is_none() && now - inner.upnp_checked >= UPNP_REVALIDATE_INTERVAL {
                inner.upnp_checked = now;
                debug!("re-validating UPnP mapping");
                inner.upnp_task = Some(UpnpTask::add_mapping(inner.local_ip, self.main_port()));
            }
            if inner.upnp_task.as_ref().is_some_and(|t| t.is_finished()) {
                let task = inner.upnp_task.take().unwrap();
                match task.result().await {
                    Ok(mapping) => inner.upnp_mapping = Some(mapping),
                    Err(e) => warn!("UPnP mapping re-validation failed: {:#}", e),
                }
            }
        }
    }

    async fn check_step_timeout(&self, inner: &mut ProbeInner, now: Instant) {
        if inner.status.is_terminal() || now - inner.status_since < inner.status.timeout() {
            return;
        }
        debug!("step {:?} timed out", inner.status);

        let next = match inner.status {
            ConnectionStatus::FindingStunFriends => ConnectionStatus::FindingStunFallbackServers,
            ConnectionStatus::FindingStunFallbackServers => {
                if let Some(task) = inner.dns_task.take() {
                    task.abort();
                }
                if inner.stun_servers.is_empty() {
                    ConnectionStatus::Unknown
                } else {
                    // a single responder has to double as primary and secondary
                    ConnectionStatus::StunningInitial
                }
            }
            ConnectionStatus::StunningInitial => {
                if self.auto_configure {
                    ConnectionStatus::TryingUpnp
                } else {
                    ConnectionStatus::Unknown
                }
            }
            ConnectionStatus::TryingUpnp => {
                if let Some(task) = inner.upnp_task.take() {
                    task.abort();
                }
                ConnectionStatus::StunningMainPort
            }
            ConnectionStatus::StunningUpnpTest => ConnectionStatus::StunningMainPort,
            ConnectionStatus::StunningMainPort => ConnectionStatus::Unknown,
            ConnectionStatus::StunningUdpHolePunchingTest => ConnectionStatus::StunningFirewallRestrictionTest,
            ConnectionStatus::StunningFirewallRestrictionTest => ConnectionStatus::Unknown,
            terminal => terminal,
        };
        self.enter(inner, next).await;
    }

    /// Perform the transition to `to`, chaining on through steps that turn out to be moot
    ///  (no friend candidates, no fallback hosts configured).
    async fn enter(&self, inner: &mut ProbeInner, to: ConnectionStatus) {
        let mut to = to;
        loop {
            debug_assert!(to >= inner.status);
            info!("connection status {:?} -> {:?}", inner.status, to);
            inner.status = to;
            inner.status_since = Instant::now();
            inner.pending.clear();
            self.events.send_event(CoreEvent::ConnectionStatusChanged {
                status: to,
                auto_configure: self.auto_configure,
            });

            match self.perform_entry(inner, to).await {
                Some(next) => to = next,
                None => return,
            }
        }
    }

    async fn perform_entry(&self, inner: &mut ProbeInner, status: ConnectionStatus) -> Option<ConnectionStatus> {
        match status {
            ConnectionStatus::FindingStunFriends => {
                let mut candidates = Vec::new();
                for friend in self.directory.friends().await {
                    if let Some(addr) = friend.external_addr {
                        if !candidates.contains(&addr) {
                            candidates.push(addr);
                        }
                    }
                }
                candidates.truncate(MAX_FRIEND_PROBES);
                if candidates.is_empty() {
                    return Some(ConnectionStatus::FindingStunFallbackServers);
                }
                for addr in candidates {
                    self.send_probe(inner, addr, "friend".to_string(), false, None).await;
                }
            }

            ConnectionStatus::FindingStunFallbackServers => {
                if self.fallback_hosts.is_empty() {
                    return Some(ConnectionStatus::Unknown);
                }
                let hosts = self.fallback_hosts.clone();
                inner.dns_task = Some(tokio::spawn(async move {
                    let mut addrs = Vec::new();
                    for host in hosts {
                        match tokio::net::lookup_host(&host).await {
                            Ok(resolved) => {
                                let v4 = resolved.into_iter().find_map(|a| match a {
                                    SocketAddr::V4(a) => Some(PeerAddr::from(a)),
                                    SocketAddr::V6(_) => None,
                                });
                                match v4 {
                                    Some(addr) => addrs.push(addr),
                                    None => debug!("STUN fallback host {} has no IPv4 address", host),
                                }
                            }
                            Err(e) => debug!("resolving STUN fallback host {} failed: {}", host, e),
                        }
                    }
                    addrs
                }));
            }

            ConnectionStatus::StunningInitial => {
                let primary = self.primary(inner);
                self.send_probe(inner, primary, "primary".to_string(), false, None).await;
            }

            ConnectionStatus::TryingUpnp => {
                inner.upnp_task = Some(UpnpTask::add_mapping(inner.local_ip, self.main_port()));
            }

            ConnectionStatus::StunningUpnpTest => {
                let primary = self.primary(inner);
                self.send_probe(inner, primary, "primary".to_string(), true, None).await;
            }

            ConnectionStatus::StunningMainPort => {
                let secondary = self.secondary(inner);
                self.send_probe(inner, secondary, "secondary".to_string(), true, None).await;
            }

            ConnectionStatus::StunningUdpHolePunchingTest => {
                // sent from the test port, answered (if the NAT is full cone) on the main port.
                //  Must go to the primary: the preceding main-port probe went to the secondary,
                //  so the main port holds no mapping the primary's answer could be riding on.
                let primary = self.primary(inner);
                let main_port = self.main_port();
                self.send_probe(inner, primary, "primary".to_string(), false, Some(main_port)).await;
            }

            ConnectionStatus::StunningFirewallRestrictionTest => {
                let primary = self.primary(inner);
                self.send_probe(inner, primary, "primary".to_string(), true, None).await;
            }

            terminal => {
                self.finish(inner, terminal).await;
            }
        }
        None
    }

    async fn finish(&self, inner: &mut ProbeInner, verdict: ConnectionStatus) {
        if matches!(verdict,
            ConnectionStatus::UdpHolePunching
            | ConnectionStatus::RestrictedConeUdpHolePunching
            | ConnectionStatus::SymmetricNat
            | ConnectionStatus::Unknown)
        {
            // keep the NAT mapping for our external address warm
            if let Some(primary) = inner.stun_servers.first().copied() {
                self.main_demux.set_keepalive_target(Some(primary)).await;
            }
        }

        if inner.external_addr.is_none() {
            // never learned our external address first-hand; the directory saw where we
            //  connected from and is the last resort
            if let Some(addr) = self.directory.lookup_external_address().await {
                debug!("using external address {} reported by the directory", addr);
                inner.external_addr = Some(addr);
            }
        }
        if let Some(addr) = inner.external_addr {
            self.directory.report_external_address(addr).await;
        }

        info!("reachability verdict: {:?}, external address {:?}", verdict, inner.external_addr);
        self.events.send_event(CoreEvent::ConnectionReady);
    }

    fn primary(&self, inner: &ProbeInner) -> PeerAddr {
        inner.stun_servers[0]
    }

    fn secondary(&self, inner: &ProbeInner) -> PeerAddr {
        inner.stun_servers.get(1).copied().unwrap_or(inner.stun_servers[0])
    }

    async fn send_probe(
        &self,
        inner: &mut ProbeInner,
        server: PeerAddr,
        server_name: String,
        from_main_port: bool,
        response_port: Option<u16>,
    ) {
        let request = BindingRequest::new(response_port);
        let expected_reply_port = response_port.unwrap_or(if from_main_port {
            self.main_port()
        } else {
            self.test_io.local_port()
        });
        trace!("sending STUN probe to {} ({}), expecting reply on port {}", server, server_name, expected_reply_port);
        inner.pending.insert(request.transaction_id, PendingStunTransaction {
            server,
            server_name,
            expected_reply_port,
        });
        if from_main_port {
            self.main_demux.send_stun_request(server, &request).await;
        } else {
            self.test_io.send_to(server, &request.to_bytes()).await;
        }
    }
}

#[async_trait]
impl StunHandler for ConnectivityProbe {
    async fn on_binding_response(&self, from: PeerAddr, local_port: u16, response: BindingResponse) {
        let mut inner = self.inner.write().await;

        let Some(pending) = inner.pending.remove(&response.transaction_id) else {
            trace!("STUN response from {} with unknown transaction id, ignoring", from);
            return;
        };
        if local_port != pending.expected_reply_port {
            debug!("STUN response from {} ({}) arrived on port {} instead of {}, ignoring",
                from, pending.server_name, local_port, pending.expected_reply_port);
            return;
        }
        if from != pending.server {
            debug!("STUN response for a probe to {} arrived from {}", pending.server, from);
        }

        match inner.status {
            ConnectionStatus::FindingStunFriends | ConnectionStatus::FindingStunFallbackServers => {
                if !inner.stun_servers.contains(&from) {
                    info!("using {} ({}) as STUN server", from, pending.server_name);
                    inner.stun_servers.push(from);
                }
                if inner.stun_servers.len() >= SUFFICIENT_STUN_SERVERS {
                    self.enter(&mut inner, ConnectionStatus::StunningInitial).await;
                }
            }

            ConnectionStatus::StunningInitial => {
                let local = PeerAddr::new(inner.local_ip, self.test_io.local_port());
                if response.mapped == local {
                    inner.external_addr = Some(PeerAddr::new(inner.local_ip, self.main_port()));
                    self.enter(&mut inner, ConnectionStatus::Unfirewalled).await;
                } else {
                    // something maps us, and the mapping works without our doing - a
                    //  configured port forwarding
                    inner.external_addr = Some(PeerAddr::new(response.mapped.ip, self.main_port()));
                    self.enter(&mut inner, ConnectionStatus::PortForwarded).await;
                }
            }

            ConnectionStatus::StunningUpnpTest => {
                inner.external_addr = Some(response.mapped);
                self.enter(&mut inner, ConnectionStatus::UpnpInUse).await;
            }

            ConnectionStatus::StunningMainPort => {
                inner.main_port_mapping = Some(response.mapped);
                inner.external_addr = Some(response.mapped);
                self.enter(&mut inner, ConnectionStatus::StunningUdpHolePunchingTest).await;
            }

            ConnectionStatus::StunningUdpHolePunchingTest => {
                // the answer reached our main port although that port never contacted the
                //  server: one outbound datagram opens the mapping for everyone
                self.enter(&mut inner, ConnectionStatus::UdpHolePunching).await;
            }

            ConnectionStatus::StunningFirewallRestrictionTest => {
                let stable = inner.main_port_mapping.map(|m| m.port) == Some(response.mapped.port);
                let verdict = if stable {
                    ConnectionStatus::RestrictedConeUdpHolePunching
                } else {
                    ConnectionStatus::SymmetricNat
                };
                self.enter(&mut inner, verdict).await;
            }

            other => trace!("STUN response from {} in state {:?}, ignoring", from, other),
        }
    }
}

/// The local interface used for Internet traffic, found by "connecting" a throwaway UDP socket
///  to a public address. No packet is sent; the OS just picks the route.
fn detect_local_ipv4() -> Option<Ipv4Addr> {
    let socket = std::net::UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:80").ok()?;
    match socket.local_addr().ok()? {
        SocketAddr::V4(a) => Some(*a.ip()),
        SocketAddr::V6(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use transport::stun::new_transaction_id;

    use crate::boundary::FriendRecord;

    use super::*;

    struct TestDirectory {
        friends: Vec<FriendRecord>,
        external_hint: Option<PeerAddr>,
        reported: Mutex<Vec<PeerAddr>>,
    }

    impl TestDirectory {
        fn new(friend_addrs: &[PeerAddr]) -> TestDirectory {
            let friends = friend_addrs.iter().enumerate()
                .map(|(i, addr)| FriendRecord {
                    friend_id: i as u32 + 1,
                    cert_id: 1000 + i as u64,
                    name: format!("friend-{}", i),
                    local_addr: None,
                    external_addr: Some(*addr),
                    signed_up: true,
                })
                .collect();
            TestDirectory { friends, external_hint: None, reported: Mutex::new(Vec::new()) }
        }
    }

    #[async_trait]
    impl FriendDirectory for TestDirectory {
        async fn friends(&self) -> Vec<FriendRecord> {
            self.friends.clone()
        }
        async fn request_refresh(&self) {}
        async fn report_external_address(&self, addr: PeerAddr) {
            self.reported.lock().unwrap().push(addr);
        }
        async fn lookup_external_address(&self) -> Option<PeerAddr> {
            self.external_hint
        }
    }

    struct Fixture {
        probe: Arc<ConnectivityProbe>,
        directory: Arc<TestDirectory>,
        events: Arc<CoreEventNotifier>,
        main_port: u16,
        test_port: u16,
    }

    async fn fixture(directory: TestDirectory) -> Fixture {
        let main_io = Arc::new(PacketIo::bind("127.0.0.1:0".parse().unwrap()).await.unwrap());
        let test_io = Arc::new(PacketIo::bind("127.0.0.1:0".parse().unwrap()).await.unwrap());
        let main_port = main_io.local_port();
        let test_port = test_io.local_port();

        let mut config = NodeConfig::new(1, 0, 0);
        config.main_addr = main_io.local_addr().unwrap().socket_addr();
        config.auto_configure = false;
        config.stun_fallback_hosts = Vec::new();

        let directory = Arc::new(directory);
        let events = Arc::new(CoreEventNotifier::new());
        let probe = ConnectivityProbe::new(
            &config,
            Demultiplexer::new(main_io),
            test_io,
            directory.clone(),
            events.clone(),
        );
        Fixture { probe, directory, events, main_port, test_port }
    }

    /// The transaction ids of all pending probes to the given server.
    async fn pending_to(probe: &ConnectivityProbe, server: PeerAddr) -> Vec<TransactionId> {
        probe.inner.read().await.pending.iter()
            .filter(|(_, p)| p.server == server)
            .map(|(id, _)| *id)
            .collect()
    }

    async fn discover_servers(f: &Fixture, server1: PeerAddr, server2: PeerAddr) {
        f.probe.start().await;
        assert_eq!(f.probe.status().await, ConnectionStatus::FindingStunFriends);

        for server in [server1, server2] {
            let ids = pending_to(&f.probe, server).await;
            assert_eq!(ids.len(), 1);
            let mapped = PeerAddr::new(Ipv4Addr::new(203, 0, 113, 99), 4711);
            f.probe.on_binding_response(server, f.test_port, BindingResponse::new(ids[0], mapped)).await;
        }
        assert_eq!(f.probe.status().await, ConnectionStatus::StunningInitial);
    }

    #[tokio::test]
    async fn test_mapped_address_equal_to_local_means_unfirewalled() {
        let server1: PeerAddr = "203.0.113.1:3478".parse().unwrap();
        let server2: PeerAddr = "203.0.113.2:3478".parse().unwrap();
        let f = fixture(TestDirectory::new(&[server1, server2])).await;
        let mut events = f.events.subscribe();

        discover_servers(&f, server1, server2).await;

        let ids = pending_to(&f.probe, server1).await;
        let local_at_test_port = PeerAddr::new(Ipv4Addr::LOCALHOST, f.test_port);
        f.probe.on_binding_response(server1, f.test_port, BindingResponse::new(ids[0], local_at_test_port)).await;

        assert_eq!(f.probe.status().await, ConnectionStatus::Unfirewalled);
        let expected_external = PeerAddr::new(Ipv4Addr::LOCALHOST, f.main_port);
        assert_eq!(f.probe.external_addr().await, Some(expected_external));
        assert_eq!(f.directory.reported.lock().unwrap().as_slice(), &[expected_external]);

        let mut saw_ready = false;
        while let Ok(event) = events.try_recv() {
            saw_ready |= event == CoreEvent::ConnectionReady;
        }
        assert!(saw_ready);
    }

    #[tokio::test]
    async fn test_differing_mapped_address_means_port_forwarded() {
        let server1: PeerAddr = "203.0.113.1:3478".parse().unwrap();
        let server2: PeerAddr = "203.0.113.2:3478".parse().unwrap();
        let f = fixture(TestDirectory::new(&[server1, server2])).await;

        discover_servers(&f, server1, server2).await;

        let ids = pending_to(&f.probe, server1).await;
        let mapped = PeerAddr::new(Ipv4Addr::new(198, 51, 100, 7), 40210);
        f.probe.on_binding_response(server1, f.test_port, BindingResponse::new(ids[0], mapped)).await;

        assert_eq!(f.probe.status().await, ConnectionStatus::PortForwarded);
        assert_eq!(f.probe.external_addr().await,
            Some(PeerAddr::new(Ipv4Addr::new(198, 51, 100, 7), f.main_port)));
    }

    async fn drive_to_firewall_restriction_test(f: &Fixture, server1: PeerAddr, server2: PeerAddr, main_mapped_port: u16) {
        {
            let mut inner = f.probe.inner.write().await;
            inner.stun_servers = vec![server1, server2];
            f.probe.enter(&mut inner, ConnectionStatus::StunningMainPort).await;
        }

        let ids = pending_to(&f.probe, server2).await;
        let mapped = PeerAddr::new(Ipv4Addr::new(198, 51, 100, 7), main_mapped_port);
        f.probe.on_binding_response(server2, f.main_port, BindingResponse::new(ids[0], mapped)).await;
        assert_eq!(f.probe.status().await, ConnectionStatus::StunningUdpHolePunchingTest);

        // no answer to the hole punching test
        tokio::time::sleep(LONG_STEP_TIMEOUT).await;
        f.probe.tick().await;
        assert_eq!(f.probe.status().await, ConnectionStatus::StunningFirewallRestrictionTest);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stable_mapped_port_means_restricted_cone() {
        let server1: PeerAddr = "203.0.113.1:3478".parse().unwrap();
        let server2: PeerAddr = "203.0.113.2:3478".parse().unwrap();
        let f = fixture(TestDirectory::new(&[])).await;

        drive_to_firewall_restriction_test(&f, server1, server2, 40210).await;

        let ids = pending_to(&f.probe, server1).await;
        let mapped = PeerAddr::new(Ipv4Addr::new(198, 51, 100, 7), 40210);
        f.probe.on_binding_response(server1, f.main_port, BindingResponse::new(ids[0], mapped)).await;

        assert_eq!(f.probe.status().await, ConnectionStatus::RestrictedConeUdpHolePunching);
    }

    #[tokio::test(start_paused = true)]
    async fn test_changing_mapped_port_means_symmetric_nat() {
        let server1: PeerAddr = "203.0.113.1:3478".parse().unwrap();
        let server2: PeerAddr = "203.0.113.2:3478".parse().unwrap();
        let f = fixture(TestDirectory::new(&[])).await;

        drive_to_firewall_restriction_test(&f, server1, server2, 40210).await;

        let ids = pending_to(&f.probe, server1).await;
        let mapped = PeerAddr::new(Ipv4Addr::new(198, 51, 100, 7), 40211);
        f.probe.on_binding_response(server1, f.main_port, BindingResponse::new(ids[0], mapped)).await;

        assert_eq!(f.probe.status().await, ConnectionStatus::SymmetricNat);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hole_punch_answer_on_main_port_means_full_cone() {
        let server1: PeerAddr = "203.0.113.1:3478".parse().unwrap();
        let server2: PeerAddr = "203.0.113.2:3478".parse().unwrap();
        let f = fixture(TestDirectory::new(&[])).await;

        {
            let mut inner = f.probe.inner.write().await;
            inner.stun_servers = vec![server1, server2];
            f.probe.enter(&mut inner, ConnectionStatus::StunningUdpHolePunchingTest).await;
        }

        let ids = pending_to(&f.probe, server1).await;
        let mapped = PeerAddr::new(Ipv4Addr::new(198, 51, 100, 7), 40210);
        f.probe.on_binding_response(server1, f.main_port, BindingResponse::new(ids[0], mapped)).await;

        assert_eq!(f.probe.status().await, ConnectionStatus::UdpHolePunching);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hole_punch_probe_goes_to_the_untouched_primary() {
        // the main-port probe talks to the secondary, so only an answer from the primary is
        //  proof of an unsolicited inbound datagram getting through
        let server1: PeerAddr = "203.0.113.1:3478".parse().unwrap();
        let server2: PeerAddr = "203.0.113.2:3478".parse().unwrap();
        let f = fixture(TestDirectory::new(&[])).await;

        {
            let mut inner = f.probe.inner.write().await;
            inner.stun_servers = vec![server1, server2];
            f.probe.enter(&mut inner, ConnectionStatus::StunningMainPort).await;
        }
        let ids = pending_to(&f.probe, server2).await;
        let mapped = PeerAddr::new(Ipv4Addr::new(198, 51, 100, 7), 40210);
        f.probe.on_binding_response(server2, f.main_port, BindingResponse::new(ids[0], mapped)).await;
        assert_eq!(f.probe.status().await, ConnectionStatus::StunningUdpHolePunchingTest);

        let to_primary = pending_to(&f.probe, server1).await;
        let to_secondary = pending_to(&f.probe, server2).await;
        assert_eq!((to_primary.len(), to_secondary.len()), (1, 0));

        let inner = f.probe.inner.read().await;
        assert_eq!(inner.pending[&to_primary[0]].expected_reply_port, f.main_port);
    }

    #[tokio::test]
    async fn test_no_servers_at_all_resolves_to_unknown_with_directory_fallback() {
        let external_hint: PeerAddr = "198.51.100.7:1680".parse().unwrap();
        let mut directory = TestDirectory::new(&[]);
        directory.external_hint = Some(external_hint);
        let f = fixture(directory).await;
        let mut events = f.events.subscribe();

        // no friends, no fallback hosts configured: the probe falls through immediately
        f.probe.start().await;

        assert_eq!(f.probe.status().await, ConnectionStatus::Unknown);
        assert_eq!(f.probe.external_addr().await, Some(external_hint));
        assert_eq!(f.directory.reported.lock().unwrap().as_slice(), &[external_hint]);

        let mut saw_ready = false;
        while let Ok(event) = events.try_recv() {
            saw_ready |= event == CoreEvent::ConnectionReady;
        }
        assert!(saw_ready);
    }

    #[tokio::test]
    async fn test_stale_responses_are_ignored_after_transition() {
        let server1: PeerAddr = "203.0.113.1:3478".parse().unwrap();
        let server2: PeerAddr = "203.0.113.2:3478".parse().unwrap();
        let f = fixture(TestDirectory::new(&[server1, server2])).await;

        discover_servers(&f, server1, server2).await;

        // a late answer to one of the discovery probes must not disturb the current step
        let stale = BindingResponse::new(new_transaction_id(), "198.51.100.7:40210".parse().unwrap());
        f.probe.on_binding_response(server2, f.test_port, stale).await;
        assert_eq!(f.probe.status().await, ConnectionStatus::StunningInitial);
    }

    #[tokio::test]
    async fn test_reset_goes_back_to_the_first_state() {
        let server1: PeerAddr = "203.0.113.1:3478".parse().unwrap();
        let server2: PeerAddr = "203.0.113.2:3478".parse().unwrap();
        let f = fixture(TestDirectory::new(&[server1, server2])).await;

        discover_servers(&f, server1, server2).await;

        let ids = pending_to(&f.probe, server1).await;
        let local_at_test_port = PeerAddr::new(Ipv4Addr::LOCALHOST, f.test_port);
        f.probe.on_binding_response(server1, f.test_port, BindingResponse::new(ids[0], local_at_test_port)).await;
        assert!(f.probe.status().await.is_terminal());

        f.probe.reset().await;
        assert_eq!(f.probe.status().await, ConnectionStatus::FindingStunFriends);
        assert_eq!(f.probe.external_addr().await, None);
        assert!(f.probe.inner.read().await.stun_servers.is_empty());
    }

    #[tokio::test]
    async fn test_status_order_matches_probing_sequence() {
        assert!(ConnectionStatus::FindingStunFriends < ConnectionStatus::StunningInitial);
        assert!(ConnectionStatus::StunningFirewallRestrictionTest < ConnectionStatus::Unfirewalled);
        assert!(!ConnectionStatus::StunningMainPort.is_terminal());
        assert!(ConnectionStatus::SymmetricNat.is_terminal());
        assert!(ConnectionStatus::Unknown.is_terminal());
    }
}
