use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

/// Static configuration for a peer node. There is no dynamic reconfiguration; changing any of
///  this means restarting the node.
#[derive(Clone, Debug)]
pub struct NodeConfig {
    /// Our id in the friend directory, sent in every control datagram.
    pub own_friend_id: u32,

    /// Bind address of the main socket. All friend traffic (control datagrams and streams)
    ///  goes through this one socket so NAT mappings stay warm.
    pub main_addr: SocketAddr,

    /// Bind address of the secondary socket used for reachability probing. Several probe steps
    ///  need a second local port to compare NAT mappings against.
    pub test_addr: SocketAddr,

    /// Attempt router auto-configuration (port mapping) when direct reachability fails.
    pub auto_configure: bool,

    /// Public STUN servers, tried when no friend answers binding requests. Host names, resolved
    ///  lazily when needed.
    pub stun_fallback_hosts: Vec<String>,

    /// Mask deciding whether a friend's LAN address counts as "same subnet" for local dialing.
    pub subnet_mask: Ipv4Addr,
}

impl NodeConfig {
    pub fn new(own_friend_id: u32, main_port: u16, test_port: u16) -> NodeConfig {
        NodeConfig {
            own_friend_id,
            main_addr: SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, main_port)),
            test_addr: SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, test_port)),
            auto_configure: true,
            stun_fallback_hosts: vec![
                "stun.l.google.com:19302".to_string(),
                "stun.ekiga.net:3478".to_string(),
            ],
            subnet_mask: Ipv4Addr::new(255, 255, 255, 0),
        }
    }
}
