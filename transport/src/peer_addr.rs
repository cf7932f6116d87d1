use std::fmt::{Debug, Display, Formatter};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use anyhow::{anyhow, bail};
use bytes::{Buf, BufMut};

/// A peer's `(IPv4, port)` endpoint as a value type.
///
/// All wire formats in this protocol carry addresses in network byte order, and all byte-order
///  conversions go through `ser` / `try_deser` here - nothing else in the code base touches
///  raw address bytes.
///
/// NB: The protocol is IPv4 only. V6 addresses are rejected at the conversion boundary rather
///      than carried around and rejected late.
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PeerAddr {
    pub ip: Ipv4Addr,
    pub port: u16,
}

impl PeerAddr {
    pub fn new(ip: Ipv4Addr, port: u16) -> PeerAddr {
        PeerAddr { ip, port }
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u16(self.port);
        buf.put_u32(self.ip.to_bits());
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<PeerAddr> {
        let port = buf.try_get_u16()?;
        let ip = Ipv4Addr::from_bits(buf.try_get_u32()?);
        Ok(PeerAddr { ip, port })
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.ip, self.port))
    }

    pub fn from_socket_addr(addr: SocketAddr) -> anyhow::Result<PeerAddr> {
        match addr {
            SocketAddr::V4(a) => Ok(PeerAddr::new(*a.ip(), a.port())),
            SocketAddr::V6(_) => bail!("IPv6 peer address is not supported: {:?}", addr),
        }
    }

    /// Same-subnet check used by the scheduler to prefer a friend's advertised LAN address
    ///  over its external address.
    pub fn same_subnet(&self, other: &PeerAddr, mask: Ipv4Addr) -> bool {
        self.ip.to_bits() & mask.to_bits() == other.ip.to_bits() & mask.to_bits()
    }

    pub fn with_port(&self, port: u16) -> PeerAddr {
        PeerAddr { ip: self.ip, port }
    }
}

impl Display for PeerAddr {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}
impl Debug for PeerAddr {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

impl From<SocketAddrV4> for PeerAddr {
    fn from(addr: SocketAddrV4) -> Self {
        PeerAddr::new(*addr.ip(), addr.port())
    }
}

impl std::str::FromStr for PeerAddr {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let addr: SocketAddrV4 = s.parse()
            .map_err(|_| anyhow!("not an IPv4 socket address: {}", s))?;
        Ok(addr.into())
    }
}

#[cfg(test)]
mod tests {
    use bytes::BytesMut;
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case("127.0.0.1:9876")]
    #[case("4.5.6.7:89")]
    #[case("203.0.113.5:1680")]
    #[case("255.255.255.255:65535")]
    fn test_ser_deser(#[case] addr: &str) {
        let addr: PeerAddr = addr.parse().unwrap();
        let mut buf = BytesMut::new();
        addr.ser(&mut buf);
        assert_eq!(buf.len(), 6);
        let deser = PeerAddr::try_deser(&mut buf);
        assert_eq!(deser.unwrap(), addr);
    }

    #[test]
    fn test_deser_truncated() {
        let mut buf: &[u8] = &[0x12, 0x34, 0x01];
        assert!(PeerAddr::try_deser(&mut buf).is_err());
    }

    #[test]
    fn test_network_byte_order() {
        let addr: PeerAddr = "192.168.1.10:30000".parse().unwrap();
        let mut buf = BytesMut::new();
        addr.ser(&mut buf);
        assert_eq!(buf.as_ref(), &[0x75, 0x30, 192, 168, 1, 10]);
    }

    #[rstest]
    #[case("192.168.1.10:30000", "192.168.1.99:40000", true)]
    #[case("192.168.1.10:30000", "192.168.2.10:30000", false)]
    #[case("10.0.0.1:1", "10.0.0.2:2", true)]
    fn test_same_subnet(#[case] a: &str, #[case] b: &str, #[case] expected: bool) {
        let a: PeerAddr = a.parse().unwrap();
        let b: PeerAddr = b.parse().unwrap();
        assert_eq!(a.same_subnet(&b, Ipv4Addr::new(255, 255, 255, 0)), expected);
    }

    #[test]
    fn test_rejects_v6() {
        let v6: SocketAddr = "[2001:db8::1]:8080".parse().unwrap();
        assert!(PeerAddr::from_socket_addr(v6).is_err());
    }
}
