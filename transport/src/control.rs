use std::net::Ipv4Addr;

use anyhow::bail;
use bytes::{Buf, BufMut};
use num_enum::TryFromPrimitive;

use crate::peer_addr::PeerAddr;

/// The three fixed-format control datagrams exchanged between friends outside any stream.
///
/// All three are exactly 12 bytes, all integers network byte order:
/// ```ascii
/// 0:  u16  magic (see [ControlKind])
/// 2:  u16  sender port
/// 4:  u32  sender IPv4
/// 8:  u32  sender friend id
/// ```
///
/// They are authenticated only by the receiver matching the sender address against the address
///  it already knows for that friend id - certificate-level authentication happens in higher
///  layers before any file data moves, and this layering is deliberate.
#[derive(Clone, Copy, Eq, PartialEq, Debug, TryFromPrimitive)]
#[repr(u16)]
pub enum ControlKind {
    /// "I am reachable here, and/or inviting you to connect" - doubles as the periodic NAT
    ///  hole keep-open heartbeat.
    UdpTunneler = 0xAF52,
    /// Reply to a tunneler: "start your half of the UDP handshake now".
    UdpConnectionNotice = 0xAF53,
    /// "Please dial me back over TCP."
    TcpConnectionRequest = 0xAF54,
}

#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub struct ControlPacket {
    pub kind: ControlKind,
    pub sender_addr: PeerAddr,
    pub sender_friend_id: u32,
}

impl ControlPacket {
    pub const SERIALIZED_LEN: usize = 12;

    pub fn new(kind: ControlKind, sender_addr: PeerAddr, sender_friend_id: u32) -> ControlPacket {
        ControlPacket { kind, sender_addr, sender_friend_id }
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u16(self.kind as u16);
        buf.put_u16(self.sender_addr.port);
        buf.put_u32(self.sender_addr.ip.to_bits());
        buf.put_u32(self.sender_friend_id);
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::SERIALIZED_LEN);
        self.ser(&mut buf);
        buf
    }

    /// Strict by design: anything that is not exactly 12 bytes with a known magic is not a
    ///  control packet and belongs to some other protocol on the shared socket.
    pub fn try_deser(data: &[u8]) -> anyhow::Result<ControlPacket> {
        if data.len() != Self::SERIALIZED_LEN {
            bail!("control packet must be exactly {} bytes, was {}", Self::SERIALIZED_LEN, data.len());
        }
        let buf = &mut &data[..];
        let magic = buf.get_u16();
        let Ok(kind) = ControlKind::try_from(magic) else {
            bail!("unknown control packet magic {:#06x}", magic);
        };
        let port = buf.get_u16();
        let ip = Ipv4Addr::from_bits(buf.get_u32());
        let sender_friend_id = buf.get_u32();
        Ok(ControlPacket {
            kind,
            sender_addr: PeerAddr::new(ip, port),
            sender_friend_id,
        })
    }

    /// Cheap type check used by the demultiplexer before committing to a full decode.
    pub fn looks_like_control(data: &[u8]) -> bool {
        data.len() == Self::SERIALIZED_LEN
            && ControlKind::try_from(u16::from_be_bytes([data[0], data[1]])).is_ok()
    }
}
