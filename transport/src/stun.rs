use std::net::Ipv4Addr;

use anyhow::bail;
use bytes::{Buf, BufMut};
use rand::Rng;

use crate::peer_addr::PeerAddr;

/// The subset of the STUN wire format this protocol needs: binding requests with an optional
///  RESPONSE-PORT attribute, and binding responses carrying the mapped address.
///
/// Both sides of the codec are used - a peer queries STUN servers for its own mapped address,
///  and also answers binding requests from friends, acting as an impromptu reflector for their
///  reachability probes.
///
/// Wire format per RFC 5389: 20-byte header (type u16, length u16, magic cookie u32,
///  transaction id 12 bytes) followed by TLV attributes padded to 4-byte boundaries.

pub const MAGIC_COOKIE: u32 = 0x2112_A442;

const BINDING_REQUEST: u16 = 0x0001;
const BINDING_RESPONSE: u16 = 0x0101;

const ATTR_MAPPED_ADDRESS: u16 = 0x0001;
const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;
const ATTR_RESPONSE_PORT: u16 = 0x0027;

const FAMILY_IPV4: u8 = 0x01;

pub type TransactionId = [u8; 12];

pub fn new_transaction_id() -> TransactionId {
    let mut id = [0u8; 12];
    rand::rng().fill_bytes(&mut id);
    id
}

/// True if a datagram on the shared socket is plausibly STUN: the two topmost bits of every
///  STUN message type are zero, and the magic cookie is at a fixed offset.
pub fn looks_like_stun(data: &[u8]) -> bool {
    data.len() >= 20
        && data[0] & 0xC0 == 0
        && u32::from_be_bytes([data[4], data[5], data[6], data[7]]) == MAGIC_COOKIE
}

#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub struct BindingRequest {
    pub transaction_id: TransactionId,
    /// RESPONSE-PORT: ask the server to send its response to this port instead of the source
    ///  port of the request. This is what makes the hole-punching test possible.
    pub response_port: Option<u16>,
}

#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub struct BindingResponse {
    pub transaction_id: TransactionId,
    /// The source address of the request as the server saw it.
    pub mapped: PeerAddr,
}

#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum StunMessage {
    Request(BindingRequest),
    Response(BindingResponse),
}

impl StunMessage {
    pub fn try_deser(data: &[u8]) -> anyhow::Result<StunMessage> {
        if data.len() < 20 {
            bail!("STUN message too short: {} bytes", data.len());
        }
        let buf = &mut &data[..];
        let msg_type = buf.get_u16();
        let attr_len = buf.get_u16() as usize;
        let cookie = buf.get_u32();
        if cookie != MAGIC_COOKIE {
            bail!("bad STUN magic cookie {:#010x}", cookie);
        }
        let mut transaction_id = [0u8; 12];
        buf.copy_to_slice(&mut transaction_id);

        if buf.remaining() < attr_len {
            bail!("STUN message truncated: {} attribute bytes declared, {} present", attr_len, buf.remaining());
        }
        let attrs = &mut &buf[..attr_len];

        match msg_type {
            BINDING_REQUEST => {
                let mut response_port = None;
                each_attribute(attrs, |attr_type, value| {
                    if attr_type == ATTR_RESPONSE_PORT && value.len() >= 2 {
                        response_port = Some(u16::from_be_bytes([value[0], value[1]]));
                    }
                    Ok(())
                })?;
                Ok(StunMessage::Request(BindingRequest { transaction_id, response_port }))
            }
            BINDING_RESPONSE => {
                let mut mapped = None;
                let mut xor_mapped = None;
                each_attribute(attrs, |attr_type, value| {
                    match attr_type {
                        ATTR_MAPPED_ADDRESS => mapped = Some(deser_mapped_address(value, None)?),
                        ATTR_XOR_MAPPED_ADDRESS => xor_mapped = Some(deser_mapped_address(value, Some(()))?),
                        _ => {}
                    }
                    Ok(())
                })?;
                // XOR-MAPPED-ADDRESS wins: it survives NATs that rewrite literal addresses in payloads
                let Some(mapped) = xor_mapped.or(mapped) else {
                    bail!("STUN binding response without a mapped address");
                };
                Ok(StunMessage::Response(BindingResponse { transaction_id, mapped }))
            }
            t => bail!("unsupported STUN message type {:#06x}", t),
        }
    }
}

fn each_attribute(attrs: &mut &[u8], mut f: impl FnMut(u16, &[u8]) -> anyhow::Result<()>) -> anyhow::Result<()> {
    while attrs.remaining() >= 4 {
        let attr_type = attrs.get_u16();
        let len = attrs.get_u16() as usize;
        if attrs.remaining() < len {
            bail!("STUN attribute {:#06x} truncated", attr_type);
        }
        f(attr_type, &attrs[..len])?;
        // attributes are padded to 4-byte boundaries
        let padded = len + (4 - len % 4) % 4;
        attrs.advance(padded.min(attrs.remaining()));
    }
    Ok(())
}

fn deser_mapped_address(value: &[u8], xor: Option<()>) -> anyhow::Result<PeerAddr> {
    if value.len() < 8 {
        bail!("mapped address attribute too short");
    }
    if value[1] != FAMILY_IPV4 {
        bail!("unsupported address family {}", value[1]);
    }
    let mut port = u16::from_be_bytes([value[2], value[3]]);
    let mut ip = u32::from_be_bytes([value[4], value[5], value[6], value[7]]);
    if xor.is_some() {
        port ^= (MAGIC_COOKIE >> 16) as u16;
        ip ^= MAGIC_COOKIE;
    }
    Ok(PeerAddr::new(Ipv4Addr::from_bits(ip), port))
}

impl BindingRequest {
    pub fn new(response_port: Option<u16>) -> BindingRequest {
        BindingRequest {
            transaction_id: new_transaction_id(),
            response_port,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let attr_len: u16 = if self.response_port.is_some() { 8 } else { 0 };
        let mut buf = Vec::with_capacity(20 + attr_len as usize);
        buf.put_u16(BINDING_REQUEST);
        buf.put_u16(attr_len);
        buf.put_u32(MAGIC_COOKIE);
        buf.put_slice(&self.transaction_id);
        if let Some(port) = self.response_port {
            buf.put_u16(ATTR_RESPONSE_PORT);
            buf.put_u16(4);
            buf.put_u16(port);
            buf.put_u16(0); // padding
        }
        buf
    }
}

impl BindingResponse {
    pub fn new(transaction_id: TransactionId, mapped: PeerAddr) -> BindingResponse {
        BindingResponse { transaction_id, mapped }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(20 + 12);
        buf.put_u16(BINDING_RESPONSE);
        buf.put_u16(12);
        buf.put_u32(MAGIC_COOKIE);
        buf.put_slice(&self.transaction_id);

        buf.put_u16(ATTR_XOR_MAPPED_ADDRESS);
        buf.put_u16(8);
        buf.put_u8(0);
        buf.put_u8(FAMILY_IPV4);
        buf.put_u16(self.mapped.port ^ (MAGIC_COOKIE >> 16) as u16);
        buf.put_u32(self.mapped.ip.to_bits() ^ MAGIC_COOKIE);
        buf
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(None)]
    #[case(Some(30000))]
    fn test_request_roundtrip(#[case] response_port: Option<u16>) {
        let request = BindingRequest::new(response_port);
        let raw = request.to_bytes();
        assert!(looks_like_stun(&raw));

        match StunMessage::try_deser(&raw).unwrap() {
            StunMessage::Request(deser) => {
                assert_eq!(deser.transaction_id, request.transaction_id);
                assert_eq!(deser.response_port, response_port);
            }
            other => panic!("expected request, got {:?}", other),
        }
    }

    #[rstest]
    #[case("192.168.1.10:30000")]
    #[case("203.0.113.5:40210")]
    fn test_response_roundtrip(#[case] mapped: &str) {
        let mapped: PeerAddr = mapped.parse().unwrap();
        let response = BindingResponse::new(new_transaction_id(), mapped);
        let raw = response.to_bytes();
        assert!(looks_like_stun(&raw));

        match StunMessage::try_deser(&raw).unwrap() {
            StunMessage::Response(deser) => {
                assert_eq!(deser.transaction_id, response.transaction_id);
                assert_eq!(deser.mapped, mapped);
            }
            other => panic!("expected response, got {:?}", other),
        }
    }

    #[test]
    fn test_plain_mapped_address_fallback() {
        // hand-built response with only the (non-XOR) MAPPED-ADDRESS attribute
        let transaction_id = new_transaction_id();
        let mut raw = Vec::new();
        raw.put_u16(0x0101);
        raw.put_u16(12);
        raw.put_u32(MAGIC_COOKIE);
        raw.put_slice(&transaction_id);
        raw.put_u16(ATTR_MAPPED_ADDRESS);
        raw.put_u16(8);
        raw.put_u8(0);
        raw.put_u8(FAMILY_IPV4);
        raw.put_u16(40210);
        raw.put_u32(u32::from_be_bytes([203, 0, 113, 5]));

        match StunMessage::try_deser(&raw).unwrap() {
            StunMessage::Response(deser) => {
                assert_eq!(deser.mapped, "203.0.113.5:40210".parse().unwrap());
            }
            other => panic!("expected response, got {:?}", other),
        }
    }

    #[test]
    fn test_rejects_bad_cookie() {
        let mut raw = BindingRequest::new(None).to_bytes();
        raw[4] = 0x00;
        assert!(!looks_like_stun(&raw));
        assert!(StunMessage::try_deser(&raw).is_err());
    }

    #[test]
    fn test_rejects_short_message() {
        assert!(StunMessage::try_deser(&[0u8; 12]).is_err());
    }

    #[test]
    fn test_segment_is_not_stun() {
        use crate::segment::{Segment, SegmentFlags};
        let raw = Segment::control(SegmentFlags::SYN, 1, 0, 16).to_bytes();
        assert!(!looks_like_stun(&raw));
    }
}
