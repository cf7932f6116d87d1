use anyhow::bail;
use bitflags::bitflags;
use bytes::{Buf, BufMut, Bytes};

bitflags! {
    #[derive(Clone, Copy, Eq, PartialEq, Debug)]
    pub struct SegmentFlags: u8 {
        const SYN = 0b0000_0001;
        const ACK = 0b0000_0010;
        const FIN = 0b0000_0100;
        const RST = 0b0000_1000;
    }
}

/// One reliable-stream segment as it travels inside a UDP datagram.
///
/// The leading marker byte separates stream traffic from STUN (whose first byte always has the
///  two top bits clear) and from the fixed-size control datagrams (magic `0xAF5x`) sharing the
///  same socket - see the demultiplexer.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct Segment {
    pub flags: SegmentFlags,
    pub seq: u32,
    pub ack: u32,
    pub window: u16,
    pub payload: Bytes,
}

impl Segment {
    pub const MARKER: u8 = 0xC5;
    pub const HEADER_LEN: usize = 12;

    /// Chosen so that header plus payload stays below a single full Ethernet frame.
    pub const MAX_PAYLOAD: usize = 1400;

    pub fn new(flags: SegmentFlags, seq: u32, ack: u32, window: u16, payload: Bytes) -> Segment {
        Segment { flags, seq, ack, window, payload }
    }

    /// A segment carrying no payload, used for handshake and ack traffic.
    pub fn control(flags: SegmentFlags, seq: u32, ack: u32, window: u16) -> Segment {
        Segment::new(flags, seq, ack, window, Bytes::new())
    }

    /// The amount of sequence-number space this segment occupies: its payload, plus one for
    ///  SYN and one for FIN.
    pub fn seq_len(&self) -> u32 {
        let mut len = self.payload.len() as u32;
        if self.flags.contains(SegmentFlags::SYN) {
            len += 1;
        }
        if self.flags.contains(SegmentFlags::FIN) {
            len += 1;
        }
        len
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u8(Self::MARKER);
        buf.put_u8(self.flags.bits());
        buf.put_u32(self.seq);
        buf.put_u32(self.ack);
        buf.put_u16(self.window);
        buf.put_slice(&self.payload);
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::HEADER_LEN + self.payload.len());
        self.ser(&mut buf);
        buf
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<Segment> {
        let marker = buf.try_get_u8()?;
        if marker != Self::MARKER {
            bail!("not a stream segment: marker {:#04x}", marker);
        }
        let raw_flags = buf.try_get_u8()?;
        let Some(flags) = SegmentFlags::from_bits(raw_flags) else {
            bail!("invalid segment flags {:#010b}", raw_flags);
        };
        let seq = buf.try_get_u32()?;
        let ack = buf.try_get_u32()?;
        let window = buf.try_get_u16()?;
        if buf.remaining() > Self::MAX_PAYLOAD {
            bail!("segment payload too big: {}", buf.remaining());
        }
        let payload = buf.copy_to_bytes(buf.remaining());
        Ok(Segment { flags, seq, ack, window, payload })
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(SegmentFlags::SYN, 0, 0, 16, b"".as_slice())]
    #[case(SegmentFlags::SYN | SegmentFlags::ACK, 77, 12346, 16, b"".as_slice())]
    #[case(SegmentFlags::ACK, 12346, 78, 8, b"some payload bytes".as_slice())]
    #[case(SegmentFlags::FIN | SegmentFlags::ACK, u32::MAX, u32::MAX, 0, b"x".as_slice())]
    #[case(SegmentFlags::RST, 5, 0, 0, b"".as_slice())]
    fn test_ser_deser(#[case] flags: SegmentFlags, #[case] seq: u32, #[case] ack: u32, #[case] window: u16, #[case] payload: &[u8]) {
        let segment = Segment::new(flags, seq, ack, window, Bytes::copy_from_slice(payload));
        let raw = segment.to_bytes();
        assert_eq!(raw.len(), Segment::HEADER_LEN + payload.len());
        let deser = Segment::try_deser(&mut raw.as_slice()).unwrap();
        assert_eq!(deser, segment);
    }

    #[test]
    fn test_rejects_wrong_marker() {
        let mut raw = Segment::control(SegmentFlags::ACK, 1, 2, 3).to_bytes();
        raw[0] = 0xAF;
        assert!(Segment::try_deser(&mut raw.as_slice()).is_err());
    }

    #[test]
    fn test_rejects_unknown_flags() {
        let mut raw = Segment::control(SegmentFlags::ACK, 1, 2, 3).to_bytes();
        raw[1] = 0xF0;
        assert!(Segment::try_deser(&mut raw.as_slice()).is_err());
    }

    #[test]
    fn test_rejects_truncated_header() {
        let raw = Segment::control(SegmentFlags::ACK, 1, 2, 3).to_bytes();
        assert!(Segment::try_deser(&mut &raw[..7]).is_err());
    }

    #[rstest]
    #[case(SegmentFlags::SYN, 0, 1)]
    #[case(SegmentFlags::ACK, 0, 0)]
    #[case(SegmentFlags::ACK, 10, 10)]
    #[case(SegmentFlags::FIN | SegmentFlags::ACK, 3, 4)]
    #[case(SegmentFlags::SYN | SegmentFlags::FIN, 0, 2)]
    fn test_seq_len(#[case] flags: SegmentFlags, #[case] payload_len: usize, #[case] expected: u32) {
        let segment = Segment::new(flags, 0, 0, 0, Bytes::from(vec![0u8; payload_len]));
        assert_eq!(segment.seq_len(), expected);
    }
}
