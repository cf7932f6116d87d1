//! UDP transport core for a friend-to-friend network: one shared socket per endpoint carrying
//!  three kinds of traffic side by side, demultiplexed by shape rather than by port.
//!
//! ## Design goals
//!
//! * A single UDP socket per endpoint handles everything - STUN probes for reachability
//!   classification, tiny fixed-size control datagrams between friends, and reliable byte
//!   streams. NATs only keep one mapping warm per socket pair, so everything must share it.
//! * Streams provide TCP's semantics (connect/listen handshake, ordered reliable bytes, the
//!   full close handshake) without TCP's sockets: behind many NATs an outbound UDP datagram is
//!   the only way to open a path that a peer can answer on.
//! * No OS timers and no background tasks inside the protocol objects: everything is driven by
//!   a cooperative ~1 second tick from the owner plus the socket's receive loop. Every call
//!   returns promptly.
//! * One stream per remote address. The protocol deliberately has no stream-id multiplexing:
//!   a friend connection is a socket pair, and the demultiplexer fans out by sender address
//!   alone.
//! * No transport-layer cryptography. Control packets are validated against the sender address
//!   already known for the claimed friend, and everything stronger is the business of the
//!   certificate layer above - that layering is deliberate and must be preserved.
//!
//! ## Traffic classification on the shared socket
//!
//! ```ascii
//! exactly 12 bytes, first two bytes 0xAF52/0xAF53/0xAF54  --> control datagram
//! top two bits of first byte 00, magic cookie at offset 4 --> STUN
//! first byte 0xC5                                         --> stream segment
//! anything else                                           --> dropped
//! ```
//!
//! ## Stream segment header
//!
//! All integers network byte order:
//! ```ascii
//! 0:  u8   marker (0xC5)
//! 1:  u8   flags (SYN 0x01, ACK 0x02, FIN 0x04, RST 0x08)
//! 2:  u32  sequence number (bytes; SYN and FIN each consume one number)
//! 6:  u32  cumulative ack
//! 10: u16  advertised receive window (bytes)
//! 12: payload, at most 1400 bytes
//! ```
//!
//! ## Control datagrams
//!
//! See [control::ControlPacket]: 12 bytes, `magic u16 | sender port u16 | sender IPv4 u32 |
//!  sender friend id u32`.

pub mod control;
pub mod demux;
pub mod packet_io;
pub mod peer_addr;
pub mod reliable_stream;
pub mod segment;
pub mod stun;
