//! # Wire Header
//!
//! Fixed-size binary prefix written before every framed message.
//!
//! ## Wire Format (network byte order)
//! ```text
//! [src.local(6)] [src.proxy(6)] [dest.local(6)] [dest.proxy(6)]
//! [handler_id(4)] [flags(1)] [size(4)] [payload(size)]
//! ```
//!
//! Each socket address is `[ipv4(4)] [port(2)]`. The header is always
//! [`HEADER_SIZE`] bytes; `size` tells how many payload bytes follow.

use bytes::{Buf, BufMut, BytesMut};

use super::address::{NodeAddress, NODE_ADDRESS_SIZE};
use crate::error::{Result, TransportError};

/// Handler identifier a message is addressed to.
pub type HandlerId = u32;

/// Serialized header size in bytes.
pub const HEADER_SIZE: usize = 2 * NODE_ADDRESS_SIZE + 4 + 1 + 4;

/// Offset of the flag byte inside an encoded header.
const FLAGS_OFFSET: usize = 2 * NODE_ADDRESS_SIZE + 4;

/// Offset of the payload length inside an encoded header.
const SIZE_OFFSET: usize = FLAGS_OFFSET + 1;

/// Header flag bits.
pub mod flags {
    /// Secondary, non-deliverable connection used to reach a NATed node.
    pub const NAT_CONNECTION: u8 = 0x1;
    /// Payload carries the connection's acceptance token.
    pub const ACCEPTANCE_TOKEN: u8 = 0x2;
    /// Announces the sender's logical source address.
    pub const SOURCE_ID: u8 = 0x4;
    /// Transport-internal message; no sequence ticket is drawn for it.
    pub const INTERNAL_MESSAGE: u8 = 0x8;

    /// Flags marking connection bootstrap frames.
    pub const BOOTSTRAP: u8 = NAT_CONNECTION | ACCEPTANCE_TOKEN | SOURCE_ID;
}

/// Framing header identifying source, destination, handler, flags and length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WireHeader {
    pub src: NodeAddress,
    pub dest: NodeAddress,
    pub handler_id: HandlerId,
    pub flags: u8,
    pub size: u32,
}

impl WireHeader {
    pub fn new(
        src: NodeAddress,
        dest: NodeAddress,
        handler_id: HandlerId,
        flags: u8,
        size: u32,
    ) -> Self {
        Self {
            src,
            dest,
            handler_id,
            flags,
            size,
        }
    }

    #[inline]
    pub fn has_flag(&self, flag: u8) -> bool {
        self.flags & flag != 0
    }

    /// True for NAT / token / source-id frames that are consumed by the transport.
    #[inline]
    pub fn is_bootstrap(&self) -> bool {
        self.has_flag(flags::BOOTSTRAP)
    }

    /// Append the encoded header to `buf`.
    pub fn encode_into(&self, buf: &mut impl BufMut) {
        self.src.put(buf);
        self.dest.put(buf);
        buf.put_u32(self.handler_id);
        buf.put_u8(self.flags);
        buf.put_u32(self.size);
    }

    /// Encode into a fresh buffer of exactly [`HEADER_SIZE`] bytes.
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE);
        self.encode_into(&mut buf);
        buf
    }

    /// Decode a header from the front of `bytes`.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(TransportError::Truncated {
                needed: HEADER_SIZE,
                available: bytes.len(),
            });
        }
        let mut buf = &bytes[..HEADER_SIZE];
        let src = NodeAddress::get(&mut buf);
        let dest = NodeAddress::get(&mut buf);
        let handler_id = buf.get_u32();
        let flags = buf.get_u8();
        let size = buf.get_u32();
        Ok(Self {
            src,
            dest,
            handler_id,
            flags,
            size,
        })
    }

    /// Read only the flag byte of an encoded header.
    pub fn peek_flags(bytes: &[u8]) -> Result<u8> {
        bytes
            .get(FLAGS_OFFSET)
            .copied()
            .ok_or(TransportError::Truncated {
                needed: HEADER_SIZE,
                available: bytes.len(),
            })
    }

    /// Read only the payload length of an encoded header.
    pub fn peek_size(bytes: &[u8]) -> Result<u32> {
        match bytes.get(SIZE_OFFSET..SIZE_OFFSET + 4) {
            Some(mut s) => Ok(s.get_u32()),
            None => Err(TransportError::Truncated {
                needed: HEADER_SIZE,
                available: bytes.len(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::address::SockAddr;
    use std::net::Ipv4Addr;

    fn sample() -> WireHeader {
        WireHeader::new(
            NodeAddress::direct(SockAddr::new(Ipv4Addr::new(10, 1, 2, 3), 5377)),
            NodeAddress::new(
                SockAddr::new(Ipv4Addr::new(10, 9, 8, 7), 0),
                SockAddr::new(Ipv4Addr::new(4, 4, 4, 4), 6000),
            ),
            7,
            flags::SOURCE_ID | flags::INTERNAL_MESSAGE,
            10,
        )
    }

    #[test]
    fn header_size_is_fixed() {
        assert_eq!(HEADER_SIZE, 33);
        assert_eq!(sample().encode().len(), HEADER_SIZE);
    }

    #[test]
    fn peek_matches_full_decode() {
        let bytes = sample().encode();
        assert_eq!(WireHeader::peek_size(&bytes).ok(), Some(10));
        assert_eq!(
            WireHeader::peek_flags(&bytes).ok(),
            Some(flags::SOURCE_ID | flags::INTERNAL_MESSAGE)
        );
    }

    #[test]
    fn network_byte_order() {
        let bytes = sample().encode();
        // src.local ip then port 5377 = 0x1501
        assert_eq!(&bytes[..6], &[10, 1, 2, 3, 0x15, 0x01]);
        // size is the final four bytes
        assert_eq!(&bytes[HEADER_SIZE - 4..], &[0, 0, 0, 10]);
    }

    #[test]
    fn short_input_is_rejected() {
        let bytes = sample().encode();
        match WireHeader::decode(&bytes[..HEADER_SIZE - 1]) {
            Err(TransportError::Truncated { needed, available }) => {
                assert_eq!(needed, HEADER_SIZE);
                assert_eq!(available, HEADER_SIZE - 1);
            }
            other => panic!("expected truncation error, got {other:?}"),
        }
    }

    #[test]
    fn bootstrap_detection() {
        let mut h = sample();
        assert!(h.is_bootstrap());
        h.flags = flags::INTERNAL_MESSAGE;
        assert!(!h.is_bootstrap());
    }
}
