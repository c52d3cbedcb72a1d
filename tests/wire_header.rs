//! Property-based tests for the wire header and node addresses
//!
//! Headers are the only bytes two transports must agree on, so these check
//! the encoding against arbitrary addresses, flags and sizes.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::net::Ipv4Addr;

use network_transport::core::address::{NodeAddress, SockAddr};
use network_transport::core::header::{flags, WireHeader, HEADER_SIZE};
use network_transport::error::TransportError;
use proptest::prelude::*;

fn sock_addr() -> impl Strategy<Value = SockAddr> {
    (any::<u32>(), any::<u16>()).prop_map(|(ip, port)| SockAddr::new(Ipv4Addr::from(ip), port))
}

fn node_address() -> impl Strategy<Value = NodeAddress> {
    (sock_addr(), prop::option::of(sock_addr()))
        .prop_map(|(local, proxy)| NodeAddress::new(local, proxy.unwrap_or(SockAddr::NULL)))
}

fn wire_header() -> impl Strategy<Value = WireHeader> {
    (node_address(), node_address(), any::<u32>(), any::<u8>(), any::<u32>())
        .prop_map(|(src, dest, id, flags, size)| WireHeader::new(src, dest, id, flags, size))
}

// Property: decoding an encoded header yields the same header
proptest! {
    #[test]
    fn prop_header_roundtrip(header in wire_header()) {
        let bytes = header.encode();
        prop_assert_eq!(bytes.len(), HEADER_SIZE);
        let decoded = WireHeader::decode(&bytes).expect("decode");
        prop_assert_eq!(decoded, header);
    }
}

// Property: the peek helpers agree with a full decode, and trailing payload
// bytes are never consumed as header
proptest! {
    #[test]
    fn prop_peek_matches_decode(
        header in wire_header(),
        payload in prop::collection::vec(any::<u8>(), 0..64),
    ) {
        let mut bytes = header.encode().to_vec();
        bytes.extend_from_slice(&payload);

        prop_assert_eq!(WireHeader::peek_flags(&bytes).expect("flags"), header.flags);
        prop_assert_eq!(WireHeader::peek_size(&bytes).expect("size"), header.size);
        prop_assert_eq!(WireHeader::decode(&bytes).expect("decode"), header);
    }
}

// Property: any input shorter than a header is rejected, never panics
proptest! {
    #[test]
    fn prop_short_input_is_truncated(bytes in prop::collection::vec(any::<u8>(), 0..HEADER_SIZE)) {
        match WireHeader::decode(&bytes) {
            Err(TransportError::Truncated { needed, available }) => {
                prop_assert_eq!(needed, HEADER_SIZE);
                prop_assert_eq!(available, bytes.len());
            }
            other => prop_assert!(false, "expected truncation, got {:?}", other),
        }
    }
}

// Property: socket addresses print and parse back unchanged
proptest! {
    #[test]
    fn prop_sock_addr_display_parses(addr in sock_addr()) {
        let parsed: SockAddr = addr.to_string().parse().expect("parse");
        prop_assert_eq!(parsed, addr);
    }
}

#[test]
fn header_is_33_bytes() {
    assert_eq!(HEADER_SIZE, 33);
}

#[test]
fn fields_are_big_endian_at_fixed_offsets() {
    let src = NodeAddress::direct(SockAddr::new(Ipv4Addr::new(10, 0, 0, 1), 0x1234));
    let dest = NodeAddress::new(
        SockAddr::new(Ipv4Addr::new(10, 0, 0, 2), 5377),
        SockAddr::new(Ipv4Addr::new(192, 0, 2, 1), 80),
    );
    let bytes = WireHeader::new(src, dest, 0x0102_0304, flags::INTERNAL_MESSAGE, 10).encode();

    assert_eq!(&bytes[0..6], &[10, 0, 0, 1, 0x12, 0x34]);
    assert_eq!(&bytes[6..12], &[0; 6]);
    assert_eq!(&bytes[18..24], &[192, 0, 2, 1, 0, 80]);
    assert_eq!(&bytes[24..28], &[1, 2, 3, 4]);
    assert_eq!(bytes[28], flags::INTERNAL_MESSAGE);
    assert_eq!(&bytes[29..33], &[0, 0, 0, 10]);
}

#[test]
fn bootstrap_frames_are_recognised_by_flag() {
    let h = |f| WireHeader::new(NodeAddress::NULL, NodeAddress::NULL, 0, f, 0);
    assert!(h(flags::ACCEPTANCE_TOKEN).is_bootstrap());
    assert!(h(flags::SOURCE_ID).is_bootstrap());
    assert!(h(flags::NAT_CONNECTION).is_bootstrap());
    assert!(!h(flags::INTERNAL_MESSAGE).is_bootstrap());
    assert!(!h(0).is_bootstrap());
    assert!(h(flags::INTERNAL_MESSAGE | flags::SOURCE_ID).has_flag(flags::INTERNAL_MESSAGE));
}

#[test]
fn null_and_unroutable_addresses() {
    assert!(SockAddr::NULL.is_null());
    assert!(!SockAddr::NULL.is_unroutable());
    assert!(NodeAddress::NULL.is_null());

    let unroutable = SockAddr::new(Ipv4Addr::new(10, 0, 0, 7), 0);
    assert!(unroutable.is_unroutable());
    assert!(NodeAddress::direct(unroutable).is_unroutable());

    let routable: SockAddr = "10.0.0.7:5377".parse().expect("parse");
    assert!(!routable.is_unroutable());
    assert_eq!(routable.to_socket_addr(3).port(), 5380);
    assert!("not-an-address".parse::<SockAddr>().is_err());
}
