#![no_main]

use libfuzzer_sys::fuzz_target;
use network_transport::core::address::SockAddr;
use network_transport::core::header::WireHeader;

fuzz_target!(|data: &[u8]| {
    // arbitrary bytes must decode or fail cleanly, and decoded headers re-encode to the same bytes
    if let Ok(header) = WireHeader::decode(data) {
        let encoded = header.encode();
        assert_eq!(&encoded[..], &data[..encoded.len()]);
        let _ = WireHeader::peek_size(data);
    }
    if let Ok(text) = std::str::from_utf8(data) {
        let _ = text.parse::<SockAddr>();
    }
});
