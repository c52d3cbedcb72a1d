//! # Core Wire Components
//!
//! Addressing, message framing, and the connection read buffer.
//!
//! This module provides the foundation every transport builds on: how nodes
//! are named, how a framed message looks on the wire, and how partial reads are
//! accumulated until whole frames are available.
//!
//! ## Components
//! - **Address**: `SockAddr` / `NodeAddress`, with null and unroutable forms
//! - **Header**: fixed-size `WireHeader` preceding every payload
//! - **Ring buffer**: growable circular read buffer
//!
//! ## Wire Format
//! ```text
//! [src(12)] [dest(12)] [handler_id(4)] [flags(1)] [size(4)] [payload(size)]
//! ```
//!
//! ## Safety
//! - Header decoding never reads past the input (`Truncated` on short input)
//! - Payload length is checked against the configured maximum before the
//!   read buffer grows

pub mod address;
pub mod header;
pub mod ring_buffer;
