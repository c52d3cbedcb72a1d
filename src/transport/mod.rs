//! # Transport Layer
//!
//! Connection management, framing, routing and delivery for the TCP and UDP
//! transports.
//!
//! ## Capabilities
//! What a transport can do is split across traits so callers depend only on
//! the part they use:
//! - [`Transport`]: route messages and register handlers
//! - [`BufferedTransport`]: per-peer queues, flow control, statistics
//! - [`ConnectionAcceptance`]: gate incoming connections on a token
//! - [`CryptoTransport`]: the verified TLS identity of a peer
//! - [`Schedulable`]: the non-blocking I/O step driven by the
//!   [`Scheduler`](crate::scheduler::Scheduler)

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;

use crate::core::address::NodeAddress;
use crate::error::Result;
use crate::protocol::handler::{
    ConnectionAcceptanceHandler, ConnectionStatusHandler, HandlerId, NetworkErrorHandler,
    ReceiveDataHandler,
};
use crate::utils::metrics::BufferStatistics;

pub mod base;
pub mod connection;
pub mod delivery;
pub mod socket;
pub mod tcp;
pub mod tls;
pub mod udp;

pub use connection::{Connection, ConnectionParams, Direction};
pub use tcp::TcpTransport;
pub use udp::UdpTransport;

/// Resolves when a socket the transport waits on becomes ready.
pub type Readiness = BoxFuture<'static, ()>;

/// The I/O step the scheduler drives.
pub trait Schedulable: Send + Sync {
    fn name(&self) -> &str;

    /// False once the transport has stopped; the scheduler then drops it.
    fn is_running(&self) -> bool;

    /// Readiness futures for every socket with pending interest.
    fn interest(&self) -> Vec<Readiness>;

    /// Non-blocking I/O on every socket. `wake` is when the wait ended;
    /// connections opened after it are skipped until the next pass.
    fn do_io(&self, wake: Instant);

    /// Close idle connections to release file descriptors.
    fn free_sockets(&self);
}

/// Routing and handler registration.
pub trait Transport: Send + Sync {
    /// This transport's node address.
    fn local_address(&self) -> NodeAddress;

    /// Send `payload` to the handler `handler_id` on `dest`.
    ///
    /// Returns false when the message was not queued.
    fn route(&self, dest: &NodeAddress, payload: &[u8], handler_id: HandlerId) -> bool;

    fn register_data_handler(
        &self,
        handler: Arc<dyn ReceiveDataHandler>,
        id: Option<HandlerId>,
    ) -> HandlerId;

    fn unregister_data_handler(&self, id: HandlerId);

    fn register_error_handler(
        &self,
        handler: Arc<dyn NetworkErrorHandler>,
        id: Option<HandlerId>,
    ) -> HandlerId;

    fn unregister_error_handler(&self, id: HandlerId);

    /// Stop delivering messages that arrive from `peer`.
    fn suspend_deliver(&self, peer: &NodeAddress);

    fn resume_deliver(&self, peer: &NodeAddress);

    /// Drain delivery and stop.
    fn shutdown(&self);
}

/// Per-peer queueing and flow control.
pub trait BufferedTransport: Transport {
    /// Like [`Transport::route`], but when the queue is full register a
    /// request-to-send for `handler_id` instead of failing silently.
    fn route_rts(&self, dest: &NodeAddress, payload: &[u8], handler_id: HandlerId) -> bool;

    fn can_send(&self, dest: &NodeAddress) -> bool;

    /// Bytes that may still be queued for `dest` before `can_send` turns false.
    fn available_buffer_size(&self, dest: &NodeAddress) -> u32;

    /// Unsent plus unread bytes over every connection.
    fn buffered_data_size(&self) -> u64;

    fn outgoing_buffered_data_size(&self, dest: &NodeAddress) -> u64;

    fn incoming_buffered_data_size(&self, dest: &NodeAddress) -> u64;

    /// Complete messages waiting for delivery from `dest`.
    fn incoming_message_queue_size(&self, dest: &NodeAddress) -> usize;

    fn has_outgoing_buffered_data(&self) -> bool;

    fn statistics(&self, peer: &NodeAddress, direction: Direction) -> Option<BufferStatistics>;

    /// `threshold` of `None` means `max(size / 2, 1)`.
    fn set_queue_size(&self, peer: &NodeAddress, size: u32, threshold: Option<u32>);

    fn set_window_size(&self, peer: &NodeAddress, window: Duration);

    /// Ask for a clear-to-send upcall once `dest` can accept data again.
    fn request_to_send(&self, dest: &NodeAddress, handler_id: HandlerId);

    /// Ask for a flushed upcall once no outgoing data remains.
    fn request_flushed_notification(&self, handler_id: HandlerId);

    fn register_status_handler(
        &self,
        handler: Arc<dyn ConnectionStatusHandler>,
        id: Option<HandlerId>,
    ) -> HandlerId;

    fn unregister_status_handler(&self, id: HandlerId);

    /// Close every connection to `dest`.
    fn close(&self, dest: &NodeAddress);

    fn connection_count(&self) -> usize;
}

/// Token-gated acceptance of incoming connections.
pub trait ConnectionAcceptance {
    fn register_acceptance_handler(
        &self,
        handler: Arc<dyn ConnectionAcceptanceHandler>,
        id: Option<HandlerId>,
    ) -> HandlerId;

    fn unregister_acceptance_handler(&self, id: HandlerId);

    /// Make the handler registered as `id` decide every incoming connection.
    fn set_authoritative_acceptor(&self, id: HandlerId) -> Result<()>;

    /// Token presented on every outgoing connection.
    fn set_connection_token(&self, token: &[u8]);
}

/// The authenticated identity of a TLS peer.
pub trait CryptoTransport {
    fn peer_common_name(&self, peer: &NodeAddress) -> Option<String>;

    /// DER-encoded SubjectPublicKeyInfo.
    fn peer_public_key(&self, peer: &NodeAddress) -> Option<Vec<u8>>;
}
