//! # Network Transport
//!
//! Framed, flow-controlled message transport for distributed systems.
//!
//! Nodes exchange messages addressed to numeric handler ids. Every message is
//! preceded by a fixed [`WireHeader`](core::header::WireHeader) carrying the
//! source and destination [`NodeAddress`](core::address::NodeAddress)es; the
//! receiving transport hands the payload to the handler registered under that
//! id.
//!
//! ## Components
//! - **Scheduler**: one reactor thread driving socket I/O for every transport
//! - **TCP transport**: per-peer connections with queue limits, request-to-send,
//!   flush notification, connection acceptance, NAT helpers and optional TLS
//! - **UDP transport**: best-effort datagrams
//! - **Pipeline**: stages that prefix outbound messages (flow logging,
//!   Lamport clock)
//! - **Delivery pool**: bounded worker threads making handler upcalls
//!
//! ## Example
//! ```no_run
//! use std::sync::Arc;
//! use network_transport::config::TransportConfig;
//! use network_transport::scheduler::Scheduler;
//! use network_transport::transport::{TcpTransport, Transport};
//! use network_transport::core::address::NodeAddress;
//!
//! # fn main() -> network_transport::error::Result<()> {
//! let config = TransportConfig::default();
//! let scheduler = Scheduler::new(config.scheduler.clone())?;
//! let tcp = TcpTransport::new(&config, &scheduler)?;
//! tcp.register_data_handler(
//!     Arc::new(|src: &NodeAddress, _: &NodeAddress, payload: &[u8], _: u32| {
//!         println!("{src}: {} bytes", payload.len());
//!     }),
//!     Some(7),
//! );
//! tcp.init()?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod core;
pub mod error;
pub mod protocol;
pub mod scheduler;
pub mod transport;
pub mod utils;

pub use crate::config::TransportConfig;
pub use crate::core::address::{NodeAddress, SockAddr};
pub use crate::core::header::{HandlerId, WireHeader, HEADER_SIZE};
pub use crate::error::{ErrorKind, Result, TransportError};
pub use crate::scheduler::Scheduler;
pub use crate::transport::{TcpTransport, UdpTransport};
