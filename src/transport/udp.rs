//! # UDP Transport
//!
//! Connectionless, best-effort datagram transport. Every message is one
//! datagram holding a [`WireHeader`], the pipeline prefix and the payload.
//! There is no retry and no flow control; a malformed datagram is dropped.
//!
//! One socket serves every peer. The scheduler thread drains it; the delivery
//! pool hands each datagram to its handler.

use std::collections::VecDeque;
use std::io;
use std::net::{Ipv4Addr, SocketAddr, UdpSocket as StdUdpSocket};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use tokio::net::UdpSocket;
use tracing::{debug, info, instrument, trace, warn};

use super::base::{new_message_ticket, TransportCore};
use super::delivery::{DeliverState, DeliveryJob, DeliveryLoop, PoolControl, WorkerPool};
use super::{Readiness, Schedulable, Transport};
use crate::config::{TransportConfig, UdpConfig};
use crate::core::address::{NodeAddress, SockAddr};
use crate::core::header::{flags, HandlerId, WireHeader, HEADER_SIZE};
use crate::error::{Result, TransportError};
use crate::protocol::handler::{NetworkErrorHandler, ReceiveDataHandler};
use crate::protocol::pipeline::build_pipeline;
use crate::scheduler::Scheduler;
use crate::utils::metrics::global_metrics;

/// Largest UDP payload over IPv4.
pub const MAX_MESSAGE_SIZE: usize = 65507;

/// Largest prefix plus payload that fits one datagram.
pub const MAX_PAYLOAD_SIZE: usize = MAX_MESSAGE_SIZE - HEADER_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Starting,
    Running,
    ShuttingDown,
    Stopped,
}

struct UdpState {
    lifecycle: Lifecycle,
    socket: Option<Arc<UdpSocket>>,
    inbound: VecDeque<(WireHeader, Vec<u8>)>,
    deliver_state: DeliverState,
}

/// UDP implementation of [`Transport`].
#[derive(Clone)]
pub struct UdpTransport {
    inner: Arc<UdpInner>,
}

struct UdpInner {
    name: String,
    config: UdpConfig,
    core: TransportCore,
    scheduler: Scheduler,
    pool: Arc<PoolControl>,
    state: Mutex<UdpState>,
}

/// Split a datagram into its header and body. `None` when the header is
/// missing or its size disagrees with the datagram length.
fn parse_datagram(datagram: &[u8]) -> Option<(WireHeader, Vec<u8>)> {
    let header = WireHeader::decode(datagram).ok()?;
    let body = &datagram[HEADER_SIZE..];
    if header.size as usize != body.len() {
        return None;
    }
    Some((header, body.to_vec()))
}

impl UdpTransport {
    #[instrument(skip_all, fields(address = %config.udp.address))]
    pub fn new(config: &TransportConfig, scheduler: &Scheduler) -> Result<Self> {
        let udp = config.udp.clone();
        let local = udp.local_address()?;
        let forward = udp.forward_address()?;
        let pipeline = build_pipeline(local, udp.flow_pipeline, udp.logical_clock);

        let inner = Arc::new(UdpInner {
            name: format!("udp-{}", local.local),
            core: TransportCore::new(local, forward, udp.disable_translation, pipeline),
            config: udp,
            scheduler: scheduler.clone(),
            pool: Arc::new(PoolControl::new()),
            state: Mutex::new(UdpState {
                lifecycle: Lifecycle::Starting,
                socket: None,
                inbound: VecDeque::new(),
                deliver_state: DeliverState::Waiting,
            }),
        });
        scheduler.add(Arc::clone(&inner) as Arc<dyn Schedulable>)?;
        info!(transport = %inner.name, "UDP transport created");
        Ok(Self { inner })
    }

    /// Bind the socket and start delivery.
    #[instrument(skip(self), fields(transport = %self.inner.name))]
    pub fn init(&self) -> Result<()> {
        let inner = &self.inner;
        let mut st = inner.lock();
        if st.lifecycle != Lifecycle::Starting {
            return Err(TransportError::Custom(format!(
                "{} already initialized",
                inner.name
            )));
        }
        st.socket = Some(Arc::new(inner.bind()?));
        st.lifecycle = Lifecycle::Running;
        drop(st);

        WorkerPool::start(
            Arc::clone(inner),
            Arc::clone(&inner.pool),
            inner.config.delivery_threads.max(1),
        )?;
        inner.scheduler.signal(0, true);
        info!(local = %inner.core.local(), "UDP transport running");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.inner.lock().lifecycle == Lifecycle::Running
    }
}

impl std::fmt::Debug for UdpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.inner.lock();
        f.debug_struct("UdpTransport")
            .field("local", &self.inner.core.local())
            .field("lifecycle", &st.lifecycle)
            .field("inbound", &st.inbound.len())
            .finish()
    }
}

impl UdpInner {
    fn lock(&self) -> MutexGuard<'_, UdpState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn bind(&self) -> Result<UdpSocket> {
        let local = self.core.local();
        let ip = if self.config.bind_local_address {
            local.local.addr
        } else {
            Ipv4Addr::UNSPECIFIED
        };
        let port = if local.local.port == 0 {
            0
        } else {
            local.local.port.wrapping_add(self.config.port_offset)
        };
        let addr = SocketAddr::from((ip, port));
        let bind_err = |e: io::Error| TransportError::Bind(format!("{addr}: {e}"));

        let std_socket = StdUdpSocket::bind(addr).map_err(bind_err)?;
        std_socket.set_nonblocking(true).map_err(bind_err)?;
        let _runtime = self.scheduler.handle().enter();
        let socket = UdpSocket::from_std(std_socket).map_err(bind_err)?;

        if port == 0 {
            let bound = socket.local_addr().map_err(bind_err)?.port();
            let mut updated = local;
            updated.local.port = bound.wrapping_sub(self.config.port_offset);
            self.core.set_local(updated);
            info!(port = bound, "bound ephemeral port");
        }
        Ok(socket)
    }

    fn socket(&self) -> Option<Arc<UdpSocket>> {
        let st = self.lock();
        match st.lifecycle {
            Lifecycle::Running | Lifecycle::ShuttingDown => st.socket.clone(),
            Lifecycle::Starting | Lifecycle::Stopped => None,
        }
    }

    /// Send one datagram. Returns whether the socket took it.
    fn send_data(
        &self,
        src: NodeAddress,
        dest: &NodeAddress,
        prefix: &[u8],
        payload: &[u8],
        handler_id: HandlerId,
        internal: bool,
    ) -> bool {
        let len = prefix.len() + payload.len();
        if len > MAX_PAYLOAD_SIZE {
            warn!(%dest, len, max = MAX_PAYLOAD_SIZE, "message too large for one datagram");
            return false;
        }
        let Some(socket) = self.socket() else {
            return false;
        };

        let hop = self.core.next_hop(dest);
        let src = self.core.translated_source(hop, src);
        let header = self.core.header(src, dest, handler_id, len, false, internal);

        let mut datagram = Vec::with_capacity(HEADER_SIZE + len);
        header.encode_into(&mut datagram);
        datagram.extend_from_slice(prefix);
        datagram.extend_from_slice(payload);

        let addr = hop.to_socket_addr(self.config.port_offset);
        match socket.try_send_to(&datagram, addr) {
            Ok(sent) => {
                global_metrics().message_sent();
                global_metrics().bytes_written(sent as u64);
                trace!(%dest, %addr, bytes = sent, "datagram sent");
                true
            }
            Err(e) => {
                debug!(%dest, %addr, error = %e, "datagram not sent");
                false
            }
        }
    }

    fn route(&self, dest: &NodeAddress, payload: &[u8], handler_id: HandlerId) -> bool {
        if self.lock().lifecycle != Lifecycle::Running {
            return false;
        }
        if !self.core.data_handlers.contains(handler_id) {
            debug!(handler_id, "no data handler registered; not routing");
            return false;
        }
        let Some((prefix, body)) = self.core.prepare(dest, payload, handler_id) else {
            return false;
        };
        self.send_data(self.core.local(), dest, &prefix, &body, handler_id, false)
    }

    fn forward(&self, header: &WireHeader, payload: &[u8]) -> bool {
        self.send_data(
            header.src,
            &header.dest,
            &[],
            payload,
            header.handler_id,
            header.has_flag(flags::INTERNAL_MESSAGE),
        )
    }

    /// Drain every pending datagram. Returns how many were queued.
    fn read(&self, st: &mut UdpState, socket: &UdpSocket) -> usize {
        let mut buf = vec![0u8; MAX_MESSAGE_SIZE];
        let mut queued = 0;
        loop {
            let (n, from) = match socket.try_recv_from(&mut buf) {
                Ok(received) => received,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    // ICMP unreachable from an earlier send surfaces here
                    debug!(error = %e, "recv failed");
                    break;
                }
            };
            global_metrics().bytes_read(n as u64);
            let Some((header, body)) = parse_datagram(&buf[..n]) else {
                warn!(%from, bytes = n, "malformed datagram dropped");
                global_metrics().frame_dropped();
                continue;
            };
            if st.lifecycle == Lifecycle::Running {
                st.inbound.push_back((header, body));
                queued += 1;
            }
        }
        queued
    }

    fn shutdown(&self) {
        let mut st = self.lock();
        match st.lifecycle {
            Lifecycle::Starting => st.lifecycle = Lifecycle::Stopped,
            Lifecycle::Running => st.lifecycle = Lifecycle::ShuttingDown,
            Lifecycle::ShuttingDown | Lifecycle::Stopped => return,
        }
        drop(st);
        info!(transport = %self.name, "shutting down");
        self.pool.signal();
        self.scheduler.signal(0, true);
    }
}

impl DeliveryLoop for UdpInner {
    type State = UdpState;

    fn name(&self) -> &str {
        &self.name
    }

    fn state(&self) -> &Mutex<UdpState> {
        &self.state
    }

    fn condition(&self, st: &mut UdpState) -> bool {
        if st.deliver_state == DeliverState::PostFinito {
            return false;
        }
        self.core.apply_unregistrations();
        if !st.inbound.is_empty() {
            return true;
        }
        if st.lifecycle == Lifecycle::ShuttingDown {
            st.deliver_state = DeliverState::Finito;
            return true;
        }
        false
    }

    fn setup(&self, st: &mut UdpState) -> Option<DeliveryJob> {
        if st.deliver_state == DeliverState::Finito {
            st.deliver_state = DeliverState::PostFinito;
            return Some(DeliveryJob::Shutdown);
        }
        let (header, payload) = st.inbound.pop_front()?;
        if !header.has_flag(flags::INTERNAL_MESSAGE) {
            let ticket = new_message_ticket();
            trace!(ticket, src = %header.src, "delivery ticket");
        }
        let handler = self.core.data_handlers.lease(header.handler_id);
        Some(DeliveryJob::Deliver {
            source: None,
            header,
            payload,
            handler,
            learn_key: false,
            check_accept: false,
        })
    }

    fn process(&self, job: &mut DeliveryJob, pool: &PoolControl) {
        match job {
            DeliveryJob::Deliver {
                header,
                payload,
                handler,
                ..
            } => {
                let payload = std::mem::take(payload);
                self.core
                    .deliver_data(header, payload, handler.as_deref(), |h, p| self.forward(h, p));
            }
            DeliveryJob::Shutdown => pool.halt(),
            other => warn!(job = ?other, "unexpected job on a datagram transport"),
        }
    }

    fn finish(&self, _st: &mut UdpState, _job: DeliveryJob) {}

    fn halted(&self) {
        self.lock().lifecycle = Lifecycle::Stopped;
        info!(transport = %self.name, "delivery halted; transport stopped");
        self.scheduler.signal(0, true);
    }
}

impl Schedulable for UdpInner {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_running(&self) -> bool {
        let mut st = self.lock();
        if st.lifecycle != Lifecycle::Stopped {
            return true;
        }
        if st.socket.take().is_some() {
            info!(transport = %self.name, "socket closed");
        }
        false
    }

    fn interest(&self) -> Vec<Readiness> {
        match self.socket() {
            Some(socket) => {
                let readable: Readiness = Box::pin(async move {
                    let _ = socket.readable().await;
                });
                vec![readable]
            }
            None => Vec::new(),
        }
    }

    fn do_io(&self, _wake: Instant) {
        let Some(socket) = self.socket() else {
            return;
        };
        let mut st = self.lock();
        if self.read(&mut st, &socket) > 0 {
            drop(st);
            self.pool.signal();
        }
    }

    fn free_sockets(&self) {}
}

impl Transport for UdpTransport {
    fn local_address(&self) -> NodeAddress {
        self.inner.core.local()
    }

    fn route(&self, dest: &NodeAddress, payload: &[u8], handler_id: HandlerId) -> bool {
        self.inner.route(dest, payload, handler_id)
    }

    fn register_data_handler(
        &self,
        handler: Arc<dyn ReceiveDataHandler>,
        id: Option<HandlerId>,
    ) -> HandlerId {
        self.inner.core.data_handlers.register(handler, id)
    }

    fn unregister_data_handler(&self, id: HandlerId) {
        self.inner.core.data_handlers.unregister(id);
        self.inner.pool.signal();
    }

    fn register_error_handler(
        &self,
        handler: Arc<dyn NetworkErrorHandler>,
        id: Option<HandlerId>,
    ) -> HandlerId {
        self.inner.core.error_handlers.register(handler, id)
    }

    fn unregister_error_handler(&self, id: HandlerId) {
        self.inner.core.error_handlers.unregister(id);
        self.inner.pool.signal();
    }

    fn suspend_deliver(&self, peer: &NodeAddress) {
        self.inner.core.suspend(*peer);
    }

    fn resume_deliver(&self, peer: &NodeAddress) {
        self.inner.core.resume(peer);
    }

    fn shutdown(&self) {
        self.inner.shutdown();
    }
}

impl UdpTransport {
    /// Send without the pipeline, flagged transport-internal.
    pub fn route_internal(&self, dest: &NodeAddress, payload: &[u8], handler_id: HandlerId) -> bool {
        if !self.is_running() {
            return false;
        }
        self.inner
            .send_data(self.inner.core.local(), dest, &[], payload, handler_id, true)
    }

    /// Address the socket is bound to, for diagnostics.
    pub fn bound_address(&self) -> Option<SockAddr> {
        let socket = self.inner.lock().socket.clone()?;
        socket.local_addr().ok().and_then(|a| SockAddr::try_from(a).ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(size: u32) -> WireHeader {
        let src: SockAddr = "10.0.0.1:5378".parse().expect("addr");
        let dest: SockAddr = "10.0.0.2:5378".parse().expect("addr");
        WireHeader::new(NodeAddress::direct(src), NodeAddress::direct(dest), 3, 0, size)
    }

    #[test]
    fn datagram_size_must_match_header() {
        let mut datagram = header(4).encode().to_vec();
        datagram.extend_from_slice(b"ping");
        let (h, body) = parse_datagram(&datagram).expect("well formed");
        assert_eq!(h.handler_id, 3);
        assert_eq!(body, b"ping");

        datagram.push(0);
        assert!(parse_datagram(&datagram).is_none());
        assert!(parse_datagram(&datagram[..HEADER_SIZE - 1]).is_none());
    }

    #[test]
    fn payload_limit_leaves_room_for_header() {
        assert_eq!(MAX_PAYLOAD_SIZE + HEADER_SIZE, MAX_MESSAGE_SIZE);
    }
}
