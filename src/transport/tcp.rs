//! # TCP Transport
//!
//! Framed, flow-controlled message transport over TCP (optionally TLS).
//!
//! ## Connections
//! Messages to a peer travel over an *outgoing* connection keyed by the
//! peer's next hop; messages from a peer arrive on an *incoming* connection
//! keyed by the identity learned from its first frame. A node whose own
//! address is unroutable also opens a NAT helper alongside every outgoing
//! connection, over which the peer writes back to it.
//!
//! ## Threads
//! - The [`Scheduler`] thread accepts, reads and writes ([`Schedulable::do_io`])
//! - The delivery pool turns queued input, clear-to-send requests, errors and
//!   flush notifications into handler upcalls ([`DeliveryLoop`])
//! - Callers enqueue from their own threads
//!
//! Lock order is transport state, then connection. Handlers are always
//! invoked with no transport lock held.

use std::collections::{HashMap, HashSet, VecDeque};
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::thread;
use std::time::{Duration, Instant};

use futures::task::noop_waker_ref;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tracing::{debug, info, instrument, trace, warn};

use super::base::{new_message_ticket, TransportCore};
use super::connection::{Connection, ConnectionParams, Direction};
use super::delivery::{DeliverState, DeliveryJob, DeliveryLoop, PoolControl, WorkerPool};
use super::socket::{is_connection_failure, is_transient, Socket};
use super::tls::TlsContext;
use super::{
    BufferedTransport, ConnectionAcceptance, CryptoTransport, Readiness, Schedulable, Transport,
};
use crate::config::{CryptoMode, TcpConfig, TransportConfig};
use crate::core::address::{NodeAddress, SockAddr};
use crate::core::header::{flags, HandlerId, WireHeader};
use crate::error::constants::{
    ERR_CONNECTION_CLOSED, ERR_CONNECTION_IDLE, ERR_CONNECTION_REJECTED, ERR_NO_ROUTE,
    ERR_PEER_RESET, ERR_TRANSPORT_SHUTDOWN,
};
use crate::error::{ErrorKind, Result, TransportError};
use crate::protocol::handler::{
    ConnectionAcceptanceHandler, ConnectionStatusHandler, HandlerLease, NetworkErrorHandler,
    ReceiveDataHandler,
};
use crate::protocol::pipeline::build_pipeline;
use crate::scheduler::Scheduler;
use crate::utils::metrics::{global_metrics, BufferStatistics};

/// Poll interval while shutdown waits for outgoing data to drain.
const DRAIN_POLL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Starting,
    Running,
    ShuttingDown,
    Stopped,
}

#[derive(Debug, Clone, Copy, Default)]
struct SendOptions {
    check_queue_size: bool,
    rts: bool,
    internal: bool,
}

/// Work that could not run because no socket was available; replayed on
/// the next I/O pass.
enum DeferredOp {
    Send {
        src: NodeAddress,
        dest: NodeAddress,
        prefix: Vec<u8>,
        payload: Vec<u8>,
        handler_id: HandlerId,
        opts: SendOptions,
    },
    RequestToSend {
        dest: NodeAddress,
        handler_id: HandlerId,
    },
    SetQueueSize {
        dest: NodeAddress,
        size: u32,
        threshold: u32,
    },
    SetWindow {
        dest: NodeAddress,
        window: Duration,
    },
}

type Accepted = io::Result<(TcpStream, SocketAddr)>;

struct TcpState {
    lifecycle: Lifecycle,
    close_sockets: bool,
    listener: Option<Arc<TcpListener>>,

    connections: Vec<Arc<Connection>>,
    out: HashMap<SockAddr, Arc<Connection>>,
    incoming: HashMap<SockAddr, Arc<Connection>>,
    deferred: Vec<DeferredOp>,
    deferred_deliveries: Vec<Arc<Connection>>,

    deliver_state: DeliverState,
    current: Option<Arc<Connection>>,
    consecutive: u32,
    busy: HashSet<u64>,
    deliverable: VecDeque<Arc<Connection>>,
    throttled: VecDeque<Arc<Connection>>,
    sendable: VecDeque<Arc<Connection>>,
    resend: Vec<Arc<Connection>>,
    errors: VecDeque<Arc<Connection>>,
    flush_waiting: Vec<HandlerId>,
    flushed: VecDeque<HandlerId>,
}

impl TcpState {
    fn new() -> Self {
        Self {
            lifecycle: Lifecycle::Starting,
            close_sockets: false,
            listener: None,
            connections: Vec::new(),
            out: HashMap::new(),
            incoming: HashMap::new(),
            deferred: Vec::new(),
            deferred_deliveries: Vec::new(),
            deliver_state: DeliverState::Waiting,
            current: None,
            consecutive: 0,
            busy: HashSet::new(),
            deliverable: VecDeque::new(),
            throttled: VecDeque::new(),
            sendable: VecDeque::new(),
            resend: Vec::new(),
            errors: VecDeque::new(),
            flush_waiting: Vec::new(),
            flushed: VecDeque::new(),
        }
    }

    fn is_busy(&self, conn: &Connection) -> bool {
        self.busy.contains(&conn.id())
    }

    fn is_current(&self, conn: &Arc<Connection>) -> bool {
        self.current.as_ref().map_or(false, |c| Arc::ptr_eq(c, conn))
    }

    /// Hand a connection that is no longer current back to the round.
    fn release(&mut self, conn: Arc<Connection>) {
        if conn.has_inbound() {
            self.deliverable.push_back(conn);
        } else {
            conn.set_deliverable(false);
        }
    }

    fn has_work(&self) -> bool {
        self.current
            .as_ref()
            .map_or(false, |c| !self.is_busy(c) && c.has_inbound())
            || !self.deliverable.is_empty()
            || !self.throttled.is_empty()
            || !self.sendable.is_empty()
            || !self.errors.is_empty()
            || !self.flushed.is_empty()
    }

    fn has_outgoing(&self) -> bool {
        self.connections
            .iter()
            .any(|c| c.is_open() && c.outgoing_size() > 0)
    }
}

/// Identity an incoming connection from `peer` is registered under.
fn identity_of(peer: &NodeAddress) -> SockAddr {
    if peer.proxy.is_null() {
        peer.local
    } else {
        peer.proxy
    }
}

/// TCP implementation of every transport capability.
///
/// Cheap to clone; clones share one transport.
#[derive(Clone)]
pub struct TcpTransport {
    inner: Arc<TcpInner>,
}

struct TcpInner {
    name: String,
    config: TcpConfig,
    core: TransportCore,
    tls: Option<Arc<TlsContext>>,
    scheduler: Scheduler,
    pool: Arc<PoolControl>,
    accepted: Arc<Mutex<Vec<Accepted>>>,
    state: Mutex<TcpState>,
}

impl TcpTransport {
    /// Build the transport and register it with `scheduler`.
    ///
    /// Nothing is bound and no delivery thread runs until [`init`](Self::init).
    #[instrument(skip_all, fields(address = %config.tcp.address))]
    pub fn new(config: &TransportConfig, scheduler: &Scheduler) -> Result<Self> {
        let tcp = config.tcp.clone();
        let local = tcp.local_address()?;
        let forward = tcp.forward_address()?;
        let tls = match tcp.crypto {
            CryptoMode::Tls => Some(Arc::new(TlsContext::load(&config.tls)?)),
            CryptoMode::None => None,
        };
        let pipeline = build_pipeline(local, tcp.flow_pipeline, tcp.logical_clock);
        let core = TransportCore::new(local, forward, tcp.disable_translation, pipeline);
        if !tcp.connection_token.is_empty() {
            core.set_connection_token(tcp.connection_token.as_bytes());
        }

        let inner = Arc::new(TcpInner {
            name: format!("tcp-{}", local.local),
            config: tcp,
            core,
            tls,
            scheduler: scheduler.clone(),
            pool: Arc::new(PoolControl::new()),
            accepted: Arc::new(Mutex::new(Vec::new())),
            state: Mutex::new(TcpState::new()),
        });
        scheduler.add(Arc::clone(&inner) as Arc<dyn Schedulable>)?;
        info!(transport = %inner.name, "TCP transport created");
        Ok(Self { inner })
    }

    /// Bind the listener and start the delivery pool.
    ///
    /// A local port of 0 binds an ephemeral port and updates the local address.
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

        if inner.config.listen {
            let listener = inner.bind()?;
            st.listener = Some(Arc::new(listener));
        }
        st.lifecycle = Lifecycle::Running;
        drop(st);

        WorkerPool::start(
            Arc::clone(inner),
            Arc::clone(&inner.pool),
            inner.config.effective_delivery_threads(),
        )?;
        inner.scheduler.signal(0, true);
        info!(local = %inner.core.local(), "TCP transport running");
        Ok(())
    }

    /// Accepting, sending and delivering.
    pub fn is_running(&self) -> bool {
        self.inner.lock().lifecycle == Lifecycle::Running
    }

    /// Send a transport-internal message: no pipeline, no sequence ticket on
    /// delivery.
    pub fn route_internal(&self, dest: &NodeAddress, payload: &[u8], handler_id: HandlerId) -> bool {
        if !self.is_running() {
            return false;
        }
        let opts = SendOptions {
            check_queue_size: true,
            internal: true,
            ..SendOptions::default()
        };
        self.inner
            .send_data(self.inner.core.local(), dest, &[], payload, handler_id, opts)
    }
}

impl std::fmt::Debug for TcpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.inner.lock();
        f.debug_struct("TcpTransport")
            .field("local", &self.inner.core.local())
            .field("lifecycle", &st.lifecycle)
            .field("connections", &st.connections.len())
            .finish()
    }
}

impl TcpInner {
    fn lock(&self) -> MutexGuard<'_, TcpState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn params(&self) -> ConnectionParams {
        ConnectionParams::from_config(
            &self.config,
            self.core.local(),
            self.tls.clone(),
            self.scheduler.clone(),
        )
    }

    fn bind(&self) -> Result<TcpListener> {
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

        let _runtime = self.scheduler.handle().enter();
        let socket = TcpSocket::new_v4().map_err(bind_err)?;
        socket.set_reuseaddr(true).map_err(bind_err)?;
        socket.bind(addr).map_err(bind_err)?;
        let listener = socket.listen(self.config.backlog).map_err(bind_err)?;

        if port == 0 {
            let bound = listener.local_addr().map_err(bind_err)?.port();
            let mut updated = local;
            updated.local.port = bound.wrapping_sub(self.config.port_offset);
            self.core.set_local(updated);
            info!(port = bound, "bound ephemeral port");
        } else {
            debug!(%addr, "listening");
        }
        Ok(listener)
    }

    fn route(&self, dest: &NodeAddress, payload: &[u8], handler_id: HandlerId, rts: bool) -> bool {
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
        let opts = SendOptions {
            check_queue_size: true,
            rts,
            internal: false,
        };
        self.send_data(self.core.local(), dest, &prefix, &body, handler_id, opts)
    }

    fn send_data(
        &self,
        src: NodeAddress,
        dest: &NodeAddress,
        prefix: &[u8],
        payload: &[u8],
        handler_id: HandlerId,
        opts: SendOptions,
    ) -> bool {
        let mut st = self.lock();
        self.send_locked(&mut st, src, dest, prefix, payload, handler_id, opts)
    }

    #[allow(clippy::too_many_arguments)]
    fn send_locked(
        &self,
        st: &mut TcpState,
        src: NodeAddress,
        dest: &NodeAddress,
        prefix: &[u8],
        payload: &[u8],
        handler_id: HandlerId,
        opts: SendOptions,
    ) -> bool {
        let hop = self.core.next_hop(dest);
        let Some(conn) = self.connect_locked(st, hop, dest) else {
            st.deferred.push(DeferredOp::Send {
                src,
                dest: *dest,
                prefix: prefix.to_vec(),
                payload: payload.to_vec(),
                handler_id,
                opts,
            });
            global_metrics().operation_deferred();
            return true;
        };
        if !conn.is_open() {
            return true;
        }

        let src = self.core.translated_source(hop, src);
        let do_enqueue = !opts.check_queue_size || conn.can_send();
        if !do_enqueue && opts.rts {
            conn.add_rts(*dest, handler_id);
        }
        if do_enqueue || !self.config.reject_route_rts {
            let header = self.core.header(
                src,
                dest,
                handler_id,
                prefix.len() + payload.len(),
                self.config.strip_proxy,
                opts.internal,
            );
            conn.enqueue(header, prefix, payload);
        }
        do_enqueue
    }

    /// Open outgoing connection to `hop`, creating one if needed. `None` when
    /// no socket could be created and the caller should defer.
    fn connect_locked(
        &self,
        st: &mut TcpState,
        hop: SockAddr,
        dest: &NodeAddress,
    ) -> Option<Arc<Connection>> {
        if let Some(conn) = st.out.get(&hop) {
            if conn.is_open() {
                return Some(Arc::clone(conn));
            }
        }

        let params = self.params();
        let token = self.core.connection_token();

        if hop.is_unroutable() {
            let conn = Connection::outgoing(hop, &params, &token, None);
            conn.add_remote_key(*dest);
            conn.close(ErrorKind::ConnectError, ERR_NO_ROUTE, false);
            st.out.insert(hop, Arc::clone(&conn));
            st.connections.push(Arc::clone(&conn));
            self.scheduler.signal(0, true);
            return Some(conn);
        }

        let socket = match TcpSocket::new_v4() {
            Ok(socket) => socket,
            Err(e) if is_transient(&e) => {
                warn!(%hop, error = %e, "out of sockets; deferring connect");
                self.scheduler.free_sockets();
                return None;
            }
            Err(e) => {
                let conn = Connection::outgoing(hop, &params, &token, None);
                conn.add_remote_key(*dest);
                conn.fail_connect(&e);
                st.out.insert(hop, Arc::clone(&conn));
                st.connections.push(Arc::clone(&conn));
                return Some(conn);
            }
        };

        let conn = Connection::outgoing(hop, &params, &token, self.core.source_id());
        conn.add_remote_key(*dest);
        self.dial(&conn, socket, hop);
        st.out.insert(hop, Arc::clone(&conn));
        st.connections.push(Arc::clone(&conn));

        if self.core.local().is_unroutable() {
            let helper = Connection::nat(hop, &params);
            match TcpSocket::new_v4() {
                Ok(socket) => self.dial(&helper, socket, hop),
                Err(e) => helper.fail_connect(&e),
            }
            st.connections.push(helper);
        }

        self.scheduler.signal(0, true);
        Some(conn)
    }

    /// Connect on the scheduler runtime; the connection gets its socket
    /// (or its error) when the connect completes.
    fn dial(&self, conn: &Arc<Connection>, socket: TcpSocket, hop: SockAddr) {
        let addr = hop.to_socket_addr(self.config.port_offset);
        let conn = Arc::clone(conn);
        trace!(conn = conn.id(), %addr, "connecting");
        self.scheduler.handle().spawn(async move {
            match socket.connect(addr).await {
                Ok(stream) => {
                    let socket: Arc<dyn Socket> = Arc::new(stream);
                    conn.attach(socket);
                }
                Err(e) => conn.fail_connect(&e),
            }
        });
    }

    fn forward(&self, header: &WireHeader, payload: &[u8]) -> bool {
        let opts = SendOptions {
            internal: header.has_flag(flags::INTERNAL_MESSAGE),
            ..SendOptions::default()
        };
        self.send_data(header.src, &header.dest, &[], payload, header.handler_id, opts)
    }

    fn request_to_send_locked(&self, st: &mut TcpState, dest: &NodeAddress, handler_id: HandlerId) {
        let hop = self.core.next_hop(dest);
        let Some(conn) = self.connect_locked(st, hop, dest) else {
            st.deferred.push(DeferredOp::RequestToSend {
                dest: *dest,
                handler_id,
            });
            return;
        };
        conn.add_rts(*dest, handler_id);
        if conn.can_send() {
            st.sendable.push_back(conn);
            self.pool.signal();
        }
    }

    fn set_queue_size_locked(&self, st: &mut TcpState, dest: &NodeAddress, size: u32, threshold: u32) {
        let hop = self.core.next_hop(dest);
        match self.connect_locked(st, hop, dest) {
            Some(conn) => conn.set_queue_size(size, threshold),
            None => st.deferred.push(DeferredOp::SetQueueSize {
                dest: *dest,
                size,
                threshold,
            }),
        }
    }

    fn set_window_locked(&self, st: &mut TcpState, dest: &NodeAddress, window: Duration) {
        let hop = self.core.next_hop(dest);
        match self.connect_locked(st, hop, dest) {
            Some(conn) => conn.set_window(window),
            None => st.deferred.push(DeferredOp::SetWindow {
                dest: *dest,
                window,
            }),
        }
    }

    fn replay_deferred(&self, st: &mut TcpState) {
        if st.deferred.is_empty() {
            return;
        }
        let ops = std::mem::take(&mut st.deferred);
        debug!(count = ops.len(), "replaying deferred operations");
        for op in ops {
            match op {
                DeferredOp::Send {
                    src,
                    dest,
                    prefix,
                    payload,
                    handler_id,
                    opts,
                } => {
                    self.send_locked(st, src, &dest, &prefix, &payload, handler_id, opts);
                }
                DeferredOp::RequestToSend { dest, handler_id } => {
                    self.request_to_send_locked(st, &dest, handler_id)
                }
                DeferredOp::SetQueueSize {
                    dest,
                    size,
                    threshold,
                } => self.set_queue_size_locked(st, &dest, size, threshold),
                DeferredOp::SetWindow { dest, window } => self.set_window_locked(st, &dest, window),
            }
        }
    }

    /// Outgoing connection to `dest`, if one exists.
    fn find_out(&self, st: &TcpState, dest: &NodeAddress) -> Option<Arc<Connection>> {
        st.out.get(&self.core.next_hop(dest)).cloned()
    }

    fn find_incoming(&self, st: &TcpState, peer: &NodeAddress) -> Option<Arc<Connection>> {
        st.incoming.get(&identity_of(peer)).cloned()
    }

    fn accept_pending(&self, st: &mut TcpState) {
        let Some(listener) = st.listener.clone() else {
            return;
        };

        let stashed = std::mem::take(&mut *self.accepted.lock().unwrap_or_else(PoisonError::into_inner));
        let mut retried = false;
        for result in stashed {
            if !self.handle_accept(st, result, &mut retried) {
                break;
            }
        }

        let mut cx = Context::from_waker(noop_waker_ref());
        loop {
            let result = match listener.poll_accept(&mut cx) {
                Poll::Ready(result) => result,
                Poll::Pending => break,
            };
            if !self.handle_accept(st, result, &mut retried) {
                break;
            }
        }
    }

    /// Returns whether to keep accepting.
    fn handle_accept(&self, st: &mut TcpState, result: Accepted, retried: &mut bool) -> bool {
        match result {
            Ok((stream, addr)) => {
                let socket: Arc<dyn Socket> = Arc::new(stream);
                match Connection::incoming(socket, &self.params()) {
                    Ok(conn) => {
                        trace!(conn = conn.id(), %addr, "accepted");
                        st.connections.push(conn);
                    }
                    Err(e) => warn!(%addr, error = %e, "failed to set up accepted connection"),
                }
                true
            }
            Err(e) if is_transient(&e) => {
                if *retried {
                    warn!(error = %e, "accept still out of resources; asking scheduler to free sockets");
                    self.scheduler.free_sockets();
                    return false;
                }
                *retried = true;
                let freed = self.garbage_collect_sockets(st);
                self.remove_closed_sockets(st);
                debug!(freed, error = %e, "accept out of resources; retrying after collection");
                true
            }
            Err(e) if is_connection_failure(&e) => {
                debug!(error = %e, "peer gave up before accept");
                true
            }
            Err(e) => {
                warn!(error = %e, "accept failed");
                false
            }
        }
    }

    /// Close idle connections whose idle time is at least the median.
    fn garbage_collect_sockets(&self, st: &mut TcpState) -> usize {
        let now = Instant::now();
        let idle: Vec<(Duration, Arc<Connection>)> = st
            .connections
            .iter()
            .filter(|c| c.is_open() && !c.is_connecting() && c.is_idle())
            .map(|c| (now.saturating_duration_since(c.last_activity()), Arc::clone(c)))
            .collect();
        if idle.is_empty() {
            return 0;
        }
        let mut times: Vec<Duration> = idle.iter().map(|(d, _)| *d).collect();
        times.sort_unstable();
        let median = times[times.len() / 2];

        let mut closed = 0;
        for (idle_for, conn) in idle {
            if idle_for >= median && conn.close(ErrorKind::NonError, ERR_CONNECTION_IDLE, true) {
                global_metrics().connection_collected();
                closed += 1;
            }
        }
        info!(transport = %self.name, closed, median_ms = median.as_millis() as u64, "collected idle connections");
        closed
    }

    /// Close the other direction to `conn`'s peer, if one exists.
    fn close_bidirectional(&self, st: &TcpState, conn: &Arc<Connection>) {
        let Some(id) = conn.identity() else {
            return;
        };
        let other = match conn.direction() {
            Direction::Outgoing => st.incoming.get(&id),
            Direction::Incoming | Direction::Nat => st.out.get(&id),
        };
        if let Some(other) = other {
            if !Arc::ptr_eq(other, conn) {
                other.close(ErrorKind::NonError, &conn.error_message(), true);
            }
        }
    }

    /// Drop closed connections, queueing the reportable ones for error
    /// delivery. Returns whether any error was queued.
    fn remove_closed_sockets(&self, st: &mut TcpState) -> bool {
        if st.connections.iter().all(|c| c.is_open()) {
            return false;
        }
        let (closed, open): (Vec<_>, Vec<_>) = std::mem::take(&mut st.connections)
            .into_iter()
            .partition(|c| !c.is_open());
        st.connections = open;

        let mut queued = false;
        for conn in closed {
            if conn.error_kind().is_reported() {
                st.errors.push_back(Arc::clone(&conn));
                queued = true;
            }
            if let Some(id) = conn.identity() {
                if st.out.get(&id).map_or(false, |c| Arc::ptr_eq(c, &conn)) {
                    st.out.remove(&id);
                    self.core.remove_translation(id);
                }
                if st.incoming.get(&id).map_or(false, |c| Arc::ptr_eq(c, &conn)) {
                    st.incoming.remove(&id);
                }
            }
            trace!(conn = conn.id(), "removed closed connection");
        }
        queued
    }

    /// Register connections that just learned their peer's identity.
    fn register_identified(&self, st: &mut TcpState, identified: Vec<Arc<Connection>>) {
        for conn in identified {
            let Some(id) = conn.identity() else {
                continue;
            };
            let map = match conn.direction() {
                Direction::Outgoing => &mut st.out,
                Direction::Incoming | Direction::Nat => &mut st.incoming,
            };
            if let Some(old) = map.insert(id, Arc::clone(&conn)) {
                if !Arc::ptr_eq(&old, &conn) {
                    debug!(identity = %id, old = old.id(), new = conn.id(), "replacing connection");
                    old.close(ErrorKind::NonError, ERR_PEER_RESET, false);
                }
            }
        }
    }

    /// Whether input from `conn` has to wait for a route back to its peer.
    fn awaits_route(st: &TcpState, conn: &Connection) -> bool {
        conn.is_open()
            && conn
                .identity()
                .map_or(false, |id| id.is_unroutable() && !st.out.contains_key(&id))
    }

    fn release_deferred_deliveries(st: &mut TcpState) -> bool {
        if st.deferred_deliveries.is_empty() {
            return false;
        }
        let pending = std::mem::take(&mut st.deferred_deliveries);
        let mut released = false;
        for conn in pending {
            if Self::awaits_route(st, &conn) {
                st.deferred_deliveries.push(conn);
            } else {
                st.deliverable.push_back(conn);
                released = true;
            }
        }
        released
    }

    fn check_acceptance(&self, conn: &Connection, header: &WireHeader) -> bool {
        let token_addr = conn.token_addr();
        let peer = if token_addr.is_null() {
            header.src
        } else {
            token_addr
        };
        if self.core.accept_connection(&peer, &conn.token()) {
            conn.accept();
            global_metrics().connection_accepted();
            debug!(conn = conn.id(), %peer, "connection accepted");
            return true;
        }
        conn.close(ErrorKind::NotAccepted, ERR_CONNECTION_REJECTED, true);
        while conn.dequeue().is_some() {}
        global_metrics().connection_rejected();
        info!(conn = conn.id(), %peer, "connection rejected");
        false
    }

    fn notify_error(&self, conn: &Connection, handlers: &[HandlerLease<dyn NetworkErrorHandler>]) {
        let kind = conn.error_kind();
        let message = conn.error_message();
        for peer in conn.remote_keys() {
            for handler in handlers {
                handler.error(&peer, kind, &message, handler.id());
            }
        }
        if self.config.upcall_message_errors && conn.direction() == Direction::Outgoing {
            conn.notify_message_errors(self.core.pipeline(), handlers);
        }
    }

    fn has_outgoing_buffered_data(&self) -> bool {
        self.lock().has_outgoing()
    }

    fn shutdown(&self) {
        let mut st = self.lock();
        match st.lifecycle {
            Lifecycle::Starting => {
                st.lifecycle = Lifecycle::Stopped;
                st.close_sockets = true;
            }
            Lifecycle::Running => st.lifecycle = Lifecycle::ShuttingDown,
            Lifecycle::ShuttingDown | Lifecycle::Stopped => return,
        }
        drop(st);
        info!(transport = %self.name, "shutting down");
        self.pool.signal();
        self.scheduler.signal(0, true);
    }

    // delivery state machine

    fn on_waiting(&self, st: &mut TcpState) -> (DeliverState, Option<DeliveryJob>) {
        let keep = st
            .current
            .as_ref()
            .map_or(false, |c| !st.is_busy(c) && c.has_inbound());
        if !keep {
            if let Some(prev) = st.current.take() {
                // an in-flight connection is handed back by `finish`
                if !st.is_busy(&prev) {
                    st.release(prev);
                }
            }
            st.consecutive = 0;
            st.current = st.deliverable.pop_front().or_else(|| st.throttled.pop_front());
        }
        (DeliverState::Waiting.fall_through(), None)
    }

    fn on_deliver(&self, st: &mut TcpState) -> (DeliverState, Option<DeliveryJob>) {
        let next = DeliverState::Deliver.fall_through();
        let Some(conn) = st.current.clone() else {
            return (next, None);
        };
        if st.is_busy(&conn) || !conn.is_deliverable() || !conn.has_inbound() {
            return (next, None);
        }

        let cap = self.config.max_consecutive_deliver;
        if cap > 0 && st.consecutive >= cap {
            trace!(conn = conn.id(), "consecutive delivery cap reached");
            st.current = None;
            st.throttled.push_back(conn);
            return (next, None);
        }

        if st.lifecycle == Lifecycle::ShuttingDown && self.core.data_handlers.is_empty() {
            let mut dropped = 0usize;
            while conn.dequeue().is_some() {
                dropped += 1;
            }
            debug!(conn = conn.id(), dropped, "no data handlers during shutdown; input dropped");
            return (next, None);
        }

        let Some((header, payload)) = conn.dequeue() else {
            return (next, None);
        };
        if !header.has_flag(flags::INTERNAL_MESSAGE) {
            let ticket = new_message_ticket();
            trace!(ticket, conn = conn.id(), "delivery ticket");
        }
        let learn_key = !conn.has_remote_keys() || self.core.is_proxying();
        let handler = self.core.data_handlers.lease(header.handler_id);
        let check_accept = !conn.is_accepted();

        st.busy.insert(conn.id());
        st.consecutive += 1;
        let job = DeliveryJob::Deliver {
            source: Some(conn),
            header,
            payload,
            handler,
            learn_key,
            check_accept,
        };
        (DeliverState::Deliver, Some(job))
    }

    fn on_rts(&self, st: &mut TcpState) -> (DeliverState, Option<DeliveryJob>) {
        let next = DeliverState::Rts.fall_through();
        while let Some(conn) = st.sendable.pop_front() {
            if !conn.is_open() || !conn.can_send() {
                continue;
            }
            let Some((peer, handler_id)) = conn.pop_rts() else {
                continue;
            };
            if conn.has_rts() {
                st.resend.push(Arc::clone(&conn));
            }
            match self.core.status_handlers.lease(handler_id) {
                Some(handler) => return (next, Some(DeliveryJob::ClearToSend { peer, handler })),
                None => warn!(handler_id, %peer, "no status handler for clear-to-send"),
            }
        }
        (next, None)
    }

    fn on_error(&self, st: &mut TcpState) -> (DeliverState, Option<DeliveryJob>) {
        let next = DeliverState::Error.fall_through();
        if self.core.error_handlers.is_empty() {
            if !st.errors.is_empty() {
                debug!(count = st.errors.len(), "no error handlers; dropping connection errors");
                st.errors.clear();
            }
            return (next, None);
        }
        let job = st.errors.pop_front().map(|connection| DeliveryJob::Error {
            connection,
            handlers: self.core.error_handlers.leases(),
        });
        (next, job)
    }

    fn on_flushed(&self, st: &mut TcpState) -> (DeliverState, Option<DeliveryJob>) {
        let next = DeliverState::Flushed.fall_through();
        while let Some(id) = st.flushed.pop_front() {
            match self.core.status_handlers.lease(id) {
                Some(handler) => return (next, Some(DeliveryJob::Flushed { handler })),
                None => warn!(handler_id = id, "no status handler for flush notification"),
            }
        }
        (next, None)
    }
}

impl DeliveryLoop for TcpInner {
    type State = TcpState;

    fn name(&self) -> &str {
        &self.name
    }

    fn state(&self) -> &Mutex<TcpState> {
        &self.state
    }

    fn condition(&self, st: &mut TcpState) -> bool {
        match st.deliver_state {
            DeliverState::PostFinito => return false,
            DeliverState::Waiting => {}
            _ => return true,
        }
        self.core.apply_unregistrations();
        let resend = std::mem::take(&mut st.resend);
        st.sendable.extend(resend);
        if st.has_work() {
            return true;
        }
        if st.lifecycle == Lifecycle::ShuttingDown {
            st.deliver_state = DeliverState::Finito;
            return true;
        }
        false
    }

    fn setup(&self, st: &mut TcpState) -> Option<DeliveryJob> {
        loop {
            let state = st.deliver_state;
            let (next, job) = match state {
                DeliverState::Waiting => self.on_waiting(st),
                DeliverState::Deliver => self.on_deliver(st),
                DeliverState::Rts => self.on_rts(st),
                DeliverState::Error => self.on_error(st),
                DeliverState::Flushed => self.on_flushed(st),
                DeliverState::Finito => (DeliverState::PostFinito, Some(DeliveryJob::Shutdown)),
                DeliverState::PostFinito => return None,
            };
            st.deliver_state = next;
            if job.is_some() || state == DeliverState::Flushed {
                return job;
            }
        }
    }

    fn process(&self, job: &mut DeliveryJob, pool: &PoolControl) {
        match job {
            DeliveryJob::Deliver {
                source,
                header,
                payload,
                handler,
                check_accept,
                ..
            } => {
                if *check_accept {
                    if let Some(conn) = source {
                        if !self.check_acceptance(conn, header) {
                            return;
                        }
                    }
                }
                let payload = std::mem::take(payload);
                self.core
                    .deliver_data(header, payload, handler.as_deref(), |h, p| self.forward(h, p));
            }
            DeliveryJob::ClearToSend { peer, handler } => {
                trace!(%peer, handler_id = handler.id(), "clear to send");
                handler.clear_to_send(peer, handler.id());
            }
            DeliveryJob::Error {
                connection,
                handlers,
            } => self.notify_error(connection, handlers.as_slice()),
            DeliveryJob::Flushed { handler } => handler.notify_flushed(handler.id()),
            DeliveryJob::Shutdown => {
                while self.has_outgoing_buffered_data() {
                    thread::sleep(DRAIN_POLL);
                }
                pool.halt();
            }
        }
    }

    fn finish(&self, st: &mut TcpState, job: DeliveryJob) {
        if let DeliveryJob::Deliver {
            source: Some(conn),
            header,
            learn_key,
            ..
        } = job
        {
            st.busy.remove(&conn.id());
            if learn_key {
                conn.add_remote_key(header.src);
            }
            if !st.is_current(&conn) {
                st.release(conn);
            }
        }
    }

    fn halted(&self) {
        let mut st = self.lock();
        st.lifecycle = Lifecycle::Stopped;
        st.close_sockets = true;
        drop(st);
        info!(transport = %self.name, "delivery halted; transport stopped");
        global_metrics().log_metrics();
        self.scheduler.signal(0, true);
    }
}

impl Schedulable for TcpInner {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_running(&self) -> bool {
        let mut st = self.lock();
        if st.lifecycle != Lifecycle::Stopped {
            return true;
        }
        if std::mem::take(&mut st.close_sockets) {
            for conn in st.connections.drain(..) {
                conn.close(ErrorKind::NonError, ERR_TRANSPORT_SHUTDOWN, false);
            }
            st.out.clear();
            st.incoming.clear();
            st.listener = None;
            info!(transport = %self.name, "sockets closed");
        }
        false
    }

    fn interest(&self) -> Vec<Readiness> {
        let st = self.lock();
        if st.lifecycle == Lifecycle::Stopped {
            return Vec::new();
        }
        let mut interest: Vec<Readiness> = st
            .connections
            .iter()
            .filter_map(|c| c.interest())
            .collect();
        if let Some(listener) = &st.listener {
            let listener = Arc::clone(listener);
            let stash = Arc::clone(&self.accepted);
            interest.push(Box::pin(async move {
                let result = listener.accept().await;
                stash
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(result);
            }));
        }
        interest
    }

    fn do_io(&self, wake: Instant) {
        let mut st = self.lock();
        if st.lifecycle == Lifecycle::Stopped {
            return;
        }
        let st = &mut *st;

        self.replay_deferred(st);
        self.accept_pending(st);

        let mut identified = Vec::new();
        let mut wake_pool = false;
        for conn in st.connections.clone() {
            if conn.opened_at() > wake {
                continue;
            }
            if conn.is_readable() {
                conn.read();
                if conn.take_newly_identified() {
                    identified.push(Arc::clone(&conn));
                }
            }
            if conn.is_writable() {
                conn.write();
            }
            if conn.has_rts()
                && conn.can_send()
                && !st.sendable.iter().any(|c| Arc::ptr_eq(c, &conn))
            {
                st.sendable.push_back(Arc::clone(&conn));
                wake_pool = true;
            }
            if conn.has_inbound() && !conn.is_deliverable() {
                conn.set_deliverable(true);
                if Self::awaits_route(st, &conn) {
                    trace!(conn = conn.id(), "delivery deferred until a route back exists");
                    st.deferred_deliveries.push(Arc::clone(&conn));
                } else {
                    st.deliverable.push_back(Arc::clone(&conn));
                    wake_pool = true;
                }
            }
            if !conn.is_open() && conn.error_kind() != ErrorKind::NonError {
                self.close_bidirectional(st, &conn);
            }
        }

        wake_pool |= self.remove_closed_sockets(st);
        self.register_identified(st, identified);
        wake_pool |= Self::release_deferred_deliveries(st);

        if !st.flush_waiting.is_empty() && !st.has_outgoing() {
            let waiting = std::mem::take(&mut st.flush_waiting);
            st.flushed.extend(waiting);
            wake_pool = true;
        }

        if wake_pool {
            self.pool.signal();
        }
    }

    fn free_sockets(&self) {
        let mut st = self.lock();
        let closed = self.garbage_collect_sockets(&mut st);
        if closed > 0 && self.remove_closed_sockets(&mut st) {
            self.pool.signal();
        }
    }
}

impl Transport for TcpTransport {
    fn local_address(&self) -> NodeAddress {
        self.inner.core.local()
    }

    fn route(&self, dest: &NodeAddress, payload: &[u8], handler_id: HandlerId) -> bool {
        self.inner.route(dest, payload, handler_id, false)
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
        let st = self.inner.lock();
        if let Some(conn) = self.inner.find_incoming(&st, peer) {
            conn.suspend();
        }
    }

    fn resume_deliver(&self, peer: &NodeAddress) {
        self.inner.core.resume(peer);
        let st = self.inner.lock();
        if let Some(conn) = self.inner.find_incoming(&st, peer) {
            conn.resume();
        }
        drop(st);
        self.inner.scheduler.signal(0, true);
    }

    fn shutdown(&self) {
        self.inner.shutdown();
    }
}

impl BufferedTransport for TcpTransport {
    fn route_rts(&self, dest: &NodeAddress, payload: &[u8], handler_id: HandlerId) -> bool {
        self.inner.route(dest, payload, handler_id, true)
    }

    fn can_send(&self, dest: &NodeAddress) -> bool {
        let st = self.inner.lock();
        self.inner
            .find_out(&st, dest)
            .map_or(true, |conn| conn.can_send())
    }

    fn available_buffer_size(&self, dest: &NodeAddress) -> u32 {
        let st = self.inner.lock();
        match self.inner.find_out(&st, dest) {
            Some(conn) => {
                let free = u64::from(conn.queue_size()).saturating_sub(conn.outgoing_size());
                u32::try_from(free).unwrap_or(u32::MAX)
            }
            None => self.inner.config.queue_size,
        }
    }

    fn buffered_data_size(&self) -> u64 {
        let st = self.inner.lock();
        st.connections
            .iter()
            .map(|c| c.outgoing_size() + c.incoming_size())
            .sum()
    }

    fn outgoing_buffered_data_size(&self, dest: &NodeAddress) -> u64 {
        let st = self.inner.lock();
        self.inner
            .find_out(&st, dest)
            .map_or(0, |conn| conn.outgoing_size())
    }

    fn incoming_buffered_data_size(&self, dest: &NodeAddress) -> u64 {
        let st = self.inner.lock();
        self.inner
            .find_incoming(&st, dest)
            .map_or(0, |conn| conn.incoming_size())
    }

    fn incoming_message_queue_size(&self, dest: &NodeAddress) -> usize {
        let st = self.inner.lock();
        self.inner
            .find_incoming(&st, dest)
            .map_or(0, |conn| conn.inbound_count())
    }

    fn has_outgoing_buffered_data(&self) -> bool {
        self.inner.has_outgoing_buffered_data()
    }

    fn statistics(&self, peer: &NodeAddress, direction: Direction) -> Option<BufferStatistics> {
        let st = self.inner.lock();
        let conn = match direction {
            Direction::Outgoing => self.inner.find_out(&st, peer),
            Direction::Incoming => self.inner.find_incoming(&st, peer),
            Direction::Nat => {
                let id = identity_of(peer);
                st.connections
                    .iter()
                    .find(|c| c.direction() == Direction::Nat && c.remote() == id)
                    .cloned()
            }
        };
        conn.map(|c| c.statistics())
    }

    fn set_queue_size(&self, peer: &NodeAddress, size: u32, threshold: Option<u32>) {
        let threshold = threshold.unwrap_or((size / 2).max(1));
        let mut st = self.inner.lock();
        self.inner.set_queue_size_locked(&mut st, peer, size, threshold);
    }

    fn set_window_size(&self, peer: &NodeAddress, window: Duration) {
        let mut st = self.inner.lock();
        self.inner.set_window_locked(&mut st, peer, window);
    }

    fn request_to_send(&self, dest: &NodeAddress, handler_id: HandlerId) {
        let mut st = self.inner.lock();
        self.inner.request_to_send_locked(&mut st, dest, handler_id);
    }

    fn request_flushed_notification(&self, handler_id: HandlerId) {
        let mut st = self.inner.lock();
        if st.has_outgoing() {
            st.flush_waiting.push(handler_id);
        } else {
            st.flushed.push_back(handler_id);
            drop(st);
            self.inner.pool.signal();
        }
    }

    fn register_status_handler(
        &self,
        handler: Arc<dyn ConnectionStatusHandler>,
        id: Option<HandlerId>,
    ) -> HandlerId {
        self.inner.core.status_handlers.register(handler, id)
    }

    fn unregister_status_handler(&self, id: HandlerId) {
        self.inner.core.status_handlers.unregister(id);
        self.inner.pool.signal();
    }

    fn close(&self, dest: &NodeAddress) {
        let st = self.inner.lock();
        let targets = [self.inner.find_out(&st, dest), self.inner.find_incoming(&st, dest)];
        for conn in targets.into_iter().flatten() {
            conn.close(ErrorKind::NonError, ERR_CONNECTION_CLOSED, false);
        }
    }

    fn connection_count(&self) -> usize {
        self.inner.lock().connections.len()
    }
}

impl ConnectionAcceptance for TcpTransport {
    fn register_acceptance_handler(
        &self,
        handler: Arc<dyn ConnectionAcceptanceHandler>,
        id: Option<HandlerId>,
    ) -> HandlerId {
        self.inner.core.acceptance_handlers.register(handler, id)
    }

    fn unregister_acceptance_handler(&self, id: HandlerId) {
        self.inner.core.acceptance_handlers.unregister(id);
        self.inner.pool.signal();
    }

    fn set_authoritative_acceptor(&self, id: HandlerId) -> Result<()> {
        self.inner.core.set_authoritative_acceptor(id)
    }

    fn set_connection_token(&self, token: &[u8]) {
        self.inner.core.set_connection_token(token);
    }
}

impl CryptoTransport for TcpTransport {
    fn peer_common_name(&self, peer: &NodeAddress) -> Option<String> {
        let st = self.inner.lock();
        self.inner
            .find_out(&st, peer)
            .and_then(|c| c.peer_common_name())
            .or_else(|| {
                self.inner
                    .find_incoming(&st, peer)
                    .and_then(|c| c.peer_common_name())
            })
    }

    fn peer_public_key(&self, peer: &NodeAddress) -> Option<Vec<u8>> {
        let st = self.inner.lock();
        self.inner
            .find_out(&st, peer)
            .and_then(|c| c.peer_public_key())
            .or_else(|| {
                self.inner
                    .find_incoming(&st, peer)
                    .and_then(|c| c.peer_public_key())
            })
    }
}
