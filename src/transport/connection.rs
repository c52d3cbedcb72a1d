//! # Connection
//!
//! One TCP connection: its socket, framing state and per-direction queues.
//!
//! ## Directions
//! - **Incoming**: accepted from a peer; read, never written
//! - **Outgoing**: dialed by us (or a NAT helper the peer opened to us);
//!   written, never read once connected
//! - **Nat**: helper we open to a peer when our own address is unroutable;
//!   read and written
//!
//! ## Outbound
//! Every message becomes one frame (`header + prefix + payload`). Frames wait
//! in the outbound queue, are copied into a write buffer of at most
//! [`BLOCK_SIZE`] bytes, and stay in flight until the socket has taken every
//! byte. `bytes_queued - bytes_sent` is the unsent count used for flow control.
//!
//! ## Inbound
//! Bytes are read into a growable ring buffer. A header is decoded once
//! [`HEADER_SIZE`] bytes are buffered; its payload is taken once `size` more
//! bytes are available, then the pair is queued for delivery.

use std::collections::{BTreeSet, VecDeque};
use std::io::{self, Read, Write};
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::{debug, info, trace, warn};

use super::socket::Socket;
use super::tls::TlsContext;
use super::Readiness;
use crate::config::TcpConfig;
use crate::core::address::{NodeAddress, SockAddr};
use crate::core::header::{flags, HandlerId, WireHeader, HEADER_SIZE};
use crate::core::ring_buffer::RingBuffer;
use crate::error::constants::{ERR_INVALID_HEADER, ERR_OVERSIZED_MESSAGE, ERR_SOCKET_CLOSED};
use crate::error::ErrorKind;
use crate::protocol::handler::{HandlerLease, NetworkErrorHandler};
use crate::protocol::pipeline::PipelineStage;
use crate::scheduler::Scheduler;
use crate::utils::metrics::{global_metrics, BufferStatistics};

/// Largest write handed to the socket in one call.
pub const BLOCK_SIZE: usize = 32 * 1024;

/// Socket reads or writes per connection per scheduler pass.
const IO_PER_PASS: usize = 16;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Who opened the connection and which way data flows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Incoming,
    Outgoing,
    Nat,
}

impl Direction {
    fn reads(self) -> bool {
        matches!(self, Direction::Incoming | Direction::Nat)
    }

    fn writes(self) -> bool {
        matches!(self, Direction::Outgoing | Direction::Nat)
    }
}

/// Settings shared by every connection of a transport.
#[derive(Clone)]
pub struct ConnectionParams {
    pub tls: Option<Arc<TlsContext>>,
    pub queue_size: u32,
    pub threshold: u32,
    pub window: Duration,
    pub read_buffer_size: usize,
    pub max_message_size: usize,
    pub nodelay: bool,
    pub scheduler: Scheduler,
    pub local: NodeAddress,
}

impl ConnectionParams {
    pub fn from_config(
        config: &TcpConfig,
        local: NodeAddress,
        tls: Option<Arc<TlsContext>>,
        scheduler: Scheduler,
    ) -> Self {
        Self {
            tls,
            queue_size: config.queue_size,
            threshold: config.effective_threshold(),
            window: config.window_size,
            read_buffer_size: config.read_buffer_size,
            max_message_size: config.max_message_size,
            nodelay: config.set_nodelay,
            scheduler,
            local,
        }
    }
}

/// An unsent message. `bytes` holds the encoded header, prefix and payload.
struct Frame {
    header: WireHeader,
    bytes: Vec<u8>,
    prefix_len: usize,
    /// Value of `bytes_queued` once this frame was queued.
    end: u64,
}

/// A message that was queued but never fully written.
#[derive(Debug, Clone)]
pub struct UnsentMessage {
    pub header: WireHeader,
    pub prefix: Vec<u8>,
    pub payload: Vec<u8>,
}

pub struct Connection {
    id: u64,
    scheduler: Scheduler,
    state: Mutex<ConnState>,
}

struct ConnState {
    socket: Option<Arc<dyn Socket>>,
    tls: Option<rustls::Connection>,
    crypto: Option<Arc<TlsContext>>,
    direction: Direction,

    open: bool,
    connecting: bool,
    sendable: bool,
    suspended: bool,
    deliverable: bool,
    accepted: bool,
    error_kind: ErrorKind,
    error_message: String,

    queue_size: u32,
    threshold: u32,
    nodelay: bool,
    max_message_size: usize,

    outbound: VecDeque<Frame>,
    in_flight: VecDeque<Frame>,
    chunk_offset: usize,
    write_buf: Vec<u8>,
    bytes_queued: u64,
    bytes_sent: u64,

    inbound: VecDeque<(WireHeader, Vec<u8>)>,
    inbound_bytes: u64,
    read_buf: RingBuffer,
    pending_header: Option<WireHeader>,

    stats: BufferStatistics,

    remote: SockAddr,
    identity: Option<SockAddr>,
    newly_identified: bool,
    remote_keys: BTreeSet<NodeAddress>,
    rts: VecDeque<(NodeAddress, HandlerId)>,

    token: Vec<u8>,
    token_addr: NodeAddress,
    peer_common_name: Option<String>,
    peer_public_key: Option<Vec<u8>>,

    started: Instant,
    connect_time: Duration,
    last_activity: Instant,
    byte_count: u64,
}

/// Blocking-style I/O over a non-blocking socket, for `rustls`.
struct SocketIo<'a>(&'a dyn Socket);

impl Read for SocketIo<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.try_read(buf)
    }
}

impl Write for SocketIo<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.try_write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn would_block(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock
}

impl Connection {
    fn build(
        direction: Direction,
        socket: Option<Arc<dyn Socket>>,
        remote: SockAddr,
        identity: Option<SockAddr>,
        params: &ConnectionParams,
    ) -> ConnState {
        let now = Instant::now();
        ConnState {
            socket,
            tls: None,
            crypto: params.tls.clone(),
            direction,
            open: true,
            connecting: true,
            sendable: true,
            suspended: false,
            deliverable: false,
            accepted: direction != Direction::Incoming,
            error_kind: ErrorKind::NonError,
            error_message: String::new(),
            queue_size: params.queue_size,
            threshold: params.threshold,
            nodelay: params.nodelay,
            max_message_size: params.max_message_size,
            outbound: VecDeque::new(),
            in_flight: VecDeque::new(),
            chunk_offset: 0,
            write_buf: Vec::new(),
            bytes_queued: 0,
            bytes_sent: 0,
            inbound: VecDeque::new(),
            inbound_bytes: 0,
            read_buf: RingBuffer::new(params.read_buffer_size.max(HEADER_SIZE)),
            pending_header: None,
            stats: BufferStatistics::new(params.window),
            remote,
            identity,
            newly_identified: false,
            remote_keys: BTreeSet::new(),
            rts: VecDeque::new(),
            token: Vec::new(),
            token_addr: NodeAddress::NULL,
            peer_common_name: None,
            peer_public_key: None,
            started: now,
            connect_time: Duration::ZERO,
            last_activity: now,
            byte_count: 0,
        }
    }

    fn wrap(state: ConnState, params: &ConnectionParams) -> Arc<Self> {
        global_metrics().connection_opened();
        Arc::new(Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            scheduler: params.scheduler.clone(),
            state: Mutex::new(state),
        })
    }

    /// Wrap a socket returned by `accept`.
    pub fn incoming(socket: Arc<dyn Socket>, params: &ConnectionParams) -> crate::error::Result<Arc<Self>> {
        let remote = SockAddr::try_from(socket.peer_addr()?)?;
        if params.nodelay {
            socket.set_nodelay(true)?;
        }
        let mut state = Self::build(Direction::Incoming, Some(socket), remote, None, params);
        match &params.tls {
            Some(ctx) => state.tls = Some(ctx.server_session()?),
            None => state.connecting = false,
        }
        let conn = Self::wrap(state, params);
        debug!(conn = conn.id, remote = %remote, "incoming connection");
        Ok(conn)
    }

    /// A connection being dialed to `remote`; [`attach`](Self::attach) supplies
    /// the socket once the connect completes.
    ///
    /// A non-empty `token` and a `source_id` are announced ahead of any data.
    pub fn outgoing(
        remote: SockAddr,
        params: &ConnectionParams,
        token: &[u8],
        source_id: Option<SockAddr>,
    ) -> Arc<Self> {
        let mut state = Self::build(Direction::Outgoing, None, remote, Some(remote), params);
        if !token.is_empty() {
            let header = WireHeader::new(
                params.local,
                NodeAddress::direct(remote),
                0,
                flags::ACCEPTANCE_TOKEN,
                token.len() as u32,
            );
            state.queue_frame(header, &[], token);
        }
        if let Some(src) = source_id {
            let header = WireHeader::new(
                NodeAddress::direct(src),
                NodeAddress::direct(remote),
                0,
                flags::SOURCE_ID,
                0,
            );
            state.queue_frame(header, &[], &[]);
        }
        let conn = Self::wrap(state, params);
        debug!(conn = conn.id, remote = %remote, "outgoing connection");
        conn
    }

    /// Helper connection through which a peer can reach us while our own
    /// address is unroutable.
    pub fn nat(remote: SockAddr, params: &ConnectionParams) -> Arc<Self> {
        let mut state = Self::build(Direction::Nat, None, remote, None, params);
        let header = WireHeader::new(
            params.local,
            NodeAddress::direct(remote),
            0,
            flags::NAT_CONNECTION,
            0,
        );
        state.queue_frame(header, &[], &[]);
        let conn = Self::wrap(state, params);
        debug!(conn = conn.id, remote = %remote, "NAT helper connection");
        conn
    }

    fn lock(&self) -> MutexGuard<'_, ConnState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Install the socket of a completed connect.
    pub fn attach(&self, socket: Arc<dyn Socket>) {
        {
            let mut st = self.lock();
            if !st.open {
                return;
            }
            if st.nodelay {
                if let Err(e) = socket.set_nodelay(true) {
                    warn!(conn = self.id, error = %e, "failed to set TCP_NODELAY");
                }
            }
            let remote = IpAddr::V4(st.remote.addr);
            let attempt = st.crypto.as_ref().map(|ctx| ctx.client_session(remote));
            let session = match attempt {
                Some(Ok(session)) => Some(session),
                Some(Err(e)) => {
                    st.close_locked(self.id, ErrorKind::TlsError, &e.to_string(), false);
                    drop(st);
                    self.scheduler.signal(0, true);
                    return;
                }
                None => None,
            };
            if session.is_none() {
                st.connecting = false;
                st.connect_time = st.started.elapsed();
            }
            st.tls = session;
            st.socket = Some(socket);
            st.last_activity = Instant::now();
            debug!(conn = self.id, remote = %st.remote, "connected");
        }
        self.scheduler.signal(0, true);
    }

    /// The non-blocking connect failed.
    pub fn fail_connect(&self, err: &io::Error) {
        let message = format!("connect to {} failed: {err}", self.remote());
        self.close(ErrorKind::ConnectError, &message, false);
    }

    /// Read everything the socket has, queueing complete messages.
    pub fn read(&self) {
        self.lock().read(self.id);
    }

    /// Write as much queued output as the socket accepts.
    pub fn write(&self) {
        self.lock().write(self.id);
    }

    /// Queue a message. Returns false once the connection is closed.
    pub fn enqueue(&self, header: WireHeader, prefix: &[u8], payload: &[u8]) -> bool {
        let delta = {
            let mut st = self.lock();
            if !st.open {
                return false;
            }
            let was_empty = st.unsent() == 0;
            st.queue_frame(header, prefix, payload);
            st.try_fast_path(self.id);
            global_metrics().message_sent();
            if was_empty {
                st.unsent()
            } else {
                0
            }
        };
        if delta > 0 {
            self.scheduler.signal(delta as usize, false);
        }
        true
    }

    /// Next complete inbound message.
    pub fn dequeue(&self) -> Option<(WireHeader, Vec<u8>)> {
        let mut st = self.lock();
        let msg = st.inbound.pop_front()?;
        st.inbound_bytes -= msg.1.len() as u64;
        Some(msg)
    }

    /// Close the connection. Returns false if it was already closed.
    ///
    /// `reset` aborts with an RST instead of a graceful FIN.
    pub fn close(&self, kind: ErrorKind, message: &str, reset: bool) -> bool {
        let closed = self.lock().close_locked(self.id, kind, message, reset);
        if closed {
            self.scheduler.signal(0, true);
        }
        closed
    }

    /// Readiness future covering what the connection currently waits for.
    pub fn interest(&self) -> Option<Readiness> {
        let st = self.lock();
        let socket = st.socket.clone()?;
        let read = st.readable();
        let write = st.writable();
        drop(st);
        if read || write {
            Some(socket.readiness(read, write))
        } else {
            None
        }
    }

    /// Drain every message not fully written, in enqueue order.
    pub fn take_message_errors(&self) -> Vec<UnsentMessage> {
        self.lock().take_unsent()
    }

    /// Report each unsent message through `pipeline` and then each handler.
    pub fn notify_message_errors(
        &self,
        pipeline: Option<&dyn PipelineStage>,
        handlers: &[HandlerLease<dyn NetworkErrorHandler>],
    ) {
        let kind = self.error_kind();
        for mut msg in self.take_message_errors() {
            let internal = msg.header.has_flag(flags::INTERNAL_MESSAGE);
            if let Some(stage) = pipeline.filter(|_| !internal) {
                if let Err(e) = stage.message_error(
                    &msg.header.dest,
                    &mut msg.prefix,
                    &mut msg.payload,
                    msg.header.handler_id,
                ) {
                    warn!(conn = self.id, error = %e, "pipeline rejected message error");
                }
            }
            for handler in handlers {
                handler.message_error(&msg.header.dest, kind, &msg.payload, msg.header.handler_id);
            }
            global_metrics().message_error();
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn direction(&self) -> Direction {
        self.lock().direction
    }

    /// Address dialed, or the peer address of an accepted socket.
    pub fn remote(&self) -> SockAddr {
        self.lock().remote
    }

    /// Address the peer is known by, once learned.
    pub fn identity(&self) -> Option<SockAddr> {
        self.lock().identity
    }

    /// True once after the identity was learned from the peer's first frame.
    pub fn take_newly_identified(&self) -> bool {
        std::mem::take(&mut self.lock().newly_identified)
    }

    pub fn add_remote_key(&self, key: NodeAddress) {
        self.lock().remote_keys.insert(key);
    }

    pub fn remote_keys(&self) -> Vec<NodeAddress> {
        self.lock().remote_keys.iter().copied().collect()
    }

    pub fn has_remote_keys(&self) -> bool {
        !self.lock().remote_keys.is_empty()
    }

    pub fn is_open(&self) -> bool {
        self.lock().open
    }

    /// Still connecting, handshaking, or waiting to learn the peer's identity.
    pub fn is_connecting(&self) -> bool {
        let st = self.lock();
        st.connecting || st.identity.is_none()
    }

    /// Nothing to deliver, nothing to write, nothing half-read.
    pub fn is_idle(&self) -> bool {
        let st = self.lock();
        st.inbound.is_empty() && !st.writable() && st.read_buf.is_empty()
    }

    pub fn is_readable(&self) -> bool {
        self.lock().readable()
    }

    pub fn is_writable(&self) -> bool {
        self.lock().writable()
    }

    pub fn is_deliverable(&self) -> bool {
        self.lock().deliverable
    }

    pub fn set_deliverable(&self, deliverable: bool) {
        self.lock().deliverable = deliverable;
    }

    pub fn has_inbound(&self) -> bool {
        !self.lock().inbound.is_empty()
    }

    pub fn is_suspended(&self) -> bool {
        self.lock().suspended
    }

    pub fn suspend(&self) {
        self.lock().suspended = true;
    }

    pub fn resume(&self) {
        self.lock().suspended = false;
    }

    pub fn is_accepted(&self) -> bool {
        self.lock().accepted
    }

    pub fn accept(&self) {
        self.lock().accepted = true;
    }

    /// Acceptance token the peer presented, if any.
    pub fn token(&self) -> Vec<u8> {
        self.lock().token.clone()
    }

    /// Source address of the token frame.
    pub fn token_addr(&self) -> NodeAddress {
        self.lock().token_addr
    }

    pub fn error_kind(&self) -> ErrorKind {
        self.lock().error_kind
    }

    pub fn error_message(&self) -> String {
        self.lock().error_message.clone()
    }

    pub fn statistics(&self) -> BufferStatistics {
        self.lock().stats.clone()
    }

    /// Bytes queued but not yet accepted by the socket.
    pub fn outgoing_size(&self) -> u64 {
        self.lock().unsent()
    }

    /// Bytes read but not yet delivered.
    pub fn incoming_size(&self) -> u64 {
        let st = self.lock();
        st.read_buf.len() as u64 + st.inbound_bytes
    }

    /// Complete messages waiting for delivery.
    pub fn inbound_count(&self) -> usize {
        self.lock().inbound.len()
    }

    /// Unsent plus unparsed bytes.
    pub fn size(&self) -> u64 {
        let st = self.lock();
        st.unsent() + st.read_buf.len() as u64
    }

    pub fn last_activity(&self) -> Instant {
        self.lock().last_activity
    }

    pub fn opened_at(&self) -> Instant {
        self.lock().started
    }

    pub fn peer_common_name(&self) -> Option<String> {
        self.lock().peer_common_name.clone()
    }

    pub fn peer_public_key(&self) -> Option<Vec<u8>> {
        self.lock().peer_public_key.clone()
    }

    pub fn can_send(&self) -> bool {
        let st = self.lock();
        st.open && st.sendable
    }

    pub fn queue_size(&self) -> u32 {
        self.lock().queue_size
    }

    pub fn threshold(&self) -> u32 {
        self.lock().threshold
    }

    pub fn set_queue_size(&self, size: u32, threshold: u32) {
        let mut st = self.lock();
        st.queue_size = size;
        st.threshold = threshold;
        let unsent = st.unsent();
        if unsent >= u64::from(size) {
            st.sendable = false;
        } else if unsent < u64::from(threshold.min(size)) {
            st.sendable = true;
        }
    }

    pub fn set_window(&self, window: Duration) {
        self.lock().stats.set_window(window);
    }

    /// Remember that `handler_id` wants a clear-to-send for `peer`.
    pub fn add_rts(&self, peer: NodeAddress, handler_id: HandlerId) {
        self.lock().rts.push_back((peer, handler_id));
    }

    pub fn has_rts(&self) -> bool {
        !self.lock().rts.is_empty()
    }

    pub fn pop_rts(&self) -> Option<(NodeAddress, HandlerId)> {
        self.lock().rts.pop_front()
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.lock();
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("direction", &st.direction)
            .field("remote", &st.remote)
            .field("identity", &st.identity)
            .field("open", &st.open)
            .finish()
    }
}

impl ConnState {
    fn unsent(&self) -> u64 {
        self.bytes_queued - self.bytes_sent
    }

    /// Handshake still running on a TLS connection.
    fn handshaking(&self) -> Option<&rustls::Connection> {
        if self.connecting {
            self.tls.as_ref()
        } else {
            None
        }
    }

    fn readable(&self) -> bool {
        if !self.open || self.socket.is_none() {
            return false;
        }
        match self.handshaking() {
            Some(session) => session.wants_read(),
            None => self.direction.reads() && !self.suspended,
        }
    }

    fn writable(&self) -> bool {
        if !self.open || self.socket.is_none() {
            return false;
        }
        match self.handshaking() {
            Some(session) => session.wants_write(),
            None => {
                (self.direction.writes() && self.unsent() > 0)
                    || self.tls.as_ref().map_or(false, |t| t.wants_write())
            }
        }
    }

    fn queue_frame(&mut self, header: WireHeader, prefix: &[u8], payload: &[u8]) {
        let mut bytes = Vec::with_capacity(HEADER_SIZE + prefix.len() + payload.len());
        header.encode_into(&mut bytes);
        bytes.extend_from_slice(prefix);
        bytes.extend_from_slice(payload);
        self.bytes_queued += bytes.len() as u64;
        self.outbound.push_back(Frame {
            header,
            bytes,
            prefix_len: prefix.len(),
            end: self.bytes_queued,
        });
        if self.unsent() >= u64::from(self.queue_size) {
            self.sendable = false;
        }
    }

    /// Write a small frame straight to an idle plain socket.
    fn try_fast_path(&mut self, conn: u64) {
        if self.connecting
            || self.tls.is_some()
            || self.outbound.len() != 1
            || !self.in_flight.is_empty()
            || !self.write_buf.is_empty()
        {
            return;
        }
        let Some(socket) = self.socket.clone() else {
            return;
        };
        if self.outbound[0].bytes.len() >= BLOCK_SIZE {
            return;
        }
        let Some(frame) = self.outbound.pop_front() else {
            return;
        };
        let written = match socket.try_write(&frame.bytes) {
            Ok(n) => n,
            Err(e) if would_block(&e) => 0,
            Err(e) => {
                self.in_flight.push_back(frame);
                self.close_locked(conn, ErrorKind::WriteError, &e.to_string(), false);
                return;
            }
        };
        if written < frame.bytes.len() {
            self.write_buf.extend_from_slice(&frame.bytes[written..]);
        }
        self.in_flight.push_back(frame);
        self.record_sent(written);
    }

    fn record_sent(&mut self, n: usize) {
        if n == 0 {
            return;
        }
        self.bytes_sent += n as u64;
        self.byte_count += n as u64;
        self.stats.append(n as u64);
        self.last_activity = Instant::now();
        global_metrics().bytes_written(n as u64);
        while self
            .in_flight
            .front()
            .map_or(false, |f| f.end <= self.bytes_sent)
        {
            self.in_flight.pop_front();
        }
        if !self.sendable && self.open && self.unsent() < u64::from(self.threshold.min(self.queue_size)) {
            self.sendable = true;
            trace!(unsent = self.unsent(), "connection sendable again");
        }
    }

    /// Copy queued frames into the write buffer, up to [`BLOCK_SIZE`].
    fn fill_write_buf(&mut self) {
        while self.write_buf.len() < BLOCK_SIZE {
            let Some(frame) = self.outbound.front() else {
                break;
            };
            let remaining = &frame.bytes[self.chunk_offset..];
            let n = remaining.len().min(BLOCK_SIZE - self.write_buf.len());
            self.write_buf.extend_from_slice(&remaining[..n]);
            if n == remaining.len() {
                self.chunk_offset = 0;
                if let Some(done) = self.outbound.pop_front() {
                    self.in_flight.push_back(done);
                }
            } else {
                self.chunk_offset += n;
                break;
            }
        }
    }

    fn write(&mut self, conn: u64) {
        if !self.open {
            return;
        }
        let Some(socket) = self.socket.clone() else {
            return;
        };
        if !self.drive_handshake(conn, &*socket) {
            return;
        }

        for _ in 0..IO_PER_PASS {
            if self.write_buf.is_empty() {
                self.fill_write_buf();
            }
            if self.write_buf.is_empty() {
                break;
            }
            let result = match self.tls.as_mut() {
                Some(session) => tls_send(session, &*socket, &self.write_buf),
                None => socket.try_write(&self.write_buf),
            };
            match result {
                Ok(0) => break,
                Ok(n) => {
                    self.write_buf.drain(..n);
                    self.record_sent(n);
                }
                Err(e) if would_block(&e) => break,
                Err(e) => {
                    self.close_locked(conn, ErrorKind::WriteError, &e.to_string(), false);
                    return;
                }
            }
        }

        if let Some(session) = self.tls.as_mut() {
            match flush_tls(session, &*socket) {
                Ok(()) => {}
                Err(e) if would_block(&e) => {}
                Err(e) => {
                    self.close_locked(conn, ErrorKind::WriteError, &e.to_string(), false);
                    return;
                }
            }
        }
    }

    fn read(&mut self, conn: u64) {
        if !self.open {
            return;
        }
        let Some(socket) = self.socket.clone() else {
            return;
        };
        if !self.drive_handshake(conn, &*socket) {
            return;
        }
        if !self.direction.reads() || self.suspended {
            return;
        }

        for _ in 0..IO_PER_PASS {
            let result = match self.tls.as_mut() {
                Some(session) => tls_receive(session, &*socket, &mut self.read_buf),
                None => self.read_buf.fill_with(|region| {
                    let n = region.len().min(BLOCK_SIZE);
                    socket.try_read(&mut region[..n])
                }),
            };
            match result {
                Ok(0) => {
                    self.close_locked(conn, ErrorKind::ReadError, ERR_SOCKET_CLOSED, false);
                    return;
                }
                Ok(n) => {
                    self.byte_count += n as u64;
                    self.stats.append(n as u64);
                    self.last_activity = Instant::now();
                    global_metrics().bytes_read(n as u64);
                    if !self.parse_frames(conn) {
                        return;
                    }
                }
                Err(e) if would_block(&e) => break,
                Err(e) if e.kind() == io::ErrorKind::InvalidData && self.tls.is_some() => {
                    self.close_locked(conn, ErrorKind::TlsError, &e.to_string(), false);
                    return;
                }
                Err(e) => {
                    self.close_locked(conn, ErrorKind::ReadError, &e.to_string(), false);
                    return;
                }
            }
        }
    }

    /// Split buffered bytes into messages. False if the stream was malformed.
    fn parse_frames(&mut self, conn: u64) -> bool {
        loop {
            let header = match self.pending_header {
                Some(header) => header,
                None => {
                    if self.read_buf.len() < HEADER_SIZE {
                        return true;
                    }
                    let mut raw = [0u8; HEADER_SIZE];
                    self.read_buf.peek(&mut raw);
                    let header = match WireHeader::decode(&raw) {
                        Ok(h) => h,
                        Err(_) => {
                            self.close_locked(conn, ErrorKind::ReadError, ERR_INVALID_HEADER, false);
                            return false;
                        }
                    };
                    let size = header.size as usize;
                    if size > self.max_message_size {
                        let message = format!("{ERR_OVERSIZED_MESSAGE}: {size} bytes");
                        self.close_locked(conn, ErrorKind::ReadError, &message, false);
                        return false;
                    }
                    self.read_buf.consume(HEADER_SIZE);
                    if size > self.read_buf.capacity() {
                        self.read_buf.grow(size);
                    }
                    self.pending_header = Some(header);
                    header
                }
            };

            let Some(payload) = self.read_buf.take(header.size as usize) else {
                return true;
            };
            self.pending_header = None;

            if self.identity.is_none() && !self.learn_identity(conn, &header, &payload) {
                continue;
            }
            self.inbound_bytes += payload.len() as u64;
            self.inbound.push_back((header, payload));
        }
    }

    /// Learn who the peer is from a frame. Returns whether to deliver it.
    fn learn_identity(&mut self, conn: u64, header: &WireHeader, payload: &[u8]) -> bool {
        if header.has_flag(flags::ACCEPTANCE_TOKEN) {
            self.token = payload.to_vec();
            self.token_addr = header.src;
            return false;
        }
        let (identity, deliver) = if header.has_flag(flags::NAT_CONNECTION) {
            if header.src.is_unroutable() {
                self.direction = Direction::Outgoing;
            }
            (header.src.local, false)
        } else if header.has_flag(flags::SOURCE_ID) {
            (header.src.local, false)
        } else if !header.src.proxy.is_null() {
            (header.src.proxy, true)
        } else {
            (header.src.local, true)
        };
        self.identity = Some(identity);
        self.newly_identified = true;
        debug!(conn, identity = %identity, direction = ?self.direction, "peer identified");
        deliver
    }

    /// Advance a pending TLS handshake. True once the connection is usable.
    fn drive_handshake(&mut self, conn: u64, socket: &dyn Socket) -> bool {
        if !self.connecting {
            return true;
        }
        let step = match self.tls.as_mut() {
            Some(session) => handshake_step(session, socket),
            None => return false,
        };
        match step {
            Ok(false) => return false,
            Ok(true) => {}
            Err(message) => {
                self.close_locked(conn, ErrorKind::TlsError, &message, false);
                return false;
            }
        }

        let host = self.remote.addr.to_string();
        let verified = match (&self.crypto, &self.tls) {
            (Some(ctx), Some(session)) => ctx.verify_peer(session, &host),
            _ => Err("TLS context missing".to_string()),
        };
        match verified {
            Ok(peer) => {
                debug!(conn, peer = %host, common_name = %peer.common_name, "TLS handshake complete");
                self.peer_common_name = Some(peer.common_name);
                self.peer_public_key = Some(peer.public_key);
                self.connecting = false;
                self.connect_time = self.started.elapsed();
                true
            }
            Err(message) => {
                self.close_locked(conn, ErrorKind::TlsError, &message, false);
                false
            }
        }
    }

    fn take_unsent(&mut self) -> Vec<UnsentMessage> {
        self.chunk_offset = 0;
        self.write_buf.clear();
        self.in_flight
            .drain(..)
            .chain(self.outbound.drain(..))
            .filter(|frame| !frame.header.is_bootstrap())
            .map(|frame| {
                let body = frame.bytes.get(HEADER_SIZE..).unwrap_or_default();
                let (prefix, payload) = body.split_at(frame.prefix_len.min(body.len()));
                UnsentMessage {
                    header: frame.header,
                    prefix: prefix.to_vec(),
                    payload: payload.to_vec(),
                }
            })
            .collect()
    }

    fn close_locked(&mut self, conn: u64, kind: ErrorKind, message: &str, reset: bool) -> bool {
        if !self.open {
            return false;
        }
        self.open = false;
        self.sendable = false;
        self.error_kind = kind;
        self.error_message = message.to_string();

        if let Some(socket) = self.socket.take() {
            if let Some(session) = self.tls.as_mut() {
                if kind == ErrorKind::NonError {
                    session.send_close_notify();
                    let _ = flush_tls(session, &*socket);
                }
            }
            if reset {
                if let Err(e) = socket.set_linger_zero() {
                    debug!(conn, error = %e, "failed to set SO_LINGER");
                }
            }
        }
        self.tls = None;
        self.connecting = false;

        global_metrics().connection_closed();
        if kind.is_reported() {
            global_metrics().connection_error();
        }
        self.log_close(conn, kind, message);
        true
    }

    fn log_close(&self, conn: u64, kind: ErrorKind, message: &str) {
        let total = self.started.elapsed();
        let idle = self.last_activity.elapsed();
        let active = total.saturating_sub(idle).saturating_sub(self.connect_time);
        let secs = active.as_secs_f64();
        let rate = if secs > 0.0 {
            self.byte_count as f64 / secs
        } else {
            0.0
        };
        let (rate, unit) = if rate >= 1024.0 * 1024.0 {
            (rate / (1024.0 * 1024.0), "MB")
        } else if rate >= 1024.0 {
            (rate / 1024.0, "KB")
        } else {
            (rate, "B")
        };
        info!(
            conn,
            remote = %self.remote,
            direction = ?self.direction,
            kind = %kind,
            error = message,
            open_ms = active.as_millis() as u64,
            connect_ms = self.connect_time.as_millis() as u64,
            idle_ms = idle.as_millis() as u64,
            bytes = self.byte_count,
            throughput = %format!("{rate:.1} {unit}/s"),
            "connection closed"
        );
    }
}

/// One round of handshake I/O. `Ok(true)` once the handshake is done.
fn handshake_step(
    session: &mut rustls::Connection,
    socket: &dyn Socket,
) -> std::result::Result<bool, String> {
    while session.is_handshaking() {
        let mut progressed = false;
        if session.wants_write() {
            match session.write_tls(&mut SocketIo(socket)) {
                Ok(n) => progressed |= n > 0,
                Err(e) if would_block(&e) => {}
                Err(e) => return Err(e.to_string()),
            }
        }
        if session.wants_read() {
            match session.read_tls(&mut SocketIo(socket)) {
                Ok(0) => return Err(ERR_SOCKET_CLOSED.to_string()),
                Ok(_) => {
                    progressed = true;
                    if let Err(e) = session.process_new_packets() {
                        let _ = session.write_tls(&mut SocketIo(socket));
                        return Err(e.to_string());
                    }
                }
                Err(e) if would_block(&e) => {}
                Err(e) => return Err(e.to_string()),
            }
        }
        if !progressed {
            return Ok(false);
        }
    }
    match flush_tls(session, socket) {
        Ok(()) => Ok(true),
        Err(e) if would_block(&e) => Ok(true),
        Err(e) => Err(e.to_string()),
    }
}

/// Push buffered ciphertext to the socket.
fn flush_tls(session: &mut rustls::Connection, socket: &dyn Socket) -> io::Result<()> {
    while session.wants_write() {
        if session.write_tls(&mut SocketIo(socket))? == 0 {
            return Err(io::ErrorKind::WouldBlock.into());
        }
    }
    Ok(())
}

/// Hand plaintext to the session and flush what it can. Returns the
/// plaintext bytes the session took.
fn tls_send(session: &mut rustls::Connection, socket: &dyn Socket, data: &[u8]) -> io::Result<usize> {
    flush_tls(session, socket)?;
    let n = session.writer().write(data)?;
    match flush_tls(session, socket) {
        Ok(()) => Ok(n),
        Err(e) if would_block(&e) => Ok(n),
        Err(e) => Err(e),
    }
}

/// Decrypt available bytes into `ring`. `Ok(0)` means the peer closed.
fn tls_receive(
    session: &mut rustls::Connection,
    socket: &dyn Socket,
    ring: &mut RingBuffer,
) -> io::Result<usize> {
    let mut plain = [0u8; 4096];
    loop {
        match session.reader().read(&mut plain) {
            Ok(0) => return Ok(0),
            Ok(n) => {
                ring.extend_from_slice(&plain[..n]);
                return Ok(n);
            }
            Err(e) if would_block(&e) => {}
            Err(e) => return Err(e),
        }
        if session.read_tls(&mut SocketIo(socket))? == 0 {
            return Ok(0);
        }
        session
            .process_new_packets()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SchedulerConfig;
    use std::net::{Ipv4Addr, SocketAddr};

    /// Socket that accepts at most `limit` bytes per write.
    struct LimitedSocket {
        written: Mutex<Vec<u8>>,
        limit: usize,
    }

    impl Socket for LimitedSocket {
        fn try_read(&self, _buf: &mut [u8]) -> io::Result<usize> {
            Err(io::ErrorKind::WouldBlock.into())
        }

        fn try_write(&self, buf: &[u8]) -> io::Result<usize> {
            let n = buf.len().min(self.limit);
            if n == 0 {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            self.written.lock().unwrap_or_else(PoisonError::into_inner).extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn peer_addr(&self) -> io::Result<SocketAddr> {
            Ok(SocketAddr::from(([10, 0, 0, 2], 5377)))
        }

        fn set_nodelay(&self, _nodelay: bool) -> io::Result<()> {
            Ok(())
        }

        fn set_linger_zero(&self) -> io::Result<()> {
            Ok(())
        }

        fn readiness(self: Arc<Self>, _read: bool, _write: bool) -> Readiness {
            Box::pin(futures::future::pending())
        }
    }

    fn params(scheduler: &Scheduler) -> ConnectionParams {
        ConnectionParams {
            tls: None,
            queue_size: u32::MAX,
            threshold: u32::MAX / 2,
            window: Duration::from_secs(5),
            read_buffer_size: 1024,
            max_message_size: 1 << 20,
            nodelay: false,
            scheduler: scheduler.clone(),
            local: NodeAddress::direct(SockAddr::new(Ipv4Addr::LOCALHOST, 5377)),
        }
    }

    fn remote() -> SockAddr {
        SockAddr::new(Ipv4Addr::new(10, 0, 0, 2), 5377)
    }

    #[test]
    fn bootstrap_markers_precede_data() {
        let scheduler = Scheduler::new(SchedulerConfig::default()).expect("scheduler");
        let conn = Connection::outgoing(remote(), &params(&scheduler), b"secret", Some(remote()));
        assert!(conn.is_connecting());
        // token frame + source id frame
        assert_eq!(conn.outgoing_size(), (2 * HEADER_SIZE + 6) as u64);
        assert!(conn.take_message_errors().is_empty());
    }

    #[test]
    fn large_frames_are_chunked() {
        let scheduler = Scheduler::new(SchedulerConfig::default()).expect("scheduler");
        let conn = Connection::outgoing(remote(), &params(&scheduler), b"", None);
        let socket = Arc::new(LimitedSocket {
            written: Mutex::new(Vec::new()),
            limit: usize::MAX,
        });
        conn.attach(socket.clone());

        let payload = vec![7u8; 3 * BLOCK_SIZE];
        let header = WireHeader::new(NodeAddress::NULL, NodeAddress::direct(remote()), 1, 0, payload.len() as u32);
        assert!(conn.enqueue(header, &[], &payload));
        conn.write();
        assert_eq!(conn.outgoing_size(), 0);
        let written = socket.written.lock().unwrap_or_else(PoisonError::into_inner);
        assert_eq!(written.len(), HEADER_SIZE + payload.len());
    }

    #[test]
    fn close_is_idempotent() {
        let scheduler = Scheduler::new(SchedulerConfig::default()).expect("scheduler");
        let conn = Connection::nat(remote(), &params(&scheduler));
        assert!(conn.close(ErrorKind::WriteError, "boom", false));
        assert!(!conn.close(ErrorKind::ReadError, "again", true));
        assert_eq!(conn.error_kind(), ErrorKind::WriteError);
        assert_eq!(conn.error_message(), "boom");
        assert!(!conn.enqueue(WireHeader::default(), &[], b"x"));
    }
}
