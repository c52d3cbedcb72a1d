//! Connection framing and flow control over an in-memory socket pair

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::collections::VecDeque;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use network_transport::config::SchedulerConfig;
use network_transport::core::address::{NodeAddress, SockAddr};
use network_transport::core::header::{HandlerId, WireHeader, HEADER_SIZE};
use network_transport::error::constants::{ERR_OVERSIZED_MESSAGE, ERR_SOCKET_CLOSED};
use network_transport::error::ErrorKind;
use network_transport::protocol::handler::{HandlerRegistry, NetworkErrorHandler};
use network_transport::scheduler::Scheduler;
use network_transport::transport::connection::BLOCK_SIZE;
use network_transport::transport::socket::Socket;
use network_transport::transport::{Connection, ConnectionParams, Direction, Readiness};

#[derive(Default)]
struct Pipe {
    bytes: Mutex<VecDeque<u8>>,
    closed: AtomicBool,
}

/// One end of an in-memory stream.
struct MemSocket {
    rx: Arc<Pipe>,
    tx: Arc<Pipe>,
    /// Bytes the socket still accepts before it reports `WouldBlock`.
    write_budget: AtomicUsize,
    peer: SocketAddr,
}

impl MemSocket {
    fn pair(a: SocketAddr, b: SocketAddr) -> (Arc<MemSocket>, Arc<MemSocket>) {
        let ab = Arc::new(Pipe::default());
        let ba = Arc::new(Pipe::default());
        let left = MemSocket {
            rx: Arc::clone(&ba),
            tx: Arc::clone(&ab),
            write_budget: AtomicUsize::new(usize::MAX),
            peer: b,
        };
        let right = MemSocket {
            rx: ab,
            tx: ba,
            write_budget: AtomicUsize::new(usize::MAX),
            peer: a,
        };
        (Arc::new(left), Arc::new(right))
    }

    fn set_write_budget(&self, budget: usize) {
        self.write_budget.store(budget, Ordering::SeqCst);
    }

    fn shutdown(&self) {
        self.tx.closed.store(true, Ordering::SeqCst);
    }
}

impl Socket for MemSocket {
    fn try_read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut bytes = self.rx.bytes.lock().unwrap();
        if bytes.is_empty() {
            if self.rx.closed.load(Ordering::SeqCst) {
                return Ok(0);
            }
            return Err(io::ErrorKind::WouldBlock.into());
        }
        let n = buf.len().min(bytes.len());
        for (slot, byte) in buf.iter_mut().zip(bytes.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    fn try_write(&self, buf: &[u8]) -> io::Result<usize> {
        let n = buf.len().min(self.write_budget.load(Ordering::SeqCst));
        if n == 0 {
            return Err(io::ErrorKind::WouldBlock.into());
        }
        self.write_budget.fetch_sub(n, Ordering::SeqCst);
        self.tx.bytes.lock().unwrap().extend(&buf[..n]);
        Ok(n)
    }

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.peer)
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

fn node(last: u8) -> NodeAddress {
    NodeAddress::direct(SockAddr::new(Ipv4Addr::new(10, 0, 0, last), 5377))
}

fn params(scheduler: &Scheduler, queue_size: u32, threshold: u32) -> ConnectionParams {
    ConnectionParams {
        tls: None,
        queue_size,
        threshold,
        window: Duration::from_secs(5),
        read_buffer_size: 1024,
        max_message_size: 1 << 20,
        nodelay: false,
        scheduler: scheduler.clone(),
        local: node(1),
    }
}

/// Outgoing connection from node 1 to node 2 and the matching accepted end.
fn connected(
    scheduler: &Scheduler,
    queue_size: u32,
    threshold: u32,
    token: &[u8],
) -> (Arc<Connection>, Arc<MemSocket>, Arc<Connection>, Arc<MemSocket>) {
    let p = params(scheduler, queue_size, threshold);
    let (client_end, server_end) = MemSocket::pair(
        node(1).local.to_socket_addr(0),
        node(2).local.to_socket_addr(0),
    );
    let out = Connection::outgoing(node(2).local, &p, token, None);
    out.attach(client_end.clone());
    let incoming = Connection::incoming(server_end.clone(), &p).expect("incoming");
    (out, client_end, incoming, server_end)
}

fn header(len: usize) -> WireHeader {
    WireHeader::new(node(1), node(2), 7, 0, len as u32)
}

fn scheduler() -> Scheduler {
    Scheduler::new(SchedulerConfig::default()).expect("scheduler")
}

#[test]
fn messages_arrive_in_order_and_identify_the_peer() {
    let scheduler = scheduler();
    let (out, _, incoming, _) = connected(&scheduler, u32::MAX, u32::MAX / 2, b"");
    assert_eq!(out.direction(), Direction::Outgoing);
    assert_eq!(incoming.direction(), Direction::Incoming);
    assert!(incoming.is_connecting());

    for i in 0..5u8 {
        let payload = vec![i; 10];
        assert!(out.enqueue(header(payload.len()), &[], &payload));
    }
    out.write();
    assert_eq!(out.outgoing_size(), 0);

    incoming.read();
    assert!(incoming.take_newly_identified());
    assert!(!incoming.take_newly_identified());
    assert_eq!(incoming.identity(), Some(node(1).local));
    assert!(!incoming.is_connecting());
    assert_eq!(incoming.inbound_count(), 5);
    assert_eq!(incoming.incoming_size(), 50);

    for i in 0..5u8 {
        let (h, payload) = incoming.dequeue().expect("message");
        assert_eq!(h.handler_id, 7);
        assert_eq!(h.src, node(1));
        assert_eq!(payload, vec![i; 10]);
    }
    assert!(incoming.dequeue().is_none());
    assert_eq!(incoming.incoming_size(), 0);
}

#[test]
fn queue_limit_blocks_until_drained_below_threshold() {
    let scheduler = scheduler();
    let (out, client, _, _) = connected(&scheduler, 100, 50, b"");
    client.set_write_budget(0);

    let payload = [1u8; 40];
    let frame = (HEADER_SIZE + payload.len()) as u64;
    assert!(out.can_send());
    assert!(out.enqueue(header(payload.len()), &[], &payload));
    assert!(out.can_send());
    assert!(out.enqueue(header(payload.len()), &[], &payload));
    assert_eq!(out.outgoing_size(), 2 * frame);
    assert!(!out.can_send());

    // still above the threshold after a partial write
    client.set_write_budget(frame as usize);
    out.write();
    assert!(out.outgoing_size() >= 50);
    assert!(!out.can_send());

    client.set_write_budget(usize::MAX);
    out.write();
    assert_eq!(out.outgoing_size(), 0);
    assert!(out.can_send());
}

#[test]
fn raising_the_queue_size_reopens_a_full_connection() {
    let scheduler = scheduler();
    let (out, client, _, _) = connected(&scheduler, 64, 32, b"");
    client.set_write_budget(0);
    assert!(out.enqueue(header(40), &[], &[0u8; 40]));
    assert!(!out.can_send());

    out.set_queue_size(1000, 500);
    assert_eq!(out.queue_size(), 1000);
    assert_eq!(out.threshold(), 500);
    assert!(out.can_send());
}

#[test]
fn large_payload_is_reassembled() {
    let scheduler = scheduler();
    let (out, _, incoming, _) = connected(&scheduler, u32::MAX, u32::MAX / 2, b"");

    let payload: Vec<u8> = (0..(20 * BLOCK_SIZE + 17)).map(|i| (i % 251) as u8).collect();
    assert!(out.enqueue(header(payload.len()), b"pfx", &payload));

    for _ in 0..16 {
        out.write();
        incoming.read();
        if incoming.has_inbound() {
            break;
        }
    }
    let (h, body) = incoming.dequeue().expect("reassembled message");
    assert_eq!(h.size as usize, payload.len() + 3);
    assert_eq!(&body[..3], b"pfx");
    assert_eq!(&body[3..], &payload[..]);
}

#[test]
fn acceptance_token_is_learned_not_delivered() {
    let scheduler = scheduler();
    let (out, _, incoming, _) = connected(&scheduler, u32::MAX, u32::MAX / 2, b"secret");
    assert!(!incoming.is_accepted());

    assert!(out.enqueue(header(2), &[], b"hi"));
    out.write();
    incoming.read();

    assert_eq!(incoming.token(), b"secret");
    assert_eq!(incoming.token_addr(), node(1));
    assert_eq!(incoming.inbound_count(), 1);
    let (_, body) = incoming.dequeue().expect("data");
    assert_eq!(body, b"hi");

    incoming.accept();
    assert!(incoming.is_accepted());
}

#[test]
fn oversized_frame_closes_the_reader() {
    let scheduler = scheduler();
    let (out, _, incoming, _) = connected(&scheduler, u32::MAX, u32::MAX / 2, b"");

    let payload = vec![0u8; (1 << 20) + 1];
    assert!(out.enqueue(header(payload.len()), &[], &payload));
    out.write();
    incoming.read();

    assert!(!incoming.is_open());
    assert_eq!(incoming.error_kind(), ErrorKind::ReadError);
    assert!(incoming.error_message().starts_with(ERR_OVERSIZED_MESSAGE));
    assert_eq!(incoming.inbound_count(), 0);
}

#[test]
fn peer_close_is_a_read_error() {
    let scheduler = scheduler();
    let (_, client, incoming, _) = connected(&scheduler, u32::MAX, u32::MAX / 2, b"");
    client.shutdown();
    incoming.read();
    assert!(!incoming.is_open());
    assert_eq!(incoming.error_kind(), ErrorKind::ReadError);
    assert_eq!(incoming.error_message(), ERR_SOCKET_CLOSED);
}

#[derive(Default)]
struct Recorder {
    messages: Mutex<Vec<(NodeAddress, ErrorKind, Vec<u8>)>>,
}

impl NetworkErrorHandler for Recorder {
    fn error(&self, _peer: &NodeAddress, _kind: ErrorKind, _message: &str, _handler_id: HandlerId) {}

    fn message_error(&self, dest: &NodeAddress, kind: ErrorKind, payload: &[u8], _handler_id: HandlerId) {
        self.messages
            .lock()
            .unwrap()
            .push((*dest, kind, payload.to_vec()));
    }
}

#[test]
fn unsent_messages_are_reported_in_order() {
    let scheduler = scheduler();
    let (out, client, _, _) = connected(&scheduler, u32::MAX, u32::MAX / 2, b"token");
    client.set_write_budget(0);

    for i in 0..3u8 {
        assert!(out.enqueue(header(1), &[], &[i]));
    }
    assert!(out.close(ErrorKind::WriteError, "broken pipe", false));
    assert!(!out.close(ErrorKind::WriteError, "broken pipe", false));
    assert!(!out.enqueue(header(1), &[], &[9]));

    let recorder = Arc::new(Recorder::default());
    let registry: HandlerRegistry<dyn NetworkErrorHandler> = HandlerRegistry::new();
    registry.register(recorder.clone(), Some(1));
    out.notify_message_errors(None, &registry.leases());

    let seen = recorder.messages.lock().unwrap().clone();
    // the token frame is not a message
    assert_eq!(
        seen,
        vec![
            (node(2), ErrorKind::WriteError, vec![0]),
            (node(2), ErrorKind::WriteError, vec![1]),
            (node(2), ErrorKind::WriteError, vec![2]),
        ]
    );
    assert!(out.take_message_errors().is_empty());
}

#[test]
fn request_to_send_entries_pop_once_in_order() {
    let scheduler = scheduler();
    let (out, _, _, _) = connected(&scheduler, u32::MAX, u32::MAX / 2, b"");
    out.add_rts(node(2), 3);
    out.add_rts(node(3), 4);
    assert!(out.has_rts());
    assert_eq!(out.pop_rts(), Some((node(2), 3)));
    assert_eq!(out.pop_rts(), Some((node(3), 4)));
    assert_eq!(out.pop_rts(), None);
    assert!(!out.has_rts());
}

#[test]
fn suspended_connection_stops_reading() {
    let scheduler = scheduler();
    let (out, _, incoming, _) = connected(&scheduler, u32::MAX, u32::MAX / 2, b"");
    incoming.suspend();
    assert!(!incoming.is_readable());

    assert!(out.enqueue(header(1), &[], b"x"));
    out.write();
    incoming.read();
    assert_eq!(incoming.inbound_count(), 0);

    incoming.resume();
    assert!(incoming.is_readable());
    incoming.read();
    assert_eq!(incoming.inbound_count(), 1);
}
