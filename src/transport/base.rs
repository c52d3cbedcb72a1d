//! # Shared Transport Core
//!
//! State and behaviour common to the TCP and UDP transports: the local
//! address, next-hop resolution, source translations, the handler
//! registries, the optional message pipeline and the final delivery step.
//!
//! ## Translations
//! When a message arrives addressed to something other than our own
//! [`NodeAddress`] (the peer knows us by a NAT or proxy address), the
//! destination it used is remembered per next hop. Replies to that hop carry
//! the remembered address as their source so the peer recognises us.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError, RwLock};

use tracing::{debug, error, trace, warn};

use crate::core::address::{NodeAddress, SockAddr};
use crate::core::header::{flags, HandlerId, WireHeader};
use crate::error::{Result, TransportError};
use crate::protocol::handler::{
    ConnectionAcceptanceHandler, ConnectionStatusHandler, HandlerRegistry, NetworkErrorHandler,
    ReceiveDataHandler,
};
use crate::protocol::pipeline::PipelineStage;
use crate::utils::metrics::global_metrics;

static MESSAGE_TICKET: AtomicU64 = AtomicU64::new(1);

/// Draw the next process-wide message sequence ticket.
pub fn new_message_ticket() -> u64 {
    MESSAGE_TICKET.fetch_add(1, Ordering::AcqRel)
}

pub struct TransportCore {
    local: RwLock<NodeAddress>,
    forward: Option<SockAddr>,
    disable_translation: bool,
    proxying: AtomicBool,
    translations: Mutex<HashMap<SockAddr, NodeAddress>>,
    suspended: Mutex<BTreeSet<NodeAddress>>,
    pipeline: Option<Box<dyn PipelineStage>>,
    acceptor: Mutex<Option<HandlerId>>,
    token: Mutex<Vec<u8>>,
    pub data_handlers: HandlerRegistry<dyn ReceiveDataHandler>,
    pub error_handlers: HandlerRegistry<dyn NetworkErrorHandler>,
    pub status_handlers: HandlerRegistry<dyn ConnectionStatusHandler>,
    pub acceptance_handlers: HandlerRegistry<dyn ConnectionAcceptanceHandler>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl TransportCore {
    pub fn new(
        local: NodeAddress,
        forward: Option<SockAddr>,
        disable_translation: bool,
        pipeline: Option<Box<dyn PipelineStage>>,
    ) -> Self {
        Self {
            local: RwLock::new(local),
            forward,
            disable_translation,
            proxying: AtomicBool::new(false),
            translations: Mutex::new(HashMap::new()),
            suspended: Mutex::new(BTreeSet::new()),
            pipeline,
            acceptor: Mutex::new(None),
            token: Mutex::new(Vec::new()),
            data_handlers: HandlerRegistry::new(),
            error_handlers: HandlerRegistry::new(),
            status_handlers: HandlerRegistry::new(),
            acceptance_handlers: HandlerRegistry::new(),
        }
    }

    pub fn local(&self) -> NodeAddress {
        *self.local.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replace the local address once an ephemeral port is known.
    pub fn set_local(&self, local: NodeAddress) {
        *self.local.write().unwrap_or_else(PoisonError::into_inner) = local;
    }

    pub fn forward(&self) -> Option<SockAddr> {
        self.forward
    }

    pub fn translations_disabled(&self) -> bool {
        self.disable_translation
    }

    /// Whether any destination has been reached through its proxy.
    pub fn is_proxying(&self) -> bool {
        self.proxying.load(Ordering::Acquire)
    }

    /// The socket address a message for `dest` is sent to.
    pub fn next_hop(&self, dest: &NodeAddress) -> SockAddr {
        if let Some(forward) = self.forward {
            return forward;
        }
        if !dest.proxy.is_null() && dest.proxy != self.local().local {
            if !self.disable_translation {
                self.proxying.store(true, Ordering::Release);
            }
            return dest.proxy;
        }
        dest.local
    }

    /// Source address announced on new outgoing connections, if any.
    pub fn source_id(&self) -> Option<SockAddr> {
        if self.forward.is_some() || self.disable_translation {
            Some(self.local().local)
        } else {
            None
        }
    }

    /// Source address for a message to `hop`: the address that peer knows
    /// us by, or `src`.
    pub fn translated_source(&self, hop: SockAddr, src: NodeAddress) -> NodeAddress {
        if self.disable_translation {
            return src;
        }
        lock(&self.translations).get(&hop).copied().unwrap_or(src)
    }

    pub fn remove_translation(&self, hop: SockAddr) {
        lock(&self.translations).remove(&hop);
    }

    pub fn suspend(&self, peer: NodeAddress) {
        lock(&self.suspended).insert(peer);
    }

    pub fn resume(&self, peer: &NodeAddress) {
        lock(&self.suspended).remove(peer);
    }

    pub fn is_suspended(&self, peer: &NodeAddress) -> bool {
        lock(&self.suspended).contains(peer)
    }

    pub fn pipeline(&self) -> Option<&dyn PipelineStage> {
        self.pipeline.as_deref()
    }

    /// Run the outbound pipeline. `None` when a stage dropped the message.
    pub fn prepare(&self, dest: &NodeAddress, payload: &[u8], handler_id: HandlerId) -> Option<(Vec<u8>, Vec<u8>)> {
        let mut prefix = Vec::new();
        let mut body = payload.to_vec();
        if let Some(pipeline) = &self.pipeline {
            pipeline.route(dest, &mut prefix, &mut body, handler_id);
            if body.is_empty() {
                debug!(dest = %dest, handler_id, "pipeline dropped message");
                return None;
            }
        }
        Some((prefix, body))
    }

    /// Header for a message from `src` to `dest`, carrying `len` bytes.
    pub fn header(
        &self,
        src: NodeAddress,
        dest: &NodeAddress,
        handler_id: HandlerId,
        len: usize,
        strip_proxy: bool,
        internal: bool,
    ) -> WireHeader {
        let dest = if strip_proxy {
            dest.without_proxy()
        } else {
            *dest
        };
        let flags = if internal { flags::INTERNAL_MESSAGE } else { 0 };
        WireHeader::new(src, dest, handler_id, flags, len as u32)
    }

    pub fn set_authoritative_acceptor(&self, id: HandlerId) -> Result<()> {
        if !self.acceptance_handlers.contains(id) {
            return Err(TransportError::Custom(format!(
                "no acceptance handler registered with id {id}"
            )));
        }
        let mut acceptor = lock(&self.acceptor);
        if acceptor.is_some() {
            return Err(TransportError::Custom(
                "authoritative acceptor already set".into(),
            ));
        }
        *acceptor = Some(id);
        Ok(())
    }

    pub fn set_connection_token(&self, token: &[u8]) {
        *lock(&self.token) = token.to_vec();
    }

    pub fn connection_token(&self) -> Vec<u8> {
        lock(&self.token).clone()
    }

    /// Ask the authoritative acceptor about a peer. Accepts everything when
    /// none is set.
    pub fn accept_connection(&self, peer: &NodeAddress, token: &[u8]) -> bool {
        let Some(id) = *lock(&self.acceptor) else {
            return true;
        };
        match self.acceptance_handlers.lease(id) {
            Some(handler) => handler.accept_connection(peer, token, id),
            None => {
                warn!(handler_id = id, "authoritative acceptor unregistered; rejecting");
                false
            }
        }
    }

    /// Apply queued unregistrations on every registry.
    pub fn apply_unregistrations(&self) {
        self.data_handlers.apply_unregistrations();
        self.error_handlers.apply_unregistrations();
        self.status_handlers.apply_unregistrations();
        self.acceptance_handlers.apply_unregistrations();
    }

    /// Hand one inbound message to its handler.
    ///
    /// Messages whose destination proxy is this node are passed to `forward`
    /// unchanged instead.
    pub fn deliver_data<F>(
        &self,
        header: &WireHeader,
        mut payload: Vec<u8>,
        handler: Option<&dyn ReceiveDataHandler>,
        forward: F,
    ) where
        F: FnOnce(&WireHeader, &[u8]) -> bool,
    {
        let src = header.src;
        if self.is_suspended(&src) {
            trace!(src = %src, "source suspended; message dropped");
            return;
        }

        let local = self.local();
        if header.dest.proxy == local.local {
            debug!(src = %src, dest = %header.dest, "forwarding proxied message");
            if !forward(header, &payload) {
                warn!(dest = %header.dest, "failed to forward proxied message");
            }
            return;
        }

        let Some(handler) = handler else {
            error!(handler_id = header.handler_id, "no handler registered");
            return;
        };

        if !self.disable_translation && header.dest != local {
            let hop = self.next_hop(&src);
            lock(&self.translations).insert(hop, header.dest);
        }

        // internal frames are routed without pipeline prefixes
        let internal = header.has_flag(flags::INTERNAL_MESSAGE);
        if let Some(pipeline) = self.pipeline.as_ref().filter(|_| !internal) {
            if let Err(e) = pipeline.deliver(&src, &mut payload, header.handler_id) {
                warn!(src = %src, error = %e, "pipeline rejected inbound message");
                return;
            }
        }

        trace!(src = %src, size = payload.len(), handler_id = header.handler_id, "delivering");
        handler.deliver(&src, &header.dest, &payload, header.handler_id);
        global_metrics().message_delivered();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::pipeline::build_pipeline;
    use std::net::Ipv4Addr;
    use std::sync::Arc;

    fn addr(last: u8, port: u16) -> SockAddr {
        SockAddr::new(Ipv4Addr::new(10, 0, 0, last), port)
    }

    fn core() -> TransportCore {
        TransportCore::new(NodeAddress::direct(addr(1, 5377)), None, false, None)
    }

    #[test]
    fn next_hop_prefers_forward_then_proxy() {
        let plain = core();
        let natted = NodeAddress::new(addr(2, 0), addr(3, 6000));
        assert_eq!(plain.next_hop(&natted), addr(3, 6000));
        assert!(plain.is_proxying());
        assert_eq!(plain.next_hop(&NodeAddress::direct(addr(4, 80))), addr(4, 80));

        // a proxy that is ourselves is ignored
        let via_us = NodeAddress::new(addr(5, 80), addr(1, 5377));
        assert_eq!(plain.next_hop(&via_us), addr(5, 80));

        let forwarded = TransportCore::new(NodeAddress::direct(addr(1, 5377)), Some(addr(9, 1)), false, None);
        assert_eq!(forwarded.next_hop(&natted), addr(9, 1));
        assert_eq!(forwarded.source_id(), Some(addr(1, 5377)));
        assert_eq!(core().source_id(), None);
    }

    #[test]
    fn delivery_learns_translation() {
        let core = core();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let handler = move |src: &NodeAddress, _: &NodeAddress, p: &[u8], _: HandlerId| {
            lock(&sink).push((*src, p.to_vec()));
        };

        let peer = NodeAddress::direct(addr(7, 5377));
        let known_as = NodeAddress::new(addr(1, 5377), addr(200, 7000));
        let header = WireHeader::new(peer, known_as, 3, 0, 2);
        core.deliver_data(&header, b"hi".to_vec(), Some(&handler), |_, _| false);

        assert_eq!(lock(&seen).len(), 1);
        assert_eq!(core.translated_source(addr(7, 5377), core.local()), known_as);
    }

    #[test]
    fn suspended_source_is_skipped() {
        let core = core();
        let hits = Arc::new(AtomicU64::new(0));
        let count = Arc::clone(&hits);
        let handler = move |_: &NodeAddress, _: &NodeAddress, _: &[u8], _: HandlerId| {
            count.fetch_add(1, Ordering::SeqCst);
        };
        let peer = NodeAddress::direct(addr(7, 5377));
        let header = WireHeader::new(peer, core.local(), 3, 0, 1);

        core.suspend(peer);
        core.deliver_data(&header, vec![1], Some(&handler), |_, _| false);
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        core.resume(&peer);
        core.deliver_data(&header, vec![1], Some(&handler), |_, _| false);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn internal_messages_bypass_the_pipeline() {
        let local = NodeAddress::direct(addr(1, 5377));
        let core = TransportCore::new(local, None, false, build_pipeline(local, true, false));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let handler = move |_: &NodeAddress, _: &NodeAddress, p: &[u8], _: HandlerId| {
            lock(&sink).push(p.to_vec());
        };

        let peer = NodeAddress::direct(addr(7, 5377));
        for payload in [&b"ping"[..], &b"0123456789ab"[..]] {
            let header = WireHeader::new(
                peer,
                local,
                3,
                flags::INTERNAL_MESSAGE,
                payload.len() as u32,
            );
            core.deliver_data(&header, payload.to_vec(), Some(&handler), |_, _| false);
        }
        assert_eq!(*lock(&seen), vec![b"ping".to_vec(), b"0123456789ab".to_vec()]);

        // an ordinary frame still carries the flow prefix
        let (prefix, body) = core.prepare(&peer, b"data", 3).expect("flow prefix");
        let mut framed = prefix;
        framed.extend_from_slice(&body);
        let header = WireHeader::new(peer, local, 3, 0, framed.len() as u32);
        core.deliver_data(&header, framed, Some(&handler), |_, _| false);
        assert_eq!(lock(&seen).last().map(Vec::as_slice), Some(&b"data"[..]));
    }

    #[test]
    fn proxied_messages_are_forwarded() {
        let core = core();
        let header = WireHeader::new(
            NodeAddress::direct(addr(7, 5377)),
            NodeAddress::new(addr(8, 0), addr(1, 5377)),
            3,
            0,
            1,
        );
        let mut forwarded = false;
        core.deliver_data(&header, vec![1], None, |h, p| {
            forwarded = h.dest.local == addr(8, 0) && p == [1u8].as_slice();
            true
        });
        assert!(forwarded);
    }

    #[test]
    fn acceptor_must_be_registered_once() {
        let core = core();
        assert!(core.accept_connection(&NodeAddress::NULL, b""));
        assert!(core.set_authoritative_acceptor(42).is_err());

        let id = core.acceptance_handlers.register(
            Arc::new(|_: &NodeAddress, token: &[u8], _: HandlerId| token == b"ok"),
            None,
        );
        assert!(core.set_authoritative_acceptor(id).is_ok());
        assert!(core.set_authoritative_acceptor(id).is_err());
        assert!(core.accept_connection(&NodeAddress::NULL, b"ok"));
        assert!(!core.accept_connection(&NodeAddress::NULL, b"no"));
    }
}
