//! # Upcall Handlers
//!
//! Traits implemented by the layers above a transport, and the registry that
//! maps handler ids to them.
//!
//! Registration is immediate. Unregistration is queued and applied by the
//! delivery loop only once no in-flight delivery holds a lease on that id, so
//! a handler is never dropped out from under a callback that is running on
//! another delivery thread.

use std::collections::HashMap;
use std::ops::Deref;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use crate::core::address::NodeAddress;
pub use crate::core::header::HandlerId;
use crate::error::ErrorKind;

/// Receives framed payloads addressed to its handler id.
pub trait ReceiveDataHandler: Send + Sync {
    fn deliver(&self, src: &NodeAddress, dest: &NodeAddress, payload: &[u8], handler_id: HandlerId);
}

impl<F> ReceiveDataHandler for F
where
    F: Fn(&NodeAddress, &NodeAddress, &[u8], HandlerId) + Send + Sync,
{
    fn deliver(&self, src: &NodeAddress, dest: &NodeAddress, payload: &[u8], handler_id: HandlerId) {
        self(src, dest, payload, handler_id)
    }
}

/// Notified when a connection to a peer fails.
pub trait NetworkErrorHandler: Send + Sync {
    /// One call per failed connection per remote node reachable through it.
    fn error(&self, peer: &NodeAddress, kind: ErrorKind, message: &str, handler_id: HandlerId);

    /// One call per message that was queued but never fully written.
    fn message_error(
        &self,
        _dest: &NodeAddress,
        _kind: ErrorKind,
        _payload: &[u8],
        _handler_id: HandlerId,
    ) {
    }
}

/// Flow-control upcalls.
pub trait ConnectionStatusHandler: Send + Sync {
    /// The connection to `peer` drained below its threshold after a request-to-send.
    fn clear_to_send(&self, peer: &NodeAddress, handler_id: HandlerId);

    /// Every outgoing byte has been written.
    fn notify_flushed(&self, handler_id: HandlerId);
}

/// Decides whether an incoming connection may deliver data.
pub trait ConnectionAcceptanceHandler: Send + Sync {
    fn accept_connection(&self, peer: &NodeAddress, token: &[u8], handler_id: HandlerId) -> bool;
}

impl<F> ConnectionAcceptanceHandler for F
where
    F: Fn(&NodeAddress, &[u8], HandlerId) -> bool + Send + Sync,
{
    fn accept_connection(&self, peer: &NodeAddress, token: &[u8], handler_id: HandlerId) -> bool {
        self(peer, token, handler_id)
    }
}

static NEXT_HANDLER_ID: AtomicU32 = AtomicU32::new(1);

/// Allocate a process-wide unique handler id.
pub fn next_handler_id() -> HandlerId {
    NEXT_HANDLER_ID.fetch_add(1, Ordering::Relaxed)
}

/// Handler map with race-safe, deferred unregistration.
pub struct HandlerRegistry<H: ?Sized> {
    handlers: RwLock<HashMap<HandlerId, Arc<H>>>,
    pending: Mutex<Vec<HandlerId>>,
    in_flight: Arc<Mutex<HashMap<HandlerId, usize>>>,
}

impl<H: ?Sized> Default for HandlerRegistry<H> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H: ?Sized> HandlerRegistry<H> {
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            pending: Mutex::new(Vec::new()),
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Register `handler`, allocating a fresh id when `id` is `None`.
    ///
    /// Re-registering an id cancels any unregistration still queued for it.
    pub fn register(&self, handler: Arc<H>, id: Option<HandlerId>) -> HandlerId {
        let id = id.unwrap_or_else(next_handler_id);
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|queued| *queued != id);
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, handler);
        id
    }

    /// Queue `id` for removal at the next safe point.
    pub fn unregister(&self, id: HandlerId) {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(id);
    }

    /// Remove queued ids that no in-flight delivery is using.
    ///
    /// Returns the number of handlers removed.
    pub fn apply_unregistrations(&self) -> usize {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        if pending.is_empty() {
            return 0;
        }
        let in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        let mut handlers = self.handlers.write().unwrap_or_else(PoisonError::into_inner);
        let before = pending.len();
        pending.retain(|id| {
            if in_flight.get(id).copied().unwrap_or(0) > 0 {
                return true;
            }
            handlers.remove(id);
            false
        });
        before - pending.len()
    }

    pub fn get(&self, id: HandlerId) -> Option<Arc<H>> {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
    }

    /// Look up `id` and hold it registered until the lease is dropped.
    pub fn lease(&self, id: HandlerId) -> Option<HandlerLease<H>> {
        let handler = self.get(id)?;
        *self
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(id)
            .or_insert(0) += 1;
        Some(HandlerLease {
            id,
            handler,
            in_flight: Arc::clone(&self.in_flight),
        })
    }

    pub fn contains(&self, id: HandlerId) -> bool {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&id)
    }

    pub fn is_empty(&self) -> bool {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_empty()
    }

    pub fn len(&self) -> usize {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Lease every registration, ordered by id.
    pub fn leases(&self) -> Vec<HandlerLease<H>> {
        let mut all: Vec<_> = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(id, h)| (*id, Arc::clone(h)))
            .collect();
        all.sort_by_key(|(id, _)| *id);

        let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        all.into_iter()
            .map(|(id, handler)| {
                *in_flight.entry(id).or_insert(0) += 1;
                HandlerLease {
                    id,
                    handler,
                    in_flight: Arc::clone(&self.in_flight),
                }
            })
            .collect()
    }
}

/// A registered handler pinned against unregistration.
pub struct HandlerLease<H: ?Sized> {
    id: HandlerId,
    handler: Arc<H>,
    in_flight: Arc<Mutex<HashMap<HandlerId, usize>>>,
}

impl<H: ?Sized> HandlerLease<H> {
    pub fn id(&self) -> HandlerId {
        self.id
    }
}

impl<H: ?Sized> Deref for HandlerLease<H> {
    type Target = H;

    fn deref(&self) -> &H {
        &self.handler
    }
}

impl<H: ?Sized> Drop for HandlerLease<H> {
    fn drop(&mut self) {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(count) = in_flight.get_mut(&self.id) {
            *count -= 1;
            if *count == 0 {
                in_flight.remove(&self.id);
            }
        }
    }
}
