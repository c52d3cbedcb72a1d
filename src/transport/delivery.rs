//! # Delivery
//!
//! The state machine that turns a transport's queues into handler upcalls,
//! and the bounded pool of threads that runs it.
//!
//! Each pool thread loops:
//! 1. under the transport lock, wait until [`DeliveryLoop::condition`] holds
//! 2. [`DeliveryLoop::setup`] advances the state machine and takes one job
//! 3. unlock, [`DeliveryLoop::process`] runs the job (handler upcalls happen
//!    here, with no transport lock held)
//! 4. lock again, [`DeliveryLoop::finish`] records the outcome
//!
//! A halted pool wakes every thread and lets it exit; a supervisor thread
//! joins them and then calls [`DeliveryLoop::halted`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use tracing::{debug, error, info};

use super::connection::Connection;
use crate::core::address::NodeAddress;
use crate::core::header::WireHeader;
use crate::protocol::handler::{
    ConnectionStatusHandler, HandlerLease, NetworkErrorHandler, ReceiveDataHandler,
};

/// Upper bound on a pool thread's wait, so a halt is never missed.
const WAIT_SLICE: Duration = Duration::from_millis(100);

/// Where the delivery loop is in its round over the transport's queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeliverState {
    #[default]
    Waiting,
    Deliver,
    Rts,
    Error,
    Flushed,
    Finito,
    PostFinito,
}

impl DeliverState {
    /// The state a round falls through to when this one has nothing to do.
    pub fn fall_through(self) -> DeliverState {
        match self {
            DeliverState::Waiting => DeliverState::Deliver,
            DeliverState::Deliver => DeliverState::Rts,
            DeliverState::Rts => DeliverState::Error,
            DeliverState::Error => DeliverState::Flushed,
            DeliverState::Flushed => DeliverState::Waiting,
            DeliverState::Finito => DeliverState::PostFinito,
            DeliverState::PostFinito => DeliverState::PostFinito,
        }
    }
}

/// One unit of work for a pool thread.
pub enum DeliveryJob {
    Deliver {
        /// Connection the message arrived on; `None` for datagrams.
        source: Option<Arc<Connection>>,
        header: WireHeader,
        payload: Vec<u8>,
        handler: Option<HandlerLease<dyn ReceiveDataHandler>>,
        /// Record `header.src` as reachable through `source`.
        learn_key: bool,
        /// The source still needs the acceptor's approval.
        check_accept: bool,
    },
    ClearToSend {
        peer: NodeAddress,
        handler: HandlerLease<dyn ConnectionStatusHandler>,
    },
    Error {
        connection: Arc<Connection>,
        handlers: Vec<HandlerLease<dyn NetworkErrorHandler>>,
    },
    Flushed {
        handler: HandlerLease<dyn ConnectionStatusHandler>,
    },
    Shutdown,
}

impl std::fmt::Debug for DeliveryJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeliveryJob::Deliver { header, payload, .. } => f
                .debug_struct("Deliver")
                .field("src", &header.src)
                .field("handler_id", &header.handler_id)
                .field("size", &payload.len())
                .finish(),
            DeliveryJob::ClearToSend { peer, handler } => f
                .debug_struct("ClearToSend")
                .field("peer", peer)
                .field("handler_id", &handler.id())
                .finish(),
            DeliveryJob::Error { connection, .. } => f
                .debug_struct("Error")
                .field("connection", &connection.id())
                .finish(),
            DeliveryJob::Flushed { handler } => f
                .debug_struct("Flushed")
                .field("handler_id", &handler.id())
                .finish(),
            DeliveryJob::Shutdown => f.write_str("Shutdown"),
        }
    }
}

/// What a transport implements to be driven by a [`WorkerPool`].
pub trait DeliveryLoop: Send + Sync + 'static {
    /// State guarded by the transport lock.
    type State: Send + 'static;

    fn name(&self) -> &str;

    fn state(&self) -> &Mutex<Self::State>;

    /// Whether there is work. Called with the lock held.
    fn condition(&self, state: &mut Self::State) -> bool;

    /// Advance the state machine and take the next job, if any.
    fn setup(&self, state: &mut Self::State) -> Option<DeliveryJob>;

    /// Run a job without the transport lock.
    fn process(&self, job: &mut DeliveryJob, pool: &PoolControl);

    /// Record a processed job. Called with the lock held.
    fn finish(&self, state: &mut Self::State, job: DeliveryJob);

    /// Every pool thread has exited.
    fn halted(&self);
}

/// Wakeup and halt signalling shared by a pool's threads and its transport.
#[derive(Debug, Default)]
pub struct PoolControl {
    cond: Condvar,
    halted: AtomicBool,
}

impl PoolControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wake the pool to re-check its condition.
    pub fn signal(&self) {
        self.cond.notify_all();
    }

    /// Stop every thread after its current job.
    pub fn halt(&self) {
        self.halted.store(true, Ordering::Release);
        self.cond.notify_all();
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::Acquire)
    }
}

/// A fixed number of delivery threads over one [`DeliveryLoop`].
pub struct WorkerPool;

impl WorkerPool {
    /// Spawn `threads` workers plus the supervisor that joins them.
    pub fn start<L: DeliveryLoop>(
        delivery: Arc<L>,
        control: Arc<PoolControl>,
        threads: usize,
    ) -> std::io::Result<()> {
        let name = delivery.name().to_string();
        thread::Builder::new()
            .name(format!("{name}-supervisor"))
            .spawn(move || {
                let mut workers = Vec::with_capacity(threads);
                for i in 0..threads {
                    let delivery = Arc::clone(&delivery);
                    let control = Arc::clone(&control);
                    match thread::Builder::new()
                        .name(format!("{name}-deliver-{i}"))
                        .spawn(move || run_worker(&*delivery, &control))
                    {
                        Ok(handle) => workers.push(handle),
                        Err(e) => error!(transport = %name, error = %e, "failed to spawn delivery thread"),
                    }
                }
                info!(transport = %name, threads = workers.len(), "delivery pool started");

                for handle in workers {
                    if handle.join().is_err() {
                        error!(transport = %name, "delivery thread panicked");
                    }
                }
                info!(transport = %name, "delivery pool halted");
                delivery.halted();
            })?;
        Ok(())
    }
}

fn run_worker<L: DeliveryLoop>(delivery: &L, control: &PoolControl) {
    let mut state = delivery
        .state()
        .lock()
        .unwrap_or_else(PoisonError::into_inner);
    loop {
        if control.is_halted() {
            break;
        }
        if !delivery.condition(&mut state) {
            state = control
                .cond
                .wait_timeout(state, WAIT_SLICE)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
            continue;
        }
        let Some(mut job) = delivery.setup(&mut state) else {
            continue;
        };
        drop(state);

        debug!(?job, "processing");
        delivery.process(&mut job, control);

        state = delivery
            .state()
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        delivery.finish(&mut state, job);
        control.signal();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    #[derive(Default)]
    struct Queue {
        items: VecDeque<u32>,
        state: DeliverState,
        shutting_down: bool,
    }

    #[derive(Default)]
    struct Counter {
        state: Mutex<Queue>,
        processed: AtomicUsize,
        finished: AtomicUsize,
        halted: AtomicBool,
    }

    impl DeliveryLoop for Counter {
        type State = Queue;

        fn name(&self) -> &str {
            "counter"
        }

        fn state(&self) -> &Mutex<Queue> {
            &self.state
        }

        fn condition(&self, st: &mut Queue) -> bool {
            if st.state == DeliverState::PostFinito {
                return false;
            }
            if !st.items.is_empty() {
                return true;
            }
            if st.shutting_down {
                st.state = DeliverState::Finito;
                return true;
            }
            false
        }

        fn setup(&self, st: &mut Queue) -> Option<DeliveryJob> {
            if st.state == DeliverState::Finito {
                st.state = st.state.fall_through();
                return Some(DeliveryJob::Shutdown);
            }
            st.items.pop_front().map(|_| DeliveryJob::Deliver {
                source: None,
                header: WireHeader::default(),
                payload: Vec::new(),
                handler: None,
                learn_key: false,
                check_accept: false,
            })
        }

        fn process(&self, job: &mut DeliveryJob, pool: &PoolControl) {
            match job {
                DeliveryJob::Shutdown => pool.halt(),
                _ => {
                    self.processed.fetch_add(1, Ordering::SeqCst);
                }
            }
        }

        fn finish(&self, _st: &mut Queue, _job: DeliveryJob) {
            self.finished.fetch_add(1, Ordering::SeqCst);
        }

        fn halted(&self) {
            self.halted.store(true, Ordering::SeqCst);
        }
    }

    #[test]
    fn round_falls_through_every_queue() {
        let mut s = DeliverState::Waiting;
        let mut seen = Vec::new();
        for _ in 0..5 {
            s = s.fall_through();
            seen.push(s);
        }
        assert_eq!(
            seen,
            [
                DeliverState::Deliver,
                DeliverState::Rts,
                DeliverState::Error,
                DeliverState::Flushed,
                DeliverState::Waiting
            ]
        );
        assert_eq!(DeliverState::Finito.fall_through(), DeliverState::PostFinito);
    }

    #[test]
    fn pool_drains_then_halts_on_shutdown() {
        let counter = Arc::new(Counter::default());
        let control = Arc::new(PoolControl::new());
        WorkerPool::start(Arc::clone(&counter), Arc::clone(&control), 3).expect("spawn");

        {
            let mut st = counter.state.lock().unwrap_or_else(PoisonError::into_inner);
            st.items.extend(0..50);
        }
        control.signal();

        let deadline = Instant::now() + Duration::from_secs(5);
        while counter.processed.load(Ordering::SeqCst) < 50 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(counter.processed.load(Ordering::SeqCst), 50);

        counter
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .shutting_down = true;
        control.signal();

        while !counter.halted.load(Ordering::SeqCst) && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(control.is_halted());
        assert!(counter.halted.load(Ordering::SeqCst));
        assert_eq!(counter.finished.load(Ordering::SeqCst), 51);
    }
}
