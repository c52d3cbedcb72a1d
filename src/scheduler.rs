//! # Transport Scheduler
//!
//! One thread that waits for socket readiness across every registered
//! transport and then lets each transport do its non-blocking I/O.
//!
//! The scheduler owns a current-thread tokio runtime used purely as the
//! reactor: transports register their sockets with it (through [`Scheduler::handle`])
//! and hand back readiness futures from [`Schedulable::interest`]. The loop
//! races those futures against a control [`Notify`] and the select timeout,
//! then calls [`Schedulable::do_io`] on every transport.
//!
//! Small writes coalesce: [`Scheduler::signal`] arms a short timer instead of
//! waking the loop immediately, unless the accumulated byte count crosses the
//! threshold or the caller forces a wake.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Instant;

use futures::future::select_all;
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::config::SchedulerConfig;
use crate::error::{Result, TransportError};
use crate::transport::{Readiness, Schedulable};

/// Shared handle to the scheduler thread. Clones refer to the same scheduler.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

struct Inner {
    config: SchedulerConfig,
    runtime: Option<Runtime>,
    handle: Handle,
    notify: Notify,
    state: Mutex<State>,
    transport_count: AtomicUsize,
}

#[derive(Default)]
struct State {
    running: bool,
    pending: Vec<Arc<dyn Schedulable>>,
    bytes_queued: usize,
    timer: Option<JoinHandle<()>>,
    free_requested: bool,
}

impl Scheduler {
    /// Build the reactor. No thread runs until the first transport is added.
    pub fn new(config: SchedulerConfig) -> Result<Self> {
        let runtime = Builder::new_current_thread()
            .enable_io()
            .enable_time()
            .thread_name("transport-scheduler")
            .build()
            .map_err(|e| TransportError::Custom(format!("failed to build scheduler runtime: {e}")))?;
        let handle = runtime.handle().clone();

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                runtime: Some(runtime),
                handle,
                notify: Notify::new(),
                state: Mutex::new(State::default()),
                transport_count: AtomicUsize::new(0),
            }),
        })
    }

    /// Register a transport and start the scheduler thread if it is idle.
    #[instrument(skip(self, transport), fields(transport = transport.name()))]
    pub fn add(&self, transport: Arc<dyn Schedulable>) -> Result<()> {
        let mut state = self.inner.lock();
        state.pending.push(transport);
        if state.running {
            drop(state);
            self.inner.notify.notify_one();
            return Ok(());
        }

        state.running = true;
        let inner = Arc::clone(&self.inner);
        let spawned = thread::Builder::new()
            .name("transport-scheduler".into())
            .spawn(move || inner.run());
        if let Err(e) = spawned {
            state.running = false;
            state.pending.clear();
            return Err(TransportError::Io(e));
        }
        info!("scheduler thread started");
        Ok(())
    }

    /// Report `bytes` of newly queued output.
    ///
    /// Wakes the loop at once when `force` is set or the accumulated count
    /// exceeds the threshold; otherwise arms the coalescing timer.
    pub fn signal(&self, bytes: usize, force: bool) {
        let mut state = self.inner.lock();
        state.bytes_queued = state.bytes_queued.saturating_add(bytes);

        if force || state.bytes_queued > self.inner.config.timer_threshold {
            if let Some(timer) = state.timer.take() {
                timer.abort();
            }
            state.bytes_queued = 0;
            drop(state);
            self.inner.notify.notify_one();
            return;
        }

        if state.timer.is_none() {
            let weak = Arc::downgrade(&self.inner);
            let wait = self.inner.config.max_timer_wait;
            state.timer = Some(self.inner.handle.spawn(async move {
                tokio::time::sleep(wait).await;
                Inner::fire_timer(&weak);
            }));
        }
    }

    /// Ask every transport to garbage-collect idle connections on the next pass.
    pub fn free_sockets(&self) {
        self.inner.lock().free_requested = true;
        self.inner.notify.notify_one();
    }

    /// Runtime handle used to register sockets and spawn connect tasks.
    pub fn handle(&self) -> Handle {
        self.inner.handle.clone()
    }

    pub fn is_running(&self) -> bool {
        self.inner.lock().running
    }

    /// Transports currently serviced by the loop.
    pub fn transport_count(&self) -> usize {
        self.inner.transport_count.load(Ordering::Acquire)
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("running", &self.is_running())
            .field("transports", &self.transport_count())
            .finish()
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn fire_timer(weak: &Weak<Inner>) {
        if let Some(inner) = weak.upgrade() {
            {
                let mut state = inner.lock();
                state.timer = None;
                state.bytes_queued = 0;
            }
            inner.notify.notify_one();
        }
    }

    fn run(self: Arc<Self>) {
        let Some(runtime) = self.runtime.as_ref() else {
            return;
        };
        runtime.block_on(self.event_loop());
        info!("scheduler thread exiting");
    }

    async fn event_loop(&self) {
        let mut transports: Vec<Arc<dyn Schedulable>> = Vec::new();
        let interval = self.config.check_running_interval.max(1);
        let mut count: u32 = 0;

        loop {
            transports.append(&mut self.lock().pending);

            if count % interval == 0 {
                transports.retain(|t| {
                    let running = t.is_running();
                    if !running {
                        debug!(transport = t.name(), "removing stopped transport");
                    }
                    running
                });
            }
            self.transport_count.store(transports.len(), Ordering::Release);

            if transports.is_empty() {
                let mut state = self.lock();
                if state.pending.is_empty() {
                    state.running = false;
                    if let Some(timer) = state.timer.take() {
                        timer.abort();
                    }
                    return;
                }
                continue;
            }

            let free = std::mem::take(&mut self.lock().free_requested);
            if free {
                for t in &transports {
                    t.free_sockets();
                }
            }

            let readiness: Vec<Readiness> = transports.iter().flat_map(|t| t.interest()).collect();
            count = count.wrapping_add(1);

            let wake = Instant::now();
            let timeout = tokio::time::sleep(self.config.select_timeout);
            if readiness.is_empty() {
                tokio::select! {
                    _ = self.notify.notified() => {}
                    _ = timeout => {}
                }
            } else {
                tokio::select! {
                    _ = select_all(readiness) => {}
                    _ = self.notify.notified() => {}
                    _ = timeout => {}
                }
            }

            {
                let mut state = self.lock();
                state.bytes_queued = 0;
                if let Some(timer) = state.timer.take() {
                    timer.abort();
                }
            }

            for t in &transports {
                t.do_io(wake);
            }
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
        let pending = self.lock().pending.len();
        if pending > 0 {
            warn!(pending, "scheduler dropped with transports still pending");
        }
    }
}
