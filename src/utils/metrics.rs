//! Observability and Metrics
//!
//! This module provides metrics collection and observability features
//! for monitoring transport throughput and connection health.
//!
//! Uses atomic counters for thread-safe metrics collection, plus a
//! per-connection sliding-window bandwidth estimator.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::info;

/// Default bandwidth averaging window.
pub const DEFAULT_STATS_WINDOW: Duration = Duration::from_secs(5);

/// Global metrics collector for transport operations
#[derive(Debug)]
pub struct Metrics {
    /// Total connections created (accepted or initiated)
    pub connections_total: AtomicU64,
    /// Currently open connections
    pub connections_active: AtomicU64,
    /// Connections accepted from the listener
    pub connections_accepted: AtomicU64,
    /// Connections rejected by an acceptance handler
    pub connections_rejected: AtomicU64,
    /// Connections closed with an error kind other than NonError
    pub connection_errors: AtomicU64,
    /// Connections closed by idle garbage collection
    pub connections_collected: AtomicU64,
    /// Total messages enqueued for sending
    pub messages_sent: AtomicU64,
    /// Total messages handed to receive handlers
    pub messages_delivered: AtomicU64,
    /// Per-message error notifications
    pub message_errors: AtomicU64,
    /// Total bytes written to sockets
    pub bytes_sent: AtomicU64,
    /// Total bytes read from sockets
    pub bytes_received: AtomicU64,
    /// Operations deferred on socket exhaustion
    pub deferred_operations: AtomicU64,
    /// Malformed datagrams or frames dropped
    pub frames_dropped: AtomicU64,
    /// Start time for uptime calculation
    start_time: Instant,
}

impl Metrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self {
            connections_total: AtomicU64::new(0),
            connections_active: AtomicU64::new(0),
            connections_accepted: AtomicU64::new(0),
            connections_rejected: AtomicU64::new(0),
            connection_errors: AtomicU64::new(0),
            connections_collected: AtomicU64::new(0),
            messages_sent: AtomicU64::new(0),
            messages_delivered: AtomicU64::new(0),
            message_errors: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            deferred_operations: AtomicU64::new(0),
            frames_dropped: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    /// Record a new connection
    pub fn connection_opened(&self) {
        self.connections_total.fetch_add(1, Ordering::Relaxed);
        self.connections_active.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a connection closed
    pub fn connection_closed(&self) {
        // Saturating: a close racing a snapshot must never wrap the gauge
        let _ = self
            .connections_active
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                Some(v.saturating_sub(1))
            });
    }

    /// Record an accepted incoming connection
    pub fn connection_accepted(&self) {
        self.connections_accepted.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a connection rejected by the acceptance handler
    pub fn connection_rejected(&self) {
        self.connections_rejected.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a connection error
    pub fn connection_error(&self) {
        self.connection_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an idle connection closed by garbage collection
    pub fn connection_collected(&self) {
        self.connections_collected.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a message enqueued for sending
    pub fn message_sent(&self) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a message delivered to a handler
    pub fn message_delivered(&self) {
        self.messages_delivered.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a per-message error notification
    pub fn message_error(&self) {
        self.message_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Record bytes written to a socket
    pub fn bytes_written(&self, byte_count: u64) {
        self.bytes_sent.fetch_add(byte_count, Ordering::Relaxed);
    }

    /// Record bytes read from a socket
    pub fn bytes_read(&self, byte_count: u64) {
        self.bytes_received.fetch_add(byte_count, Ordering::Relaxed);
    }

    /// Record an operation deferred for lack of sockets
    pub fn operation_deferred(&self) {
        self.deferred_operations.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a dropped malformed frame
    pub fn frame_dropped(&self) {
        self.frames_dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current metrics snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connections_total: self.connections_total.load(Ordering::Relaxed),
            connections_active: self.connections_active.load(Ordering::Relaxed),
            connections_accepted: self.connections_accepted.load(Ordering::Relaxed),
            connections_rejected: self.connections_rejected.load(Ordering::Relaxed),
            connection_errors: self.connection_errors.load(Ordering::Relaxed),
            connections_collected: self.connections_collected.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_delivered: self.messages_delivered.load(Ordering::Relaxed),
            message_errors: self.message_errors.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            deferred_operations: self.deferred_operations.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            uptime_seconds: self.start_time.elapsed().as_secs(),
        }
    }

    /// Log current metrics
    pub fn log_metrics(&self) {
        let snapshot = self.snapshot();
        info!(
            connections_total = snapshot.connections_total,
            connections_active = snapshot.connections_active,
            connections_accepted = snapshot.connections_accepted,
            connections_rejected = snapshot.connections_rejected,
            connection_errors = snapshot.connection_errors,
            connections_collected = snapshot.connections_collected,
            messages_sent = snapshot.messages_sent,
            messages_delivered = snapshot.messages_delivered,
            message_errors = snapshot.message_errors,
            bytes_sent = snapshot.bytes_sent,
            bytes_received = snapshot.bytes_received,
            deferred_operations = snapshot.deferred_operations,
            frames_dropped = snapshot.frames_dropped,
            uptime_seconds = snapshot.uptime_seconds,
            "Transport metrics snapshot"
        );
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub connections_total: u64,
    pub connections_active: u64,
    pub connections_accepted: u64,
    pub connections_rejected: u64,
    pub connection_errors: u64,
    pub connections_collected: u64,
    pub messages_sent: u64,
    pub messages_delivered: u64,
    pub message_errors: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub deferred_operations: u64,
    pub frames_dropped: u64,
    pub uptime_seconds: u64,
}

/// Process-wide counters shared by every transport
static METRICS: once_cell::sync::Lazy<Metrics> = once_cell::sync::Lazy::new(Metrics::new);

/// Get the global metrics instance
pub fn global_metrics() -> &'static Metrics {
    &METRICS
}

/// Sliding-window byte counter for one connection.
///
/// Every socket read or write appends a sample; samples older than the window
/// are discarded lazily, so [`BufferStatistics::bandwidth`] reflects only
/// recent traffic.
#[derive(Debug, Clone)]
pub struct BufferStatistics {
    window: Duration,
    samples: VecDeque<(Instant, u64)>,
    window_bytes: u64,
    total_bytes: u64,
}

impl BufferStatistics {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            samples: VecDeque::new(),
            window_bytes: 0,
            total_bytes: 0,
        }
    }

    /// Record `bytes` transferred now.
    pub fn append(&mut self, bytes: u64) {
        self.append_at(Instant::now(), bytes);
    }

    pub(crate) fn append_at(&mut self, at: Instant, bytes: u64) {
        self.samples.push_back((at, bytes));
        self.window_bytes += bytes;
        self.total_bytes += bytes;
        self.expire(at);
    }

    fn expire(&mut self, now: Instant) {
        while let Some(&(t, b)) = self.samples.front() {
            if now.saturating_duration_since(t) <= self.window {
                break;
            }
            self.samples.pop_front();
            self.window_bytes -= b;
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Change the averaging window; older samples expire on the next append.
    pub fn set_window(&mut self, window: Duration) {
        self.window = window;
    }

    /// Bytes transferred inside the current window.
    pub fn window_bytes(&self) -> u64 {
        self.window_bytes
    }

    /// Bytes transferred since the connection was created.
    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    /// Average bytes per second over the window.
    pub fn bandwidth(&self) -> f64 {
        let secs = self.window.as_secs_f64();
        if secs == 0.0 {
            return 0.0;
        }
        self.window_bytes as f64 / secs
    }
}

impl Default for BufferStatistics {
    fn default() -> Self {
        Self::new(DEFAULT_STATS_WINDOW)
    }
}
