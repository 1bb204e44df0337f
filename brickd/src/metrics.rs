use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::SystemTime;

/// Global counters for the daemon.
///
/// Updated from the event loop and the transport tasks, so all fields are
/// atomic. A periodic task logs a summary line.
pub struct Metrics {
    pub start_time: SystemTime,
    clients_connected: AtomicUsize,
    stacks_active: AtomicUsize,
    requests_total: AtomicU64,
    responses_total: AtomicU64,
    callbacks_total: AtomicU64,
    invalid_requests: AtomicU64,
    pending_expired: AtomicU64,
    callbacks_dropped_slow_client: AtomicU64,
    write_queue_evictions: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            start_time: SystemTime::now(),
            clients_connected: AtomicUsize::new(0),
            stacks_active: AtomicUsize::new(0),
            requests_total: AtomicU64::new(0),
            responses_total: AtomicU64::new(0),
            callbacks_total: AtomicU64::new(0),
            invalid_requests: AtomicU64::new(0),
            pending_expired: AtomicU64::new(0),
            callbacks_dropped_slow_client: AtomicU64::new(0),
            write_queue_evictions: AtomicU64::new(0),
        }
    }

    pub fn client_connected(&self) {
        self.clients_connected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn client_disconnected(&self) {
        self.clients_connected.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn clients_connected(&self) -> usize {
        self.clients_connected.load(Ordering::Relaxed)
    }

    pub fn stack_added(&self) {
        self.stacks_active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stack_removed(&self) {
        self.stacks_active.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn stacks_active(&self) -> usize {
        self.stacks_active.load(Ordering::Relaxed)
    }

    pub fn inc_requests(&self) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn requests_total(&self) -> u64 {
        self.requests_total.load(Ordering::Relaxed)
    }

    pub fn inc_responses(&self) {
        self.responses_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn responses_total(&self) -> u64 {
        self.responses_total.load(Ordering::Relaxed)
    }

    pub fn inc_callbacks(&self) {
        self.callbacks_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn callbacks_total(&self) -> u64 {
        self.callbacks_total.load(Ordering::Relaxed)
    }

    pub fn inc_invalid_requests(&self) {
        self.invalid_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn invalid_requests(&self) -> u64 {
        self.invalid_requests.load(Ordering::Relaxed)
    }

    pub fn inc_pending_expired(&self) {
        self.pending_expired.fetch_add(1, Ordering::Relaxed);
    }

    pub fn pending_expired(&self) -> u64 {
        self.pending_expired.load(Ordering::Relaxed)
    }

    pub fn inc_callbacks_dropped_slow_client(&self) {
        self.callbacks_dropped_slow_client
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn callbacks_dropped_slow_client(&self) -> u64 {
        self.callbacks_dropped_slow_client.load(Ordering::Relaxed)
    }

    pub fn inc_write_queue_evictions(&self) {
        self.write_queue_evictions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn write_queue_evictions(&self) -> u64 {
        self.write_queue_evictions.load(Ordering::Relaxed)
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().map(|d| d.as_secs()).unwrap_or(0)
    }

    pub fn summary(&self) -> String {
        format!(
            "clients={} stacks={} requests={} responses={} callbacks={} dropped_callbacks={} queue_evictions={}",
            self.clients_connected(),
            self.stacks_active(),
            self.requests_total(),
            self.responses_total(),
            self.callbacks_total(),
            self.callbacks_dropped_slow_client(),
            self.write_queue_evictions()
        )
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
