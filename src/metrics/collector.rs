use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters for the session client
///
/// All counters are lifetime totals except `in_flight`.
#[derive(Debug, Default)]
pub struct SessionMetrics {
    /// Dispatches currently between LoadingStarted and LoadingFinished
    in_flight: AtomicU64,

    /// Lifetime dispatch count (originals, refresh calls and retries)
    total_dispatches: AtomicU64,

    /// Refresh calls actually sent
    refresh_attempts: AtomicU64,

    /// Refresh calls that failed
    refresh_failures: AtomicU64,

    /// Requests replayed after a refresh
    retries: AtomicU64,

    /// 401s delivered straight to the caller
    terminal_unauthorized: AtomicU64,

    /// Transport errors keyed by kind
    errors_by_kind: DashMap<String, AtomicU64>,
}

/// Point-in-time copy of the counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub in_flight: u64,
    pub total_dispatches: u64,
    pub refresh_attempts: u64,
    pub refresh_failures: u64,
    pub retries: u64,
    pub terminal_unauthorized: u64,
}

impl SessionMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_dispatch_started(&self) {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        self.total_dispatches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dispatch_finished(&self) {
        // Saturating: never wrap below zero
        let _ = self
            .in_flight
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    pub fn record_refresh_attempt(&self) {
        self.refresh_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_refresh_failure(&self) {
        self.refresh_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_terminal_unauthorized(&self) {
        self.terminal_unauthorized.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a transport error
    pub fn record_error(&self, kind: &str) {
        self.errors_by_kind
            .entry(kind.to_string())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn in_flight(&self) -> u64 {
        self.in_flight.load(Ordering::Relaxed)
    }

    pub fn refresh_attempts(&self) -> u64 {
        self.refresh_attempts.load(Ordering::Relaxed)
    }

    /// Transport errors of one kind
    pub fn errors_of_kind(&self, kind: &str) -> u64 {
        self.errors_by_kind
            .get(kind)
            .map(|count| count.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            in_flight: self.in_flight.load(Ordering::Relaxed),
            total_dispatches: self.total_dispatches.load(Ordering::Relaxed),
            refresh_attempts: self.refresh_attempts.load(Ordering::Relaxed),
            refresh_failures: self.refresh_failures.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            terminal_unauthorized: self.terminal_unauthorized.load(Ordering::Relaxed),
        }
    }
}
