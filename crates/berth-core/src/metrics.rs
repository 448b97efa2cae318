//! Global atomic counters for Berth observability.
//!
//! Counters are incremented silently at the call site. Call
//! [`Metrics::flush`] to emit current values as a single `tracing::info!`
//! event (the daemon does so on shutdown).

use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics singleton.
pub static METRICS: Metrics = Metrics::new();

/// Lightweight atomic counters.
pub struct Metrics {
    events_handled: AtomicU64,
    dispatches: AtomicU64,
    cache_hits: AtomicU64,
    releases_completed: AtomicU64,
    releases_failed: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            events_handled: AtomicU64::new(0),
            dispatches: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            releases_completed: AtomicU64::new(0),
            releases_failed: AtomicU64::new(0),
        }
    }

    pub fn inc_events_handled(&self) {
        self.events_handled.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "events_handled", "counter incremented");
    }

    pub fn inc_dispatches(&self) {
        self.dispatches.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "dispatches", "counter incremented");
    }

    pub fn inc_cache_hits(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "cache_hits", "counter incremented");
    }

    pub fn inc_releases_completed(&self) {
        self.releases_completed.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "releases_completed", "counter incremented");
    }

    pub fn inc_releases_failed(&self) {
        self.releases_failed.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "releases_failed", "counter incremented");
    }

    /// Emit all current counter values as a single `info!` event.
    pub fn flush(&self) {
        tracing::info!(
            metric = "flush",
            events_handled = self.events_handled(),
            dispatches = self.dispatches(),
            cache_hits = self.cache_hits(),
            releases_completed = self.releases_completed(),
            releases_failed = self.releases_failed(),
        );
    }

    pub fn events_handled(&self) -> u64 {
        self.events_handled.load(Ordering::Relaxed)
    }

    pub fn dispatches(&self) -> u64 {
        self.dispatches.load(Ordering::Relaxed)
    }

    pub fn cache_hits(&self) -> u64 {
        self.cache_hits.load(Ordering::Relaxed)
    }

    pub fn releases_completed(&self) -> u64 {
        self.releases_completed.load(Ordering::Relaxed)
    }

    pub fn releases_failed(&self) -> u64 {
        self.releases_failed.load(Ordering::Relaxed)
    }

    /// Reset all counters to zero (useful in tests).
    pub fn reset(&self) {
        self.events_handled.store(0, Ordering::Relaxed);
        self.dispatches.store(0, Ordering::Relaxed);
        self.cache_hits.store(0, Ordering::Relaxed);
        self.releases_completed.store(0, Ordering::Relaxed);
        self.releases_failed.store(0, Ordering::Relaxed);
    }
}
