// src/metrics.rs
use std::sync::atomic::{AtomicUsize, Ordering};

/// Shared counters, cache-line aligned. Updated with relaxed ordering; they
/// are informational and never coordinate the engine.
#[repr(C, align(64))]
pub struct ServerMetrics {
    pub requests_served: AtomicUsize,
    pub active_conns: AtomicUsize,
    pub bytes_sent: AtomicUsize,
    pub conns_rejected: AtomicUsize,
}

impl ServerMetrics {
    pub fn new() -> Self {
        Self {
            requests_served: AtomicUsize::new(0),
            active_conns: AtomicUsize::new(0),
            bytes_sent: AtomicUsize::new(0),
            conns_rejected: AtomicUsize::new(0),
        }
    }

    pub fn inc_req(&self) {
        self.requests_served.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_conn(&self) {
        self.active_conns.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec_conn(&self) {
        self.active_conns.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn add_bytes(&self, bytes: usize) {
        self.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn inc_rejected(&self) {
        self.conns_rejected.fetch_add(1, Ordering::Relaxed);
    }
}

impl Default for ServerMetrics {
    fn default() -> Self {
        Self::new()
    }
}
