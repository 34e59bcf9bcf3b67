// src/metrics.rs
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Counters shared by every reactor of one server.
#[repr(C, align(64))]
pub struct Metrics {
    pub req_count: AtomicUsize,
    pub active_conns: AtomicUsize,
    pub bytes_sent: AtomicU64,
    pub upgrades: AtomicUsize,
    pub active_websockets: AtomicUsize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub requests: usize,
    pub active_conns: usize,
    pub bytes_sent: u64,
    pub upgrades: usize,
    pub active_websockets: usize,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            req_count: AtomicUsize::new(0),
            active_conns: AtomicUsize::new(0),
            bytes_sent: AtomicU64::new(0),
            upgrades: AtomicUsize::new(0),
            active_websockets: AtomicUsize::new(0),
        }
    }

    pub fn add_requests(&self, n: usize) {
        self.req_count.fetch_add(n, Ordering::Relaxed);
    }

    pub fn inc_conn(&self) {
        self.active_conns.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec_conn(&self) {
        self.active_conns.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn add_bytes(&self, bytes: u64) {
        self.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn inc_upgrade(&self) {
        self.upgrades.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_websocket(&self) {
        self.active_websockets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec_websocket(&self) {
        self.active_websockets.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            requests: self.req_count.load(Ordering::Relaxed),
            active_conns: self.active_conns.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            upgrades: self.upgrades.load(Ordering::Relaxed),
            active_websockets: self.active_websockets.load(Ordering::Relaxed),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
