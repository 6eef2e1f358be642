// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Server metrics.
//!
//! Counters are updated by the reactor and by handshake workers, and read
//! from any thread through [`ServerMetrics::snapshot`].
//!
//! # Example
//!
//! ```
//! use prototls::ServerMetrics;
//!
//! let metrics = ServerMetrics::new();
//! metrics.record_peer_joined();
//! metrics.record_packet_dispatched();
//!
//! let snapshot = metrics.snapshot();
//! assert_eq!(snapshot.live_peers, 1);
//! assert_eq!(snapshot.packets_dispatched, 1);
//! ```

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

/// Atomic counters for one server.
#[derive(Debug)]
pub struct ServerMetrics {
    // Peers
    peers_joined: AtomicU64,
    peers_left: AtomicU64,
    live_peers: AtomicUsize,
    accept_errors: AtomicU64,

    // Handshakes
    handshakes_started: AtomicU64,
    handshakes_completed: AtomicU64,
    handshakes_failed: AtomicU64,

    // Packets
    packets_dispatched: AtomicU64,
    /// Packets the handler returned from without consuming
    packets_ignored: AtomicU64,

    start_time: Instant,
}

impl ServerMetrics {
    pub fn new() -> Self {
        Self {
            peers_joined: AtomicU64::new(0),
            peers_left: AtomicU64::new(0),
            live_peers: AtomicUsize::new(0),
            accept_errors: AtomicU64::new(0),
            handshakes_started: AtomicU64::new(0),
            handshakes_completed: AtomicU64::new(0),
            handshakes_failed: AtomicU64::new(0),
            packets_dispatched: AtomicU64::new(0),
            packets_ignored: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    // ========================================================================
    // Recording
    // ========================================================================

    pub fn record_peer_joined(&self) {
        self.peers_joined.fetch_add(1, Ordering::Relaxed);
        self.live_peers.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_peer_left(&self) {
        self.peers_left.fetch_add(1, Ordering::Relaxed);
        // Saturate: a stray extra call must not wrap the gauge.
        let _ = self
            .live_peers
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    pub fn record_accept_error(&self) {
        self.accept_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_handshake_started(&self) {
        self.handshakes_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_handshake_completed(&self) {
        self.handshakes_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_handshake_failed(&self) {
        self.handshakes_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_packet_dispatched(&self) {
        self.packets_dispatched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_packet_ignored(&self) {
        self.packets_ignored.fetch_add(1, Ordering::Relaxed);
    }

    // ========================================================================
    // Getters
    // ========================================================================

    pub fn live_peers(&self) -> usize {
        self.live_peers.load(Ordering::Relaxed)
    }

    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Point-in-time copy of every counter.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            peers_joined: self.peers_joined.load(Ordering::Relaxed),
            peers_left: self.peers_left.load(Ordering::Relaxed),
            live_peers: self.live_peers.load(Ordering::Relaxed),
            accept_errors: self.accept_errors.load(Ordering::Relaxed),
            handshakes_started: self.handshakes_started.load(Ordering::Relaxed),
            handshakes_completed: self.handshakes_completed.load(Ordering::Relaxed),
            handshakes_failed: self.handshakes_failed.load(Ordering::Relaxed),
            packets_dispatched: self.packets_dispatched.load(Ordering::Relaxed),
            packets_ignored: self.packets_ignored.load(Ordering::Relaxed),
            uptime: self.uptime(),
        }
    }
}

impl Default for ServerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Plain copy of [`ServerMetrics`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "json", derive(serde::Serialize))]
pub struct MetricsSnapshot {
    pub peers_joined: u64,
    pub peers_left: u64,
    pub live_peers: usize,
    pub accept_errors: u64,
    pub handshakes_started: u64,
    pub handshakes_completed: u64,
    pub handshakes_failed: u64,
    pub packets_dispatched: u64,
    pub packets_ignored: u64,
    pub uptime: Duration,
}

impl MetricsSnapshot {
    /// Handshakes submitted but not yet resolved either way.
    pub fn handshakes_in_flight(&self) -> u64 {
        self.handshakes_started
            .saturating_sub(self.handshakes_completed + self.handshakes_failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_gauge() {
        let metrics = ServerMetrics::new();
        metrics.record_peer_joined();
        metrics.record_peer_joined();
        metrics.record_peer_left();
        assert_eq!(metrics.live_peers(), 1);

        metrics.record_peer_left();
        metrics.record_peer_left();
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.live_peers, 0);
        assert_eq!(snapshot.peers_joined, 2);
        assert_eq!(snapshot.peers_left, 3);
    }

    #[test]
    fn test_handshakes_in_flight() {
        let metrics = ServerMetrics::new();
        for _ in 0..5 {
            metrics.record_handshake_started();
        }
        metrics.record_handshake_completed();
        metrics.record_handshake_failed();
        assert_eq!(metrics.snapshot().handshakes_in_flight(), 3);
    }

    #[test]
    fn test_counters_from_threads() {
        let metrics = std::sync::Arc::new(ServerMetrics::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let metrics = std::sync::Arc::clone(&metrics);
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        metrics.record_packet_dispatched();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(metrics.snapshot().packets_dispatched, 4000);
    }
}
