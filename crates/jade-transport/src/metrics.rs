//! Transfer accounting for an agent listener.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use serde::Serialize;

#[derive(Debug, Clone, Default, Serialize)]
/// Snapshot of transfer metrics at a point in time.
pub struct MetricsSnapshot {
    /// Connections accepted by the listener.
    pub connections_accepted: u64,
    /// Connections currently being served.
    pub active_connections: u32,
    /// PING requests answered.
    pub pings_served: u64,
    /// PERSIST_DATA requests that completed.
    pub persists_served: u64,
    /// RETRIEVE_DATA requests that completed.
    pub retrieves_served: u64,
    /// Transfers that ended with an error response or a dropped connection.
    pub transfers_failed: u64,
    /// Data bytes received from peers.
    pub bytes_in: u64,
    /// Data bytes sent to peers.
    pub bytes_out: u64,
    /// Requests rejected by token validation.
    pub auth_failures: u64,
    /// Connections dropped after too many read timeouts.
    pub timeouts: u64,
}

/// Thread-safe transfer metrics collector.
#[derive(Debug, Default)]
pub struct TransferMetrics {
    connections_accepted: AtomicU64,
    active_connections: AtomicU32,
    pings_served: AtomicU64,
    persists_served: AtomicU64,
    retrieves_served: AtomicU64,
    transfers_failed: AtomicU64,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    auth_failures: AtomicU64,
    timeouts: AtomicU64,
}

impl TransferMetrics {
    /// Creates a collector with every counter at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an accepted connection.
    pub fn connection_opened(&self) {
        self.connections_accepted.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a connection going away.
    pub fn connection_closed(&self) {
        let _ = self
            .active_connections
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| Some(v.saturating_sub(1)));
    }

    /// Counts an answered PING.
    pub fn inc_pings(&self) {
        self.pings_served.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts a completed persist.
    pub fn inc_persists(&self) {
        self.persists_served.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts a completed retrieve.
    pub fn inc_retrieves(&self) {
        self.retrieves_served.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts a failed transfer.
    pub fn inc_failures(&self) {
        self.transfers_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts a rejected token.
    pub fn inc_auth_failures(&self) {
        self.auth_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts a connection dropped on timeouts.
    pub fn inc_timeouts(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    /// Adds to the received data bytes.
    pub fn add_bytes_in(&self, bytes: u64) {
        self.bytes_in.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Adds to the sent data bytes.
    pub fn add_bytes_out(&self, bytes: u64) {
        self.bytes_out.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Takes a snapshot of all current metric values.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connections_accepted: self.connections_accepted.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            pings_served: self.pings_served.load(Ordering::Relaxed),
            persists_served: self.persists_served.load(Ordering::Relaxed),
            retrieves_served: self.retrieves_served.load(Ordering::Relaxed),
            transfers_failed: self.transfers_failed.load(Ordering::Relaxed),
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
            auth_failures: self.auth_failures.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_is_zero() {
        let snapshot = TransferMetrics::new().snapshot();
        assert_eq!(snapshot.connections_accepted, 0);
        assert_eq!(snapshot.active_connections, 0);
        assert_eq!(snapshot.bytes_in, 0);
    }

    #[test]
    fn test_connection_lifecycle() {
        let metrics = TransferMetrics::new();
        metrics.connection_opened();
        metrics.connection_opened();
        metrics.connection_closed();
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.connections_accepted, 2);
        assert_eq!(snapshot.active_connections, 1);
    }

    #[test]
    fn test_close_does_not_underflow() {
        let metrics = TransferMetrics::new();
        metrics.connection_closed();
        assert_eq!(metrics.snapshot().active_connections, 0);
    }

    #[test]
    fn test_counters() {
        let metrics = TransferMetrics::new();
        metrics.inc_pings();
        metrics.inc_persists();
        metrics.inc_retrieves();
        metrics.inc_retrieves();
        metrics.inc_failures();
        metrics.inc_auth_failures();
        metrics.inc_timeouts();
        metrics.add_bytes_in(10);
        metrics.add_bytes_out(7);
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.pings_served, 1);
        assert_eq!(snapshot.persists_served, 1);
        assert_eq!(snapshot.retrieves_served, 2);
        assert_eq!(snapshot.transfers_failed, 1);
        assert_eq!(snapshot.auth_failures, 1);
        assert_eq!(snapshot.timeouts, 1);
        assert_eq!(snapshot.bytes_in, 10);
        assert_eq!(snapshot.bytes_out, 7);
    }

    #[test]
    fn test_snapshot_serializes() {
        let metrics = TransferMetrics::new();
        metrics.add_bytes_in(3);
        let json = serde_json::to_string(&metrics.snapshot()).unwrap();
        assert!(json.contains("\"bytes_in\":3"));
    }
}
