use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Lock-free counters of one connection.
///
/// Frame counters cover every socket the connection has owned, across
/// reconnects.
#[derive(Debug, Default)]
pub struct ConnectionStats {
    frames_sent: AtomicU64,
    bytes_sent: AtomicU64,
    frames_received: AtomicU64,
    bytes_received: AtomicU64,
    reconnect_attempts: AtomicU64,
    reconnects: AtomicU64,
}

impl ConnectionStats {
    pub(crate) fn record_sent(&self, (frames, bytes): (u64, u64)) {
        self.frames_sent.fetch_add(frames, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn record_received(&self, (frames, bytes): (u64, u64)) {
        self.frames_received.fetch_add(frames, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn record_reconnect_attempt(&self) {
        self.reconnect_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    /// Point-in-time copy of every counter.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            reconnect_attempts: self.reconnect_attempts.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub frames_sent: u64,
    pub bytes_sent: u64,
    pub frames_received: u64,
    pub bytes_received: u64,
    pub reconnect_attempts: u64,
    pub reconnects: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let stats = ConnectionStats::default();
        stats.record_sent((2, 20));
        stats.record_sent((1, 4));
        stats.record_received((3, 30));
        stats.record_reconnect_attempt();
        stats.record_reconnect_attempt();
        stats.record_reconnect();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.frames_sent, 3);
        assert_eq!(snapshot.bytes_sent, 24);
        assert_eq!(snapshot.frames_received, 3);
        assert_eq!(snapshot.bytes_received, 30);
        assert_eq!(snapshot.reconnect_attempts, 2);
        assert_eq!(snapshot.reconnects, 1);
    }

    #[test]
    fn test_snapshot_serializes() {
        let json = serde_json::to_value(ConnectionStats::default().snapshot()).unwrap();
        assert_eq!(json["frames_sent"], 0);
        assert_eq!(json["reconnects"], 0);
    }
}
