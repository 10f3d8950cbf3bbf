use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use dashmap::DashMap;
use tokio::time::{Duration, Instant};

use crate::sink::PacketRecord;

#[derive(Debug, Clone)]
pub struct PeerStats {
    pub packets: u64,
    pub bytes: u64,
    pub last_seen: Instant,
}

/// Live in-memory counters over everything the capture has seen.
///
/// Shared between the receive thread and the API; all updates are lock-free.
pub struct CaptureStats {
    pub peers: DashMap<String, PeerStats>, // Key: "src -> dst"
    pub total_packets: AtomicU64,
    pub total_bytes: AtomicU64,
    pub decode_errors: AtomicU64,
    pub active_peers: AtomicUsize,
}

impl CaptureStats {
    pub fn new() -> Self {
        Self {
            peers: DashMap::new(),
            total_packets: AtomicU64::new(0),
            total_bytes: AtomicU64::new(0),
            decode_errors: AtomicU64::new(0),
            active_peers: AtomicUsize::new(0),
        }
    }

    pub fn record(&self, record: &PacketRecord) {
        let key = format!("{} -> {}", record.source, record.destination);

        self.peers
            .entry(key)
            .and_modify(|peer| {
                peer.packets += 1;
                peer.bytes += u64::from(record.length);
                peer.last_seen = Instant::now();
            })
            .or_insert_with(|| {
                self.active_peers.fetch_add(1, Ordering::Relaxed);
                PeerStats {
                    packets: 1,
                    bytes: u64::from(record.length),
                    last_seen: Instant::now(),
                }
            });

        self.total_packets.fetch_add(1, Ordering::Relaxed);
        self.total_bytes
            .fetch_add(u64::from(record.length), Ordering::Relaxed);
    }

    pub fn record_decode_error(&self) {
        self.decode_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Remove peers that haven't been seen for the given duration.
    pub fn cleanup_stale_peers(&self, timeout: Duration) {
        let now = Instant::now();
        let mut to_remove = Vec::new();

        for entry in self.peers.iter() {
            if now.duration_since(entry.value().last_seen) > timeout {
                to_remove.push(entry.key().clone());
            }
        }

        let removed_count = to_remove.len();
        for key in to_remove {
            self.peers.remove(&key);
        }

        if removed_count > 0 {
            self.active_peers.fetch_sub(removed_count, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::net::Ipv4Addr;

    fn record(length: u16) -> PacketRecord {
        PacketRecord {
            timestamp: Utc::now(),
            source: Ipv4Addr::new(10, 0, 0, 1),
            destination: Ipv4Addr::new(10, 0, 0, 2),
            protocol: 6,
            length,
        }
    }

    #[test]
    fn test_record_accumulates_totals() {
        let stats = CaptureStats::new();

        stats.record(&record(100));
        assert_eq!(stats.total_packets.load(Ordering::Relaxed), 1);
        assert_eq!(stats.total_bytes.load(Ordering::Relaxed), 100);
        assert_eq!(stats.active_peers.load(Ordering::Relaxed), 1);

        // Same peer again: totals grow, peer count stays 1.
        stats.record(&record(50));
        assert_eq!(stats.total_packets.load(Ordering::Relaxed), 2);
        assert_eq!(stats.total_bytes.load(Ordering::Relaxed), 150);
        assert_eq!(stats.active_peers.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_decode_errors_counted_separately() {
        let stats = CaptureStats::new();
        stats.record_decode_error();
        stats.record_decode_error();

        assert_eq!(stats.decode_errors.load(Ordering::Relaxed), 2);
        assert_eq!(stats.total_packets.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_cleanup_removes_stale_peers() {
        let stats = CaptureStats::new();
        stats.record(&record(10));

        stats.cleanup_stale_peers(Duration::from_secs(60));
        assert_eq!(stats.active_peers.load(Ordering::Relaxed), 1);

        std::thread::sleep(std::time::Duration::from_millis(5));
        stats.cleanup_stale_peers(Duration::from_millis(1));
        assert_eq!(stats.active_peers.load(Ordering::Relaxed), 0);
        assert!(stats.peers.is_empty());
    }
}
