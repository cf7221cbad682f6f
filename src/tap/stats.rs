//! Process-wide tap counters.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters updated lock-free from the capture, poller and dissector threads
#[derive(Debug, Default)]
pub struct TapStats {
    pub packets: AtomicU64,
    pub tcp_packets: AtomicU64,
    pub processed_bytes: AtomicU64,
    pub live_streams: AtomicU64,
    pub dropped_streams: AtomicU64,
    pub tls_chunks: AtomicU64,
    pub lost_samples: AtomicU64,
    pub fd_cache_evictions: AtomicU64,
}

/// Point-in-time copy of [`TapStats`] plus the output counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TapStatsSnapshot {
    pub packets: u64,
    pub tcp_packets: u64,
    pub processed_bytes: u64,
    pub live_streams: u64,
    pub dropped_streams: u64,
    pub emitted_items: u64,
    pub dropped_items: u64,
    pub unmatched_responses: u64,
    pub tls_chunks: u64,
    pub lost_samples: u64,
    pub fd_cache_evictions: u64,
}

impl TapStats {
    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn decr(counter: &AtomicU64) {
        // Never wraps below zero
        let _ = counter.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
            Some(v.saturating_sub(1))
        });
    }

    /// Copy of the counters kept here; output counters are filled in by the caller.
    pub fn snapshot(&self) -> TapStatsSnapshot {
        TapStatsSnapshot {
            packets: self.packets.load(Ordering::Relaxed),
            tcp_packets: self.tcp_packets.load(Ordering::Relaxed),
            processed_bytes: self.processed_bytes.load(Ordering::Relaxed),
            live_streams: self.live_streams.load(Ordering::Relaxed),
            dropped_streams: self.dropped_streams.load(Ordering::Relaxed),
            tls_chunks: self.tls_chunks.load(Ordering::Relaxed),
            lost_samples: self.lost_samples.load(Ordering::Relaxed),
            fd_cache_evictions: self.fd_cache_evictions.load(Ordering::Relaxed),
            ..Default::default()
        }
    }
}
