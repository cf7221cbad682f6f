//! Registry of live streams with periodic eviction of unclassified ones.

use crossbeam::channel;
use dashmap::DashMap;
use log::{debug, info};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::api::StreamHandle;
use crate::tap::stats::TapStats;

/// Concurrent id -> stream registry
pub struct TcpStreamMap {
    streams: DashMap<u64, Arc<dyn StreamHandle>>,
    next_id: AtomicU64,
    stats: Arc<TapStats>,
}

impl TcpStreamMap {
    pub fn new(stats: Arc<TapStats>) -> Self {
        Self {
            streams: DashMap::new(),
            next_id: AtomicU64::new(0),
            stats,
        }
    }

    /// Allocate a stream id, strictly increasing from 1
    pub fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn store(&self, stream: Arc<dyn StreamHandle>) {
        if self.streams.insert(stream.id(), stream).is_none() {
            TapStats::incr(&self.stats.live_streams);
        }
    }

    pub fn delete(&self, id: u64) {
        if self.streams.remove(&id).is_some() {
            TapStats::decr(&self.stats.live_streams);
        }
    }

    pub fn get(&self, id: u64) -> Option<Arc<dyn StreamHandle>> {
        self.streams.get(&id).map(|s| Arc::clone(s.value()))
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    /// Visit every stream until `f` returns false.
    pub fn range(&self, mut f: impl FnMut(u64, &Arc<dyn StreamHandle>) -> bool) {
        for entry in self.streams.iter() {
            if !f(*entry.key(), entry.value()) {
                break;
            }
        }
    }

    /// Close and remove streams still unclassified `timeout` after creation.
    ///
    /// Identified streams are never evicted here. Returns the number dropped.
    pub fn sweep(&self, timeout: Duration, now: Instant) -> usize {
        let mut dropped = 0;
        self.streams.retain(|id, stream| {
            let stale = stream.protocol().is_none()
                && !stream.is_closed()
                && now.saturating_duration_since(stream.created_at()) > timeout;
            if stale {
                debug!("Dropping unidentified stream {} after {:?}", id, timeout);
                stream.close();
                dropped += 1;
            }
            !stale
        });

        if dropped > 0 {
            TapStats::add(&self.stats.dropped_streams, dropped as u64);
            for _ in 0..dropped {
                TapStats::decr(&self.stats.live_streams);
            }
        }
        dropped
    }

    /// Run [`sweep`](Self::sweep) every `interval` until `should_stop` is set.
    pub fn start_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        timeout: Duration,
        should_stop: Arc<AtomicBool>,
    ) -> JoinHandle<()> {
        let map = Arc::clone(self);
        thread::Builder::new()
            .name("stream-sweeper".to_string())
            .spawn(move || {
                info!(
                    "Stream sweeper started (interval: {:?}, timeout: {:?})",
                    interval, timeout
                );
                let ticker = channel::tick(interval);
                while !should_stop.load(Ordering::Relaxed) {
                    if ticker.recv_timeout(Duration::from_millis(100)).is_err() {
                        continue;
                    }
                    let dropped = map.sweep(timeout, Instant::now());
                    if dropped > 0 {
                        debug!("Sweep dropped {} streams, {} live", dropped, map.len());
                    }
                }
                debug!("Stream sweeper stopping");
            })
            .expect("Failed to spawn stream sweeper thread")
    }
}
