//! Periodic eviction of idle connections and stale matcher entries.

use log::{debug, info};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel;

use crate::extensions::DissectorRegistry;
use crate::network::reassembly::{Assembler, StreamFactory};

/// Totals since the last [`Cleaner::dump_stats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CleanerStats {
    pub flushed: usize,
    pub closed: usize,
    pub deleted: usize,
}

pub struct Cleaner<F: StreamFactory> {
    assembler: Arc<Mutex<Assembler<F>>>,
    registry: Arc<DissectorRegistry>,
    clean_period: Duration,
    connection_timeout: Duration,
    stats: Mutex<CleanerStats>,
}

impl<F> Cleaner<F>
where
    F: StreamFactory + Send + 'static,
{
    pub fn new(
        assembler: Arc<Mutex<Assembler<F>>>,
        registry: Arc<DissectorRegistry>,
        clean_period: Duration,
        connection_timeout: Duration,
    ) -> Self {
        Self {
            assembler,
            registry,
            clean_period,
            connection_timeout,
            stats: Mutex::new(CleanerStats::default()),
        }
    }

    /// One cleaning cycle relative to `now`.
    pub fn clean(&self, now: Instant) {
        let threshold = now.checked_sub(self.connection_timeout).unwrap_or(now);

        let (flushed, closed) = self
            .assembler
            .lock()
            .expect("assembler lock poisoned")
            .flush_close_older_than(threshold);
        let deleted = self.registry.delete_older_than(threshold);

        debug!(
            "Cleaner cycle: {} flushed, {} closed, {} matcher entries deleted",
            flushed, closed, deleted
        );

        let mut stats = self.stats.lock().expect("cleaner stats lock poisoned");
        stats.flushed += flushed;
        stats.closed += closed;
        stats.deleted += deleted;
    }

    /// Counters accumulated since the previous call, then reset.
    pub fn dump_stats(&self) -> CleanerStats {
        std::mem::take(&mut *self.stats.lock().expect("cleaner stats lock poisoned"))
    }

    pub fn start(self: &Arc<Self>, should_stop: Arc<AtomicBool>) -> JoinHandle<()> {
        let cleaner = Arc::clone(self);
        thread::Builder::new()
            .name("cleaner".to_string())
            .spawn(move || {
                info!(
                    "Cleaner started (period: {:?}, connection timeout: {:?})",
                    cleaner.clean_period, cleaner.connection_timeout
                );
                let ticker = channel::tick(cleaner.clean_period);
                while !should_stop.load(Ordering::Relaxed) {
                    match ticker.recv_timeout(Duration::from_millis(100)) {
                        Ok(tick) => cleaner.clean(tick),
                        Err(_) => continue,
                    }
                }
                debug!("Cleaner stopping");
            })
            .expect("Failed to spawn cleaner thread")
    }
}
