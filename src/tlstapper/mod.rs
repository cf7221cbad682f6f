//! Plaintext capture of TLS traffic through user-space hooks.
//!
//! The kernel side records SSL_read/SSL_write buffers (and Go `crypto/tls`
//! reads and writes). [`TlsPoller`] and [`GolangPoller`] turn those records
//! into dissector readers, the same readers reassembled TCP streams use.

pub mod chunk;
pub mod fd_cache;
pub mod golang;
#[cfg(all(target_os = "linux", feature = "ebpf"))]
pub mod loader;
pub mod poller;
pub mod sockfd;

use anyhow::Result;
use crossbeam::channel;
use dashmap::DashMap;
use log::info;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

pub use golang::GolangPoller;
pub use poller::{ChunkEvent, TlsPoller};

use crate::api::Emitter;
use crate::config::TapConfig;
use crate::tap::stats::TapStats;
use crate::tap::stream_factory::DissectorSpawner;
use crate::tap::streams_map::TcpStreamMap;
use sockfd::ProcfsResolver;

/// Namespace reported for processes nobody registered
pub const UNKNOWN_NAMESPACE: &str = "unknown";

const CHUNK_QUEUE_CAPACITY: usize = 4096;
const GOLANG_QUEUE_CAPACITY: usize = 256;

/// What both pollers need to create readers
#[derive(Clone)]
pub struct TlsContext {
    pub spawner: DissectorSpawner,
    pub streams_map: Arc<TcpStreamMap>,
    pub emitter: Arc<dyn Emitter>,
    pub stats: Arc<TapStats>,
    pub namespaces: Arc<DashMap<u32, String>>,
    pub reader_capacity: usize,
    pub idle_timeout: Duration,
}

impl TlsContext {
    pub fn namespace(&self, pid: u32) -> String {
        self.namespaces
            .get(&pid)
            .map(|ns| ns.value().clone())
            .unwrap_or_else(|| UNKNOWN_NAMESPACE.to_string())
    }
}

pub struct TlsTapper {
    namespaces: Arc<DashMap<u32, String>>,
    should_stop: Arc<AtomicBool>,
    threads: Vec<JoinHandle<()>>,
}

impl TlsTapper {
    /// Attach the hooks and start both pollers.
    pub fn start(config: &TapConfig, ctx: TlsContext) -> Result<Self> {
        let should_stop = Arc::new(AtomicBool::new(false));
        let (chunk_tx, chunk_rx) = channel::bounded(CHUNK_QUEUE_CAPACITY);
        let (golang_tx, golang_rx) = channel::bounded(GOLANG_QUEUE_CAPACITY);

        let hooks = start_hooks(config, chunk_tx, golang_tx, Arc::clone(&should_stop))?;
        let mut threads = vec![hooks];

        let poller = TlsPoller::new(
            ctx.clone(),
            Box::new(ProcfsResolver::new(&config.procfs)),
            config.fd_cache_capacity,
        );
        let stop = Arc::clone(&should_stop);
        threads.push(
            thread::Builder::new()
                .name("tls-poller".to_string())
                .spawn(move || poller.run(chunk_rx, stop))
                .expect("Failed to spawn TLS poller thread"),
        );

        let golang = GolangPoller::new(
            ctx.clone(),
            Box::new(ProcfsResolver::new(&config.procfs)),
            config.golang_map_limit,
        );
        let stop = Arc::clone(&should_stop);
        threads.push(
            thread::Builder::new()
                .name("tls-golang-poller".to_string())
                .spawn(move || golang.run(golang_rx, stop))
                .expect("Failed to spawn Go TLS poller thread"),
        );

        info!("TLS tapper started");
        Ok(Self {
            namespaces: ctx.namespaces,
            should_stop,
            threads,
        })
    }

    /// Attribute traffic of `pid` to `namespace`.
    pub fn add_pid(&self, pid: u32, namespace: impl Into<String>) {
        self.namespaces.insert(pid, namespace.into());
    }

    pub fn clear_pids(&self) {
        self.namespaces.clear();
    }

    pub fn stop(&mut self) {
        self.should_stop.store(true, Ordering::Relaxed);
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
        info!("TLS tapper stopped");
    }
}

#[cfg(all(target_os = "linux", feature = "ebpf"))]
fn start_hooks(
    config: &TapConfig,
    chunks: channel::Sender<ChunkEvent>,
    golang: channel::Sender<Vec<u8>>,
    should_stop: Arc<AtomicBool>,
) -> Result<JoinHandle<()>> {
    let object = config
        .tls_bpf_object
        .clone()
        .ok_or_else(|| anyhow::anyhow!("TLS tapping needs tls_bpf_object"))?;
    loader::spawn_hooks(
        object,
        config.tls_perf_buffer_pages,
        chunks,
        golang,
        should_stop,
    )
}

#[cfg(not(all(target_os = "linux", feature = "ebpf")))]
fn start_hooks(
    _config: &TapConfig,
    _chunks: channel::Sender<ChunkEvent>,
    _golang: channel::Sender<Vec<u8>>,
    _should_stop: Arc<AtomicBool>,
) -> Result<JoinHandle<()>> {
    Err(anyhow::anyhow!(
        "TLS tapping is not available: built without the ebpf feature"
    ))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::api::TrafficFilteringOptions;
    use crate::extensions::DissectorRegistry;
    use crate::tap::tcp_reader::tests::CollectingEmitter;
    use crate::tlstapper::chunk::AddressPair;
    use crate::tlstapper::sockfd::SocketResolver;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Resolver answering from a table the test can change.
    #[derive(Clone, Default)]
    pub(crate) struct StaticResolver {
        sockets: Arc<Mutex<HashMap<(u32, u32), AddressPair>>>,
    }

    impl StaticResolver {
        pub(crate) fn set(&self, pid: u32, fd: u32, pair: AddressPair) {
            self.sockets.lock().unwrap().insert((pid, fd), pair);
        }

        pub(crate) fn clear(&self) {
            self.sockets.lock().unwrap().clear();
        }
    }

    impl SocketResolver for StaticResolver {
        fn address_by_sockfd(&self, pid: u32, fd: u32) -> Result<AddressPair> {
            self.sockets
                .lock()
                .unwrap()
                .get(&(pid, fd))
                .copied()
                .ok_or_else(|| anyhow::anyhow!("no socket"))
        }
    }

    pub(crate) fn test_context() -> TlsContext {
        let stats = Arc::new(TapStats::default());
        TlsContext {
            spawner: DissectorSpawner::new(
                Arc::new(DissectorRegistry::default()),
                Arc::new(TrafficFilteringOptions::default()),
            ),
            streams_map: Arc::new(TcpStreamMap::new(stats.clone())),
            emitter: Arc::new(CollectingEmitter::default()),
            stats,
            namespaces: Arc::new(DashMap::new()),
            reader_capacity: 16,
            idle_timeout: Duration::from_secs(30),
        }
    }

    #[test]
    fn test_namespace_lookup() {
        let ctx = test_context();
        let tapper = TlsTapper {
            namespaces: Arc::clone(&ctx.namespaces),
            should_stop: Arc::new(AtomicBool::new(false)),
            threads: Vec::new(),
        };
        assert_eq!(ctx.namespace(42), UNKNOWN_NAMESPACE);
        tapper.add_pid(42, "payments");
        assert_eq!(ctx.namespace(42), "payments");
        tapper.clear_pids();
        assert_eq!(ctx.namespace(42), UNKNOWN_NAMESPACE);
    }

    #[cfg(not(all(target_os = "linux", feature = "ebpf")))]
    #[test]
    fn test_start_without_ebpf_fails() {
        let config = TapConfig {
            tls: true,
            ..Default::default()
        };
        assert!(TlsTapper::start(&config, test_context()).is_err());
    }
}
