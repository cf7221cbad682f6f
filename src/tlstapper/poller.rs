//! Routes plaintext chunks from the OpenSSL hooks to per-socket readers.

use crossbeam::channel::{self, Receiver, Sender};
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime};

use super::TlsContext;
use super::chunk::{AddressPair, TlsChunk};
use super::fd_cache::FdCache;
use super::sockfd::SocketResolver;
use crate::api::{CaptureSource, CounterPair, StreamHandle};
use crate::network::reassembly::Direction;
use crate::tap::stats::TapStats;
use crate::tap::tcp_reader::{DirectionalReader, ReaderChunk};
use crate::tap::tcp_stream::TcpStream;

/// Closed reader keys queued before close notifications are dropped
const CLOSED_READERS_CAPACITY: usize = 100;

/// What the perf buffer delivers
#[derive(Debug)]
pub enum ChunkEvent {
    Sample(Vec<u8>),
    Lost(u64),
}

pub struct TlsPoller {
    ctx: TlsContext,
    resolver: Box<dyn SocketResolver>,
    fd_cache: FdCache,
    readers: HashMap<String, Arc<TcpStream>>,
    closed_tx: Sender<String>,
    closed_rx: Receiver<String>,
}

impl TlsPoller {
    pub fn new(ctx: TlsContext, resolver: Box<dyn SocketResolver>, fd_cache_capacity: usize) -> Self {
        let (closed_tx, closed_rx) = channel::bounded(CLOSED_READERS_CAPACITY);
        let fd_cache = FdCache::new(fd_cache_capacity, Arc::clone(&ctx.stats));
        Self {
            ctx,
            resolver,
            fd_cache,
            readers: HashMap::new(),
            closed_tx,
            closed_rx,
        }
    }

    /// Consume `events` until the producer goes away or `should_stop` is set.
    pub fn run(mut self, events: Receiver<ChunkEvent>, should_stop: Arc<AtomicBool>) {
        info!("TLS poller started");
        let closed_rx = self.closed_rx.clone();

        while !should_stop.load(Ordering::Relaxed) {
            channel::select! {
                recv(events) -> event => match event {
                    Ok(ChunkEvent::Sample(raw)) => self.handle_raw(&raw),
                    Ok(ChunkEvent::Lost(count)) => self.handle_lost(count),
                    Err(_) => {
                        info!("TLS chunk source closed");
                        break;
                    }
                },
                recv(closed_rx) -> key => {
                    if let Ok(key) = key {
                        self.remove_reader(&key);
                    }
                },
                default(Duration::from_millis(100)) => {}
            }
        }

        self.close_all();
        debug!("TLS poller stopped");
    }

    pub fn handle_raw(&mut self, raw: &[u8]) {
        match TlsChunk::parse(raw) {
            Ok(chunk) => self.handle_chunk(chunk),
            Err(e) => warn!("Invalid TLS chunk: {}", e),
        }
    }

    pub fn handle_lost(&self, count: u64) {
        TapStats::add(&self.ctx.stats.lost_samples, count);
        warn!("TLS perf buffer lost {} samples", count);
    }

    /// Hand one chunk to the reader of its socket, creating the reader if needed.
    pub fn handle_chunk(&mut self, chunk: TlsChunk) {
        TapStats::incr(&self.ctx.stats.tls_chunks);
        self.drain_closed();

        let Some(pair) = self.resolve(&chunk) else {
            error!(
                "Dropping TLS chunk of pid {} fd {}: no address",
                chunk.pid, chunk.fd
            );
            return;
        };

        let key = pair.key();
        let stream = self.reader_for(&key, &pair, &chunk);
        let data = ReaderChunk::new(chunk.data, SystemTime::now());
        if !stream.send(Direction::ClientToServer, data) {
            debug!("TLS reader {} is gone, chunk dropped", key);
            stream.close();
            self.remove_reader(&key);
        }
    }

    pub fn reader(&self, key: &str) -> Option<Arc<TcpStream>> {
        self.readers.get(key).cloned()
    }

    pub fn reader_count(&self) -> usize {
        self.readers.len()
    }

    /// Forget readers whose streams reported closing.
    pub fn drain_closed(&mut self) {
        while let Ok(key) = self.closed_rx.try_recv() {
            self.remove_reader(&key);
        }
    }

    /// procfs first, then the last address seen for the descriptor, then the
    /// address recorded with the chunk.
    fn resolve(&mut self, chunk: &TlsChunk) -> Option<AddressPair> {
        let cache_key = FdCache::key(chunk.pid, chunk.fd);
        let local_first = match self.resolver.address_by_sockfd(chunk.pid, chunk.fd) {
            Ok(pair) => {
                self.fd_cache.insert(cache_key, pair);
                Some(pair)
            }
            Err(e) => {
                debug!("Socket lookup failed for pid {} fd {}: {}", chunk.pid, chunk.fd, e);
                self.fd_cache.get(&cache_key)
            }
        };

        match local_first {
            Some(pair) if chunk.is_request() => Some(pair),
            Some(pair) => Some(pair.reversed()),
            None => chunk.address_pair(),
        }
    }

    fn reader_for(&mut self, key: &str, pair: &AddressPair, chunk: &TlsChunk) -> Arc<TcpStream> {
        if let Some(stream) = self.readers.get(key)
            && !stream.is_closed()
        {
            return Arc::clone(stream);
        }
        if let Some(stale) = self.readers.remove(key) {
            self.ctx.streams_map.delete(stale.id());
        }

        let id = self.ctx.streams_map.next_id();
        let (tx, rx) = channel::bounded(self.ctx.reader_capacity);
        let stream = Arc::new(
            TcpStream::one_way(id, tx).with_close_notifier(self.closed_tx.clone(), key.to_string()),
        );
        self.ctx.streams_map.store(stream.clone());

        let reader = DirectionalReader::new(
            pair.tcp_id(),
            chunk.is_request(),
            false,
            CaptureSource::Ebpf,
            rx,
            stream.clone(),
            Arc::new(CounterPair::default()),
            Arc::clone(&self.ctx.emitter),
        )
        .with_namespace(self.ctx.namespace(chunk.pid))
        .with_idle_timeout(self.ctx.idle_timeout);

        debug!("TLS reader {} created as stream {}", key, id);
        self.ctx.spawner.spawn(format!("tls-dissect-{}", id), reader);
        self.readers.insert(key.to_string(), Arc::clone(&stream));
        stream
    }

    fn remove_reader(&mut self, key: &str) {
        // A replacement may already sit under the same key
        let closed = self.readers.get(key).is_some_and(|s| s.is_closed());
        if closed && let Some(stream) = self.readers.remove(key) {
            self.ctx.streams_map.delete(stream.id());
            debug!("TLS reader {} removed", key);
        }
    }

    fn close_all(&mut self) {
        for (_, stream) in self.readers.drain() {
            stream.close();
            self.ctx.streams_map.delete(stream.id());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tlstapper::chunk::tests::chunk_record;
    use crate::tlstapper::tests::{StaticResolver, test_context};

    const CLIENT: u32 = 1;
    const READ: u32 = 2;

    fn socket() -> AddressPair {
        AddressPair {
            src_ip: "10.0.0.5".parse().unwrap(),
            src_port: 51000,
            dst_ip: "10.0.0.9".parse().unwrap(),
            dst_port: 443,
        }
    }

    fn poller(resolver: &StaticResolver) -> TlsPoller {
        TlsPoller::new(test_context(), Box::new(resolver.clone()), 16)
    }

    #[test]
    fn test_chunks_of_one_socket_share_a_reader() {
        let resolver = StaticResolver::default();
        resolver.set(100, 3, socket());
        let mut poller = poller(&resolver);

        poller.handle_raw(&chunk_record(100, 3, CLIENT, None, b"GET / HTTP/1.1\r\n"));
        let key = socket().key();
        let first = poller.reader(&key).unwrap();
        poller.handle_raw(&chunk_record(100, 3, CLIENT, None, b"Host: a\r\n\r\n"));
        let second = poller.reader(&key).unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(poller.reader_count(), 1);
        assert_eq!(poller.ctx.streams_map.len(), 1);
    }

    #[test]
    fn test_responses_use_the_reversed_pair() {
        let resolver = StaticResolver::default();
        resolver.set(100, 3, socket());
        let mut poller = poller(&resolver);

        poller.handle_raw(&chunk_record(100, 3, CLIENT | READ, None, b"HTTP/1.1 200 OK\r\n"));
        assert!(poller.reader(&socket().reversed().key()).is_some());
        assert!(poller.reader(&socket().key()).is_none());
    }

    #[test]
    fn test_falls_back_to_cache_then_chunk_address() {
        let resolver = StaticResolver::default();
        resolver.set(100, 3, socket());
        let mut poller = poller(&resolver);

        poller.handle_raw(&chunk_record(100, 3, CLIENT, None, b"a"));
        resolver.clear();
        poller.handle_raw(&chunk_record(100, 3, CLIENT, None, b"b"));
        assert_eq!(poller.reader_count(), 1);

        poller.handle_raw(&chunk_record(200, 4, CLIENT, Some(([10, 0, 0, 7], 8443)), b"c"));
        assert!(poller.reader("127.0.0.1:0>10.0.0.7:8443").is_some());

        poller.handle_raw(&chunk_record(300, 5, CLIENT, None, b"d"));
        assert_eq!(poller.reader_count(), 2);
    }

    #[test]
    fn test_closed_reader_is_replaced() {
        let resolver = StaticResolver::default();
        resolver.set(100, 3, socket());
        let mut poller = poller(&resolver);

        poller.handle_raw(&chunk_record(100, 3, CLIENT, None, b"a"));
        let key = socket().key();
        let first = poller.reader(&key).unwrap();
        first.close();
        poller.drain_closed();
        assert_eq!(poller.reader_count(), 0);
        assert!(poller.ctx.streams_map.is_empty());

        poller.handle_raw(&chunk_record(100, 3, CLIENT, None, b"b"));
        let second = poller.reader(&key).unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_lost_samples_are_counted() {
        let poller = poller(&StaticResolver::default());
        poller.handle_lost(7);
        assert_eq!(poller.ctx.stats.lost_samples.load(Ordering::Relaxed), 7);
    }
}
