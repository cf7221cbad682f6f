//! Go `crypto/tls` connections observed through the runtime hooks.

use crossbeam::channel::{self, Receiver};
use hashlink::LinkedHashMap;
use log::{debug, info, warn};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime};

use super::TlsContext;
use super::chunk::GolangReadWrite;
use super::sockfd::SocketResolver;
use crate::api::{CaptureSource, CounterPair, StreamHandle};
use crate::network::reassembly::Direction;
use crate::tap::stats::TapStats;
use crate::tap::tcp_reader::{DirectionalReader, ReaderChunk};
use crate::tap::tcp_stream::TcpStream;

struct GolangConnection {
    stream: Arc<TcpStream>,
    /// Held until the first request resolves the socket address
    pending: Option<(Receiver<ReaderChunk>, Receiver<ReaderChunk>)>,
    gzipped: bool,
}

/// Tracks Go TLS connections in arrival order, oldest evicted past the limit.
pub struct GolangPoller {
    ctx: TlsContext,
    resolver: Box<dyn SocketResolver>,
    connections: LinkedHashMap<u64, GolangConnection>,
    limit: usize,
}

impl GolangPoller {
    pub fn new(ctx: TlsContext, resolver: Box<dyn SocketResolver>, limit: usize) -> Self {
        Self {
            ctx,
            resolver,
            connections: LinkedHashMap::new(),
            limit: limit.max(1),
        }
    }

    pub fn run(mut self, events: Receiver<Vec<u8>>, should_stop: Arc<AtomicBool>) {
        info!("Go TLS poller started");
        while !should_stop.load(Ordering::Relaxed) {
            match events.recv_timeout(Duration::from_millis(100)) {
                Ok(raw) => match GolangReadWrite::parse(&raw) {
                    Ok(event) => self.handle_event(event),
                    Err(e) => warn!("Invalid Go TLS event: {}", e),
                },
                Err(channel::RecvTimeoutError::Timeout) => continue,
                Err(channel::RecvTimeoutError::Disconnected) => break,
            }
        }

        for (_, connection) in self.connections.drain() {
            close(&self.ctx, &connection);
        }
        debug!("Go TLS poller stopped");
    }

    pub fn handle_event(&mut self, event: GolangReadWrite) {
        TapStats::incr(&self.ctx.stats.tls_chunks);
        let id = event.connection_id();

        if !self.connections.contains_key(&id) {
            if self.connections.len() >= self.limit
                && let Some((oldest, connection)) = self.connections.pop_front()
            {
                debug!("Go TLS connection {:x} evicted", oldest);
                close(&self.ctx, &connection);
            }
            let connection = self.new_connection();
            self.connections.insert(id, connection);
        }
        let Some(connection) = self.connections.get_mut(&id) else {
            return;
        };
        connection.gzipped |= event.is_gzip_chunk;

        let direction = if event.is_request {
            if let Some((client_rx, server_rx)) = connection.pending.take() {
                match self.resolver.address_by_sockfd(event.pid, event.fd) {
                    Ok(pair) => {
                        let tcp_id = pair.tcp_id();
                        let namespace = self.ctx.namespace(event.pid);
                        let stream = &connection.stream;
                        let counter_pair = Arc::new(CounterPair::default());
                        let reader = |tcp_id, is_client, rx| {
                            DirectionalReader::new(
                                tcp_id,
                                is_client,
                                false,
                                CaptureSource::Ebpf,
                                rx,
                                stream.clone(),
                                Arc::clone(&counter_pair),
                                Arc::clone(&self.ctx.emitter),
                            )
                            .with_namespace(namespace.clone())
                        };
                        let client = reader(tcp_id.clone(), true, client_rx);
                        let server = reader(tcp_id.reversed(), false, server_rx);

                        let stream_id = stream.id();
                        debug!(
                            "Go TLS connection {:x} is {} (gzip: {})",
                            id, tcp_id, connection.gzipped
                        );
                        self.ctx
                            .spawner
                            .spawn(format!("go-dissect-{}-client", stream_id), client);
                        self.ctx
                            .spawner
                            .spawn(format!("go-dissect-{}-server", stream_id), server);
                    }
                    Err(e) => {
                        debug!(
                            "Go TLS connection {:x}: socket lookup failed: {}",
                            id, e
                        );
                        connection.pending = Some((client_rx, server_rx));
                        return;
                    }
                }
            }
            Direction::ClientToServer
        } else {
            if connection.pending.is_some() {
                debug!("Go TLS connection {:x}: response before request, dropped", id);
                return;
            }
            Direction::ServerToClient
        };

        let chunk = ReaderChunk::new(event.data, SystemTime::now());
        if !connection.stream.send(direction, chunk) {
            debug!("Go TLS connection {:x}: readers gone", id);
        }
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn contains(&self, id: u64) -> bool {
        self.connections.contains_key(&id)
    }

    fn new_connection(&self) -> GolangConnection {
        let stream_id = self.ctx.streams_map.next_id();
        let (client_tx, client_rx) = channel::bounded(self.ctx.reader_capacity);
        let (server_tx, server_rx) = channel::bounded(self.ctx.reader_capacity);
        let stream = Arc::new(TcpStream::new(stream_id, [client_tx, server_tx]));
        self.ctx.streams_map.store(stream.clone());
        GolangConnection {
            stream,
            pending: Some((client_rx, server_rx)),
            gzipped: false,
        }
    }
}

fn close(ctx: &TlsContext, connection: &GolangConnection) {
    connection.stream.close();
    ctx.streams_map.delete(connection.stream.id());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tlstapper::chunk::AddressPair;
    use crate::tlstapper::chunk::tests::golang_record;
    use crate::tlstapper::tests::{StaticResolver, test_context};

    fn event(pid: u32, conn_addr: u32, is_request: bool, data: &[u8]) -> GolangReadWrite {
        GolangReadWrite::parse(&golang_record(pid, 3, conn_addr, is_request, data)).unwrap()
    }

    fn resolver() -> StaticResolver {
        let resolver = StaticResolver::default();
        resolver.set(
            1,
            3,
            AddressPair {
                src_ip: "10.0.0.5".parse().unwrap(),
                src_port: 51000,
                dst_ip: "10.0.0.9".parse().unwrap(),
                dst_port: 8443,
            },
        );
        resolver
    }

    #[test]
    fn test_oldest_connection_evicted_past_limit() {
        let mut poller = GolangPoller::new(test_context(), Box::new(resolver()), 2);
        for conn_addr in 1..=3 {
            poller.handle_event(event(1, conn_addr, false, b"x"));
        }
        assert_eq!(poller.len(), 2);
        assert!(!poller.contains((1u64 << 32) + 1));
        assert!(poller.contains((1u64 << 32) + 3));
        assert_eq!(poller.ctx.streams_map.len(), 2);
    }

    #[test]
    fn test_request_starts_dissection_once() {
        let mut poller = GolangPoller::new(test_context(), Box::new(resolver()), 8);
        poller.handle_event(event(1, 10, true, b"GET / HTTP/1.1\r\nHost: a\r\n\r\n"));
        poller.handle_event(event(1, 10, true, b"GET /b HTTP/1.1\r\nHost: a\r\n\r\n"));
        poller.handle_event(event(1, 10, false, b"HTTP/1.1 200 OK\r\n"));

        let connection = poller.connections.get(&((1u64 << 32) + 10)).unwrap();
        assert!(connection.pending.is_none());
        assert_eq!(poller.len(), 1);
    }

    #[test]
    fn test_unresolved_request_keeps_connection_pending() {
        let mut poller = GolangPoller::new(test_context(), Box::new(StaticResolver::default()), 8);
        poller.handle_event(event(7, 10, true, b"GET / HTTP/1.1\r\n"));
        let connection = poller.connections.get(&((7u64 << 32) + 10)).unwrap();
        assert!(connection.pending.is_some());
    }
}
