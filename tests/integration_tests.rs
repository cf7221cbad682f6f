//! End-to-end tests for flowtap: segments in, entries out.

use crossbeam::channel::{self, Receiver};
use dashmap::DashMap;
use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use flowtap::api::{
    CaptureSource, ChannelEmitter, Emitter, OutputChannelItem, StreamHandle,
    TrafficFilteringOptions,
};
use flowtap::extensions::DissectorRegistry;
use flowtap::network::parser::{TcpFlags, TcpSegment};
use flowtap::network::reassembly::Assembler;
use flowtap::tap::stats::TapStats;
use flowtap::tap::stream_factory::{DissectorSpawner, TapTargets, TcpStreamFactory};
use flowtap::tap::streams_map::TcpStreamMap;
use flowtap::tap::tcp_stream::TcpStream;

const CLIENT: &str = "10.0.0.1";
const SERVER: &str = "10.0.0.2";

struct Pipeline {
    assembler: Assembler<TcpStreamFactory>,
    streams_map: Arc<TcpStreamMap>,
    registry: Arc<DissectorRegistry>,
    items: Receiver<OutputChannelItem>,
}

fn pipeline(ports: Vec<u16>) -> Pipeline {
    let (tx, items) = channel::bounded(16);
    let emitter: Arc<dyn Emitter> = Arc::new(ChannelEmitter::new(tx, Duration::from_secs(1)));
    let stats = Arc::new(TapStats::default());
    let streams_map = Arc::new(TcpStreamMap::new(stats.clone()));
    let registry = Arc::new(DissectorRegistry::default());
    let spawner = DissectorSpawner::new(
        registry.clone(),
        Arc::new(TrafficFilteringOptions::default()),
    );
    let targets = TapTargets {
        ports,
        authorities: HashSet::new(),
        any_direction: false,
        own_ips: [SERVER.parse::<IpAddr>().unwrap()].into_iter().collect(),
    };
    let factory = TcpStreamFactory::new(targets, spawner, streams_map.clone(), emitter, stats);

    Pipeline {
        assembler: Assembler::new(factory),
        streams_map,
        registry,
        items,
    }
}

#[allow(clippy::too_many_arguments)]
fn segment(
    from_client: bool,
    server_port: u16,
    seq: u32,
    flags: TcpFlags,
    payload: &[u8],
    timestamp: SystemTime,
) -> TcpSegment {
    let (src_ip, src_port, dst_ip, dst_port) = if from_client {
        (CLIENT, 40000, SERVER, server_port)
    } else {
        (SERVER, server_port, CLIENT, 40000)
    };
    TcpSegment {
        src_ip: src_ip.parse().unwrap(),
        dst_ip: dst_ip.parse().unwrap(),
        src_port,
        dst_port,
        seq,
        ack: 0,
        flags,
        payload: payload.to_vec(),
        timestamp,
    }
}

fn flags(syn: bool, ack: bool, fin: bool) -> TcpFlags {
    TcpFlags {
        syn,
        ack,
        fin,
        ..Default::default()
    }
}

#[test]
fn test_http_round_trip_through_reassembly() {
    let mut p = pipeline(vec![80]);
    let start = SystemTime::now();
    let later = start + Duration::from_millis(5);
    let now = Instant::now();

    let request = b"GET /index.html HTTP/1.1\r\nHost: example.com\r\n\r\n";
    let response = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello";

    p.assembler
        .assemble(&segment(true, 80, 1000, flags(true, false, false), b"", start), now);
    p.assembler
        .assemble(&segment(false, 80, 5000, flags(true, true, false), b"", start), now);
    assert_eq!(p.streams_map.len(), 1);

    p.assembler
        .assemble(&segment(true, 80, 1001, flags(false, true, false), request, start), now);
    p.assembler
        .assemble(&segment(false, 80, 5001, flags(false, true, false), response, later), now);

    let client_fin = 1001 + request.len() as u32;
    let server_fin = 5001 + response.len() as u32;
    p.assembler
        .assemble(&segment(true, 80, client_fin, flags(false, true, true), b"", later), now);
    p.assembler
        .assemble(&segment(false, 80, server_fin, flags(false, true, true), b"", later), now);

    assert_eq!(p.assembler.stats().connections, 0);
    assert!(p.streams_map.is_empty());
    p.assembler.factory().wait_dissectors();

    let items: Vec<_> = p.items.try_iter().collect();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].capture, CaptureSource::Pcap);

    let entry = p.registry.analyze(&items[0], "", "").unwrap();
    assert_eq!(entry.protocol_id, "http/1.1/HTTP");
    assert!(entry.elapsed_time >= 0);
    assert_eq!(entry.destination.port, "80");
    assert_eq!(entry.request["path"], "/index.html");

    let summary = p.registry.summarize(&entry).unwrap();
    assert_eq!(summary.status, 200);
    assert_eq!(summary.method, "GET");
}

fn amqp_frame(frame_type: u8, channel: u16, payload: &[u8]) -> Vec<u8> {
    let mut out = vec![frame_type];
    out.extend_from_slice(&channel.to_be_bytes());
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(payload);
    out.push(0xce);
    out
}

fn short_string(s: &str) -> Vec<u8> {
    let mut out = vec![s.len() as u8];
    out.extend_from_slice(s.as_bytes());
    out
}

#[test]
fn test_amqp_publish_mid_stream() {
    let mut p = pipeline(vec![5672]);
    let now = Instant::now();

    let mut method = vec![0, 60, 0, 40, 0, 0];
    method.extend(short_string("orders"));
    method.extend(short_string("eu"));
    method.push(0);

    let body = b"{\"id\":1}";
    let mut header = vec![0, 60, 0, 0];
    header.extend_from_slice(&(body.len() as u64).to_be_bytes());
    header.extend_from_slice(&0u16.to_be_bytes());

    let mut publish = b"AMQP\x00\x00\x09\x01".to_vec();
    publish.extend(amqp_frame(1, 1, &method));
    publish.extend(amqp_frame(2, 1, &header));
    publish.extend(amqp_frame(3, 1, body));

    // No handshake seen: the first data segment opens the connection
    p.assembler.assemble(
        &segment(true, 5672, 77, flags(false, true, false), &publish, SystemTime::now()),
        now,
    );
    assert_eq!(p.assembler.flush_all(), 1);
    p.assembler.factory().wait_dissectors();

    let items: Vec<_> = p.items.try_iter().collect();
    assert_eq!(items.len(), 1);
    let entry = p.registry.analyze(&items[0], "", "").unwrap();
    assert_eq!(entry.protocol_id, "amqp/0-9-1/AMQP");
    assert_eq!(entry.destination.port, "5672");
}

#[test]
fn test_untapped_port_is_reassembled_but_not_dissected() {
    let mut p = pipeline(vec![80]);
    let now = Instant::now();
    p.assembler.assemble(
        &segment(true, 22, 1, flags(false, true, false), b"SSH-2.0-OpenSSH_9.6\r\n", SystemTime::now()),
        now,
    );
    assert_eq!(p.assembler.stats().connections, 1);
    assert!(p.streams_map.is_empty());
    p.assembler.flush_all();
    p.assembler.factory().wait_dissectors();
    assert!(p.items.try_iter().next().is_none());
}

#[test]
fn test_stream_map_sweep_drops_only_unidentified_streams() {
    let stats = Arc::new(TapStats::default());
    let map = TcpStreamMap::new(stats.clone());

    let unknown = Arc::new(TcpStream::untapped(map.next_id()));
    let known = Arc::new(TcpStream::untapped(map.next_id()));
    known.set_protocol(&flowtap::extensions::kafka::PROTOCOL);
    map.store(unknown.clone());
    map.store(known.clone());

    assert_eq!(map.sweep(Duration::from_secs(10), Instant::now()), 0);
    let dropped = map.sweep(Duration::from_secs(10), Instant::now() + Duration::from_secs(11));
    assert_eq!(dropped, 1);
    assert!(unknown.is_closed());
    assert!(!known.is_closed());
    assert_eq!(map.len(), 1);
    assert!(map.get(known.id()).is_some());
}

mod tls {
    use super::*;
    use anyhow::{Result, anyhow};
    use flowtap::tlstapper::chunk::{AddressPair, CHUNK_DATA_SIZE};
    use flowtap::tlstapper::fd_cache::FdCache;
    use flowtap::tlstapper::sockfd::SocketResolver;
    use flowtap::tlstapper::{TlsContext, TlsPoller};

    const PID: u32 = 4242;
    const FD: u32 = 9;

    struct OneSocket;

    impl SocketResolver for OneSocket {
        fn address_by_sockfd(&self, pid: u32, fd: u32) -> Result<AddressPair> {
            if (pid, fd) != (PID, FD) {
                return Err(anyhow!("unknown socket"));
            }
            Ok(socket())
        }
    }

    fn socket() -> AddressPair {
        AddressPair {
            src_ip: "10.0.0.5".parse().unwrap(),
            src_port: 51000,
            dst_ip: "93.184.216.34".parse().unwrap(),
            dst_port: 443,
        }
    }

    /// Layout written by the OpenSSL hooks, little endian.
    fn chunk(flags: u32, data: &[u8]) -> Vec<u8> {
        let mut raw = Vec::new();
        for value in [PID, PID, data.len() as u32, 0, data.len() as u32, FD, flags] {
            raw.extend_from_slice(&value.to_le_bytes());
        }
        raw.extend_from_slice(&[0u8; 16]);
        let mut payload = data.to_vec();
        payload.resize(CHUNK_DATA_SIZE, 0);
        raw.extend_from_slice(&payload);
        raw
    }

    fn context() -> (TlsContext, Receiver<OutputChannelItem>) {
        let (tx, rx) = channel::bounded(16);
        let stats = Arc::new(TapStats::default());
        let ctx = TlsContext {
            spawner: DissectorSpawner::new(
                Arc::new(DissectorRegistry::default()),
                Arc::new(TrafficFilteringOptions::default()),
            ),
            streams_map: Arc::new(TcpStreamMap::new(stats.clone())),
            emitter: Arc::new(ChannelEmitter::new(tx, Duration::from_secs(1))),
            stats,
            namespaces: Arc::new(DashMap::new()),
            reader_capacity: 16,
            idle_timeout: Duration::from_secs(30),
        };
        (ctx, rx)
    }

    #[test]
    fn test_client_chunks_become_an_entry() {
        let (ctx, items) = context();
        ctx.namespaces.insert(PID, "checkout".to_string());
        let mut poller = TlsPoller::new(ctx, Box::new(OneSocket), 16);

        // Client write then client read
        poller.handle_raw(&chunk(0b01, b"GET /cart HTTP/1.1\r\nHost: shop\r\n\r\n"));
        poller.handle_raw(&chunk(0b11, b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok"));
        assert_eq!(poller.reader_count(), 2);

        let item = items.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(item.capture, CaptureSource::Ebpf);
        assert_eq!(item.namespace, "checkout");
        assert_eq!(item.protocol.name, "http");
        assert_eq!(item.connection_info.server_port, 443);
    }

    #[test]
    fn test_same_socket_reuses_reader() {
        let (ctx, _items) = context();
        let mut poller = TlsPoller::new(ctx, Box::new(OneSocket), 16);

        poller.handle_raw(&chunk(0b01, b"GET / HTTP/1.1\r\n"));
        let first = poller.reader(&socket().key()).unwrap();
        poller.handle_raw(&chunk(0b01, b"Host: shop\r\n\r\n"));
        let second = poller.reader(&socket().key()).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_fd_cache_stays_bounded() {
        let stats = Arc::new(TapStats::default());
        let mut cache = FdCache::new(100, stats);
        for fd in 0..150 {
            cache.insert(FdCache::key(PID, fd), socket());
        }
        assert_eq!(cache.len(), 100);
        assert_eq!(cache.evicted(), 50);
    }
}
