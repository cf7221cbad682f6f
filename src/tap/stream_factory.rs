//! Creates a dissection context for every reassembled connection.

use crossbeam::channel;
use crossbeam::sync::WaitGroup;
use log::{debug, error};
use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::SystemTime;

use crate::api::{CaptureSource, CounterPair, Emitter, StreamHandle, TcpId, TcpReader, TrafficFilteringOptions};
use crate::extensions::DissectorRegistry;
use crate::network::is_private_ip;
use crate::network::parser::TcpSegment;
use crate::network::reassembly::{Direction, ReassembledStream, StreamFactory};
use crate::tap::outbound_link::OutboundLinkWriter;
use crate::tap::stats::TapStats;
use crate::tap::streams_map::TcpStreamMap;
use crate::tap::tcp_reader::{DirectionalReader, ReaderChunk};
use crate::tap::tcp_stream::TcpStream;

/// Ports where only links leaving for public addresses are reported
const REMOTE_ONLY_OUTBOUND_PORTS: [u16; 2] = [80, 443];

/// Which connections get dissected
#[derive(Debug, Clone, Default)]
pub struct TapTargets {
    /// Server ports to tap in port mode
    pub ports: Vec<u16>,
    /// `ip` or `ip:port` entries; non-empty switches to host mode
    pub authorities: HashSet<String>,
    /// Also tap connections initiated by the targets
    pub any_direction: bool,
    /// Addresses of this host
    pub own_ips: HashSet<IpAddr>,
}

/// Tap decision for one connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamProps {
    pub is_tapped: bool,
    pub is_outgoing: bool,
}

impl StreamProps {
    const IGNORED: StreamProps = StreamProps {
        is_tapped: false,
        is_outgoing: false,
    };
}

impl TapTargets {
    fn host_mode(&self) -> bool {
        !self.authorities.is_empty()
    }

    /// Decide whether `tcp_id` (client orientation) is tapped.
    pub fn stream_props(&self, tcp_id: &TcpId) -> StreamProps {
        let dst_ip = tcp_id.dst_ip.to_string();

        if self.host_mode() {
            let dst = SocketAddr::new(tcp_id.dst_ip, tcp_id.dst_port).to_string();
            if self.authorities.contains(&dst) || self.authorities.contains(&dst_ip) {
                debug!("Tapping {}: destination is a target", tcp_id);
                return StreamProps {
                    is_tapped: true,
                    is_outgoing: false,
                };
            }
            if self.any_direction && self.authorities.contains(&tcp_id.src_ip.to_string()) {
                debug!("Tapping {}: source is a target", tcp_id);
                return StreamProps {
                    is_tapped: true,
                    is_outgoing: true,
                };
            }
            return StreamProps::IGNORED;
        }

        if !self.ports.contains(&tcp_id.dst_port) {
            return StreamProps::IGNORED;
        }
        let is_outgoing = !self.own_ips.contains(&tcp_id.dst_ip);
        if !self.any_direction && is_outgoing {
            return StreamProps {
                is_tapped: false,
                is_outgoing,
            };
        }
        debug!("Tapping {} (outgoing: {})", tcp_id, is_outgoing);
        StreamProps {
            is_tapped: true,
            is_outgoing,
        }
    }

    /// Whether a TLS server name seen towards `dst_ip:dst_port` is worth reporting.
    pub fn should_notify_outbound_link(&self, dst_ip: &IpAddr, dst_port: u16) -> bool {
        if REMOTE_ONLY_OUTBOUND_PORTS.contains(&dst_port) {
            let directed_here = self.own_ips.contains(dst_ip);
            return !directed_here && !is_private_ip(dst_ip);
        }
        true
    }
}

/// Starts dissector threads and lets the owner wait for them.
#[derive(Clone)]
pub struct DissectorSpawner {
    registry: Arc<DissectorRegistry>,
    options: Arc<TrafficFilteringOptions>,
    wait_group: Arc<Mutex<WaitGroup>>,
}

impl DissectorSpawner {
    pub fn new(registry: Arc<DissectorRegistry>, options: Arc<TrafficFilteringOptions>) -> Self {
        Self {
            registry,
            options,
            wait_group: Arc::new(Mutex::new(WaitGroup::new())),
        }
    }

    pub fn registry(&self) -> &Arc<DissectorRegistry> {
        &self.registry
    }

    /// Dissect `reader` on its own thread until end of stream.
    pub fn spawn<R: TcpReader + 'static>(&self, name: String, reader: R) {
        let registry = Arc::clone(&self.registry);
        let options = Arc::clone(&self.options);
        let wg = self
            .wait_group
            .lock()
            .expect("dissector wait group lock poisoned")
            .clone();

        let spawned = thread::Builder::new().name(name.clone()).spawn(move || {
            registry.dissect(reader, &options);
            drop(wg);
        });
        if let Err(e) = spawned {
            error!("Failed to spawn dissector thread {}: {}", name, e);
        }
    }

    /// Block until every dissector started so far has finished.
    pub fn wait(&self) {
        let wg = std::mem::take(
            &mut *self
                .wait_group
                .lock()
                .expect("dissector wait group lock poisoned"),
        );
        wg.wait();
    }
}

/// Builds [`TapConnection`]s for the assembler
pub struct TcpStreamFactory {
    targets: TapTargets,
    spawner: DissectorSpawner,
    streams_map: Arc<TcpStreamMap>,
    emitter: Arc<dyn Emitter>,
    outbound_links: Option<Arc<OutboundLinkWriter>>,
    reader_capacity: usize,
    stats: Arc<TapStats>,
}

impl TcpStreamFactory {
    pub fn new(
        targets: TapTargets,
        spawner: DissectorSpawner,
        streams_map: Arc<TcpStreamMap>,
        emitter: Arc<dyn Emitter>,
        stats: Arc<TapStats>,
    ) -> Self {
        Self {
            targets,
            spawner,
            streams_map,
            emitter,
            outbound_links: None,
            reader_capacity: 256,
            stats,
        }
    }

    pub fn with_outbound_links(mut self, writer: Arc<OutboundLinkWriter>) -> Self {
        self.outbound_links = Some(writer);
        self
    }

    pub fn with_reader_capacity(mut self, capacity: usize) -> Self {
        self.reader_capacity = capacity.max(1);
        self
    }

    pub fn targets(&self) -> &TapTargets {
        &self.targets
    }

    /// Wait for the dissector threads of every connection seen so far.
    pub fn wait_dissectors(&self) {
        self.spawner.wait();
    }
}

impl StreamFactory for TcpStreamFactory {
    type Stream = TapConnection;

    fn new_stream(&self, tcp_id: &TcpId, _first_segment: &TcpSegment) -> TapConnection {
        let props = self.targets.stream_props(tcp_id);
        if !props.is_tapped {
            return TapConnection {
                stream: Arc::new(TcpStream::untapped(0)),
                streams_map: None,
                stats: Arc::clone(&self.stats),
            };
        }

        let id = self.streams_map.next_id();
        let (client_tx, client_rx) = channel::bounded(self.reader_capacity);
        let (server_tx, server_rx) = channel::bounded(self.reader_capacity);
        let stream = Arc::new(TcpStream::new(id, [client_tx, server_tx]));
        self.streams_map.store(stream.clone());

        let counter_pair = Arc::new(CounterPair::default());
        let mut client = DirectionalReader::new(
            tcp_id.clone(),
            true,
            props.is_outgoing,
            CaptureSource::Pcap,
            client_rx,
            stream.clone(),
            Arc::clone(&counter_pair),
            Arc::clone(&self.emitter),
        );
        if let Some(writer) = &self.outbound_links
            && self
                .targets
                .should_notify_outbound_link(&tcp_id.dst_ip, tcp_id.dst_port)
        {
            client = client.with_outbound_links(Arc::clone(writer));
        }
        let server = DirectionalReader::new(
            tcp_id.reversed(),
            false,
            props.is_outgoing,
            CaptureSource::Pcap,
            server_rx,
            stream.clone(),
            counter_pair,
            Arc::clone(&self.emitter),
        );

        debug!("Stream {} created for {}", id, tcp_id);
        self.spawner.spawn(format!("dissect-{}-client", id), client);
        self.spawner.spawn(format!("dissect-{}-server", id), server);

        TapConnection {
            stream,
            streams_map: Some(Arc::clone(&self.streams_map)),
            stats: Arc::clone(&self.stats),
        }
    }
}

/// Assembler-side handle of one connection
pub struct TapConnection {
    stream: Arc<TcpStream>,
    /// Set for tapped connections, which are registered in the map
    streams_map: Option<Arc<TcpStreamMap>>,
    stats: Arc<TapStats>,
}

impl TapConnection {
    pub fn stream(&self) -> &Arc<TcpStream> {
        &self.stream
    }
}

impl ReassembledStream for TapConnection {
    fn reassembled(&mut self, direction: Direction, data: &[u8], timestamp: SystemTime) {
        TapStats::add(&self.stats.processed_bytes, data.len() as u64);
        if !self.stream.is_tap_target() || self.stream.is_closed() {
            return;
        }
        self.stream
            .send(direction, ReaderChunk::new(data.to_vec(), timestamp));
    }

    fn reassembly_complete(&mut self) {
        self.stream.close();
        if let Some(map) = &self.streams_map {
            map.delete(self.stream.id());
        }
    }
}
