//! Passive tapper: capture, reassembly and dissection wired together.

pub mod cleaner;
pub mod outbound_link;
pub mod stats;
pub mod stream_factory;
pub mod streams_map;
pub mod tcp_reader;
pub mod tcp_stream;

use anyhow::Result;
use crossbeam::channel::{self, Receiver};
use dashmap::DashMap;
use log::{debug, error, info, warn};
use pcap::{Activated, Capture};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::api::{ChannelEmitter, Emitter, OutputChannelItem};
use crate::config::TapConfig;
use crate::extensions::DissectorRegistry;
use crate::network::capture::{
    CaptureConfig, PacketReader, PacketSource, ReadOutcome, setup_packet_capture,
    validate_interface,
};
use crate::network::link_layer::LinkLayerType;
use crate::network::local_addresses;
use crate::network::parser::{PacketParser, ParsedPacket};
use crate::network::reassembly::Assembler;
use crate::tlstapper::{TlsContext, TlsTapper};

use cleaner::{Cleaner, CleanerStats};
use outbound_link::{OutboundLink, OutboundLinkWriter};
use stats::{TapStats, TapStatsSnapshot};
use stream_factory::{DissectorSpawner, TapTargets, TcpStreamFactory};
use streams_map::TcpStreamMap;

/// Outbound links queued before new ones are dropped
const OUTBOUND_LINK_CAPACITY: usize = 1000;

type TapAssembler = Assembler<TcpStreamFactory>;

/// A running tapper. Dropping it without [`Tap::stop`] leaves threads running.
pub struct Tap {
    should_stop: Arc<AtomicBool>,
    capture_done: Arc<AtomicBool>,
    capture_thread: Option<JoinHandle<()>>,
    threads: Vec<JoinHandle<()>>,
    assembler: Arc<Mutex<TapAssembler>>,
    cleaner: Arc<Cleaner<TcpStreamFactory>>,
    streams_map: Arc<TcpStreamMap>,
    spawner: DissectorSpawner,
    registry: Arc<DissectorRegistry>,
    emitter: Arc<ChannelEmitter>,
    stats: Arc<TapStats>,
    tls: Option<TlsTapper>,
}

/// Open the capture source and start tapping.
///
/// Returns the tapper with the receivers of matched pairs and outbound links.
pub fn start_passive_tapper(
    config: &TapConfig,
    registry: Arc<DissectorRegistry>,
) -> Result<(Tap, Receiver<OutputChannelItem>, Receiver<OutboundLink>)> {
    let source = match &config.pcap_file {
        Some(path) => PacketSource::File(path.clone()),
        None => {
            validate_interface(&config.interface)?;
            PacketSource::Live(config.interface.clone())
        }
    };

    let capture_config = CaptureConfig {
        filter: config.bpf_filter.clone(),
        ..Default::default()
    };
    let (capture, name, linktype) = setup_packet_capture(&source, &capture_config)?;

    let targets = tap_targets(config, &registry, &source);
    let (mut tap, items, links) = Tap::new(config, registry, targets)?;
    info!("Tapping {}", name);
    tap.start_capture(capture, linktype);
    Ok((tap, items, links))
}

/// Tap targets from the configuration; an empty port list means every
/// registered protocol port.
pub fn tap_targets(
    config: &TapConfig,
    registry: &DissectorRegistry,
    source: &PacketSource,
) -> TapTargets {
    let ports = if config.ports.is_empty() {
        registry.ports()
    } else {
        config.ports.clone()
    };

    // Local addresses say nothing about a recorded capture
    let any_direction = match source {
        PacketSource::File(_) if !config.any_direction => {
            info!("Offline capture, tapping both directions");
            true
        }
        _ => config.any_direction,
    };

    let targets = TapTargets {
        ports,
        authorities: config.authorities.iter().cloned().collect(),
        any_direction,
        own_ips: local_addresses(),
    };
    if targets.authorities.is_empty() {
        info!("Port mode on {:?}", targets.ports);
    } else {
        info!("Host mode on {:?}", targets.authorities);
    }
    targets
}

impl Tap {
    fn new(
        config: &TapConfig,
        registry: Arc<DissectorRegistry>,
        targets: TapTargets,
    ) -> Result<(Self, Receiver<OutputChannelItem>, Receiver<OutboundLink>)> {
        let should_stop = Arc::new(AtomicBool::new(false));
        let stats = Arc::new(TapStats::default());

        let (item_tx, item_rx) = channel::bounded(config.emitter_channel_capacity.max(1));
        let emitter = Arc::new(ChannelEmitter::new(
            item_tx,
            Duration::from_millis(config.emit_timeout_ms),
        ));
        let (link_writer, link_rx) = OutboundLinkWriter::new(OUTBOUND_LINK_CAPACITY);

        let streams_map = Arc::new(TcpStreamMap::new(Arc::clone(&stats)));
        let spawner = DissectorSpawner::new(
            Arc::clone(&registry),
            Arc::new(config.filtering_options()),
        );
        let dyn_emitter: Arc<dyn Emitter> = emitter.clone();

        let factory = TcpStreamFactory::new(
            targets,
            spawner.clone(),
            Arc::clone(&streams_map),
            Arc::clone(&dyn_emitter),
            Arc::clone(&stats),
        )
        .with_outbound_links(Arc::new(link_writer))
        .with_reader_capacity(config.reader_channel_capacity);
        let assembler = Arc::new(Mutex::new(Assembler::new(factory)));

        let cleaner = Arc::new(Cleaner::new(
            Arc::clone(&assembler),
            Arc::clone(&registry),
            config.clean_period(),
            config.connection_timeout(),
        ));

        let tls = if config.tls {
            let ctx = TlsContext {
                spawner: spawner.clone(),
                streams_map: Arc::clone(&streams_map),
                emitter: dyn_emitter,
                stats: Arc::clone(&stats),
                namespaces: Arc::new(DashMap::new()),
                reader_capacity: config.reader_channel_capacity.max(1),
                idle_timeout: Duration::from_millis(config.tls_reader_idle_timeout_ms),
            };
            Some(TlsTapper::start(config, ctx)?)
        } else {
            None
        };

        let threads = vec![
            streams_map.start_sweeper(
                config.sweep_interval(),
                config.stream_timeout(),
                Arc::clone(&should_stop),
            ),
            cleaner.start(Arc::clone(&should_stop)),
        ];

        let tap = Self {
            should_stop,
            capture_done: Arc::new(AtomicBool::new(false)),
            capture_thread: None,
            threads,
            assembler,
            cleaner,
            streams_map,
            spawner,
            registry,
            emitter,
            stats,
            tls,
        };
        Ok((tap, item_rx, link_rx))
    }

    fn start_capture(&mut self, capture: Capture<dyn Activated>, linktype: i32) {
        let assembler = Arc::clone(&self.assembler);
        let stats = Arc::clone(&self.stats);
        let should_stop = Arc::clone(&self.should_stop);
        let capture_done = Arc::clone(&self.capture_done);

        let handle = thread::Builder::new()
            .name("packet-capture".to_string())
            .spawn(move || {
                let parser = PacketParser::new(LinkLayerType::from_dlt(linktype));
                info!("Packet capture started (link layer: {:?})", parser.link_type());
                let mut reader = PacketReader::new(capture);

                while !should_stop.load(Ordering::Relaxed) {
                    match reader.next_packet() {
                        Ok(ReadOutcome::Packet(packet)) => {
                            TapStats::incr(&stats.packets);
                            if let ParsedPacket::Tcp(segment) =
                                parser.parse_packet(&packet.data, packet.timestamp)
                            {
                                TapStats::incr(&stats.tcp_packets);
                                assembler
                                    .lock()
                                    .expect("assembler lock poisoned")
                                    .assemble(&segment, Instant::now());
                            }
                        }
                        Ok(ReadOutcome::Timeout) => continue,
                        Ok(ReadOutcome::Exhausted) => {
                            info!("Capture source exhausted");
                            break;
                        }
                        Err(e) => {
                            error!("Capture failed: {}", e);
                            break;
                        }
                    }
                }

                let flushed = assembler
                    .lock()
                    .expect("assembler lock poisoned")
                    .flush_all();
                debug!("Closed {} connections at end of capture", flushed);

                match reader.stats() {
                    Ok(capture_stats) => info!(
                        "Capture finished: {} received, {} dropped",
                        capture_stats.received,
                        capture_stats.total_dropped()
                    ),
                    // Not supported for capture files
                    Err(e) => debug!("No capture statistics: {}", e),
                }
                capture_done.store(true, Ordering::SeqCst);
            })
            .expect("Failed to spawn packet capture thread");
        self.capture_thread = Some(handle);
    }

    /// True once the capture thread has ended (end of file or error).
    pub fn is_capture_done(&self) -> bool {
        self.capture_done.load(Ordering::SeqCst)
    }

    /// Block until the capture ends and every dissector has drained its reader.
    pub fn wait(&mut self) {
        if let Some(handle) = self.capture_thread.take()
            && handle.join().is_err()
        {
            warn!("Packet capture thread panicked");
        }
        self.spawner.wait();
    }

    /// Attribute TLS traffic of `pid` to `namespace`.
    pub fn add_tls_pid(&self, pid: u32, namespace: impl Into<String>) {
        match &self.tls {
            Some(tls) => tls.add_pid(pid, namespace),
            None => debug!("TLS tapping disabled, ignoring pid {}", pid),
        }
    }

    pub fn clear_tls_pids(&self) {
        if let Some(tls) = &self.tls {
            tls.clear_pids();
        }
    }

    pub fn stats(&self) -> TapStatsSnapshot {
        let mut snapshot = self.stats.snapshot();
        snapshot.emitted_items = self.emitter.emitted();
        snapshot.dropped_items = self.emitter.dropped();
        snapshot.unmatched_responses = self.registry.unmatched();
        snapshot
    }

    /// Cleaner counters since the previous call.
    pub fn dump_cleaner_stats(&self) -> CleanerStats {
        self.cleaner.dump_stats()
    }

    pub fn live_streams(&self) -> usize {
        self.streams_map.len()
    }

    /// Stop every thread, closing the connections still open.
    pub fn stop(&mut self) {
        info!("Stopping tapper");
        self.should_stop.store(true, Ordering::SeqCst);
        if let Some(tls) = &mut self.tls {
            tls.stop();
        }
        if let Some(handle) = self.capture_thread.take() {
            let _ = handle.join();
        }
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
        // Wakes readers still waiting on streams nobody closed
        self.streams_map.range(|_, stream| {
            stream.close();
            true
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_tap_targets_default_ports_and_offline_direction() {
        let registry = DissectorRegistry::default();
        let config = TapConfig::default();

        let live = tap_targets(&config, &registry, &PacketSource::Live(None));
        assert_eq!(live.ports, registry.ports());
        assert!(!live.any_direction);

        let offline = tap_targets(
            &config,
            &registry,
            &PacketSource::File(PathBuf::from("trace.pcap")),
        );
        assert!(offline.any_direction);
    }

    #[test]
    fn test_explicit_ports_and_authorities() {
        let config = TapConfig {
            ports: vec![8080],
            authorities: vec!["10.0.0.5:8080".to_string()],
            ..Default::default()
        };
        let targets = tap_targets(
            &config,
            &DissectorRegistry::default(),
            &PacketSource::Live(None),
        );
        assert_eq!(targets.ports, vec![8080]);
        assert!(targets.authorities.contains("10.0.0.5:8080"));
    }

    #[test]
    fn test_stats_include_output_counters() {
        let (mut tap, items, _links) = Tap::new(
            &TapConfig::default(),
            Arc::new(DissectorRegistry::default()),
            TapTargets::default(),
        )
        .unwrap();
        let snapshot = tap.stats();
        assert_eq!(snapshot.emitted_items, 0);
        assert_eq!(snapshot.packets, 0);
        assert_eq!(tap.live_streams(), 0);
        tap.stop();
        drop(items);
    }
}
