//! Shared data model between the tap core and protocol dissectors.
//!
//! The capture side hands dissectors a [`TcpReader`]: a blocking byte source that
//! also carries the connection context (identity, direction, capture time) and the
//! callbacks a dissector needs (stream protocol, emitter). Dissectors hand matched
//! request/response pairs back out as [`OutputChannelItem`]s, which are turned into
//! [`Entry`] records by the owning extension.

pub mod matcher;

use crossbeam::channel::{SendTimeoutError, Sender};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::io::Read;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crate::extensions::Pair;

/// Display and routing metadata declared by every protocol extension.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Protocol {
    pub name: &'static str,
    pub long_name: &'static str,
    pub abbreviation: &'static str,
    pub macro_name: &'static str,
    pub version: &'static str,
    pub background_color: &'static str,
    pub foreground_color: &'static str,
    pub font_size: u8,
    pub reference_link: &'static str,
    pub ports: &'static [u16],
    pub priority: u8,
}

impl Protocol {
    /// `name/version/abbreviation`, the key under which entries are stored.
    pub fn id(&self) -> String {
        format!("{}/{}/{}", self.name, self.version, self.abbreviation)
    }
}

/// Connection identity of one direction of a flow.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TcpId {
    pub src_ip: IpAddr,
    pub dst_ip: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
}

impl TcpId {
    pub fn new(src_ip: IpAddr, src_port: u16, dst_ip: IpAddr, dst_port: u16) -> Self {
        Self {
            src_ip,
            dst_ip,
            src_port,
            dst_port,
        }
    }

    /// The same connection seen from the other side.
    pub fn reversed(&self) -> Self {
        Self {
            src_ip: self.dst_ip,
            dst_ip: self.src_ip,
            src_port: self.dst_port,
            dst_port: self.src_port,
        }
    }

    /// Placeholder identity used until a socket address is known.
    pub fn unknown() -> Self {
        let lo = IpAddr::V4(Ipv4Addr::LOCALHOST);
        Self::new(lo, 0, lo, 0)
    }
}

impl fmt::Display for TcpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}->{}:{}",
            self.src_ip, self.src_port, self.dst_ip, self.dst_port
        )
    }
}

/// Client/server view of a connection attached to every output item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub client_ip: IpAddr,
    pub client_port: u16,
    pub server_ip: IpAddr,
    pub server_port: u16,
    pub is_outgoing: bool,
}

impl ConnectionInfo {
    /// Build from the identity of the reader that produced the item.
    ///
    /// Server-side readers carry a swapped identity, so it is swapped back here.
    pub fn from_reader(tcp_id: &TcpId, is_client: bool, is_outgoing: bool) -> Self {
        let client = if is_client {
            tcp_id.clone()
        } else {
            tcp_id.reversed()
        };
        Self {
            client_ip: client.src_ip,
            client_port: client.src_port,
            server_ip: client.dst_ip,
            server_port: client.dst_port,
            is_outgoing,
        }
    }
}

/// Where the bytes of an entry came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureSource {
    Pcap,
    Ebpf,
}

/// One side of a request/response exchange.
#[derive(Debug, Clone, PartialEq)]
pub struct GenericMessage<T> {
    pub is_request: bool,
    pub capture_time: SystemTime,
    pub capture_size: usize,
    pub payload: T,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RequestResponsePair<T> {
    pub request: GenericMessage<T>,
    pub response: GenericMessage<T>,
}

/// A matched pair leaving a dissector, before it is turned into an [`Entry`].
#[derive(Debug, Clone)]
pub struct OutputChannelItem {
    pub protocol: &'static Protocol,
    pub capture: CaptureSource,
    pub timestamp: i64,
    pub connection_info: ConnectionInfo,
    pub pair: Pair,
    pub namespace: String,
}

/// Network endpoint of an entry, with the name it resolved to if any.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TcpEndpoint {
    pub name: String,
    pub ip: String,
    pub port: String,
}

/// Canonical output record for one matched request/response pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entry {
    #[serde(default)]
    pub id: u64,
    pub protocol_id: String,
    pub capture: CaptureSource,
    pub source: TcpEndpoint,
    pub destination: TcpEndpoint,
    pub namespace: String,
    pub outgoing: bool,
    pub timestamp: i64,
    pub start_time: i64,
    pub request: Map<String, Value>,
    pub response: Map<String, Value>,
    pub request_size: usize,
    pub response_size: usize,
    pub elapsed_time: i64,
}

/// Compact, queryable view of an [`Entry`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BaseEntry {
    pub id: u64,
    pub protocol_id: String,
    pub capture: CaptureSource,
    pub summary: String,
    pub summary_query: String,
    pub status: i64,
    pub status_query: String,
    pub method: String,
    pub method_query: String,
    pub timestamp: i64,
    pub source: TcpEndpoint,
    pub destination: TcpEndpoint,
    pub outgoing: bool,
    pub latency: i64,
}

/// Knobs that change what dissectors keep, not what they parse.
#[derive(Debug, Clone, Default)]
pub struct TrafficFilteringOptions {
    pub ignored_user_agents: Vec<String>,
    pub disable_redaction: bool,
}

/// Output capability owned by the caller.
///
/// Called once per matched pair. Implementations must not block indefinitely.
pub trait Emitter: Send + Sync {
    fn emit(&self, item: OutputChannelItem);
}

/// Emitter backed by a bounded channel; items are dropped after `timeout`.
pub struct ChannelEmitter {
    sender: Sender<OutputChannelItem>,
    timeout: Duration,
    emitted: AtomicU64,
    dropped: AtomicU64,
}

impl ChannelEmitter {
    pub fn new(sender: Sender<OutputChannelItem>, timeout: Duration) -> Self {
        Self {
            sender,
            timeout,
            emitted: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn emitted(&self) -> u64 {
        self.emitted.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Emitter for ChannelEmitter {
    fn emit(&self, item: OutputChannelItem) {
        match self.sender.send_timeout(item, self.timeout) {
            Ok(()) => {
                self.emitted.fetch_add(1, Ordering::Relaxed);
            }
            Err(SendTimeoutError::Timeout(item)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(
                    "Output consumer too slow, dropping {} item for {}:{}",
                    item.protocol.abbreviation,
                    item.connection_info.server_ip,
                    item.connection_info.server_port
                );
            }
            Err(SendTimeoutError::Disconnected(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                debug!("Output channel closed, dropping item");
            }
        }
    }
}

/// Stream-side callbacks available to a dissector through its reader.
pub trait StreamHandle: Send + Sync {
    fn id(&self) -> u64;
    fn created_at(&self) -> Instant;
    /// Record the protocol the dissector recognized. First call wins.
    fn set_protocol(&self, protocol: &'static Protocol);
    fn protocol(&self) -> Option<&'static Protocol>;
    fn is_closed(&self) -> bool;
    fn close(&self);
}

/// Request/response counters shared by the two readers of one connection.
///
/// Protocols without correlation ids pair the n-th request with the n-th response.
#[derive(Debug, Default)]
pub struct CounterPair {
    request: AtomicU64,
    response: AtomicU64,
}

impl CounterPair {
    pub fn next_request(&self) -> u64 {
        self.request.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn next_response(&self) -> u64 {
        self.response.fetch_add(1, Ordering::SeqCst) + 1
    }
}

/// Bytes consumed so far by a reader.
#[derive(Debug, Default)]
pub struct ReadProgress {
    read_bytes: AtomicU64,
}

impl ReadProgress {
    pub fn feed(&self, n: usize) {
        self.read_bytes.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn current(&self) -> u64 {
        self.read_bytes.load(Ordering::Relaxed)
    }
}

/// Byte source plus connection context handed to a dissector.
pub trait TcpReader: Read + Send {
    /// Identity as seen by this direction (server readers are swapped).
    fn tcp_id(&self) -> &TcpId;
    fn is_client(&self) -> bool;
    fn is_outgoing(&self) -> bool;
    /// Capture time of the chunk most recently pulled from the queue.
    fn capture_time(&self) -> SystemTime;
    fn capture_source(&self) -> CaptureSource;
    fn namespace(&self) -> &str;
    fn parent(&self) -> &dyn StreamHandle;
    fn counter_pair(&self) -> &CounterPair;
    fn progress(&self) -> &ReadProgress;
    fn emitter(&self) -> &dyn Emitter;
}

/// Why a dissector stopped before end of stream.
#[derive(Debug, thiserror::Error)]
pub enum DissectError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed {protocol} frame: {reason}")]
    Framing {
        protocol: &'static str,
        reason: String,
    },
}

impl DissectError {
    pub fn framing(protocol: &'static str, reason: impl Into<String>) -> Self {
        DissectError::Framing {
            protocol,
            reason: reason.into(),
        }
    }
}

/// Read exactly `size` bytes announced by a length prefix.
///
/// The buffer grows with the bytes that actually arrive, so a forged prefix
/// costs nothing until the peer sends the data.
pub fn read_sized<R: Read>(r: &mut R, size: usize) -> std::io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    r.by_ref().take(size as u64).read_to_end(&mut buf)?;
    if buf.len() < size {
        return Err(std::io::ErrorKind::UnexpectedEof.into());
    }
    Ok(buf)
}

/// Milliseconds since the Unix epoch, zero for times before it.
pub fn unix_millis(time: SystemTime) -> i64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Milliseconds from `start` to `end`, clamped at zero.
pub fn elapsed_millis(start: SystemTime, end: SystemTime) -> i64 {
    end.duration_since(start)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam::channel;

    #[test]
    fn test_tcp_id_reversed() {
        let id = TcpId::new(
            "10.0.0.1".parse().unwrap(),
            40000,
            "10.0.0.2".parse().unwrap(),
            80,
        );
        let rev = id.reversed();
        assert_eq!(rev.src_port, 80);
        assert_eq!(rev.dst_ip, id.src_ip);
        assert_eq!(rev.reversed(), id);
        assert_eq!(id.to_string(), "10.0.0.1:40000->10.0.0.2:80");
    }

    #[test]
    fn test_connection_info_from_server_reader() {
        let client = TcpId::new(
            "10.0.0.1".parse().unwrap(),
            40000,
            "10.0.0.2".parse().unwrap(),
            80,
        );
        let info = ConnectionInfo::from_reader(&client.reversed(), false, true);
        assert_eq!(info.client_port, 40000);
        assert_eq!(info.server_port, 80);
        assert!(info.is_outgoing);
    }

    #[test]
    fn test_read_sized_grows_with_the_data() {
        let data = b"abcdef";
        let mut r = &data[..];
        assert_eq!(read_sized(&mut r, 4).unwrap(), b"abcd");
        assert_eq!(r, b"ef");

        let err = read_sized(&mut r, usize::MAX >> 1).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn test_elapsed_is_clamped() {
        let now = SystemTime::now();
        let earlier = now - Duration::from_millis(5);
        assert_eq!(elapsed_millis(now, earlier), 0);
        assert_eq!(elapsed_millis(earlier, now), 5);
    }

    #[test]
    fn test_counter_pair_is_independent_per_side() {
        let counters = CounterPair::default();
        assert_eq!(counters.next_request(), 1);
        assert_eq!(counters.next_request(), 2);
        assert_eq!(counters.next_response(), 1);
    }

    #[test]
    fn test_channel_emitter_counts_drops_when_disconnected() {
        let (tx, rx) = channel::bounded(1);
        drop(rx);
        let emitter = ChannelEmitter::new(tx, Duration::from_millis(10));
        emitter.emit(crate::extensions::tests_support::sample_item());
        assert_eq!(emitter.dropped(), 1);
        assert_eq!(emitter.emitted(), 0);
    }
}
