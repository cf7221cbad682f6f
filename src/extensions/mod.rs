//! Protocol extensions and the registry that dispatches to them.
//!
//! The set of protocols is closed: every supported protocol is a variant of
//! [`Dissector`], and the registry picks one per directional reader, first by
//! the server port and then by looking at the first bytes of the stream.

pub mod amqp;
pub mod http;
pub mod kafka;

use anyhow::{Result, anyhow, bail};
use log::{debug, info};
use serde::Serialize;
use serde_json::{Map, Value};
use std::io::{self, BufRead, BufReader};
use std::time::Instant;

use crate::api::{
    BaseEntry, DissectError, Entry, OutputChannelItem, Protocol, RequestResponsePair,
    TcpEndpoint, TcpReader, TrafficFilteringOptions, elapsed_millis, unix_millis,
};
use amqp::{AmqpDissector, AmqpPayload};
use http::{HttpDissector, HttpPayload};
use kafka::{KafkaDissector, KafkaPayload};

/// A matched pair, tagged with the protocol that produced it.
#[derive(Debug, Clone)]
pub enum Pair {
    Http(RequestResponsePair<HttpPayload>),
    Amqp(RequestResponsePair<AmqpPayload>),
    Kafka(RequestResponsePair<KafkaPayload>),
}

pub enum Dissector {
    Http(HttpDissector),
    Amqp(AmqpDissector),
    Kafka(KafkaDissector),
}

impl Dissector {
    pub fn protocol(&self) -> &'static Protocol {
        match self {
            Dissector::Http(_) => &http::PROTOCOL,
            Dissector::Amqp(_) => &amqp::PROTOCOL,
            Dissector::Kafka(_) => &kafka::PROTOCOL,
        }
    }

    /// Whether the first bytes of a stream look like this protocol.
    pub fn detect(&self, prefix: &[u8]) -> bool {
        match self {
            Dissector::Http(_) => http::detect(prefix),
            Dissector::Amqp(_) => amqp::detect(prefix),
            Dissector::Kafka(_) => kafka::detect(prefix),
        }
    }

    /// Consume the byte source until end of stream or a framing error.
    pub fn dissect<R: TcpReader>(
        &self,
        b: &mut BufReader<R>,
        options: &TrafficFilteringOptions,
    ) -> Result<(), DissectError> {
        match self {
            Dissector::Http(d) => d.dissect(b, options),
            Dissector::Amqp(d) => d.dissect(b, options),
            Dissector::Kafka(d) => d.dissect(b, options),
        }
    }

    pub fn analyze(
        &self,
        item: &OutputChannelItem,
        resolved_source: &str,
        resolved_destination: &str,
    ) -> Result<Entry> {
        match self {
            Dissector::Http(d) => d.analyze(item, resolved_source, resolved_destination),
            Dissector::Amqp(d) => d.analyze(item, resolved_source, resolved_destination),
            Dissector::Kafka(d) => d.analyze(item, resolved_source, resolved_destination),
        }
    }

    pub fn summarize(&self, entry: &Entry) -> Result<BaseEntry> {
        match self {
            Dissector::Http(d) => d.summarize(entry),
            Dissector::Amqp(d) => d.summarize(entry),
            Dissector::Kafka(d) => d.summarize(entry),
        }
    }

    pub fn represent(&self, request: &Map<String, Value>, response: &Map<String, Value>) -> Result<Vec<u8>> {
        match self {
            Dissector::Http(d) => d.represent(request, response),
            Dissector::Amqp(d) => d.represent(request, response),
            Dissector::Kafka(d) => d.represent(request, response),
        }
    }

    /// Query shorthands, e.g. `amqp` for `protocol == "amqp/0-9-1/AMQP"`.
    pub fn macros(&self) -> Vec<(String, String)> {
        let protocol = self.protocol();
        vec![(
            protocol.macro_name.to_string(),
            string_query("protocol", &protocol.id()),
        )]
    }

    /// Purge pending matcher entries registered at or before `threshold`.
    pub fn delete_older_than(&self, threshold: Instant) -> usize {
        match self {
            Dissector::Http(d) => d.matcher().delete_older_than(threshold),
            Dissector::Amqp(d) => d.matcher().delete_older_than(threshold),
            Dissector::Kafka(d) => d.matcher().delete_older_than(threshold),
        }
    }

    pub fn pending(&self) -> usize {
        match self {
            Dissector::Http(d) => d.matcher().len(),
            Dissector::Amqp(d) => d.matcher().len(),
            Dissector::Kafka(d) => d.matcher().len(),
        }
    }

    pub fn unmatched(&self) -> u64 {
        match self {
            Dissector::Http(d) => d.matcher().unmatched(),
            Dissector::Amqp(d) => d.matcher().unmatched(),
            Dissector::Kafka(d) => d.matcher().unmatched(),
        }
    }
}

/// The dissectors known to this process, built once at start-up and shared.
pub struct DissectorRegistry {
    dissectors: Vec<Dissector>,
}

impl Default for DissectorRegistry {
    fn default() -> Self {
        let mut registry = Self::new();
        registry.register(Dissector::Http(HttpDissector::new()));
        registry.register(Dissector::Amqp(AmqpDissector::new()));
        registry.register(Dissector::Kafka(KafkaDissector::new()));
        registry
    }
}

impl DissectorRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self {
            dissectors: Vec::new(),
        }
    }

    /// Add a dissector, keeping the list ordered by protocol priority.
    pub fn register(&mut self, dissector: Dissector) {
        let protocol = dissector.protocol();
        info!(
            "Registered dissector {} ({}) on ports {:?}",
            protocol.long_name,
            protocol.id(),
            protocol.ports
        );
        self.dissectors.push(dissector);
        self.dissectors.sort_by_key(|d| d.protocol().priority);
    }

    pub fn dissectors(&self) -> &[Dissector] {
        &self.dissectors
    }

    pub fn protocols(&self) -> Vec<&'static Protocol> {
        self.dissectors.iter().map(|d| d.protocol()).collect()
    }

    /// Every port some registered protocol listens on, sorted.
    pub fn ports(&self) -> Vec<u16> {
        let mut ports: Vec<u16> = self
            .dissectors
            .iter()
            .flat_map(|d| d.protocol().ports.iter().copied())
            .collect();
        ports.sort_unstable();
        ports.dedup();
        ports
    }

    pub fn by_protocol_id(&self, protocol_id: &str) -> Option<&Dissector> {
        self.dissectors
            .iter()
            .find(|d| d.protocol().id() == protocol_id)
    }

    pub fn by_port(&self, server_port: u16) -> Option<&Dissector> {
        self.dissectors
            .iter()
            .find(|d| d.protocol().ports.contains(&server_port))
    }

    /// Pick a dissector for a stream: server port first, then content.
    pub fn select(&self, server_port: u16, prefix: &[u8]) -> Option<&Dissector> {
        self.by_port(server_port)
            .or_else(|| self.dissectors.iter().find(|d| d.detect(prefix)))
    }

    /// Drive one directional reader to completion.
    ///
    /// Streams no dissector recognizes are drained so the producer never blocks.
    pub fn dissect<R: TcpReader>(&self, reader: R, options: &TrafficFilteringOptions) {
        let tcp_id = reader.tcp_id().clone();
        let server_port = if reader.is_client() {
            tcp_id.dst_port
        } else {
            tcp_id.src_port
        };
        let mut b = BufReader::new(reader);

        let dissector = match self.by_port(server_port) {
            Some(dissector) => Some(dissector),
            None => match b.fill_buf() {
                Ok([]) => return,
                Ok(prefix) => self.dissectors.iter().find(|d| d.detect(prefix)),
                Err(e) => {
                    debug!("Failed to read from {}: {}", tcp_id, e);
                    return;
                }
            },
        };

        match dissector {
            Some(dissector) => {
                if let Err(e) = dissector.dissect(&mut b, options) {
                    debug!(
                        "{} dissection of {} stopped: {}",
                        dissector.protocol().abbreviation,
                        tcp_id,
                        e
                    );
                }
            }
            None => {
                debug!("No dissector for {}, draining", tcp_id);
                let _ = io::copy(&mut b, &mut io::sink());
            }
        }
    }

    pub fn analyze(
        &self,
        item: &OutputChannelItem,
        resolved_source: &str,
        resolved_destination: &str,
    ) -> Result<Entry> {
        self.dissector_for(&item.protocol.id())?
            .analyze(item, resolved_source, resolved_destination)
    }

    pub fn summarize(&self, entry: &Entry) -> Result<BaseEntry> {
        self.dissector_for(&entry.protocol_id)?.summarize(entry)
    }

    pub fn represent(&self, entry: &Entry) -> Result<Vec<u8>> {
        self.dissector_for(&entry.protocol_id)?
            .represent(&entry.request, &entry.response)
    }

    pub fn delete_older_than(&self, threshold: Instant) -> usize {
        self.dissectors
            .iter()
            .map(|d| d.delete_older_than(threshold))
            .sum()
    }

    pub fn unmatched(&self) -> u64 {
        self.dissectors.iter().map(|d| d.unmatched()).sum()
    }

    fn dissector_for(&self, protocol_id: &str) -> Result<&Dissector> {
        self.by_protocol_id(protocol_id)
            .ok_or_else(|| anyhow!("No dissector registered for {}", protocol_id))
    }
}

/// Shared tail of every `analyze`: endpoints, timing and sizes.
pub(crate) fn new_entry<T>(
    item: &OutputChannelItem,
    pair: &RequestResponsePair<T>,
    resolved_source: &str,
    resolved_destination: &str,
    request: Map<String, Value>,
    response: Map<String, Value>,
) -> Entry {
    let info = &item.connection_info;
    Entry {
        id: 0,
        protocol_id: item.protocol.id(),
        capture: item.capture,
        source: TcpEndpoint {
            name: resolved_source.to_string(),
            ip: info.client_ip.to_string(),
            port: info.client_port.to_string(),
        },
        destination: TcpEndpoint {
            name: resolved_destination.to_string(),
            ip: info.server_ip.to_string(),
            port: info.server_port.to_string(),
        },
        namespace: item.namespace.clone(),
        outgoing: info.is_outgoing,
        timestamp: item.timestamp,
        start_time: unix_millis(pair.request.capture_time),
        request,
        response,
        request_size: pair.request.capture_size,
        response_size: pair.response.capture_size,
        elapsed_time: elapsed_millis(pair.request.capture_time, pair.response.capture_time),
    }
}

/// Shared head of every `summarize`.
pub(crate) fn base_entry(entry: &Entry) -> BaseEntry {
    BaseEntry {
        id: entry.id,
        protocol_id: entry.protocol_id.clone(),
        capture: entry.capture,
        summary: String::new(),
        summary_query: String::new(),
        status: 0,
        status_query: String::new(),
        method: String::new(),
        method_query: String::new(),
        timestamp: entry.timestamp,
        source: entry.source.clone(),
        destination: entry.destination.clone(),
        outgoing: entry.outgoing,
        latency: entry.elapsed_time,
    }
}

pub(crate) fn to_object<T: Serialize>(value: &T) -> Result<Map<String, Value>> {
    match serde_json::to_value(value)? {
        Value::Object(map) => Ok(map),
        other => bail!("expected an object, got {}", other),
    }
}

pub(crate) fn from_object<T: serde::de::DeserializeOwned>(map: &Map<String, Value>) -> Result<T> {
    Ok(serde_json::from_value(Value::Object(map.clone()))?)
}

/// `field == "value"` with the value quoted for the query language.
pub(crate) fn string_query(field: &str, value: &str) -> String {
    let escaped = value.replace('\\', "\\\\").replace('"', "\\\"");
    format!(r#"{} == "{}""#, field, escaped)
}

/// One block of a rendered entry.
#[derive(Debug, Serialize)]
pub(crate) struct Section {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub title: String,
    #[serde(rename = "mimeType", skip_serializing_if = "String::is_empty")]
    pub mime_type: String,
    pub data: String,
}

#[derive(Debug, Serialize)]
pub(crate) struct TableRow {
    pub name: String,
    pub value: Value,
    pub selector: String,
}

impl Section {
    pub fn table(title: &str, rows: &[TableRow]) -> Result<Self> {
        Ok(Self {
            kind: "table",
            title: title.to_string(),
            mime_type: String::new(),
            data: serde_json::to_string(rows)?,
        })
    }

    pub fn body(title: &str, mime_type: &str, data: String) -> Self {
        Self {
            kind: "body",
            title: title.to_string(),
            mime_type: mime_type.to_string(),
            data,
        }
    }
}

pub(crate) fn row(name: &str, value: impl Into<Value>, selector: String) -> TableRow {
    TableRow {
        name: name.to_string(),
        value: value.into(),
        selector,
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct Representation {
    pub request: Vec<Section>,
    pub response: Vec<Section>,
}

impl Representation {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}
