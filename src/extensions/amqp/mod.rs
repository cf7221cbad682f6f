//! AMQP 0-9-1 extension.
//!
//! Synchronous methods are paired with their `-Ok` reply by channel and method
//! family. Published and delivered messages have no reply on the wire; each one
//! is paired with a synthesized empty response once its content is complete.

mod frames;

pub use frames::{AmqpMethod, BasicProperties, FieldTable, FieldValue};

use anyhow::{Result, bail};
use log::debug;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::io::{self, BufReader};

use super::{
    Pair, Representation, Section, TableRow, base_entry, from_object, row, string_query,
    to_object,
};
use crate::api::matcher::{MatchPolicy, RequestResponseMatcher};
use crate::api::{
    BaseEntry, ConnectionInfo, DissectError, Entry, GenericMessage, OutputChannelItem, Protocol,
    TcpId, TcpReader, TrafficFilteringOptions, unix_millis,
};
use frames::Frame;

pub static PROTOCOL: Protocol = Protocol {
    name: "amqp",
    long_name: "Advanced Message Queuing Protocol 0-9-1",
    abbreviation: "AMQP",
    macro_name: "amqp",
    version: "0-9-1",
    background_color: "#ff6600",
    foreground_color: "#ffffff",
    font_size: 12,
    reference_link: "https://www.rabbitmq.com/amqp-0-9-1-reference.html",
    ports: &[5671, 5672],
    priority: 1,
};

pub type AmqpPayload = AmqpMethod;

const MAX_CAPTURED_BODY: usize = 256 * 1024;
const KNOWN_CLASSES: &[u16] = &[10, 20, 40, 50, 60, 85, 90];

pub fn detect(prefix: &[u8]) -> bool {
    if prefix.starts_with(b"AMQP\x00") {
        return true;
    }
    if prefix.len() < 11 || prefix[0] != frames::FRAME_METHOD {
        return false;
    }
    let size = u32::from_be_bytes([prefix[3], prefix[4], prefix[5], prefix[6]]) as usize;
    let class_id = u16::from_be_bytes([prefix[7], prefix[8]]);
    if !KNOWN_CLASSES.contains(&class_id) {
        return false;
    }
    // If the whole frame is visible its end marker must be right.
    match prefix.get(7 + size) {
        Some(&end) => end == frames::FRAME_END,
        None => true,
    }
}

/// A publish or deliver waiting for its content header and body frames.
struct PendingContent {
    method: AmqpMethod,
    key: String,
    size: usize,
    properties: BasicProperties,
    expected: Option<u64>,
    received: u64,
    body: Vec<u8>,
}

impl PendingContent {
    fn is_complete(&self) -> bool {
        self.expected.is_some_and(|expected| self.received >= expected)
    }

    fn append(&mut self, data: &[u8]) {
        self.received += data.len() as u64;
        let room = MAX_CAPTURED_BODY.saturating_sub(self.body.len());
        self.body.extend_from_slice(&data[..data.len().min(room)]);
    }

    fn into_method(self) -> AmqpMethod {
        let text = String::from_utf8_lossy(&self.body).into_owned();
        match self.method {
            AmqpMethod::BasicPublish {
                exchange,
                routing_key,
                mandatory,
                immediate,
                ..
            } => AmqpMethod::BasicPublish {
                exchange,
                routing_key,
                mandatory,
                immediate,
                properties: self.properties,
                body: text,
                body_size: self.received,
            },
            AmqpMethod::BasicDeliver {
                consumer_tag,
                delivery_tag,
                redelivered,
                exchange,
                routing_key,
                ..
            } => AmqpMethod::BasicDeliver {
                consumer_tag,
                delivery_tag,
                redelivered,
                exchange,
                routing_key,
                properties: self.properties,
                body: text,
                body_size: self.received,
            },
            other => other,
        }
    }
}

pub struct AmqpDissector {
    matcher: RequestResponseMatcher<AmqpPayload>,
}

impl Default for AmqpDissector {
    fn default() -> Self {
        Self::new()
    }
}

impl AmqpDissector {
    pub fn new() -> Self {
        Self {
            matcher: Self::new_response_request_matcher(),
        }
    }

    pub fn new_response_request_matcher() -> RequestResponseMatcher<AmqpPayload> {
        RequestResponseMatcher::new(MatchPolicy::Store)
    }

    pub fn matcher(&self) -> &RequestResponseMatcher<AmqpPayload> {
        &self.matcher
    }

    pub fn dissect<R: TcpReader>(
        &self,
        b: &mut BufReader<R>,
        _options: &TrafficFilteringOptions,
    ) -> Result<(), DissectError> {
        let mut contents: HashMap<u16, PendingContent> = HashMap::new();

        loop {
            let (frame, size) = match frames::read_frame(b) {
                Ok(Some(frame)) => frame,
                Ok(None) => return Ok(()),
                Err(DissectError::Io(e)) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    return Ok(());
                }
                Err(e) => return Err(e),
            };
            let reader = b.get_ref();

            match frame {
                Frame::Heartbeat => {}
                Frame::Method {
                    channel,
                    class_id,
                    method_id,
                    method,
                } => {
                    reader.parent().set_protocol(&PROTOCOL);
                    let key = ident(reader, channel, class_id, method_id);
                    match method {
                        Some(method @ (AmqpMethod::BasicPublish { .. } | AmqpMethod::BasicDeliver { .. })) => {
                            contents.insert(
                                channel,
                                PendingContent {
                                    method,
                                    key,
                                    size,
                                    properties: BasicProperties::default(),
                                    expected: None,
                                    received: 0,
                                    body: Vec::new(),
                                },
                            );
                        }
                        Some(method) => {
                            // x0 is the method, x1 its -Ok reply
                            self.emit_event(reader, method_id % 10 == 0, key, method, size);
                        }
                        None => debug!(
                            "Skipping AMQP method {}.{} on {}",
                            class_id,
                            method_id,
                            reader.tcp_id()
                        ),
                    }
                }
                Frame::Header {
                    channel,
                    body_size,
                    properties,
                } => {
                    if let Some(content) = contents.get_mut(&channel) {
                        content.properties = properties;
                        content.expected = Some(body_size);
                        content.size += size;
                    }
                }
                Frame::Body { channel, data } => {
                    if let Some(content) = contents.get_mut(&channel) {
                        content.append(&data);
                        content.size += size;
                    }
                }
            }

            let complete: Vec<u16> = contents
                .iter()
                .filter(|(_, content)| content.is_complete())
                .map(|(channel, _)| *channel)
                .collect();
            for channel in complete {
                if let Some(content) = contents.remove(&channel) {
                    let key = content.key.clone();
                    let size = content.size;
                    self.emit_event(reader, true, key.clone(), content.into_method(), size);
                    self.emit_event(reader, false, key, AmqpMethod::EmptyResponse, 0);
                }
            }
        }
    }

    fn emit_event<R: TcpReader>(
        &self,
        reader: &R,
        is_request: bool,
        key: String,
        method: AmqpMethod,
        size: usize,
    ) {
        let message = GenericMessage {
            is_request,
            capture_time: reader.capture_time(),
            capture_size: size,
            payload: method,
        };
        let pair = if is_request {
            self.matcher.register_request(key, message)
        } else {
            self.matcher.register_response(key, message)
        };

        if let Some(pair) = pair {
            reader.emitter().emit(OutputChannelItem {
                protocol: &PROTOCOL,
                capture: reader.capture_source(),
                timestamp: unix_millis(pair.request.capture_time),
                connection_info: ConnectionInfo::from_reader(
                    reader.tcp_id(),
                    reader.is_client(),
                    reader.is_outgoing(),
                ),
                pair: Pair::Amqp(pair),
                namespace: reader.namespace().to_string(),
            });
        }
    }

    pub fn analyze(
        &self,
        item: &OutputChannelItem,
        resolved_source: &str,
        resolved_destination: &str,
    ) -> Result<Entry> {
        let Pair::Amqp(pair) = &item.pair else {
            bail!("{} cannot analyze a non-AMQP pair", PROTOCOL.abbreviation);
        };
        Ok(super::new_entry(
            item,
            pair,
            resolved_source,
            resolved_destination,
            to_object(&pair.request.payload)?,
            to_object(&pair.response.payload)?,
        ))
    }

    pub fn summarize(&self, entry: &Entry) -> Result<BaseEntry> {
        let request: AmqpMethod = from_object(&entry.request)?;

        let (summary, summary_query) = match &request {
            AmqpMethod::BasicPublish { exchange, .. }
            | AmqpMethod::BasicDeliver { exchange, .. }
            | AmqpMethod::ExchangeDeclare { exchange, .. } => {
                (exchange.clone(), string_query("request.exchange", exchange))
            }
            AmqpMethod::QueueDeclare { queue, .. }
            | AmqpMethod::QueueBind { queue, .. }
            | AmqpMethod::BasicConsume { queue, .. } => {
                (queue.clone(), string_query("request.queue", queue))
            }
            AmqpMethod::ConnectionStart {
                version_major,
                version_minor,
                ..
            } => (
                format!("{}.{}", version_major, version_minor),
                format!(
                    "request.versionMajor == {} and request.versionMinor == {}",
                    version_major, version_minor
                ),
            ),
            AmqpMethod::ConnectionClose { reply_text, .. } => {
                (reply_text.clone(), string_query("request.replyText", reply_text))
            }
            _ => (String::new(), String::new()),
        };

        let mut base = base_entry(entry);
        base.summary = summary;
        base.summary_query = summary_query;
        base.method = request.name().to_string();
        base.method_query = string_query("request.method", request.name());
        Ok(base)
    }

    pub fn represent(&self, request: &Map<String, Value>, response: &Map<String, Value>) -> Result<Vec<u8>> {
        let request: AmqpMethod = from_object(request)?;
        let response: AmqpMethod = from_object(response)?;

        Representation {
            request: represent_method("request", &request)?,
            response: represent_method("response", &response)?,
        }
        .to_bytes()
    }
}

/// Key in client orientation, shared by a method and its `-Ok` reply.
fn ident<R: TcpReader>(reader: &R, channel: u16, class_id: u16, method_id: u16) -> String {
    let client_view: TcpId = if reader.is_client() {
        reader.tcp_id().clone()
    } else {
        reader.tcp_id().reversed()
    };
    format!(
        "{}_{}_{}_{}_{}_{}_{}",
        client_view.src_ip,
        client_view.dst_ip,
        client_view.src_port,
        client_view.dst_port,
        channel,
        class_id,
        method_id - method_id % 10
    )
}

fn represent_method(side: &str, method: &AmqpMethod) -> Result<Vec<Section>> {
    if matches!(method, AmqpMethod::EmptyResponse) {
        return Ok(Vec::new());
    }

    let fields = to_object(method)?;
    let mut details: Vec<TableRow> = Vec::new();
    let mut sections = Vec::new();

    for (key, value) in &fields {
        match key.as_str() {
            "method" | "body" | "bodySize" => {}
            "properties" | "arguments" | "serverProperties" | "clientProperties" => {
                if let Value::Object(table) = value
                    && !table.is_empty()
                {
                    let rows: Vec<_> = table
                        .iter()
                        .map(|(name, v)| {
                            row(name, v.clone(), format!(r#"{}.{}["{}"]"#, side, key, name))
                        })
                        .collect();
                    sections.push(Section::table(&title_case(key), &rows)?);
                }
            }
            _ => details.push(row(&title_case(key), value.clone(), format!("{}.{}", side, key))),
        }
    }
    sections.insert(0, Section::table("Details", &details)?);

    if let AmqpMethod::BasicPublish {
        body, properties, ..
    }
    | AmqpMethod::BasicDeliver {
        body, properties, ..
    } = method
        && !body.is_empty()
    {
        let mime = properties.content_type.as_deref().unwrap_or_default();
        sections.push(Section::body("Body", mime, body.clone()));
    }
    Ok(sections)
}

/// `routingKey` -> `Routing Key`
fn title_case(key: &str) -> String {
    let mut out = String::with_capacity(key.len() + 4);
    for (i, c) in key.chars().enumerate() {
        if i == 0 {
            out.extend(c.to_uppercase());
        } else if c.is_uppercase() {
            out.push(' ');
            out.push(c);
        } else {
            out.push(c);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry_for(request: AmqpMethod, response: AmqpMethod) -> Entry {
        let item = crate::extensions::tests_support::sample_item();
        let pair = match &item.pair {
            Pair::Http(p) => p,
            _ => unreachable!(),
        };
        let mut entry = super::super::new_entry(
            &item,
            pair,
            "",
            "",
            to_object(&request).unwrap(),
            to_object(&response).unwrap(),
        );
        entry.protocol_id = PROTOCOL.id();
        entry
    }

    #[test]
    fn test_detect() {
        assert!(detect(b"AMQP\x00\x00\x09\x01"));
        let frame = frames::tests::frame(frames::FRAME_METHOD, 1, &[0, 50, 0, 11, 0]);
        assert!(detect(&frame));
        assert!(!detect(b"GET / HTTP/1.1\r\n"));
    }

    #[test]
    fn test_summary_of_publish_matches_query() {
        let dissector = AmqpDissector::new();
        let publish = AmqpMethod::BasicPublish {
            exchange: "orders".into(),
            routing_key: "eu".into(),
            mandatory: false,
            immediate: false,
            properties: BasicProperties::default(),
            body: "{}".into(),
            body_size: 2,
        };
        let base = dissector
            .summarize(&entry_for(publish, AmqpMethod::EmptyResponse))
            .unwrap();
        assert_eq!(base.summary, "orders");
        assert_eq!(base.summary_query, r#"request.exchange == "orders""#);
        assert_eq!(base.method, "basic publish");
        assert_eq!(base.method_query, r#"request.method == "basic publish""#);
    }

    #[test]
    fn test_summary_of_connection_start() {
        let dissector = AmqpDissector::new();
        let start = AmqpMethod::ConnectionStart {
            version_major: 0,
            version_minor: 9,
            server_properties: FieldTable::new(),
            mechanisms: "PLAIN".into(),
            locales: "en_US".into(),
        };
        let base = dissector
            .summarize(&entry_for(start, AmqpMethod::EmptyResponse))
            .unwrap();
        assert_eq!(base.summary, "0.9");
        assert_eq!(
            base.summary_query,
            "request.versionMajor == 0 and request.versionMinor == 9"
        );
    }

    #[test]
    fn test_represent_queue_declare() {
        let dissector = AmqpDissector::new();
        let entry = entry_for(
            AmqpMethod::QueueDeclare {
                queue: "jobs".into(),
                passive: false,
                durable: true,
                exclusive: false,
                auto_delete: false,
                no_wait: false,
                arguments: FieldTable::new(),
            },
            AmqpMethod::QueueDeclareOk {
                queue: "jobs".into(),
                message_count: 0,
                consumer_count: 0,
            },
        );
        let bytes = dissector.represent(&entry.request, &entry.response).unwrap();
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["request"][0]["title"], "Details");
        let rows: Value =
            serde_json::from_str(value["request"][0]["data"].as_str().unwrap()).unwrap();
        assert!(
            rows.as_array()
                .unwrap()
                .iter()
                .any(|r| r["selector"] == "request.queue" && r["value"] == "jobs")
        );
    }

    #[test]
    fn test_title_case() {
        assert_eq!(title_case("routingKey"), "Routing Key");
        assert_eq!(title_case("queue"), "Queue");
    }
}
