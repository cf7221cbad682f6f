//! Kafka extension.
//!
//! Requests and responses carry a correlation id, so the server side does not
//! depend on ordering: a response waits a bounded time for its request.

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::io::{self, BufReader, Read};
use std::time::Duration;

use super::{
    Pair, Representation, Section, base_entry, from_object, row, string_query, to_object,
};
use crate::api::matcher::{MatchPolicy, RequestResponseMatcher};
use crate::api::{
    BaseEntry, ConnectionInfo, DissectError, Entry, GenericMessage, OutputChannelItem, Protocol,
    RequestResponsePair, TcpReader, TrafficFilteringOptions, read_sized, unix_millis,
};

pub static PROTOCOL: Protocol = Protocol {
    name: "kafka",
    long_name: "Apache Kafka Protocol",
    abbreviation: "KAFKA",
    macro_name: "kafka",
    version: "12",
    background_color: "#000000",
    foreground_color: "#ffffff",
    font_size: 11,
    reference_link: "https://kafka.apache.org/protocol",
    ports: &[9092],
    priority: 2,
};

const PROTO: &str = "kafka";
const MAX_MESSAGE_SIZE: usize = 100 * 1024 * 1024;
const RESPONSE_WAIT: Duration = Duration::from_secs(3);

const API_KEYS: &[&str] = &[
    "Produce",
    "Fetch",
    "ListOffsets",
    "Metadata",
    "LeaderAndIsr",
    "StopReplica",
    "UpdateMetadata",
    "ControlledShutdown",
    "OffsetCommit",
    "OffsetFetch",
    "FindCoordinator",
    "JoinGroup",
    "Heartbeat",
    "LeaveGroup",
    "SyncGroup",
    "DescribeGroups",
    "ListGroups",
    "SaslHandshake",
    "ApiVersions",
    "CreateTopics",
    "DeleteTopics",
    "DeleteRecords",
    "InitProducerId",
    "OffsetForLeaderEpoch",
    "AddPartitionsToTxn",
    "AddOffsetsToTxn",
    "EndTxn",
    "WriteTxnMarkers",
    "TxnOffsetCommit",
    "DescribeAcls",
    "CreateAcls",
    "DeleteAcls",
    "DescribeConfigs",
    "AlterConfigs",
    "AlterReplicaLogDirs",
    "DescribeLogDirs",
    "SaslAuthenticate",
    "CreatePartitions",
    "CreateDelegationToken",
    "RenewDelegationToken",
    "ExpireDelegationToken",
    "DescribeDelegationToken",
    "DeleteGroups",
    "ElectLeaders",
    "IncrementalAlterConfigs",
    "AlterPartitionReassignments",
    "ListPartitionReassignments",
    "OffsetDelete",
    "DescribeClientQuotas",
    "AlterClientQuotas",
];

pub fn api_key_name(api_key: i16) -> &'static str {
    usize::try_from(api_key)
        .ok()
        .and_then(|i| API_KEYS.get(i).copied())
        .unwrap_or("Unknown")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KafkaRequest {
    pub size: i32,
    pub api_key: i16,
    pub api_key_name: String,
    pub api_version: i16,
    pub correlation_id: i32,
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KafkaResponse {
    pub size: i32,
    pub correlation_id: i32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum KafkaPayload {
    Request(KafkaRequest),
    Response(KafkaResponse),
}

pub fn detect(prefix: &[u8]) -> bool {
    let mut cursor = Cursor::new(prefix);
    let (Some(size), Some(api_key), Some(api_version), Some(_), Some(client_id_len)) = (
        cursor.i32(),
        cursor.i16(),
        cursor.i16(),
        cursor.i32(),
        cursor.i16(),
    ) else {
        return false;
    };
    size >= 10
        && (size as usize) <= MAX_MESSAGE_SIZE
        && (0..API_KEYS.len() as i16).contains(&api_key)
        && (0..=20).contains(&api_version)
        && client_id_len >= -1
        && i32::from(client_id_len) <= size - 10
}

pub struct KafkaDissector {
    matcher: RequestResponseMatcher<KafkaPayload>,
}

impl Default for KafkaDissector {
    fn default() -> Self {
        Self::new()
    }
}

impl KafkaDissector {
    pub fn new() -> Self {
        Self {
            matcher: Self::new_response_request_matcher(),
        }
    }

    /// Both directions run concurrently, so a response may be parsed before
    /// its request. It waits for the request instead of being stored.
    pub fn new_response_request_matcher() -> RequestResponseMatcher<KafkaPayload> {
        RequestResponseMatcher::new(MatchPolicy::Wait(RESPONSE_WAIT))
    }

    pub fn matcher(&self) -> &RequestResponseMatcher<KafkaPayload> {
        &self.matcher
    }

    pub fn dissect<R: TcpReader>(
        &self,
        b: &mut BufReader<R>,
        _options: &TrafficFilteringOptions,
    ) -> Result<(), DissectError> {
        loop {
            let message = match read_message(b) {
                Ok(Some(message)) => message,
                Ok(None) => return Ok(()),
                Err(DissectError::Io(e)) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    return Ok(());
                }
                Err(e) => return Err(e),
            };
            let reader = b.get_ref();
            let capture_size = message.len() + 4;

            if reader.is_client() {
                let request = parse_request(&message)?;
                reader.parent().set_protocol(&PROTOCOL);
                let key = ident(reader, request.correlation_id);
                let message = GenericMessage {
                    is_request: true,
                    capture_time: reader.capture_time(),
                    capture_size,
                    payload: KafkaPayload::Request(request),
                };
                if let Some(pair) = self.matcher.register_request(key, message) {
                    emit(reader, pair);
                }
            } else {
                let response = parse_response(&message)?;
                reader.parent().set_protocol(&PROTOCOL);
                let key = ident(reader, response.correlation_id);
                let message = GenericMessage {
                    is_request: false,
                    capture_time: reader.capture_time(),
                    capture_size,
                    payload: KafkaPayload::Response(response),
                };
                if let Some(pair) = self.matcher.register_response(key, message) {
                    emit(reader, pair);
                }
            }
        }
    }

    pub fn analyze(
        &self,
        item: &OutputChannelItem,
        resolved_source: &str,
        resolved_destination: &str,
    ) -> Result<Entry> {
        let Pair::Kafka(pair) = &item.pair else {
            bail!("{} cannot analyze a non-Kafka pair", PROTOCOL.abbreviation);
        };
        let (KafkaPayload::Request(request), KafkaPayload::Response(response)) =
            (&pair.request.payload, &pair.response.payload)
        else {
            bail!("Kafka pair is not request/response ordered");
        };

        Ok(super::new_entry(
            item,
            pair,
            resolved_source,
            resolved_destination,
            to_object(request)?,
            to_object(response)?,
        ))
    }

    pub fn summarize(&self, entry: &Entry) -> Result<BaseEntry> {
        let request: KafkaRequest = from_object(&entry.request)?;

        let mut base = base_entry(entry);
        match &request.topic {
            Some(topic) => {
                base.summary = topic.clone();
                base.summary_query = string_query("request.topic", topic);
            }
            None => {
                let client_id = request.client_id.clone().unwrap_or_default();
                base.summary_query = string_query("request.clientId", &client_id);
                base.summary = client_id;
            }
        }
        base.method_query = string_query("request.apiKeyName", &request.api_key_name);
        base.method = request.api_key_name;
        Ok(base)
    }

    pub fn represent(&self, request: &Map<String, Value>, response: &Map<String, Value>) -> Result<Vec<u8>> {
        let request: KafkaRequest = from_object(request)?;
        let response: KafkaResponse = from_object(response)?;

        let mut request_rows = vec![
            row("API Key", request.api_key_name.as_str(), "request.apiKeyName".into()),
            row("API Version", request.api_version, "request.apiVersion".into()),
            row("Correlation ID", request.correlation_id, "request.correlationId".into()),
            row(
                "Client ID",
                request.client_id.clone().unwrap_or_default(),
                "request.clientId".into(),
            ),
            row("Size", request.size, "request.size".into()),
        ];
        if let Some(topic) = &request.topic {
            request_rows.push(row("Topic", topic.as_str(), "request.topic".into()));
        }

        Representation {
            request: vec![Section::table("Details", &request_rows)?],
            response: vec![Section::table(
                "Details",
                &[
                    row("Correlation ID", response.correlation_id, "response.correlationId".into()),
                    row("Size", response.size, "response.size".into()),
                ],
            )?],
        }
        .to_bytes()
    }
}

/// `{client}:{port}->{server}:{port}::{correlation_id}`
fn ident<R: TcpReader>(reader: &R, correlation_id: i32) -> String {
    let id = reader.tcp_id();
    if reader.is_client() {
        format!(
            "{}:{}->{}:{}::{}",
            id.src_ip, id.src_port, id.dst_ip, id.dst_port, correlation_id
        )
    } else {
        format!(
            "{}:{}->{}:{}::{}",
            id.dst_ip, id.dst_port, id.src_ip, id.src_port, correlation_id
        )
    }
}

fn emit<R: TcpReader>(reader: &R, pair: RequestResponsePair<KafkaPayload>) {
    reader.emitter().emit(OutputChannelItem {
        protocol: &PROTOCOL,
        capture: reader.capture_source(),
        timestamp: unix_millis(pair.request.capture_time),
        connection_info: ConnectionInfo::from_reader(
            reader.tcp_id(),
            reader.is_client(),
            reader.is_outgoing(),
        ),
        pair: Pair::Kafka(pair),
        namespace: reader.namespace().to_string(),
    });
}

/// Read one size-prefixed message. `Ok(None)` on a clean end of stream.
fn read_message<R: Read>(r: &mut R) -> Result<Option<Vec<u8>>, DissectError> {
    let mut size = [0u8; 4];
    let mut filled = 0;
    while filled < size.len() {
        let n = r.read(&mut size[filled..])?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
        }
        filled += n;
    }

    let size = i32::from_be_bytes(size);
    if size < 4 || size as usize > MAX_MESSAGE_SIZE {
        return Err(DissectError::framing(PROTO, format!("message size {}", size)));
    }
    let message = read_sized(r, size as usize)?;
    Ok(Some(message))
}

fn parse_request(message: &[u8]) -> Result<KafkaRequest, DissectError> {
    let mut cursor = Cursor::new(message);
    let truncated = || DissectError::framing(PROTO, "truncated request header");
    let api_key = cursor.i16().ok_or_else(truncated)?;
    let api_version = cursor.i16().ok_or_else(truncated)?;
    let correlation_id = cursor.i32().ok_or_else(truncated)?;
    let client_id = cursor.nullable_string().ok_or_else(truncated)?;
    if !(0..API_KEYS.len() as i16).contains(&api_key) {
        return Err(DissectError::framing(PROTO, format!("unknown api key {}", api_key)));
    }

    Ok(KafkaRequest {
        size: message.len() as i32,
        api_key,
        api_key_name: api_key_name(api_key).to_string(),
        api_version,
        correlation_id,
        client_id,
        topic: first_topic(api_key, api_version, cursor),
    })
}

fn parse_response(message: &[u8]) -> Result<KafkaResponse, DissectError> {
    let mut cursor = Cursor::new(message);
    let correlation_id = cursor
        .i32()
        .ok_or_else(|| DissectError::framing(PROTO, "truncated response header"))?;
    Ok(KafkaResponse {
        size: message.len() as i32,
        correlation_id,
    })
}

/// First topic named by a Produce, Fetch or Metadata request body, for the
/// versions that still use classic (non-compact) encodings.
fn first_topic(api_key: i16, api_version: i16, mut body: Cursor<'_>) -> Option<String> {
    match (api_key, api_version) {
        (0, 0..=8) => {
            if api_version >= 3 {
                body.nullable_string()?;
            }
            body.i16()?; // acks
            body.i32()?; // timeout
        }
        (1, 0..=11) => {
            body.i32()?; // replica id
            body.i32()?; // max wait
            body.i32()?; // min bytes
            if api_version >= 3 {
                body.i32()?;
            }
            if api_version >= 4 {
                body.skip(1)?;
            }
            if api_version >= 7 {
                body.i32()?; // session id
                body.i32()?; // session epoch
            }
        }
        (3, 0..=8) => {}
        _ => return None,
    }
    if body.i32()? < 1 {
        return None;
    }
    body.nullable_string()?
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        let slice = self.data.get(self.pos..self.pos.checked_add(n)?)?;
        self.pos += n;
        Some(slice)
    }

    fn skip(&mut self, n: usize) -> Option<()> {
        self.take(n).map(|_| ())
    }

    fn i16(&mut self) -> Option<i16> {
        self.take(2).map(|b| i16::from_be_bytes([b[0], b[1]]))
    }

    fn i32(&mut self) -> Option<i32> {
        self.take(4)
            .map(|b| i32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// `Some(None)` for a null string, `None` when truncated.
    fn nullable_string(&mut self) -> Option<Option<String>> {
        let len = self.i16()?;
        if len < 0 {
            return Some(None);
        }
        let bytes = self.take(len as usize)?;
        Some(Some(String::from_utf8_lossy(bytes).into_owned()))
    }
}
