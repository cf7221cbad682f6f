//! AMQP 0-9-1 wire format: frames, field tables and the methods we decode.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::{BufRead, Read};

use crate::api::{DissectError, read_sized};

pub const FRAME_METHOD: u8 = 1;
pub const FRAME_HEADER: u8 = 2;
pub const FRAME_BODY: u8 = 3;
pub const FRAME_HEARTBEAT: u8 = 8;
pub const FRAME_END: u8 = 0xce;

pub const PROTOCOL_HEADER: &[u8; 8] = b"AMQP\x00\x00\x09\x01";

const MAX_FRAME_SIZE: usize = 128 * 1024 * 1024;
const PROTO: &str = "amqp";

pub type FieldTable = BTreeMap<String, FieldValue>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    Text(String),
    Array(Vec<FieldValue>),
    Table(FieldTable),
    Void,
}

/// Content header properties of `basic` class messages.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BasicProperties {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_encoding: Option<String>,
    #[serde(skip_serializing_if = "FieldTable::is_empty")]
    pub headers: FieldTable,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delivery_mode: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expiration: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub app_id: Option<String>,
}

/// The methods this extension understands, tagged by their display name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method")]
pub enum AmqpMethod {
    #[serde(rename = "connection start", rename_all = "camelCase")]
    ConnectionStart {
        version_major: u8,
        version_minor: u8,
        server_properties: FieldTable,
        mechanisms: String,
        locales: String,
    },
    #[serde(rename = "connection start-ok", rename_all = "camelCase")]
    ConnectionStartOk {
        client_properties: FieldTable,
        mechanism: String,
        locale: String,
    },
    #[serde(rename = "connection close", rename_all = "camelCase")]
    ConnectionClose {
        reply_code: u16,
        reply_text: String,
        class_id: u16,
        method_id: u16,
    },
    #[serde(rename = "connection close-ok")]
    ConnectionCloseOk,
    #[serde(rename = "exchange declare", rename_all = "camelCase")]
    ExchangeDeclare {
        exchange: String,
        #[serde(rename = "type")]
        kind: String,
        passive: bool,
        durable: bool,
        auto_delete: bool,
        internal: bool,
        no_wait: bool,
        arguments: FieldTable,
    },
    #[serde(rename = "exchange declare-ok")]
    ExchangeDeclareOk,
    #[serde(rename = "queue declare", rename_all = "camelCase")]
    QueueDeclare {
        queue: String,
        passive: bool,
        durable: bool,
        exclusive: bool,
        auto_delete: bool,
        no_wait: bool,
        arguments: FieldTable,
    },
    #[serde(rename = "queue declare-ok", rename_all = "camelCase")]
    QueueDeclareOk {
        queue: String,
        message_count: u32,
        consumer_count: u32,
    },
    #[serde(rename = "queue bind", rename_all = "camelCase")]
    QueueBind {
        queue: String,
        exchange: String,
        routing_key: String,
        no_wait: bool,
        arguments: FieldTable,
    },
    #[serde(rename = "queue bind-ok")]
    QueueBindOk,
    #[serde(rename = "basic consume", rename_all = "camelCase")]
    BasicConsume {
        queue: String,
        consumer_tag: String,
        no_local: bool,
        no_ack: bool,
        exclusive: bool,
        no_wait: bool,
        arguments: FieldTable,
    },
    #[serde(rename = "basic consume-ok", rename_all = "camelCase")]
    BasicConsumeOk { consumer_tag: String },
    #[serde(rename = "basic publish", rename_all = "camelCase")]
    BasicPublish {
        exchange: String,
        routing_key: String,
        mandatory: bool,
        immediate: bool,
        #[serde(default)]
        properties: BasicProperties,
        #[serde(default)]
        body: String,
        #[serde(default)]
        body_size: u64,
    },
    #[serde(rename = "basic deliver", rename_all = "camelCase")]
    BasicDeliver {
        consumer_tag: String,
        delivery_tag: u64,
        redelivered: bool,
        exchange: String,
        routing_key: String,
        #[serde(default)]
        properties: BasicProperties,
        #[serde(default)]
        body: String,
        #[serde(default)]
        body_size: u64,
    },
    /// Counterpart synthesized for fire-and-forget methods.
    #[serde(rename = "empty response")]
    EmptyResponse,
}

impl AmqpMethod {
    pub fn name(&self) -> &'static str {
        match self {
            AmqpMethod::ConnectionStart { .. } => "connection start",
            AmqpMethod::ConnectionStartOk { .. } => "connection start-ok",
            AmqpMethod::ConnectionClose { .. } => "connection close",
            AmqpMethod::ConnectionCloseOk => "connection close-ok",
            AmqpMethod::ExchangeDeclare { .. } => "exchange declare",
            AmqpMethod::ExchangeDeclareOk => "exchange declare-ok",
            AmqpMethod::QueueDeclare { .. } => "queue declare",
            AmqpMethod::QueueDeclareOk { .. } => "queue declare-ok",
            AmqpMethod::QueueBind { .. } => "queue bind",
            AmqpMethod::QueueBindOk => "queue bind-ok",
            AmqpMethod::BasicConsume { .. } => "basic consume",
            AmqpMethod::BasicConsumeOk { .. } => "basic consume-ok",
            AmqpMethod::BasicPublish { .. } => "basic publish",
            AmqpMethod::BasicDeliver { .. } => "basic deliver",
            AmqpMethod::EmptyResponse => "empty response",
        }
    }
}

#[derive(Debug)]
pub enum Frame {
    Method {
        channel: u16,
        class_id: u16,
        method_id: u16,
        /// `None` for methods this extension does not decode.
        method: Option<AmqpMethod>,
    },
    Header {
        channel: u16,
        body_size: u64,
        properties: BasicProperties,
    },
    Body {
        channel: u16,
        data: Vec<u8>,
    },
    Heartbeat,
}

/// Read one frame, skipping a protocol header if the client sends one.
///
/// `Ok(None)` means the stream ended on a frame boundary. The second value is
/// the number of bytes consumed.
pub fn read_frame<R: BufRead>(r: &mut R) -> Result<Option<(Frame, usize)>, DissectError> {
    let mut consumed = 0;
    loop {
        let buf = r.fill_buf()?;
        if buf.is_empty() {
            return Ok(None);
        }
        if buf[0] != b'A' {
            break;
        }
        let mut header = [0u8; 8];
        r.read_exact(&mut header)?;
        if &header[..5] != b"AMQP\x00" {
            return Err(DissectError::framing(PROTO, "bad protocol header"));
        }
        consumed += header.len();
    }

    let mut head = [0u8; 7];
    r.read_exact(&mut head)?;
    let frame_type = head[0];
    let channel = u16::from_be_bytes([head[1], head[2]]);
    let size = u32::from_be_bytes([head[3], head[4], head[5], head[6]]) as usize;
    if size > MAX_FRAME_SIZE {
        return Err(DissectError::framing(PROTO, format!("frame of {} bytes", size)));
    }

    let payload = read_sized(r, size)?;
    let mut end = [0u8; 1];
    r.read_exact(&mut end)?;
    if end[0] != FRAME_END {
        return Err(DissectError::framing(
            PROTO,
            format!("bad frame end 0x{:02x}", end[0]),
        ));
    }
    consumed += head.len() + size + 1;

    let frame = match frame_type {
        FRAME_METHOD => parse_method_frame(channel, &payload)?,
        FRAME_HEADER => parse_header_frame(channel, &payload)?,
        FRAME_BODY => Frame::Body {
            channel,
            data: payload,
        },
        FRAME_HEARTBEAT => Frame::Heartbeat,
        other => {
            return Err(DissectError::framing(
                PROTO,
                format!("unknown frame type {}", other),
            ));
        }
    };
    Ok(Some((frame, consumed)))
}

fn parse_method_frame(channel: u16, payload: &[u8]) -> Result<Frame, DissectError> {
    let mut args = Args::new(payload);
    let class_id = args.u16()?;
    let method_id = args.u16()?;

    let method = match (class_id, method_id) {
        (10, 10) => Some(AmqpMethod::ConnectionStart {
            version_major: args.u8()?,
            version_minor: args.u8()?,
            server_properties: args.table()?,
            mechanisms: args.long_string()?,
            locales: args.long_string()?,
        }),
        (10, 11) => {
            let client_properties = args.table()?;
            let mechanism = args.short_string()?;
            let _response = args.long_string()?;
            Some(AmqpMethod::ConnectionStartOk {
                client_properties,
                mechanism,
                locale: args.short_string()?,
            })
        }
        (10, 50) => Some(AmqpMethod::ConnectionClose {
            reply_code: args.u16()?,
            reply_text: args.short_string()?,
            class_id: args.u16()?,
            method_id: args.u16()?,
        }),
        (10, 51) => Some(AmqpMethod::ConnectionCloseOk),
        (40, 10) => {
            let _reserved = args.u16()?;
            Some(AmqpMethod::ExchangeDeclare {
                exchange: args.short_string()?,
                kind: args.short_string()?,
                passive: args.bit()?,
                durable: args.bit()?,
                auto_delete: args.bit()?,
                internal: args.bit()?,
                no_wait: args.bit()?,
                arguments: args.table()?,
            })
        }
        (40, 11) => Some(AmqpMethod::ExchangeDeclareOk),
        (50, 10) => {
            let _reserved = args.u16()?;
            Some(AmqpMethod::QueueDeclare {
                queue: args.short_string()?,
                passive: args.bit()?,
                durable: args.bit()?,
                exclusive: args.bit()?,
                auto_delete: args.bit()?,
                no_wait: args.bit()?,
                arguments: args.table()?,
            })
        }
        (50, 11) => Some(AmqpMethod::QueueDeclareOk {
            queue: args.short_string()?,
            message_count: args.u32()?,
            consumer_count: args.u32()?,
        }),
        (50, 20) => {
            let _reserved = args.u16()?;
            Some(AmqpMethod::QueueBind {
                queue: args.short_string()?,
                exchange: args.short_string()?,
                routing_key: args.short_string()?,
                no_wait: args.bit()?,
                arguments: args.table()?,
            })
        }
        (50, 21) => Some(AmqpMethod::QueueBindOk),
        (60, 20) => {
            let _reserved = args.u16()?;
            Some(AmqpMethod::BasicConsume {
                queue: args.short_string()?,
                consumer_tag: args.short_string()?,
                no_local: args.bit()?,
                no_ack: args.bit()?,
                exclusive: args.bit()?,
                no_wait: args.bit()?,
                arguments: args.table()?,
            })
        }
        (60, 21) => Some(AmqpMethod::BasicConsumeOk {
            consumer_tag: args.short_string()?,
        }),
        (60, 40) => {
            let _reserved = args.u16()?;
            Some(AmqpMethod::BasicPublish {
                exchange: args.short_string()?,
                routing_key: args.short_string()?,
                mandatory: args.bit()?,
                immediate: args.bit()?,
                properties: BasicProperties::default(),
                body: String::new(),
                body_size: 0,
            })
        }
        (60, 60) => Some(AmqpMethod::BasicDeliver {
            consumer_tag: args.short_string()?,
            delivery_tag: args.u64()?,
            redelivered: args.bit()?,
            exchange: args.short_string()?,
            routing_key: args.short_string()?,
            properties: BasicProperties::default(),
            body: String::new(),
            body_size: 0,
        }),
        _ => None,
    };

    Ok(Frame::Method {
        channel,
        class_id,
        method_id,
        method,
    })
}

fn parse_header_frame(channel: u16, payload: &[u8]) -> Result<Frame, DissectError> {
    let mut args = Args::new(payload);
    let _class_id = args.u16()?;
    let _weight = args.u16()?;
    let body_size = args.u64()?;
    let flags = args.u16()?;

    let mut properties = BasicProperties::default();
    let has = |bit: u16| flags & (1 << bit) != 0;
    if has(15) {
        properties.content_type = Some(args.short_string()?);
    }
    if has(14) {
        properties.content_encoding = Some(args.short_string()?);
    }
    if has(13) {
        properties.headers = args.table()?;
    }
    if has(12) {
        properties.delivery_mode = Some(args.u8()?);
    }
    if has(11) {
        properties.priority = Some(args.u8()?);
    }
    if has(10) {
        properties.correlation_id = Some(args.short_string()?);
    }
    if has(9) {
        properties.reply_to = Some(args.short_string()?);
    }
    if has(8) {
        properties.expiration = Some(args.short_string()?);
    }
    if has(7) {
        properties.message_id = Some(args.short_string()?);
    }
    if has(6) {
        properties.timestamp = Some(args.u64()?);
    }
    if has(5) {
        properties.kind = Some(args.short_string()?);
    }
    if has(4) {
        properties.user_id = Some(args.short_string()?);
    }
    if has(3) {
        properties.app_id = Some(args.short_string()?);
    }

    Ok(Frame::Header {
        channel,
        body_size,
        properties,
    })
}

fn truncated() -> DissectError {
    DissectError::framing(PROTO, "truncated method arguments")
}

/// Cursor over method arguments. Consecutive bit fields share octets.
struct Args<'a> {
    data: &'a [u8],
    pos: usize,
    bits: u8,
    bit_index: u8,
}

impl<'a> Args<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            pos: 0,
            bits: 0,
            bit_index: 8,
        }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], DissectError> {
        self.bit_index = 8;
        let slice = self
            .data
            .get(self.pos..self.pos + n)
            .ok_or_else(truncated)?;
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, DissectError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, DissectError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, DissectError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Result<u64, DissectError> {
        let b = self.take(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(b);
        Ok(u64::from_be_bytes(raw))
    }

    fn bit(&mut self) -> Result<bool, DissectError> {
        if self.bit_index >= 8 {
            self.bits = self.u8()?;
            self.bit_index = 0;
        }
        let value = self.bits & (1 << self.bit_index) != 0;
        self.bit_index += 1;
        Ok(value)
    }

    fn short_string(&mut self) -> Result<String, DissectError> {
        let len = self.u8()? as usize;
        Ok(String::from_utf8_lossy(self.take(len)?).into_owned())
    }

    fn long_string(&mut self) -> Result<String, DissectError> {
        let len = self.u32()? as usize;
        Ok(String::from_utf8_lossy(self.take(len)?).into_owned())
    }

    fn table(&mut self) -> Result<FieldTable, DissectError> {
        let len = self.u32()? as usize;
        let mut inner = Args::new(self.take(len)?);
        let mut table = FieldTable::new();
        while inner.pos < inner.data.len() {
            let name = inner.short_string()?;
            let value = inner.field_value()?;
            table.insert(name, value);
        }
        Ok(table)
    }

    fn array(&mut self) -> Result<Vec<FieldValue>, DissectError> {
        let len = self.u32()? as usize;
        let mut inner = Args::new(self.take(len)?);
        let mut values = Vec::new();
        while inner.pos < inner.data.len() {
            values.push(inner.field_value()?);
        }
        Ok(values)
    }

    fn field_value(&mut self) -> Result<FieldValue, DissectError> {
        let value = match self.u8()? {
            b't' => FieldValue::Bool(self.u8()? != 0),
            b'b' => FieldValue::Int(self.u8()? as i8 as i64),
            b'B' => FieldValue::UInt(self.u8()? as u64),
            b's' => FieldValue::Int(self.u16()? as i16 as i64),
            b'u' => FieldValue::UInt(self.u16()? as u64),
            b'I' => FieldValue::Int(self.u32()? as i32 as i64),
            b'i' => FieldValue::UInt(self.u32()? as u64),
            b'l' => FieldValue::Int(self.u64()? as i64),
            b'L' => FieldValue::UInt(self.u64()?),
            b'f' => FieldValue::Float(f32::from_bits(self.u32()?) as f64),
            b'd' => FieldValue::Float(f64::from_bits(self.u64()?)),
            b'D' => {
                let scale = self.u8()? as i32;
                let digits = self.u32()? as i32 as f64;
                FieldValue::Float(digits / 10f64.powi(scale))
            }
            b'S' => FieldValue::Text(self.long_string()?),
            b'x' => {
                let len = self.u32()? as usize;
                FieldValue::Text(String::from_utf8_lossy(self.take(len)?).into_owned())
            }
            b'A' => FieldValue::Array(self.array()?),
            b'T' => FieldValue::UInt(self.u64()?),
            b'F' => FieldValue::Table(self.table()?),
            b'V' => FieldValue::Void,
            other => {
                return Err(DissectError::framing(
                    PROTO,
                    format!("unknown field type {:?}", other as char),
                ));
            }
        };
        Ok(value)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::Cursor;

    pub(crate) fn frame(frame_type: u8, channel: u16, payload: &[u8]) -> Vec<u8> {
        let mut out = vec![frame_type];
        out.extend_from_slice(&channel.to_be_bytes());
        out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        out.extend_from_slice(payload);
        out.push(FRAME_END);
        out
    }

    pub(crate) fn short(s: &str) -> Vec<u8> {
        let mut out = vec![s.len() as u8];
        out.extend_from_slice(s.as_bytes());
        out
    }

    pub(crate) fn publish_frames(channel: u16, exchange: &str, routing_key: &str, body: &[u8]) -> Vec<u8> {
        let mut method = vec![0, 60, 0, 40, 0, 0];
        method.extend(short(exchange));
        method.extend(short(routing_key));
        method.push(0b01); // mandatory

        let mut header = vec![0, 60, 0, 0];
        header.extend_from_slice(&(body.len() as u64).to_be_bytes());
        header.extend_from_slice(&(1u16 << 15).to_be_bytes());
        header.extend(short("text/plain"));

        let mut out = frame(FRAME_METHOD, channel, &method);
        out.extend(frame(FRAME_HEADER, channel, &header));
        out.extend(frame(FRAME_BODY, channel, body));
        out
    }

    #[test]
    fn test_protocol_header_then_publish() {
        let mut raw = PROTOCOL_HEADER.to_vec();
        raw.extend(publish_frames(1, "orders", "eu", b"{}"));
        let mut cursor = Cursor::new(raw);

        let (frame, size) = read_frame(&mut cursor).unwrap().unwrap();
        assert_eq!(size, 8 + 7 + 17 + 1);
        match frame {
            Frame::Method {
                method:
                    Some(AmqpMethod::BasicPublish {
                        exchange,
                        routing_key,
                        mandatory,
                        immediate,
                        ..
                    }),
                ..
            } => {
                assert_eq!(exchange, "orders");
                assert_eq!(routing_key, "eu");
                assert!(mandatory);
                assert!(!immediate);
            }
            other => panic!("unexpected {:?}", other),
        }

        match read_frame(&mut cursor).unwrap().unwrap().0 {
            Frame::Header {
                body_size,
                properties,
                ..
            } => {
                assert_eq!(body_size, 2);
                assert_eq!(properties.content_type.as_deref(), Some("text/plain"));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(
            read_frame(&mut cursor).unwrap().unwrap().0,
            Frame::Body { .. }
        ));
        assert!(read_frame(&mut cursor).unwrap().is_none());
    }

    #[test]
    fn test_field_table() {
        let mut table = Vec::new();
        table.extend(short("durable"));
        table.push(b't');
        table.push(1);
        table.extend(short("x-max-length"));
        table.push(b'I');
        table.extend_from_slice(&1000i32.to_be_bytes());
        table.extend(short("name"));
        table.push(b'S');
        table.extend_from_slice(&3u32.to_be_bytes());
        table.extend_from_slice(b"abc");

        let mut raw = (table.len() as u32).to_be_bytes().to_vec();
        raw.extend(table);
        let parsed = Args::new(&raw).table().unwrap();

        assert_eq!(parsed["durable"], FieldValue::Bool(true));
        assert_eq!(parsed["x-max-length"], FieldValue::Int(1000));
        assert_eq!(parsed["name"], FieldValue::Text("abc".into()));
    }

    #[test]
    fn test_bad_frame_end() {
        let mut raw = frame(FRAME_HEARTBEAT, 0, &[]);
        *raw.last_mut().unwrap() = 0x00;
        assert!(matches!(
            read_frame(&mut Cursor::new(raw)),
            Err(DissectError::Framing { .. })
        ));
    }

    #[test]
    fn test_large_frame_size_without_payload_ends_at_eof() {
        let mut raw = vec![FRAME_BODY, 0, 1];
        raw.extend_from_slice(&(MAX_FRAME_SIZE as u32).to_be_bytes());
        raw.extend_from_slice(b"partial");
        let mut cursor = std::io::Cursor::new(raw);
        match read_frame(&mut cursor) {
            Err(DissectError::Io(e)) => {
                assert_eq!(e.kind(), std::io::ErrorKind::UnexpectedEof)
            }
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[test]
    fn test_method_serializes_with_name() {
        let method = AmqpMethod::QueueDeclareOk {
            queue: "jobs".into(),
            message_count: 3,
            consumer_count: 1,
        };
        let value = serde_json::to_value(&method).unwrap();
        assert_eq!(value["method"], "queue declare-ok");
        assert_eq!(value["messageCount"], 3);
        let back: AmqpMethod = serde_json::from_value(value).unwrap();
        assert_eq!(back, method);
    }
}
