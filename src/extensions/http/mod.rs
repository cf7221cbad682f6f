//! HTTP/1.x extension.
//!
//! Requests and responses on one connection are paired by position: the n-th
//! request with the n-th response, using the connection's [`CounterPair`].
//!
//! [`CounterPair`]: crate::api::CounterPair

mod message;

pub use message::{Body, Header, HttpRequest, HttpResponse, QueryParam};

use anyhow::{Result, bail};
use log::debug;
use serde_json::{Map, Value};
use std::io::{self, BufRead, BufReader};

use super::{Pair, Representation, Section, base_entry, from_object, row, string_query, to_object};
use crate::api::matcher::{MatchPolicy, RequestResponseMatcher};
use crate::api::{
    BaseEntry, ConnectionInfo, DissectError, Entry, GenericMessage, OutputChannelItem, Protocol,
    RequestResponsePair, TcpId, TcpReader, TrafficFilteringOptions, unix_millis,
};

pub static PROTOCOL: Protocol = Protocol {
    name: "http",
    long_name: "Hypertext Transfer Protocol -- HTTP/1.1",
    abbreviation: "HTTP",
    macro_name: "http",
    version: "1.1",
    background_color: "#205cf5",
    foreground_color: "#ffffff",
    font_size: 12,
    reference_link: "https://datatracker.ietf.org/doc/html/rfc2616",
    ports: &[80, 443, 8080],
    priority: 0,
};

const REDACTED: &str = "[REDACTED]";
const SENSITIVE_HEADERS: &[&str] = &[
    "authorization",
    "proxy-authorization",
    "cookie",
    "set-cookie",
    "x-api-key",
    "x-auth-token",
];

#[derive(Debug, Clone, PartialEq)]
pub enum HttpPayload {
    Request(HttpRequest),
    Response(HttpResponse),
}

pub fn detect(prefix: &[u8]) -> bool {
    if prefix.starts_with(b"HTTP/1.") {
        return true;
    }
    prefix
        .iter()
        .position(|&b| b == b' ')
        .and_then(|space| std::str::from_utf8(&prefix[..space]).ok())
        .is_some_and(message::is_method)
}

pub struct HttpDissector {
    matcher: RequestResponseMatcher<HttpPayload>,
}

impl Default for HttpDissector {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpDissector {
    pub fn new() -> Self {
        Self {
            matcher: Self::new_response_request_matcher(),
        }
    }

    /// Responses follow their request on the same connection, so an early
    /// response is simply parked until the request shows up.
    pub fn new_response_request_matcher() -> RequestResponseMatcher<HttpPayload> {
        RequestResponseMatcher::new(MatchPolicy::Store)
    }

    pub fn matcher(&self) -> &RequestResponseMatcher<HttpPayload> {
        &self.matcher
    }

    pub fn dissect<R: TcpReader>(
        &self,
        b: &mut BufReader<R>,
        options: &TrafficFilteringOptions,
    ) -> Result<(), DissectError> {
        loop {
            let result = if b.get_ref().is_client() {
                self.handle_request(b, options)
            } else {
                self.handle_response(b, options)
            };

            match result {
                Ok(true) => {}
                Ok(false) => return Ok(()),
                Err(DissectError::Io(e)) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    return Ok(());
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn handle_request<R: TcpReader>(
        &self,
        b: &mut BufReader<R>,
        options: &TrafficFilteringOptions,
    ) -> Result<bool, DissectError> {
        let Some(framed) = message::read_request(b)? else {
            return Ok(false);
        };
        let reader = b.get_ref();
        reader.parent().set_protocol(&PROTOCOL);

        let mut request = framed.message;
        if !options.disable_redaction {
            redact(&mut request.headers);
        }

        let counter = reader.counter_pair().next_request();
        let key = ident(reader.tcp_id(), counter);
        let message = GenericMessage {
            is_request: true,
            capture_time: reader.capture_time(),
            capture_size: framed.size,
            payload: HttpPayload::Request(request),
        };

        if let Some(pair) = self.matcher.register_request(key, message) {
            emit(reader, pair, options);
        }
        Ok(true)
    }

    fn handle_response<R: TcpReader>(
        &self,
        b: &mut BufReader<R>,
        options: &TrafficFilteringOptions,
    ) -> Result<bool, DissectError> {
        let Some(framed) = message::read_response(b)? else {
            return Ok(false);
        };
        let switching_protocols = framed.message.status == 101;
        let reader = b.get_ref();
        reader.parent().set_protocol(&PROTOCOL);

        let mut response = framed.message;
        if !options.disable_redaction {
            redact(&mut response.headers);
        }

        let counter = reader.counter_pair().next_response();
        let key = ident(&reader.tcp_id().reversed(), counter);
        let message = GenericMessage {
            is_request: false,
            capture_time: reader.capture_time(),
            capture_size: framed.size,
            payload: HttpPayload::Response(response),
        };

        if let Some(pair) = self.matcher.register_response(key, message) {
            emit(reader, pair, options);
        }

        if switching_protocols {
            debug!("{} switched protocols, no longer parsed as HTTP", reader.tcp_id());
            io::copy(b, &mut io::sink())?;
            return Ok(false);
        }
        Ok(true)
    }

    pub fn analyze(
        &self,
        item: &OutputChannelItem,
        resolved_source: &str,
        resolved_destination: &str,
    ) -> Result<Entry> {
        let Pair::Http(pair) = &item.pair else {
            bail!("{} cannot analyze a non-HTTP pair", PROTOCOL.abbreviation);
        };
        let (HttpPayload::Request(request), HttpPayload::Response(response)) =
            (&pair.request.payload, &pair.response.payload)
        else {
            bail!("HTTP pair is not request/response ordered");
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
        let request: HttpRequest = from_object(&entry.request)?;
        let response: HttpResponse = from_object(&entry.response)?;

        let mut base = base_entry(entry);
        base.summary_query = string_query("request.path", &request.path);
        base.summary = request.path;
        base.status = response.status as i64;
        base.status_query = format!("response.status == {}", response.status);
        base.method_query = string_query("request.method", &request.method);
        base.method = request.method;
        Ok(base)
    }

    pub fn represent(&self, request: &Map<String, Value>, response: &Map<String, Value>) -> Result<Vec<u8>> {
        let request: HttpRequest = from_object(request)?;
        let response: HttpResponse = from_object(response)?;

        let mut request_sections = vec![
            Section::table(
                "Details",
                &[
                    row("Method", request.method.as_str(), "request.method".into()),
                    row("URL", request.url.as_str(), "request.url".into()),
                    row("Path", request.path.as_str(), "request.path".into()),
                    row("Version", request.http_version.as_str(), "request.httpVersion".into()),
                    row("Body Size (bytes)", request.body.size, "request.body.size".into()),
                ],
            )?,
            headers_section("request", &request.headers)?,
        ];
        if !request.query_string.is_empty() {
            let rows: Vec<_> = request
                .query_string
                .iter()
                .map(|q| {
                    row(
                        &q.name,
                        q.value.as_str(),
                        format!(r#"request.queryString["{}"]"#, q.name),
                    )
                })
                .collect();
            request_sections.push(Section::table("Query String", &rows)?);
        }
        if request.body.size > 0 {
            let mime = request.header("content-type").unwrap_or_default();
            request_sections.push(Section::body("Body", mime, request.body.text.clone()));
        }

        let mut response_sections = vec![
            Section::table(
                "Details",
                &[
                    row("Status", response.status, "response.status".into()),
                    row("Status Text", response.status_text.as_str(), "response.statusText".into()),
                    row("Version", response.http_version.as_str(), "response.httpVersion".into()),
                    row("Body Size (bytes)", response.body.size, "response.body.size".into()),
                ],
            )?,
            headers_section("response", &response.headers)?,
        ];
        if response.body.size > 0 {
            response_sections.push(Section::body(
                "Body",
                response.content_type(),
                response.body.text.clone(),
            ));
        }

        Representation {
            request: request_sections,
            response: response_sections,
        }
        .to_bytes()
    }
}

/// Correlation key in client orientation: `src_dst_srcport_dstport_n`.
fn ident(client_view: &TcpId, counter: u64) -> String {
    format!(
        "{}_{}_{}_{}_{}",
        client_view.src_ip,
        client_view.dst_ip,
        client_view.src_port,
        client_view.dst_port,
        counter
    )
}

fn redact(headers: &mut [Header]) {
    for header in headers.iter_mut() {
        if SENSITIVE_HEADERS
            .iter()
            .any(|name| header.name.eq_ignore_ascii_case(name))
        {
            header.value = REDACTED.to_string();
        }
    }
}

fn is_ignored(request: &HttpRequest, options: &TrafficFilteringOptions) -> bool {
    let Some(user_agent) = request.header("user-agent") else {
        return false;
    };
    options
        .ignored_user_agents
        .iter()
        .any(|ignored| !ignored.is_empty() && user_agent.contains(ignored.as_str()))
}

fn emit<R: TcpReader>(
    reader: &R,
    pair: RequestResponsePair<HttpPayload>,
    options: &TrafficFilteringOptions,
) {
    if let HttpPayload::Request(request) = &pair.request.payload
        && is_ignored(request, options)
    {
        debug!("Skipping HTTP pair from ignored user agent on {}", reader.tcp_id());
        return;
    }

    reader.emitter().emit(OutputChannelItem {
        protocol: &PROTOCOL,
        capture: reader.capture_source(),
        timestamp: unix_millis(pair.request.capture_time),
        connection_info: ConnectionInfo::from_reader(
            reader.tcp_id(),
            reader.is_client(),
            reader.is_outgoing(),
        ),
        pair: Pair::Http(pair),
        namespace: reader.namespace().to_string(),
    });
}

fn headers_section(side: &str, headers: &[Header]) -> Result<Section> {
    let rows: Vec<_> = headers
        .iter()
        .map(|h| {
            row(
                &h.name,
                h.value.as_str(),
                format!(r#"{}.headers["{}"]"#, side, h.name.to_ascii_lowercase()),
            )
        })
        .collect();
    Section::table("Headers", &rows)
}

#[cfg(test)]
impl HttpRequest {
    pub(crate) fn parse_for_tests(raw: &[u8]) -> Self {
        message::read_request(&mut std::io::Cursor::new(raw))
            .unwrap()
            .unwrap()
            .message
    }
}

#[cfg(test)]
impl HttpResponse {
    pub(crate) fn parse_for_tests(raw: &[u8]) -> Self {
        message::read_response(&mut std::io::Cursor::new(raw))
            .unwrap()
            .unwrap()
            .message
    }
}
