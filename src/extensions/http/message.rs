//! HTTP/1.x message framing over a buffered byte source.

use serde::{Deserialize, Serialize};
use std::io::{self, BufRead, Read};

use crate::api::DissectError;

const MAX_LINE_LEN: u64 = 64 * 1024;
const MAX_HEADERS: usize = 256;
/// Body bytes kept for display; the remainder is consumed and only counted.
pub const MAX_CAPTURED_BODY: usize = 256 * 1024;

const PROTO: &str = "http";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryParam {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Body {
    pub size: usize,
    pub truncated: bool,
    pub text: String,
}

impl Body {
    fn new(captured: Vec<u8>, size: usize) -> Self {
        Self {
            size,
            truncated: captured.len() < size,
            text: String::from_utf8_lossy(&captured).into_owned(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpRequest {
    pub method: String,
    pub url: String,
    pub path: String,
    pub query_string: Vec<QueryParam>,
    pub http_version: String,
    pub host: String,
    pub headers: Vec<Header>,
    pub body: Body,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpResponse {
    pub status: u16,
    pub status_text: String,
    pub http_version: String,
    pub headers: Vec<Header>,
    pub body: Body,
}

fn find_header<'a>(headers: &'a [Header], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case(name))
        .map(|h| h.value.as_str())
}

impl HttpRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }
}

impl HttpResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    pub fn content_type(&self) -> &str {
        self.header("content-type").unwrap_or("")
    }
}

/// Parsed message plus the number of bytes it occupied on the wire.
pub struct Framed<T> {
    pub message: T,
    pub size: usize,
}

pub fn is_method(token: &str) -> bool {
    matches!(
        token,
        "GET" | "POST" | "PUT" | "DELETE" | "HEAD" | "OPTIONS" | "CONNECT" | "TRACE" | "PATCH"
    )
}

/// Read the next request. `Ok(None)` means the stream ended between messages.
pub fn read_request<R: BufRead>(r: &mut R) -> Result<Option<Framed<HttpRequest>>, DissectError> {
    let mut reader = MessageReader::new(r);
    let Some(line) = reader.read_start_line()? else {
        return Ok(None);
    };

    let mut parts = line.splitn(3, ' ');
    let (Some(method), Some(target), Some(version)) = (parts.next(), parts.next(), parts.next())
    else {
        return Err(DissectError::framing(PROTO, format!("bad request line {:?}", line)));
    };
    if !is_method(method) || !version.starts_with("HTTP/1.") {
        return Err(DissectError::framing(PROTO, format!("bad request line {:?}", line)));
    }

    let headers = reader.read_headers()?;
    let host = find_header(&headers, "host").unwrap_or_default().to_string();

    let body = if is_chunked(&headers) {
        reader.read_chunked_body()?
    } else if let Some(len) = content_length(&headers)? {
        reader.read_sized_body(len)?
    } else {
        Body::default()
    };

    let (path, query) = target.split_once('?').unwrap_or((target, ""));
    let url = if target.starts_with('/') && !host.is_empty() {
        format!("http://{}{}", host, target)
    } else {
        target.to_string()
    };

    let request = HttpRequest {
        method: method.to_string(),
        url,
        path: path.to_string(),
        query_string: parse_query(query),
        http_version: version.to_string(),
        host,
        headers,
        body,
    };
    Ok(Some(Framed {
        message: request,
        size: reader.consumed,
    }))
}

/// Read the next final response, skipping interim `1xx` responses other than
/// `101 Switching Protocols`.
pub fn read_response<R: BufRead>(r: &mut R) -> Result<Option<Framed<HttpResponse>>, DissectError> {
    let mut reader = MessageReader::new(r);
    loop {
        let Some(line) = reader.read_start_line()? else {
            return Ok(None);
        };

        let mut parts = line.splitn(3, ' ');
        let version = parts.next().unwrap_or_default();
        let status = parts.next().and_then(|s| s.parse::<u16>().ok());
        let (Some(status), true) = (status, version.starts_with("HTTP/1.")) else {
            return Err(DissectError::framing(PROTO, format!("bad status line {:?}", line)));
        };
        let status_text = parts.next().unwrap_or_default().to_string();

        let headers = reader.read_headers()?;
        if (100..200).contains(&status) && status != 101 {
            continue;
        }

        let body = if status == 101 || status == 204 || status == 304 {
            Body::default()
        } else if is_chunked(&headers) {
            reader.read_chunked_body()?
        } else if let Some(len) = content_length(&headers)? {
            reader.read_sized_body(len)?
        } else {
            reader.read_body_until_eof()?
        };

        let response = HttpResponse {
            status,
            status_text,
            http_version: version.to_string(),
            headers,
            body,
        };
        return Ok(Some(Framed {
            message: response,
            size: reader.consumed,
        }));
    }
}

fn is_chunked(headers: &[Header]) -> bool {
    find_header(headers, "transfer-encoding")
        .map(|v| v.to_ascii_lowercase().contains("chunked"))
        .unwrap_or(false)
}

fn content_length(headers: &[Header]) -> Result<Option<usize>, DissectError> {
    match find_header(headers, "content-length") {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse::<usize>()
            .map(Some)
            .map_err(|_| DissectError::framing(PROTO, format!("bad content-length {:?}", value))),
    }
}

fn parse_query(query: &str) -> Vec<QueryParam> {
    query
        .split('&')
        .filter(|p| !p.is_empty())
        .map(|p| {
            let (name, value) = p.split_once('=').unwrap_or((p, ""));
            QueryParam {
                name: name.to_string(),
                value: value.to_string(),
            }
        })
        .collect()
}

fn unexpected_eof() -> DissectError {
    io::Error::from(io::ErrorKind::UnexpectedEof).into()
}

struct MessageReader<'a, R> {
    inner: &'a mut R,
    consumed: usize,
}

impl<'a, R: BufRead> MessageReader<'a, R> {
    fn new(inner: &'a mut R) -> Self {
        Self { inner, consumed: 0 }
    }

    /// One CRLF- or LF-terminated line without its terminator.
    fn read_line(&mut self) -> Result<Option<String>, DissectError> {
        let mut buf = Vec::new();
        let n = (&mut *self.inner)
            .take(MAX_LINE_LEN)
            .read_until(b'\n', &mut buf)?;
        if n == 0 {
            return Ok(None);
        }
        self.consumed += n;

        if buf.last() != Some(&b'\n') {
            if n as u64 >= MAX_LINE_LEN {
                return Err(DissectError::framing(PROTO, "line too long"));
            }
            return Err(unexpected_eof());
        }
        buf.pop();
        if buf.last() == Some(&b'\r') {
            buf.pop();
        }
        Ok(Some(String::from_utf8_lossy(&buf).into_owned()))
    }

    /// First non-empty line of a message; blank lines between messages are skipped.
    fn read_start_line(&mut self) -> Result<Option<String>, DissectError> {
        loop {
            match self.read_line()? {
                None => return Ok(None),
                Some(line) if line.is_empty() => continue,
                Some(line) => return Ok(Some(line)),
            }
        }
    }

    fn read_headers(&mut self) -> Result<Vec<Header>, DissectError> {
        let mut headers: Vec<Header> = Vec::new();
        loop {
            let line = self.read_line()?.ok_or_else(unexpected_eof)?;
            if line.is_empty() {
                return Ok(headers);
            }

            if line.starts_with([' ', '\t']) {
                // obsolete line folding
                match headers.last_mut() {
                    Some(last) => {
                        last.value.push(' ');
                        last.value.push_str(line.trim());
                    }
                    None => return Err(DissectError::framing(PROTO, "folded first header")),
                }
                continue;
            }

            let Some((name, value)) = line.split_once(':') else {
                return Err(DissectError::framing(PROTO, format!("bad header {:?}", line)));
            };
            if headers.len() >= MAX_HEADERS {
                return Err(DissectError::framing(PROTO, "too many headers"));
            }
            headers.push(Header {
                name: name.trim().to_string(),
                value: value.trim().to_string(),
            });
        }
    }

    /// Read `len` bytes, keeping at most `limit` of them in `captured`.
    fn read_into(&mut self, len: usize, captured: &mut Vec<u8>) -> Result<(), DissectError> {
        let keep = len.min(MAX_CAPTURED_BODY.saturating_sub(captured.len()));
        let kept = (&mut *self.inner).take(keep as u64).read_to_end(captured)?;
        let skipped = if len > kept {
            io::copy(
                &mut (&mut *self.inner).take((len - kept) as u64),
                &mut io::sink(),
            )? as usize
        } else {
            0
        };
        if kept + skipped < len {
            return Err(unexpected_eof());
        }
        self.consumed += len;
        Ok(())
    }

    fn read_sized_body(&mut self, len: usize) -> Result<Body, DissectError> {
        let mut captured = Vec::with_capacity(len.min(MAX_CAPTURED_BODY));
        self.read_into(len, &mut captured)?;
        Ok(Body::new(captured, len))
    }

    fn read_chunked_body(&mut self) -> Result<Body, DissectError> {
        let mut captured = Vec::new();
        let mut size = 0;
        loop {
            let line = self.read_line()?.ok_or_else(unexpected_eof)?;
            let size_field = line.split(';').next().unwrap_or_default().trim();
            let chunk_len = usize::from_str_radix(size_field, 16).map_err(|_| {
                DissectError::framing(PROTO, format!("bad chunk size {:?}", line))
            })?;

            if chunk_len == 0 {
                // trailers, terminated by an empty line
                while !self.read_line()?.ok_or_else(unexpected_eof)?.is_empty() {}
                return Ok(Body::new(captured, size));
            }

            self.read_into(chunk_len, &mut captured)?;
            size += chunk_len;

            let terminator = self.read_line()?.ok_or_else(unexpected_eof)?;
            if !terminator.is_empty() {
                return Err(DissectError::framing(PROTO, "missing chunk terminator"));
            }
        }
    }

    fn read_body_until_eof(&mut self) -> Result<Body, DissectError> {
        let mut captured = Vec::new();
        let kept = (&mut *self.inner)
            .take(MAX_CAPTURED_BODY as u64)
            .read_to_end(&mut captured)?;
        let skipped = io::copy(&mut *self.inner, &mut io::sink())? as usize;
        self.consumed += kept + skipped;
        Ok(Body::new(captured, kept + skipped))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_request_with_content_length() {
        let raw = b"POST /api/items?id=7&dry HTTP/1.1\r\nHost: shop\r\nContent-Length: 5\r\n\r\nhello";
        let mut cursor = Cursor::new(&raw[..]);
        let framed = read_request(&mut cursor).unwrap().unwrap();
        let request = framed.message;

        assert_eq!(framed.size, raw.len());
        assert_eq!(request.method, "POST");
        assert_eq!(request.path, "/api/items");
        assert_eq!(request.url, "http://shop/api/items?id=7&dry");
        assert_eq!(request.query_string.len(), 2);
        assert_eq!(request.query_string[1].value, "");
        assert_eq!(request.body.text, "hello");
        assert!(read_request(&mut cursor).unwrap().is_none());
    }

    #[test]
    fn test_pipelined_requests() {
        let raw = b"GET /a HTTP/1.1\r\nHost: h\r\n\r\nGET /b HTTP/1.1\r\nHost: h\r\n\r\n";
        let mut cursor = Cursor::new(&raw[..]);
        assert_eq!(read_request(&mut cursor).unwrap().unwrap().message.path, "/a");
        assert_eq!(read_request(&mut cursor).unwrap().unwrap().message.path, "/b");
        assert!(read_request(&mut cursor).unwrap().is_none());
    }

    #[test]
    fn test_chunked_response_with_folded_header() {
        let raw = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\nX-Long: a\r\n b\r\n\r\n4\r\nWiki\r\n5;ext=1\r\npedia\r\n0\r\n\r\n";
        let mut cursor = Cursor::new(&raw[..]);
        let response = read_response(&mut cursor).unwrap().unwrap().message;
        assert_eq!(response.status, 200);
        assert_eq!(response.body.text, "Wikipedia");
        assert_eq!(response.body.size, 9);
        assert_eq!(response.header("x-long"), Some("a b"));
    }

    #[test]
    fn test_interim_response_is_skipped() {
        let raw = b"HTTP/1.1 100 Continue\r\n\r\nHTTP/1.1 201 Created\r\nContent-Length: 0\r\n\r\n";
        let mut cursor = Cursor::new(&raw[..]);
        let response = read_response(&mut cursor).unwrap().unwrap().message;
        assert_eq!(response.status, 201);
        assert_eq!(response.status_text, "Created");
    }

    #[test]
    fn test_close_delimited_body() {
        let raw = b"HTTP/1.0 200 OK\r\n\r\nuntil the end";
        let response = read_response(&mut Cursor::new(&raw[..]))
            .unwrap()
            .unwrap()
            .message;
        assert_eq!(response.body.text, "until the end");
    }

    #[test]
    fn test_truncated_body_is_eof() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\nshort";
        match read_response(&mut Cursor::new(&raw[..])) {
            Err(DissectError::Io(e)) => assert_eq!(e.kind(), io::ErrorKind::UnexpectedEof),
            other => panic!("unexpected {:?}", other.map(|f| f.map(|m| m.message))),
        }
    }

    #[test]
    fn test_garbage_is_framing_error() {
        let raw = b"\x16\x03\x01\x00\x05hello\r\n";
        assert!(matches!(
            read_request(&mut Cursor::new(&raw[..])),
            Err(DissectError::Framing { .. })
        ));
    }

    #[test]
    fn test_large_body_is_truncated_but_consumed() {
        let body = vec![b'x'; MAX_CAPTURED_BODY + 10];
        let mut raw = format!("HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n", body.len()).into_bytes();
        raw.extend_from_slice(&body);
        raw.extend_from_slice(b"HTTP/1.1 204 No Content\r\n\r\n");

        let mut cursor = Cursor::new(&raw[..]);
        let first = read_response(&mut cursor).unwrap().unwrap().message;
        assert!(first.body.truncated);
        assert_eq!(first.body.size, MAX_CAPTURED_BODY + 10);
        assert_eq!(read_response(&mut cursor).unwrap().unwrap().message.status, 204);
    }
}
