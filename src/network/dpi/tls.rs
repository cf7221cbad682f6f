//! TLS ClientHello inspection.
//!
//! Only the first handshake record of a client stream is looked at. We want the
//! server name the client asked for, plus the ALPN list and offered version for
//! diagnostics. Truncated records are parsed as far as they go.

use log::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsVersion {
    Tls10,
    Tls11,
    Tls12,
    Tls13,
}

impl TlsVersion {
    fn from_bytes(major: u8, minor: u8) -> Option<Self> {
        match (major, minor) {
            (0x03, 0x01) => Some(TlsVersion::Tls10),
            (0x03, 0x02) => Some(TlsVersion::Tls11),
            (0x03, 0x03) => Some(TlsVersion::Tls12),
            (0x03, 0x04) => Some(TlsVersion::Tls13),
            _ => None,
        }
    }
}

/// What a ClientHello tells us about the connection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientHello {
    pub version: Option<TlsVersion>,
    /// Complete server name. Truncated names are not reported.
    pub sni: Option<String>,
    pub alpn: Vec<String>,
}

pub fn is_tls_handshake(payload: &[u8]) -> bool {
    if payload.len() < 5 {
        return false;
    }

    // Record header: content type 0x16, version 3.1-3.4, length
    payload[0] == 0x16 && payload[1] == 0x03 && (0x01..=0x04).contains(&payload[2])
}

/// Parse a ClientHello out of the start of a client stream.
///
/// Returns `None` when the payload is not a TLS handshake record carrying a
/// ClientHello.
pub fn parse_client_hello(payload: &[u8]) -> Option<ClientHello> {
    if !is_tls_handshake(payload) {
        return None;
    }

    let record_length = u16::from_be_bytes([payload[3], payload[4]]) as usize;
    if record_length > 16384 + 2048 {
        return None;
    }

    let handshake = &payload[5..5 + (payload.len() - 5).min(record_length)];
    if handshake.len() < 4 || handshake[0] != 0x01 {
        return None;
    }

    let handshake_length =
        u32::from_be_bytes([0, handshake[1], handshake[2], handshake[3]]) as usize;
    let body = &handshake[4..4 + (handshake.len() - 4).min(handshake_length)];

    let mut hello = ClientHello {
        version: TlsVersion::from_bytes(payload[1], payload[2]),
        ..Default::default()
    };
    parse_client_hello_body(body, &mut hello);

    if let Some(sni) = &hello.sni {
        debug!("TLS ClientHello: SNI={}, ALPN={:?}", sni, hello.alpn);
    }
    Some(hello)
}

fn parse_client_hello_body(data: &[u8], hello: &mut ClientHello) {
    if data.len() < 34 {
        return;
    }
    if let Some(version) = TlsVersion::from_bytes(data[0], data[1]) {
        hello.version = Some(version);
    }

    // Skip client random
    let mut offset = 34;

    let Some(&session_id_len) = data.get(offset) else {
        return;
    };
    offset += 1 + session_id_len as usize;

    let Some(cipher_suites_len) = read_u16(data, offset) else {
        return;
    };
    offset += 2 + cipher_suites_len as usize;

    let Some(&compression_len) = data.get(offset) else {
        return;
    };
    offset += 1 + compression_len as usize;

    let Some(extensions_len) = read_u16(data, offset) else {
        return;
    };
    offset += 2;

    if offset < data.len() {
        let end = data.len().min(offset + extensions_len as usize);
        parse_extensions(&data[offset..end], hello);
    }
}

fn parse_extensions(data: &[u8], hello: &mut ClientHello) {
    let mut offset = 0;

    while offset + 4 <= data.len() {
        let ext_type = u16::from_be_bytes([data[offset], data[offset + 1]]);
        let ext_len = u16::from_be_bytes([data[offset + 2], data[offset + 3]]) as usize;
        let available = data.len().saturating_sub(offset + 4).min(ext_len);
        let ext_data = &data[offset + 4..offset + 4 + available];

        match ext_type {
            0x0000 => hello.sni = parse_sni(ext_data),
            0x0010 => hello.alpn = parse_alpn(ext_data),
            0x002b => {
                if let Some(version) = parse_supported_versions(ext_data) {
                    hello.version = Some(version);
                }
            }
            _ => {}
        }

        offset += 4 + ext_len;
    }
}

fn parse_sni(data: &[u8]) -> Option<String> {
    // list length (2), name type (1, host_name = 0), name length (2)
    if data.len() < 5 || data[2] != 0x00 {
        return None;
    }

    let name_len = u16::from_be_bytes([data[3], data[4]]) as usize;
    let name = data.get(5..5 + name_len)?;
    let name = std::str::from_utf8(name).ok()?;

    if name.is_empty() || !name.chars().all(|c| c.is_ascii_graphic()) {
        return None;
    }
    Some(name.to_string())
}

fn parse_alpn(data: &[u8]) -> Vec<String> {
    let mut protocols = Vec::new();
    let Some(list_len) = read_u16(data, 0) else {
        return protocols;
    };

    let end = data.len().min(2 + list_len as usize);
    let mut offset = 2;
    while offset < end {
        let len = data[offset] as usize;
        offset += 1;
        match data.get(offset..offset + len) {
            Some(proto) => {
                if let Ok(proto) = std::str::from_utf8(proto) {
                    protocols.push(proto.to_string());
                }
            }
            None => break,
        }
        offset += len;
    }
    protocols
}

fn parse_supported_versions(data: &[u8]) -> Option<TlsVersion> {
    let list_len = *data.first()? as usize;
    data.get(1..1 + list_len)?
        .chunks_exact(2)
        .filter_map(|pair| TlsVersion::from_bytes(pair[0], pair[1]))
        .max_by_key(|version| *version as u8)
}

fn read_u16(data: &[u8], offset: usize) -> Option<u16> {
    data.get(offset..offset + 2)
        .map(|b| u16::from_be_bytes([b[0], b[1]]))
}
