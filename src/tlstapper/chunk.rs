//! Binary layouts of the records written by the TLS instrumentation.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr};

use crate::api::TcpId;

/// Bytes of plaintext carried by one chunk record
pub const CHUNK_DATA_SIZE: usize = 4096;
const CHUNK_HEADER_SIZE: usize = 7 * 4 + 16;
pub const CHUNK_RECORD_SIZE: usize = CHUNK_HEADER_SIZE + CHUNK_DATA_SIZE;

/// Bytes of plaintext carried by one Go runtime event
pub const GOLANG_DATA_SIZE: usize = 512 * 1024;
const GOLANG_HEADER_SIZE: usize = 20;

const FLAG_CLIENT: u32 = 1 << 0;
const FLAG_READ: u32 = 1 << 1;

const AF_INET: u16 = 2;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ChunkError {
    #[error("record too short: {0} bytes")]
    Truncated(usize),
}

/// Both ends of a socket, source first
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AddressPair {
    pub src_ip: IpAddr,
    pub src_port: u16,
    pub dst_ip: IpAddr,
    pub dst_port: u16,
}

impl AddressPair {
    pub fn reversed(&self) -> Self {
        Self {
            src_ip: self.dst_ip,
            src_port: self.dst_port,
            dst_ip: self.src_ip,
            dst_port: self.src_port,
        }
    }

    pub fn tcp_id(&self) -> TcpId {
        TcpId::new(self.src_ip, self.src_port, self.dst_ip, self.dst_port)
    }

    /// Key of the reader fed by this pair
    pub fn key(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for AddressPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}>{}:{}",
            self.src_ip, self.src_port, self.dst_ip, self.dst_port
        )
    }
}

fn u32_le(raw: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([raw[offset], raw[offset + 1], raw[offset + 2], raw[offset + 3]])
}

fn u32_ne(raw: &[u8], offset: usize) -> u32 {
    u32::from_ne_bytes([raw[offset], raw[offset + 1], raw[offset + 2], raw[offset + 3]])
}

/// One SSL_read/SSL_write worth of plaintext
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsChunk {
    pub pid: u32,
    pub tgid: u32,
    pub len: u32,
    pub start: u32,
    pub recorded: u32,
    pub fd: u32,
    pub flags: u32,
    pub address: [u8; 16],
    /// The recorded part of the data array
    pub data: Vec<u8>,
}

impl TlsChunk {
    /// Decode a perf buffer sample (little endian).
    pub fn parse(raw: &[u8]) -> Result<Self, ChunkError> {
        if raw.len() < CHUNK_HEADER_SIZE {
            return Err(ChunkError::Truncated(raw.len()));
        }
        let mut address = [0u8; 16];
        address.copy_from_slice(&raw[28..CHUNK_HEADER_SIZE]);
        let recorded = u32_le(raw, 16);
        let available = raw.len() - CHUNK_HEADER_SIZE;
        let take = (recorded as usize).min(CHUNK_DATA_SIZE).min(available);

        Ok(Self {
            pid: u32_le(raw, 0),
            tgid: u32_le(raw, 4),
            len: u32_le(raw, 8),
            start: u32_le(raw, 12),
            recorded,
            fd: u32_le(raw, 20),
            flags: u32_le(raw, 24),
            address,
            data: raw[CHUNK_HEADER_SIZE..CHUNK_HEADER_SIZE + take].to_vec(),
        })
    }

    pub fn is_client(&self) -> bool {
        self.flags & FLAG_CLIENT != 0
    }

    pub fn is_read(&self) -> bool {
        self.flags & FLAG_READ != 0
    }

    /// Written by a client or read by a server
    pub fn is_request(&self) -> bool {
        (self.is_client() && !self.is_read()) || (!self.is_client() && self.is_read())
    }

    /// Peer address recorded by the kernel side, if any.
    ///
    /// The local end is unknown here, so it is filled with the placeholder identity.
    pub fn address_pair(&self) -> Option<AddressPair> {
        let family = u16::from_be_bytes([self.address[0], self.address[1]]);
        if family != AF_INET {
            return None;
        }
        let port = u16::from_be_bytes([self.address[2], self.address[3]]);
        let ip = IpAddr::V4(Ipv4Addr::new(
            self.address[4],
            self.address[5],
            self.address[6],
            self.address[7],
        ));
        let unknown = TcpId::unknown();

        Some(if self.is_request() {
            AddressPair {
                src_ip: unknown.src_ip,
                src_port: unknown.src_port,
                dst_ip: ip,
                dst_port: port,
            }
        } else {
            AddressPair {
                src_ip: ip,
                src_port: port,
                dst_ip: unknown.dst_ip,
                dst_port: unknown.dst_port,
            }
        })
    }
}

/// Read or write observed inside the Go `crypto/tls` runtime (native endian)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GolangReadWrite {
    pub pid: u32,
    pub fd: u32,
    pub conn_addr: u32,
    pub is_request: bool,
    pub is_gzip_chunk: bool,
    pub data: Vec<u8>,
}

impl GolangReadWrite {
    pub fn parse(raw: &[u8]) -> Result<Self, ChunkError> {
        if raw.len() < GOLANG_HEADER_SIZE {
            return Err(ChunkError::Truncated(raw.len()));
        }
        let len = u32_ne(raw, 16) as usize;
        let available = raw.len() - GOLANG_HEADER_SIZE;
        let take = len.min(GOLANG_DATA_SIZE).min(available);

        Ok(Self {
            pid: u32_ne(raw, 0),
            fd: u32_ne(raw, 4),
            conn_addr: u32_ne(raw, 8),
            is_request: raw[12] != 0,
            is_gzip_chunk: raw[13] != 0,
            data: raw[GOLANG_HEADER_SIZE..GOLANG_HEADER_SIZE + take].to_vec(),
        })
    }

    /// Identity of the Go connection object across events
    pub fn connection_id(&self) -> u64 {
        (u64::from(self.pid) << 32) + u64::from(self.conn_addr)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// A chunk record as the kernel side writes it.
    pub(crate) fn chunk_record(
        pid: u32,
        fd: u32,
        flags: u32,
        peer: Option<([u8; 4], u16)>,
        data: &[u8],
    ) -> Vec<u8> {
        let mut raw = Vec::with_capacity(CHUNK_RECORD_SIZE);
        for value in [pid, pid, data.len() as u32, 0, data.len() as u32, fd, flags] {
            raw.extend_from_slice(&value.to_le_bytes());
        }
        let mut address = [0u8; 16];
        if let Some((ip, port)) = peer {
            address[..2].copy_from_slice(&AF_INET.to_be_bytes());
            address[2..4].copy_from_slice(&port.to_be_bytes());
            address[4..8].copy_from_slice(&ip);
        }
        raw.extend_from_slice(&address);
        let mut payload = data.to_vec();
        payload.resize(CHUNK_DATA_SIZE, 0);
        raw.extend_from_slice(&payload);
        raw
    }

    pub(crate) fn golang_record(pid: u32, fd: u32, conn_addr: u32, is_request: bool, data: &[u8]) -> Vec<u8> {
        let mut raw = Vec::new();
        for value in [pid, fd, conn_addr] {
            raw.extend_from_slice(&value.to_ne_bytes());
        }
        raw.extend_from_slice(&[is_request as u8, 0, 0, 0]);
        raw.extend_from_slice(&(data.len() as u32).to_ne_bytes());
        raw.extend_from_slice(data);
        raw
    }

    #[test]
    fn test_parse_chunk() {
        let raw = chunk_record(42, 7, FLAG_CLIENT, Some(([10, 0, 0, 2], 443)), b"GET / HTTP/1.1\r\n");
        assert_eq!(raw.len(), CHUNK_RECORD_SIZE);
        let chunk = TlsChunk::parse(&raw).unwrap();
        assert_eq!(chunk.pid, 42);
        assert_eq!(chunk.fd, 7);
        assert_eq!(chunk.data, b"GET / HTTP/1.1\r\n");
        assert!(chunk.is_request());

        let pair = chunk.address_pair().unwrap();
        assert_eq!(pair.dst_port, 443);
        assert_eq!(pair.src_port, 0);
        assert_eq!(pair.key(), "127.0.0.1:0>10.0.0.2:443");
    }

    #[test]
    fn test_request_flags() {
        let mut chunk = TlsChunk::parse(&chunk_record(1, 1, 0, None, b"")).unwrap();
        // server write is a response
        assert!(!chunk.is_request());
        chunk.flags = FLAG_READ;
        assert!(chunk.is_request());
        chunk.flags = FLAG_CLIENT | FLAG_READ;
        assert!(!chunk.is_request());
        assert!(chunk.address_pair().is_none());
    }

    #[test]
    fn test_truncated_records() {
        assert_eq!(TlsChunk::parse(&[0u8; 10]), Err(ChunkError::Truncated(10)));
        assert!(GolangReadWrite::parse(&[0u8; 19]).is_err());
    }

    #[test]
    fn test_parse_golang_event() {
        let event = GolangReadWrite::parse(&golang_record(9, 3, 0xdead, true, b"body")).unwrap();
        assert_eq!(event.data, b"body");
        assert!(event.is_request);
        assert_eq!(event.connection_id(), (9u64 << 32) + 0xdead);
    }
}
