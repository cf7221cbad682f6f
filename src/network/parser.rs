// network/parser.rs - IP and TCP header decoding into reassembly input
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::time::SystemTime;

use crate::network::link_layer::LinkLayerType;

// Define TCP flags as bit masks
const TCP_FIN: u8 = 0x01;
const TCP_SYN: u8 = 0x02;
const TCP_RST: u8 = 0x04;
const TCP_PSH: u8 = 0x08;
const TCP_ACK: u8 = 0x10;

const IPPROTO_TCP: u8 = 6;

/// TCP flags from the TCP header
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TcpFlags {
    pub fin: bool,
    pub syn: bool,
    pub rst: bool,
    pub psh: bool,
    pub ack: bool,
}

/// Parse TCP flags from the flags byte
pub fn parse_tcp_flags(flags: u8) -> TcpFlags {
    TcpFlags {
        fin: (flags & TCP_FIN) != 0,
        syn: (flags & TCP_SYN) != 0,
        rst: (flags & TCP_RST) != 0,
        psh: (flags & TCP_PSH) != 0,
        ack: (flags & TCP_ACK) != 0,
    }
}

/// One TCP segment as seen on the wire.
#[derive(Debug, Clone)]
pub struct TcpSegment {
    pub src_ip: IpAddr,
    pub dst_ip: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
    pub flags: TcpFlags,
    pub payload: Vec<u8>,
    pub timestamp: SystemTime,
}

/// Result of parsing a captured frame
#[derive(Debug)]
pub enum ParsedPacket {
    Tcp(TcpSegment),
    /// IP, but not TCP
    OtherTransport,
    /// Not IP, truncated or malformed
    Unparsable,
}

/// Packet parser - stateless, thread-safe
pub struct PacketParser {
    link_type: LinkLayerType,
}

impl PacketParser {
    pub fn new(link_type: LinkLayerType) -> Self {
        Self { link_type }
    }

    pub fn link_type(&self) -> LinkLayerType {
        self.link_type
    }

    /// Parse a raw frame captured at `timestamp`
    pub fn parse_packet(&self, data: &[u8], timestamp: SystemTime) -> ParsedPacket {
        match self.link_type.network_payload(data) {
            Some(ip) => parse_ip_packet(ip, timestamp),
            None => ParsedPacket::Unparsable,
        }
    }
}

/// Parse an IPv4 or IPv6 packet without link layer header
pub fn parse_ip_packet(ip_data: &[u8], timestamp: SystemTime) -> ParsedPacket {
    match ip_data.first().map(|b| b >> 4) {
        Some(4) => parse_ipv4_packet(ip_data, timestamp),
        Some(6) => parse_ipv6_packet(ip_data, timestamp),
        _ => ParsedPacket::Unparsable,
    }
}

fn parse_ipv4_packet(ip_data: &[u8], timestamp: SystemTime) -> ParsedPacket {
    if ip_data.len() < 20 {
        return ParsedPacket::Unparsable;
    }

    let ihl = ip_data[0] & 0x0F;
    let ip_header_len = (ihl as usize) * 4;
    if ip_header_len < 20 || ip_data.len() < ip_header_len {
        return ParsedPacket::Unparsable;
    }
    // Total length excludes Ethernet padding on short frames
    let total_len = u16::from_be_bytes([ip_data[2], ip_data[3]]) as usize;
    let end = total_len.clamp(ip_header_len, ip_data.len());

    // Non-first fragments carry no transport header
    let fragment_offset = u16::from_be_bytes([ip_data[6], ip_data[7]]) & 0x1FFF;
    if fragment_offset != 0 {
        return ParsedPacket::OtherTransport;
    }

    if ip_data[9] != IPPROTO_TCP {
        return ParsedPacket::OtherTransport;
    }

    let src_ip = IpAddr::V4(Ipv4Addr::new(
        ip_data[12],
        ip_data[13],
        ip_data[14],
        ip_data[15],
    ));
    let dst_ip = IpAddr::V4(Ipv4Addr::new(
        ip_data[16],
        ip_data[17],
        ip_data[18],
        ip_data[19],
    ));

    parse_tcp(&ip_data[ip_header_len..end], src_ip, dst_ip, timestamp)
}

fn parse_ipv6_packet(ip_data: &[u8], timestamp: SystemTime) -> ParsedPacket {
    if ip_data.len() < 40 {
        return ParsedPacket::Unparsable;
    }

    let next_header = ip_data[6];
    let payload_len = u16::from_be_bytes([ip_data[4], ip_data[5]]) as usize;

    let mut src = [0u8; 16];
    src.copy_from_slice(&ip_data[8..24]);
    let mut dst = [0u8; 16];
    dst.copy_from_slice(&ip_data[24..40]);
    let src_ip = IpAddr::V6(Ipv6Addr::from(src));
    let dst_ip = IpAddr::V6(Ipv6Addr::from(dst));

    let end = (40 + payload_len).min(ip_data.len());
    let transport_data = &ip_data[40..end];

    // Handle extension headers if needed
    let (final_next_header, transport_offset) =
        parse_ipv6_extension_headers(next_header, transport_data);
    if final_next_header != IPPROTO_TCP {
        return ParsedPacket::OtherTransport;
    }
    match transport_data.get(transport_offset..) {
        Some(tcp) => parse_tcp(tcp, src_ip, dst_ip, timestamp),
        None => ParsedPacket::Unparsable,
    }
}

fn parse_tcp(
    transport_data: &[u8],
    src_ip: IpAddr,
    dst_ip: IpAddr,
    timestamp: SystemTime,
) -> ParsedPacket {
    if transport_data.len() < 20 {
        return ParsedPacket::Unparsable;
    }

    let src_port = u16::from_be_bytes([transport_data[0], transport_data[1]]);
    let dst_port = u16::from_be_bytes([transport_data[2], transport_data[3]]);
    let seq = u32::from_be_bytes([
        transport_data[4],
        transport_data[5],
        transport_data[6],
        transport_data[7],
    ]);
    let ack = u32::from_be_bytes([
        transport_data[8],
        transport_data[9],
        transport_data[10],
        transport_data[11],
    ]);
    let tcp_header_len = ((transport_data[12] >> 4) as usize) * 4;
    if tcp_header_len < 20 || transport_data.len() < tcp_header_len {
        return ParsedPacket::Unparsable;
    }

    ParsedPacket::Tcp(TcpSegment {
        src_ip,
        dst_ip,
        src_port,
        dst_port,
        seq,
        ack,
        flags: parse_tcp_flags(transport_data[13]),
        payload: transport_data[tcp_header_len..].to_vec(),
        timestamp,
    })
}

fn parse_ipv6_extension_headers(mut next_header: u8, data: &[u8]) -> (u8, usize) {
    let mut offset = 0;

    const HOP_BY_HOP: u8 = 0;
    const ROUTING: u8 = 43;
    const FRAGMENT: u8 = 44;
    const AUTHENTICATION: u8 = 51;
    const DESTINATION_OPTIONS: u8 = 60;

    loop {
        match next_header {
            HOP_BY_HOP | ROUTING | DESTINATION_OPTIONS => {
                if data.len() < offset + 2 {
                    return (next_header, offset);
                }
                next_header = data[offset];
                let header_len = ((data[offset + 1] as usize) + 1) * 8;
                offset += header_len;
            }
            FRAGMENT => {
                if data.len() < offset + 8 {
                    return (next_header, offset);
                }
                next_header = data[offset];
                offset += 8;
            }
            AUTHENTICATION => {
                if data.len() < offset + 2 {
                    return (next_header, offset);
                }
                next_header = data[offset];
                let header_len = ((data[offset + 1] as usize) + 2) * 4;
                offset += header_len;
            }
            _ => {
                return (next_header, offset);
            }
        }

        if offset >= data.len() {
            return (next_header, offset);
        }
    }
}
