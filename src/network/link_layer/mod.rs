//! Link layer (Layer 2) decoding
//!
//! Strips the data-link header and hands back the network-layer packet:
//! - Ethernet (DLT_EN10MB), including 802.1Q tags
//! - Linux Cooked Capture v1 and v2 (DLT_LINUX_SLL, DLT_LINUX_SLL2)
//! - Raw IP packets (DLT_RAW, LINKTYPE_IPV4, LINKTYPE_IPV6)

pub mod ethernet;
pub mod linux_sll;
pub mod raw_ip;

use log::trace;

/// Data Link Type (DLT) constants
/// These match the values from libpcap
pub mod dlt {
    pub const EN10MB: i32 = 1; // Ethernet
    pub const RAW: i32 = 12; // Raw IP (no link layer)
    pub const NULL: i32 = 0; // BSD loopback
    pub const LINUX_SLL: i32 = 113; // Linux "cooked" capture v1
    pub const LINUX_SLL2: i32 = 276; // Linux "cooked" capture v2

    // Link type values for raw IP packets
    pub const LINKTYPE_RAW: i32 = 101; // Raw IPv4/IPv6
    pub const LINKTYPE_IPV4: i32 = 228; // Raw IPv4 only
    pub const LINKTYPE_IPV6: i32 = 229; // Raw IPv6 only
}

pub const ETHERTYPE_IPV4: u16 = 0x0800;
pub const ETHERTYPE_IPV6: u16 = 0x86dd;
pub const ETHERTYPE_VLAN: u16 = 0x8100;
pub const ETHERTYPE_QINQ: u16 = 0x88a8;

/// Link layer type enum for identifying capture link types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkLayerType {
    Ethernet,
    RawIP,
    LinuxSLL,
    LinuxSLL2,
    Unknown,
}

impl LinkLayerType {
    /// Determine link layer type from DLT value
    pub fn from_dlt(dlt: i32) -> Self {
        match dlt {
            dlt::EN10MB => LinkLayerType::Ethernet,
            dlt::RAW | dlt::NULL | dlt::LINKTYPE_RAW | dlt::LINKTYPE_IPV4 | dlt::LINKTYPE_IPV6 => {
                LinkLayerType::RawIP
            }
            dlt::LINUX_SLL => LinkLayerType::LinuxSLL,
            dlt::LINUX_SLL2 => LinkLayerType::LinuxSLL2,
            _ => LinkLayerType::Unknown,
        }
    }

    /// Strip the link header, returning the IP packet.
    pub fn network_payload<'a>(&self, data: &'a [u8]) -> Option<&'a [u8]> {
        match self {
            LinkLayerType::Ethernet => ethernet::parse(data),
            LinkLayerType::RawIP => raw_ip::parse(data),
            LinkLayerType::LinuxSLL => linux_sll::parse_sll(data),
            LinkLayerType::LinuxSLL2 => linux_sll::parse_sll2(data),
            LinkLayerType::Unknown => None,
        }
    }
}

/// Keep the packet only if the EtherType carries IP.
pub(crate) fn ip_by_ethertype(ethertype: u16, payload: &[u8]) -> Option<&[u8]> {
    match ethertype {
        ETHERTYPE_IPV4 | ETHERTYPE_IPV6 => Some(payload),
        _ => {
            trace!("Skipping non-IP EtherType 0x{:04x}", ethertype);
            None
        }
    }
}
