//! Ethernet (IEEE 802.3) frame parsing
//!
//! Handles DLT_EN10MB (Ethernet) frames with a 14-byte header and any number
//! of stacked 802.1Q / 802.1ad tags.

use log::debug;

use super::{ETHERTYPE_QINQ, ETHERTYPE_VLAN, ip_by_ethertype};

/// Parse an Ethernet frame and return the network layer packet
///
/// Ethernet frame format (14 bytes):
/// - Destination MAC (6 bytes)
/// - Source MAC (6 bytes)
/// - EtherType (2 bytes), or a 4-byte VLAN tag followed by the real EtherType
pub fn parse(data: &[u8]) -> Option<&[u8]> {
    if data.len() < 14 {
        debug!("Ethernet frame too small: {} bytes", data.len());
        return None;
    }

    let mut offset = 12;
    let mut ethertype = u16::from_be_bytes([data[offset], data[offset + 1]]);
    while ethertype == ETHERTYPE_VLAN || ethertype == ETHERTYPE_QINQ {
        offset += 4;
        if data.len() < offset + 2 {
            debug!("Truncated VLAN tag");
            return None;
        }
        ethertype = u16::from_be_bytes([data[offset], data[offset + 1]]);
    }

    ip_by_ethertype(ethertype, &data[offset + 2..])
}
