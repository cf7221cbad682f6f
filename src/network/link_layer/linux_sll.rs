//! Linux "cooked" capture parsing
//!
//! Handles DLT_LINUX_SLL (113) and DLT_LINUX_SLL2 (276)
//! Used by the Linux "any" pseudo-interface

use log::debug;

use super::ip_by_ethertype;

/// Parse Linux Cooked Capture v1 packet (DLT_LINUX_SLL)
///
/// Header format (16 bytes):
/// - Packet type (2 bytes)
/// - ARPHRD type (2 bytes)
/// - Link-layer address length (2 bytes)
/// - Link-layer address (8 bytes)
/// - Protocol type (2 bytes) - EtherType
///
/// IP payload starts at byte 16
pub fn parse_sll(data: &[u8]) -> Option<&[u8]> {
    if data.len() < 16 {
        debug!("Linux SLL packet too small: {} bytes", data.len());
        return None;
    }

    let protocol = u16::from_be_bytes([data[14], data[15]]);
    ip_by_ethertype(protocol, &data[16..])
}

/// Parse Linux Cooked Capture v2 packet (DLT_LINUX_SLL2)
///
/// Header format (20 bytes):
/// - Protocol type (2 bytes) - EtherType
/// - Reserved (2 bytes)
/// - Interface index (4 bytes)
/// - ARPHRD type (2 bytes)
/// - Packet type (1 byte)
/// - Link-layer address length (1 byte)
/// - Link-layer address (8 bytes)
///
/// IP payload starts at byte 20
pub fn parse_sll2(data: &[u8]) -> Option<&[u8]> {
    if data.len() < 20 {
        debug!("Linux SLL2 packet too small: {} bytes", data.len());
        return None;
    }

    let protocol = u16::from_be_bytes([data[0], data[1]]);
    ip_by_ethertype(protocol, &data[20..])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sll_packet_too_small() {
        let small_packet = vec![0x00; 10];
        assert!(parse_sll(&small_packet).is_none());
    }

    #[test]
    fn test_sll2_packet_too_small() {
        let small_packet = vec![0x00; 15];
        assert!(parse_sll2(&small_packet).is_none());
    }

    #[test]
    fn test_sll_ipv4_payload() {
        let mut packet = vec![0x00; 14];
        packet.extend_from_slice(&[0x08, 0x00, 0x45]);
        assert_eq!(parse_sll(&packet), Some(&[0x45][..]));
    }
}
