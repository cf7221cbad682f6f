//! Raw IP packet parsing (no link-layer header)
//!
//! Handles DLT_RAW (12), DLT_NULL (0), LINKTYPE_RAW (101),
//! LINKTYPE_IPV4 (228), and LINKTYPE_IPV6 (229)

use log::debug;

/// Accept a raw IP packet if the first nibble is a known IP version.
pub fn parse(data: &[u8]) -> Option<&[u8]> {
    if data.is_empty() {
        debug!("Raw IP: Empty packet");
        return None;
    }

    match data[0] >> 4 {
        4 | 6 => Some(data),
        version => {
            debug!("Raw IP: Unknown IP version: {}", version);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_ip_empty_packet() {
        assert!(parse(&[]).is_none());
    }

    #[test]
    fn test_raw_ip_version_check() {
        assert!(parse(&[0x60, 0x00, 0x00, 0x00]).is_some());
        assert!(parse(&[0x20, 0x00]).is_none());
    }
}
