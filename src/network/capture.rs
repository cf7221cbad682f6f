// network/capture.rs - Packet capture setup and utilities
use anyhow::{Context, Result, anyhow};
use log::{debug, info};
use pcap::{Activated, Capture, Device, Error as PcapError};
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Packet capture configuration
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Snapshot length (bytes to capture per packet)
    pub snaplen: i32,
    /// Buffer size for packet capture
    pub buffer_size: i32,
    /// Read timeout in milliseconds
    pub timeout_ms: i32,
    /// BPF filter string
    pub filter: Option<String>,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            snaplen: 65535,          // Whole segments, payloads are dissected
            buffer_size: 20_000_000, // 20MB buffer
            timeout_ms: 150,         // 150ms so the capture loop notices shutdown
            filter: None,            // Start without filter to ensure we see packets
        }
    }
}

/// An IPv4 address a capture on this device would plausibly see traffic for
fn has_routable_ipv4(device: &Device) -> bool {
    device.addresses.iter().any(|addr| match &addr.addr {
        IpAddr::V4(v4) => !v4.is_link_local() && !v4.is_loopback() && !v4.is_unspecified(),
        IpAddr::V6(_) => false,
    })
}

/// Loopback, bridges, VM and Apple peer-to-peer interfaces
fn is_auxiliary(device: &Device) -> bool {
    const PREFIXES: [&str; 7] = ["lo", "ap", "awdl", "llw", "bridge", "vmnet", "docker"];
    let desc = device.desc.as_deref().unwrap_or_default().to_lowercase();
    device.name == "any"
        || device.flags.is_loopback()
        || PREFIXES.iter().any(|p| device.name.starts_with(p))
        || ["hyper-v", "vmware", "virtualbox", "loopback"]
            .iter()
            .any(|v| desc.contains(v))
}

/// Higher is better, `None` for devices never picked automatically
fn device_score(device: &Device) -> Option<u8> {
    if is_auxiliary(device) || !device.flags.is_up() || device.addresses.is_empty() {
        return None;
    }
    let mut score = 1;
    if device.flags.is_running() {
        score += 1;
    }
    if has_routable_ipv4(device) {
        score += 2;
    }
    Some(score)
}

/// Pick the most active looking device
fn find_best_device(devices: &[Device]) -> Result<Device> {
    for d in devices {
        debug!(
            "  Device: {} [up: {}, running: {}, routable: {}]",
            d.name,
            d.flags.is_up(),
            d.flags.is_running(),
            has_routable_ipv4(d)
        );
    }

    devices
        .iter()
        .filter_map(|d| device_score(d).map(|score| (score, d)))
        .max_by_key(|(score, _)| *score)
        .map(|(_, d)| d.clone())
        .ok_or_else(|| {
            anyhow!("No active network interface found. Use -i to specify one manually.")
        })
}

/// Resolve `--interface`, or fall back to the default device when it looks usable
fn find_capture_device(interface_name: &Option<String>) -> Result<Device> {
    let devices = Device::list().map_err(|e| {
        anyhow!(
            "Failed to list network devices: {}. This may indicate insufficient privileges.",
            e
        )
    })?;

    let Some(name) = interface_name else {
        if let Ok(Some(default)) = Device::lookup()
            && device_score(&default) == Some(4)
        {
            info!("Using default device {}", default.name);
            return Ok(default);
        }
        info!("Scanning {} devices for an active interface", devices.len());
        let device = find_best_device(&devices)?;
        info!("Selected device {}", device.name);
        return Ok(device);
    };

    if name == "any" && !cfg!(target_os = "linux") {
        return Err(anyhow!(
            "The 'any' interface is only supported on Linux; pick a specific interface with -i"
        ));
    }

    devices
        .iter()
        .find(|d| d.name == *name)
        .or_else(|| devices.iter().find(|d| d.name.eq_ignore_ascii_case(name)))
        .cloned()
        .ok_or_else(|| {
            let available: Vec<&str> = devices.iter().map(|d| d.name.as_str()).collect();
            anyhow!(
                "Interface '{}' not found. Available interfaces: {}",
                name,
                available.join(", ")
            )
        })
}

/// Where packets come from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PacketSource {
    /// Live capture on an interface (None for auto-selection)
    Live(Option<String>),
    /// Offline replay of a capture file
    File(PathBuf),
}

/// Open a live or offline capture and apply the BPF filter.
///
/// Returns the capture, a display name and the link type.
pub fn setup_packet_capture(
    source: &PacketSource,
    config: &CaptureConfig,
) -> Result<(Capture<dyn Activated>, String, i32)> {
    let (mut cap, name): (Capture<dyn Activated>, String) = match source {
        PacketSource::File(path) => {
            info!("Replaying capture file {}", path.display());
            let cap = Capture::from_file(path)
                .with_context(|| format!("Failed to open capture file {}", path.display()))?;
            (cap.into(), path.display().to_string())
        }
        PacketSource::Live(interface) => {
            let device = find_capture_device(interface)?;
            info!(
                "Setting up capture on device: {} ({})",
                device.name,
                device.desc.as_deref().unwrap_or("no description")
            );
            let device_name = device.name.clone();

            // Non-promiscuous, read-only capture only requires CAP_NET_RAW
            let cap = Capture::from_device(device)?
                .promisc(false)
                .snaplen(config.snaplen)
                .buffer_size(config.buffer_size)
                .timeout(config.timeout_ms)
                .immediate_mode(true)
                .open()
                .with_context(|| format!("Failed to open capture on {}", device_name))?;
            (cap.into(), device_name)
        }
    };

    if let Some(filter) = &config.filter {
        info!("Applying BPF filter: {}", filter);
        cap.filter(filter, true)
            .with_context(|| format!("Invalid BPF filter '{}'", filter))?;
    }

    let linktype = cap.get_datalink();
    info!("Capture {} ready, linktype {}", name, linktype.0);
    Ok((cap, name, linktype.0))
}

/// Validate that the specified interface exists (if provided)
/// This is useful for failing fast before starting capture threads
pub fn validate_interface(interface_name: &Option<String>) -> Result<()> {
    if let Some(name) = interface_name {
        // This will return an error if the interface doesn't exist
        find_capture_device(&Some(name.clone()))?;
    }
    Ok(())
}

/// A captured frame and its capture time
#[derive(Debug, Clone)]
pub struct RawPacket {
    pub data: Vec<u8>,
    pub timestamp: SystemTime,
}

/// Outcome of one read from the capture handle
#[derive(Debug)]
pub enum ReadOutcome {
    Packet(RawPacket),
    /// Live capture read timeout, not an error
    Timeout,
    /// End of a capture file
    Exhausted,
}

/// Simple packet reader that handles timeouts gracefully
pub struct PacketReader {
    capture: Capture<dyn Activated>,
}

impl PacketReader {
    pub fn new(capture: Capture<dyn Activated>) -> Self {
        Self { capture }
    }

    /// Read next packet
    pub fn next_packet(&mut self) -> Result<ReadOutcome> {
        match self.capture.next_packet() {
            Ok(packet) => {
                let ts = packet.header.ts;
                let timestamp = UNIX_EPOCH
                    + Duration::from_secs(ts.tv_sec.max(0) as u64)
                    + Duration::from_micros(ts.tv_usec.max(0) as u64);
                Ok(ReadOutcome::Packet(RawPacket {
                    data: packet.data.to_vec(),
                    timestamp,
                }))
            }
            Err(PcapError::TimeoutExpired) => Ok(ReadOutcome::Timeout),
            Err(PcapError::NoMorePackets) => Ok(ReadOutcome::Exhausted),
            Err(e) => Err(e.into()),
        }
    }

    /// Get capture statistics
    pub fn stats(&mut self) -> Result<CaptureStats> {
        let stats = self.capture.stats()?;
        let capture_stats = CaptureStats {
            received: stats.received,
            dropped: stats.dropped,
            if_dropped: stats.if_dropped,
        };

        // Log dropped packets if any occurred
        if capture_stats.total_dropped() > 0 {
            debug!(
                "Total {} packets dropped (kernel: {}, interface: {})",
                capture_stats.total_dropped(),
                capture_stats.dropped,
                capture_stats.if_dropped
            );
        }

        Ok(capture_stats)
    }
}

/// Packet capture statistics
#[derive(Debug, Clone, Default)]
pub struct CaptureStats {
    pub received: u32,
    pub dropped: u32,
    /// Interface-level dropped packets (platform-specific)
    pub if_dropped: u32,
}

impl CaptureStats {
    /// Get total packets dropped (both kernel and interface level)
    pub fn total_dropped(&self) -> u32 {
        self.dropped.saturating_add(self.if_dropped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = CaptureConfig::default();
        assert_eq!(config.snaplen, 65535);
        assert!(config.filter.is_none()); // Default starts without filter
    }

    #[test]
    fn test_missing_capture_file() {
        let source = PacketSource::File(PathBuf::from("/nonexistent/flowtap.pcap"));
        assert!(setup_packet_capture(&source, &CaptureConfig::default()).is_err());
    }
}
