//! Socket address lookup by pid and file descriptor through procfs.

use anyhow::{Context, Result, anyhow};
use std::fs;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::PathBuf;

use super::chunk::AddressPair;

/// Resolves the local and remote address of a process' socket
pub trait SocketResolver: Send {
    /// Local end first.
    fn address_by_sockfd(&self, pid: u32, fd: u32) -> Result<AddressPair>;
}

/// Reads `<procfs>/<pid>/fd/<fd>` and the process' `net/tcp{,6}` tables
pub struct ProcfsResolver {
    procfs: PathBuf,
}

impl ProcfsResolver {
    pub fn new(procfs: impl Into<PathBuf>) -> Self {
        Self {
            procfs: procfs.into(),
        }
    }
}

impl SocketResolver for ProcfsResolver {
    fn address_by_sockfd(&self, pid: u32, fd: u32) -> Result<AddressPair> {
        let pid_dir = self.procfs.join(pid.to_string());
        let fd_path = pid_dir.join("fd").join(fd.to_string());
        let link = fs::read_link(&fd_path)
            .with_context(|| format!("Failed to read {}", fd_path.display()))?;
        let link = link.to_string_lossy();
        let inode = extract_socket_inode(&link)
            .ok_or_else(|| anyhow!("{} is not a socket ({})", fd_path.display(), link))?;

        for table in ["net/tcp", "net/tcp6"] {
            let path = pid_dir.join(table);
            // The v6 table may be missing
            let Ok(content) = fs::read_to_string(&path) else {
                continue;
            };
            if let Some(pair) = find_inode(&content, inode) {
                return Ok(pair);
            }
        }
        Err(anyhow!("Socket inode {} of pid {} not found", inode, pid))
    }
}

fn find_inode(table: &str, inode: u64) -> Option<AddressPair> {
    for line in table.lines().skip(1) {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 10 {
            continue;
        }
        if parts[9].parse::<u64>().ok() != Some(inode) {
            continue;
        }
        let local = parse_hex_address(parts[1])?;
        let remote = parse_hex_address(parts[2])?;
        return Some(AddressPair {
            src_ip: local.ip(),
            src_port: local.port(),
            dst_ip: remote.ip(),
            dst_port: remote.port(),
        });
    }
    None
}

fn parse_hex_address(hex_addr: &str) -> Option<SocketAddr> {
    let (ip_hex, port_hex) = hex_addr.split_once(':')?;
    let port = u16::from_str_radix(port_hex, 16).ok()?;

    if ip_hex.len() == 8 {
        let ip_bytes = u32::from_str_radix(ip_hex, 16).ok()?;
        let ip = Ipv4Addr::from(ip_bytes.to_le_bytes());
        Some(SocketAddr::new(IpAddr::V4(ip), port))
    } else if ip_hex.len() == 32 {
        let mut bytes = [0u8; 16];
        for i in 0..4 {
            let chunk = &ip_hex[i * 8..(i + 1) * 8];
            let value = u32::from_str_radix(chunk, 16).ok()?;
            bytes[i * 4..(i + 1) * 4].copy_from_slice(&value.to_le_bytes());
        }
        let ip = Ipv6Addr::from(bytes);
        // v4-mapped sockets show up in the v6 table
        let ip = match ip.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => IpAddr::V6(ip),
        };
        Some(SocketAddr::new(ip, port))
    } else {
        None
    }
}

fn extract_socket_inode(link: &str) -> Option<u64> {
    link.strip_prefix("socket:[")?.strip_suffix(']')?.parse().ok()
}
