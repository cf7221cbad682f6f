//! Service-dependency edges seen on the wire, delivered on a side channel.

use crossbeam::channel::{self, Receiver, Sender, TrySendError};
use log::debug;
use serde::Serialize;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};

/// How the link was recognized
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkProtocol {
    Tcp,
}

/// One observed dependency edge
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundLink {
    pub src_ip: IpAddr,
    pub dst_ip: IpAddr,
    pub dst_port: u16,
    /// TLS server name, when one was seen
    pub suggested_resolved_name: Option<String>,
    pub protocol: LinkProtocol,
}

/// Non-blocking writer side of the outbound link channel.
///
/// Links are dropped rather than stalling the capture path.
pub struct OutboundLinkWriter {
    tx: Sender<OutboundLink>,
    dropped: AtomicU64,
}

impl OutboundLinkWriter {
    pub fn new(capacity: usize) -> (Self, Receiver<OutboundLink>) {
        let (tx, rx) = channel::bounded(capacity);
        (
            Self {
                tx,
                dropped: AtomicU64::new(0),
            },
            rx,
        )
    }

    pub fn write_outbound_link(
        &self,
        src_ip: IpAddr,
        dst_ip: IpAddr,
        dst_port: u16,
        suggested_resolved_name: Option<String>,
        protocol: LinkProtocol,
    ) {
        let link = OutboundLink {
            src_ip,
            dst_ip,
            dst_port,
            suggested_resolved_name,
            protocol,
        };
        match self.tx.try_send(link) {
            Ok(()) => {}
            Err(TrySendError::Full(link)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                debug!(
                    "Outbound link channel full, dropping {} -> {}:{}",
                    link.src_ip,
                    link.dst_ip,
                    link.dst_port
                );
            }
            Err(TrySendError::Disconnected(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_channel_drops() {
        let (writer, rx) = OutboundLinkWriter::new(1);
        let src: IpAddr = "10.0.0.1".parse().unwrap();
        let dst: IpAddr = "93.184.216.34".parse().unwrap();
        writer.write_outbound_link(src, dst, 443, Some("example.com".into()), LinkProtocol::Tcp);
        writer.write_outbound_link(src, dst, 443, None, LinkProtocol::Tcp);

        assert_eq!(writer.dropped(), 1);
        let link = rx.try_recv().unwrap();
        assert_eq!(link.suggested_resolved_name.as_deref(), Some("example.com"));
        assert!(rx.try_recv().is_err());
    }
}
