//! Per-connection dissection context shared by both directional readers.

use crossbeam::channel::{Sender, TrySendError};
use log::{debug, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, OnceLock};
use std::time::Instant;

use crate::api::{Protocol, StreamHandle};
use crate::network::reassembly::Direction;
use crate::tap::tcp_reader::ReaderChunk;

/// A tapped or ignored TCP (or TLS) connection.
///
/// Lifecycle: created unclassified, identified once a dissector calls
/// [`StreamHandle::set_protocol`], closed by reassembly, the stream map sweep
/// or an idle TLS reader. Closing drops the reader senders so blocked
/// dissectors see end of stream.
pub struct TcpStream {
    id: u64,
    created_at: Instant,
    is_tap_target: bool,
    protocol: OnceLock<&'static Protocol>,
    closed: AtomicBool,
    senders: Mutex<Option<[Sender<ReaderChunk>; 2]>>,
    close_notifier: Option<(Sender<String>, String)>,
}

impl TcpStream {
    /// A stream feeding the client and server readers through `senders`.
    pub fn new(id: u64, senders: [Sender<ReaderChunk>; 2]) -> Self {
        Self {
            id,
            created_at: Instant::now(),
            is_tap_target: true,
            protocol: OnceLock::new(),
            closed: AtomicBool::new(false),
            senders: Mutex::new(Some(senders)),
            close_notifier: None,
        }
    }

    /// A stream with a single reader; both directions feed `sender`.
    pub fn one_way(id: u64, sender: Sender<ReaderChunk>) -> Self {
        Self::new(id, [sender.clone(), sender])
    }

    /// A stream that is reassembled but never dissected.
    pub fn untapped(id: u64) -> Self {
        Self {
            id,
            created_at: Instant::now(),
            is_tap_target: false,
            protocol: OnceLock::new(),
            closed: AtomicBool::new(false),
            senders: Mutex::new(None),
            close_notifier: None,
        }
    }

    /// Send `key` on `tx` when the stream closes.
    pub fn with_close_notifier(mut self, tx: Sender<String>, key: String) -> Self {
        self.close_notifier = Some((tx, key));
        self
    }

    pub fn is_tap_target(&self) -> bool {
        self.is_tap_target
    }

    /// Queue a chunk for the reader of `direction`.
    ///
    /// Blocks while the reader queue is full. Returns false once the stream
    /// or the reader is gone.
    pub fn send(&self, direction: Direction, chunk: ReaderChunk) -> bool {
        let sender = {
            let senders = self.senders.lock().expect("stream senders lock poisoned");
            match senders.as_ref() {
                Some(senders) => match direction {
                    Direction::ClientToServer => senders[0].clone(),
                    Direction::ServerToClient => senders[1].clone(),
                },
                None => return false,
            }
        };
        sender.send(chunk).is_ok()
    }
}

impl StreamHandle for TcpStream {
    fn id(&self) -> u64 {
        self.id
    }

    fn created_at(&self) -> Instant {
        self.created_at
    }

    fn set_protocol(&self, protocol: &'static Protocol) {
        if self.protocol.set(protocol).is_ok() {
            debug!("Stream {} identified as {}", self.id, protocol.abbreviation);
        }
    }

    fn protocol(&self) -> Option<&'static Protocol> {
        self.protocol.get().copied()
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.senders
            .lock()
            .expect("stream senders lock poisoned")
            .take();
        if let Some((tx, key)) = &self.close_notifier {
            match tx.try_send(key.clone()) {
                Ok(()) | Err(TrySendError::Disconnected(_)) => {}
                Err(TrySendError::Full(_)) => {
                    warn!("Closed reader queue full, {} stays registered", key);
                }
            }
        }
    }
}
