//! Blocking byte source over the chunk queue of one connection direction.

use crossbeam::channel::{Receiver, RecvTimeoutError};
use log::debug;
use std::io::{self, Read};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::api::{
    CaptureSource, CounterPair, Emitter, ReadProgress, StreamHandle, TcpId, TcpReader,
};
use crate::network::dpi::tls;
use crate::tap::outbound_link::{LinkProtocol, OutboundLinkWriter};

/// Chunks inspected for a TLS ClientHello before giving up
const TLS_CHECK_LIMIT: usize = 100;

/// Bytes handed from reassembly (or the TLS poller) to a reader
#[derive(Debug, Clone)]
pub struct ReaderChunk {
    pub data: Vec<u8>,
    pub capture_time: SystemTime,
}

impl ReaderChunk {
    pub fn new(data: Vec<u8>, capture_time: SystemTime) -> Self {
        Self { data, capture_time }
    }
}

/// One direction of a connection as seen by a dissector.
///
/// Reads block until a chunk is queued and return end of stream once every
/// sender is gone. Bytes left over from a short read are served before the
/// next chunk is pulled.
pub struct DirectionalReader {
    tcp_id: TcpId,
    is_client: bool,
    is_outgoing: bool,
    capture: CaptureSource,
    namespace: String,
    rx: Receiver<ReaderChunk>,
    residual: Vec<u8>,
    pos: usize,
    capture_time: SystemTime,
    parent: Arc<dyn StreamHandle>,
    counter_pair: Arc<CounterPair>,
    progress: ReadProgress,
    emitter: Arc<dyn Emitter>,
    outbound_links: Option<Arc<OutboundLinkWriter>>,
    tls_checks_left: usize,
    idle_timeout: Option<Duration>,
}

impl DirectionalReader {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        tcp_id: TcpId,
        is_client: bool,
        is_outgoing: bool,
        capture: CaptureSource,
        rx: Receiver<ReaderChunk>,
        parent: Arc<dyn StreamHandle>,
        counter_pair: Arc<CounterPair>,
        emitter: Arc<dyn Emitter>,
    ) -> Self {
        Self {
            tcp_id,
            is_client,
            is_outgoing,
            capture,
            namespace: String::new(),
            rx,
            residual: Vec::new(),
            pos: 0,
            capture_time: UNIX_EPOCH,
            parent,
            counter_pair,
            progress: ReadProgress::default(),
            emitter,
            outbound_links: None,
            tls_checks_left: 0,
            idle_timeout: None,
        }
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Report the TLS server name of this connection, client side only.
    pub fn with_outbound_links(mut self, writer: Arc<OutboundLinkWriter>) -> Self {
        if self.is_client {
            self.outbound_links = Some(writer);
            self.tls_checks_left = TLS_CHECK_LIMIT;
        }
        self
    }

    /// Close the parent stream when no chunk arrives for `timeout`.
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = Some(timeout);
        self
    }

    fn next_chunk(&mut self) -> Option<ReaderChunk> {
        match self.idle_timeout {
            None => self.rx.recv().ok(),
            Some(timeout) => match self.rx.recv_timeout(timeout) {
                Ok(chunk) => Some(chunk),
                Err(RecvTimeoutError::Timeout) => {
                    debug!("Reader {} idle for {:?}, closing", self.tcp_id, timeout);
                    self.parent.close();
                    None
                }
                Err(RecvTimeoutError::Disconnected) => None,
            },
        }
    }

    fn check_tls(&mut self, data: &[u8]) {
        if self.tls_checks_left == 0 || data.len() <= 5 {
            return;
        }
        self.tls_checks_left -= 1;
        let Some(writer) = &self.outbound_links else {
            return;
        };
        if let Some(hello) = tls::parse_client_hello(data) {
            debug!(
                "TLS ClientHello on {} (sni: {:?})",
                self.tcp_id,
                hello.sni
            );
            writer.write_outbound_link(
                self.tcp_id.src_ip,
                self.tcp_id.dst_ip,
                self.tcp_id.dst_port,
                hello.sni,
                LinkProtocol::Tcp,
            );
            self.tls_checks_left = 0;
        }
    }
}

impl Read for DirectionalReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        while self.pos >= self.residual.len() {
            let Some(chunk) = self.next_chunk() else {
                return Ok(0);
            };
            self.capture_time = chunk.capture_time;
            self.check_tls(&chunk.data);
            self.residual = chunk.data;
            self.pos = 0;
        }

        let n = buf.len().min(self.residual.len() - self.pos);
        buf[..n].copy_from_slice(&self.residual[self.pos..self.pos + n]);
        self.pos += n;
        self.progress.feed(n);
        Ok(n)
    }
}

impl TcpReader for DirectionalReader {
    fn tcp_id(&self) -> &TcpId {
        &self.tcp_id
    }

    fn is_client(&self) -> bool {
        self.is_client
    }

    fn is_outgoing(&self) -> bool {
        self.is_outgoing
    }

    fn capture_time(&self) -> SystemTime {
        self.capture_time
    }

    fn capture_source(&self) -> CaptureSource {
        self.capture
    }

    fn namespace(&self) -> &str {
        &self.namespace
    }

    fn parent(&self) -> &dyn StreamHandle {
        &*self.parent
    }

    fn counter_pair(&self) -> &CounterPair {
        &self.counter_pair
    }

    fn progress(&self) -> &ReadProgress {
        &self.progress
    }

    fn emitter(&self) -> &dyn Emitter {
        &*self.emitter
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::api::OutputChannelItem;
    use crate::tap::tcp_stream::TcpStream;
    use crossbeam::channel::{self, Sender};
    use std::sync::Mutex;

    #[derive(Default)]
    pub(crate) struct CollectingEmitter {
        pub items: Mutex<Vec<OutputChannelItem>>,
    }

    impl Emitter for CollectingEmitter {
        fn emit(&self, item: OutputChannelItem) {
            self.items.lock().unwrap().push(item);
        }
    }

    pub(crate) fn client_id() -> TcpId {
        TcpId::new(
            "10.0.0.1".parse().unwrap(),
            40000,
            "93.184.216.34".parse().unwrap(),
            443,
        )
    }

    /// A client reader and the sender feeding it.
    pub(crate) fn reader_pair(
        emitter: Arc<dyn Emitter>,
    ) -> (DirectionalReader, Sender<ReaderChunk>, Arc<TcpStream>) {
        let (tx, rx) = channel::unbounded();
        let stream = Arc::new(TcpStream::untapped(1));
        let reader = DirectionalReader::new(
            client_id(),
            true,
            true,
            CaptureSource::Pcap,
            rx,
            stream.clone(),
            Arc::new(CounterPair::default()),
            emitter,
        );
        (reader, tx, stream)
    }

    #[test]
    fn test_reads_reproduce_chunks_across_boundaries() {
        let (mut reader, tx, _) = reader_pair(Arc::new(CollectingEmitter::default()));
        let now = SystemTime::now();
        tx.send(ReaderChunk::new(b"hello ".to_vec(), now)).unwrap();
        tx.send(ReaderChunk::new(Vec::new(), now)).unwrap();
        tx.send(ReaderChunk::new(b"wor".to_vec(), now)).unwrap();
        tx.send(ReaderChunk::new(b"ld".to_vec(), now)).unwrap();
        drop(tx);

        let mut out = Vec::new();
        let mut buf = [0u8; 4];
        loop {
            let n = reader.read(&mut buf).unwrap();
            if n == 0 {
                break;
            }
            assert!(n <= 4);
            out.extend_from_slice(&buf[..n]);
        }
        assert_eq!(out, b"hello world");
        assert_eq!(reader.progress().current(), 11);
        assert_eq!(reader.capture_time(), now);
    }

    #[test]
    fn test_client_hello_reports_outbound_link() {
        let (writer, links) = OutboundLinkWriter::new(4);
        let (reader, tx, _) = reader_pair(Arc::new(CollectingEmitter::default()));
        let mut reader = reader.with_outbound_links(Arc::new(writer));
        let hello = crate::network::dpi::tls::tests::client_hello_record("api.example.com");
        tx.send(ReaderChunk::new(hello.clone(), SystemTime::now()))
            .unwrap();
        tx.send(ReaderChunk::new(hello, SystemTime::now())).unwrap();
        drop(tx);

        let mut sink = Vec::new();
        reader.read_to_end(&mut sink).unwrap();
        let link = links.try_recv().unwrap();
        assert_eq!(link.dst_port, 443);
        assert_eq!(link.suggested_resolved_name.as_deref(), Some("api.example.com"));
        // Reported once per connection
        assert!(links.try_recv().is_err());
    }

    #[test]
    fn test_idle_timeout_closes_parent() {
        let (reader, _tx, stream) = reader_pair(Arc::new(CollectingEmitter::default()));
        let mut reader = reader.with_idle_timeout(Duration::from_millis(20));
        let mut buf = [0u8; 8];
        assert_eq!(reader.read(&mut buf).unwrap(), 0);
        assert!(stream.is_closed());
    }
}
