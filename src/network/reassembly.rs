// network/reassembly.rs - TCP stream reassembly in front of the dissectors
//
// Segments are put back into sequence order per direction and handed to a
// per-connection stream created by a [`StreamFactory`]. Sequence arithmetic
// wraps at 2^32.

use log::debug;
use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;
use std::time::{Duration, Instant, SystemTime};

use crate::api::TcpId;
use crate::network::parser::TcpSegment;

/// Out-of-order segments kept per direction before the gap is skipped
const MAX_PENDING_SEGMENTS: usize = 1024;

/// Direction of reassembled bytes relative to the connection initiator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    ClientToServer,
    ServerToClient,
}

impl Direction {
    fn index(self) -> usize {
        match self {
            Direction::ClientToServer => 0,
            Direction::ServerToClient => 1,
        }
    }
}

/// Receiver of the in-order byte stream of one connection
pub trait ReassembledStream: Send {
    fn reassembled(&mut self, direction: Direction, data: &[u8], timestamp: SystemTime);

    /// Called once, when the connection is closed or evicted.
    fn reassembly_complete(&mut self);
}

/// Creates the receiver for each new connection.
///
/// `tcp_id` is in client orientation.
pub trait StreamFactory {
    type Stream: ReassembledStream;

    fn new_stream(&self, tcp_id: &TcpId, first_segment: &TcpSegment) -> Self::Stream;
}

#[inline]
fn seq_lt(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

#[inline]
fn seq_le(a: u32, b: u32) -> bool {
    a == b || seq_lt(a, b)
}

#[inline]
fn seq_add(seq: u32, len: usize) -> u32 {
    seq.wrapping_add(len as u32)
}

#[derive(Debug)]
struct PendingSegment {
    seq: u32,
    data: Vec<u8>,
    timestamp: SystemTime,
}

/// One direction of a connection
#[derive(Debug, Default)]
struct HalfStream {
    /// Next expected sequence number, unknown until the first segment
    expected_seq: Option<u32>,
    /// Sequence number the pending keys are relative to, moved along with
    /// `expected_seq`
    base_seq: u32,
    /// Out-of-order segments keyed by offset from `base_seq`
    pending: BTreeMap<u32, PendingSegment>,
    fin: bool,
    retransmits: u64,
}

impl HalfStream {
    fn syn(&mut self, seq: u32) {
        // SYN consumes one sequence number
        let next = seq.wrapping_add(1);
        self.expected_seq = Some(next);
        self.base_seq = next;
    }

    /// Accept a segment and return the chunks that became contiguous.
    fn accept(&mut self, seq: u32, data: &[u8], timestamp: SystemTime) -> Vec<PendingSegment> {
        let mut ready = Vec::new();
        if data.is_empty() {
            return ready;
        }

        let expected = match self.expected_seq {
            Some(expected) => expected,
            None => {
                // Mid-stream pickup, start from whatever we see first
                self.base_seq = seq;
                seq
            }
        };

        let seg_end = seq_add(seq, data.len());
        let (seq, data) = if seq_lt(seq, expected) {
            if seq_le(seg_end, expected) {
                self.retransmits += 1;
                return ready;
            }
            // Partial overlap, keep only the new tail
            let overlap = expected.wrapping_sub(seq) as usize;
            (expected, &data[overlap..])
        } else {
            (seq, data)
        };

        if seq == expected {
            self.expected_seq = Some(seq_add(seq, data.len()));
            ready.push(PendingSegment {
                seq,
                data: data.to_vec(),
                timestamp,
            });
            self.drain_contiguous(&mut ready);
        } else {
            self.expected_seq = Some(expected);
            if self.pending.is_empty() {
                self.base_seq = expected;
            }
            let key = seq.wrapping_sub(self.base_seq);
            self.pending.entry(key).or_insert_with(|| PendingSegment {
                seq,
                data: data.to_vec(),
                timestamp,
            });
            if self.pending.len() > MAX_PENDING_SEGMENTS {
                self.skip_gap(&mut ready);
            }
        }
        ready
    }

    /// Move pending segments that now line up into `ready`.
    fn drain_contiguous(&mut self, ready: &mut Vec<PendingSegment>) {
        while let Some(entry) = self.pending.first_entry() {
            let Some(expected) = self.expected_seq else {
                break;
            };
            let segment = entry.get();
            let seg_end = seq_add(segment.seq, segment.data.len());
            if seq_lt(expected, segment.seq) {
                break;
            }
            let mut segment = entry.remove();
            if seq_le(seg_end, expected) {
                self.retransmits += 1;
                continue;
            }
            let overlap = expected.wrapping_sub(segment.seq) as usize;
            segment.data.drain(..overlap);
            segment.seq = expected;
            self.expected_seq = Some(seg_end);
            ready.push(segment);
        }
        self.rebase();
    }

    /// Re-key pending segments relative to the next expected sequence.
    ///
    /// Offsets from a fixed base stop sorting correctly once the stream moves
    /// 2^32 bytes past it.
    fn rebase(&mut self) {
        let Some(expected) = self.expected_seq else {
            return;
        };
        if self.base_seq == expected || self.pending.is_empty() {
            self.base_seq = expected;
            return;
        }
        let pending = std::mem::take(&mut self.pending);
        for segment in pending.into_values() {
            let seg_end = seq_add(segment.seq, segment.data.len());
            if seq_le(seg_end, expected) {
                self.retransmits += 1;
                continue;
            }
            // Overlapping the expected sequence sorts first, trimmed on drain
            let key = if seq_lt(segment.seq, expected) {
                0
            } else {
                segment.seq.wrapping_sub(expected)
            };
            self.pending.entry(key).or_insert(segment);
        }
        self.base_seq = expected;
    }

    /// Give up on the missing bytes and continue at the first pending segment.
    fn skip_gap(&mut self, ready: &mut Vec<PendingSegment>) -> bool {
        let Some((_, first)) = self.pending.first_key_value() else {
            return false;
        };
        debug!(
            "Skipping gap of {} bytes",
            first
                .seq
                .wrapping_sub(self.expected_seq.unwrap_or(first.seq))
        );
        self.expected_seq = Some(first.seq);
        self.drain_contiguous(ready);
        true
    }

    /// Deliver everything still buffered, skipping every gap.
    fn flush(&mut self) -> Vec<PendingSegment> {
        let mut ready = Vec::new();
        while self.skip_gap(&mut ready) {}
        ready
    }
}

struct Connection<S> {
    client: TcpId,
    stream: S,
    halves: [HalfStream; 2],
    last_seen: Instant,
}

impl<S: ReassembledStream> Connection<S> {
    fn direction_of(&self, segment: &TcpSegment) -> Direction {
        if segment.src_ip == self.client.src_ip && segment.src_port == self.client.src_port {
            Direction::ClientToServer
        } else {
            Direction::ServerToClient
        }
    }

    fn deliver(&mut self, direction: Direction, chunks: Vec<PendingSegment>) {
        for chunk in chunks {
            if !chunk.data.is_empty() {
                self.stream
                    .reassembled(direction, &chunk.data, chunk.timestamp);
            }
        }
    }

    /// Flush both directions; true if anything was buffered.
    fn flush(&mut self) -> bool {
        let mut flushed = false;
        for direction in [Direction::ClientToServer, Direction::ServerToClient] {
            let chunks = self.halves[direction.index()].flush();
            flushed |= !chunks.is_empty();
            self.deliver(direction, chunks);
        }
        flushed
    }
}

type Endpoint = (IpAddr, u16);

/// Order-independent key of a connection
fn connection_key(segment: &TcpSegment) -> (Endpoint, Endpoint) {
    let a = (segment.src_ip, segment.src_port);
    let b = (segment.dst_ip, segment.dst_port);
    if a <= b { (a, b) } else { (b, a) }
}

/// Counters reported by [`Assembler::stats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AssemblerStats {
    pub connections: usize,
    pub segments: u64,
    pub retransmits: u64,
}

/// Reassembles TCP connections and feeds a stream per connection.
///
/// Not thread-safe by itself. The capture loop and the cleaner share it
/// behind a mutex.
pub struct Assembler<F: StreamFactory> {
    factory: F,
    connections: HashMap<(Endpoint, Endpoint), Connection<F::Stream>>,
    segments: u64,
    retransmits: u64,
}

impl<F: StreamFactory> Assembler<F> {
    pub fn new(factory: F) -> Self {
        Self {
            factory,
            connections: HashMap::new(),
            segments: 0,
            retransmits: 0,
        }
    }

    pub fn factory(&self) -> &F {
        &self.factory
    }

    pub fn stats(&self) -> AssemblerStats {
        AssemblerStats {
            connections: self.connections.len(),
            segments: self.segments,
            retransmits: self.retransmits
                + self
                    .connections
                    .values()
                    .flat_map(|c| c.halves.iter())
                    .map(|h| h.retransmits)
                    .sum::<u64>(),
        }
    }

    /// Feed one segment seen at `now`.
    pub fn assemble(&mut self, segment: &TcpSegment, now: Instant) {
        self.segments += 1;
        let key = connection_key(segment);

        if !self.connections.contains_key(&key) {
            // Nothing to reassemble from a stray teardown or bare ACK
            if segment.flags.rst || (segment.payload.is_empty() && !segment.flags.syn) {
                return;
            }
            let sender = TcpId::new(
                segment.src_ip,
                segment.src_port,
                segment.dst_ip,
                segment.dst_port,
            );
            // A SYN-ACK comes from the server
            let client = if segment.flags.syn && segment.flags.ack {
                sender.reversed()
            } else {
                sender
            };
            debug!("New TCP connection {}", client);
            let stream = self.factory.new_stream(&client, segment);
            self.connections.insert(
                key,
                Connection {
                    client,
                    stream,
                    halves: [HalfStream::default(), HalfStream::default()],
                    last_seen: now,
                },
            );
        }

        let Some(conn) = self.connections.get_mut(&key) else {
            return;
        };
        conn.last_seen = now;
        let direction = conn.direction_of(segment);

        if segment.flags.rst {
            if let Some(mut conn) = self.connections.remove(&key) {
                self.retransmits += conn.halves.iter().map(|h| h.retransmits).sum::<u64>();
                conn.flush();
                conn.stream.reassembly_complete();
            }
            return;
        }

        let half = &mut conn.halves[direction.index()];
        if segment.flags.syn {
            half.syn(segment.seq);
        }
        let seq = if segment.flags.syn {
            segment.seq.wrapping_add(1)
        } else {
            segment.seq
        };
        let chunks = half.accept(seq, &segment.payload, segment.timestamp);
        if segment.flags.fin {
            half.fin = true;
        }
        conn.deliver(direction, chunks);

        if conn.halves.iter().all(|h| h.fin)
            && let Some(mut conn) = self.connections.remove(&key)
        {
            self.retransmits += conn.halves.iter().map(|h| h.retransmits).sum::<u64>();
            conn.flush();
            conn.stream.reassembly_complete();
        }
    }

    /// Flush and close connections idle since before `threshold`.
    ///
    /// Returns `(flushed, closed)`: connections that had buffered
    /// out-of-order data, and connections that were closed.
    pub fn flush_close_older_than(&mut self, threshold: Instant) -> (usize, usize) {
        let stale: Vec<_> = self
            .connections
            .iter()
            .filter(|(_, c)| c.last_seen < threshold)
            .map(|(k, _)| *k)
            .collect();

        let mut flushed = 0;
        let mut closed = 0;
        for key in stale {
            if let Some(mut conn) = self.connections.remove(&key) {
                self.retransmits += conn.halves.iter().map(|h| h.retransmits).sum::<u64>();
                if conn.flush() {
                    flushed += 1;
                }
                conn.stream.reassembly_complete();
                closed += 1;
            }
        }
        (flushed, closed)
    }

    /// Close every connection, used on shutdown and at the end of a capture file.
    pub fn flush_all(&mut self) -> usize {
        let everything = Instant::now() + Duration::from_secs(1);
        let (_, closed) = self.flush_close_older_than(everything);
        closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::parser::TcpFlags;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct Recorded {
        client: Vec<u8>,
        server: Vec<u8>,
        completed: usize,
        ids: Vec<TcpId>,
    }

    struct RecordingStream(Arc<Mutex<Recorded>>);

    impl ReassembledStream for RecordingStream {
        fn reassembled(&mut self, direction: Direction, data: &[u8], _timestamp: SystemTime) {
            let mut rec = self.0.lock().unwrap();
            match direction {
                Direction::ClientToServer => rec.client.extend_from_slice(data),
                Direction::ServerToClient => rec.server.extend_from_slice(data),
            }
        }

        fn reassembly_complete(&mut self) {
            self.0.lock().unwrap().completed += 1;
        }
    }

    struct RecordingFactory(Arc<Mutex<Recorded>>);

    impl StreamFactory for RecordingFactory {
        type Stream = RecordingStream;

        fn new_stream(&self, tcp_id: &TcpId, _first: &TcpSegment) -> RecordingStream {
            self.0.lock().unwrap().ids.push(tcp_id.clone());
            RecordingStream(self.0.clone())
        }
    }

    fn assembler() -> (Assembler<RecordingFactory>, Arc<Mutex<Recorded>>) {
        let rec = Arc::new(Mutex::new(Recorded::default()));
        (Assembler::new(RecordingFactory(rec.clone())), rec)
    }

    fn seg(from_client: bool, seq: u32, flags: TcpFlags, payload: &[u8]) -> TcpSegment {
        let client: IpAddr = "10.0.0.1".parse().unwrap();
        let server: IpAddr = "10.0.0.2".parse().unwrap();
        let (src_ip, src_port, dst_ip, dst_port) = if from_client {
            (client, 40000, server, 80)
        } else {
            (server, 80, client, 40000)
        };
        TcpSegment {
            src_ip,
            dst_ip,
            src_port,
            dst_port,
            seq,
            ack: 0,
            flags,
            payload: payload.to_vec(),
            timestamp: SystemTime::now(),
        }
    }

    fn data() -> TcpFlags {
        TcpFlags {
            ack: true,
            psh: true,
            ..Default::default()
        }
    }

    #[test]
    fn test_seq_wraparound() {
        assert!(seq_lt(u32::MAX - 1, 2));
        assert!(!seq_lt(2, u32::MAX - 1));
        assert!(seq_le(5, 5));
        assert_eq!(seq_add(u32::MAX, 2), 1);
    }

    #[test]
    fn test_out_of_order_across_sequence_wrap() {
        let (mut asm, rec) = assembler();
        let now = Instant::now();
        let syn = TcpFlags {
            syn: true,
            ..Default::default()
        };
        let isn = u32::MAX - 4;
        asm.assemble(&seg(true, isn, syn, &[]), now);
        // "hello " covers MAX-3..=MAX+2 and ends at 2
        asm.assemble(&seg(true, 2, data(), b"world"), now);
        asm.assemble(&seg(true, 7, data(), b"!"), now);
        assert!(rec.lock().unwrap().client.is_empty());
        asm.assemble(&seg(true, isn.wrapping_add(1), data(), b"hello "), now);

        assert_eq!(rec.lock().unwrap().client, b"hello world!");
    }

    #[test]
    fn test_pending_segments_after_four_gib() {
        // The stream has moved almost 2^32 bytes past where it started
        let start = 1_000u32;
        let expected = start.wrapping_sub(30);
        let mut half = HalfStream {
            expected_seq: Some(expected),
            base_seq: start,
            ..Default::default()
        };
        let now = SystemTime::now();

        assert!(half.accept(expected.wrapping_add(10), b"0123456789", now).is_empty());
        assert!(half.accept(expected.wrapping_add(30), b"KLMNOPQRST", now).is_empty());
        assert!(half.accept(expected.wrapping_add(20), b"abcdefghij", now).is_empty());
        let ready = half.accept(expected, b"GGGGGGGGGG", now);

        let delivered: Vec<u8> = ready.into_iter().flat_map(|s| s.data).collect();
        assert_eq!(delivered, b"GGGGGGGGGG0123456789abcdefghijKLMNOPQRST");
        assert!(half.pending.is_empty());
    }

    #[test]
    fn test_rebase_keeps_segments_queued_before_a_drain() {
        let mut half = HalfStream::default();
        half.syn(u32::MAX - 20);
        let now = SystemTime::now();
        let first = u32::MAX - 19;

        // Two gaps: [first+5, first+10) and [first+20, first+25)
        half.accept(first.wrapping_add(10), b"bbbbbbbbbb", now);
        half.accept(first.wrapping_add(25), b"ddddd", now);
        let ready = half.accept(first, b"aaaaa", now);
        assert_eq!(ready.len(), 1);

        let ready = half.accept(first.wrapping_add(5), b"xxxxx", now);
        let delivered: Vec<u8> = ready.into_iter().flat_map(|s| s.data).collect();
        assert_eq!(delivered, b"xxxxxbbbbbbbbbb");

        let ready = half.accept(first.wrapping_add(20), b"ccccc", now);
        let delivered: Vec<u8> = ready.into_iter().flat_map(|s| s.data).collect();
        assert_eq!(delivered, b"cccccddddd");
        assert!(half.pending.is_empty());
    }

    #[test]
    fn test_out_of_order_and_retransmit() {
        let (mut asm, rec) = assembler();
        let now = Instant::now();
        asm.assemble(&seg(true, 100, data(), b"hello "), now);
        asm.assemble(&seg(true, 111, data(), b"!"), now);
        asm.assemble(&seg(true, 106, data(), b"world"), now);
        asm.assemble(&seg(true, 100, data(), b"hello "), now);
        // Overlapping resend carrying one new byte
        asm.assemble(&seg(true, 110, data(), b"d!?"), now);

        assert_eq!(rec.lock().unwrap().client, b"hello world!?");
        assert!(asm.stats().retransmits >= 1);
    }

    #[test]
    fn test_syn_ack_first_flips_orientation() {
        let (mut asm, rec) = assembler();
        let syn_ack = TcpFlags {
            syn: true,
            ack: true,
            ..Default::default()
        };
        asm.assemble(&seg(false, 500, syn_ack, &[]), Instant::now());
        asm.assemble(&seg(false, 501, data(), b"HTTP/1.1"), Instant::now());

        let rec = rec.lock().unwrap();
        assert_eq!(rec.ids[0].dst_port, 80);
        assert_eq!(rec.server, b"HTTP/1.1");
        assert!(rec.client.is_empty());
    }

    #[test]
    fn test_fin_both_sides_completes() {
        let (mut asm, rec) = assembler();
        let fin = TcpFlags {
            fin: true,
            ack: true,
            ..Default::default()
        };
        let now = Instant::now();
        asm.assemble(&seg(true, 1, data(), b"GET"), now);
        asm.assemble(&seg(false, 9, data(), b"200"), now);
        asm.assemble(&seg(true, 4, fin, &[]), now);
        assert_eq!(rec.lock().unwrap().completed, 0);
        asm.assemble(&seg(false, 12, fin, &[]), now);
        assert_eq!(rec.lock().unwrap().completed, 1);
        assert_eq!(asm.stats().connections, 0);
    }

    #[test]
    fn test_rst_completes_and_stray_ack_is_ignored() {
        let (mut asm, rec) = assembler();
        let now = Instant::now();
        asm.assemble(&seg(true, 1, data(), b"x"), now);
        let rst = TcpFlags {
            rst: true,
            ..Default::default()
        };
        asm.assemble(&seg(false, 0, rst, &[]), now);
        asm.assemble(&seg(true, 2, data(), &[]), now);

        assert_eq!(rec.lock().unwrap().completed, 1);
        assert_eq!(asm.stats().connections, 0);
    }

    #[test]
    fn test_flush_close_older_than() {
        let (mut asm, rec) = assembler();
        let old = Instant::now();
        asm.assemble(&seg(true, 1, data(), b"ab"), old);
        // Gap at 3..5
        asm.assemble(&seg(true, 5, data(), b"ef"), old);

        assert_eq!(asm.flush_close_older_than(old), (0, 0));
        let (flushed, closed) = asm.flush_close_older_than(old + Duration::from_millis(1));
        assert_eq!((flushed, closed), (1, 1));

        let rec = rec.lock().unwrap();
        assert_eq!(rec.client, b"abef");
        assert_eq!(rec.completed, 1);
    }
}
