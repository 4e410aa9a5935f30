use slice_deque::SliceDeque;
use std::io;

/// ALPN token the HTTP/2 adaptor requires.
pub const ALPN_H2: &str = "h2";

/// A FIFO byte queue bridging a raw connection to the protocol engines.
/// Ingress fills it from the transport, the engine consumes from the front;
/// egress is the mirror image. Backed by a slice deque so the retained
/// octets are always addressable as one contiguous slice.
pub struct IoQueue {
    data: SliceDeque<u8>,
    cap: usize,
}

impl IoQueue {
    pub fn new(cap: usize) -> IoQueue {
        IoQueue {
            data: SliceDeque::with_capacity(cap),
            cap,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[inline]
    pub fn free_capacity(&self) -> usize {
        self.cap.saturating_sub(self.data.len())
    }

    /// The buffered octets, contiguous.
    #[inline]
    pub fn octets(&self) -> &[u8] {
        self.data.as_slice()
    }

    /// Copy the first `dst.len()` octets without consuming them. False when
    /// fewer are buffered.
    pub fn peek_exact(&self, dst: &mut [u8]) -> bool {
        if self.data.len() < dst.len() {
            return false;
        }

        dst.copy_from_slice(&self.data[..dst.len()]);
        true
    }

    /// Drop the first `count` octets.
    pub fn consume(&mut self, count: usize) {
        if count > self.data.len() {
            panic!("Attempted to consume past the end of the queue");
        }

        unsafe { self.data.move_head(count as isize) }
    }

    /// Append octets, clamped to the free capacity. Returns the number
    /// taken.
    pub fn push(&mut self, octets: &[u8]) -> usize {
        let count = octets.len().min(self.free_capacity());
        self.data.extend(octets[..count].iter().copied());
        count
    }

    /// Fill the queue from a reader until it is full or the reader would
    /// block. A blocking reader folds into the short count.
    pub fn fill_from<R: io::Read>(&mut self, reader: &mut R) -> io::Result<usize> {
        let mut total = 0;
        let mut scratch = [0u8; 4096];

        while self.free_capacity() > 0 {
            let want = self.free_capacity().min(scratch.len());

            match reader.read(&mut scratch[..want]) {
                Ok(0) => break,
                Ok(count) => {
                    self.data.extend(scratch[..count].iter().copied());
                    total += count;
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => return Err(err),
            }
        }

        Ok(total)
    }

    /// Drain the queue into a writer until empty or the writer would
    /// block.
    pub fn drain_to<W: io::Write>(&mut self, writer: &mut W) -> io::Result<usize> {
        let mut total = 0;

        while !self.data.is_empty() {
            match writer.write(self.data.as_slice()) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(count) => {
                    self.consume(count);
                    total += count;
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => return Err(err),
            }
        }

        Ok(total)
    }
}

/// The engine-facing face of one raw connection: the negotiated ALPN
/// protocol and the read/write buffer pair. TLS and socket lifecycle live
/// outside; the engine only ever sees these buffers.
pub struct Transport {
    pub read: IoQueue,
    pub write: IoQueue,
    alpn: Option<String>,
    closed: bool,
}

impl Transport {
    pub fn new(read_cap: usize, write_cap: usize) -> Transport {
        Transport {
            read: IoQueue::new(read_cap),
            write: IoQueue::new(write_cap),
            alpn: None,
            closed: false,
        }
    }

    pub fn with_alpn(mut self, protocol: &str) -> Transport {
        self.alpn = Some(protocol.to_string());
        self
    }

    #[inline]
    pub fn alpn(&self) -> Option<&str> {
        self.alpn.as_deref()
    }

    /// Close the raw side. Buffered egress octets remain drainable.
    pub fn close(&mut self) {
        self.closed = true;
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    struct ChunkedReader {
        data: Vec<u8>,
        cursor: usize,
        chunk: usize,
    }

    impl io::Read for ChunkedReader {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.cursor == self.data.len() {
                return Err(io::ErrorKind::WouldBlock.into());
            }

            let count = self.chunk.min(buf.len()).min(self.data.len() - self.cursor);
            buf[..count].copy_from_slice(&self.data[self.cursor..self.cursor + count]);
            self.cursor += count;
            Ok(count)
        }
    }

    #[test]
    fn test_fill_and_drain_roundtrip() {
        let data: Vec<u8> = (0..1000).map(|item| item as u8).collect();
        let mut reader = ChunkedReader {
            data: data.clone(),
            cursor: 0,
            chunk: 33,
        };

        let mut queue = IoQueue::new(4096);

        let filled = queue.fill_from(&mut reader).unwrap();
        assert_eq!(filled, 1000);
        assert_eq!(queue.octets(), &data[..]);

        let mut sink = Cursor::new(Vec::new());
        let drained = queue.drain_to(&mut sink).unwrap();

        assert_eq!(drained, 1000);
        assert!(queue.is_empty());
        assert_eq!(sink.into_inner(), data);
    }

    #[test]
    fn test_fill_stops_at_capacity() {
        let mut reader = ChunkedReader {
            data: vec![1; 100],
            cursor: 0,
            chunk: 10,
        };

        let mut queue = IoQueue::new(64);

        let filled = queue.fill_from(&mut reader).unwrap();

        assert_eq!(filled, 64);
        assert_eq!(queue.free_capacity(), 0);
    }

    #[test]
    fn test_peek_and_consume() {
        let mut queue = IoQueue::new(64);
        queue.push(&[1, 2, 3, 4, 5]);

        let mut head = [0u8; 3];
        assert!(queue.peek_exact(&mut head));
        assert_eq!(head, [1, 2, 3]);

        // Peeking does not consume.
        assert_eq!(queue.len(), 5);

        queue.consume(3);
        assert_eq!(queue.octets(), &[4, 5]);

        let mut too_much = [0u8; 3];
        assert!(!queue.peek_exact(&mut too_much));
    }

    #[test]
    #[should_panic(expected = "Attempted to consume past the end of the queue")]
    fn test_consume_past_end_fails() {
        let mut queue = IoQueue::new(16);
        queue.push(&[1]);
        queue.consume(2);
    }

    #[test]
    fn test_alpn_token() {
        let transport = Transport::new(64, 64).with_alpn(ALPN_H2);
        assert_eq!(transport.alpn(), Some("h2"));

        let bare = Transport::new(64, 64);
        assert_eq!(bare.alpn(), None);
    }
}
