use crate::buffer::{self, Buf};
use byteorder::{BigEndian, ByteOrder};
use std::collections::VecDeque;

/// An append-only queue of pooled buffers addressed by absolute octet
/// offsets. Offsets count from the birth of the chain and never shift:
/// releasing consumed buffers advances the base, appending advances the
/// extent, and everything recorded against an offset (field locations, parse
/// cursors, send cursors) stays valid for as long as the octets are
/// retained.
pub struct Chain {
    bufs: VecDeque<Buf>,
    base: u64,
    extent: u64,
}

impl Chain {
    #[inline]
    pub fn new() -> Chain {
        Chain {
            bufs: VecDeque::new(),
            base: 0,
            extent: 0,
        }
    }

    /// Absolute offset of the first retained octet.
    #[inline]
    pub fn base(&self) -> u64 {
        self.base
    }

    /// Absolute offset one past the last appended octet.
    #[inline]
    pub fn extent(&self) -> u64 {
        self.extent
    }

    /// Retained octet count.
    #[inline]
    pub fn len(&self) -> u64 {
        self.extent - self.base
    }

    /// Number of retained buffers.
    #[inline]
    pub fn buf_count(&self) -> usize {
        self.bufs.len()
    }

    /// Append octets, drawing buffers from the pool as needed.
    pub fn append(&mut self, mut src: &[u8]) {
        while !src.is_empty() {
            let need_buf = match self.bufs.back() {
                Some(tail) => tail.is_full(),
                None => true,
            };

            if need_buf {
                self.bufs.push_back(buffer::alloc());
            }

            let tail = self.bufs.back_mut().expect("Chain must have a tail buffer");
            let taken = tail.put(src);

            src = &src[taken..];
            self.extent += taken as u64;
        }
    }

    /// Move a whole buffer onto the tail of the chain.
    pub fn push_buf(&mut self, buf: Buf) {
        self.extent += buf.len() as u64;
        self.bufs.push_back(buf);
    }

    /// Move every buffer of `other` onto the tail of this chain, leaving
    /// `other` empty but keeping its offsets intact.
    pub fn splice(&mut self, other: &mut Chain) {
        while let Some(buf) = other.bufs.pop_front() {
            other.base += buf.len() as u64;
            self.push_buf(buf);
        }
    }

    /// Release every buffer that lies entirely below `offset` back to the
    /// pool. Returns the number of buffers released.
    pub fn release_to(&mut self, offset: u64) -> usize {
        let mut released = 0;

        while let Some(front) = self.bufs.front() {
            let front_end = self.base + front.len() as u64;

            if front_end > offset || front_end == self.extent && !front.is_full() {
                break;
            }

            let front = self.bufs.pop_front().expect("Front buffer vanished");
            self.base = front_end;
            buffer::release(front);
            released += 1;
        }

        released
    }

    /// Drain all buffers out of the chain without returning them to the
    /// pool. The caller takes ownership; offsets advance as if released.
    pub fn take_bufs(&mut self) -> Vec<Buf> {
        let mut taken = Vec::with_capacity(self.bufs.len());

        while let Some(buf) = self.bufs.pop_front() {
            self.base += buf.len() as u64;
            taken.push(buf);
        }

        taken
    }

    /// The octet at an absolute offset, if retained.
    pub fn octet(&self, offset: u64) -> Option<u8> {
        let (index, intra) = self.locate(offset)?;
        Some(self.bufs[index].octets()[intra])
    }

    /// Longest contiguous slice starting at an absolute offset.
    pub fn chunk_at(&self, offset: u64) -> Option<&[u8]> {
        let (index, intra) = self.locate(offset)?;
        Some(&self.bufs[index].octets()[intra..])
    }

    /// Copy retained octets starting at `offset` into `dst`. Returns the
    /// number of octets copied, clamped to the retained range.
    pub fn read_at(&self, offset: u64, dst: &mut [u8]) -> usize {
        let mut copied = 0;

        while copied < dst.len() {
            match self.chunk_at(offset + copied as u64) {
                Some(chunk) => {
                    let count = chunk.len().min(dst.len() - copied);
                    dst[copied..copied + count].copy_from_slice(&chunk[..count]);
                    copied += count;
                }
                None => break,
            }
        }

        copied
    }

    /// Copy of the `len` octets starting at `offset`. Panics if the range is
    /// not fully retained.
    pub fn copy_range(&self, offset: u64, len: usize) -> Vec<u8> {
        let mut out = vec![0u8; len];
        let copied = self.read_at(offset, &mut out);

        if copied != len {
            panic!("Attempted to copy a range that is not retained");
        }

        out
    }

    #[inline]
    fn locate(&self, offset: u64) -> Option<(usize, usize)> {
        if offset < self.base || offset >= self.extent {
            return None;
        }

        let mut intra = (offset - self.base) as usize;

        for (index, buf) in self.bufs.iter().enumerate() {
            if intra < buf.len() {
                return Some((index, intra));
            }
            intra -= buf.len();
        }

        None
    }
}

impl Drop for Chain {
    fn drop(&mut self) {
        buffer::release_all(self.bufs.drain(..));
    }
}

/// A resumable read cursor over a chain. The cursor owns only the offset, so
/// it survives chain growth and prefix release; every read validates against
/// the chain it is handed.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct ChainCursor {
    offset: u64,
}

impl ChainCursor {
    #[inline]
    pub fn new_at(offset: u64) -> ChainCursor {
        ChainCursor { offset }
    }

    #[inline]
    pub fn offset(&self) -> u64 {
        self.offset
    }

    #[inline]
    pub fn remaining(&self, chain: &Chain) -> u64 {
        chain.extent().saturating_sub(self.offset)
    }

    #[inline]
    pub fn peek_u8(&self, chain: &Chain) -> Option<u8> {
        chain.octet(self.offset)
    }

    #[inline]
    pub fn read_u8(&mut self, chain: &Chain) -> Option<u8> {
        let octet = chain.octet(self.offset)?;
        self.offset += 1;
        Some(octet)
    }

    /// Read exactly `dst.len()` octets, advancing only on success.
    pub fn read_exact(&mut self, chain: &Chain, dst: &mut [u8]) -> bool {
        if self.remaining(chain) < dst.len() as u64 {
            return false;
        }

        let copied = chain.read_at(self.offset, dst);
        debug_assert_eq!(copied, dst.len());
        self.offset += dst.len() as u64;

        true
    }

    pub fn read_u16(&mut self, chain: &Chain) -> Option<u16> {
        let mut raw = [0u8; 2];
        match self.read_exact(chain, &mut raw) {
            true => Some(BigEndian::read_u16(&raw)),
            false => None,
        }
    }

    pub fn read_u32(&mut self, chain: &Chain) -> Option<u32> {
        let mut raw = [0u8; 4];
        match self.read_exact(chain, &mut raw) {
            true => Some(BigEndian::read_u32(&raw)),
            false => None,
        }
    }

    pub fn read_u64(&mut self, chain: &Chain) -> Option<u64> {
        let mut raw = [0u8; 8];
        match self.read_exact(chain, &mut raw) {
            true => Some(BigEndian::read_u64(&raw)),
            false => None,
        }
    }

    /// Advance the cursor `count` octets, only if all of them are present.
    pub fn skip(&mut self, chain: &Chain, count: u64) -> bool {
        if self.remaining(chain) < count {
            return false;
        }

        self.offset += count;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BUF_SIZE;

    fn filled_chain(len: usize) -> Chain {
        let mut chain = Chain::new();
        let data: Vec<u8> = (0..len).map(|item| item as u8).collect();
        chain.append(&data);
        chain
    }

    #[test]
    fn test_append_spans_buffers() {
        let chain = filled_chain(BUF_SIZE * 2 + 100);

        assert_eq!(chain.buf_count(), 3);
        assert_eq!(chain.len(), (BUF_SIZE * 2 + 100) as u64);
        assert_eq!(chain.base(), 0);
    }

    #[test]
    fn test_octet_across_boundary() {
        let chain = filled_chain(BUF_SIZE + 4);

        // Octets wrap modulo 256; check both sides of the buffer boundary.
        assert_eq!(chain.octet(BUF_SIZE as u64 - 1), Some(((BUF_SIZE - 1) % 256) as u8));
        assert_eq!(chain.octet(BUF_SIZE as u64), Some((BUF_SIZE % 256) as u8));
        assert_eq!(chain.octet(chain.extent()), None);
    }

    #[test]
    fn test_read_at_spans_boundary() {
        let chain = filled_chain(BUF_SIZE + 8);
        let mut dst = [0u8; 8];

        let copied = chain.read_at(BUF_SIZE as u64 - 4, &mut dst);

        assert_eq!(copied, 8);

        let expected: Vec<u8> = (BUF_SIZE - 4..BUF_SIZE + 4).map(|item| item as u8).collect();
        assert_eq!(&dst[..], &expected[..]);
    }

    #[test]
    fn test_release_to_keeps_offsets() {
        let mut chain = filled_chain(BUF_SIZE * 3);

        let released = chain.release_to(BUF_SIZE as u64 * 2);

        assert_eq!(released, 2);
        assert_eq!(chain.base(), BUF_SIZE as u64 * 2);
        assert_eq!(chain.buf_count(), 1);

        // Offsets below the base are gone, the rest still resolve.
        assert_eq!(chain.octet(0), None);
        assert_eq!(chain.octet(BUF_SIZE as u64 * 2), Some((BUF_SIZE * 2 % 256) as u8));
    }

    #[test]
    fn test_release_to_spares_partial_tail() {
        let mut chain = filled_chain(100);

        // The tail is partially filled and still receiving; it must be kept
        // even when the offset covers it.
        let released = chain.release_to(100);

        assert_eq!(released, 0);
        assert_eq!(chain.buf_count(), 1);
    }

    #[test]
    fn test_splice_moves_octets() {
        let mut head = filled_chain(10);
        let mut tail = Chain::new();
        tail.append(&[200, 201, 202]);

        head.splice(&mut tail);

        assert_eq!(tail.len(), 0);
        assert_eq!(head.len(), 13);
        assert_eq!(head.octet(10), Some(200));
    }

    #[test]
    fn test_cursor_sequential_reads() {
        let mut chain = Chain::new();
        chain.append(&[0x01, 0x02, 0x03, 0x04, 0x05]);

        let mut cursor = ChainCursor::new_at(0);

        assert_eq!(cursor.read_u8(&chain), Some(0x01));
        assert_eq!(cursor.read_u16(&chain), Some(0x0203));
        assert_eq!(cursor.remaining(&chain), 2);
        assert_eq!(cursor.read_u32(&chain), None);
        // Failed reads do not advance.
        assert_eq!(cursor.offset(), 3);
    }

    #[test]
    fn test_cursor_resumes_after_growth() {
        let mut chain = Chain::new();
        chain.append(&[0xAA]);

        let mut cursor = ChainCursor::new_at(0);

        assert_eq!(cursor.read_u8(&chain), Some(0xAA));
        assert_eq!(cursor.read_u8(&chain), None);

        chain.append(&[0xBB]);

        assert_eq!(cursor.read_u8(&chain), Some(0xBB));
    }

    #[test]
    fn test_single_octet_appends_parse_like_bulk() {
        let bulk = filled_chain(BUF_SIZE + 10);

        let mut trickle = Chain::new();
        for i in 0..BUF_SIZE + 10 {
            trickle.append(&[i as u8]);
        }

        let mut bulk_cursor = ChainCursor::new_at(0);
        let mut trickle_cursor = ChainCursor::new_at(0);

        loop {
            let a = bulk_cursor.read_u8(&bulk);
            let b = trickle_cursor.read_u8(&trickle);
            assert_eq!(a, b);
            if a.is_none() {
                break;
            }
        }
    }

    #[test]
    #[should_panic(expected = "Attempted to copy a range that is not retained")]
    fn test_copy_range_out_of_bounds_fails() {
        let chain = filled_chain(4);
        let _ = chain.copy_range(2, 4);
    }
}
