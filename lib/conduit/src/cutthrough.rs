use crate::buffer::{self, Buf};
use crate::connection::Connection;
use crate::delivery::Delivery;
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Weak;
use weft::pool::SafeRef;

/// Number of buffer-list slots in the ring.
pub const SLOT_COUNT: usize = 8;

/// A stalled stream resumes once the ring drains to this many filled slots.
pub const RESUME_THRESHOLD: usize = 4;

/// Fixed-slot single-producer/single-consumer ring of buffer lists. One
/// side appends whole lists of buffers, the other drains them, without
/// touching the content lock.
///
/// The produce slot is written only by the producer and the consume slot
/// only by the consumer; each slot's buffer list is accessed exclusively by
/// the side the counters assign it to, so the lists need no lock of their
/// own.
pub struct CutThroughRing {
    slots: [UnsafeCell<Vec<Buf>>; SLOT_COUNT],
    produce_slot: AtomicU32,
    consume_slot: AtomicU32,
    stalled: AtomicBool,
}

unsafe impl Send for CutThroughRing {}
unsafe impl Sync for CutThroughRing {}

impl CutThroughRing {
    pub fn new() -> CutThroughRing {
        CutThroughRing {
            slots: Default::default(),
            produce_slot: AtomicU32::new(0),
            consume_slot: AtomicU32::new(0),
            stalled: AtomicBool::new(false),
        }
    }

    /// True when the ring has room for another buffer list. Producer side
    /// only.
    #[inline]
    pub fn can_produce_buffers(&self) -> bool {
        self.full_slot_count() < SLOT_COUNT
    }

    /// True when the ring holds at least one filled slot. Consumer side
    /// only.
    #[inline]
    pub fn can_consume_buffers(&self) -> bool {
        self.produce_slot.load(Ordering::Acquire) != self.consume_slot.load(Ordering::Acquire)
    }

    /// Count of filled slots.
    #[inline]
    pub fn full_slot_count(&self) -> usize {
        self.produce_slot
            .load(Ordering::Acquire)
            .wrapping_sub(self.consume_slot.load(Ordering::Acquire)) as usize
    }

    /// Move a buffer list into the ring. The call must have been preceded
    /// by a true `can_produce_buffers` on the same (single) producer.
    pub fn produce_buffers(&self, list: Vec<Buf>) {
        if !self.can_produce_buffers() {
            panic!("Attempted to produce into a full cut-through ring");
        }

        let produce = self.produce_slot.load(Ordering::Relaxed);
        let index = produce as usize % SLOT_COUNT;

        // The slot is empty and invisible to the consumer until the counter
        // below is published.
        unsafe {
            *self.slots[index].get() = list;
        }

        self.produce_slot.store(produce.wrapping_add(1), Ordering::Release);
    }

    /// Drain up to `limit` buffer lists out of the ring.
    pub fn consume_buffers(&self, out: &mut Vec<Vec<Buf>>, limit: usize) -> usize {
        let mut consumed = 0;

        while consumed < limit {
            let consume = self.consume_slot.load(Ordering::Relaxed);

            if self.produce_slot.load(Ordering::Acquire) == consume {
                break;
            }

            let index = consume as usize % SLOT_COUNT;

            let list = unsafe { std::mem::replace(&mut *self.slots[index].get(), Vec::new()) };
            out.push(list);

            self.consume_slot.store(consume.wrapping_add(1), Ordering::Release);
            consumed += 1;
        }

        consumed
    }

    /// Mark the stream stalled. Called by the producer when the ring is
    /// full.
    #[inline]
    pub fn mark_stalled(&self) {
        self.stalled.store(true, Ordering::Release);
    }

    #[inline]
    pub fn is_stalled(&self) -> bool {
        self.stalled.load(Ordering::Acquire)
    }

    /// Returns true exactly once per stall, when the stream had been marked
    /// stalled and the ring has drained to the resume threshold. Clears the
    /// stalled bit as a side effect.
    pub fn resume_from_stalled(&self) -> bool {
        if self.full_slot_count() > RESUME_THRESHOLD {
            return false;
        }

        self.stalled.swap(false, Ordering::AcqRel)
    }
}

impl Drop for CutThroughRing {
    fn drop(&mut self) {
        // Unsent slots go back to the pool with the content.
        for slot in &self.slots {
            let list = std::mem::replace(unsafe { &mut *slot.get() }, Vec::new());
            buffer::release_all(list);
        }
    }
}

/// Who to run when the counterpart side of a cut-through stream makes
/// progress.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ActivationType {
    None,
    Amqp,
    Tcp,
}

/// Activation record for one side of a cut-through stream. The connection
/// reference is weak (generation checked): waking goes through the server's
/// activation lock, where a freed connection is observed as gone instead of
/// dangling.
pub struct Activation {
    pub kind: ActivationType,
    pub connection: Option<SafeRef<Connection>>,
    pub delivery: Option<Weak<Delivery>>,
}

impl Activation {
    pub fn none() -> Activation {
        Activation {
            kind: ActivationType::None,
            connection: None,
            delivery: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list_of(len: usize) -> Vec<Buf> {
        (0..len)
            .map(|fill| {
                let mut buf = buffer::alloc();
                buf.put(&vec![0xAB; fill + 1]);
                buf
            })
            .collect()
    }

    #[test]
    fn test_produce_consume_order() {
        let ring = CutThroughRing::new();

        ring.produce_buffers(list_of(1));
        ring.produce_buffers(list_of(2));

        assert_eq!(ring.full_slot_count(), 2);

        let mut out = Vec::new();
        let consumed = ring.consume_buffers(&mut out, 8);

        assert_eq!(consumed, 2);
        assert_eq!(out[0].len(), 1);
        assert_eq!(out[1].len(), 2);
        assert!(!ring.can_consume_buffers());

        for list in out {
            buffer::release_all(list);
        }
    }

    #[test]
    fn test_consume_respects_limit() {
        let ring = CutThroughRing::new();

        for _ in 0..4 {
            ring.produce_buffers(list_of(1));
        }

        let mut out = Vec::new();

        assert_eq!(ring.consume_buffers(&mut out, 3), 3);
        assert_eq!(ring.full_slot_count(), 1);

        for list in out {
            buffer::release_all(list);
        }
    }

    #[test]
    fn test_full_ring_stall_resume_cycle() {
        let ring = CutThroughRing::new();

        // Fill all eight slots.
        for _ in 0..SLOT_COUNT {
            assert!(ring.can_produce_buffers());
            ring.produce_buffers(list_of(1));
        }

        // The ninth production attempt is rejected.
        assert!(!ring.can_produce_buffers());
        ring.mark_stalled();

        // Draining one slot is not enough to resume.
        let mut out = Vec::new();
        ring.consume_buffers(&mut out, 1);
        assert!(!ring.resume_from_stalled());

        // Draining to the threshold resumes exactly once.
        ring.consume_buffers(&mut out, 4);
        assert_eq!(ring.full_slot_count(), 3);
        assert!(ring.resume_from_stalled());
        assert!(!ring.resume_from_stalled());

        // Production is allowed again.
        assert!(ring.can_produce_buffers());
        ring.produce_buffers(list_of(1));

        for list in out {
            buffer::release_all(list);
        }
    }

    #[test]
    #[should_panic(expected = "Attempted to produce into a full cut-through ring")]
    fn test_produce_into_full_ring_fails() {
        let ring = CutThroughRing::new();

        for _ in 0..=SLOT_COUNT {
            ring.produce_buffers(Vec::new());
        }
    }

    #[test]
    fn test_slot_counter_wraparound() {
        let ring = CutThroughRing::new();
        let mut out = Vec::new();

        // Cycle the ring far past one lap of the slot array.
        for _ in 0..SLOT_COUNT * 5 {
            ring.produce_buffers(list_of(1));
            assert_eq!(ring.consume_buffers(&mut out, 1), 1);
        }

        assert_eq!(ring.full_slot_count(), 0);

        for list in out {
            buffer::release_all(list);
        }
    }

    #[test]
    fn test_spsc_across_threads() {
        use std::sync::Arc;

        let ring = Arc::new(CutThroughRing::new());
        let producer_ring = ring.clone();

        let producer = std::thread::spawn(move || {
            let mut produced = 0;

            while produced < 100 {
                if producer_ring.can_produce_buffers() {
                    producer_ring.produce_buffers(list_of(1));
                    produced += 1;
                } else {
                    std::thread::yield_now();
                }
            }
        });

        let mut drained = 0;
        let mut out = Vec::new();

        while drained < 100 {
            drained += ring.consume_buffers(&mut out, 4);

            for list in out.drain(..) {
                buffer::release_all(list);
            }
        }

        producer.join().expect("Producer thread paniced");
        assert_eq!(ring.full_slot_count(), 0);
    }
}
