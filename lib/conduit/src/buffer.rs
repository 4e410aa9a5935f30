use ctor::ctor;
use lazy_static::lazy_static;
use std::cell::RefCell;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

/// Size of one pooled buffer. Message bodies, parse state and flow-control
/// watermarks all count in units of this size.
pub const BUF_SIZE: usize = 512;

/// Tuning knobs for the buffer pool. Applied once at startup, before worker
/// threads begin allocating.
#[derive(Debug, Copy, Clone)]
pub struct PoolTuning {
    /// Number of buffers moved between the local and global free lists in
    /// one rebalance.
    pub transfer_batch_size: usize,
    /// Per-thread free-list size that triggers a rebalance to the global
    /// list.
    pub local_free_list_max: usize,
    /// Size cap of the global free list; overflow is returned to the
    /// allocator.
    pub global_free_list_max: usize,
}

impl Default for PoolTuning {
    fn default() -> PoolTuning {
        PoolTuning {
            transfer_batch_size: 64,
            local_free_list_max: 128,
            global_free_list_max: 4096,
        }
    }
}

lazy_static! {
    static ref GLOBAL_FREE: Mutex<Vec<Buf>> = Mutex::new(Vec::new());
    static ref TUNING: Mutex<PoolTuning> = Mutex::new(PoolTuning::default());
}

static LIVE_BUFS: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    static LOCAL_FREE: RefCell<Vec<Buf>> = RefCell::new(Vec::new());
}

// The pool descriptor must exist before any user code allocates, and must
// not be torn down while worker threads still run.
#[ctor(unsafe)]
fn init_buffer_pool() {
    lazy_static::initialize(&GLOBAL_FREE);
    lazy_static::initialize(&TUNING);
}

/// Installs pool tuning. Call during single-threaded startup only.
pub fn tune_pool(tuning: PoolTuning) {
    *TUNING.lock().expect("Pool tuning lock poisoned") = tuning;
}

#[inline]
fn tuning() -> PoolTuning {
    *TUNING.lock().expect("Pool tuning lock poisoned")
}

/// A fixed size octet region with a fill cursor. Buffers live in at most one
/// chain at a time and return to the pool when the owning chain releases
/// them.
pub struct Buf {
    data: Box<[u8; BUF_SIZE]>,
    fill: usize,
}

impl Buf {
    #[inline]
    fn fresh() -> Buf {
        Buf {
            data: Box::new([0; BUF_SIZE]),
            fill: 0,
        }
    }

    /// Number of filled octets.
    #[inline]
    pub fn len(&self) -> usize {
        self.fill
    }

    /// Remaining writable capacity.
    #[inline]
    pub fn capacity(&self) -> usize {
        BUF_SIZE - self.fill
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.fill == BUF_SIZE
    }

    /// The filled octets.
    #[inline]
    pub fn octets(&self) -> &[u8] {
        &self.data[..self.fill]
    }

    /// Slice of the writable region.
    #[inline]
    pub fn write_slice(&mut self) -> &mut [u8] {
        &mut self.data[self.fill..]
    }

    /// Advance the fill cursor, as if a write has happened.
    #[inline]
    pub fn expand(&mut self, count: usize) {
        let new_fill = self.fill + count;

        if new_fill > BUF_SIZE {
            panic!("Attempted to expand beyond buffer size")
        }

        self.fill = new_fill;
    }

    /// Copy as much of `src` as fits, returning the number of octets taken.
    #[inline]
    pub fn put(&mut self, src: &[u8]) -> usize {
        let count = src.len().min(self.capacity());

        self.data[self.fill..self.fill + count].copy_from_slice(&src[..count]);
        self.fill += count;

        count
    }
}

/// Draw a buffer from the pool. Takes from the thread-local free list first,
/// refills it in one batch from the global list, and only then allocates.
/// Allocation failure aborts the process; the pool has no fallible path.
pub fn alloc() -> Buf {
    LOCAL_FREE.with(|local| {
        let mut local = local.borrow_mut();

        if local.is_empty() {
            let batch = tuning().transfer_batch_size;
            let mut global = GLOBAL_FREE.lock().expect("Buffer pool lock poisoned");
            let take = batch.min(global.len());
            let drained = global.len() - take;
            local.extend(global.drain(drained..));
        }

        match local.pop() {
            Some(mut buf) => {
                buf.fill = 0;
                buf
            }
            None => {
                LIVE_BUFS.fetch_add(1, Ordering::Relaxed);
                Buf::fresh()
            }
        }
    })
}

/// Return a buffer to the pool. May be called from any thread; local
/// overflow is rebalanced to the global list in batches, and global overflow
/// is handed back to the allocator.
pub fn release(buf: Buf) {
    LOCAL_FREE.with(|local| {
        let mut local = local.borrow_mut();
        local.push(buf);

        let tuning = tuning();

        if local.len() > tuning.local_free_list_max {
            let keep = local.len() - tuning.transfer_batch_size.min(local.len());
            let mut global = GLOBAL_FREE.lock().expect("Buffer pool lock poisoned");

            for buf in local.drain(keep..) {
                if global.len() < tuning.global_free_list_max {
                    global.push(buf);
                } else {
                    LIVE_BUFS.fetch_sub(1, Ordering::Relaxed);
                    drop(buf);
                }
            }
        }
    })
}

/// Return a whole list of buffers to the pool.
#[inline]
pub fn release_all<I: IntoIterator<Item = Buf>>(bufs: I) {
    for buf in bufs {
        release(buf);
    }
}

/// Pre-warm the calling thread's free list.
pub fn prewarm(count: usize) {
    LOCAL_FREE.with(|local| {
        let mut local = local.borrow_mut();

        while local.len() < count {
            LIVE_BUFS.fetch_add(1, Ordering::Relaxed);
            local.push(Buf::fresh());
        }
    })
}

/// Buffers currently alive (filled or pooled). Management reporting only.
#[inline]
pub fn live_count() -> usize {
    LIVE_BUFS.load(Ordering::Relaxed)
}
