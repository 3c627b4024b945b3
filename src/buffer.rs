//! Process-wide pool of page-aligned segment buffers.
//!
//! Every active segment stages its frames in one `MAX_FILE_SIZE` buffer
//! rented from this pool; recovery rents one per segment it reads. Buffers
//! go back to the free list when the renter drops them, so a segment's
//! memory is released exactly once, at the end of its close path.

use std::alloc::{alloc_zeroed, dealloc, handle_alloc_error, Layout};
use std::ptr::{self, NonNull};
use std::sync::{Mutex, OnceLock};

use crate::error::{Error, Result};
use crate::frame::MAX_FILE_SIZE;

const BUFFER_ALIGN: usize = 4096;
/// Free buffers kept for reuse; anything beyond this is returned to the
/// allocator.
const POOL_KEEP: usize = 8;

struct RawBuffer(NonNull<u8>);

// The pointer is an exclusive handle to a heap allocation.
unsafe impl Send for RawBuffer {}

fn buffer_layout() -> Layout {
    Layout::from_size_align(MAX_FILE_SIZE, BUFFER_ALIGN).expect("segment buffer layout")
}

pub(crate) struct Pool {
    free: Mutex<Vec<RawBuffer>>,
}

impl Pool {
    fn new() -> Self {
        Pool {
            free: Mutex::new(Vec::new()),
        }
    }

    fn global() -> &'static Pool {
        static POOL: OnceLock<Pool> = OnceLock::new();
        POOL.get_or_init(Pool::new)
    }

    fn acquire(&'static self) -> Result<PooledBuffer> {
        let pooled = self
            .free
            .lock()
            .map_err(|_| Error::Corrupt("buffer pool lock poisoned"))?
            .pop();
        let raw = pooled.unwrap_or_else(|| {
            let ptr = unsafe { alloc_zeroed(buffer_layout()) };
            match NonNull::new(ptr) {
                Some(ptr) => RawBuffer(ptr),
                None => handle_alloc_error(buffer_layout()),
            }
        });
        Ok(PooledBuffer { raw, pool: self })
    }
}

/// Rents a `MAX_FILE_SIZE` buffer, reusing a pooled one when available.
pub(crate) fn acquire() -> Result<PooledBuffer> {
    Pool::global().acquire()
}

/// A rented segment buffer. Concurrent producers write disjoint reserved
/// windows through [`PooledBuffer::write`] while the batch writer reads the
/// committed prefix, so shared access goes through raw pointers; exclusive
/// owners (recovery) get ordinary slices.
pub(crate) struct PooledBuffer {
    raw: RawBuffer,
    pool: &'static Pool,
}

// All shared mutation goes through `write`, whose contract keeps the
// accessed windows disjoint.
unsafe impl Send for PooledBuffer {}
unsafe impl Sync for PooledBuffer {}

impl PooledBuffer {
    pub(crate) fn len(&self) -> usize {
        MAX_FILE_SIZE
    }

    /// Copies `src` into the buffer at `offset`.
    ///
    /// # Safety
    ///
    /// The window `[offset, offset + src.len())` must lie inside the buffer
    /// and be reserved exclusively by the caller: no other writer may touch
    /// it and no reader may observe it until the copy is published.
    pub(crate) unsafe fn write(&self, offset: usize, src: &[u8]) {
        debug_assert!(offset + src.len() <= MAX_FILE_SIZE);
        ptr::copy_nonoverlapping(src.as_ptr(), self.raw.0.as_ptr().add(offset), src.len());
    }

    /// Borrows `[offset, offset + len)` of the buffer.
    ///
    /// # Safety
    ///
    /// The window must be fully written and quiescent: committed frame
    /// bytes are never mutated again, which is what makes the batch
    /// writer's read sound.
    pub(crate) unsafe fn slice(&self, offset: usize, len: usize) -> &[u8] {
        debug_assert!(offset + len <= MAX_FILE_SIZE);
        std::slice::from_raw_parts(self.raw.0.as_ptr().add(offset), len)
    }

    /// Whole-buffer access for exclusive owners.
    pub(crate) fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.raw.0.as_ptr(), MAX_FILE_SIZE) }
    }
}

impl std::fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledBuffer").finish_non_exhaustive()
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        let raw = RawBuffer(self.raw.0);
        // A poisoned free list only costs reuse; the buffer is freed
        // directly instead.
        if let Ok(mut free) = self.pool.free.lock() {
            if free.len() < POOL_KEEP {
                free.push(raw);
                return;
            }
        }
        unsafe { dealloc(raw.0.as_ptr(), buffer_layout()) };
    }
}
