//! Chunked bump allocator for per-document bytes
//!
//! All document data (embedding, id, text, metadata JSON) lives in large
//! pre-allocated chunks handed out slice by slice. This keeps related bytes
//! adjacent in memory and reduces one slab per document to a single CAS on
//! the uncontended path.
//!
//! # Concurrency
//!
//! Allocation within a chunk is lock-free: threads race on a
//! `compare_exchange_weak` loop over the chunk's offset counter. Appending a
//! new chunk is serialized by a mutex with a double-check, and the new chunk
//! pointer is published with release ordering so racing allocators observe a
//! fully constructed chunk.
//!
//! Regions are never freed individually; the whole arena is released at drop.
//! If the host allocator cannot supply a new chunk the process aborts via
//! [`std::alloc::handle_alloc_error`] — there is no recovery contract at this
//! level.

use std::alloc::{alloc, dealloc, Layout};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use parking_lot::Mutex;

/// Chunk payload size: 64 MiB
const CHUNK_SIZE: usize = 1 << 26;

/// Largest supported alignment for a single allocation
const MAX_ALIGN: usize = 4096;

/// One chunk of arena memory.
///
/// The payload is allocated separately from the header so it can carry
/// `MAX_ALIGN` alignment: a fresh chunk then satisfies any valid request
/// without padding, which guarantees the allocation retry loop terminates.
struct Chunk {
    /// Start of the `CHUNK_SIZE`-byte payload, aligned to `MAX_ALIGN`
    data: NonNull<u8>,
    /// Next free byte in this chunk
    offset: AtomicUsize,
    /// Link to the next chunk, null until the chunk overflows
    next: AtomicPtr<Chunk>,
}

impl Chunk {
    fn payload_layout() -> Layout {
        // CHUNK_SIZE and MAX_ALIGN are powers of two, so this cannot fail.
        Layout::from_size_align(CHUNK_SIZE, MAX_ALIGN).unwrap()
    }

    fn new() -> Box<Chunk> {
        let layout = Self::payload_layout();
        // SAFETY: layout has non-zero size.
        let raw = unsafe { alloc(layout) };
        let data = match NonNull::new(raw) {
            Some(p) => p,
            None => std::alloc::handle_alloc_error(layout),
        };
        Box::new(Chunk {
            data,
            offset: AtomicUsize::new(0),
            next: AtomicPtr::new(std::ptr::null_mut()),
        })
    }
}

/// Bump allocator over a linked list of 64 MiB chunks.
///
/// Thread-safe: many threads may allocate concurrently. Returned regions
/// stay valid and immutable (from the arena's point of view) until the
/// arena is dropped.
pub(crate) struct ArenaAllocator {
    /// First chunk; owns the whole list via `next` links
    head: NonNull<Chunk>,
    /// Chunk used for new allocations
    current: AtomicPtr<Chunk>,
    /// Serializes appending a chunk to the list
    grow_lock: Mutex<()>,
}

// SAFETY: all shared state is atomics or the mutex; chunk payloads are only
// handed out in non-overlapping regions, and the chunk list is append-only
// until drop takes exclusive ownership.
unsafe impl Send for ArenaAllocator {}
unsafe impl Sync for ArenaAllocator {}

impl ArenaAllocator {
    pub(crate) fn new() -> Self {
        let head = NonNull::from(Box::leak(Chunk::new()));
        Self {
            head,
            current: AtomicPtr::new(head.as_ptr()),
            grow_lock: Mutex::new(()),
        }
    }

    /// Largest single allocation the arena can satisfy (one chunk).
    pub(crate) fn chunk_size(&self) -> usize {
        CHUNK_SIZE
    }

    /// Reserve `size` bytes with the given alignment.
    ///
    /// Returns `None` when `align` is not a power of two, `align` exceeds
    /// 4096, or `size` exceeds the 64 MiB chunk size. Failed requests have
    /// no side effects.
    pub(crate) fn allocate(&self, size: usize, align: usize) -> Option<NonNull<u8>> {
        if !align.is_power_of_two() || align > MAX_ALIGN {
            return None;
        }
        if size > CHUNK_SIZE {
            return None;
        }

        // SAFETY: chunk pointers loaded from `current` are valid for the
        // arena's lifetime; they are only freed in `drop`.
        let mut chunk = unsafe { &*self.current.load(Ordering::Acquire) };

        loop {
            let old_offset = chunk.offset.load(Ordering::Relaxed);

            let addr = chunk.data.as_ptr() as usize + old_offset;
            let padding = addr.wrapping_neg() & (align - 1);
            let aligned_offset = old_offset + padding;
            let new_offset = aligned_offset + size;

            if new_offset > CHUNK_SIZE {
                chunk = self.grow(chunk);
                continue;
            }

            if chunk
                .offset
                .compare_exchange_weak(
                    old_offset,
                    new_offset,
                    Ordering::Release,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                // SAFETY: aligned_offset + size <= CHUNK_SIZE, and the CAS
                // made [aligned_offset, new_offset) ours exclusively.
                let ptr = unsafe { chunk.data.as_ptr().add(aligned_offset) };
                return NonNull::new(ptr);
            }
            // CAS lost to another allocator: retry on the same chunk.
        }
    }

    /// Install (or reuse) the next chunk after `chunk` and return it.
    fn grow<'a>(&'a self, chunk: &'a Chunk) -> &'a Chunk {
        let mut next = chunk.next.load(Ordering::Acquire);
        if next.is_null() {
            let _guard = self.grow_lock.lock();
            // Double-check: another thread may have installed it while we
            // waited on the lock.
            next = chunk.next.load(Ordering::Acquire);
            if next.is_null() {
                next = Box::into_raw(Chunk::new());
                chunk.next.store(next, Ordering::Release);
            }
        }
        self.current.store(next, Ordering::Release);
        // SAFETY: `next` was just created or read from an append-only list
        // whose nodes live until drop.
        unsafe { &*next }
    }

    /// Number of chunks currently in the list.
    #[cfg(test)]
    fn chunk_count(&self) -> usize {
        let mut count = 0;
        let mut cursor = self.head.as_ptr();
        while !cursor.is_null() {
            count += 1;
            cursor = unsafe { &*cursor }.next.load(Ordering::Acquire);
        }
        count
    }
}

impl Drop for ArenaAllocator {
    fn drop(&mut self) {
        let layout = Chunk::payload_layout();
        let mut cursor = self.head.as_ptr();
        while !cursor.is_null() {
            // SAFETY: &mut self gives exclusive access; every node in the
            // list was created by Chunk::new and is freed exactly once.
            unsafe {
                let chunk = Box::from_raw(cursor);
                cursor = chunk.next.load(Ordering::Acquire);
                dealloc(chunk.data.as_ptr(), layout);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_allocation() {
        let arena = ArenaAllocator::new();
        let a = arena.allocate(16, 4).unwrap();
        let b = arena.allocate(16, 4).unwrap();
        assert_ne!(a.as_ptr(), b.as_ptr());

        // Regions must not overlap.
        let (a, b) = (a.as_ptr() as usize, b.as_ptr() as usize);
        assert!(a + 16 <= b || b + 16 <= a);
    }

    #[test]
    fn test_alignment_honored() {
        let arena = ArenaAllocator::new();
        for align in [1usize, 2, 4, 8, 64, 512, 4096] {
            // Offset the bump pointer so alignment actually has work to do.
            arena.allocate(3, 1).unwrap();
            let ptr = arena.allocate(10, align).unwrap();
            assert_eq!(ptr.as_ptr() as usize % align, 0, "align {}", align);
        }
    }

    #[test]
    fn test_zero_size_allocation() {
        let arena = ArenaAllocator::new();
        assert!(arena.allocate(0, 8).is_some());
    }

    #[test]
    fn test_rejects_bad_requests() {
        let arena = ArenaAllocator::new();
        assert!(arena.allocate(8, 3).is_none(), "non-power-of-two align");
        assert!(arena.allocate(8, 0).is_none(), "zero align");
        assert!(arena.allocate(8, 8192).is_none(), "align above max");
        assert!(arena.allocate(CHUNK_SIZE + 1, 64).is_none(), "oversize");

        // Rejections leave the bump pointer untouched.
        let first = arena.allocate(1, 1).unwrap();
        assert_eq!(
            first.as_ptr() as usize % MAX_ALIGN,
            0,
            "rejected requests must not consume arena space"
        );
    }

    #[test]
    fn test_chunk_size_allocation_fits() {
        let arena = ArenaAllocator::new();
        assert!(arena.allocate(CHUNK_SIZE, 4096).is_some());
    }

    #[test]
    fn test_overflow_appends_chunk() {
        let arena = ArenaAllocator::new();
        assert_eq!(arena.chunk_count(), 1);

        // Three 24 MiB regions cannot share one 64 MiB chunk.
        for _ in 0..3 {
            arena.allocate(24 << 20, 64).unwrap();
        }
        assert_eq!(arena.chunk_count(), 2);
    }

    #[test]
    fn test_concurrent_allocations_do_not_overlap() {
        let arena = ArenaAllocator::new();
        let per_thread = 2_000usize;
        let threads = 8usize;

        let mut regions: Vec<(usize, usize)> = Vec::with_capacity(per_thread * threads);
        std::thread::scope(|scope| {
            let handles: Vec<_> = (0..threads)
                .map(|t| {
                    let arena = &arena;
                    scope.spawn(move || {
                        let mut local = Vec::with_capacity(per_thread);
                        for i in 0..per_thread {
                            let size = 1 + (t * 31 + i * 7) % 200;
                            let ptr = arena.allocate(size, 8).unwrap();
                            local.push((ptr.as_ptr() as usize, size));
                        }
                        local
                    })
                })
                .collect();
            for handle in handles {
                regions.extend(handle.join().unwrap());
            }
        });

        regions.sort_unstable();
        for pair in regions.windows(2) {
            let (start_a, len_a) = pair[0];
            let (start_b, _) = pair[1];
            assert!(start_a + len_a <= start_b, "overlapping regions");
        }
    }
}
