// Chunked node pool carved out of a flat memory region.
//
// Stands in for a pmem allocator: typed node slots live in fixed-size
// chunks, each thread owns a contiguous chunk range with a bump cursor
// and an intrusive free list, and recovery can enumerate every chunk to
// scan node memory. The region is required to be zeroed when handed in,
// so never-used slots read as all-zero nodes.

use std::marker::PhantomData;
use std::mem;
use std::ptr;

use crossbeam_utils::CachePadded;

use crate::pmem::{align_up, CACHE_LINE_SIZE};

/// Bytes per chunk, shared by every pool instance.
pub const CHUNK_SIZE: usize = 16 * 1024;

#[repr(C)]
struct ThreadCursor {
    // Intrusive free list; the link is written over the first word of a
    // freed slot. Only the owning thread pushes or pops.
    free_head: *mut u8,
    next_chunk: usize,
    next_slot: usize,
    chunk_lo: usize,
    chunk_hi: usize,
}

#[repr(C)]
pub struct NodePool<N> {
    chunk_base: *mut u8,
    num_chunks: usize,
    chunks_per_thread: usize,
    nodes_per_chunk: usize,
    cursors: *mut CachePadded<ThreadCursor>,
    num_threads: usize,
    _marker: PhantomData<N>,
}

impl<N> NodePool<N> {
    pub fn nodes_per_chunk() -> usize {
        CHUNK_SIZE / mem::size_of::<N>()
    }

    fn chunks_per_thread(num_threads: usize, capacity: usize) -> usize {
        let per_thread = capacity.div_ceil(num_threads);
        per_thread.div_ceil(Self::nodes_per_chunk()).max(1)
    }

    /// Bytes of region needed for `num_threads` cursors plus enough
    /// chunks to hold at least `capacity` nodes.
    pub fn region_size(num_threads: usize, capacity: usize) -> usize {
        let cursors = align_up(
            num_threads * mem::size_of::<CachePadded<ThreadCursor>>(),
            CACHE_LINE_SIZE,
        );
        let chunks = Self::chunks_per_thread(num_threads, capacity) * num_threads * CHUNK_SIZE;
        cursors + chunks
    }

    /// Format `region` (zeroed, cache-line aligned, at least
    /// `region_size` bytes) into a pool.
    ///
    /// # Safety
    ///
    /// The caller owns `region` for the lifetime of the pool and must
    /// pass the same `num_threads`/`capacity` used for `region_size`.
    pub unsafe fn init(region: *mut u8, num_threads: usize, capacity: usize) -> Self {
        let chunks_per_thread = Self::chunks_per_thread(num_threads, capacity);
        let cursors = region as *mut CachePadded<ThreadCursor>;
        let chunk_base = region.add(align_up(
            num_threads * mem::size_of::<CachePadded<ThreadCursor>>(),
            CACHE_LINE_SIZE,
        ));
        for t in 0..num_threads {
            ptr::write(
                cursors.add(t),
                CachePadded::new(ThreadCursor {
                    free_head: ptr::null_mut(),
                    next_chunk: t * chunks_per_thread,
                    next_slot: 0,
                    chunk_lo: t * chunks_per_thread,
                    chunk_hi: (t + 1) * chunks_per_thread,
                }),
            );
        }
        Self {
            chunk_base,
            num_chunks: chunks_per_thread * num_threads,
            chunks_per_thread,
            nodes_per_chunk: Self::nodes_per_chunk(),
            cursors,
            num_threads,
            _marker: PhantomData,
        }
    }

    /// # Safety
    ///
    /// Must only be called by the thread that owns `tid`.
    pub unsafe fn alloc(&self, tid: usize) -> *mut N {
        let cur: &mut ThreadCursor = &mut *self.cursors.add(tid);
        if !cur.free_head.is_null() {
            let node = cur.free_head;
            cur.free_head = *(node as *mut *mut u8);
            return node as *mut N;
        }
        if cur.next_chunk < cur.chunk_hi {
            let node = self
                .chunk_base
                .add(cur.next_chunk * CHUNK_SIZE + cur.next_slot * mem::size_of::<N>());
            cur.next_slot += 1;
            if cur.next_slot == self.nodes_per_chunk {
                cur.next_chunk += 1;
                cur.next_slot = 0;
            }
            return node as *mut N;
        }
        panic!("node pool exhausted (thread {})", tid);
    }

    /// # Safety
    ///
    /// `node` must come from this pool and no longer be reachable; must
    /// only be called by the thread that owns `tid`.
    pub unsafe fn free(&self, tid: usize, node: *mut N) {
        let cur: &mut ThreadCursor = &mut *self.cursors.add(tid);
        *(node as *mut *mut u8) = cur.free_head;
        cur.free_head = node as *mut u8;
    }

    pub fn num_chunks(&self) -> usize {
        self.num_chunks
    }

    pub fn slots_per_chunk(&self) -> usize {
        self.nodes_per_chunk
    }

    pub fn chunk(&self, i: usize) -> *mut N {
        debug_assert!(i < self.num_chunks);
        unsafe { self.chunk_base.add(i * CHUNK_SIZE) as *mut N }
    }

    /// Thread whose chunk range contains `node`.
    pub fn owner_of(&self, node: *mut N) -> usize {
        let off = node as usize - self.chunk_base as usize;
        (off / CHUNK_SIZE) / self.chunks_per_thread
    }

    /// Drop all volatile bookkeeping and mark every slot as consumed.
    /// Recovery then repopulates the free lists slot by slot.
    ///
    /// # Safety
    ///
    /// No concurrent access; the cursors are rewritten in place.
    pub unsafe fn reset_for_recovery(&self) {
        for t in 0..self.num_threads {
            let cur: &mut ThreadCursor = &mut *self.cursors.add(t);
            cur.free_head = ptr::null_mut();
            cur.next_chunk = cur.chunk_hi;
            cur.next_slot = 0;
        }
    }

    /// Restore the pristine post-init state. Used for the volatile pool,
    /// whose region is assumed reset after a crash.
    ///
    /// # Safety
    ///
    /// No concurrent access, and every previously handed-out node must
    /// be considered dead.
    pub unsafe fn reset(&self) {
        for t in 0..self.num_threads {
            let cur: &mut ThreadCursor = &mut *self.cursors.add(t);
            cur.free_head = ptr::null_mut();
            cur.next_chunk = cur.chunk_lo;
            cur.next_slot = 0;
        }
    }
}
