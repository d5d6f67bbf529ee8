// Split-representation variant of the unlinked scheme: volatile nodes
// carry the list, persistent records carry only {item, index, linked}.
// An enqueue durably marks its record `linked` after splicing the
// volatile node; recovery scans node memory for marked records above
// the merged per-thread dequeue watermark and rebuilds the list in
// index order.

use std::collections::BTreeMap;
use std::mem::MaybeUninit;
use std::ptr;
use std::sync::atomic::{fence, AtomicBool, AtomicPtr, Ordering};

use crossbeam_utils::CachePadded;

use crate::pmem::{self, align_up, CACHE_LINE_SIZE};
use crate::pool::NodePool;
use crate::{DurableMpmcQueue, MAX_THREADS};

#[repr(C, align(32))]
struct PersistentNode<T> {
    item: MaybeUninit<T>,
    index: u64,
    linked: AtomicBool,
}

#[repr(C, align(32))]
struct VolatileNode<T> {
    item: MaybeUninit<T>,
    index: u64,
    next: AtomicPtr<VolatileNode<T>>,
    persistent: *mut PersistentNode<T>,
}

#[repr(C)]
struct LocalData<T> {
    node_to_retire: *mut VolatileNode<T>,
    head_index: u64,
}

#[repr(C)]
pub struct OptUnlinkedQueue<T: Send + 'static> {
    head: CachePadded<AtomicPtr<VolatileNode<T>>>,
    tail: CachePadded<AtomicPtr<VolatileNode<T>>>,
    local: *mut CachePadded<LocalData<T>>,
    num_threads: usize,
    pool: NodePool<PersistentNode<T>>,
    volatile_pool: NodePool<VolatileNode<T>>,
}

unsafe impl<T: Send + 'static> Send for OptUnlinkedQueue<T> {}
unsafe impl<T: Send + 'static> Sync for OptUnlinkedQueue<T> {}

impl<T: Copy + Send + 'static> OptUnlinkedQueue<T> {
    fn local_offset() -> usize {
        align_up(std::mem::size_of::<Self>(), CACHE_LINE_SIZE)
    }

    fn pool_offset(num_threads: usize) -> usize {
        align_up(
            Self::local_offset() + num_threads * std::mem::size_of::<CachePadded<LocalData<T>>>(),
            CACHE_LINE_SIZE,
        )
    }

    pub fn shared_size(num_threads: usize, capacity: usize) -> usize {
        let total = Self::pool_offset(num_threads)
            + NodePool::<PersistentNode<T>>::region_size(num_threads, capacity);
        (total + 4095) & !4095
    }

    pub fn volatile_size(num_threads: usize, capacity: usize) -> usize {
        let total = NodePool::<VolatileNode<T>>::region_size(num_threads, capacity);
        (total + 4095) & !4095
    }

    /// # Safety
    ///
    /// `mem`/`vmem` must be valid for `shared_size`/`volatile_size`
    /// bytes respectively, zeroed, and not accessed through any other
    /// path.
    pub unsafe fn init_in_shared(
        mem: *mut u8,
        vmem: *mut u8,
        num_threads: usize,
        capacity: usize,
    ) -> &'static mut Self {
        assert!(num_threads > 0 && num_threads <= MAX_THREADS);
        let queue_ptr = mem as *mut Self;
        let local = mem.add(Self::local_offset()) as *mut CachePadded<LocalData<T>>;
        let pool = NodePool::init(mem.add(Self::pool_offset(num_threads)), num_threads, capacity);
        let volatile_pool = NodePool::init(vmem, num_threads, capacity);

        let dummy: *mut VolatileNode<T> = volatile_pool.alloc(0);
        let dummy_record: *mut PersistentNode<T> = pool.alloc(0);
        ptr::addr_of_mut!((*dummy_record).index).write(0);
        (*dummy_record).linked.store(false, Ordering::Relaxed);
        ptr::addr_of_mut!((*dummy).item).write(MaybeUninit::uninit());
        ptr::addr_of_mut!((*dummy).index).write(0);
        (*dummy).next.store(ptr::null_mut(), Ordering::Relaxed);
        ptr::addr_of_mut!((*dummy).persistent).write(dummy_record);

        ptr::write(
            queue_ptr,
            Self {
                head: CachePadded::new(AtomicPtr::new(dummy)),
                tail: CachePadded::new(AtomicPtr::new(dummy)),
                local,
                num_threads,
                pool,
                volatile_pool,
            },
        );
        let queue = &mut *queue_ptr;

        for t in 0..num_threads {
            let ld = queue.local(t);
            ptr::addr_of_mut!((*ld).node_to_retire).write(ptr::null_mut());
            pmem::nt_store_u64(ptr::addr_of_mut!((*ld).head_index), 0);
        }
        pmem::flush_sized(mem, std::mem::size_of::<Self>());
        pmem::sfence();

        queue
    }

    unsafe fn local(&self, tid: usize) -> *mut LocalData<T> {
        let padded: &mut CachePadded<LocalData<T>> = &mut *self.local.add(tid);
        &mut **padded
    }

    pub fn enqueue(&self, item: T, thread_id: usize) {
        unsafe {
            let node = self.volatile_pool.alloc(thread_id);
            let record: *mut PersistentNode<T> = self.pool.alloc(thread_id);
            ptr::addr_of_mut!((*record).item).write(MaybeUninit::new(item));
            (*record).linked.store(false, Ordering::Relaxed);
            // `linked` must be false before `index` is assigned below:
            // a reused record must never be observable as linked with a
            // stale index.
            fence(Ordering::Release);
            ptr::addr_of_mut!((*node).item).write(MaybeUninit::new(item));
            (*node).next.store(ptr::null_mut(), Ordering::Relaxed);
            ptr::addr_of_mut!((*node).persistent).write(record);

            loop {
                let tail = self.tail.load(Ordering::Acquire);
                let tail_next = (*tail).next.load(Ordering::Acquire);
                if tail_next.is_null() {
                    let index = (*tail).index + 1;
                    ptr::addr_of_mut!((*record).index).write(index);
                    ptr::addr_of_mut!((*node).index).write(index);
                    match (*tail).next.compare_exchange(
                        ptr::null_mut(),
                        node,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    ) {
                        Ok(_) => {
                            (*record).linked.store(true, Ordering::Relaxed);
                            pmem::flush(record);
                            let _ = self.tail.compare_exchange(
                                tail,
                                node,
                                Ordering::AcqRel,
                                Ordering::Acquire,
                            );
                            return;
                        }
                        Err(winner) => {
                            let _ = self.tail.compare_exchange(
                                tail,
                                winner,
                                Ordering::AcqRel,
                                Ordering::Acquire,
                            );
                        }
                    }
                } else {
                    let _ =
                        self.tail
                            .compare_exchange(tail, tail_next, Ordering::AcqRel, Ordering::Acquire);
                }
            }
        }
    }

    pub fn dequeue(&self, thread_id: usize) -> Result<T, ()> {
        unsafe {
            loop {
                let head = self.head.load(Ordering::Acquire);
                let head_next = (*head).next.load(Ordering::Acquire);
                if head_next.is_null() {
                    let ld = self.local(thread_id);
                    pmem::nt_store_u64(ptr::addr_of_mut!((*ld).head_index), (*head).index);
                    pmem::sfence();
                    return Err(());
                }
                if self
                    .head
                    .compare_exchange(head, head_next, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    let item = (*head_next).item.assume_init_read();
                    let ld = self.local(thread_id);
                    pmem::nt_store_u64(ptr::addr_of_mut!((*ld).head_index), (*head_next).index);
                    pmem::sfence();

                    if !(*ld).node_to_retire.is_null() {
                        let retired = (*ld).node_to_retire;
                        self.pool.free(thread_id, (*retired).persistent);
                        self.volatile_pool.free(thread_id, retired);
                    }
                    (*ld).node_to_retire = head;

                    return Ok(item);
                }
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        unsafe {
            let head = self.head.load(Ordering::Acquire);
            (*head).next.load(Ordering::Acquire).is_null()
        }
    }

    /// Rebuilds the queue from the persistent records: every `linked`
    /// record above the merged per-thread dequeue watermark is live, in
    /// index order.
    pub fn recover(&mut self) {
        unsafe {
            for t in 0..self.num_threads {
                (*self.local(t)).node_to_retire = ptr::null_mut();
            }
            self.pool.reset_for_recovery();
            self.volatile_pool.reset();

            let mut head_index = 0;
            for t in 0..self.num_threads {
                head_index = head_index.max((*self.local(t)).head_index);
            }

            let mut live = BTreeMap::new();
            for c in 0..self.pool.num_chunks() {
                let chunk = self.pool.chunk(c);
                for i in 0..self.pool.slots_per_chunk() {
                    let record = chunk.add(i);
                    if (*record).linked.load(Ordering::Relaxed) && (*record).index > head_index {
                        live.insert((*record).index, record);
                    } else {
                        self.pool.free(self.pool.owner_of(record), record);
                    }
                }
            }

            // Allocated only after the reclaim pass so the scan cannot
            // retire the new dummy out from under us.
            let dummy = self.volatile_pool.alloc(0);
            let dummy_record: *mut PersistentNode<T> = self.pool.alloc(0);
            ptr::addr_of_mut!((*dummy_record).index).write(head_index);
            (*dummy_record).linked.store(false, Ordering::Relaxed);
            ptr::addr_of_mut!((*dummy).item).write(MaybeUninit::uninit());
            ptr::addr_of_mut!((*dummy).index).write(head_index);
            ptr::addr_of_mut!((*dummy).persistent).write(dummy_record);
            self.head.store(dummy, Ordering::Relaxed);

            // Allocations are spread over every thread's range; the
            // live set can exceed one thread's share of the pool.
            let mut pred = dummy;
            let mut alloc_tid = 0;
            for (&index, &record) in live.iter() {
                let node = self.volatile_pool.alloc(alloc_tid);
                alloc_tid = (alloc_tid + 1) % self.num_threads;
                ptr::addr_of_mut!((*node).item).write(ptr::addr_of!((*record).item).read());
                ptr::addr_of_mut!((*node).index).write(index);
                ptr::addr_of_mut!((*node).persistent).write(record);
                (*pred).next.store(node, Ordering::Relaxed);
                pred = node;
            }
            (*pred).next.store(ptr::null_mut(), Ordering::Relaxed);
            self.tail.store(pred, Ordering::Relaxed);
        }
    }
}

impl<T: Copy + Send + 'static> DurableMpmcQueue<T> for OptUnlinkedQueue<T> {
    fn push(&self, item: T, thread_id: usize) -> Result<(), ()> {
        self.enqueue(item, thread_id);
        Ok(())
    }

    fn pop(&self, thread_id: usize) -> Result<T, ()> {
        self.dequeue(thread_id)
    }

    fn is_empty(&self) -> bool {
        self.is_empty()
    }

    fn recover(&mut self) {
        self.recover()
    }
}

impl<T: Send + 'static> Drop for OptUnlinkedQueue<T> {
    fn drop(&mut self) {
        // The backing regions are owned and unmapped by the caller.
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::alloc::{alloc_zeroed, Layout};

    fn region(size: usize) -> *mut u8 {
        unsafe {
            let ptr = alloc_zeroed(Layout::from_size_align(size, 4096).unwrap());
            assert!(!ptr.is_null());
            ptr
        }
    }

    fn build(capacity: usize) -> &'static mut OptUnlinkedQueue<u64> {
        let size = OptUnlinkedQueue::<u64>::shared_size(4, capacity);
        let vsize = OptUnlinkedQueue::<u64>::volatile_size(4, capacity);
        unsafe { OptUnlinkedQueue::init_in_shared(region(size), region(vsize), 4, capacity) }
    }

    #[test]
    fn crash_before_linked_flag_drops_partial_enqueue() {
        let q = build(256);
        for v in 1..=5u64 {
            q.enqueue(v, 0);
        }
        // Crash window: the fifth record's `linked` flag never reached
        // memory.
        unsafe {
            let tail = q.tail.load(Ordering::Relaxed);
            (*(*tail).persistent).linked.store(false, Ordering::Relaxed);
        }
        q.recover();

        let mut drained = Vec::new();
        while let Ok(v) = q.dequeue(1) {
            drained.push(v);
        }
        assert_eq!(drained, vec![1, 2, 3, 4]);

        q.enqueue(5, 0);
        assert_eq!(q.dequeue(1), Ok(5));
    }

    #[test]
    fn recovery_respects_dequeue_watermark() {
        let q = build(256);
        for v in 1..=6u64 {
            q.enqueue(v, 0);
        }
        assert_eq!(q.dequeue(1), Ok(1));
        assert_eq!(q.dequeue(2), Ok(2));
        assert_eq!(q.dequeue(1), Ok(3));
        q.recover();

        let mut drained = Vec::new();
        while let Ok(v) = q.dequeue(3) {
            drained.push(v);
        }
        assert_eq!(drained, vec![4, 5, 6]);
    }

    #[test]
    fn empty_dequeue_watermark_is_durable() {
        let q = build(256);
        for v in 1..=3u64 {
            q.enqueue(v, 0);
        }
        for _ in 0..3 {
            q.dequeue(1).unwrap();
        }
        // The empty dequeue re-witnesses the sentinel index.
        assert!(q.dequeue(1).is_err());
        q.recover();
        assert!(q.is_empty());
        q.enqueue(4, 2);
        assert_eq!(q.dequeue(3), Ok(4));
    }

    #[test]
    fn recovery_is_idempotent() {
        let q = build(256);
        for v in 1..=4u64 {
            q.enqueue(v, 0);
        }
        q.recover();
        q.recover();
        let mut drained = Vec::new();
        while let Ok(v) = q.dequeue(0) {
            drained.push(v);
        }
        assert_eq!(drained, vec![1, 2, 3, 4]);
    }
}
