// Durable queue that persists nodes before exposing them through the
// durable state, keyed by a per-node monotonically increasing index.
// Nodes are never persistently linked; recovery rediscovers the live
// set by scanning node memory for `linked` records above the dequeue
// watermark, which `Head` carries as the index half of a 16-byte
// `(ptr, index)` pair updated by double-width CAS.

use std::collections::BTreeMap;
use std::mem::MaybeUninit;
use std::ptr;
use std::sync::atomic::{fence, AtomicBool, AtomicPtr, Ordering};

use crossbeam_utils::atomic::AtomicCell;
use crossbeam_utils::CachePadded;

use crate::pmem::{self, align_up, CACHE_LINE_SIZE};
use crate::pool::NodePool;
use crate::{DurableMpmcQueue, MAX_THREADS};

#[repr(C, align(32))]
struct Node<T> {
    item: MaybeUninit<T>,
    next: AtomicPtr<Node<T>>,
    linked: AtomicBool,
    index: u64,
}

impl<T> Node<T> {
    // `linked` must be false before `index` is assigned in the enqueue
    // loop: a reused slot must never be observable as linked with a
    // stale index.
    unsafe fn initialize(node: *mut Self, item: MaybeUninit<T>) {
        ptr::addr_of_mut!((*node).item).write(item);
        (*node).next.store(ptr::null_mut(), Ordering::Relaxed);
        (*node).linked.store(false, Ordering::Relaxed);
        fence(Ordering::Release);
    }
}

#[repr(C)]
struct RetireSlot<T> {
    ptr: *mut Node<T>,
}

#[repr(C)]
pub struct UnlinkedQueue<T: Send + 'static> {
    // Low 64 bits: sentinel pointer. High 64 bits: sentinel index, the
    // index of the most recent successful dequeue.
    head: CachePadded<AtomicCell<u128>>,
    tail: CachePadded<AtomicPtr<Node<T>>>,
    retire: *mut CachePadded<RetireSlot<T>>,
    num_threads: usize,
    pool: NodePool<Node<T>>,
}

unsafe impl<T: Send + 'static> Send for UnlinkedQueue<T> {}
unsafe impl<T: Send + 'static> Sync for UnlinkedQueue<T> {}

fn pack<T>(ptr: *mut Node<T>, index: u64) -> u128 {
    ((index as u128) << 64) | (ptr as usize as u128)
}

fn unpack<T>(v: u128) -> (*mut Node<T>, u64) {
    (v as usize as *mut Node<T>, (v >> 64) as u64)
}

impl<T: Copy + Send + 'static> UnlinkedQueue<T> {
    /// True when the platform backs the 16-byte head with a genuine
    /// lock-free atomic rather than the seqlock fallback.
    pub fn head_is_lock_free() -> bool {
        AtomicCell::<u128>::is_lock_free()
    }

    fn retire_offset(num_threads: usize) -> usize {
        align_up(std::mem::size_of::<Self>(), CACHE_LINE_SIZE)
            + num_threads * std::mem::size_of::<CachePadded<RetireSlot<T>>>()
    }

    pub fn shared_size(num_threads: usize, capacity: usize) -> usize {
        let fixed = align_up(Self::retire_offset(num_threads), CACHE_LINE_SIZE);
        let total = fixed + NodePool::<Node<T>>::region_size(num_threads, capacity);
        (total + 4095) & !4095
    }

    /// # Safety
    ///
    /// `mem` must be valid for `shared_size(num_threads, capacity)`
    /// bytes, zeroed, and not accessed through any other path.
    pub unsafe fn init_in_shared(
        mem: *mut u8,
        num_threads: usize,
        capacity: usize,
    ) -> &'static mut Self {
        assert!(num_threads > 0 && num_threads <= MAX_THREADS);
        #[cfg(target_feature = "cmpxchg16b")]
        debug_assert!(Self::head_is_lock_free());

        let queue_ptr = mem as *mut Self;
        let retire =
            mem.add(align_up(std::mem::size_of::<Self>(), CACHE_LINE_SIZE))
                as *mut CachePadded<RetireSlot<T>>;
        for t in 0..num_threads {
            ptr::write(
                retire.add(t),
                CachePadded::new(RetireSlot {
                    ptr: ptr::null_mut(),
                }),
            );
        }

        let pool_region = mem.add(align_up(Self::retire_offset(num_threads), CACHE_LINE_SIZE));
        let pool = NodePool::init(pool_region, num_threads, capacity);

        let dummy = pool.alloc(0);
        Node::initialize(dummy, MaybeUninit::uninit());
        ptr::addr_of_mut!((*dummy).index).write(0);

        ptr::write(
            queue_ptr,
            Self {
                head: CachePadded::new(AtomicCell::new(pack(dummy, 0))),
                tail: CachePadded::new(AtomicPtr::new(dummy)),
                retire,
                num_threads,
                pool,
            },
        );

        pmem::flush_sized(mem, std::mem::size_of::<Self>());
        pmem::sfence();

        &mut *queue_ptr
    }

    unsafe fn retire_slot(&self, tid: usize) -> *mut RetireSlot<T> {
        let padded: &mut CachePadded<RetireSlot<T>> = &mut *self.retire.add(tid);
        &mut **padded
    }

    pub fn enqueue(&self, item: T, thread_id: usize) {
        unsafe {
            let node = self.pool.alloc(thread_id);
            Node::initialize(node, MaybeUninit::new(item));
            loop {
                let tail = self.tail.load(Ordering::Acquire);
                let tail_next = (*tail).next.load(Ordering::Acquire);
                if tail_next.is_null() {
                    ptr::addr_of_mut!((*node).index).write((*tail).index + 1);
                    match (*tail).next.compare_exchange(
                        ptr::null_mut(),
                        node,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    ) {
                        Ok(_) => {
                            (*node).linked.store(true, Ordering::Relaxed);
                            pmem::flush(node);
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
                let head = self.head.load();
                let (head_ptr, _head_idx) = unpack::<T>(head);
                let head_next = (*head_ptr).next.load(Ordering::Acquire);
                if head_next.is_null() {
                    pmem::flush(&*self.head as *const AtomicCell<u128>);
                    pmem::sfence();
                    return Err(());
                }
                let next = pack(head_next, (*head_next).index);
                if self.head.compare_exchange(head, next).is_ok() {
                    let item = (*head_next).item.assume_init_read();
                    pmem::flush(&*self.head as *const AtomicCell<u128>);
                    pmem::sfence();

                    let slot = self.retire_slot(thread_id);
                    if !(*slot).ptr.is_null() {
                        self.pool.free(thread_id, (*slot).ptr);
                    }
                    (*slot).ptr = head_ptr;

                    return Ok(item);
                }
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        unsafe {
            let (head_ptr, _) = unpack::<T>(self.head.load());
            (*head_ptr).next.load(Ordering::Acquire).is_null()
        }
    }

    /// Rebuilds the queue from node memory: every `linked` record above
    /// the durable dequeue watermark is live, in index order; all other
    /// slots are reclaimed.
    pub fn recover(&mut self) {
        unsafe {
            for t in 0..self.num_threads {
                (*self.retire_slot(t)).ptr = ptr::null_mut();
            }
            self.pool.reset_for_recovery();

            let (_, head_index) = unpack::<T>(self.head.load());

            let mut live = BTreeMap::new();
            for c in 0..self.pool.num_chunks() {
                let chunk = self.pool.chunk(c);
                for i in 0..self.pool.slots_per_chunk() {
                    let node = chunk.add(i);
                    if (*node).linked.load(Ordering::Relaxed) && (*node).index > head_index {
                        live.insert((*node).index, node);
                    } else {
                        self.pool.free(self.pool.owner_of(node), node);
                    }
                }
            }

            // Allocated only after the reclaim pass so the scan cannot
            // retire the new dummy out from under us.
            let dummy = self.pool.alloc(0);
            Node::initialize(dummy, MaybeUninit::uninit());
            ptr::addr_of_mut!((*dummy).index).write(head_index);
            self.head.store(pack(dummy, head_index));

            let mut pred = dummy;
            for node in live.values() {
                (*pred).next.store(*node, Ordering::Relaxed);
                pred = *node;
            }
            (*pred).next.store(ptr::null_mut(), Ordering::Relaxed);
            self.tail.store(pred, Ordering::Relaxed);
        }
    }
}

impl<T: Copy + Send + 'static> DurableMpmcQueue<T> for UnlinkedQueue<T> {
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

impl<T: Send + 'static> Drop for UnlinkedQueue<T> {
    fn drop(&mut self) {
        // The backing region is owned and unmapped by the caller.
    }
}
