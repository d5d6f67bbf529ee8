// Durable Michael-Scott queue with persistence deferred onto the
// successor enqueue. Nodes keep a transient `pred` back-pointer; the
// enqueuer that links a node walks the back-pointers and writes back
// every node of the not-yet-persisted suffix. A node whose durable
// `initialized` flag never reached memory is truncated by recovery.

use std::collections::HashSet;
use std::mem::MaybeUninit;
use std::ptr;
use std::sync::atomic::{fence, AtomicBool, AtomicPtr, Ordering};

use crossbeam_utils::CachePadded;

use crate::pmem::{self, align_up, CACHE_LINE_SIZE};
use crate::pool::NodePool;
use crate::{DurableMpmcQueue, MAX_THREADS};

#[repr(C, align(32))]
struct Node<T> {
    item: MaybeUninit<T>,
    next: AtomicPtr<Node<T>>,
    pred: AtomicPtr<Node<T>>,
    initialized: AtomicBool,
}

impl<T> Node<T> {
    // `initialized` is false on every node handed out by the pool:
    // fresh slots are zeroed and retired slots are cleared by the
    // dequeuer before they are freed.
    unsafe fn initialize(node: *mut Self, item: MaybeUninit<T>) {
        ptr::addr_of_mut!((*node).item).write(item);
        (*node).next.store(ptr::null_mut(), Ordering::Relaxed);
        fence(Ordering::Release);
        (*node).initialized.store(true, Ordering::Relaxed);
    }
}

#[repr(C)]
struct RetireSlot<T> {
    ptr: *mut Node<T>,
}

#[repr(C)]
pub struct LinkedQueue<T: Send + 'static> {
    head: CachePadded<AtomicPtr<Node<T>>>,
    tail: CachePadded<AtomicPtr<Node<T>>>,
    retire: *mut CachePadded<RetireSlot<T>>,
    num_threads: usize,
    pool: NodePool<Node<T>>,
}

unsafe impl<T: Send + 'static> Send for LinkedQueue<T> {}
unsafe impl<T: Send + 'static> Sync for LinkedQueue<T> {}

impl<T: Copy + Send + 'static> LinkedQueue<T> {
    fn retire_offset(num_threads: usize) -> usize {
        align_up(std::mem::size_of::<Self>(), CACHE_LINE_SIZE)
            + num_threads * std::mem::size_of::<CachePadded<RetireSlot<T>>>()
    }

    pub fn shared_size(num_threads: usize, capacity: usize) -> usize {
        let fixed = align_up(Self::retire_offset(num_threads), CACHE_LINE_SIZE);
        let total = fixed + NodePool::<Node<T>>::region_size(num_threads, capacity);
        (total + 4095) & !4095
    }

    /// Formats a zeroed, page-aligned region into a queue holding a
    /// fresh dummy sentinel, and persists the roots.
    ///
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
        (*dummy).pred.store(ptr::null_mut(), Ordering::Relaxed);

        ptr::write(
            queue_ptr,
            Self {
                head: CachePadded::new(AtomicPtr::new(dummy)),
                tail: CachePadded::new(AtomicPtr::new(dummy)),
                retire,
                num_threads,
                pool,
            },
        );

        pmem::flush(dummy);
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
                    (*node).pred.store(tail, Ordering::Relaxed);
                    match (*tail).next.compare_exchange(
                        ptr::null_mut(),
                        node,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    ) {
                        Ok(_) => {
                            self.flush_unpersisted_suffix(node);
                            let _ = self.tail.compare_exchange(
                                tail,
                                node,
                                Ordering::AcqRel,
                                Ordering::Acquire,
                            );
                            (*node).pred.store(ptr::null_mut(), Ordering::Relaxed);
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
                    // The observed emptiness must survive a crash.
                    pmem::flush(&*self.head as *const AtomicPtr<Node<T>>);
                    pmem::sfence();
                    return Err(());
                }
                if self
                    .head
                    .compare_exchange(head, head_next, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    let item = (*head_next).item.assume_init_read();
                    let slot = self.retire_slot(thread_id);
                    if !(*slot).ptr.is_null() {
                        // The previous sentinel had `initialized`
                        // cleared in cache only; persist that before
                        // the slot is reused.
                        pmem::flush((*(*slot).ptr).initialized.as_ptr());
                    }
                    pmem::flush(&*self.head as *const AtomicPtr<Node<T>>);
                    pmem::sfence();

                    (*head_next).pred.store(ptr::null_mut(), Ordering::Relaxed);

                    if !(*slot).ptr.is_null() {
                        self.pool.free(thread_id, (*slot).ptr);
                    }
                    (*head).initialized.store(false, Ordering::Relaxed);
                    (*slot).ptr = head;

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

    // Write back the suffix of nodes whose predecessors have not
    // finished persisting, oldest last. Completed enqueues null their
    // `pred`, which bounds the walk.
    unsafe fn flush_unpersisted_suffix(&self, mut node: *mut Node<T>) {
        loop {
            pmem::flush(node);
            node = (*node).pred.load(Ordering::Acquire);
            if node.is_null() {
                return;
            }
        }
    }

    /// Reconstructs the durable suffix after a crash: truncates at the
    /// first node whose `initialized` flag never reached memory, then
    /// clears and reclaims every node outside the live list.
    pub fn recover(&mut self) {
        unsafe {
            for t in 0..self.num_threads {
                (*self.retire_slot(t)).ptr = ptr::null_mut();
            }
            self.pool.reset_for_recovery();

            let mut live = HashSet::new();
            let mut did_flush = false;

            let mut last = self.head.load(Ordering::Relaxed);
            if !(*last).initialized.load(Ordering::Relaxed) {
                // Crash during construction: re-form the empty queue.
                Node::initialize(last, MaybeUninit::uninit());
                live.insert(last as usize);
            } else {
                let mut curr = last;
                loop {
                    live.insert(curr as usize);
                    last = curr;
                    let next = (*curr).next.load(Ordering::Relaxed);
                    if next.is_null() {
                        break;
                    }
                    if !(*next).initialized.load(Ordering::Relaxed) {
                        // Durable link to a node that never finished
                        // persisting: sever it.
                        (*curr).next.store(ptr::null_mut(), Ordering::Relaxed);
                        pmem::flush(curr);
                        did_flush = true;
                        break;
                    }
                    curr = next;
                }
            }

            for c in 0..self.pool.num_chunks() {
                let chunk = self.pool.chunk(c);
                for i in 0..self.pool.slots_per_chunk() {
                    let node = chunk.add(i);
                    if live.contains(&(node as usize)) {
                        continue;
                    }
                    if (*node).initialized.load(Ordering::Relaxed) {
                        (*node).initialized.store(false, Ordering::Relaxed);
                        pmem::flush(node);
                        did_flush = true;
                    }
                    self.pool.free(self.pool.owner_of(node), node);
                }
            }

            (*last).pred.store(ptr::null_mut(), Ordering::Relaxed);
            self.tail.store(last, Ordering::Relaxed);

            if did_flush {
                pmem::sfence();
            }
        }
    }
}

impl<T: Copy + Send + 'static> DurableMpmcQueue<T> for LinkedQueue<T> {
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

impl<T: Send + 'static> Drop for LinkedQueue<T> {
    fn drop(&mut self) {
        // The backing region is owned and unmapped by the caller.
    }
}
