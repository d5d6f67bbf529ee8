use pmem_queues::{LinkedQueue, OptLinkedQueue, OptUnlinkedQueue, UnlinkedQueue};

const NUM_THREADS: usize = 4;
const CAPACITY: usize = 4_000;

fn create_aligned_memory(size: usize) -> *mut u8 {
    use std::alloc::{alloc_zeroed, Layout};

    unsafe {
        let layout = Layout::from_size_align(size, 4096).unwrap();
        let ptr = alloc_zeroed(layout);
        if ptr.is_null() {
            panic!("Failed to allocate aligned memory");
        }
        ptr
    }
}

// Recovery properties every engine must satisfy, via the public API.
// Crash windows that need durable-state surgery live next to each
// engine's private state in its module tests.
macro_rules! test_recovery {
    ($module_name:ident, $init:expr) => {
        mod $module_name {
            use super::*;

            #[test]
            fn empty_queue_stays_empty_across_recovery() {
                let queue = $init;
                assert!(queue.dequeue(0).is_err());
                queue.recover();
                assert!(queue.is_empty());
                assert!(queue.dequeue(0).is_err());
            }

            #[test]
            fn quiescent_recovery_preserves_contents_in_order() {
                let queue = $init;
                for v in 0..50usize {
                    queue.enqueue(v, v % NUM_THREADS);
                }
                queue.recover();
                for v in 0..50usize {
                    assert_eq!(queue.dequeue(0), Ok(v));
                }
                assert!(queue.dequeue(0).is_err());
            }

            #[test]
            fn no_element_is_dequeued_twice_across_recovery() {
                let queue = $init;
                for v in 0..100usize {
                    queue.enqueue(v, 0);
                }
                for v in 0..30usize {
                    assert_eq!(queue.dequeue(1), Ok(v));
                }
                queue.recover();
                let mut drained = Vec::new();
                while let Ok(v) = queue.dequeue(2) {
                    drained.push(v);
                }
                assert_eq!(drained, (30..100).collect::<Vec<_>>());
            }

            #[test]
            fn queue_is_usable_after_repeated_recovery() {
                let queue = $init;
                for round in 0..5usize {
                    for v in 0..20usize {
                        queue.enqueue(round * 100 + v, v % NUM_THREADS);
                    }
                    queue.recover();
                    queue.recover();
                    for v in 0..20usize {
                        assert_eq!(queue.dequeue(3), Ok(round * 100 + v));
                    }
                    assert!(queue.dequeue(3).is_err());
                }
            }

            #[test]
            fn slots_recycle_across_many_recovery_cycles() {
                // Far more traffic than raw slot capacity; reclamation
                // during recovery has to keep up.
                let queue = $init;
                for round in 0..40usize {
                    for v in 0..50usize {
                        queue.enqueue(round * 50 + v, 0);
                    }
                    queue.recover();
                    for v in 0..50usize {
                        assert_eq!(queue.dequeue(1), Ok(round * 50 + v));
                    }
                }
            }
        }
    };
}

test_recovery!(linked_recovery, {
    let size = LinkedQueue::<usize>::shared_size(NUM_THREADS, CAPACITY);
    let mem = create_aligned_memory(size);
    unsafe { LinkedQueue::<usize>::init_in_shared(mem, NUM_THREADS, CAPACITY) }
});

test_recovery!(unlinked_recovery, {
    let size = UnlinkedQueue::<usize>::shared_size(NUM_THREADS, CAPACITY);
    let mem = create_aligned_memory(size);
    unsafe { UnlinkedQueue::<usize>::init_in_shared(mem, NUM_THREADS, CAPACITY) }
});

test_recovery!(opt_linked_recovery, {
    let size = OptLinkedQueue::<usize>::shared_size(NUM_THREADS, CAPACITY);
    let vsize = OptLinkedQueue::<usize>::volatile_size(NUM_THREADS, CAPACITY);
    let mem = create_aligned_memory(size);
    let vmem = create_aligned_memory(vsize);
    unsafe { OptLinkedQueue::<usize>::init_in_shared(mem, vmem, NUM_THREADS, CAPACITY) }
});

test_recovery!(opt_unlinked_recovery, {
    let size = OptUnlinkedQueue::<usize>::shared_size(NUM_THREADS, CAPACITY);
    let vsize = OptUnlinkedQueue::<usize>::volatile_size(NUM_THREADS, CAPACITY);
    let mem = create_aligned_memory(size);
    let vmem = create_aligned_memory(vsize);
    unsafe { OptUnlinkedQueue::<usize>::init_in_shared(mem, vmem, NUM_THREADS, CAPACITY) }
});

#[test]
fn unlinked_head_width_report_is_consistent() {
    // Informational on platforms without a 16-byte atomic; the queue
    // stays linearizable either way.
    let _ = UnlinkedQueue::<usize>::head_is_lock_free();
}
