pub mod pmem;
pub mod pool;

mod linked;
mod opt_linked;
mod opt_unlinked;
mod unlinked;

pub use linked::LinkedQueue;
pub use opt_linked::OptLinkedQueue;
pub use opt_unlinked::OptUnlinkedQueue;
pub use unlinked::UnlinkedQueue;

/// Upper bound on caller-supplied thread ids.
pub const MAX_THREADS: usize = 256;

// Common interface for all durable MPMC queues. Each operation carries
// the caller's thread id, used to index per-thread descriptors and
// allocator state. `recover` is called by exactly one thread after a
// crash, before any concurrent access resumes.
pub trait DurableMpmcQueue<T: Send>: Send + Sync {
    /// Appends an item. Never fails in-contract; the node pools panic
    /// on exhaustion, which is out of scope.
    fn push(&self, item: T, thread_id: usize) -> Result<(), ()>;

    /// Removes the front item; `Err(())` when the queue is empty. The
    /// observed effect (including emptiness) is durable on return.
    fn pop(&self, thread_id: usize) -> Result<T, ()>;

    fn is_empty(&self) -> bool;

    /// Rebuilds a linearizable queue state from durable memory.
    fn recover(&mut self);
}
