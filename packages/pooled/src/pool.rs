//! The fixed-block memory pool which backs every buffer in the crate.
//!
//! The pool is process-wide state: block pointers flow through every layer,
//! so it is initialized explicitly with [`init`] and torn down with
//! [`destroy`] rather than being created lazily. Using the pool before
//! `init` panics with a clear message.

use std::alloc::{self, Layout};
use std::marker::PhantomData;
use std::mem;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use crossbeam_queue::SegQueue;

/// The size of every pool block, in bytes. Blocks are aligned to this size.
pub const BLOCK_SIZE: usize = 4096;

static POOL: AtomicPtr<MemoryPool> = AtomicPtr::new(ptr::null_mut());

/// A process-wide pool of fixed-size blocks.
///
/// All blocks live in one contiguous allocation; the free list recycles
/// them without touching the general allocator on the hot path.
pub struct MemoryPool {
    region: NonNull<u8>,
    layout: Layout,
    block_count: usize,
    free: SegQueue<usize>,
    waits: WaitSet,
}

unsafe impl Send for MemoryPool {}
unsafe impl Sync for MemoryPool {}

impl MemoryPool {
    fn new(block_count: usize) -> MemoryPool {
        assert!(block_count > 0, "pool must contain at least one block");

        let layout = Layout::from_size_align(block_count * BLOCK_SIZE, BLOCK_SIZE).unwrap();
        let region = NonNull::new(unsafe { alloc::alloc(layout) }).unwrap();

        let free = SegQueue::new();
        for index in 0..block_count {
            free.push(region.as_ptr() as usize + index * BLOCK_SIZE);
        }

        MemoryPool {
            region,
            layout,
            block_count,
            free,
            waits: WaitSet::new(),
        }
    }

    fn request_block(&self) -> RawBlock {
        if let Some(addr) = self.free.pop() {
            return unsafe { RawBlock::from_raw(addr as *mut u8) };
        }

        let mut warned = false;
        loop {
            let replenished = self
                .waits
                .wait_while(|| self.free.is_empty(), Duration::from_secs(1));

            if let Some(addr) = self.free.pop() {
                return unsafe { RawBlock::from_raw(addr as *mut u8) };
            }

            if !replenished && !warned {
                warned = true;
                log::warn!(
                    "memory pool exhausted ({} blocks); request is waiting for a block to be returned",
                    self.block_count
                );
            }
        }
    }

    fn release_block(&self, ptr: *mut u8) {
        self.free.push(ptr as usize);
        self.waits.wake_all();
    }
}

impl Drop for MemoryPool {
    fn drop(&mut self) {
        debug_assert_eq!(
            self.free.len(),
            self.block_count,
            "memory pool destroyed with blocks still outstanding"
        );
        unsafe { alloc::dealloc(self.region.as_ptr(), self.layout) };
    }
}

/// Initialize the process-wide pool with `block_count` blocks.
///
/// # Panics
/// If the pool is already initialized.
pub fn init(block_count: usize) {
    let pool = Box::into_raw(Box::new(MemoryPool::new(block_count)));
    if POOL
        .compare_exchange(ptr::null_mut(), pool, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        drop(unsafe { Box::from_raw(pool) });
        panic!("memory pool is already initialized");
    }
}

/// Tear down the process-wide pool, releasing its backing region.
///
/// # Safety
/// Every block handle and every structure built on the pool must have been
/// dropped; destroying the pool with blocks outstanding leaves them
/// dangling.
pub unsafe fn destroy() {
    let pool = POOL.swap(ptr::null_mut(), Ordering::AcqRel);
    assert!(!pool.is_null(), "memory pool is not initialized");
    drop(Box::from_raw(pool));
}

fn get() -> &'static MemoryPool {
    let pool = POOL.load(Ordering::Acquire);
    assert!(!pool.is_null(), "memory pool is not initialized");
    unsafe { &*pool }
}

/// Request a block from the pool, blocking while the pool is empty.
pub fn request() -> RawBlock {
    get().request_block()
}

/// The number of blocks currently sitting in the free list.
pub fn free_blocks() -> usize {
    get().free.len()
}

#[cfg(test)]
pub(crate) fn init_for_tests() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| init(32768));
}

/// An owning handle to one pool block.
///
/// Dropping the handle returns the block to the free list. At most one
/// `RawBlock` refers to any block at a time.
pub struct RawBlock {
    ptr: NonNull<u8>,
}

unsafe impl Send for RawBlock {}

impl RawBlock {
    /// Get the raw pointer to the start of the block.
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub(crate) fn into_raw(self) -> *mut u8 {
        let ptr = self.ptr.as_ptr();
        mem::forget(self);
        ptr
    }

    /// Reconstruct a handle from a pointer previously produced by
    /// `into_raw`.
    ///
    /// # Safety
    /// `ptr` must point at a pool block with no other live owner.
    pub(crate) unsafe fn from_raw(ptr: *mut u8) -> RawBlock {
        RawBlock {
            ptr: NonNull::new_unchecked(ptr),
        }
    }
}

impl Drop for RawBlock {
    fn drop(&mut self) {
        get().release_block(self.ptr.as_ptr());
    }
}

/// An atomically swappable cell holding at most one block, typed by its
/// contents.
///
/// The slot owns whatever block is published into it: dropping a non-empty
/// slot runs `T`'s drop glue in place and returns the block to the pool.
/// `Slot` is the single RCU point in the crate; [`Slot::swap`] transfers
/// ownership between the slot and an owning [`RawBlock`] in one atomic
/// exchange.
pub struct Slot<T> {
    ptr: AtomicPtr<u8>,
    _marker: PhantomData<*mut T>,
}

unsafe impl<T: Send> Send for Slot<T> {}
unsafe impl<T: Send + Sync> Sync for Slot<T> {}

impl<T> Slot<T> {
    /// Create an empty slot.
    pub const fn empty() -> Slot<T> {
        Slot {
            ptr: AtomicPtr::new(ptr::null_mut()),
            _marker: PhantomData,
        }
    }

    /// Peek at the published block without taking ownership.
    pub fn load(&self) -> *mut T {
        self.ptr.load(Ordering::Acquire) as *mut T
    }

    /// Returns true if a block has been published.
    pub fn is_some(&self) -> bool {
        !self.load().is_null()
    }

    /// Publish a block into an empty slot.
    ///
    /// This is the first-populate edge observed by [`Slot::wait_non_null`];
    /// follow it with [`Slot::notify_non_null`] to wake waiters.
    pub fn publish(&self, block: RawBlock) {
        let prev = self.ptr.swap(block.into_raw(), Ordering::Release);
        debug_assert!(prev.is_null(), "slot was already populated");
    }

    /// Replace the published block, dropping the previous contents.
    pub fn store(&self, block: RawBlock) {
        let prev = self.ptr.swap(block.into_raw(), Ordering::AcqRel);
        if !prev.is_null() {
            unsafe {
                ptr::drop_in_place(prev as *mut T);
                drop(RawBlock::from_raw(prev));
            }
        }
    }

    /// Atomically exchange the published block with `block`, returning the
    /// displaced block.
    ///
    /// The slot must already be populated; this is the publication step of
    /// an RCU update, not a first populate.
    pub fn swap(&self, block: RawBlock) -> RawBlock {
        let prev = self.ptr.swap(block.into_raw(), Ordering::AcqRel);
        debug_assert!(!prev.is_null(), "swap against an empty slot");
        unsafe { RawBlock::from_raw(prev) }
    }

    /// Block until a block has been published, returning it.
    pub fn wait_non_null(&self) -> *mut T {
        let ptr = self.load();
        if !ptr.is_null() {
            return ptr;
        }

        for _ in 0..64 {
            std::hint::spin_loop();
            let ptr = self.load();
            if !ptr.is_null() {
                return ptr;
            }
        }

        loop {
            get()
                .waits
                .wait_while(|| self.load().is_null(), Duration::from_millis(50));
            let ptr = self.load();
            if !ptr.is_null() {
                return ptr;
            }
        }
    }

    /// Wake threads blocked in [`Slot::wait_non_null`] after the first
    /// populate.
    pub fn notify_non_null(&self) {
        get().waits.wake_all();
    }
}

impl<T> Drop for Slot<T> {
    fn drop(&mut self) {
        let ptr = *self.ptr.get_mut();
        if !ptr.is_null() {
            unsafe {
                ptr::drop_in_place(ptr as *mut T);
                drop(RawBlock::from_raw(ptr));
            }
        }
    }
}

/// A shared wait point for rare blocking paths: slot publication and pool
/// exhaustion. Wakers only touch the lock when a waiter is registered.
struct WaitSet {
    waiters: AtomicUsize,
    lock: Mutex<()>,
    cond: Condvar,
}

impl WaitSet {
    fn new() -> WaitSet {
        WaitSet {
            waiters: AtomicUsize::new(0),
            lock: Mutex::new(()),
            cond: Condvar::new(),
        }
    }

    /// Wait until `pending` returns false or the timeout elapses. Returns
    /// true if the condition was satisfied.
    fn wait_while(&self, mut pending: impl FnMut() -> bool, timeout: Duration) -> bool {
        self.waiters.fetch_add(1, Ordering::SeqCst);
        let mut guard = self.lock.lock().unwrap();

        let mut satisfied = !pending();
        while !satisfied {
            let (next, wait) = self.cond.wait_timeout(guard, timeout).unwrap();
            guard = next;
            satisfied = !pending();
            if wait.timed_out() {
                break;
            }
        }

        drop(guard);
        self.waiters.fetch_sub(1, Ordering::SeqCst);
        satisfied
    }

    fn wake_all(&self) {
        if self.waiters.load(Ordering::SeqCst) > 0 {
            let _guard = self.lock.lock().unwrap();
            self.cond.notify_all();
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_request_distinct_aligned_blocks() {
        init_for_tests();

        let blocks: Vec<RawBlock> = (0..16).map(|_| request()).collect();
        for (i, block) in blocks.iter().enumerate() {
            assert_eq!(block.as_ptr() as usize % BLOCK_SIZE, 0);
            for other in &blocks[..i] {
                assert_ne!(block.as_ptr(), other.as_ptr());
            }
        }
    }

    #[test]
    fn test_slot_publish_and_wait() {
        init_for_tests();

        let slot: Slot<u64> = Slot::empty();
        assert!(!slot.is_some());

        slot.publish(request());
        assert!(slot.is_some());
        slot.notify_non_null();
        assert_eq!(slot.wait_non_null(), slot.load());
    }

    #[test]
    fn test_slot_swap_transfers_ownership() {
        init_for_tests();

        let slot: Slot<u64> = Slot::empty();

        let first = request();
        let first_ptr = first.as_ptr();
        slot.publish(first);

        let second = request();
        let second_ptr = second.as_ptr();
        let displaced = slot.swap(second);

        assert_eq!(displaced.as_ptr(), first_ptr);
        assert_eq!(slot.load() as *mut u8, second_ptr);
    }

    #[test]
    fn test_wait_non_null_blocks_until_publish() {
        init_for_tests();

        let slot: Arc<Slot<u64>> = Arc::new(Slot::empty());

        let waiter = {
            let slot = slot.clone();
            thread::spawn(move || slot.wait_non_null() as usize)
        };

        thread::sleep(Duration::from_millis(10));
        let block = request();
        let expected = block.as_ptr() as usize;
        slot.publish(block);
        slot.notify_non_null();

        assert_eq!(waiter.join().unwrap(), expected);
    }
}
