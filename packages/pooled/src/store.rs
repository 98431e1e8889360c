//! Single-component columnar storage over pooled blocks.
//!
//! A `PooledStore<T>` is one logical array of `T` materialized as a
//! two-level index: a fixed array of index-node slots, each node holding a
//! block of column slots. Blocks are requested from the pool on demand and
//! initialized exactly once; writers update blocks RCU-style so readers
//! never block on them.

use std::array;
use std::marker::PhantomData;
use std::mem;
use std::ptr;

use crossbeam_queue::SegQueue;
use parking_lot::{Mutex, MutexGuard};

use crate::pool::{self, RawBlock, Slot, BLOCK_SIZE};

/// Number of index nodes in a store.
pub const MAX_INDICES_PER_STORE: usize = 84;

/// Block slots per index node; the node itself must fit in one block.
pub const BLOCKS_PER_INDEX: usize = BLOCK_SIZE / (2 * mem::size_of::<usize>());

/// Elements of `T` stored in one block.
pub const fn per_block<T>() -> usize {
    BLOCK_SIZE / mem::size_of::<T>()
}

/// Elements of `T` covered by one index node.
pub const fn per_index<T>() -> usize {
    per_block::<T>() * BLOCKS_PER_INDEX
}

/// Maximum number of elements a `PooledStore<T>` can hold.
pub const fn max_len<T>() -> usize {
    per_index::<T>() * MAX_INDICES_PER_STORE
}

/// Split a store index into (node, block-in-node, offset-in-block).
const fn locate<T>(index: usize) -> (usize, usize, usize) {
    (
        index / per_index::<T>(),
        (index / per_block::<T>()) % BLOCKS_PER_INDEX,
        index % per_block::<T>(),
    )
}

/// One block slot plus the writer lock serializing RCU updates to it.
struct ColumnSlot {
    block: Slot<u8>,
    writer: Mutex<()>,
}

struct IndexNode {
    slots: [ColumnSlot; BLOCKS_PER_INDEX],
}

const _: () = assert!(mem::size_of::<IndexNode>() <= BLOCK_SIZE);

/// A single logical array of `T` over pooled blocks.
///
/// All operations take `&self`; per-block writer locks and atomic slot
/// swaps provide the synchronization. Blocks displaced by RCU updates
/// collect in a reclaim queue and are only returned to the pool by
/// [`PooledStore::reclaim_blocks`], which callers must restrict to
/// quiescence points.
pub struct PooledStore<T> {
    nodes: [Slot<IndexNode>; MAX_INDICES_PER_STORE],
    reclaim: SegQueue<RawBlock>,
    init: Box<dyn Fn(usize) -> T + Send + Sync>,
    _marker: PhantomData<T>,
}

unsafe impl<T: Send> Send for PooledStore<T> {}
unsafe impl<T: Send + Sync> Sync for PooledStore<T> {}

impl<T: Send + Sync + 'static> PooledStore<T> {
    /// Create a store whose fresh blocks are default-initialized.
    pub fn new() -> PooledStore<T>
    where
        T: Default,
    {
        PooledStore::with_init(|_| T::default())
    }

    /// Create a store whose fresh blocks are initialized per-slot from the
    /// slot's store-wide index. The ID column uses this to stamp new slots.
    pub fn with_init(init: impl Fn(usize) -> T + Send + Sync + 'static) -> PooledStore<T> {
        assert!(
            mem::size_of::<T>() >= mem::size_of::<usize>(),
            "element type is too small for slot recycling"
        );

        PooledStore {
            nodes: array::from_fn(|_| Slot::empty()),
            reclaim: SegQueue::new(),
            init: Box::new(init),
            _marker: PhantomData,
        }
    }

    /// Ensure blocks exist for every index in
    /// `[first_index, first_index + count)`.
    ///
    /// Concurrent callers race on per-node and per-block allocation: the
    /// caller whose range covers a node's or block's first element
    /// allocates and notifies, everyone else waits on the slot. Ranges
    /// handed out by a dense cursor tile the index space, so the winner is
    /// unique.
    pub fn reserve(&self, first_index: usize, count: usize) {
        if count == 0 {
            return;
        }

        let last = first_index + count - 1;
        assert!(last < max_len::<T>(), "store capacity exceeded");

        let (first_node, first_block, _) = locate::<T>(first_index);
        let (last_node, last_block, _) = locate::<T>(last);

        for node_index in first_node..=last_node {
            let node_first = node_index * per_index::<T>();
            let node = self.ensure_node(node_index, first_index <= node_first);

            let begin = if node_index == first_node { first_block } else { 0 };
            let end = if node_index == last_node {
                last_block
            } else {
                BLOCKS_PER_INDEX - 1
            };

            for block_index in begin..=end {
                let global_block = node_index * BLOCKS_PER_INDEX + block_index;
                let block_first = global_block * per_block::<T>();
                self.ensure_block(node, block_index, block_first, first_index <= block_first);
            }
        }
    }

    /// Ensure blocks exist for the range and return a mutable iterator
    /// positioned at `first_index`.
    pub fn emplace(&self, first_index: usize, count: usize) -> IterMut<'_, T>
    where
        T: Copy,
    {
        self.reserve(first_index, count);
        self.get(first_index)
    }

    /// A mutable iterator positioned at `index`. No block is touched until
    /// the first dereference.
    pub fn get(&self, index: usize) -> IterMut<'_, T>
    where
        T: Copy,
    {
        IterMut::new(self, index)
    }

    /// A const iterator positioned at `index`. No block is touched until
    /// the first dereference.
    pub fn get_const(&self, index: usize) -> Iter<'_, T> {
        Iter::new(self, index)
    }

    /// Drain the reclaim queue, returning retired blocks to the pool.
    ///
    /// Must only be called at a quiescence point: a reader that captured a
    /// retired block's pointer must have finished with it.
    pub fn reclaim_blocks(&self) {
        while self.reclaim.pop().is_some() {}
    }

    fn ensure_node(&self, node_index: usize, owner: bool) -> *mut IndexNode {
        let slot = &self.nodes[node_index];
        let existing = slot.load();
        if !existing.is_null() {
            return existing;
        }

        if owner {
            let raw = pool::request();
            let node = raw.as_ptr() as *mut IndexNode;
            unsafe {
                for i in 0..BLOCKS_PER_INDEX {
                    ptr::write(
                        ptr::addr_of_mut!((*node).slots[i]),
                        ColumnSlot {
                            block: Slot::empty(),
                            writer: Mutex::new(()),
                        },
                    );
                }
            }
            slot.publish(raw);
            slot.notify_non_null();
            node
        } else {
            slot.wait_non_null()
        }
    }

    fn ensure_block(&self, node: *mut IndexNode, block_index: usize, block_first: usize, owner: bool) {
        let slot = unsafe { &(*node).slots[block_index].block };
        if slot.is_some() {
            return;
        }

        if owner {
            let raw = pool::request();
            let base = raw.as_ptr() as *mut T;
            unsafe {
                for offset in 0..per_block::<T>() {
                    ptr::write(base.add(offset), (self.init)(block_first + offset));
                }
            }
            slot.publish(raw);
            slot.notify_non_null();
        } else {
            slot.wait_non_null();
        }
    }

    /// A reference into the currently published block, waiting for
    /// publication if necessary.
    pub(crate) fn entry(&self, index: usize) -> &T {
        unsafe { &*self.slot_ptr(index) }
    }

    /// Copy the value at `from` over the value at `to` in the published
    /// blocks, bypassing the RCU path.
    ///
    /// # Safety
    /// No concurrent access to either slot; intended for compaction under
    /// an exclusive gate.
    pub(crate) unsafe fn copy_slot(&self, from: usize, to: usize)
    where
        T: Copy,
    {
        let value = *self.slot_ptr(from);
        *self.slot_ptr(to) = value;
    }

    /// Overwrite the value at `index` in the published block.
    ///
    /// # Safety
    /// As for [`PooledStore::copy_slot`].
    pub(crate) unsafe fn write_slot(&self, index: usize, value: T) {
        *self.slot_ptr(index) = value;
    }

    fn slot_ptr(&self, index: usize) -> *mut T {
        let (node_index, block_index, offset) = locate::<T>(index);
        let node = self.nodes[node_index].wait_non_null();
        let block = unsafe { (*node).slots[block_index].block.wait_non_null() };
        unsafe { (block as *mut T).add(offset) }
    }
}

/// A forward const iterator over a `PooledStore<T>`.
///
/// The published block pointer is captured on first dereference and kept
/// until the iterator leaves the block, so a concurrent RCU publication
/// does not move the iterator off its snapshot.
pub struct Iter<'a, T> {
    store: &'a PooledStore<T>,
    index: usize,
    node: usize,
    block: usize,
    base: *const T,
}

impl<'a, T: Send + Sync + 'static> Iter<'a, T> {
    fn new(store: &'a PooledStore<T>, index: usize) -> Iter<'a, T> {
        let (node, block, _) = locate::<T>(index);
        Iter {
            store,
            index,
            node,
            block,
            base: ptr::null(),
        }
    }

    /// The store-wide index this iterator points at.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Advance the iterator by `offset` elements.
    pub fn advance(&mut self, offset: usize) {
        let next = self.index + offset;
        let (node, block, _) = locate::<T>(next);
        if node != self.node || block != self.block {
            self.base = ptr::null();
            self.node = node;
            self.block = block;
        }
        self.index = next;
    }

    /// Read the current element, opening the block on first use.
    ///
    /// The reference stays valid for `'a`: a captured block is only
    /// returned to the pool at a quiescence point, which the caller's view
    /// refcount holds off.
    pub fn get(&mut self) -> &'a T {
        if self.base.is_null() {
            let node = self.store.nodes[self.node].wait_non_null();
            let block = unsafe { (*node).slots[self.block].block.wait_non_null() };
            self.base = block as *const T;
        }
        unsafe { &*self.base.add(self.index % per_block::<T>()) }
    }
}

impl<'a, T> Clone for Iter<'a, T> {
    fn clone(&self) -> Self {
        Iter {
            store: self.store,
            index: self.index,
            node: self.node,
            block: self.block,
            base: self.base,
        }
    }
}

/// A forward mutable iterator over a `PooledStore<T>`.
///
/// On first dereference inside a block the iterator takes that block's
/// writer lock, copies the block into a fresh shadow block, and directs all
/// writes there. Advancing out of the block (or dropping the iterator)
/// publishes the shadow with an atomic swap and queues the displaced block
/// for reclamation. Readers that captured the old pointer keep reading
/// consistent data.
pub struct IterMut<'a, T: Copy> {
    store: &'a PooledStore<T>,
    index: usize,
    node: usize,
    block: usize,
    node_ptr: *mut IndexNode,
    base: *mut T,
    shadow: Option<RawBlock>,
    guard: Option<MutexGuard<'a, ()>>,
}

impl<'a, T: Copy + Send + Sync + 'static> IterMut<'a, T> {
    fn new(store: &'a PooledStore<T>, index: usize) -> IterMut<'a, T> {
        let (node, block, _) = locate::<T>(index);
        IterMut {
            store,
            index,
            node,
            block,
            node_ptr: ptr::null_mut(),
            base: ptr::null_mut(),
            shadow: None,
            guard: None,
        }
    }

    /// The store-wide index this iterator points at.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Advance the iterator by `offset` elements, publishing the open
    /// shadow block if the move leaves it.
    pub fn advance(&mut self, offset: usize) {
        let next = self.index + offset;
        let (node, block, _) = locate::<T>(next);
        if node != self.node || block != self.block {
            self.publish();
            self.node = node;
            self.block = block;
        }
        self.index = next;
    }

    /// Write access to the current element, in the shadow copy.
    pub fn get_mut(&mut self) -> &mut T {
        if self.base.is_null() {
            self.open();
        }
        unsafe { &mut *self.base.add(self.index % per_block::<T>()) }
    }

    fn open(&mut self) {
        let node = self.store.nodes[self.node].wait_non_null();
        self.node_ptr = node;

        let slot: &'a ColumnSlot = unsafe { &(*node).slots[self.block] };
        let guard = slot.writer.lock();

        let shadow = pool::request();
        let published = slot.block.wait_non_null();
        unsafe {
            ptr::copy_nonoverlapping(
                published as *const T,
                shadow.as_ptr() as *mut T,
                per_block::<T>(),
            );
        }

        self.base = shadow.as_ptr() as *mut T;
        self.shadow = Some(shadow);
        self.guard = Some(guard);
    }

}

impl<'a, T: Copy> IterMut<'a, T> {
    fn publish(&mut self) {
        if let Some(shadow) = self.shadow.take() {
            let slot = unsafe { &(*self.node_ptr).slots[self.block] };
            let displaced = slot.block.swap(shadow);
            drop(self.guard.take());
            self.store.reclaim.push(displaced);
        }
        self.base = ptr::null_mut();
    }
}

impl<'a, T: Copy> Drop for IterMut<'a, T> {
    fn drop(&mut self) {
        self.publish();
    }
}
