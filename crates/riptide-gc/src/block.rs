//! Block header and block table.
//!
//! Every managed allocation is laid out as a `BlockHeader` followed
//! immediately by the user payload. The header anchors the block's
//! inbound-edge list, remembers its slot in the collector's block table,
//! and carries a type-erased destructor for the payload.

use std::alloc::Layout;
use std::cell::Cell;
use std::mem;
use std::ptr::NonNull;

use crate::list::ListNode;

/// Type-erased payload destructor. Drops the payload in place; the block's
/// storage stays allocated until the collector releases it.
pub(crate) type DropFn = unsafe fn(*mut BlockHeader);

/// Header prefixed to every managed allocation.
#[repr(C)]
pub(crate) struct BlockHeader {
    /// Sentinel of this block's inbound-edge circle. Must stay first: the
    /// entries of the circle are `Link`s, which also lead with their node.
    pub(crate) node: ListNode,
    /// This block's index in the collector's block table.
    pub(crate) id: Cell<usize>,
    /// Drops the payload in place.
    pub(crate) drop_fn: DropFn,
    /// Layout of the whole allocation (header + payload), kept so the
    /// storage can be handed back to the host allocator.
    pub(crate) layout: Layout,
    /// Scratch flag owned by the search phase.
    pub(crate) visited: Cell<bool>,
}

impl BlockHeader {
    pub(crate) fn new(drop_fn: DropFn, layout: Layout) -> Self {
        Self {
            node: ListNode::detached(),
            id: Cell::new(usize::MAX),
            drop_fn,
            layout,
            visited: Cell::new(false),
        }
    }

    /// Address of the inbound-edge sentinel.
    pub(crate) fn sentinel(&self) -> *mut ListNode {
        self.node.as_ptr()
    }

    /// Run the payload destructor. Storage stays allocated; the destructor
    /// may still read sibling blocks.
    ///
    /// # Safety
    /// `blk` must point at a live, fully-initialized block whose payload has
    /// not been finalized yet.
    pub(crate) unsafe fn finalize(blk: NonNull<BlockHeader>) {
        unsafe { ((*blk.as_ptr()).drop_fn)(blk.as_ptr()) }
    }
}

/// The table of all live blocks.
///
/// Unordered; removal is swap-remove. The one invariant callers rely on:
/// `table[b.id] == b` for every entry, so `push` stamps the id and
/// `swap_remove` re-stamps the entry that got moved into the hole.
pub(crate) struct BlockTable {
    entries: Vec<NonNull<BlockHeader>>,
}

impl BlockTable {
    pub(crate) const fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn get(&self, i: usize) -> NonNull<BlockHeader> {
        self.entries[i]
    }

    /// Append a block, stamping its id with its new index.
    pub(crate) fn push(&mut self, blk: NonNull<BlockHeader>) {
        unsafe { blk.as_ref() }.id.set(self.entries.len());
        self.entries.push(blk);
    }

    /// Remove the block at `i` in O(1), re-stamping the id of whichever
    /// entry was swapped into its slot.
    pub(crate) fn swap_remove(&mut self, i: usize) -> NonNull<BlockHeader> {
        let blk = self.entries.swap_remove(i);
        if let Some(moved) = self.entries.get(i) {
            unsafe { moved.as_ref() }.id.set(i);
        }
        blk
    }

    /// Take every entry, leaving the table empty. Used at shutdown.
    pub(crate) fn take_all(&mut self) -> Vec<NonNull<BlockHeader>> {
        mem::take(&mut self.entries)
    }
}
