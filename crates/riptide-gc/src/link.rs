//! Edges of the object graph.
//!
//! A `Link` is one directed reference into the managed heap. Every link
//! with a non-null target sits in that target's inbound-edge circle; root
//! edges (those originating outside the heap) sit at the head of the
//! circle, heap edges at the tail, so a back-search meets roots first.

use std::cell::Cell;
use std::ptr::{self, NonNull};

use crate::block::BlockHeader;
use crate::collector::collector;
use crate::list::ListNode;

/// One directed edge into the managed heap.
#[repr(C)]
pub(crate) struct Link {
    /// Must stay first: entries of a block's inbound-edge circle are cast
    /// back from their node address.
    pub(crate) node: ListNode,
    /// Source block. Null means the edge originates outside the heap —
    /// a root. Fixed at construction.
    pub(crate) from: *mut BlockHeader,
    /// Target block, or null when the reference is empty.
    to: Cell<*mut BlockHeader>,
}

impl Link {
    /// New empty edge originating at `from` (null for a root edge).
    pub(crate) fn new(from: *mut BlockHeader) -> Box<Link> {
        let gc = collector();
        debug_assert!(gc.is_active(), "collector is not initialized");
        gc.note_link_created();
        Box::new(Link {
            node: ListNode::detached(),
            from,
            to: Cell::new(ptr::null_mut()),
        })
    }

    /// New edge originating at `from`, already attached to `to`.
    pub(crate) fn new_to(from: *mut BlockHeader, to: *mut BlockHeader) -> Box<Link> {
        let link = Self::new(from);
        link.attach(to);
        link
    }

    pub(crate) fn target(&self) -> *mut BlockHeader {
        self.to.get()
    }

    /// Target for dereference. Pokes first: reading through an edge whose
    /// target is mid-search invalidates that search.
    pub(crate) fn deref_target(&self) -> *mut BlockHeader {
        if let Some(to) = NonNull::new(self.to.get()) {
            collector().poke(to);
        }
        self.to.get()
    }

    /// Re-target this edge: leave the old target's circle, enter the new
    /// one. Either side may be null.
    pub(crate) fn relink(&self, to: *mut BlockHeader) {
        self.detach();
        self.attach(to);
    }

    /// Enter `to`'s inbound circle. Root edges go to the head, heap edges
    /// to the tail.
    fn attach(&self, to: *mut BlockHeader) {
        self.to.set(to);
        let Some(to) = NonNull::new(to) else {
            return;
        };
        collector().poke(to);
        unsafe {
            let sentinel = &(*to.as_ptr()).node;
            if self.from.is_null() {
                sentinel.push_front(&self.node);
            } else {
                sentinel.push_back(&self.node);
            }
        }
    }

    /// Leave the current target's inbound circle, if any.
    fn detach(&self) {
        if let Some(to) = NonNull::new(self.to.get()) {
            collector().poke(to);
            unsafe { self.node.unlink() };
        }
        self.to.set(ptr::null_mut());
    }

    /// Recover the edge owning a circle entry. The entry must not be a
    /// block's sentinel.
    ///
    /// # Safety
    /// `node` must be the leading node of a live `Link`.
    pub(crate) unsafe fn from_node(node: *mut ListNode) -> *mut Link {
        node as *mut Link
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        let gc = collector();
        // A handle that outlives the collector must not touch block
        // storage: everything it pointed at has already been released.
        if !gc.is_active() {
            return;
        }
        gc.note_link_dropped();
        self.detach();
    }
}
