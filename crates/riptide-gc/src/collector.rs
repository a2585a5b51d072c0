//! The incremental back-tracing collector.
//!
//! Instead of tracing forward from an enumerated root set, the collector
//! picks a candidate block at random and walks *backwards* along its
//! inbound edges. If the walk exhausts the candidate's back-reachable
//! component without ever meeting an edge whose source is null (a root),
//! nothing outside the component can reach it: the whole component is
//! garbage, cycles included.
//!
//! ## Design
//!
//! - **Incremental**: work is split into constant-time ticks, run inside
//!   allocations (paced by `effort`) or on demand via [`crate::collect`]
//! - **Phases**: Initialize → Search, then Clear (component proved live or
//!   search invalidated) or Finalize → Destroy (component proved garbage)
//! - **Write barrier**: any touch of a block the search has visited aborts
//!   the search into Clear; stale partial knowledge is thrown away
//! - **Two-phase reclaim**: destructors of a doomed component all run
//!   before any of its storage is released, so destructors may still read
//!   sibling blocks
//! - **Per-thread**: one collector per thread, no synchronization

use std::alloc::{Layout, handle_alloc_error};
use std::cell::{Cell, RefCell};
use std::ptr::{self, NonNull};
use std::time::{SystemTime, UNIX_EPOCH};

use rustc_hash::FxHashSet;

use crate::alloc::{HostAllocator, SystemAllocator};
use crate::block::{BlockHeader, BlockTable};
use crate::config::{GcConfig, ReclaimHook};
use crate::link::Link;
use crate::list::ListNode;

/// Collection phase.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcPhase {
    /// Choosing the next block to expand (or seeding a fresh search).
    Initialize,
    /// Walking the inbound edges of the current block.
    Search,
    /// Un-marking a search that met a root or was invalidated by a write.
    Clear,
    /// Running payload destructors of a garbage component.
    Finalize,
    /// Returning the component's storage to the host allocator.
    Destroy,
}

/// Collector counters.
#[derive(Debug, Default, Clone, Copy)]
pub struct GcStats {
    /// Garbage components reclaimed.
    pub components_reclaimed: u64,
    /// Blocks reclaimed across all components.
    pub blocks_reclaimed: u64,
    /// Blocks in the most recently reclaimed component.
    pub last_component_blocks: usize,
    /// Searches abandoned because a visited block was touched.
    pub searches_aborted: u64,
}

/// Per-thread collector state.
///
/// All fields are interior-mutable: the instance is reached through a
/// shared `'static` reference, and borrows are always released before any
/// user code (payload destructors, the reclaim hook) gets to run, so that
/// code may freely create, retarget and drop references of its own.
pub(crate) struct Collector {
    active: Cell<bool>,
    tearing_down: Cell<bool>,

    blocks: RefCell<BlockTable>,
    total_links: Cell<usize>,

    phase: Cell<GcPhase>,
    /// Blocks discovered but not yet expanded.
    search_stack: RefCell<Vec<NonNull<BlockHeader>>>,
    /// Every block visited by the current search, in visit order.
    search_list: RefCell<Vec<NonNull<BlockHeader>>>,
    /// Block currently being expanded.
    cursor_block: Cell<Option<NonNull<BlockHeader>>>,
    /// Position in the cursor block's inbound circle.
    cursor_link: Cell<*mut ListNode>,
    /// Index into `search_list` for the Clear/Finalize/Destroy sweeps.
    pos: Cell<usize>,

    effort: Cell<f64>,
    rng: Cell<u64>,

    allocator: RefCell<Box<dyn HostAllocator>>,
    on_reclaim: RefCell<Option<ReclaimHook>>,

    components_reclaimed: Cell<u64>,
    blocks_reclaimed: Cell<u64>,
    last_component_blocks: Cell<usize>,
    searches_aborted: Cell<u64>,
}

thread_local! {
    // Leaked to produce the `&'static` that edges and handles hang on to.
    // One collector per thread for the life of the process — a bounded,
    // negligible leak.
    static COLLECTOR: &'static Collector = Box::leak(Box::new(Collector::new()));
}

/// This thread's collector.
pub(crate) fn collector() -> &'static Collector {
    COLLECTOR.with(|gc| *gc)
}

impl Collector {
    fn new() -> Self {
        Self {
            active: Cell::new(false),
            tearing_down: Cell::new(false),
            blocks: RefCell::new(BlockTable::new()),
            total_links: Cell::new(0),
            phase: Cell::new(GcPhase::Initialize),
            search_stack: RefCell::new(Vec::new()),
            search_list: RefCell::new(Vec::new()),
            cursor_block: Cell::new(None),
            cursor_link: Cell::new(ptr::null_mut()),
            pos: Cell::new(0),
            effort: Cell::new(1.0),
            rng: Cell::new(0),
            allocator: RefCell::new(Box::new(SystemAllocator)),
            on_reclaim: RefCell::new(None),
            components_reclaimed: Cell::new(0),
            blocks_reclaimed: Cell::new(0),
            last_component_blocks: Cell::new(0),
            searches_aborted: Cell::new(0),
        }
    }

    // ---------------------------------------------------------------
    // Lifecycle
    // ---------------------------------------------------------------

    pub(crate) fn init(&self, config: GcConfig) {
        assert!(!self.active.get(), "collector is already initialized");
        let GcConfig {
            effort,
            seed,
            allocator,
            on_reclaim,
        } = config;
        assert!(
            effort.is_finite() && effort >= 0.0,
            "effort must be a non-negative finite number"
        );

        self.effort.set(effort);
        self.rng.set(seed.unwrap_or_else(clock_seed));
        *self.allocator.borrow_mut() = allocator;
        *self.on_reclaim.borrow_mut() = on_reclaim;

        self.components_reclaimed.set(0);
        self.blocks_reclaimed.set(0);
        self.last_component_blocks.set(0);
        self.searches_aborted.set(0);

        self.active.set(true);

        #[cfg(feature = "gc_logging")]
        tracing::debug!(target: "riptide::gc", effort, "collector initialized");
    }

    /// Finalize then free every live block, and return to the pristine
    /// state.
    ///
    /// Destructors for *all* blocks run before *any* storage is released,
    /// mirroring the Finalize/Destroy split: a destructor may still read
    /// blocks that were torn down before it.
    pub(crate) fn finish(&self) {
        assert!(self.active.get(), "collector is not initialized");
        self.tearing_down.set(true);

        let blocks = self.blocks.borrow_mut().take_all();
        for &blk in &blocks {
            unsafe { BlockHeader::finalize(blk) };
        }
        for &blk in &blocks {
            unsafe { self.release_block(blk) };
        }

        #[cfg(feature = "gc_logging")]
        tracing::debug!(
            target: "riptide::gc",
            blocks = blocks.len(),
            "collector shut down"
        );

        self.search_stack.borrow_mut().clear();
        self.search_list.borrow_mut().clear();
        self.cursor_block.set(None);
        self.cursor_link.set(ptr::null_mut());
        self.pos.set(0);
        self.phase.set(GcPhase::Initialize);
        self.total_links.set(0);
        *self.on_reclaim.borrow_mut() = None;
        *self.allocator.borrow_mut() = Box::new(SystemAllocator);

        self.tearing_down.set(false);
        self.active.set(false);
    }

    pub(crate) fn is_active(&self) -> bool {
        self.active.get()
    }

    // ---------------------------------------------------------------
    // Accounting
    // ---------------------------------------------------------------

    pub(crate) fn note_link_created(&self) {
        self.total_links.set(self.total_links.get() + 1);
    }

    pub(crate) fn note_link_dropped(&self) {
        self.total_links.set(self.total_links.get().saturating_sub(1));
    }

    pub(crate) fn num_blocks(&self) -> usize {
        self.blocks.borrow().len()
    }

    pub(crate) fn num_links(&self) -> usize {
        self.total_links.get()
    }

    pub(crate) fn effort(&self) -> f64 {
        assert!(self.active.get(), "collector is not initialized");
        self.effort.get()
    }

    pub(crate) fn set_effort(&self, effort: f64) {
        assert!(self.active.get(), "collector is not initialized");
        assert!(
            effort.is_finite() && effort >= 0.0,
            "effort must be a non-negative finite number"
        );
        self.effort.set(effort);
    }

    pub(crate) fn stats(&self) -> GcStats {
        GcStats {
            components_reclaimed: self.components_reclaimed.get(),
            blocks_reclaimed: self.blocks_reclaimed.get(),
            last_component_blocks: self.last_component_blocks.get(),
            searches_aborted: self.searches_aborted.get(),
        }
    }

    pub(crate) fn current_phase(&self) -> GcPhase {
        self.phase.get()
    }

    // ---------------------------------------------------------------
    // Allocation
    // ---------------------------------------------------------------

    /// Run the paced amount of collection work that precedes an
    /// allocation: `effort · (2·links/blocks + 7)` ticks, integer
    /// division first. The fan-in term amortizes edge-walk work against
    /// the density of the graph; the constant keeps sparse heaps moving.
    pub(crate) fn pace(&self) {
        assert!(self.active.get(), "collector is not initialized");
        let nblocks = self.blocks.borrow().len();
        if nblocks == 0 {
            return;
        }
        let fan_in = self.total_links.get() / nblocks;
        let steps = (self.effort.get() * (2 * fan_in + 7) as f64) as usize;
        for _ in 0..steps {
            self.step();
        }
    }

    pub(crate) fn allocate_raw(&self, layout: Layout) -> NonNull<u8> {
        assert!(self.active.get(), "collector is not initialized");
        debug_assert!(
            !self.tearing_down.get(),
            "allocation from a destructor during shutdown"
        );
        let ptr = unsafe { self.allocator.borrow().alloc(layout) };
        match NonNull::new(ptr) {
            Some(ptr) => ptr,
            None => handle_alloc_error(layout),
        }
    }

    pub(crate) fn register_block(&self, blk: NonNull<BlockHeader>) {
        self.blocks.borrow_mut().push(blk);
    }

    pub(crate) unsafe fn release_raw(&self, ptr: NonNull<u8>, layout: Layout) {
        unsafe { self.allocator.borrow().dealloc(ptr.as_ptr(), layout) };
    }

    unsafe fn release_block(&self, blk: NonNull<BlockHeader>) {
        let layout = unsafe { blk.as_ref() }.layout;
        unsafe { self.release_raw(blk.cast(), layout) };
    }

    // ---------------------------------------------------------------
    // Write barrier
    // ---------------------------------------------------------------

    /// A block the search has already visited was touched: whatever the
    /// search has concluded about its component may rest on stale edges,
    /// so throw the search away. The Clear phase resets the visited marks
    /// before the next attempt. Outside a search this is a no-op.
    pub(crate) fn poke(&self, blk: NonNull<BlockHeader>) {
        if !unsafe { blk.as_ref() }.visited.get() {
            return;
        }
        match self.phase.get() {
            GcPhase::Initialize | GcPhase::Search => {
                self.phase.set(GcPhase::Clear);
                self.pos.set(0);
                self.searches_aborted
                    .set(self.searches_aborted.get() + 1);

                #[cfg(feature = "gc_logging")]
                tracing::trace!(target: "riptide::gc", "search invalidated by a write");
            }
            _ => {}
        }
    }

    // ---------------------------------------------------------------
    // State machine
    // ---------------------------------------------------------------

    /// One bounded tick of collection work.
    pub(crate) fn step(&self) {
        match self.phase.get() {
            GcPhase::Initialize => self.initialize_step(),
            GcPhase::Search => self.search_step(),
            GcPhase::Clear => self.clear_step(),
            GcPhase::Finalize => self.finalize_step(),
            GcPhase::Destroy => self.destroy_step(),
        }
    }

    /// Pick the block to expand next: the top of the frontier stack, or —
    /// when a fresh search begins — a uniformly random table entry.
    fn initialize_step(&self) {
        let blk = match self.search_stack.borrow_mut().pop() {
            Some(blk) => blk,
            None => {
                let blocks = self.blocks.borrow();
                if blocks.is_empty() {
                    return;
                }
                let blk = blocks.get(self.rand_below(blocks.len()));
                unsafe { blk.as_ref() }.visited.set(true);
                self.search_list.borrow_mut().push(blk);
                blk
            }
        };
        self.cursor_block.set(Some(blk));
        self.cursor_link.set(unsafe { blk.as_ref() }.node.next());
        self.phase.set(GcPhase::Search);
    }

    /// Inspect one inbound edge of the cursor block.
    fn search_step(&self) {
        let Some(blk) = self.cursor_block.get() else {
            debug_assert!(false, "search tick without a cursor block");
            self.phase.set(GcPhase::Initialize);
            return;
        };
        let cur = self.cursor_link.get();

        if cur == unsafe { blk.as_ref() }.sentinel() {
            // Cursor block exhausted.
            if self.search_stack.borrow().is_empty() {
                // The whole component was walked without meeting a root:
                // nothing outside it can reach it.
                let count = self.search_list.borrow().len();
                self.phase.set(GcPhase::Finalize);
                self.pos.set(0);
                self.report_reclaim(count);
                return;
            }
            self.phase.set(GcPhase::Initialize);
            return;
        }

        let from = unsafe { (*Link::from_node(cur)).from };
        if from.is_null() {
            // A root reaches this component; it is live.
            self.phase.set(GcPhase::Clear);
            self.pos.set(0);
            return;
        }

        let from = unsafe { NonNull::new_unchecked(from) };
        if !unsafe { from.as_ref() }.visited.get() {
            unsafe { from.as_ref() }.visited.set(true);
            self.search_list.borrow_mut().push(from);
            self.search_stack.borrow_mut().push(from);
        }
        self.cursor_link.set(unsafe { (*cur).next() });
    }

    /// Reset one visited mark; when the sweep is done, forget the search.
    fn clear_step(&self) {
        let done = {
            let list = self.search_list.borrow();
            let pos = self.pos.get();
            if pos < list.len() {
                unsafe { list[pos].as_ref() }.visited.set(false);
                self.pos.set(pos + 1);
                pos + 1 >= list.len()
            } else {
                true
            }
        };
        if done {
            self.search_stack.borrow_mut().clear();
            self.search_list.borrow_mut().clear();
            self.phase.set(GcPhase::Initialize);
        }
    }

    /// Run one doomed block's destructor and drop it from the table.
    /// Storage is not released yet: destructors later in the component may
    /// still read this block.
    fn finalize_step(&self) {
        let blk = {
            let list = self.search_list.borrow();
            let pos = self.pos.get();
            if pos >= list.len() {
                None
            } else {
                self.pos.set(pos + 1);
                Some(list[pos])
            }
        };
        if let Some(blk) = blk {
            {
                let mut blocks = self.blocks.borrow_mut();
                let id = unsafe { blk.as_ref() }.id.get();
                blocks.swap_remove(id);
            }
            // Borrows are released: the destructor may create, retarget
            // and drop references.
            unsafe { BlockHeader::finalize(blk) };
        }
        if self.phase.get() == GcPhase::Finalize
            && self.pos.get() >= self.search_list.borrow().len()
        {
            self.phase.set(GcPhase::Destroy);
            self.pos.set(0);
        }
    }

    /// Hand one finalized block's storage back to the host allocator.
    fn destroy_step(&self) {
        let blk = {
            let list = self.search_list.borrow();
            let pos = self.pos.get();
            if pos < list.len() {
                self.pos.set(pos + 1);
                Some(list[pos])
            } else {
                None
            }
        };
        if let Some(blk) = blk {
            unsafe { self.release_block(blk) };
        }
        if self.pos.get() >= self.search_list.borrow().len() {
            debug_assert!(self.search_stack.borrow().is_empty());
            self.search_list.borrow_mut().clear();
            self.phase.set(GcPhase::Initialize);
        }
    }

    fn report_reclaim(&self, count: usize) {
        self.components_reclaimed
            .set(self.components_reclaimed.get() + 1);
        self.blocks_reclaimed
            .set(self.blocks_reclaimed.get() + count as u64);
        self.last_component_blocks.set(count);

        #[cfg(feature = "gc_logging")]
        tracing::debug!(
            target: "riptide::gc",
            blocks = count,
            "garbage component detected"
        );

        // Take the hook out while it runs; it may call back into the
        // collector.
        let hook = self.on_reclaim.borrow_mut().take();
        if let Some(mut hook) = hook {
            hook(count);
            let mut slot = self.on_reclaim.borrow_mut();
            if slot.is_none() {
                *slot = Some(hook);
            }
        }
    }

    fn rand_below(&self, n: usize) -> usize {
        // xorshift64; zero is its fixed point, so nudge it off.
        let mut s = self.rng.get();
        if s == 0 {
            s = 0x853c49e6748fea9b;
        }
        s ^= s << 13;
        s ^= s >> 7;
        s ^= s << 17;
        self.rng.set(s);
        (s % n as u64) as usize
    }

    // ---------------------------------------------------------------
    // Validation
    // ---------------------------------------------------------------

    /// Assert the structural invariants of the live graph. Intended for
    /// tests and debugging sweeps; cost is linear in blocks plus edges.
    pub(crate) fn check_invariants(&self) {
        let blocks = self.blocks.borrow();

        // Table slots agree with block ids.
        for i in 0..blocks.len() {
            assert_eq!(
                unsafe { blocks.get(i).as_ref() }.id.get(),
                i,
                "block table id drift"
            );
        }

        // Every inbound circle is well-formed and holds only edges that
        // target its anchor block.
        let mut attached = 0usize;
        for i in 0..blocks.len() {
            let blk = blocks.get(i);
            let sentinel = unsafe { blk.as_ref() }.sentinel();
            let mut seen = FxHashSet::default();
            let mut cur = unsafe { (*sentinel).next() };
            while cur != sentinel {
                assert!(
                    seen.insert(cur as usize),
                    "inbound circle revisits an edge"
                );
                unsafe {
                    assert_eq!((*(*cur).next()).prev(), cur, "next/prev mismatch");
                    assert_eq!((*(*cur).prev()).next(), cur, "prev/next mismatch");
                    assert_eq!(
                        (*Link::from_node(cur)).target(),
                        blk.as_ptr(),
                        "edge filed under the wrong block"
                    );
                    cur = (*cur).next();
                }
                attached += 1;
            }
        }
        assert!(
            attached <= self.total_links.get(),
            "more attached edges than live links"
        );

        // Visited marks exist only for blocks on the search list.
        match self.phase.get() {
            GcPhase::Initialize | GcPhase::Search => {
                let listed: FxHashSet<usize> = self
                    .search_list
                    .borrow()
                    .iter()
                    .map(|blk| blk.as_ptr() as usize)
                    .collect();
                for i in 0..blocks.len() {
                    let blk = blocks.get(i);
                    assert_eq!(
                        unsafe { blk.as_ref() }.visited.get(),
                        listed.contains(&(blk.as_ptr() as usize)),
                        "visited mark out of sync with the search list"
                    );
                }
            }
            _ => {}
        }
    }
}

fn clock_seed() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0x853c49e6748fea9b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{GcSession, Node};
    use crate::{Ref, collect, num_blocks, stats};

    #[test]
    fn test_ticks_on_empty_heap_are_noops() {
        let _gc = GcSession::new();
        collect(100);
        assert_eq!(num_blocks(), 0);
        assert_eq!(crate::current_phase(), GcPhase::Initialize);
    }

    #[test]
    fn test_unreferenced_block_is_reclaimed() {
        let _gc = GcSession::new();
        {
            let _r = Ref::make(3u64);
        }
        assert_eq!(num_blocks(), 1);
        collect(16);
        assert_eq!(num_blocks(), 0);
        let s = stats();
        assert_eq!(s.components_reclaimed, 1);
        assert_eq!(s.blocks_reclaimed, 1);
        assert_eq!(s.last_component_blocks, 1);
    }

    #[test]
    fn test_rooted_block_survives() {
        let _gc = GcSession::new();
        let r = Ref::make(3u64);
        collect(1000);
        assert_eq!(num_blocks(), 1);
        assert_eq!(stats().components_reclaimed, 0);
        drop(r);
    }

    #[test]
    fn test_reclaim_hook_reports_component_size() {
        use std::cell::Cell;
        use std::rc::Rc;

        let reported = Rc::new(Cell::new(0usize));
        let sink = Rc::clone(&reported);
        let _gc = GcSession::with_config(GcConfig {
            effort: 0.0,
            seed: Some(7),
            on_reclaim: Some(Box::new(move |n| sink.set(sink.get() + n))),
            ..GcConfig::default()
        });

        // Two-block cycle, dropped.
        let mut a = Ref::make_with(|obj| Node {
            value: 1,
            next: obj.field(),
        });
        let mut b = Ref::make_with(|obj| Node {
            value: 2,
            next: obj.field(),
        });
        a.next.set(&b);
        b.next.set(&a);
        drop(a);
        drop(b);

        collect(64);
        assert_eq!(num_blocks(), 0);
        assert_eq!(reported.get(), 2);
    }

    #[test]
    fn test_invariants_hold_through_churn() {
        let _gc = GcSession::with_config(GcConfig {
            seed: Some(99),
            ..GcConfig::default()
        });

        let mut roots: Vec<Ref<Node>> = Vec::new();
        for i in 0..40u64 {
            let node = Ref::make_with(|obj| Node {
                value: i,
                next: obj.field(),
            });
            if let Some(prev) = roots.last() {
                let mut node = node.clone();
                node.next.set(prev);
            }
            roots.push(node);
            if i % 3 == 0 && roots.len() > 2 {
                roots.swap_remove((i as usize) % roots.len());
            }
            collect(5);
            crate::check_invariants();
            // One field edge per block, one root edge per handle.
            assert_eq!(crate::num_links(), num_blocks() + roots.len());
        }
        roots.clear();
        collect(4000);
        crate::check_invariants();
        assert_eq!(num_blocks(), 0);
    }

    #[test]
    #[should_panic(expected = "already initialized")]
    fn test_double_init_panics() {
        let _gc = GcSession::new();
        crate::init();
    }

    #[test]
    fn test_effort_accessors() {
        let _gc = GcSession::new();
        assert_eq!(crate::effort(), 1.0);
        crate::set_effort(2.5);
        assert_eq!(crate::effort(), 2.5);
    }
}
