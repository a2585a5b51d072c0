//! End-to-end collector scenarios: cycle reclamation, rooted survival,
//! write-barrier aborts, leak accounting under churn, and shutdown
//! ordering.

use std::cell::Cell;
use std::rc::Rc;

use riptide_gc::{self as gc, CountingAllocator, GcConfig, GcPhase, Ref};

/// Balances `init`/`finish` around a test body, including on panic.
struct Session;

impl Session {
    fn new(config: GcConfig) -> Self {
        gc::init_with(config);
        Session
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if gc::is_initialized() {
            gc::finish();
        }
    }
}

fn seeded(seed: u64) -> GcConfig {
    GcConfig {
        seed: Some(seed),
        ..GcConfig::default()
    }
}

struct Node {
    next: Ref<Node>,
}

fn new_node() -> Ref<Node> {
    Ref::make_with(|obj| Node { next: obj.field() })
}

/// Drive the collector until the heap drains or the tick budget runs out.
fn drain(max_rounds: usize) {
    for _ in 0..max_rounds {
        if gc::num_blocks() == 0 {
            return;
        }
        gc::collect(1024);
    }
}

#[test]
fn three_cycle_is_reclaimed_once_unrooted() {
    let (alloc, outstanding) = CountingAllocator::with_count();
    let _session = Session::new(GcConfig {
        allocator: Box::new(alloc),
        ..seeded(11)
    });

    {
        let mut a = new_node();
        let mut b = new_node();
        let mut c = new_node();
        a.next.set(&b);
        b.next.set(&c);
        c.next.set(&a);
        assert_eq!(gc::num_blocks(), 3);
        gc::check_invariants();
    }

    // External handles gone; only the cycle's own edges remain.
    drain(64);
    assert_eq!(gc::num_blocks(), 0);
    assert_eq!(outstanding.get(), 0);
    assert_eq!(gc::stats().blocks_reclaimed, 3);
}

#[test]
fn rooted_cycle_is_preserved() {
    let _session = Session::new(seeded(12));

    let mut a = new_node();
    let mut b = new_node();
    let mut c = new_node();
    a.next.set(&b);
    b.next.set(&c);
    c.next.set(&a);
    drop(b);
    drop(c);

    // One external root into the cycle: many ticks, no finalization.
    gc::collect(10_000);
    assert_eq!(gc::num_blocks(), 3);
    assert_eq!(gc::stats().components_reclaimed, 0);
    gc::check_invariants();

    drop(a);
    drain(64);
    assert_eq!(gc::num_blocks(), 0);
}

#[test]
fn self_loop_is_reclaimed() {
    let _session = Session::new(seeded(13));

    {
        let mut a = new_node();
        let own = a.clone();
        a.next.set(&own); // a → a, recorded as a heap edge of a
    }

    drain(64);
    assert_eq!(gc::num_blocks(), 0);
    assert_eq!(gc::stats().last_component_blocks, 1);
}

#[test]
fn touching_a_visited_block_aborts_the_search() {
    // Effort zero so allocations never tick the machine on their own.
    let _session = Session::new(GcConfig {
        effort: 0.0,
        ..seeded(14)
    });

    // Chain rooted at one end: a → b → c, external handle on a only. A
    // search seeded at b or c climbs inbound edges toward a and is still
    // mid-flight after its first expansion; one seeded at a meets the
    // root edge immediately and falls into Clear.
    let mut a = new_node();
    let mut b = new_node();
    let c = new_node();
    a.next.set(&b);
    b.next.set(&c);
    drop(b);
    drop(c);

    let mut armed = false;
    for _ in 0..100 {
        gc::collect(2); // seed a search, expand one edge
        if gc::current_phase() == GcPhase::Search {
            armed = true;
            break;
        }
        // The search met the root at once; let the Clear sweep finish and
        // reseed.
        while gc::current_phase() == GcPhase::Clear {
            gc::collect(1);
        }
    }
    assert!(armed, "no search got past its first edge");

    // The second list node is marked visited in every armed case.
    // Reassigning a field that routes through it must abandon the search.
    let before = gc::stats().searches_aborted;
    let fresh = new_node();
    a.next.next.set(&fresh);
    assert_eq!(gc::current_phase(), GcPhase::Clear);
    assert_eq!(gc::stats().searches_aborted, before + 1);

    // Clearing leaves the touched component alive and unmarked. (The
    // retargeting orphaned c, which may be reclaimed on a later search.)
    gc::collect(32);
    gc::check_invariants();
    assert_eq!(a.next.next, fresh);
    assert!(gc::num_blocks() >= 3);
}

#[test]
fn churn_stays_bounded_and_leaks_nothing() {
    const ITERATIONS: usize = 10_000;
    const LIST_LEN: usize = 10;
    const TARGET_ROOTS: usize = 100;

    let (alloc, outstanding) = CountingAllocator::with_count();
    let _session = Session::new(GcConfig {
        allocator: Box::new(alloc),
        ..seeded(15)
    });

    let mut retain_rng = 0x2545f4914f6cdd1du64;
    let mut rand_below = move |n: usize| {
        retain_rng ^= retain_rng << 13;
        retain_rng ^= retain_rng >> 7;
        retain_rng ^= retain_rng << 17;
        (retain_rng % n as u64) as usize
    };

    let mut heads: Vec<Ref<Node>> = Vec::new();
    for i in 0..ITERATIONS {
        let mut head = Ref::<Node>::new();
        for _ in 0..LIST_LEN {
            let mut node = new_node();
            node.next.set(&head);
            head = node;
        }
        heads.push(head);

        for _ in 0..2 {
            let r = rand_below(2 * TARGET_ROOTS);
            if r < heads.len() {
                heads.swap_remove(r);
            }
        }

        if i % 1000 == 0 {
            // Waste must stay within a small multiple of the working set.
            assert!(
                gc::num_blocks() <= 20_000,
                "unbounded growth: {} live blocks at iteration {i}",
                gc::num_blocks()
            );
            gc::check_invariants();
        }
    }

    let reachable = heads.len() * LIST_LEN;
    assert!(gc::num_blocks() >= reachable);

    heads.clear();
    drain(1024);
    assert_eq!(gc::num_blocks(), 0);

    gc::finish();
    assert_eq!(outstanding.get(), 0);
}

#[test]
fn effort_zero_defers_all_collection_to_shutdown() {
    const N: usize = 500;

    let (alloc, outstanding) = CountingAllocator::with_count();
    let _session = Session::new(GcConfig {
        effort: 0.0,
        allocator: Box::new(alloc),
        ..seeded(16)
    });

    for i in 0..N {
        let _dropped = new_node();
        assert_eq!(gc::num_blocks(), i + 1);
    }
    assert_eq!(gc::stats().components_reclaimed, 0);
    assert_eq!(outstanding.get(), N as i64);

    gc::finish();
    assert_eq!(outstanding.get(), 0);
}

#[test]
fn destructors_run_before_any_storage_is_freed() {
    struct Probe {
        tag: u64,
        sibling: Ref<Probe>,
        expect_sibling: Option<u64>,
        finalized: Rc<Cell<u32>>,
    }

    impl Drop for Probe {
        fn drop(&mut self) {
            // Blocks torn down earlier in the sweep keep their storage
            // until every destructor has run, so this read is always
            // backed by live memory.
            if let Some(expected) = self.expect_sibling {
                assert_eq!(self.sibling.tag, expected);
            }
            self.finalized.set(self.finalized.get() + 1);
        }
    }

    let (alloc, outstanding) = CountingAllocator::with_count();
    let finalized = Rc::new(Cell::new(0u32));

    {
        let _session = Session::new(GcConfig {
            allocator: Box::new(alloc),
            ..seeded(17)
        });

        // Shutdown finalizes in allocation order: the first-allocated
        // probe's destructor runs while the second is still intact, so
        // only the first may peek at its sibling.
        let first = Rc::clone(&finalized);
        let mut a = Ref::make_with(|obj| Probe {
            tag: 1,
            sibling: obj.field(),
            expect_sibling: Some(2),
            finalized: first,
        });
        let second = Rc::clone(&finalized);
        let b = Ref::make_with(|obj| Probe {
            tag: 2,
            sibling: obj.field(),
            expect_sibling: None,
            finalized: second,
        });
        a.sibling.set(&b);
        // Session drop calls finish(): every destructor, then every free.
    }

    assert_eq!(finalized.get(), 2);
    assert_eq!(outstanding.get(), 0);
}

#[test]
fn link_count_matches_live_references() {
    let _session = Session::new(seeded(18));

    let mut roots: Vec<Ref<Node>> = Vec::new();
    for i in 0..50 {
        roots.push(new_node());
        if i % 2 == 0 {
            let last = roots.len() - 1;
            let target = roots[(i / 2) % roots.len()].clone();
            roots[last].next.set(&target);
        }
        if i % 7 == 0 && !roots.is_empty() {
            roots.swap_remove(i % roots.len());
        }
        gc::collect(8);
        // Each block owns exactly one field edge; each handle owns one
        // root edge.
        assert_eq!(gc::num_links(), gc::num_blocks() + roots.len());
        gc::check_invariants();
    }
}
