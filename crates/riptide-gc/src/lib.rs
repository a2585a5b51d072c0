//! # riptide-gc
//!
//! A back-tracing incremental garbage collector, embedded as a library.
//!
//! Client code allocates heap objects through the collector and wires them
//! together with collector-aware references ([`Ref`]). The collector
//! reclaims object graphs that have become unreachable from any root —
//! including graphs full of reference cycles — without ever enumerating a
//! root set: it picks a candidate block at random and walks *backwards*
//! along inbound references; if the walk drains without meeting an edge
//! that originates outside the heap, the candidate's whole back-reachable
//! component is garbage.
//!
//! ## Design
//!
//! - **Incremental**: collection advances in constant-time ticks
//!   interleaved with allocations; no stop-the-world phase
//! - **Write barrier**: touching a block mid-search aborts that search, so
//!   a search never acts on stale structure
//! - **Two-phase reclaim**: all destructors of a doomed component run
//!   before any of its storage is freed
//! - **Single-threaded**: one collector per thread; references are neither
//!   `Send` nor `Sync`
//!
//! ## Example
//!
//! ```
//! use riptide_gc::{self as gc, Ref};
//!
//! struct Node {
//!     next: Ref<Node>,
//! }
//!
//! gc::init();
//! {
//!     let mut a = Ref::make_with(|obj| Node { next: obj.field() });
//!     let b = Ref::make_with(|obj| Node { next: obj.field_to(&a) });
//!     a.next.set(&b); // cycle: a → b → a
//! }
//! gc::collect(64); // both handles dropped: the cycle is reclaimed
//! assert_eq!(gc::num_blocks(), 0);
//! gc::finish();
//! ```

#![warn(clippy::all)]
#![warn(missing_docs)]

pub mod alloc;
pub mod config;

mod block;
mod collector;
mod handle;
mod link;
mod list;

pub use alloc::{CountingAllocator, HostAllocator, SystemAllocator};
pub use collector::{GcPhase, GcStats};
pub use config::{GcConfig, ReclaimHook};
pub use handle::{Anchor, Ref};

use collector::collector;

/// Create this thread's collector with the default configuration.
///
/// Panics if the collector is already initialized.
pub fn init() {
    collector().init(GcConfig::default());
}

/// Create this thread's collector with an explicit configuration.
///
/// Panics if the collector is already initialized.
pub fn init_with(config: GcConfig) {
    collector().init(config);
}

/// Finalize then free every live block and shut the collector down.
///
/// Destructors for all blocks run before any storage is released, so a
/// destructor may still dereference sibling blocks. Panics if the
/// collector is not initialized.
pub fn finish() {
    collector().finish();
}

/// True between [`init`] and [`finish`].
pub fn is_initialized() -> bool {
    collector().is_active()
}

/// Number of live managed blocks.
pub fn num_blocks() -> usize {
    collector().num_blocks()
}

/// Number of live references (edges), attached or not.
pub fn num_links() -> usize {
    collector().num_links()
}

/// The pacing multiplier.
pub fn effort() -> f64 {
    collector().effort()
}

/// Set the pacing multiplier. Zero disables paced collection; allocations
/// then do no collection work at all.
pub fn set_effort(effort: f64) {
    collector().set_effort(effort);
}

/// Collector counters.
pub fn stats() -> GcStats {
    collector().stats()
}

/// The phase the collector is currently in.
pub fn current_phase() -> GcPhase {
    collector().current_phase()
}

/// Run up to `ticks` collection ticks immediately, without allocating.
///
/// Each tick is a constant-time unit of work; a drained heap makes the
/// remaining ticks no-ops. Panics if the collector is not initialized.
pub fn collect(ticks: usize) {
    let gc = collector();
    assert!(gc.is_active(), "collector is not initialized");
    for _ in 0..ticks {
        gc.step();
    }
}

/// Assert the structural invariants of the live graph.
///
/// Linear in blocks plus edges; intended for tests and debugging sweeps.
pub fn check_invariants() {
    collector().check_invariants();
}
