//! Collector configuration.

use std::fmt;

use crate::alloc::{HostAllocator, SystemAllocator};

/// Hook invoked with the number of blocks in a just-detected garbage
/// component, immediately before finalization of that component begins.
pub type ReclaimHook = Box<dyn FnMut(usize)>;

/// Configuration handed to [`crate::init_with`].
pub struct GcConfig {
    /// Pacing multiplier: how much collection work runs per allocation.
    /// Larger values keep waste lower at the cost of allocation latency;
    /// zero disables paced collection entirely. Default: 1.0.
    pub effort: f64,

    /// Seed for the search RNG. Pinning it makes the choice of search
    /// candidates reproducible, which the scenario tests rely on.
    /// Default: seeded from the clock.
    pub seed: Option<u64>,

    /// Source of block storage. Default: the process allocator.
    pub allocator: Box<dyn HostAllocator>,

    /// Reclamation report hook. Default: none.
    pub on_reclaim: Option<ReclaimHook>,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            effort: 1.0,
            seed: None,
            allocator: Box::new(SystemAllocator),
            on_reclaim: None,
        }
    }
}

impl fmt::Debug for GcConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GcConfig")
            .field("effort", &self.effort)
            .field("seed", &self.seed)
            .field("on_reclaim", &self.on_reclaim.is_some())
            .finish_non_exhaustive()
    }
}
