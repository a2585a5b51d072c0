//! Stress harness for the riptide collector.
//!
//! Builds short linked lists of managed nodes as fast as it can, keeps a
//! bounded random sample of list heads alive, and lets the collector chase
//! the rest. Reports reachable vs. total blocks (the difference is the
//! collector's current waste) at a fixed interval, and verifies at exit
//! that every allocation was handed back.

use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Result;
use clap::Parser;
use riptide_gc::{self as gc, CountingAllocator, GcConfig, Ref};
use tracing_subscriber::filter::EnvFilter;

#[derive(Parser)]
#[command(name = "riptide", version, about = "Back-tracing GC stress harness")]
struct Cli {
    /// Number of lists to build.
    #[arg(long, default_value_t = 1_000_000)]
    iterations: usize,

    /// Nodes per list.
    #[arg(long, default_value_t = 10)]
    list_len: usize,

    /// Approximate number of list heads kept alive.
    #[arg(long, default_value_t = 100)]
    target_roots: usize,

    /// Collector effort multiplier.
    #[arg(long, default_value_t = 1.0)]
    effort: f64,

    /// Print a progress line every N iterations.
    #[arg(long, default_value_t = 1000)]
    report_interval: usize,

    /// Seed for the retention choices (and the collector's search RNG).
    #[arg(long)]
    seed: Option<u64>,
}

struct Node {
    next: Ref<Node>,
}

/// xorshift64, good enough for retention choices.
struct Rand(u64);

impl Rand {
    fn below(&mut self, n: usize) -> usize {
        self.0 ^= self.0 << 13;
        self.0 ^= self.0 >> 7;
        self.0 ^= self.0 << 17;
        (self.0 % n as u64) as usize
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let seed = cli.seed.unwrap_or_else(|| {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0x2545f4914f6cdd1d)
    });
    let mut rand = Rand(seed | 1);

    let (alloc, outstanding) = CountingAllocator::with_count();
    gc::init_with(GcConfig {
        effort: cli.effort,
        seed: Some(seed),
        allocator: Box::new(alloc),
        ..GcConfig::default()
    });

    let mut heads: Vec<Ref<Node>> = Vec::new();
    for i in 0..cli.iterations {
        let mut head = Ref::<Node>::new();
        for _ in 0..cli.list_len {
            let mut node = Ref::make_with(|obj| Node { next: obj.field() });
            node.next.set(&head);
            head = node;
        }
        heads.push(head);

        // Random retention: on average, keep ~target_roots heads alive.
        for _ in 0..2 {
            let r = rand.below(2 * cli.target_roots);
            if r < heads.len() {
                heads.swap_remove(r);
            }
        }

        if i % cli.report_interval == 0 {
            let reachable = heads.len() * cli.list_len;
            let total = gc::num_blocks();
            let waste = if reachable > 0 {
                (total - reachable) as f64 * 100.0 / reachable as f64
            } else {
                0.0
            };
            println!(
                "iteration: {i}\treachable: {reachable}\ttotal: {total}\twaste: {waste:.1}%"
            );
        }
    }

    heads.clear();
    gc::finish();

    let leaked = outstanding.get();
    if leaked != 0 {
        anyhow::bail!("cleanup failed, leaked {leaked} blocks");
    }
    println!("done: every block was finalized and freed");
    Ok(())
}
