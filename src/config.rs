use std::{path::PathBuf, time::Duration};

use typed_builder::TypedBuilder;

use crate::fatal;

/// Per-node runtime settings. Every node of a run should use the same values
/// for the tree arities, since spanning trees are computed independently on
/// each node.
#[derive(Debug, Clone, TypedBuilder)]
pub struct RuntimeConfig {
    /// Route sends to this node through the ready queue instead of running
    /// the handler inline.
    #[builder(default = true)]
    pub deferred_loopback: bool,
    /// Fan-out of the trees used by broadcast, termination waves, barriers
    /// and reductions.
    #[builder(default = 2, setter(transform = |arity: usize| fan_out("tree_arity", arity)))]
    pub tree_arity: usize,
    /// Fan-out of the scatter tree.
    #[builder(default = 2, setter(transform = |arity: usize| fan_out("scatter_arity", arity)))]
    pub scatter_arity: usize,
    /// Deepest allowed nesting of [`crate::Runtime::drain_until`].
    #[builder(default = 64)]
    pub max_nested_waits: usize,
    /// Scheduler turns between yields back to the async executor.
    #[builder(default = 256)]
    pub yield_every: usize,
    /// Idle time after which unterminated epochs are reported.
    #[builder(default = Duration::from_secs(5))]
    pub hang_check: Duration,
    /// Number of termination waves with unchanged counts between hang
    /// reports.
    #[builder(default = 1024)]
    pub hang_waves: u64,
    /// Delay before a wave whose counts did not change is retried.
    #[builder(default = Duration::from_micros(200))]
    pub wave_backoff: Duration,
    /// Bound on how many times one message may chase a migrating element.
    #[builder(default = 16)]
    pub max_forward_hops: u8,
    /// Directory that receives one load statistics file per node at
    /// finalize.
    #[builder(default, setter(strip_option, into))]
    pub lb_stats_path: Option<PathBuf>,
    /// Compress the statistics files with zstd.
    #[builder(default = false)]
    pub lb_stats_compress: bool,
    /// Any positive value enables offloading of CPU-bound work to the
    /// blocking pool.
    #[builder(default = 0)]
    pub worker_threads: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl RuntimeConfig {
    /// Aborts on settings no run can work with. The builder rejects them
    /// already; this catches fields assigned directly.
    pub(crate) fn check(&self) {
        fan_out("tree_arity", self.tree_arity);
        fan_out("scatter_arity", self.scatter_arity);
    }
}

fn fan_out(name: &str, arity: usize) -> usize {
    if arity == 0 {
        fatal!("{} must be at least 1", name);
    }
    arity
}
