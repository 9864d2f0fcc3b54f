//! Tree collectives layered on active messages.
//!
//! Every node issues barriers, reductions and scatters in the same order, so
//! a per-node sequence number names the same operation everywhere and partial
//! results can arrive before the local call.

pub mod barrier;
pub mod reduce;
pub mod scatter;
pub mod tree;

use hashbrown::HashMap;

use self::{barrier::BarrierState, reduce::ReduceState};

#[derive(Default)]
pub(crate) struct CollectiveState {
    pub barriers: HashMap<barrier::BarrierKey, BarrierState>,
    pub next_barrier: u64,
    pub reductions: HashMap<u64, ReduceState>,
    pub next_reduce: u64,
}
