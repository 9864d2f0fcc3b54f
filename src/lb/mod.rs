//! Load balancing instrumentation.
//!
//! Every element handler is timed and every element-to-element send is
//! counted, per phase. [`Runtime::next_phase`] closes a phase; the closed
//! phases are what [`Runtime::write_lb_stats`] persists.

pub mod stats;

use std::time::Duration;

use hashbrown::HashMap;
use petgraph::{prelude::GraphMap, Directed};
use tracing::debug;

use crate::{
    collection::{CollectionProxy, ElementKey, Index},
    runtime::Runtime,
    NodeId,
};

/// What one element did during a phase.
#[derive(Clone, Debug, PartialEq)]
pub struct ElementLoad {
    pub collection: CollectionProxy,
    pub index: Index,
    pub home: NodeId,
    pub time: Duration,
    pub invocations: u64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CommEdge {
    pub bytes: u64,
    pub messages: u64,
}

/// A phase worth of measurements, keyed by element id.
#[derive(Clone, Debug)]
pub struct PhaseStats {
    pub id: u64,
    pub loads: HashMap<u64, ElementLoad>,
    pub comm: GraphMap<u64, CommEdge, Directed>,
}

impl PhaseStats {
    fn new(id: u64) -> Self {
        Self {
            id,
            loads: HashMap::new(),
            comm: GraphMap::new(),
        }
    }

    fn is_empty(&self) -> bool {
        self.loads.is_empty() && self.comm.edge_count() == 0
    }

    pub fn total_time(&self) -> Duration {
        self.loads.values().map(|l| l.time).sum()
    }
}

pub(crate) struct LbState {
    current: PhaseStats,
    closed: Vec<PhaseStats>,
}

impl Default for LbState {
    fn default() -> Self {
        Self {
            current: PhaseStats::new(0),
            closed: Vec::new(),
        }
    }
}

impl Runtime {
    /// The phase being measured.
    pub fn lb_phase(&self) -> u64 {
        self.lb.current.id
    }

    /// Measurements of the open phase.
    pub fn lb_current(&self) -> &PhaseStats {
        &self.lb.current
    }

    /// Every phase closed so far, oldest first.
    pub fn lb_history(&self) -> &[PhaseStats] {
        &self.lb.closed
    }

    /// Closes the current phase.
    pub fn next_phase(&mut self) {
        let id = self.lb.current.id + 1;
        let done = std::mem::replace(&mut self.lb.current, PhaseStats::new(id));
        debug!(
            "phase {} closed: {} elements, {:?} busy, {} edges",
            done.id,
            done.loads.len(),
            done.total_time(),
            done.comm.edge_count()
        );
        self.lb.closed.push(done);
    }

    pub(crate) fn record_load(&mut self, key: ElementKey, spent: Duration) {
        let id = self.element_id(&key);
        let home = self.home_node(key.0, key.1);
        let load = self.lb.current.loads.entry(id).or_insert_with(|| ElementLoad {
            collection: key.0,
            index: key.1,
            home,
            time: Duration::ZERO,
            invocations: 0,
        });
        load.time += spent;
        load.invocations += 1;
    }

    /// Counts a send from the running element, if any, to an element.
    pub(crate) fn record_send(&mut self, proxy: CollectionProxy, index: Index, bytes: usize) {
        let from = match self.current_element() {
            Some(key) => self.element_id(&key),
            None => return,
        };
        let to = self.element_id(&(proxy, index));
        let comm = &mut self.lb.current.comm;
        match comm.edge_weight_mut(from, to) {
            Some(edge) => {
                edge.bytes += bytes as u64;
                edge.messages += 1;
            }
            None => {
                comm.add_edge(
                    from,
                    to,
                    CommEdge {
                        bytes: bytes as u64,
                        messages: 1,
                    },
                );
            }
        }
    }

    /// The phases to persist: every closed one plus the open one if it saw
    /// any work.
    pub(crate) fn lb_phases(&self) -> Vec<&PhaseStats> {
        let mut phases: Vec<&PhaseStats> = self.lb.closed.iter().collect();
        if !self.lb.current.is_empty() {
            phases.push(&self.lb.current);
        }
        phases
    }
}
