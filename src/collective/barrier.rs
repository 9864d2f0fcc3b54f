//! Barriers over the node tree rooted at node 0.
//!
//! A node reports to its parent once it arrived itself and heard from every
//! child; the root then broadcasts the release. Barrier traffic is never
//! counted by termination detection, so barriers keep working while the
//! global epoch is being torn down.

use rkyv::{Archive, Deserialize, Serialize};
use tracing::trace;

use crate::{
    collective::tree,
    fatal,
    runtime::{Action, Runtime},
    termination::epoch::EpochId,
    Error, NodeId,
};

/// Unnamed barriers are numbered per node; named ones carry an application
/// id and may be reused once released.
#[derive(Archive, Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[archive(check_bytes)]
pub struct BarrierKey {
    named: bool,
    id: u64,
}

#[derive(Archive, Serialize, Deserialize, Debug)]
#[archive(check_bytes)]
pub(crate) struct BarrierMsg {
    key: BarrierKey,
}

#[derive(Default)]
pub(crate) struct BarrierState {
    arrived: bool,
    children: usize,
    reported: bool,
    waiters: Vec<(EpochId, Action)>,
}

impl Runtime {
    /// Waits until every node reached this barrier.
    pub async fn barrier(&mut self) -> Result<(), Error> {
        let key = self.next_barrier();
        self.wait_barrier(key).await
    }

    /// Waits on the barrier named `id`. Every node must use the same names in
    /// the same order.
    pub async fn barrier_named(&mut self, id: u64) -> Result<(), Error> {
        self.wait_barrier(BarrierKey { named: true, id }).await
    }

    /// Arrives at the next barrier and runs `then` once it is released. The
    /// current epoch stays open until `then` ran.
    pub fn barrier_then<F>(&mut self, then: F)
    where
        F: FnOnce(&mut Runtime) + Send + 'static,
    {
        let key = self.next_barrier();
        let epoch = self.current_epoch();
        self.produce(epoch, 1);
        self.collectives
            .barriers
            .entry(key)
            .or_default()
            .waiters
            .push((epoch, Box::new(then)));
        self.arrive(key);
    }

    fn next_barrier(&mut self) -> BarrierKey {
        self.collectives.next_barrier += 1;
        BarrierKey {
            named: false,
            id: self.collectives.next_barrier,
        }
    }

    async fn wait_barrier(&mut self, key: BarrierKey) -> Result<(), Error> {
        self.arrive(key);
        self.run_until(move |rt| !rt.collectives.barriers.contains_key(&key)).await
    }

    fn arrive(&mut self, key: BarrierKey) {
        let state = self.collectives.barriers.entry(key).or_default();
        if state.arrived {
            fatal!("node {} reached barrier {:?} twice", self.this_node(), key);
        }
        state.arrived = true;
        trace!("arrived at barrier {:?}", key);
        self.barrier_check(key);
    }

    fn barrier_check(&mut self, key: BarrierKey) {
        let me = self.this_node();
        let children = tree::node_children(0, me, self.num_nodes(), self.config.tree_arity).len();
        let state = match self.collectives.barriers.get_mut(&key) {
            Some(state) => state,
            None => return,
        };
        if !state.arrived || state.reported || state.children < children {
            return;
        }
        state.reported = true;
        match tree::node_parent(0, me, self.num_nodes(), self.config.tree_arity) {
            Some(parent) => {
                let up = self.sys().barrier_up;
                self.send_exempt(parent, up, BarrierMsg { key });
            }
            None => {
                let down = self.sys().barrier_down;
                self.broadcast_exempt(down, BarrierMsg { key });
            }
        }
    }
}

pub(crate) fn on_barrier_up(rt: &mut Runtime, from: NodeId, msg: BarrierMsg) {
    trace!("barrier {:?} reported by {}", msg.key, from);
    rt.collectives.barriers.entry(msg.key).or_default().children += 1;
    rt.barrier_check(msg.key);
}

pub(crate) fn on_barrier_down(rt: &mut Runtime, _: NodeId, msg: BarrierMsg) {
    let state = match rt.collectives.barriers.remove(&msg.key) {
        Some(state) => state,
        None => fatal!("release of barrier {:?} that node {} never reached", msg.key, rt.this_node()),
    };
    trace!("barrier {:?} released", msg.key);
    for (epoch, then) in state.waiters {
        rt.push_epoch(epoch);
        then(rt);
        rt.pop_epoch();
        rt.consume(epoch, 1);
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            atomic::{AtomicU32, Ordering},
            Arc,
        },
        time::Duration,
    };

    use rand::Rng;

    use crate::{world, RuntimeConfig};

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn nobody_leaves_before_everybody_arrived() {
        world::init_test_tracing();
        let arrived = Arc::new(AtomicU32::new(0));
        let count = arrived.clone();
        world::launch(
            6,
            RuntimeConfig::builder().tree_arity(3).build(),
            |_| (),
            move |mut rt, _| {
                let count = count.clone();
                async move {
                    rt.initialize().await?;
                    for round in 1..=3u32 {
                        let delay = rand::thread_rng().gen_range(0..5);
                        tokio::time::sleep(Duration::from_millis(delay)).await;
                        count.fetch_add(1, Ordering::SeqCst);
                        rt.barrier().await?;
                        assert!(count.load(Ordering::SeqCst) >= 6 * round);
                        rt.barrier_named(7).await?;
                    }
                    rt.finalize().await
                }
            },
        )
        .await
        .unwrap();
        assert_eq!(arrived.load(Ordering::SeqCst), 18);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn continuations_run_on_release() {
        world::init_test_tracing();
        let released = Arc::new(AtomicU32::new(0));
        let count = released.clone();
        world::launch(
            4,
            RuntimeConfig::default(),
            |_| (),
            move |mut rt, _| {
                let count = count.clone();
                async move {
                    rt.initialize().await?;
                    rt.barrier_then(move |_| {
                        count.fetch_add(1, Ordering::SeqCst);
                    });
                    // finalize cannot complete before the continuation ran
                    rt.finalize().await
                }
            },
        )
        .await
        .unwrap();
        assert_eq!(released.load(Ordering::SeqCst), 4);
    }
}
