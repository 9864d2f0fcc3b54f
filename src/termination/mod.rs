//! Epoch termination detection.
//!
//! Collective epochs are created by every node in the same order and
//! detected with four-counter waves over a spanning tree rooted at node 0.
//! Rooted epochs belong to the node that created them and are detected with
//! Dijkstra-Scholten acknowledgements. Both kinds count every tracked message
//! once when it is sent and once after its handler ran; the global epoch
//! counts everything.

pub(crate) mod ds;
pub mod epoch;
pub(crate) mod wave;
pub(crate) mod window;

use std::mem;

use hashbrown::{HashMap, HashSet};
use rkyv::{Archive, Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::{
    collective::tree,
    fatal,
    runtime::{Action, Runtime},
    Error, NodeId,
};

use self::{
    ds::{DsState, DsStep},
    epoch::{EpochCategory, EpochId},
    wave::{WaveState, WaveStep},
    window::Terminated,
};

#[derive(Default)]
pub(crate) struct TermState {
    waves: HashMap<EpochId, WaveState>,
    ds: HashMap<EpochId, DsState>,
    /// Continuations with the epoch that was current when they were added
    /// and whether they hold it open.
    actions: HashMap<EpochId, Vec<(EpochId, bool, Action)>>,
    terminated: Terminated,
    stack: Vec<EpochId>,
    next_collective: u32,
    /// Per category, so each terminated window fills without gaps.
    next_rooted: [u32; 2],
    /// Remote rooted epochs whose root was asked to report termination.
    inquired: HashSet<EpochId>,
    /// Waves whose counts did not move, restarted once the node goes idle.
    parked: Vec<(EpochId, u64)>,
}

impl TermState {
    pub fn has_parked_waves(&self) -> bool {
        !self.parked.is_empty()
    }
}

#[derive(Archive, Serialize, Deserialize, Debug)]
#[archive(check_bytes)]
pub(crate) struct WaveCounter {
    epoch: EpochId,
    prod: u64,
    cons: u64,
}

#[derive(Archive, Serialize, Deserialize, Debug)]
#[archive(check_bytes)]
pub(crate) struct WaveContinue {
    epoch: EpochId,
    wave: u64,
}

#[derive(Archive, Serialize, Deserialize, Debug)]
#[archive(check_bytes)]
pub(crate) struct EpochMsg {
    epoch: EpochId,
}

#[derive(Archive, Serialize, Deserialize, Debug)]
#[archive(check_bytes)]
pub(crate) struct DsAck {
    epoch: EpochId,
    count: u64,
}

impl Runtime {
    /// The innermost epoch of the epoch stack, or the global epoch.
    pub fn current_epoch(&self) -> EpochId {
        self.term.stack.last().copied().unwrap_or(EpochId::GLOBAL)
    }

    /// Makes `epoch` the context of every following send until popped.
    pub fn push_epoch(&mut self, epoch: EpochId) {
        self.term.stack.push(epoch);
    }

    pub fn pop_epoch(&mut self) -> EpochId {
        match self.term.stack.pop() {
            Some(epoch) => epoch,
            None => fatal!("epoch stack underflow on node {}", self.this_node()),
        }
    }

    /// Creates the next collective epoch. Every node must create collective
    /// epochs in the same order.
    pub fn make_epoch_collective(&mut self) -> EpochId {
        self.term.next_collective += 1;
        let epoch = EpochId::collective(self.term.next_collective);
        let children = self.wave_children();
        self.term
            .waves
            .entry(epoch)
            .or_insert_with(|| WaveState::new(children));
        self.produce(epoch, 1);
        debug!("created collective epoch {}", epoch);
        epoch
    }

    /// Creates an epoch owned by this node alone.
    pub fn make_epoch_rooted(&mut self) -> EpochId {
        self.make_rooted(EpochCategory::Plain)
    }

    pub(crate) fn make_epoch_dependent(&mut self) -> EpochId {
        self.make_rooted(EpochCategory::Dependent)
    }

    fn make_rooted(&mut self, category: EpochCategory) -> EpochId {
        let node = self.this_node();
        let seq = &mut self.term.next_rooted[category as usize];
        *seq += 1;
        let epoch = EpochId::rooted(node, *seq, category);
        self.term.ds.insert(epoch, DsState::new(true));
        self.produce(epoch, 1);
        trace!("created rooted epoch {}", epoch);
        epoch
    }

    /// Declares that this node creates no more work in `epoch` outside of
    /// message handlers. A rooted epoch is finished by its root only.
    pub fn finish_epoch(&mut self, epoch: EpochId) {
        if epoch.is_rooted() {
            if epoch.root() != Some(self.this_node()) {
                fatal!(
                    "node {} cannot finish epoch {} owned by another node",
                    self.this_node(),
                    epoch
                );
            }
        } else {
            match self.term.waves.get_mut(&epoch) {
                Some(state) if state.active => fatal!("epoch {} finished twice", epoch),
                Some(state) => state.active = true,
                None => fatal!("finishing unknown epoch {}", epoch),
            }
        }
        self.consume(epoch, 1);
    }

    /// Runs `f` inside a fresh collective epoch and finishes it.
    pub fn collective_scope(&mut self, f: impl FnOnce(&mut Runtime)) -> EpochId {
        let epoch = self.make_epoch_collective();
        self.push_epoch(epoch);
        f(self);
        self.pop_epoch();
        self.finish_epoch(epoch);
        epoch
    }

    /// Runs `f` inside a fresh rooted epoch and finishes it.
    pub fn rooted_scope(&mut self, f: impl FnOnce(&mut Runtime)) -> EpochId {
        let epoch = self.make_epoch_rooted();
        self.push_epoch(epoch);
        f(self);
        self.pop_epoch();
        self.finish_epoch(epoch);
        epoch
    }

    /// Waits until this node has observed the termination of `epoch`.
    pub async fn wait_epoch(&mut self, epoch: EpochId) -> Result<(), Error> {
        if !self.is_terminated(epoch) && epoch.root().map_or(false, |r| r != self.this_node()) {
            // registering anything asks the root to report back
            self.add_action(epoch, |_| {});
        }
        self.run_until(move |rt| rt.is_terminated(epoch)).await
    }

    /// Local work of `n` units that is not a message.
    pub fn produce(&mut self, epoch: EpochId, n: u64) {
        if epoch.is_rooted() {
            self.check_live(epoch);
            self.ds_state(epoch).self_produce(n);
        } else {
            self.wave_count(epoch, n, 0);
        }
    }

    pub fn consume(&mut self, epoch: EpochId, n: u64) {
        if epoch.is_rooted() {
            self.check_live(epoch);
            self.ds_state(epoch).self_consume(n);
            self.ds_try_last(epoch);
        } else {
            self.wave_count(epoch, 0, n);
        }
    }

    /// Whether this node has seen `epoch` terminate. For a remote rooted
    /// epoch this only turns true after an action was registered on it.
    pub fn is_terminated(&self, epoch: EpochId) -> bool {
        self.term.terminated.contains(epoch)
    }

    /// Runs `action` once `epoch` terminates, or now if it already has. The
    /// action runs with the epoch that is current at this call, which stays
    /// open until the action ran. An action added inside `epoch` itself runs
    /// under the global epoch.
    pub fn add_action<F>(&mut self, epoch: EpochId, action: F)
    where
        F: FnOnce(&mut Runtime) + Send + 'static,
    {
        if self.is_terminated(epoch) {
            action(self);
            return;
        }
        let ctx = match self.current_epoch() {
            ctx if ctx != epoch && !self.is_terminated(ctx) => ctx,
            _ => EpochId::GLOBAL,
        };
        let hold = ctx != epoch && !self.is_terminated(ctx);
        if hold {
            self.produce(ctx, 1);
        }
        self.term
            .actions
            .entry(epoch)
            .or_default()
            .push((ctx, hold, Box::new(action)));
        if let Some(root) = epoch.root() {
            if root != self.this_node() && self.term.inquired.insert(epoch) {
                let inquire = self.sys().inquire;
                self.send_in(EpochId::GLOBAL, root, inquire, EpochMsg { epoch });
            }
        }
    }

    /// Keeps `parent` alive until `child` terminates. A rooted parent must be
    /// linked on its root.
    pub fn link_child_epoch(&mut self, parent: EpochId, child: EpochId) {
        if parent.root().map_or(false, |root| root != self.this_node()) {
            fatal!(
                "epoch {} can only gain children on its root, not node {}",
                parent,
                self.this_node()
            );
        }
        self.produce(parent, 1);
        self.add_action(child, move |rt| rt.consume(parent, 1));
    }

    pub(crate) fn produce_to(&mut self, epoch: EpochId, dest: NodeId) {
        self.wave_count(EpochId::GLOBAL, 1, 0);
        if epoch.is_global() {
            return;
        }
        if epoch.is_rooted() {
            self.check_live(epoch);
            let me = self.this_node();
            self.ds_state(epoch).sent(dest, me);
        } else {
            self.wave_count(epoch, 1, 0);
        }
    }

    pub(crate) fn consume_from(&mut self, epoch: EpochId, src: NodeId) {
        if !epoch.is_global() {
            if epoch.is_rooted() {
                self.check_live(epoch);
                let me = self.this_node();
                if let Some((to, count)) = self.ds_state(epoch).processed(src, me) {
                    self.send_ds_ack(epoch, to, count);
                }
                self.ds_try_last(epoch);
            } else {
                self.wave_count(epoch, 0, 1);
            }
        }
        // global last so its wave cannot start before the epoch's own acks
        self.wave_count(EpochId::GLOBAL, 0, 1);
    }

    fn check_live(&self, epoch: EpochId) {
        if self.is_terminated(epoch) {
            fatal!(
                "node {} counted new work in epoch {} after it terminated",
                self.this_node(),
                epoch
            );
        }
    }

    fn ds_state(&mut self, epoch: EpochId) -> &mut DsState {
        let me = self.this_node();
        self.term
            .ds
            .entry(epoch)
            .or_insert_with(|| DsState::new(epoch.root() == Some(me)))
    }

    fn ds_try_last(&mut self, epoch: EpochId) {
        let (step, idle) = match self.term.ds.get_mut(&epoch) {
            Some(state) => (state.try_last(), state.is_idle()),
            None => return,
        };
        if idle {
            // a disengaged node starts over with the next message
            self.term.ds.remove(&epoch);
        }
        match step {
            DsStep::Idle => {}
            DsStep::Ack { to, count } => self.send_ds_ack(epoch, to, count),
            DsStep::Terminated => self.epoch_terminated(epoch),
        }
    }

    fn send_ds_ack(&mut self, epoch: EpochId, to: NodeId, count: u64) {
        trace!("ack {} x{} for {} to {}", epoch, count, epoch, to);
        let ack = self.sys().ds_ack;
        self.send_exempt(to, ack, DsAck { epoch, count });
    }

    fn wave_children(&self) -> usize {
        tree::node_children(0, self.this_node(), self.num_nodes(), self.config.tree_arity).len()
    }

    fn wave_count(&mut self, epoch: EpochId, prod: u64, cons: u64) {
        self.check_live(epoch);
        let children = self.wave_children();
        let state = self
            .term
            .waves
            .entry(epoch)
            .or_insert_with(|| WaveState::new(children));
        state.l_prod += prod;
        state.l_cons += cons;
        self.maybe_propagate(epoch);
    }

    fn maybe_propagate(&mut self, epoch: EpochId) {
        let is_root = self.this_node() == 0;
        let (step, constant_waves) = match self.term.waves.get_mut(&epoch) {
            Some(state) => (state.step(is_root), state.constant_waves),
            None => return,
        };
        match step {
            WaveStep::Idle => {}
            WaveStep::Report { prod, cons } => {
                let parent = match tree::node_parent(
                    0,
                    self.this_node(),
                    self.num_nodes(),
                    self.config.tree_arity,
                ) {
                    Some(parent) => parent,
                    None => fatal!("wave report on the root of the wave tree"),
                };
                let counter = self.sys().wave_counter;
                self.send_exempt(parent, counter, WaveCounter { epoch, prod, cons });
            }
            WaveStep::Terminated => {
                debug!("detected termination of epoch {}", epoch);
                let terminated = self.sys().wave_terminated;
                self.broadcast_exempt(terminated, EpochMsg { epoch });
            }
            WaveStep::Continue { wave, constant } => {
                if constant {
                    if constant_waves % self.config.hang_waves.max(1) == 0 {
                        warn!(
                            "epoch {} made no progress for {} waves, totals {:?}",
                            epoch,
                            constant_waves,
                            self.term.waves.get(&epoch).map(|s| s.totals())
                        );
                    }
                    self.term.parked.push((epoch, wave));
                } else {
                    self.launch_wave(epoch, wave);
                }
            }
        }
    }

    fn launch_wave(&mut self, epoch: EpochId, wave: u64) {
        trace!("wave {} of epoch {}", wave, epoch);
        let cont = self.sys().wave_continue;
        self.broadcast_exempt(cont, WaveContinue { epoch, wave });
    }

    pub(crate) fn resume_parked_waves(&mut self) {
        for (epoch, wave) in mem::take(&mut self.term.parked) {
            if !self.is_terminated(epoch) {
                self.launch_wave(epoch, wave);
            }
        }
    }

    pub(crate) fn epoch_terminated(&mut self, epoch: EpochId) {
        let me = self.this_node();
        if !self.term.terminated.insert(epoch, me) {
            return;
        }
        self.term.waves.remove(&epoch);
        self.term.ds.remove(&epoch);
        self.term.inquired.remove(&epoch);
        debug!("epoch {} terminated", epoch);
        if epoch.is_global() {
            self.shutting_down = true;
        }
        for (ctx, hold, action) in self.term.actions.remove(&epoch).unwrap_or_default() {
            self.push_epoch(ctx);
            action(self);
            self.pop_epoch();
            if hold {
                self.consume(ctx, 1);
            }
        }
    }

    pub(crate) fn report_hang(&self) {
        let mut pending: Vec<String> = self
            .term
            .waves
            .iter()
            .filter(|(epoch, _)| !epoch.is_global())
            .map(|(epoch, state)| {
                format!(
                    "{} (finished {}, prod {} cons {})",
                    epoch, state.active, state.l_prod, state.l_cons
                )
            })
            .chain(
                self.term
                    .ds
                    .iter()
                    .filter(|(_, state)| state.is_busy())
                    .map(|(epoch, state)| format!("{} ({})", epoch, state.describe())),
            )
            .collect();
        if pending.is_empty() {
            return;
        }
        pending.sort();
        pending.truncate(8);
        warn!(
            "node {} idle at {} with unterminated epochs: {}",
            self.this_node(),
            chrono::Utc::now().format("%H:%M:%S%.3f"),
            pending.join(", ")
        );
    }
}

pub(crate) fn on_wave_counter(rt: &mut Runtime, _: NodeId, msg: WaveCounter) {
    let children = rt.wave_children();
    rt.term
        .waves
        .entry(msg.epoch)
        .or_insert_with(|| WaveState::new(children))
        .child_report(msg.prod, msg.cons);
    rt.maybe_propagate(msg.epoch);
}

pub(crate) fn on_wave_continue(rt: &mut Runtime, _: NodeId, msg: WaveContinue) {
    if let Some(state) = rt.term.waves.get_mut(&msg.epoch) {
        state.start_wave(msg.wave);
        rt.maybe_propagate(msg.epoch);
    }
}

pub(crate) fn on_wave_terminated(rt: &mut Runtime, _: NodeId, msg: EpochMsg) {
    rt.epoch_terminated(msg.epoch);
}

pub(crate) fn on_ds_ack(rt: &mut Runtime, from: NodeId, msg: DsAck) {
    match rt.term.ds.get_mut(&msg.epoch) {
        Some(state) => state.acked(msg.count),
        None => fatal!("acknowledgement from {} for unknown epoch {}", from, msg.epoch),
    }
    rt.ds_try_last(msg.epoch);
}

pub(crate) fn on_inquire(rt: &mut Runtime, from: NodeId, msg: EpochMsg) {
    let epoch = msg.epoch;
    if !rt.term.ds.contains_key(&epoch) && !rt.is_terminated(epoch) {
        fatal!("node {} asked about unknown epoch {}", from, epoch);
    }
    // the action holds the global epoch until the answer is out
    let reply = rt.sys().inquire_reply;
    rt.add_action(epoch, move |rt| {
        rt.send_in(EpochId::GLOBAL, from, reply, EpochMsg { epoch });
    });
}

pub(crate) fn on_inquire_reply(rt: &mut Runtime, _: NodeId, msg: EpochMsg) {
    rt.epoch_terminated(msg.epoch);
}
