//! Reductions up a node tree rooted at the reduction's root.
//!
//! Each node combines its own contribution with those of its children, in
//! whatever order they arrive, and passes one partial result to its parent.
//! Partials travel packed and are combined through the registered operator,
//! so nodes never need the value type to route them.

use rkyv::{Archive, Deserialize, Serialize};
use tracing::trace;

use crate::{
    callback::{Callback, Finish},
    collection::{CollectionProxy, Element, Index},
    collective::tree,
    fatal,
    messaging::pack_or_die,
    payload::Payload,
    registry::{HandlerId, ReduceOp},
    runtime::Runtime,
    termination::epoch::EpochId,
    NodeId,
};

#[derive(Archive, Serialize, Deserialize, Debug)]
#[archive(check_bytes)]
pub(crate) struct ReduceUp {
    seq: u64,
    root: NodeId,
    op: u64,
    value: Option<Vec<u8>>,
}

#[derive(Default)]
pub(crate) struct ReduceState {
    partial: Option<Vec<u8>>,
    children: usize,
    /// The epoch of the local contribution, once made.
    local: Option<EpochId>,
    then: Option<Finish>,
}

impl Runtime {
    /// Combines `value` from every node with `op` and runs `then` on `root`
    /// with the result. Every node calls this in the same order; `then` is
    /// ignored everywhere but on `root`.
    pub fn reduce<T, F>(&mut self, root: NodeId, op: ReduceOp<T>, value: T, then: F)
    where
        T: Payload,
        F: FnOnce(&mut Runtime, T) + Send + 'static,
    {
        self.reduce_to(root, op, value, Callback::local(then));
    }

    /// Like [`Runtime::reduce`], with the result handed to `callback` on
    /// `root`.
    pub fn reduce_to<T: Payload>(
        &mut self,
        root: NodeId,
        op: ReduceOp<T>,
        value: T,
        callback: Callback<T>,
    ) {
        self.reduce_packed(root, op.id(), Some(pack_or_die(&value)), callback.into_finish());
    }

    /// Reduces one value per element of a collection. Each node first folds
    /// the values of its local elements, then joins the node reduction. A
    /// reduction over no elements at all never calls `then`.
    pub fn reduce_collection<E, T, V, F>(
        &mut self,
        proxy: CollectionProxy,
        root: NodeId,
        op: ReduceOp<T>,
        value: V,
        then: F,
    ) where
        E: Element,
        T: Payload,
        V: FnMut(&Index, &mut E) -> T,
        F: FnOnce(&mut Runtime, T) + Send + 'static,
    {
        self.reduce_collection_to(proxy, root, op, value, Callback::local(then));
    }

    pub fn reduce_collection_to<E, T, V>(
        &mut self,
        proxy: CollectionProxy,
        root: NodeId,
        op: ReduceOp<T>,
        mut value: V,
        callback: Callback<T>,
    ) where
        E: Element,
        T: Payload,
        V: FnMut(&Index, &mut E) -> T,
    {
        let mut local: Option<Vec<u8>> = None;
        for index in self.local_indices(proxy) {
            let v = match self.local_element::<E>(proxy, index) {
                Some(elem) => value(&index, elem),
                None => fatal!("{} of {:?} is busy or of another type", index, proxy),
            };
            local = Some(self.combine_packed(op.id(), local, pack_or_die(&v)));
        }
        self.reduce_packed(root, op.id(), local, callback.into_finish());
    }

    fn combine_packed(&self, op: HandlerId, acc: Option<Vec<u8>>, next: Vec<u8>) -> Vec<u8> {
        match acc {
            None => next,
            Some(acc) => match self.registry().combine(op)(&acc, &next) {
                Ok(combined) => combined,
                Err(e) => fatal!("reduce operator {:?} failed: {}", op, e),
            },
        }
    }

    fn reduce_packed(&mut self, root: NodeId, op: HandlerId, value: Option<Vec<u8>>, then: Finish) {
        if root >= self.num_nodes() {
            fatal!("reduce to node {} outside a run of {} nodes", root, self.num_nodes());
        }
        self.collectives.next_reduce += 1;
        let seq = self.collectives.next_reduce;
        let epoch = self.current_epoch();
        let me = self.this_node();
        if me == root {
            // held open until the result is delivered
            self.produce(epoch, 1);
        }
        let state = self.collectives.reductions.entry(seq).or_default();
        let acc = state.partial.take();
        state.local = Some(epoch);
        if me == root {
            state.then = Some(then);
        }
        let partial = match value {
            Some(value) => Some(self.combine_packed(op, acc, value)),
            None => acc,
        };
        self.reduce_store(seq, partial);
        self.reduce_check(seq, root, op);
    }

    fn reduce_store(&mut self, seq: u64, partial: Option<Vec<u8>>) {
        if let Some(state) = self.collectives.reductions.get_mut(&seq) {
            state.partial = partial;
        }
    }

    fn reduce_check(&mut self, seq: u64, root: NodeId, op: HandlerId) {
        let me = self.this_node();
        let children = tree::node_children(root, me, self.num_nodes(), self.config.tree_arity).len();
        let ready = self
            .collectives
            .reductions
            .get(&seq)
            .map_or(false, |s| s.local.is_some() && s.children == children);
        if !ready {
            return;
        }
        let state = match self.collectives.reductions.remove(&seq) {
            Some(state) => state,
            None => return,
        };
        let epoch = state.local.unwrap_or(EpochId::GLOBAL);
        match tree::node_parent(root, me, self.num_nodes(), self.config.tree_arity) {
            Some(parent) => {
                trace!("reduction {} passes its partial to {}", seq, parent);
                let up = self.sys().reduce_up;
                self.send_in(
                    epoch,
                    parent,
                    up,
                    ReduceUp {
                        seq,
                        root,
                        op: op.raw(),
                        value: state.partial,
                    },
                );
            }
            None => {
                trace!("reduction {} complete", seq);
                if let Some(then) = state.then {
                    self.push_epoch(epoch);
                    then(self, state.partial);
                    self.pop_epoch();
                }
                self.consume(epoch, 1);
            }
        }
    }
}

pub(crate) fn on_reduce_up(rt: &mut Runtime, from: NodeId, msg: ReduceUp) {
    trace!("reduction {} partial from {}", msg.seq, from);
    let op = HandlerId::from_raw(msg.op);
    let state = rt.collectives.reductions.entry(msg.seq).or_default();
    state.children += 1;
    let acc = state.partial.take();
    let partial = match msg.value {
        Some(value) => Some(rt.combine_packed(op, acc, value)),
        None => acc,
    };
    rt.reduce_store(msg.seq, partial);
    rt.reduce_check(msg.seq, msg.root, op);
}
