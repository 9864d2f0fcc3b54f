//! Scatter: the root splits one buffer per node down a k-ary tree.

use rkyv::{Archive, Deserialize, Serialize};
use tracing::trace;

use crate::{
    collective::tree,
    fatal,
    messaging::{
        envelope::{Envelope, Target},
        pack_or_die,
    },
    payload::Payload,
    registry::{Handler, HandlerId},
    runtime::Runtime,
    NodeId,
};

#[derive(Archive, Serialize, Deserialize, Debug)]
#[archive(check_bytes)]
pub(crate) struct ScatterDown {
    root: NodeId,
    handler: u64,
    /// Packed slices of every node in the receiver's subtree, receiver
    /// included.
    slices: Vec<Slice>,
}

#[derive(Archive, Serialize, Deserialize, Debug)]
#[archive(check_bytes)]
pub(crate) struct Slice {
    node: NodeId,
    bytes: Vec<u8>,
}

impl Runtime {
    /// Delivers `slices[k]` to `handler` on node `k`, fanning out from this
    /// node along a tree of `scatter_arity`.
    pub fn scatter<T: Payload>(&mut self, slices: Vec<T>, handler: Handler<T>) {
        if slices.len() != self.num_nodes() as usize {
            fatal!(
                "scatter of {} slices over {} nodes",
                slices.len(),
                self.num_nodes()
            );
        }
        let slices = slices
            .iter()
            .enumerate()
            .map(|(node, slice)| Slice {
                node: node as NodeId,
                bytes: pack_or_die(slice),
            })
            .collect();
        let scatter = self.sys().scatter;
        let me = self.this_node();
        self.send(
            me,
            scatter,
            ScatterDown {
                root: me,
                handler: handler.id().raw(),
                slices,
            },
        );
    }
}

pub(crate) fn on_scatter(rt: &mut Runtime, _: NodeId, msg: ScatterDown) {
    let me = rt.this_node();
    let (n, arity) = (rt.num_nodes() as usize, rt.config.scatter_arity);
    let scatter = rt.sys().scatter;
    let mut slices = msg.slices;
    for child in tree::children(msg.root as usize, me as usize, n, arity) {
        let mut below = tree::subtree(msg.root as usize, child, n, arity);
        below.push(child);
        let (theirs, rest): (Vec<_>, Vec<_>) = slices
            .into_iter()
            .partition(|slice| below.contains(&(slice.node as usize)));
        slices = rest;
        trace!("scatter {} slices to {}", theirs.len(), child);
        rt.send(
            child as NodeId,
            scatter,
            ScatterDown {
                root: msg.root,
                handler: msg.handler,
                slices: theirs,
            },
        );
    }
    let mine = match slices.into_iter().find(|slice| slice.node == me) {
        Some(slice) => slice.bytes,
        None => fatal!("scatter from {} carried no slice for node {}", msg.root, me),
    };
    // delivered as if the root had sent it directly
    let env = Envelope::new(HandlerId::from_raw(msg.handler), msg.root, rt.current_epoch(), Target::Node);
    rt.post(me, env, mine);
}
