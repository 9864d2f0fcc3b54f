//! Object groups: one instance of a type per node, addressed by node.

use std::{any::Any, collections::VecDeque, fmt, marker::PhantomData, sync::Arc};

use hashbrown::HashMap;
use tracing::{debug, trace};

use crate::{
    messaging::{
        envelope::{Message, Target},
        pack_or_die,
    },
    payload::Payload,
    registry::ObjHandler,
    runtime::{Runtime, Work},
    tasks::TaskKey,
    NodeId,
};

/// Names the same object group on every node.
pub struct ObjGroupProxy<O> {
    id: u64,
    _marker: PhantomData<fn(O)>,
}

impl<O> ObjGroupProxy<O> {
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl<O> Clone for ObjGroupProxy<O> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<O> Copy for ObjGroupProxy<O> {}

impl<O> fmt::Debug for ObjGroupProxy<O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "objgroup#{}", self.id)
    }
}

#[derive(Default)]
pub(crate) struct ObjGroupState {
    objects: HashMap<u64, Box<dyn Any + Send>>,
    /// Messages for a group whose instance is busy or not created yet here.
    waiting: HashMap<u64, VecDeque<(Arc<Message>, NodeId)>>,
    next: u64,
}

impl Runtime {
    /// Creates this node's instance of a new group. Collective: every node
    /// creates its groups in the same order.
    pub fn make_objgroup<O: Send + 'static>(&mut self, value: O) -> ObjGroupProxy<O> {
        self.objgroups.next += 1;
        let id = self.objgroups.next;
        self.objgroups.objects.insert(id, Box::new(value));
        debug!("object group {} created", id);
        self.release_objgroup(id);
        ObjGroupProxy {
            id,
            _marker: PhantomData,
        }
    }

    /// Borrows this node's instance, unless one of its handlers is running.
    pub fn local_objgroup<O: Send + 'static>(&mut self, proxy: ObjGroupProxy<O>) -> Option<&mut O> {
        self.objgroups
            .objects
            .get_mut(&proxy.id)
            .and_then(|obj| obj.downcast_mut::<O>())
    }

    /// Runs `handler` against the instance on `node`.
    pub fn send_objgroup<O, T: Payload>(
        &mut self,
        proxy: ObjGroupProxy<O>,
        node: NodeId,
        handler: ObjHandler<O, T>,
        msg: T,
    ) {
        let env = self.envelope(handler.id(), self.current_epoch(), Target::ObjGroup(proxy.id));
        self.post(node, env, pack_or_die(&msg));
    }

    /// Runs `handler` against the instance on every node.
    pub fn broadcast_objgroup<O, T: Payload>(
        &mut self,
        proxy: ObjGroupProxy<O>,
        handler: ObjHandler<O, T>,
        msg: T,
    ) {
        let env = self.envelope(handler.id(), self.current_epoch(), Target::ObjGroup(proxy.id));
        self.post_broadcast(env, pack_or_die(&msg));
    }

    /// Returns whether the message was handled; a message that has to wait
    /// is consumed once it runs later.
    pub(crate) fn deliver_objgroup(&mut self, id: u64, msg: &Arc<Message>, sender: NodeId) -> bool {
        let key = TaskKey::Node {
            group: id,
            node: self.this_node(),
        };
        if self.holds_for_task(key, msg.env.epoch) {
            self.hold_for_task(key, msg.clone(), sender);
            return false;
        }
        let mut obj = match self.objgroups.objects.remove(&id) {
            Some(obj) => obj,
            None => {
                trace!("object group {} busy or not created, holding {:?}", id, msg.env.handler);
                self.objgroups
                    .waiting
                    .entry(id)
                    .or_default()
                    .push_back((msg.clone(), sender));
                return false;
            }
        };
        let thunk = self.registry().member(msg.env.handler);
        self.push_epoch(msg.env.epoch);
        thunk(self, obj.as_mut(), &msg.env, &msg.payload);
        self.pop_epoch();
        self.objgroups.objects.insert(id, obj);
        self.release_objgroup(id);
        true
    }

    fn release_objgroup(&mut self, id: u64) {
        if let Some(waiting) = self.objgroups.waiting.remove(&id) {
            for (msg, sender) in waiting {
                self.enqueue(Work::Deliver { msg, sender });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use crate::{world, NodeId, Runtime, RuntimeConfig};

    #[derive(Default)]
    struct Tally {
        seen: Vec<NodeId>,
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn broadcast_and_point_sends_reach_instances() {
        world::init_test_tracing();
        let totals = Arc::new(Mutex::new(Vec::new()));
        let out = totals.clone();
        world::launch(
            4,
            RuntimeConfig::default(),
            |reg| {
                reg.objgroup("note", |t: &mut Tally, _: &mut Runtime, from: NodeId, _: u8| {
                    t.seen.push(from)
                })
            },
            move |mut rt, note| {
                let out = out.clone();
                async move {
                    rt.initialize().await?;
                    let group = rt.make_objgroup(Tally::default());
                    let epoch = rt.collective_scope(|rt| {
                        rt.broadcast_objgroup(group, note, 0u8);
                        let next = (rt.this_node() + 1) % rt.num_nodes();
                        rt.send_objgroup(group, next, note, 0u8);
                    });
                    rt.wait_epoch(epoch).await?;
                    let me = rt.this_node();
                    let mut seen = rt.local_objgroup(group).map(|t| t.seen.clone()).unwrap_or_default();
                    seen.sort_unstable();
                    out.lock().unwrap().push((me, seen));
                    rt.finalize().await
                }
            },
        )
        .await
        .unwrap();
        let mut totals = totals.lock().unwrap().clone();
        totals.sort();
        for (node, seen) in totals {
            // every broadcast plus the ring neighbour's send
            let mut expected = vec![0, 1, 2, 3, (node + 3) % 4];
            expected.sort_unstable();
            assert_eq!(seen, expected);
        }
    }
}
