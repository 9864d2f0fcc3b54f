//! Active messages: typed sends, spanning-tree broadcasts and local dispatch.
//!
//! Every tracked transmission is produced against its epoch (and the global
//! epoch) right before it leaves and consumed on the receiving node after its
//! handler returned. Broadcasts are forwarded down a tree rooted at the
//! sender before the local handler runs, so a node that quiesces after
//! handling a broadcast has already passed it on.

pub mod envelope;
pub mod transport;

use std::sync::Arc;

use hashbrown::HashMap;
use tracing::{debug, trace};

use crate::{
    collective::tree,
    fatal,
    payload::Payload,
    registry::{Handler, HandlerId},
    runtime::{Runtime, Work},
    termination::epoch::EpochId,
    NodeId,
};

use self::envelope::{Envelope, GroupId, Message, Target};

/// Registered node subsets for group broadcasts.
#[derive(Default)]
pub(crate) struct Groups {
    members: HashMap<GroupId, Vec<NodeId>>,
    next: GroupId,
}

pub(crate) fn pack_or_die<T: Payload>(msg: &T) -> Vec<u8> {
    match msg.pack() {
        Ok(bytes) => bytes,
        Err(e) => fatal!("{}", e),
    }
}

impl Runtime {
    pub(crate) fn envelope(&self, handler: HandlerId, epoch: EpochId, target: Target) -> Envelope {
        Envelope::new(handler, self.this_node(), epoch, target)
    }

    /// Sends `msg` to `handler` on `dest` within the current epoch.
    pub fn send<T: Payload>(&mut self, dest: NodeId, handler: Handler<T>, msg: T) {
        let epoch = self.current_epoch();
        self.send_in(epoch, dest, handler, msg);
    }

    /// Sends `msg` within an explicit epoch.
    pub fn send_in<T: Payload>(
        &mut self,
        epoch: EpochId,
        dest: NodeId,
        handler: Handler<T>,
        msg: T,
    ) {
        let env = self.envelope(handler.id(), epoch, Target::Node);
        self.post(dest, env, pack_or_die(&msg));
    }

    /// Protocol traffic that termination detection never counts.
    pub(crate) fn send_exempt<T: Payload>(&mut self, dest: NodeId, handler: Handler<T>, msg: T) {
        let mut env = self.envelope(handler.id(), EpochId::GLOBAL, Target::Node);
        env.flags.set_term_exempt(true);
        self.post(dest, env, pack_or_die(&msg));
    }

    /// Runs `handler` once on every node, this one included.
    pub fn broadcast<T: Payload>(&mut self, handler: Handler<T>, msg: T) {
        let env = self.envelope(handler.id(), self.current_epoch(), Target::Node);
        self.post_broadcast(env, pack_or_die(&msg));
    }

    pub(crate) fn broadcast_exempt<T: Payload>(&mut self, handler: Handler<T>, msg: T) {
        let mut env = self.envelope(handler.id(), EpochId::GLOBAL, Target::Node);
        env.flags.set_term_exempt(true);
        self.post_broadcast(env, pack_or_die(&msg));
    }

    /// Registers a node subset. Every node must register the same groups in
    /// the same order.
    pub fn make_group(&mut self, mut members: Vec<NodeId>) -> GroupId {
        members.sort_unstable();
        members.dedup();
        if let Some(bad) = members.iter().find(|&&m| m >= self.num_nodes()) {
            fatal!("group member {} outside a run of {} nodes", bad, self.num_nodes());
        }
        self.groups.next += 1;
        let group = self.groups.next;
        debug!("group {} = {:?}", group, members);
        self.groups.members.insert(group, members);
        group
    }

    /// Runs `handler` once on every member of `group`. The sender must be a
    /// member.
    pub fn broadcast_group<T: Payload>(&mut self, group: GroupId, handler: Handler<T>, msg: T) {
        let mut env = self.envelope(handler.id(), self.current_epoch(), Target::Node);
        env.group = Some(group);
        self.post_broadcast(env, pack_or_die(&msg));
    }

    pub(crate) fn post(&mut self, dest: NodeId, env: Envelope, payload: Vec<u8>) {
        self.transmit(dest, Arc::new(Message { env, payload }));
    }

    /// Starts a broadcast by delivering it to the tree root, this node.
    pub(crate) fn post_broadcast(&mut self, mut env: Envelope, payload: Vec<u8>) {
        env.flags.set_broadcast(true);
        if let Some(group) = env.group {
            if !self.group_members(group).contains(&self.this_node()) {
                fatal!(
                    "node {} broadcasts to group {} without being a member",
                    self.this_node(),
                    group
                );
            }
        }
        let me = self.this_node();
        self.post(me, env, payload);
    }

    fn group_members(&self, group: GroupId) -> &[NodeId] {
        match self.groups.members.get(&group) {
            Some(members) => members,
            None => fatal!("group {} is not registered on node {}", group, self.this_node()),
        }
    }

    pub(crate) fn transmit(&mut self, dest: NodeId, msg: Arc<Message>) {
        if dest >= self.num_nodes() {
            fatal!(
                "send of {:?} to node {} outside a run of {} nodes",
                msg.env.handler,
                dest,
                self.num_nodes()
            );
        }
        if !msg.env.flags.term_exempt() {
            self.produce_to(msg.env.epoch, dest);
        }
        let me = self.this_node();
        if dest == me {
            if self.config.deferred_loopback {
                self.enqueue(Work::Deliver { msg, sender: me });
            } else {
                self.deliver(msg, me);
            }
            return;
        }
        if let Err(e) = self.send_frame(dest, msg.encode()) {
            if self.shutting_down {
                debug!("dropped {:?} to {} during shutdown: {}", msg.env.handler, dest, e);
            } else {
                fatal!("send of {:?} to node {} failed: {}", msg.env.handler, dest, e);
            }
        }
    }

    pub(crate) fn deliver(&mut self, msg: Arc<Message>, sender: NodeId) {
        if msg.env.flags.broadcast() {
            self.forward_broadcast(&msg);
        }
        let handled = match msg.env.target {
            Target::Node => {
                self.invoke_call(&msg);
                true
            }
            Target::Element { .. } => self.deliver_element(&msg, sender),
            Target::Collection(proxy) => {
                self.deliver_collection(proxy, &msg);
                true
            }
            Target::ObjGroup(id) => self.deliver_objgroup(id, &msg, sender),
        };
        if handled {
            self.complete(&msg.env, sender);
        }
    }

    /// The consume half of the bracket, once a message has been handled or
    /// handed on.
    pub(crate) fn complete(&mut self, env: &Envelope, sender: NodeId) {
        if !env.flags.term_exempt() {
            self.consume_from(env.epoch, sender);
        }
    }

    fn forward_broadcast(&mut self, msg: &Arc<Message>) {
        let arity = self.config.tree_arity;
        let me = self.this_node();
        let children: Vec<NodeId> = match msg.env.group {
            Some(group) => {
                let members = self.group_members(group);
                let position = |node: NodeId| match members.iter().position(|&m| m == node) {
                    Some(position) => position,
                    None => fatal!("node {} is not a member of group {}", node, group),
                };
                let (root, pos) = (position(msg.env.from), position(me));
                tree::children(root, pos, members.len(), arity)
                    .into_iter()
                    .map(|c| members[c])
                    .collect()
            }
            None => tree::node_children(msg.env.from, me, self.num_nodes(), arity),
        };
        for child in children {
            trace!("forward broadcast {:?} to {}", msg.env.handler, child);
            self.transmit(child, msg.clone());
        }
    }

    /// Runs a free function or functor with the message's epoch pushed.
    pub(crate) fn invoke_call(&mut self, msg: &Message) {
        let thunk = self.registry().call(msg.env.handler);
        self.push_epoch(msg.env.epoch);
        thunk(self, &msg.env, &msg.payload);
        self.pop_epoch();
    }
}
