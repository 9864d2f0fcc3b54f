//! Where collection elements live.
//!
//! Every node believes an element lives on its home node (given by the
//! collection's mapping) until told otherwise. The node that receives a
//! migrated or inserted element broadcasts an [`Announce`] carrying a version
//! that grows with every move, and nodes only ever accept newer versions.
//! A node that is sent a message for an element it does not hold forwards it
//! along its own belief; the node a migration left from points at the
//! destination right away, so forwarding chains end at the live copy. A node
//! that believes it is the owner but holds nothing (a home node racing an
//! insertion) buffers until the announce arrives.

use std::sync::Arc;

use hashbrown::HashMap;
use rkyv::{Archive, Deserialize, Serialize};
use tracing::{debug, trace};

use crate::{
    collection::{CollectionProxy, ElementKey, Index},
    fatal,
    messaging::envelope::Message,
    runtime::{Runtime, Work},
    NodeId,
};

#[derive(Archive, Serialize, Deserialize, Debug)]
#[archive(check_bytes)]
pub(crate) struct Announce {
    pub proxy: CollectionProxy,
    pub index: Index,
    pub node: NodeId,
    pub version: u32,
}

#[derive(Default)]
pub(crate) struct LocationState {
    /// Latest known (owner, version). Absent means the home node, version 0.
    cache: HashMap<ElementKey, (NodeId, u32)>,
    /// Messages waiting for an announce, with the node that sent them here.
    pending: HashMap<ElementKey, Vec<(Arc<Message>, NodeId)>>,
}

impl LocationState {
    pub fn belief(&self, key: &ElementKey) -> Option<NodeId> {
        self.cache.get(key).map(|(node, _)| *node)
    }

    pub fn version(&self, key: &ElementKey) -> u32 {
        self.cache.get(key).map_or(0, |(_, version)| *version)
    }

    /// Records a sighting and returns whether it was news.
    pub fn update(&mut self, key: ElementKey, node: NodeId, version: u32) -> bool {
        match self.cache.get(&key) {
            Some((_, known)) if *known >= version => false,
            _ => {
                self.cache.insert(key, (node, version));
                true
            }
        }
    }

    pub fn forget(&mut self, proxy: CollectionProxy) {
        self.cache.retain(|(p, _), _| *p != proxy);
        self.pending.retain(|(p, _), _| *p != proxy);
    }
}

impl Runtime {
    /// The node this node believes holds the element.
    pub fn resolve(&self, proxy: CollectionProxy, index: Index) -> NodeId {
        let key = (proxy, index);
        if self.coll.is_resident(&key) {
            return self.this_node();
        }
        self.loc
            .belief(&key)
            .unwrap_or_else(|| self.home_node(proxy, index))
    }

    /// Handles an element-targeted message for an element that is not here.
    /// Returns whether the message left this node (and may be consumed).
    pub(crate) fn route_missing(
        &mut self,
        msg: &Arc<Message>,
        sender: NodeId,
        key: ElementKey,
    ) -> bool {
        let dest = self.resolve(key.0, key.1);
        if dest != self.this_node() {
            self.forward(msg, dest);
            return true;
        }
        trace!("buffering {:?} for {:?} {}", msg.env.handler, key.0, key.1);
        self.loc
            .pending
            .entry(key)
            .or_default()
            .push((msg.clone(), sender));
        false
    }

    /// Re-sends a message that reached a node without the element. The
    /// caller consumes the original.
    pub(crate) fn forward(&mut self, msg: &Arc<Message>, dest: NodeId) {
        if msg.env.hops >= self.config.max_forward_hops {
            fatal!(
                "message {:?} for {:?} gave up after {} hops, last at node {}",
                msg.env.handler,
                msg.env.target,
                msg.env.hops,
                self.this_node()
            );
        }
        let mut fwd = Message::clone(msg);
        fwd.env.hops += 1;
        fwd.env.flags.set_forwarded(true);
        trace!("forward {:?} to {} (hop {})", fwd.env.handler, dest, fwd.env.hops);
        self.transmit(dest, Arc::new(fwd));
    }

    /// Tells every node that the element now lives here.
    pub(crate) fn announce(&mut self, key: ElementKey, version: u32) {
        let me = self.this_node();
        self.loc.update(key, me, version);
        let announce = self.sys().announce;
        self.broadcast_exempt(
            announce,
            Announce {
                proxy: key.0,
                index: key.1,
                node: me,
                version,
            },
        );
        self.flush_pending(key);
    }

    /// Re-delivers buffered messages so they take the current route.
    pub(crate) fn flush_pending(&mut self, key: ElementKey) {
        if let Some(waiting) = self.loc.pending.remove(&key) {
            debug!("releasing {} buffered messages for {}", waiting.len(), key.1);
            for (msg, sender) in waiting {
                self.enqueue(Work::Deliver { msg, sender });
            }
        }
    }
}

pub(crate) fn on_announce(rt: &mut Runtime, from: NodeId, msg: Announce) {
    let key = (msg.proxy, msg.index);
    if rt.loc.update(key, msg.node, msg.version) {
        trace!("{} of {:?} is on {} (v{}) per {}", msg.index, msg.proxy, msg.node, msg.version, from);
        rt.flush_pending(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_newer_versions_win() {
        let mut loc = LocationState::default();
        let key = (CollectionProxy::from_raw(1), Index::d1(3));
        assert_eq!(loc.belief(&key), None);
        assert!(loc.update(key, 2, 1));
        assert!(!loc.update(key, 5, 1));
        assert!(loc.update(key, 4, 3));
        assert!(!loc.update(key, 2, 2));
        assert_eq!(loc.belief(&key), Some(4));
        assert_eq!(loc.version(&key), 3);
        loc.forget(key.0);
        assert_eq!(loc.belief(&key), None);
    }
}
