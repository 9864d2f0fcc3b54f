//! Indexed collections of migratable elements.

pub mod index;
pub mod location;

use std::{
    any::Any,
    collections::VecDeque,
    fmt,
    sync::Arc,
    time::Instant,
};

use hashbrown::{HashMap, HashSet};
use rkyv::{Archive, Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::{
    fatal,
    messaging::{
        envelope::{Message, Target},
        pack_or_die,
    },
    payload::Payload,
    registry::{ElementType, Handler, HandlerId, HandlerKind, Mapping, MemberHandler},
    runtime::{Runtime, Work},
    tasks::TaskBook,
    termination::epoch::EpochId,
    Error, NodeId,
};

pub use self::index::{block_map, even_rows_map, round_robin_map, Index};

use self::index::ELEMENT_BITS;

/// Handle to a whole collection. Collections are created collectively, so the
/// same proxy names the same collection on every node.
#[derive(
    Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Archive, Serialize, Deserialize,
)]
#[archive(check_bytes)]
pub struct CollectionProxy(u64);

impl CollectionProxy {
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Debug for CollectionProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "collection#{}", self.0)
    }
}

pub(crate) type ElementKey = (CollectionProxy, Index);

/// What a member handler knows about the element it runs on.
#[derive(Clone, Debug)]
pub struct ElementContext {
    pub proxy: CollectionProxy,
    pub index: Index,
    /// The node that created the message.
    pub from: NodeId,
}

/// A collection element. Anything that can be snapshotted for migration
/// qualifies.
pub trait Element: Any + Send {
    fn as_any_mut(&mut self) -> &mut dyn Any;

    fn snapshot(&self) -> Result<Vec<u8>, Error>;
}

impl<T: Payload> Element for T {
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn snapshot(&self) -> Result<Vec<u8>, Error> {
        self.pack()
    }
}

struct Holder {
    elem: Box<dyn Element>,
    version: u32,
}

pub(crate) struct CollectionMeta {
    pub bounds: Index,
    mapping: Option<Mapping>,
    element_type: HandlerId,
}

#[derive(Default)]
pub(crate) struct CollectionState {
    meta: HashMap<CollectionProxy, CollectionMeta>,
    elements: HashMap<ElementKey, Holder>,
    /// Elements whose handler is running.
    checked_out: HashSet<ElementKey>,
    /// Messages that arrived for a checked out element.
    reentrant: HashMap<ElementKey, VecDeque<(Arc<Message>, NodeId)>>,
    /// Innermost last.
    context: Vec<ElementKey>,
    next: u64,
}

impl CollectionState {
    pub fn is_resident(&self, key: &ElementKey) -> bool {
        self.elements.contains_key(key) || self.checked_out.contains(key)
    }

    pub fn meta(&self, proxy: CollectionProxy) -> &CollectionMeta {
        match self.meta.get(&proxy) {
            Some(meta) => meta,
            None => fatal!("{:?} does not exist", proxy),
        }
    }
}

#[derive(Archive, Serialize, Deserialize, Debug)]
#[archive(check_bytes)]
pub(crate) struct MigrateIn {
    proxy: CollectionProxy,
    index: Index,
    version: u32,
    element_type: u64,
    snapshot: Vec<u8>,
    book: TaskBook,
}

impl Runtime {
    /// Creates a collection with one element per index of `bounds`, built by
    /// `make` on the node the mapping (block mapping by default) places it.
    /// Collective: every node makes the same collections in the same order.
    pub fn make_collection<E, F>(
        &mut self,
        ty: ElementType<E>,
        bounds: Index,
        mapping: Option<Mapping>,
        mut make: F,
    ) -> CollectionProxy
    where
        E: Element,
        F: FnMut(&Index) -> E,
    {
        let proxy = self.make_sparse_collection(ty, bounds, mapping);
        let me = self.this_node();
        let mut built = 0;
        for index in bounds.iter_bounds() {
            if self.home_node(proxy, index) == me {
                self.coll.elements.insert(
                    (proxy, index),
                    Holder {
                        elem: Box::new(make(&index)),
                        version: 0,
                    },
                );
                built += 1;
            }
        }
        debug!("{:?} over {} built {} local elements", proxy, bounds, built);
        proxy
    }

    /// Creates a collection without elements; they are added with
    /// [`Runtime::insert_element`].
    pub fn make_sparse_collection<E: Element>(
        &mut self,
        ty: ElementType<E>,
        bounds: Index,
        mapping: Option<Mapping>,
    ) -> CollectionProxy {
        bounds.check_bounds();
        if self.coll.next + 1 >= 1 << (64 - ELEMENT_BITS) {
            fatal!("node {} ran out of collection ids", self.this_node());
        }
        self.coll.next += 1;
        let proxy = CollectionProxy(self.coll.next);
        self.coll.meta.insert(
            proxy,
            CollectionMeta {
                bounds,
                mapping,
                element_type: ty.id(),
            },
        );
        proxy
    }

    /// Places a new element on this node and announces it.
    pub fn insert_element<E: Element>(&mut self, proxy: CollectionProxy, index: Index, elem: E) {
        let key = (proxy, index);
        let bounds = self.coll.meta(proxy).bounds;
        if !bounds.contains(&index) {
            fatal!("{} is outside the bounds {} of {:?}", index, bounds, proxy);
        }
        if self.coll.is_resident(&key) {
            fatal!("{} of {:?} is already present on node {}", index, proxy, self.this_node());
        }
        let version = self.loc.version(&key) + 1;
        self.coll.elements.insert(
            key,
            Holder {
                elem: Box::new(elem),
                version,
            },
        );
        self.announce(key, version);
    }

    /// Drops the local elements and bookkeeping of a collection. Collective.
    pub fn destroy_collection(&mut self, proxy: CollectionProxy) {
        if self.coll.checked_out.iter().any(|(p, _)| *p == proxy) {
            fatal!("{:?} destroyed from inside one of its handlers", proxy);
        }
        self.coll.elements.retain(|(p, _), _| *p != proxy);
        self.coll.reentrant.retain(|(p, _), _| *p != proxy);
        self.coll.meta.remove(&proxy);
        self.loc.forget(proxy);
        self.forget_tasks(proxy);
        debug!("destroyed {:?}", proxy);
    }

    pub fn collection_bounds(&self, proxy: CollectionProxy) -> Index {
        self.coll.meta(proxy).bounds
    }

    /// The node the mapping assigns `index` to.
    pub fn home_node(&self, proxy: CollectionProxy, index: Index) -> NodeId {
        let meta = self.coll.meta(proxy);
        let n = self.num_nodes();
        let home = match meta.mapping {
            Some(mapping) => self.registry().mapping(mapping.id())(&index, &meta.bounds, n),
            None => block_map(&index, &meta.bounds, n),
        };
        if home >= n {
            fatal!("mapping placed {} of {:?} on node {} of {}", index, proxy, home, n);
        }
        home
    }

    /// Indices of the elements resident here, in order.
    pub fn local_indices(&self, proxy: CollectionProxy) -> Vec<Index> {
        let mut indices: Vec<Index> = self
            .coll
            .elements
            .keys()
            .chain(self.coll.checked_out.iter())
            .filter(|(p, _)| *p == proxy)
            .map(|(_, index)| *index)
            .collect();
        indices.sort_unstable();
        indices
    }

    /// Borrows a resident element that is not running a handler.
    pub fn local_element<E: Element>(&mut self, proxy: CollectionProxy, index: Index) -> Option<&mut E> {
        self.coll
            .elements
            .get_mut(&(proxy, index))
            .and_then(|holder| holder.elem.as_any_mut().downcast_mut::<E>())
    }

    /// The element whose handler is running, if any.
    pub fn current_element(&self) -> Option<(CollectionProxy, Index)> {
        self.coll.context.last().copied()
    }

    pub fn current_element_index(&self) -> Index {
        match self.current_element() {
            Some((_, index)) => index,
            None => fatal!("no element handler is running on node {}", self.this_node()),
        }
    }

    /// Sends `msg` to the element at `index`, wherever it lives.
    pub fn send_elem<E, T: Payload>(
        &mut self,
        proxy: CollectionProxy,
        index: Index,
        handler: MemberHandler<E, T>,
        msg: T,
    ) {
        let payload = pack_or_die(&msg);
        self.record_send(proxy, index, payload.len());
        let epoch = self.current_epoch();
        self.send_to_element(epoch, proxy, index, handler.id(), payload);
    }

    /// Runs `handler` on every element of the collection.
    pub fn broadcast_collection<E, T: Payload>(
        &mut self,
        proxy: CollectionProxy,
        handler: MemberHandler<E, T>,
        msg: T,
    ) {
        let env = self.envelope(handler.id(), self.current_epoch(), Target::Collection(proxy));
        self.post_broadcast(env, pack_or_die(&msg));
    }

    /// A node-level protocol handler that runs where the element lives.
    pub(crate) fn send_routed<T: Payload>(
        &mut self,
        epoch: EpochId,
        proxy: CollectionProxy,
        index: Index,
        handler: Handler<T>,
        msg: T,
    ) {
        self.send_to_element(epoch, proxy, index, handler.id(), pack_or_die(&msg));
    }

    pub(crate) fn send_to_element(
        &mut self,
        epoch: EpochId,
        proxy: CollectionProxy,
        index: Index,
        handler: HandlerId,
        payload: Vec<u8>,
    ) {
        let bounds = self.coll.meta(proxy).bounds;
        if !bounds.contains(&index) {
            fatal!("send to {} outside the bounds {} of {:?}", index, bounds, proxy);
        }
        let dest = self.resolve(proxy, index);
        let env = self.envelope(handler, epoch, Target::Element { proxy, index });
        self.post(dest, env, payload);
    }

    /// Requests that the element move to `dest`. Runs from the scheduler
    /// queue; the element must be resident when it does.
    pub fn migrate(&mut self, proxy: CollectionProxy, index: Index, dest: NodeId) {
        if dest >= self.num_nodes() {
            fatal!("cannot migrate {} to node {} of {}", index, dest, self.num_nodes());
        }
        self.defer(move |rt| rt.migrate_now(proxy, index, dest));
    }

    fn migrate_now(&mut self, proxy: CollectionProxy, index: Index, dest: NodeId) {
        let key = (proxy, index);
        if self.coll.checked_out.contains(&key) {
            // busy in a handler further down the stack
            self.defer(move |rt| rt.migrate_now(proxy, index, dest));
            return;
        }
        if dest == self.this_node() {
            return;
        }
        let holder = match self.coll.elements.remove(&key) {
            Some(holder) => holder,
            None => {
                warn!("{} of {:?} is not on node {}, not migrating", index, proxy, self.this_node());
                return;
            }
        };
        let snapshot = match holder.elem.snapshot() {
            Ok(snapshot) => snapshot,
            Err(e) => fatal!("cannot snapshot {} of {:?}: {}", index, proxy, e),
        };
        let version = holder.version + 1;
        let book = self.take_task_book(key);
        let held = self.take_held_messages(key);
        self.loc.update(key, dest, version);

        debug!("migrating {} of {:?} to {} (v{})", index, proxy, dest, version);
        let migrate_in = self.sys().migrate_in;
        let element_type = self.coll.meta(proxy).element_type.raw();
        let epoch = self.current_epoch();
        self.send_in(
            epoch,
            dest,
            migrate_in,
            MigrateIn {
                proxy,
                index,
                version,
                element_type,
                snapshot,
                book,
            },
        );
        // per-pair order puts these behind the element
        for (msg, sender) in held {
            self.forward(&msg, dest);
            self.complete(&msg.env, sender);
        }
        self.flush_pending(key);
    }

    pub(crate) fn deliver_element(&mut self, msg: &Arc<Message>, sender: NodeId) -> bool {
        let key = match msg.env.target {
            Target::Element { proxy, index } => (proxy, index),
            _ => return true,
        };
        if !self.coll.is_resident(&key) {
            return self.route_missing(msg, sender, key);
        }
        if msg.env.handler.kind() != Some(HandlerKind::CollectionMember) {
            // routed protocol message
            self.invoke_call(msg);
            return true;
        }
        if self.holds_for_task(key, msg.env.epoch) {
            self.hold_for_task(key, msg.clone(), sender);
            return false;
        }
        if self.coll.checked_out.contains(&key) {
            self.coll
                .reentrant
                .entry(key)
                .or_default()
                .push_back((msg.clone(), sender));
            return false;
        }
        self.invoke_member(key, msg);
        true
    }

    fn invoke_member(&mut self, key: ElementKey, msg: &Message) {
        let thunk = self.registry().member(msg.env.handler);
        let mut holder = match self.coll.elements.remove(&key) {
            Some(holder) => holder,
            None => fatal!("{} of {:?} vanished before its handler ran", key.1, key.0),
        };
        self.coll.checked_out.insert(key);
        self.coll.context.push(key);
        self.push_epoch(msg.env.epoch);
        let started = Instant::now();
        thunk(self, holder.elem.as_any_mut(), &msg.env, &msg.payload);
        let spent = started.elapsed();
        self.pop_epoch();
        self.coll.context.pop();
        self.coll.checked_out.remove(&key);
        self.coll.elements.insert(key, holder);
        self.record_load(key, spent);

        if let Some(waiting) = self.coll.reentrant.remove(&key) {
            for (msg, sender) in waiting {
                self.enqueue(Work::Deliver { msg, sender });
            }
        }
    }

    /// A collection broadcast fans out into one local message per resident
    /// element, so each takes the regular element path.
    pub(crate) fn deliver_collection(&mut self, proxy: CollectionProxy, msg: &Message) {
        if !self.coll.meta.contains_key(&proxy) {
            fatal!("broadcast to unknown {:?} on node {}", proxy, self.this_node());
        }
        let me = self.this_node();
        for index in self.local_indices(proxy) {
            let mut env = msg.env.clone();
            env.target = Target::Element { proxy, index };
            env.flags.set_broadcast(false);
            trace!("collection broadcast to {}", index);
            self.post(me, env, msg.payload.clone());
        }
    }

    pub(crate) fn element_id(&self, key: &ElementKey) -> u64 {
        let bounds = self.coll.meta(key.0).bounds;
        (key.0.raw() << ELEMENT_BITS) | key.1.linearize(&bounds)
    }
}

pub(crate) fn on_migrate_in(rt: &mut Runtime, from: NodeId, msg: MigrateIn) {
    let key = (msg.proxy, msg.index);
    if rt.coll.is_resident(&key) {
        fatal!("{} of {:?} migrated from {} onto a node that holds it", msg.index, msg.proxy, from);
    }
    let restore = rt.registry().restore(HandlerId::from_raw(msg.element_type));
    let elem = match restore(&msg.snapshot) {
        Ok(elem) => elem,
        Err(e) => fatal!("cannot restore {} of {:?} from {}: {}", msg.index, msg.proxy, from, e),
    };
    rt.coll.elements.insert(
        key,
        Holder {
            elem,
            version: msg.version,
        },
    );
    rt.install_task_book(key, msg.book);
    debug!("received {} of {:?} from {} (v{})", msg.index, msg.proxy, from, msg.version);
    rt.announce(key, msg.version);
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use rkyv::{Archive, Deserialize, Serialize};

    use super::*;
    use crate::{world, RuntimeConfig};

    #[derive(Archive, Serialize, Deserialize, Debug, Default)]
    #[archive(check_bytes)]
    struct Cell {
        received: Vec<u64>,
        seq: u64,
    }

    #[derive(Clone)]
    struct Handles {
        cell: ElementType<Cell>,
        take: MemberHandler<Cell, u64>,
        bump: MemberHandler<Cell, u64>,
        report: MemberHandler<Cell, u8>,
        log: Arc<Mutex<Vec<(Index, NodeId, Vec<u64>, u64)>>>,
    }

    fn register(reg: &mut crate::RegistryBuilder, log: Arc<Mutex<Vec<(Index, NodeId, Vec<u64>, u64)>>>) -> Handles {
        let sink = log.clone();
        Handles {
            cell: reg.element_type("cell"),
            take: reg.member("take", |cell: &mut Cell, _: &mut Runtime, _: &ElementContext, v: u64| {
                cell.received.push(v)
            }),
            bump: reg.member("bump", |cell: &mut Cell, _: &mut Runtime, _: &ElementContext, _: u64| {
                cell.seq += 1
            }),
            report: reg.member("report", move |cell: &mut Cell, rt: &mut Runtime, ctx: &ElementContext, _: u8| {
                sink.lock().unwrap().push((ctx.index, rt.this_node(), cell.received.clone(), cell.seq));
            }),
            log,
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn ring_delivers_each_index_once() {
        world::init_test_tracing();
        let log = Arc::new(Mutex::new(Vec::new()));
        let shared = log.clone();
        world::launch(
            4,
            RuntimeConfig::default(),
            move |reg| register(reg, shared.clone()),
            |mut rt, h| async move {
                rt.initialize().await?;
                let ring = rt.make_collection(h.cell, Index::d1(8), None, |_| Cell::default());
                assert_eq!(rt.local_indices(ring).len(), 2);
                let epoch = rt.collective_scope(|rt| {
                    for index in rt.local_indices(ring) {
                        let i = index.get(0);
                        if i < 7 {
                            rt.send_elem(ring, Index::d1(i + 1), h.take, i);
                        }
                    }
                });
                rt.wait_epoch(epoch).await?;
                rt.collective_scope(|rt| {
                    if rt.this_node() == 0 {
                        rt.broadcast_collection(ring, h.report, 0u8);
                    }
                });
                rt.finalize().await
            },
        )
        .await
        .unwrap();

        let mut log = log.lock().unwrap().clone();
        log.sort_by_key(|(index, ..)| *index);
        assert_eq!(log.len(), 8);
        for (index, node, received, _) in log {
            let i = index.get(0);
            assert_eq!(node as u64, i / 2);
            if i == 0 {
                assert!(received.is_empty());
            } else {
                assert_eq!(received, vec![i - 1]);
            }
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    #[should_panic(expected = "outside the bounds")]
    async fn sends_outside_the_bounds_are_fatal() {
        world::init_test_tracing();
        let _ = world::launch(
            2,
            RuntimeConfig::default(),
            |reg| register(reg, Arc::new(Mutex::new(Vec::new()))),
            |mut rt, h| async move {
                rt.initialize().await?;
                let grid = rt.make_collection(h.cell, Index::d2(4, 2), None, |_| Cell::default());
                rt.collective_scope(|rt| {
                    if rt.this_node() == 0 {
                        rt.send_elem(grid, Index::d2(0, 3), h.take, 1);
                    }
                });
                rt.finalize().await
            },
        )
        .await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn sends_follow_a_migration() {
        world::init_test_tracing();
        let log = Arc::new(Mutex::new(Vec::new()));
        let shared = log.clone();
        world::launch(
            4,
            RuntimeConfig::default(),
            move |reg| register(reg, shared.clone()),
            |mut rt, h| async move {
                rt.initialize().await?;
                let coll = rt.make_collection(h.cell, Index::d1(8), None, |_| Cell::default());
                let target = Index::d1(3);
                let epoch = rt.collective_scope(|rt| {
                    match rt.this_node() {
                        // idx 3 starts on node 1 under the block mapping
                        1 => rt.migrate(coll, target, 2),
                        3 => rt.send_elem(coll, target, h.bump, 1),
                        _ => {}
                    }
                });
                rt.wait_epoch(epoch).await?;
                let after = rt.collective_scope(|rt| {
                    rt.send_elem(coll, target, h.bump, 1);
                });
                rt.wait_epoch(after).await?;
                rt.barrier().await?;
                let done = rt.collective_scope(|rt| {
                    if rt.this_node() == 0 {
                        rt.send_elem(coll, target, h.report, 0u8);
                    }
                });
                rt.wait_epoch(done).await?;
                rt.finalize().await
            },
        )
        .await
        .unwrap();

        let log = log.lock().unwrap();
        assert_eq!(log.len(), 1);
        let (index, node, _, seq) = &log[0];
        assert_eq!(*index, Index::d1(3));
        assert_eq!(*node, 2);
        // one bump from node 3 before the move, one from every node after
        assert_eq!(*seq, 5);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn inserted_elements_are_found() {
        world::init_test_tracing();
        let log = Arc::new(Mutex::new(Vec::new()));
        let shared = log.clone();
        world::launch(
            3,
            RuntimeConfig::default(),
            move |reg| register(reg, shared.clone()),
            |mut rt, h| async move {
                rt.initialize().await?;
                let coll = rt.make_sparse_collection(h.cell, Index::d1(6), None);
                let epoch = rt.collective_scope(|rt| {
                    // index 0's home is node 0; node 2 inserts it
                    if rt.this_node() == 2 {
                        rt.insert_element(coll, Index::d1(0), Cell::default());
                    }
                    rt.send_elem(coll, Index::d1(0), h.take, rt.this_node() as u64);
                });
                rt.wait_epoch(epoch).await?;
                let done = rt.collective_scope(|rt| {
                    if rt.this_node() == 1 {
                        rt.send_elem(coll, Index::d1(0), h.report, 0u8);
                    }
                });
                rt.wait_epoch(done).await?;
                rt.finalize().await
            },
        )
        .await
        .unwrap();

        let log = log.lock().unwrap();
        let (_, node, received, _) = &log[0];
        assert_eq!(*node, 2);
        let mut received = received.clone();
        received.sort_unstable();
        assert_eq!(received, vec![0, 1, 2]);
    }
}
