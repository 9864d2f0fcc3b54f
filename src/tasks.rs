//! Task collectives: rounds of per-element work ordered through epochs.
//!
//! [`Runtime::start_tasks`] opens a round. Each [`Runtime::task_collective`]
//! call creates one task per local element: a rooted, dependent epoch that
//! covers the one message the task closure sends to its own element. That
//! message is held at the element until every declared dependency (another
//! task at some index) has terminated. Dependencies on tasks known here are
//! watched right away; the rest are queried from wherever the dependency's
//! element lives when the round is waited on. One request goes out per
//! (index, dependency index, task) no matter how many tasks of the index wait
//! on it.
//! [`Runtime::task_collective_objgroup`] does the same with one task per
//! node of an object group.
//! [`Runtime::wait_for_tasks`] waits until every task of the round has
//! terminated on every node.

use std::{collections::BTreeMap, fmt, mem, sync::Arc};

use hashbrown::HashMap;
use rkyv::{Archive, Deserialize, Serialize};
use tracing::{debug, trace};

use crate::{
    collection::{CollectionProxy, ElementKey, Index},
    fatal,
    messaging::envelope::Message,
    objgroup::ObjGroupProxy,
    payload::Payload,
    registry::Handler,
    runtime::{Runtime, Work},
    termination::epoch::EpochId,
    Error, NodeId,
};

/// Names one `task_collective` call. Calls are collective, so ids agree
/// across nodes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

impl TaskId {
    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// Where a task lives: a collection element, or one node's instance of an
/// object group.
#[derive(
    Archive, Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord,
)]
#[archive(check_bytes)]
pub(crate) enum TaskKey {
    Element { proxy: CollectionProxy, index: Index },
    Node { group: u64, node: NodeId },
}

impl From<ElementKey> for TaskKey {
    fn from((proxy, index): ElementKey) -> Self {
        TaskKey::Element { proxy, index }
    }
}

impl fmt::Display for TaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskKey::Element { proxy, index } => write!(f, "{} of {:?}", index, proxy),
            TaskKey::Node { group, node } => write!(f, "node {} of objgroup#{}", node, group),
        }
    }
}

#[derive(Archive, Serialize, Deserialize, Debug, Clone)]
#[archive(check_bytes)]
struct TaskEntry {
    task: u64,
    epoch: EpochId,
    remaining: u32,
    released: bool,
}

/// The tasks of one element. Travels with the element when it migrates.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, Default)]
#[archive(check_bytes)]
pub(crate) struct TaskBook {
    entries: Vec<TaskEntry>,
}

impl TaskBook {
    fn entry(&self, task: u64) -> Option<&TaskEntry> {
        self.entries.iter().find(|e| e.task == task)
    }

    fn by_epoch(&mut self, epoch: EpochId) -> Option<&mut TaskEntry> {
        self.entries.iter_mut().find(|e| e.epoch == epoch)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
struct Dep {
    key: TaskKey,
    task: u64,
}

/// Declares what one task waits for.
pub struct TaskHandle {
    key: TaskKey,
    epoch: EpochId,
    deps: Vec<Dep>,
}

impl TaskHandle {
    /// Waits for `task` at `index` of the same collection.
    pub fn depends_on(&mut self, index: Index, task: TaskId) {
        match self.key {
            TaskKey::Element { proxy, .. } => self.depends_on_in(proxy, index, task),
            TaskKey::Node { .. } => {
                fatal!("task on {} depends on index {} of no collection", self.key, index)
            }
        }
    }

    /// Waits for `task` at `index` of another collection.
    pub fn depends_on_in(&mut self, proxy: CollectionProxy, index: Index, task: TaskId) {
        self.push(TaskKey::Element { proxy, index }, task);
    }

    /// Waits for `task` on `node` of the same object group.
    pub fn depends_on_node(&mut self, node: NodeId, task: TaskId) {
        match self.key {
            TaskKey::Node { group, .. } => self.push(TaskKey::Node { group, node }, task),
            TaskKey::Element { .. } => {
                fatal!("task on {} depends on node {} of no object group", self.key, node)
            }
        }
    }

    /// Waits for `task` on `node` of another object group.
    pub fn depends_on_objgroup<O>(&mut self, proxy: ObjGroupProxy<O>, node: NodeId, task: TaskId) {
        self.push(
            TaskKey::Node {
                group: proxy.id(),
                node,
            },
            task,
        );
    }

    fn push(&mut self, key: TaskKey, task: TaskId) {
        let dep = Dep { key, task: task.0 };
        if !self.deps.contains(&dep) {
            self.deps.push(dep);
        }
    }

    /// The element this task runs on, for collection tasks.
    pub fn index(&self) -> Option<Index> {
        match self.key {
            TaskKey::Element { index, .. } => Some(index),
            TaskKey::Node { .. } => None,
        }
    }

    /// The node this task runs on, for object group tasks.
    pub fn node(&self) -> Option<NodeId> {
        match self.key {
            TaskKey::Node { node, .. } => Some(node),
            TaskKey::Element { .. } => None,
        }
    }

    /// The epoch of this task.
    pub fn epoch(&self) -> EpochId {
        self.epoch
    }
}

#[derive(Archive, Serialize, Deserialize, Debug, Clone)]
#[archive(check_bytes)]
pub(crate) struct DepRequest {
    /// The requesting task's home.
    key: TaskKey,
    task: u64,
    /// Every task of the requester blocked on this dependency.
    waiting: Vec<EpochId>,
}

#[derive(Archive, Serialize, Deserialize, Debug)]
#[archive(check_bytes)]
pub(crate) struct DepQuery {
    iter: u64,
    key: TaskKey,
    requests: Vec<DepRequest>,
}

#[derive(Archive, Serialize, Deserialize, Debug)]
#[archive(check_bytes)]
pub(crate) struct DepReply {
    key: TaskKey,
    waiting: Vec<EpochId>,
    dep: EpochId,
}

#[derive(Archive, Serialize, Deserialize, Debug)]
#[archive(check_bytes)]
pub(crate) struct DepSatisfied {
    key: TaskKey,
    waiting: EpochId,
}

/// Counters for the dependency traffic of this node.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TaskStats {
    pub tasks: u64,
    /// Dependencies resolved without asking another node.
    pub local_deps: u64,
    /// Individual (task, dependency) requests sent out.
    pub requests: u64,
    /// Query messages carrying those requests.
    pub queries: u64,
}

#[derive(Default)]
pub(crate) struct TaskState {
    books: HashMap<TaskKey, TaskBook>,
    held: HashMap<TaskKey, Vec<(Arc<Message>, NodeId)>>,
    round: Option<EpochId>,
    next_task: u64,
    /// First task of the round before the current one; older entries are
    /// dropped.
    keep_from: u64,
    round_start: u64,
    iter: u64,
    /// Unsent requests by the dependency they ask about.
    outgoing: BTreeMap<TaskKey, Vec<DepRequest>>,
    early: Vec<DepQuery>,
    stats: TaskStats,
}

impl Runtime {
    /// Opens a round of tasks. Collective.
    pub fn start_tasks(&mut self) -> EpochId {
        if self.tasks.round.is_some() {
            fatal!("start_tasks on node {} while a round is open", self.this_node());
        }
        let round = self.make_epoch_collective();
        self.push_epoch(round);
        self.tasks.round = Some(round);
        self.tasks.round_start = self.tasks.next_task + 1;
        debug!("task round {} open", round);
        round
    }

    /// Runs `f` once per local element of `proxy`, each as its own task.
    /// `f` must send exactly one message to its own index and may declare
    /// dependencies through the handle. Collective.
    pub fn task_collective<F>(&mut self, proxy: CollectionProxy, mut f: F) -> TaskId
    where
        F: FnMut(&mut Runtime, &Index, &mut TaskHandle),
    {
        let task = self.next_task_id();
        for index in self.local_indices(proxy) {
            self.run_task(TaskKey::Element { proxy, index }, task, |rt, handle| {
                f(rt, &index, handle)
            });
        }
        TaskId(task)
    }

    /// Runs `f` once on this node as a task of the object group. `f` must send
    /// exactly one message to this node's instance and may declare
    /// dependencies on the tasks of other nodes. Collective.
    pub fn task_collective_objgroup<O, F>(&mut self, proxy: ObjGroupProxy<O>, f: F) -> TaskId
    where
        F: FnOnce(&mut Runtime, &mut TaskHandle),
    {
        let task = self.next_task_id();
        let key = TaskKey::Node {
            group: proxy.id(),
            node: self.this_node(),
        };
        self.run_task(key, task, f);
        TaskId(task)
    }

    fn next_task_id(&mut self) -> u64 {
        if self.tasks.round.is_none() {
            fatal!("task collective outside of start_tasks on node {}", self.this_node());
        }
        self.tasks.next_task += 1;
        self.tasks.next_task
    }

    fn run_task<F>(&mut self, key: TaskKey, task: u64, f: F)
    where
        F: FnOnce(&mut Runtime, &mut TaskHandle),
    {
        let round = match self.tasks.round {
            Some(round) => round,
            None => fatal!("task outside of start_tasks on node {}", self.this_node()),
        };
        let epoch = self.make_epoch_dependent();
        self.link_child_epoch(round, epoch);
        self.tasks.books.entry(key).or_default().entries.push(TaskEntry {
            task,
            epoch,
            remaining: 0,
            released: false,
        });
        let mut handle = TaskHandle {
            key,
            epoch,
            deps: Vec::new(),
        };
        self.push_epoch(epoch);
        f(self, &mut handle);
        self.pop_epoch();
        self.finish_epoch(epoch);
        self.tasks.stats.tasks += 1;
        self.check_done(key, epoch, handle.deps);
    }

    /// Whether `key` names an element or node that exists.
    fn check_task_target(&self, from: TaskKey, dep: &Dep) {
        match dep.key {
            TaskKey::Element { proxy, index } => {
                let bounds = self.coll.meta(proxy).bounds;
                if !bounds.contains(&index) {
                    fatal!(
                        "task on {} depends on {} outside the bounds {} of {:?}",
                        from,
                        index,
                        bounds,
                        proxy
                    );
                }
            }
            TaskKey::Node { node, .. } => {
                if node >= self.num_nodes() {
                    fatal!(
                        "task on {} depends on node {} of a run of {} nodes",
                        from,
                        node,
                        self.num_nodes()
                    );
                }
            }
        }
    }

    fn is_task_resident(&self, key: &TaskKey) -> bool {
        match key {
            TaskKey::Element { proxy, index } => self.coll.is_resident(&(*proxy, *index)),
            TaskKey::Node { node, .. } => *node == self.this_node(),
        }
    }

    /// Sends a protocol message to wherever `key` lives.
    fn send_to_task<T: Payload>(&mut self, epoch: EpochId, key: TaskKey, handler: Handler<T>, msg: T) {
        match key {
            TaskKey::Element { proxy, index } => self.send_routed(epoch, proxy, index, handler, msg),
            TaskKey::Node { node, .. } => self.send_in(epoch, node, handler, msg),
        }
    }

    fn check_done(&mut self, key: TaskKey, epoch: EpochId, deps: Vec<Dep>) {
        if deps.is_empty() {
            self.release_task(key, epoch);
            return;
        }
        for dep in &deps {
            self.check_task_target(key, dep);
        }
        self.set_remaining(key, epoch, deps.len() as u32);
        for dep in deps {
            let known = self
                .tasks
                .books
                .get(&dep.key)
                .filter(|_| self.is_task_resident(&dep.key))
                .and_then(|book| book.entry(dep.task))
                .map(|entry| entry.epoch);
            match known {
                Some(dep_epoch) => {
                    self.tasks.stats.local_deps += 1;
                    self.watch_dependency(dep_epoch, key, epoch);
                }
                None => {
                    trace!("{} waits on task {} at {}, asking later", key, dep.task, dep.key);
                    let requests = self.tasks.outgoing.entry(dep.key).or_default();
                    match requests
                        .iter_mut()
                        .find(|r| (r.key, r.task) == (key, dep.task))
                    {
                        Some(request) => request.waiting.push(epoch),
                        None => requests.push(DepRequest {
                            key,
                            task: dep.task,
                            waiting: vec![epoch],
                        }),
                    }
                }
            }
        }
    }

    fn set_remaining(&mut self, key: TaskKey, epoch: EpochId, remaining: u32) {
        match self.tasks.books.get_mut(&key).and_then(|book| book.by_epoch(epoch)) {
            Some(entry) => entry.remaining = remaining,
            None => fatal!("task {} of {} has no book entry", epoch, key),
        }
    }

    /// Tells the waiting task, wherever it lives, once `dep_epoch` is over.
    fn watch_dependency(&mut self, dep_epoch: EpochId, key: TaskKey, waiting: EpochId) {
        let satisfied = self.sys().dep_satisfied;
        self.add_action(dep_epoch, move |rt| {
            let epoch = rt.current_epoch();
            rt.send_to_task(epoch, key, satisfied, DepSatisfied { key, waiting });
        });
    }

    fn dependency_met(&mut self, key: TaskKey, waiting: EpochId) {
        let entry = match self.tasks.books.get_mut(&key).and_then(|book| book.by_epoch(waiting)) {
            Some(entry) => entry,
            None => fatal!("dependency met for unknown task {} of {}", waiting, key),
        };
        entry.remaining = match entry.remaining.checked_sub(1) {
            Some(remaining) => remaining,
            None => fatal!("task {} of {} satisfied more often than it waited", waiting, key),
        };
        if entry.remaining == 0 {
            self.release_task(key, waiting);
        }
    }

    fn release_task(&mut self, key: TaskKey, epoch: EpochId) {
        if let Some(entry) = self.tasks.books.get_mut(&key).and_then(|book| book.by_epoch(epoch)) {
            entry.released = true;
        }
        trace!("task {} of {} released", epoch, key);
        let held = match self.tasks.held.get_mut(&key) {
            Some(held) => held,
            None => return,
        };
        let (ready, rest): (Vec<_>, Vec<_>) =
            mem::take(held).into_iter().partition(|(msg, _)| msg.env.epoch == epoch);
        *held = rest;
        for (msg, sender) in ready {
            self.enqueue(Work::Deliver { msg, sender });
        }
    }

    /// Whether a message under `epoch` must wait at this element or object
    /// group instance.
    pub(crate) fn holds_for_task(&self, key: impl Into<TaskKey>, epoch: EpochId) -> bool {
        epoch.is_dependent()
            && self.tasks.books.get(&key.into()).map_or(false, |book| {
                book.entries.iter().any(|e| e.epoch == epoch && !e.released)
            })
    }

    pub(crate) fn hold_for_task(&mut self, key: impl Into<TaskKey>, msg: Arc<Message>, sender: NodeId) {
        self.tasks.held.entry(key.into()).or_default().push((msg, sender));
    }

    pub(crate) fn take_task_book(&mut self, key: ElementKey) -> TaskBook {
        self.tasks.books.remove(&TaskKey::from(key)).unwrap_or_default()
    }

    pub(crate) fn take_held_messages(&mut self, key: ElementKey) -> Vec<(Arc<Message>, NodeId)> {
        self.tasks.held.remove(&TaskKey::from(key)).unwrap_or_default()
    }

    pub(crate) fn install_task_book(&mut self, key: ElementKey, book: TaskBook) {
        if !book.entries.is_empty() {
            self.tasks.books.insert(key.into(), book);
        }
    }

    pub(crate) fn forget_tasks(&mut self, proxy: CollectionProxy) {
        let other = |key: &TaskKey| !matches!(key, TaskKey::Element { proxy: p, .. } if *p == proxy);
        self.tasks.books.retain(|key, _| other(key));
        self.tasks.held.retain(|key, _| other(key));
    }

    /// Sends the buffered dependency queries, closes the round and waits
    /// until every task of it terminated on every node. Collective.
    pub async fn wait_for_tasks(&mut self) -> Result<(), Error> {
        let round = match self.tasks.round.take() {
            Some(round) => round,
            None => fatal!("wait_for_tasks without start_tasks on node {}", self.this_node()),
        };
        self.tasks.iter += 1;
        let iter = self.tasks.iter;
        let query = self.sys().dep_query;
        for (key, requests) in mem::take(&mut self.tasks.outgoing) {
            self.tasks.stats.queries += 1;
            self.tasks.stats.requests += requests.len() as u64;
            self.send_to_task(
                round,
                key,
                query,
                DepQuery {
                    iter,
                    key,
                    requests,
                },
            );
        }
        for early in mem::take(&mut self.tasks.early) {
            self.answer_query(early);
        }
        if self.pop_epoch() != round {
            fatal!("epoch stack unbalanced at wait_for_tasks on node {}", self.this_node());
        }
        self.finish_epoch(round);
        self.run_until(move |rt| rt.is_terminated(round)).await?;

        // one finished round stays queryable for the next
        let keep_from = self.tasks.keep_from;
        for book in self.tasks.books.values_mut() {
            book.entries.retain(|e| e.task >= keep_from);
        }
        self.tasks.books.retain(|_, book| !book.entries.is_empty());
        self.tasks.keep_from = self.tasks.round_start;
        debug!("task round {} done", round);
        Ok(())
    }

    /// Waits for the round, synchronizes every node and starts the next load
    /// balancing phase.
    pub async fn phase_done(&mut self) -> Result<(), Error> {
        self.wait_for_tasks().await?;
        self.barrier().await?;
        self.next_phase();
        Ok(())
    }

    pub fn task_stats(&self) -> TaskStats {
        self.tasks.stats
    }

    fn answer_query(&mut self, query: DepQuery) {
        let key = query.key;
        if !self.is_task_resident(&key) {
            // the element moved on since the query was routed here
            let epoch = self.current_epoch();
            let routed = self.sys().dep_query;
            self.send_to_task(epoch, key, routed, query);
            return;
        }
        let reply = self.sys().dep_reply;
        let epoch = self.current_epoch();
        for request in query.requests {
            let dep = self
                .tasks
                .books
                .get(&key)
                .and_then(|book| book.entry(request.task))
                .map(|entry| entry.epoch);
            let dep = match dep {
                Some(dep) => dep,
                None => fatal!(
                    "{} has no task {} that {} depends on",
                    key,
                    request.task,
                    request.key
                ),
            };
            self.send_to_task(
                epoch,
                request.key,
                reply,
                DepReply {
                    key: request.key,
                    waiting: request.waiting,
                    dep,
                },
            );
        }
    }
}

pub(crate) fn on_dep_query(rt: &mut Runtime, from: NodeId, query: DepQuery) {
    trace!("dependency query from {} for {}", from, query.key);
    if rt.tasks.iter < query.iter {
        rt.tasks.early.push(query);
        return;
    }
    rt.answer_query(query);
}

pub(crate) fn on_dep_reply(rt: &mut Runtime, _: NodeId, reply: DepReply) {
    for waiting in reply.waiting {
        rt.watch_dependency(reply.dep, reply.key, waiting);
    }
}

pub(crate) fn on_dep_satisfied(rt: &mut Runtime, _: NodeId, msg: DepSatisfied) {
    rt.dependency_met(msg.key, msg.waiting);
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use rkyv::{Archive, Deserialize, Serialize};

    use super::*;
    use crate::{
        collection::ElementContext,
        registry::{ops, ElementType},
        world, MemberHandler, ReduceOp, RegistryBuilder, RuntimeConfig,
    };

    #[derive(Archive, Serialize, Deserialize, Debug, Default)]
    #[archive(check_bytes)]
    struct Step {
        trace: Vec<u64>,
    }

    type Events = Arc<Mutex<Vec<(u64, u64)>>>;

    #[derive(Clone)]
    struct Handles {
        step: ElementType<Step>,
        mark: MemberHandler<Step, u64>,
        sum: ReduceOp<u64>,
    }

    /// `mark` appends its value to the element and logs (value, index).
    fn register(reg: &mut RegistryBuilder, events: Events) -> Handles {
        Handles {
            step: reg.element_type("step"),
            mark: reg.member(
                "mark",
                move |s: &mut Step, _: &mut Runtime, ctx: &ElementContext, v: u64| {
                    s.trace.push(v);
                    events.lock().unwrap().push((v, ctx.index.get(0)));
                },
            ),
            sum: reg.reduce_op("sum", ops::plus::<u64>),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn released_tasks_run_after_their_dependencies() {
        world::init_test_tracing();
        let events: Events = Arc::new(Mutex::new(Vec::new()));
        let shared = events.clone();
        world::launch(
            3,
            RuntimeConfig::default(),
            move |reg| register(reg, shared.clone()),
            |mut rt, h| async move {
                rt.initialize().await?;
                let coll = rt.make_collection(h.step, Index::d1(6), None, |_| Step::default());
                rt.start_tasks();
                let first = rt.task_collective(coll, |rt, index, _| {
                    rt.send_elem(coll, *index, h.mark, 1);
                });
                rt.task_collective(coll, |rt, index, task| {
                    let i = index.get(0);
                    if i > 0 {
                        task.depends_on(Index::d1(i - 1), first);
                    }
                    if i < 5 {
                        task.depends_on(Index::d1(i + 1), first);
                    }
                    rt.send_elem(coll, *index, h.mark, 2);
                });
                rt.wait_for_tasks().await?;
                let stats = rt.task_stats();
                assert_eq!(stats.tasks, 4);
                // two neighbours per node; only the block edges cross nodes
                let expected = match rt.this_node() {
                    1 => 2,
                    _ => 1,
                };
                assert_eq!(stats.requests, expected);
                rt.finalize().await
            },
        )
        .await
        .unwrap();

        let events = events.lock().unwrap();
        assert_eq!(events.len(), 12);
        let at = |v: u64, i: u64| events.iter().position(|e| *e == (v, i)).unwrap();
        for i in 0..6u64 {
            let second = at(2, i);
            if i > 0 {
                assert!(at(1, i - 1) < second);
            }
            if i < 5 {
                assert!(at(1, i + 1) < second);
            }
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn repeated_edges_are_asked_once() {
        world::init_test_tracing();
        world::launch(
            2,
            RuntimeConfig::default(),
            |reg| register(reg, Arc::new(Mutex::new(Vec::new()))),
            |mut rt, h| async move {
                rt.initialize().await?;
                let coll = rt.make_collection(h.step, Index::d1(4), None, |_| Step::default());
                rt.start_tasks();
                let first = rt.task_collective(coll, |rt, index, _| {
                    rt.send_elem(coll, *index, h.mark, 1);
                });
                // two later tasks per index, both waiting on the same remote edges
                for value in [2, 3] {
                    rt.task_collective(coll, |rt, index, task| {
                        if rt.this_node() == 0 {
                            for _ in 0..3 {
                                task.depends_on(Index::d1(2), first);
                            }
                            task.depends_on(Index::d1(3), first);
                        }
                        rt.send_elem(coll, *index, h.mark, value);
                    });
                }
                rt.wait_for_tasks().await?;
                let stats = rt.task_stats();
                if rt.this_node() == 0 {
                    // (0, 2) (0, 3) (1, 2) (1, 3)
                    assert_eq!(stats.requests, 4);
                    assert_eq!(stats.queries, 2);
                } else {
                    assert_eq!(stats.requests, 0);
                    assert_eq!(stats.queries, 0);
                }
                for index in rt.local_indices(coll) {
                    let trace = &rt.local_element::<Step>(coll, index).unwrap().trace;
                    assert_eq!(trace[0], 1);
                    assert_eq!(trace.len(), 3);
                }
                rt.finalize().await
            },
        )
        .await
        .unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn rounds_repeat_and_sum() {
        world::init_test_tracing();
        let totals = Arc::new(Mutex::new(Vec::new()));
        let out = totals.clone();
        world::launch(
            4,
            RuntimeConfig::default(),
            |reg| register(reg, Arc::new(Mutex::new(Vec::new()))),
            move |mut rt, h| {
                let out = out.clone();
                async move {
                    rt.initialize().await?;
                    let coll = rt.make_collection(h.step, Index::d1(8), None, |_| Step::default());
                    let mut prev: Option<TaskId> = None;
                    for round in 0..3u64 {
                        rt.start_tasks();
                        let task = rt.task_collective(coll, |rt, index, task| {
                            if let Some(prev) = prev {
                                task.depends_on(Index::d1((index.get(0) + 1) % 8), prev);
                            }
                            rt.send_elem(coll, *index, h.mark, round);
                        });
                        prev = Some(task);
                        rt.phase_done().await?;
                    }
                    let mut local = 0;
                    for index in rt.local_indices(coll) {
                        if let Some(step) = rt.local_element::<Step>(coll, index) {
                            local += step.trace.iter().sum::<u64>();
                        }
                    }
                    rt.reduce(0, h.sum, local, move |_, total| out.lock().unwrap().push(total));
                    rt.finalize().await
                }
            },
        )
        .await
        .unwrap();
        // eight elements, each marked with 0 + 1 + 2
        assert_eq!(*totals.lock().unwrap(), vec![24]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    #[should_panic(expected = "outside the bounds")]
    async fn dependency_outside_the_bounds_is_fatal() {
        world::init_test_tracing();
        let _ = world::launch(
            2,
            RuntimeConfig::default(),
            |reg| register(reg, Arc::new(Mutex::new(Vec::new()))),
            |mut rt, h| async move {
                rt.initialize().await?;
                let coll = rt.make_collection(h.step, Index::d2(4, 2), None, |_| Step::default());
                rt.start_tasks();
                let first = rt.task_collective(coll, |rt, index, _| {
                    rt.send_elem(coll, *index, h.mark, 1);
                });
                rt.task_collective(coll, |rt, index, task| {
                    if *index == Index::d2(0, 0) {
                        task.depends_on(Index::d2(0, 3), first);
                    }
                    rt.send_elem(coll, *index, h.mark, 2);
                });
                rt.wait_for_tasks().await?;
                rt.finalize().await
            },
        )
        .await;
    }

    #[derive(Default)]
    struct Ledger {
        values: Vec<u64>,
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn objgroup_tasks_wait_for_their_neighbours() {
        world::init_test_tracing();
        let events: Events = Arc::new(Mutex::new(Vec::new()));
        let shared = events.clone();
        world::launch(
            3,
            RuntimeConfig::default(),
            move |reg| {
                let events = shared.clone();
                reg.objgroup(
                    "stamp",
                    move |l: &mut Ledger, rt: &mut Runtime, _: NodeId, v: u64| {
                        l.values.push(v);
                        events.lock().unwrap().push((v, rt.this_node() as u64));
                    },
                )
            },
            |mut rt, stamp| async move {
                rt.initialize().await?;
                let group = rt.make_objgroup(Ledger::default());
                let me = rt.this_node();
                let n = rt.num_nodes();
                rt.start_tasks();
                let first = rt.task_collective_objgroup(group, |rt, _| {
                    rt.send_objgroup(group, me, stamp, 1);
                });
                rt.task_collective_objgroup(group, |rt, task| {
                    assert_eq!(task.node(), Some(me));
                    task.depends_on_node((me + 1) % n, first);
                    task.depends_on_node((me + n - 1) % n, first);
                    task.depends_on_node(me, first);
                    rt.send_objgroup(group, me, stamp, 2);
                });
                rt.wait_for_tasks().await?;
                let stats = rt.task_stats();
                assert_eq!(stats.tasks, 2);
                assert_eq!(stats.local_deps, 1);
                assert_eq!(stats.requests, 2);
                let values = rt.local_objgroup(group).map(|l| l.values.clone());
                assert_eq!(values, Some(vec![1, 2]));
                rt.finalize().await
            },
        )
        .await
        .unwrap();

        let events = events.lock().unwrap();
        assert_eq!(events.len(), 6);
        let at = |v: u64, node: u64| events.iter().position(|e| *e == (v, node)).unwrap();
        for node in 0..3u64 {
            for other in 0..3u64 {
                assert!(at(1, other) < at(2, node));
            }
        }
    }
}
