//! The per-node scheduler.
//!
//! A [`Runtime`] owns every piece of node state and is driven by exactly one
//! task. Each turn it pulls arrived frames off the transport into the ready
//! queue and runs one queued item. Handlers run to completion; waiting for a
//! condition from async code goes through [`Runtime::run_until`], which idles
//! on the transport when there is nothing to do, and from inside a handler
//! through the bounded, non-blocking [`Runtime::drain_until`].

use std::{collections::VecDeque, sync::Arc, time::Duration};

use rkyv::{Archive, Deserialize, Serialize};
use tokio::select;
use tracing::{debug, debug_span, trace, warn, Span};

use crate::{
    collection::{self, location, location::LocationState, CollectionState},
    collective::{barrier, reduce, scatter, CollectiveState},
    config::RuntimeConfig,
    fatal,
    hex::HexDisplayExt,
    lb::LbState,
    messaging::{
        envelope::Message,
        transport::{Frame, TAG_ACTIVE},
        Groups,
    },
    objgroup::ObjGroupState,
    registry::{Handler, HandlerRegistry, RegistryBuilder},
    tasks::{self, TaskState},
    termination::{self, epoch::EpochId, TermState},
    worker::WorkerState,
    Error, NodeId, Transport,
};

/// A closure queued to run on the scheduler.
pub(crate) type Action = Box<dyn FnOnce(&mut Runtime) + Send>;

pub(crate) enum Work {
    /// A message that reached this node. `sender` is the node that handed it
    /// to the transport, which differs from `env.from` for forwarded
    /// broadcasts.
    Deliver { msg: Arc<Message>, sender: NodeId },
    /// Runs with `epoch` pushed and consumes one unit of it afterwards.
    Action { epoch: EpochId, action: Action },
}

#[derive(Archive, Serialize, Deserialize, Debug)]
#[archive(check_bytes)]
pub(crate) struct Hello {
    fingerprint: [u8; 32],
}

#[derive(Archive, Serialize, Deserialize, Debug)]
#[archive(check_bytes)]
pub(crate) struct Ready {
    nodes: u32,
}

/// The runtime's own protocol handlers. Registered first, in this order, by
/// every registry.
#[derive(Clone, Copy)]
pub(crate) struct SystemHandlers {
    pub hello: Handler<Hello>,
    pub ready: Handler<Ready>,
    pub wave_counter: Handler<termination::WaveCounter>,
    pub wave_continue: Handler<termination::WaveContinue>,
    pub wave_terminated: Handler<termination::EpochMsg>,
    pub ds_ack: Handler<termination::DsAck>,
    pub inquire: Handler<termination::EpochMsg>,
    pub inquire_reply: Handler<termination::EpochMsg>,
    pub announce: Handler<location::Announce>,
    pub migrate_in: Handler<collection::MigrateIn>,
    pub dep_query: Handler<tasks::DepQuery>,
    pub dep_reply: Handler<tasks::DepReply>,
    pub dep_satisfied: Handler<tasks::DepSatisfied>,
    pub barrier_up: Handler<barrier::BarrierMsg>,
    pub barrier_down: Handler<barrier::BarrierMsg>,
    pub reduce_up: Handler<reduce::ReduceUp>,
    pub scatter: Handler<scatter::ScatterDown>,
}

impl SystemHandlers {
    pub(crate) fn register(b: &mut RegistryBuilder) -> Self {
        Self {
            hello: b.handler("dendrite::hello", on_hello),
            ready: b.handler("dendrite::ready", on_ready),
            wave_counter: b.handler("dendrite::wave_counter", termination::on_wave_counter),
            wave_continue: b.handler("dendrite::wave_continue", termination::on_wave_continue),
            wave_terminated: b.handler(
                "dendrite::wave_terminated",
                termination::on_wave_terminated,
            ),
            ds_ack: b.handler("dendrite::ds_ack", termination::on_ds_ack),
            inquire: b.handler("dendrite::inquire", termination::on_inquire),
            inquire_reply: b.handler("dendrite::inquire_reply", termination::on_inquire_reply),
            announce: b.handler("dendrite::announce", location::on_announce),
            migrate_in: b.handler("dendrite::migrate_in", collection::on_migrate_in),
            dep_query: b.handler("dendrite::dep_query", tasks::on_dep_query),
            dep_reply: b.handler("dendrite::dep_reply", tasks::on_dep_reply),
            dep_satisfied: b.handler("dendrite::dep_satisfied", tasks::on_dep_satisfied),
            barrier_up: b.handler("dendrite::barrier_up", barrier::on_barrier_up),
            barrier_down: b.handler("dendrite::barrier_down", barrier::on_barrier_down),
            reduce_up: b.handler("dendrite::reduce_up", reduce::on_reduce_up),
            scatter: b.handler("dendrite::scatter", scatter::on_scatter),
        }
    }
}

enum Idle {
    Frame(Option<Frame>),
    Offload((EpochId, Action)),
    Backoff,
    Hang,
}

pub struct Runtime {
    pub(crate) config: RuntimeConfig,
    node: NodeId,
    num_nodes: NodeId,
    transport: Box<dyn Transport>,
    registry: Arc<HandlerRegistry>,
    queue: VecDeque<Work>,
    pub(crate) term: TermState,
    pub(crate) groups: Groups,
    pub(crate) coll: CollectionState,
    pub(crate) loc: LocationState,
    pub(crate) objgroups: ObjGroupState,
    pub(crate) tasks: TaskState,
    pub(crate) collectives: CollectiveState,
    pub(crate) lb: LbState,
    pub(crate) worker: WorkerState,
    hellos: NodeId,
    ready: bool,
    nested: usize,
    turns: u64,
    /// Set once the global epoch terminated; transport errors are expected
    /// from then on as peers tear down.
    pub(crate) shutting_down: bool,
    span: Span,
}

impl Runtime {
    pub fn new<T: Transport + 'static>(
        config: RuntimeConfig,
        transport: T,
        registry: HandlerRegistry,
    ) -> Self {
        config.check();
        let node = transport.this_node();
        let num_nodes = transport.num_nodes();
        let worker = WorkerState::new(config.worker_threads);
        let mut rt = Runtime {
            config,
            node,
            num_nodes,
            transport: Box::new(transport),
            registry: Arc::new(registry),
            queue: VecDeque::new(),
            term: TermState::default(),
            groups: Groups::default(),
            coll: CollectionState::default(),
            loc: LocationState::default(),
            objgroups: ObjGroupState::default(),
            tasks: TaskState::default(),
            collectives: CollectiveState::default(),
            lb: LbState::default(),
            worker,
            hellos: 0,
            ready: false,
            nested: 0,
            turns: 0,
            shutting_down: false,
            span: debug_span!("node", node),
        };
        // the global epoch lives until finalize
        rt.produce(EpochId::GLOBAL, 1);
        rt
    }

    pub fn this_node(&self) -> NodeId {
        self.node
    }

    pub fn num_nodes(&self) -> NodeId {
        self.num_nodes
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    pub(crate) fn sys(&self) -> &SystemHandlers {
        &self.registry.system
    }

    /// Checks that every node runs the same registry and waits until node 0
    /// has heard from everybody.
    pub async fn initialize(&mut self) -> Result<(), Error> {
        debug!(
            parent: &self.span,
            "initializing {} of {} with registry {}",
            self.node,
            self.num_nodes,
            self.registry.fingerprint().hex().short(8)
        );
        if self.node != 0 {
            let hello = self.sys().hello;
            let fingerprint = self.registry.fingerprint();
            self.send_exempt(0, hello, Hello { fingerprint });
        } else if self.num_nodes == 1 {
            self.ready = true;
        }
        self.run_until(|rt| rt.ready).await
    }

    /// Finishes the global epoch, waits for the whole run to quiesce and
    /// writes load statistics when configured.
    pub async fn finalize(&mut self) -> Result<(), Error> {
        self.finish_epoch(EpochId::GLOBAL);
        self.run_until(|rt| rt.is_terminated(EpochId::GLOBAL)).await?;
        if let Some(dir) = self.config.lb_stats_path.clone() {
            self.write_lb_stats(&dir).await?;
        }
        debug!(parent: &self.span, "finalized after {} turns", self.turns);
        Ok(())
    }

    /// Queues `action` behind the work that is already ready. The current
    /// epoch stays open until the action ran.
    pub fn defer<F>(&mut self, action: F)
    where
        F: FnOnce(&mut Runtime) + Send + 'static,
    {
        let epoch = self.current_epoch();
        self.produce(epoch, 1);
        self.queue.push_back(Work::Action {
            epoch,
            action: Box::new(action),
        });
    }

    pub(crate) fn enqueue(&mut self, work: Work) {
        self.queue.push_back(work);
    }

    /// Moves arrived frames into the ready queue and runs one item. Returns
    /// whether anything happened.
    pub fn progress(&mut self) -> bool {
        let mut worked = false;
        while let Some(frame) = self.transport.try_recv() {
            self.accept(frame);
            worked = true;
        }
        while let Ok((epoch, action)) = self.worker.rx.try_recv() {
            self.queue.push_back(Work::Action { epoch, action });
            worked = true;
        }
        if let Some(work) = self.queue.pop_front() {
            let span = self.span.clone();
            let _enter = span.enter();
            self.run_work(work);
            self.turns += 1;
            worked = true;
        }
        worked
    }

    fn accept(&mut self, frame: Frame) {
        if frame.tag != TAG_ACTIVE {
            warn!("dropping frame with unknown tag {} from {}", frame.tag, frame.src);
            return;
        }
        match Message::decode(&frame.bytes) {
            Ok(msg) => self.queue.push_back(Work::Deliver {
                msg: Arc::new(msg),
                sender: frame.src,
            }),
            Err(e) => fatal!("undecodable message from node {}: {}", frame.src, e),
        }
    }

    fn run_work(&mut self, work: Work) {
        match work {
            Work::Deliver { msg, sender } => {
                trace!("deliver {:?} from {}", msg.env.handler, sender);
                self.deliver(msg, sender);
            }
            Work::Action { epoch, action } => {
                self.push_epoch(epoch);
                action(self);
                self.pop_epoch();
                self.consume(epoch, 1);
            }
        }
    }

    /// Runs the scheduler until `done` holds, idling on the transport when
    /// there is no ready work.
    pub async fn run_until<F>(&mut self, mut done: F) -> Result<(), Error>
    where
        F: FnMut(&Runtime) -> bool + Send,
    {
        let yield_every = self.config.yield_every.max(1) as u64;
        while !done(self) {
            if self.progress() {
                if self.turns % yield_every == 0 {
                    tokio::task::yield_now().await;
                }
                continue;
            }

            let backoff = self.config.wave_backoff;
            let parked = self.term.has_parked_waves();
            let hang = self.config.hang_check.max(Duration::from_millis(1));
            let idle = select! {
                frame = self.transport.recv() => Idle::Frame(frame),
                Some(completion) = self.worker.rx.recv() => Idle::Offload(completion),
                _ = tokio::time::sleep(backoff), if parked => Idle::Backoff,
                _ = tokio::time::sleep(hang) => Idle::Hang,
            };
            match idle {
                Idle::Frame(Some(frame)) => self.accept(frame),
                Idle::Frame(None) => Err(Error::TransportClosed(self.node))?,
                Idle::Offload((epoch, action)) => {
                    self.queue.push_back(Work::Action { epoch, action })
                }
                Idle::Backoff => self.resume_parked_waves(),
                Idle::Hang => {
                    let _enter = self.span.enter();
                    self.report_hang();
                }
            }
        }
        Ok(())
    }

    /// Processes ready work from inside a handler until `done` holds or
    /// nothing is ready. Never blocks; returns whether `done` was reached.
    pub fn drain_until<F>(&mut self, mut done: F) -> bool
    where
        F: FnMut(&Runtime) -> bool,
    {
        self.nested += 1;
        if self.nested > self.config.max_nested_waits {
            fatal!(
                "node {} nested {} waits, more than the allowed {}",
                self.node,
                self.nested,
                self.config.max_nested_waits
            );
        }
        let mut reached = done(self);
        while !reached && self.progress() {
            reached = done(self);
        }
        self.nested -= 1;
        reached
    }

    pub(crate) fn send_frame(&mut self, dest: NodeId, bytes: Vec<u8>) -> Result<(), Error> {
        self.transport.send_bytes(dest, TAG_ACTIVE, bytes)
    }
}

fn on_hello(rt: &mut Runtime, from: NodeId, msg: Hello) {
    let ours = rt.registry.fingerprint();
    if msg.fingerprint != ours {
        fatal!(
            "node {} runs registry {} but node 0 runs {}",
            from,
            msg.fingerprint.hex().short(8),
            ours.hex().short(8)
        );
    }
    rt.hellos += 1;
    trace!("hello from {} ({}/{})", from, rt.hellos, rt.num_nodes - 1);
    if rt.hellos == rt.num_nodes - 1 {
        let ready = rt.sys().ready;
        let nodes = rt.num_nodes;
        rt.broadcast_exempt(ready, Ready { nodes });
    }
}

fn on_ready(rt: &mut Runtime, _: NodeId, msg: Ready) {
    if msg.nodes != rt.num_nodes {
        fatal!(
            "node 0 counts {} nodes but node {} counts {}",
            msg.nodes,
            rt.node,
            rt.num_nodes
        );
    }
    rt.ready = true;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::LocalWorld;

    fn single() -> Runtime {
        let transport = LocalWorld::endpoints(1).pop().unwrap();
        Runtime::new(RuntimeConfig::default(), transport, HandlerRegistry::builder().build())
    }

    #[tokio::test]
    async fn single_node_lifecycle() {
        let mut rt = single();
        rt.initialize().await.unwrap();
        assert!(!rt.is_terminated(EpochId::GLOBAL));
        rt.finalize().await.unwrap();
        assert!(rt.is_terminated(EpochId::GLOBAL));
    }

    #[tokio::test]
    async fn deferred_actions_keep_their_epoch_open() {
        let mut rt = single();
        rt.initialize().await.unwrap();
        let epoch = rt.make_epoch_rooted();
        rt.push_epoch(epoch);
        rt.defer(|rt| assert!(!rt.is_terminated(rt.current_epoch())));
        rt.pop_epoch();
        rt.finish_epoch(epoch);
        assert!(!rt.is_terminated(epoch));
        rt.wait_epoch(epoch).await.unwrap();
        rt.finalize().await.unwrap();
    }

    #[test]
    #[should_panic(expected = "nested")]
    fn nested_waits_are_bounded() {
        let mut rt = single();
        rt.config.max_nested_waits = 0;
        rt.drain_until(|_| true);
    }
}
