//! Callbacks: where the result of a collective goes once it is ready.
//!
//! A callback is either a closure that runs on the node holding the result,
//! or a route to a registered handler somewhere else. Routed results travel
//! still packed, so the node that fires the callback never decodes them.

use std::marker::PhantomData;

use tracing::{trace, warn};

use crate::{
    collection::{CollectionProxy, Index},
    fatal,
    messaging::{envelope::Target, pack_or_die},
    objgroup::ObjGroupProxy,
    payload::Payload,
    registry::{Handler, HandlerId, MemberHandler, ObjHandler},
    runtime::Runtime,
    NodeId,
};

/// A packed result, or none when nothing contributed.
pub(crate) type Finish = Box<dyn FnOnce(&mut Runtime, Option<Vec<u8>>) + Send>;

#[derive(Clone, Copy, Debug)]
enum Route {
    Node { node: NodeId, handler: HandlerId },
    Broadcast { handler: HandlerId },
    Element { proxy: CollectionProxy, index: Index, handler: HandlerId },
    ObjGroup { group: u64, node: NodeId, handler: HandlerId },
    ObjGroupBroadcast { group: u64, handler: HandlerId },
}

enum Kind<T> {
    Local(Box<dyn FnOnce(&mut Runtime, T) + Send>),
    Routed(Route),
}

/// Receives one `T`. Sends made by the receiver belong to the epoch that
/// was current when the callback was handed over.
pub struct Callback<T> {
    kind: Kind<T>,
    _marker: PhantomData<fn(T)>,
}

impl<T: Payload> Callback<T> {
    fn routed(route: Route) -> Self {
        Self {
            kind: Kind::Routed(route),
            _marker: PhantomData,
        }
    }

    /// Runs `f` on the node that holds the result.
    pub fn local<F>(f: F) -> Self
    where
        F: FnOnce(&mut Runtime, T) + Send + 'static,
    {
        Self {
            kind: Kind::Local(Box::new(f)),
            _marker: PhantomData,
        }
    }

    pub fn send(node: NodeId, handler: Handler<T>) -> Self {
        Self::routed(Route::Node {
            node,
            handler: handler.id(),
        })
    }

    pub fn broadcast(handler: Handler<T>) -> Self {
        Self::routed(Route::Broadcast {
            handler: handler.id(),
        })
    }

    /// Runs `handler` on the element at `index`, wherever it lives then.
    pub fn element<E>(proxy: CollectionProxy, index: Index, handler: MemberHandler<E, T>) -> Self {
        Self::routed(Route::Element {
            proxy,
            index,
            handler: handler.id(),
        })
    }

    pub fn objgroup<O>(proxy: ObjGroupProxy<O>, node: NodeId, handler: ObjHandler<O, T>) -> Self {
        Self::routed(Route::ObjGroup {
            group: proxy.id(),
            node,
            handler: handler.id(),
        })
    }

    pub fn objgroup_broadcast<O>(proxy: ObjGroupProxy<O>, handler: ObjHandler<O, T>) -> Self {
        Self::routed(Route::ObjGroupBroadcast {
            group: proxy.id(),
            handler: handler.id(),
        })
    }

    /// Delivers a value that is already at hand.
    pub fn fire(self, rt: &mut Runtime, value: T) {
        match self.kind {
            Kind::Local(f) => f(rt, value),
            Kind::Routed(route) => route.deliver(rt, pack_or_die(&value)),
        }
    }

    pub(crate) fn into_finish(self) -> Finish {
        match self.kind {
            Kind::Local(f) => Box::new(move |rt, bytes| match bytes {
                Some(bytes) => match T::unpack(&bytes) {
                    Ok(value) => f(rt, value),
                    Err(e) => fatal!("collective result does not decode: {}", e),
                },
                None => warn!("collective on node {} had no contributions", rt.this_node()),
            }),
            Kind::Routed(route) => Box::new(move |rt, bytes| match bytes {
                Some(bytes) => route.deliver(rt, bytes),
                None => warn!(
                    "collective on node {} had no contributions for {:?}",
                    rt.this_node(),
                    route
                ),
            }),
        }
    }
}

impl Route {
    fn deliver(self, rt: &mut Runtime, bytes: Vec<u8>) {
        trace!("callback to {:?}", self);
        let epoch = rt.current_epoch();
        match self {
            Route::Node { node, handler } => {
                let env = rt.envelope(handler, epoch, Target::Node);
                rt.post(node, env, bytes);
            }
            Route::Broadcast { handler } => {
                let env = rt.envelope(handler, epoch, Target::Node);
                rt.post_broadcast(env, bytes);
            }
            Route::Element {
                proxy,
                index,
                handler,
            } => rt.send_to_element(epoch, proxy, index, handler, bytes),
            Route::ObjGroup {
                group,
                node,
                handler,
            } => {
                let env = rt.envelope(handler, epoch, Target::ObjGroup(group));
                rt.post(node, env, bytes);
            }
            Route::ObjGroupBroadcast { group, handler } => {
                let env = rt.envelope(handler, epoch, Target::ObjGroup(group));
                rt.post_broadcast(env, bytes);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use rkyv::{Archive, Deserialize, Serialize};

    use super::*;
    use crate::{
        collection::ElementContext,
        registry::{ops, ElementType},
        world, ReduceOp, RuntimeConfig,
    };

    #[derive(Archive, Serialize, Deserialize, Debug, Default)]
    #[archive(check_bytes)]
    struct Slot {
        value: Option<u64>,
    }

    #[derive(Default)]
    struct Inbox {
        values: Vec<u64>,
    }

    #[derive(Clone, Copy)]
    struct Handles {
        sum: ReduceOp<u64>,
        heard: Handler<u64>,
        slot: ElementType<Slot>,
        store: MemberHandler<Slot, u64>,
        post: ObjHandler<Inbox, u64>,
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn reductions_reach_handlers_elements_and_groups() {
        world::init_test_tracing();
        let heard = Arc::new(Mutex::new(Vec::new()));
        let log = heard.clone();
        world::launch(
            3,
            RuntimeConfig::default(),
            move |reg| {
                let log = log.clone();
                Handles {
                    sum: reg.reduce_op("sum", ops::plus::<u64>),
                    heard: reg.handler("heard", move |rt: &mut Runtime, _: NodeId, v: u64| {
                        log.lock().unwrap().push((rt.this_node(), v));
                    }),
                    slot: reg.element_type("slot"),
                    store: reg.member(
                        "store",
                        |s: &mut Slot, _: &mut Runtime, _: &ElementContext, v: u64| s.value = Some(v),
                    ),
                    post: reg.objgroup("post", |i: &mut Inbox, _: &mut Runtime, _: NodeId, v: u64| {
                        i.values.push(v)
                    }),
                }
            },
            |mut rt, h| async move {
                rt.initialize().await?;
                let coll = rt.make_collection(h.slot, Index::d1(6), None, |_| Slot::default());
                let group = rt.make_objgroup(Inbox::default());
                let me = rt.this_node() as u64;
                let epoch = rt.collective_scope(|rt| {
                    rt.reduce_to(0, h.sum, me + 1, Callback::broadcast(h.heard));
                    rt.reduce_to(1, h.sum, 10, Callback::element(coll, Index::d1(4), h.store));
                    rt.reduce_to(2, h.sum, 1, Callback::objgroup(group, 0, h.post));
                });
                rt.wait_epoch(epoch).await?;
                if let Some(slot) = rt.local_element::<Slot>(coll, Index::d1(4)) {
                    assert_eq!(slot.value, Some(30));
                }
                if rt.this_node() == 0 {
                    let values = rt.local_objgroup(group).map(|i| i.values.clone());
                    assert_eq!(values, Some(vec![3]));
                }
                rt.finalize().await
            },
        )
        .await
        .unwrap();
        let mut heard = heard.lock().unwrap().clone();
        heard.sort_unstable();
        assert_eq!(heard, vec![(0, 6), (1, 6), (2, 6)]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn fired_values_go_straight_out() {
        world::init_test_tracing();
        let heard = Arc::new(Mutex::new(Vec::new()));
        let log = heard.clone();
        world::launch(
            2,
            RuntimeConfig::default(),
            move |reg| {
                let log = log.clone();
                reg.handler("heard", move |rt: &mut Runtime, from: NodeId, v: u64| {
                    log.lock().unwrap().push((rt.this_node(), from, v));
                })
            },
            |mut rt, heard| async move {
                rt.initialize().await?;
                if rt.this_node() == 0 {
                    let epoch = rt.rooted_scope(|rt| Callback::send(1, heard).fire(rt, 7));
                    rt.wait_epoch(epoch).await?;
                }
                rt.finalize().await
            },
        )
        .await
        .unwrap();
        assert_eq!(*heard.lock().unwrap(), vec![(1, 0, 7)]);
    }
}
