//! The handler registry maps handler ids to dispatch thunks.
//!
//! Registration order is the id assignment: the n-th registration of a kind
//! gets index n. Every node must therefore build its registry with the same
//! sequence of calls. The registry fingerprint (a blake3 digest over every
//! registration's kind and name) is compared during
//! [`Runtime::initialize`](crate::Runtime::initialize) and a mismatch aborts
//! the run.

use std::{any::Any, fmt, marker::PhantomData, sync::Arc};

use tracing::trace;

use crate::{
    collection::{Element, ElementContext, Index},
    fatal,
    hex::HexDisplayExt,
    messaging::envelope::{Envelope, Target},
    payload::Payload,
    runtime::{Runtime, SystemHandlers},
    Error, NodeId,
};

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum HandlerKind {
    FreeFunction = 0,
    Functor = 1,
    CollectionMember = 2,
    ObjGroupMember = 3,
    Mapping = 4,
    /// Restores migrated elements of one type.
    ElementType = 5,
}

impl TryFrom<u8> for HandlerKind {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => HandlerKind::FreeFunction,
            1 => HandlerKind::Functor,
            2 => HandlerKind::CollectionMember,
            3 => HandlerKind::ObjGroupMember,
            4 => HandlerKind::Mapping,
            5 => HandlerKind::ElementType,
            _ => Err(())?,
        })
    }
}

/// The top 8 bits hold the [`HandlerKind`], the rest the index into that
/// kind's table.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerId(u64);

const INDEX_MASK: u64 = (1 << 56) - 1;

impl HandlerId {
    fn new(kind: HandlerKind, index: usize) -> Self {
        Self(((kind as u64) << 56) | (index as u64 & INDEX_MASK))
    }

    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(&self) -> u64 {
        self.0
    }

    pub fn kind(&self) -> Option<HandlerKind> {
        HandlerKind::try_from((self.0 >> 56) as u8).ok()
    }

    pub fn index(&self) -> usize {
        (self.0 & INDEX_MASK) as usize
    }
}

impl fmt::Debug for HandlerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind() {
            Some(kind) => write!(f, "{:?}#{}", kind, self.index()),
            None => write!(f, "invalid({:x})", self.0),
        }
    }
}

impl fmt::Display for HandlerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

// typed handles are plain ids; the marker only pins the payload type
macro_rules! typed_handle {
    ($(#[$doc:meta])* $name:ident<$($p:ident),+>) => {
        $(#[$doc])*
        pub struct $name<$($p),+> {
            id: HandlerId,
            _marker: PhantomData<fn($($p),+)>,
        }

        impl<$($p),+> $name<$($p),+> {
            fn new(id: HandlerId) -> Self {
                Self { id, _marker: PhantomData }
            }

            pub fn id(&self) -> HandlerId {
                self.id
            }
        }

        impl<$($p),+> Clone for $name<$($p),+> {
            fn clone(&self) -> Self {
                *self
            }
        }

        impl<$($p),+> Copy for $name<$($p),+> {}

        impl<$($p),+> fmt::Debug for $name<$($p),+> {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({:?})", stringify!($name), self.id)
            }
        }
    };
}

typed_handle!(
    /// A node-level handler taking a `T`.
    Handler<T>
);
typed_handle!(
    /// A handler that runs against a collection element of type `E`.
    MemberHandler<E, T>
);
typed_handle!(
    /// A handler that runs against the local instance of object group `O`.
    ObjHandler<O, T>
);
typed_handle!(
    /// An associative, commutative combiner over `T`.
    ReduceOp<T>
);
typed_handle!(
    /// Restores snapshots of element type `E` on migration.
    ElementType<E>
);

/// An index-to-node placement function.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Mapping(HandlerId);

impl Mapping {
    pub fn id(&self) -> HandlerId {
        self.0
    }
}

/// A stateful handler object, registered under [`HandlerKind::Functor`].
pub trait Functor: Send + Sync + 'static {
    type Msg: Payload;

    fn call(&self, rt: &mut Runtime, from: NodeId, msg: Self::Msg);
}

pub(crate) type CallThunk =
    Arc<dyn Fn(&mut Runtime, &Envelope, &[u8]) + Send + Sync>;
pub(crate) type MemberThunk =
    Arc<dyn Fn(&mut Runtime, &mut dyn Any, &Envelope, &[u8]) + Send + Sync>;
pub(crate) type MappingThunk =
    Arc<dyn Fn(&Index, &Index, NodeId) -> NodeId + Send + Sync>;
pub(crate) type CombineThunk =
    Arc<dyn Fn(&[u8], &[u8]) -> Result<Vec<u8>, Error> + Send + Sync>;
pub(crate) type RestoreThunk =
    Arc<dyn Fn(&[u8]) -> Result<Box<dyn Element>, Error> + Send + Sync>;

/// What a handler id resolves to.
#[derive(Clone)]
pub(crate) enum Thunk {
    Call(CallThunk),
    Member(MemberThunk),
    Mapping(MappingThunk),
    Combine(CombineThunk),
    Restore(RestoreThunk),
}

struct Entry {
    name: String,
    thunk: Thunk,
}

#[derive(Default)]
struct Tables {
    free: Vec<Entry>,
    functor: Vec<Entry>,
    member: Vec<Entry>,
    objgroup: Vec<Entry>,
    mapping: Vec<Entry>,
    types: Vec<Entry>,
}

impl Tables {
    fn table(&self, kind: HandlerKind) -> &Vec<Entry> {
        match kind {
            HandlerKind::FreeFunction => &self.free,
            HandlerKind::Functor => &self.functor,
            HandlerKind::CollectionMember => &self.member,
            HandlerKind::ObjGroupMember => &self.objgroup,
            HandlerKind::Mapping => &self.mapping,
            HandlerKind::ElementType => &self.types,
        }
    }

    fn table_mut(&mut self, kind: HandlerKind) -> &mut Vec<Entry> {
        match kind {
            HandlerKind::FreeFunction => &mut self.free,
            HandlerKind::Functor => &mut self.functor,
            HandlerKind::CollectionMember => &mut self.member,
            HandlerKind::ObjGroupMember => &mut self.objgroup,
            HandlerKind::Mapping => &mut self.mapping,
            HandlerKind::ElementType => &mut self.types,
        }
    }
}

/// Collects registrations in call order. Obtained from
/// [`HandlerRegistry::builder`], which registers the runtime's own protocol
/// handlers before handing the builder out.
pub struct RegistryBuilder {
    tables: Tables,
    order: Vec<(HandlerKind, String)>,
    system: Option<SystemHandlers>,
}

impl RegistryBuilder {
    fn push(&mut self, kind: HandlerKind, name: &str, thunk: Thunk) -> HandlerId {
        let table = self.tables.table_mut(kind);
        let id = HandlerId::new(kind, table.len());
        table.push(Entry {
            name: name.to_string(),
            thunk,
        });
        self.order.push((kind, name.to_string()));
        trace!("registered {} as {:?}", name, id);
        id
    }

    /// Registers a free function handler.
    pub fn handler<T, F>(&mut self, name: &str, f: F) -> Handler<T>
    where
        T: Payload,
        F: Fn(&mut Runtime, NodeId, T) + Send + Sync + 'static,
    {
        let thunk: CallThunk = Arc::new(move |rt, env, bytes| {
            let msg = unpack_or_die::<T>(env, bytes);
            f(rt, env.from, msg)
        });
        Handler::new(self.push(HandlerKind::FreeFunction, name, Thunk::Call(thunk)))
    }

    /// Registers a functor object.
    pub fn functor<F: Functor>(&mut self, name: &str, functor: F) -> Handler<F::Msg> {
        let thunk: CallThunk = Arc::new(move |rt, env, bytes| {
            let msg = unpack_or_die::<F::Msg>(env, bytes);
            functor.call(rt, env.from, msg)
        });
        Handler::new(self.push(HandlerKind::Functor, name, Thunk::Call(thunk)))
    }

    /// Registers a handler that runs against a collection element.
    pub fn member<E, T, F>(&mut self, name: &str, f: F) -> MemberHandler<E, T>
    where
        E: Element,
        T: Payload,
        F: Fn(&mut E, &mut Runtime, &ElementContext, T) + Send + Sync + 'static,
    {
        let thunk: MemberThunk = Arc::new(move |rt, obj, env, bytes| {
            let elem = match obj.downcast_mut::<E>() {
                Some(elem) => elem,
                None => fatal!(
                    "handler {:?} invoked on an element of the wrong type",
                    env.handler
                ),
            };
            let ctx = match &env.target {
                Target::Element { proxy, index, .. } => ElementContext {
                    proxy: *proxy,
                    index: index.clone(),
                    from: env.from,
                },
                Target::Collection(proxy) => ElementContext {
                    proxy: *proxy,
                    index: rt.current_element_index(),
                    from: env.from,
                },
                _ => fatal!("member handler {:?} without an element", env.handler),
            };
            let msg = unpack_or_die::<T>(env, bytes);
            f(elem, rt, &ctx, msg)
        });
        MemberHandler::new(self.push(
            HandlerKind::CollectionMember,
            name,
            Thunk::Member(thunk),
        ))
    }

    /// Registers a handler that runs against an object group instance.
    pub fn objgroup<O, T, F>(&mut self, name: &str, f: F) -> ObjHandler<O, T>
    where
        O: Send + 'static,
        T: Payload,
        F: Fn(&mut O, &mut Runtime, NodeId, T) + Send + Sync + 'static,
    {
        let thunk: MemberThunk = Arc::new(move |rt, obj, env, bytes| {
            let obj = match obj.downcast_mut::<O>() {
                Some(obj) => obj,
                None => fatal!(
                    "handler {:?} invoked on an object group of the wrong type",
                    env.handler
                ),
            };
            let msg = unpack_or_die::<T>(env, bytes);
            f(obj, rt, env.from, msg)
        });
        ObjHandler::new(self.push(
            HandlerKind::ObjGroupMember,
            name,
            Thunk::Member(thunk),
        ))
    }

    /// Registers a placement function `(index, bounds, num_nodes) -> node`.
    pub fn mapping<F>(&mut self, name: &str, f: F) -> Mapping
    where
        F: Fn(&Index, &Index, NodeId) -> NodeId + Send + Sync + 'static,
    {
        Mapping(self.push(HandlerKind::Mapping, name, Thunk::Mapping(Arc::new(f))))
    }

    /// Registers a reduction operator. The operator must be associative and
    /// commutative since partial results combine in arrival order.
    pub fn reduce_op<T, F>(&mut self, name: &str, f: F) -> ReduceOp<T>
    where
        T: Payload,
        F: Fn(T, T) -> T + Send + Sync + 'static,
    {
        let thunk: CombineThunk = Arc::new(move |a, b| {
            let combined = f(T::unpack(a)?, T::unpack(b)?);
            combined.pack()
        });
        ReduceOp::new(self.push(HandlerKind::Functor, name, Thunk::Combine(thunk)))
    }

    /// Registers an element type so its snapshots can be restored on the
    /// receiving side of a migration.
    pub fn element_type<E: Element + Payload>(&mut self, name: &str) -> ElementType<E> {
        let thunk: RestoreThunk = Arc::new(|bytes| {
            let elem: Box<dyn Element> = Box::new(E::unpack(bytes)?);
            Ok(elem)
        });
        ElementType::new(self.push(HandlerKind::ElementType, name, Thunk::Restore(thunk)))
    }

    pub fn build(self) -> HandlerRegistry {
        let mut hasher = blake3::Hasher::new();
        for (kind, name) in &self.order {
            hasher.update(&[*kind as u8]);
            hasher.update(name.as_bytes());
            hasher.update(&[0]);
        }
        let system = match self.system {
            Some(system) => system,
            None => fatal!("registry built without protocol handlers"),
        };
        HandlerRegistry {
            tables: self.tables,
            fingerprint: *hasher.finalize().as_bytes(),
            system,
        }
    }
}

fn unpack_or_die<T: Payload>(env: &Envelope, bytes: &[u8]) -> T {
    match T::unpack(bytes) {
        Ok(msg) => msg,
        // the sender resolved the same id to a different payload type
        Err(e) => fatal!(
            "handler {:?} from node {} received an undecodable payload ({}); \
             nodes were built with different registries",
            env.handler,
            env.from,
            e
        ),
    }
}

/// The frozen registry. Shared by the runtime behind an `Arc` so thunks can
/// be cloned out and invoked with `&mut Runtime`.
pub struct HandlerRegistry {
    tables: Tables,
    fingerprint: [u8; 32],
    pub(crate) system: SystemHandlers,
}

impl HandlerRegistry {
    pub fn builder() -> RegistryBuilder {
        let mut builder = RegistryBuilder {
            tables: Tables::default(),
            order: Vec::new(),
            system: None,
        };
        builder.system = Some(SystemHandlers::register(&mut builder));
        builder
    }

    pub fn fingerprint(&self) -> [u8; 32] {
        self.fingerprint
    }

    pub fn len(&self) -> usize {
        [
            HandlerKind::FreeFunction,
            HandlerKind::Functor,
            HandlerKind::CollectionMember,
            HandlerKind::ObjGroupMember,
            HandlerKind::Mapping,
            HandlerKind::ElementType,
        ]
        .iter()
        .map(|kind| self.tables.table(*kind).len())
        .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn name(&self, id: HandlerId) -> Option<&str> {
        let kind = id.kind()?;
        self.tables
            .table(kind)
            .get(id.index())
            .map(|entry| entry.name.as_str())
    }

    /// Resolves an id. An id this registry never issued means the sender ran
    /// a different build, which is fatal.
    pub(crate) fn resolve(&self, id: HandlerId) -> Thunk {
        let entry = id
            .kind()
            .and_then(|kind| self.tables.table(kind).get(id.index()));
        match entry {
            Some(entry) => entry.thunk.clone(),
            None => fatal!(
                "handler id {:?} is not registered (registry {}); \
                 nodes were built with different registries",
                id,
                self.fingerprint.hex().short(8)
            ),
        }
    }

    pub(crate) fn call(&self, id: HandlerId) -> CallThunk {
        match self.resolve(id) {
            Thunk::Call(thunk) => thunk,
            _ => fatal!("handler id {:?} is not callable", id),
        }
    }

    pub(crate) fn member(&self, id: HandlerId) -> MemberThunk {
        match self.resolve(id) {
            Thunk::Member(thunk) => thunk,
            _ => fatal!("handler id {:?} is not a member handler", id),
        }
    }

    pub(crate) fn mapping(&self, id: HandlerId) -> MappingThunk {
        match self.resolve(id) {
            Thunk::Mapping(thunk) => thunk,
            _ => fatal!("handler id {:?} is not a mapping", id),
        }
    }

    pub(crate) fn combine(&self, id: HandlerId) -> CombineThunk {
        match self.resolve(id) {
            Thunk::Combine(thunk) => thunk,
            _ => fatal!("handler id {:?} is not a reduce operator", id),
        }
    }

    pub(crate) fn restore(&self, id: HandlerId) -> RestoreThunk {
        match self.resolve(id) {
            Thunk::Restore(thunk) => thunk,
            _ => fatal!("handler id {:?} is not an element type", id),
        }
    }
}

/// Stock reduction operators, to be handed to
/// [`RegistryBuilder::reduce_op`].
pub mod ops {
    use std::ops::{Add, BitAnd, BitOr, BitXor};

    pub fn plus<T: Add<Output = T>>(a: T, b: T) -> T {
        a + b
    }

    pub fn max<T: PartialOrd>(a: T, b: T) -> T {
        if b > a {
            b
        } else {
            a
        }
    }

    pub fn min<T: PartialOrd>(a: T, b: T) -> T {
        if b < a {
            b
        } else {
            a
        }
    }

    pub fn and(a: bool, b: bool) -> bool {
        a && b
    }

    pub fn or(a: bool, b: bool) -> bool {
        a || b
    }

    pub fn bit_and<T: BitAnd<Output = T>>(a: T, b: T) -> T {
        a & b
    }

    pub fn bit_or<T: BitOr<Output = T>>(a: T, b: T) -> T {
        a | b
    }

    pub fn bit_xor<T: BitXor<Output = T>>(a: T, b: T) -> T {
        a ^ b
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user_registry(extra: bool) -> (HandlerRegistry, Handler<u64>, Handler<u64>) {
        let mut reg = HandlerRegistry::builder();
        let a = reg.handler("a", |_: &mut Runtime, _: NodeId, _: u64| {});
        let b = reg.handler("b", |_: &mut Runtime, _: NodeId, _: u64| {});
        if extra {
            reg.handler("c", |_: &mut Runtime, _: NodeId, _: u64| {});
        }
        (reg.build(), a, b)
    }

    #[test]
    fn ids_encode_kind_and_index() {
        let id = HandlerId::new(HandlerKind::ObjGroupMember, 42);
        assert_eq!(id.kind(), Some(HandlerKind::ObjGroupMember));
        assert_eq!(id.index(), 42);
        assert_eq!(HandlerId::from_raw(id.raw()), id);
        assert_eq!(HandlerId::from_raw(0xff << 56).kind(), None);
    }

    #[test]
    fn registration_order_assigns_ids() {
        let (registry, a, b) = user_registry(false);
        assert_eq!(a.id().kind(), Some(HandlerKind::FreeFunction));
        assert_eq!(b.id().index(), a.id().index() + 1);
        assert_eq!(registry.name(a.id()), Some("a"));
        assert_eq!(registry.name(b.id()), Some("b"));
    }

    #[test]
    fn identical_builds_share_a_fingerprint() {
        let (one, ..) = user_registry(false);
        let (two, ..) = user_registry(false);
        let (three, ..) = user_registry(true);
        assert_eq!(one.fingerprint(), two.fingerprint());
        assert_ne!(one.fingerprint(), three.fingerprint());
        assert_eq!(three.len(), one.len() + 1);
    }

    #[test]
    fn combine_thunk_applies_operator() {
        let mut reg = HandlerRegistry::builder();
        let sum = reg.reduce_op("sum", ops::plus::<u64>);
        let max = reg.reduce_op("max", ops::max::<u64>);
        let registry = reg.build();
        let (a, b) = (3u64.pack().unwrap(), 9u64.pack().unwrap());
        let combined = registry.combine(sum.id())(&a, &b).unwrap();
        assert_eq!(u64::unpack(&combined).unwrap(), 12);
        let combined = registry.combine(max.id())(&a, &b).unwrap();
        assert_eq!(u64::unpack(&combined).unwrap(), 9);
    }

    #[test]
    #[should_panic(expected = "not registered")]
    fn unknown_id_is_fatal() {
        let (registry, ..) = user_registry(false);
        registry.resolve(HandlerId::new(HandlerKind::FreeFunction, 10_000));
    }

    #[test]
    fn stock_operators() {
        assert_eq!(ops::min(4, 2), 2);
        assert!(!ops::and(true, false));
        assert!(ops::or(true, false));
        assert_eq!(ops::bit_xor(0b1100u8, 0b1010), 0b0110);
        assert_eq!(ops::bit_and(0b1100u8, 0b1010), 0b1000);
        assert_eq!(ops::bit_or(0b1100u8, 0b1010), 0b1110);
    }
}
