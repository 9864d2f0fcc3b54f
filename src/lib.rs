//! A message-driven runtime for distributed work.
//!
//! Every node runs one cooperative scheduler ([`Runtime`]) that drains a
//! queue of ready active messages and polls a [`Transport`]. Work is scoped
//! by epochs whose quiescence is detected by the termination layer; collection
//! elements are addressed by index, can migrate, and can be chained into task
//! rounds whose ordering is resolved through epochs.

pub mod callback;
pub mod collection;
pub mod collective;
pub mod config;
pub mod error;
pub mod hex;
pub mod lb;
pub mod messaging;
pub mod objgroup;
pub mod payload;
pub mod registry;
pub mod runtime;
pub mod tasks;
pub mod termination;
pub mod world;
mod worker;

/// Names one participant of a run. `0 <= node < num_nodes`.
pub type NodeId = u32;

pub use callback::Callback;
pub use collection::{CollectionProxy, ElementContext, Index};
pub use config::RuntimeConfig;
pub use error::Error;
pub use messaging::transport::{LocalWorld, Transport};
pub use objgroup::ObjGroupProxy;
pub use payload::Payload;
pub use registry::{
    Handler, HandlerId, HandlerKind, HandlerRegistry, Mapping, MemberHandler,
    ObjHandler, ReduceOp, RegistryBuilder,
};
pub use runtime::Runtime;
pub use tasks::{TaskHandle, TaskId, TaskStats};
pub use termination::epoch::EpochId;
