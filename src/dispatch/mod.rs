//! Dispatch Router
//!
//! Resolves inbound bus events against the [`DescriptorRegistry`](crate::registry::DescriptorRegistry)
//! and hands them to the single matching handler slot of a
//! [`BusAttachment`](crate::bus::BusAttachment), with an explicit
//! [`CallContext`] in place of an implicit receiver.

mod context;
mod handlers;
mod router;

pub use context::{CallContext, CallKind, DeferredReply, HandlerResult, Rejection};
pub use handlers::{
    CallHandler, HandlerTable, LifecycleHandler, PeerConnectedHandler, PeerDisconnectedHandler,
    PropGetAllHandler, PropGetHandler, PropSetHandler,
};
pub use router::{DispatchRouter, DispatchState, DispatchStats};

pub(crate) use router::{Caller, Routed, Target};
