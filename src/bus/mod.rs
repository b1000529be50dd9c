//! Bus Attachment
//!
//! Per-connection state: lifecycle hooks, discovery and sessions, the event
//! loop that drives dispatch, and the [`Transport`] seam to the bus engine.
//! [`LoopbackBus`] is an in-process engine used by the binary and the tests.

mod attachment;
pub(crate) mod link;
mod loopback;
pub mod message;
mod transport;

pub use attachment::{BusAttachment, FoundCallback, PeerInfo, ServiceName};
pub use loopback::{LoopbackBus, LoopbackTransport};
pub use message::{error_names, AnnouncedObject, BusMessage, MessageHeader};
pub use transport::Transport;
