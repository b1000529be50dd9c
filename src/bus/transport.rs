//! Transport seam between a [`BusAttachment`](super::BusAttachment) and the
//! bus engine that actually moves messages.

use super::message::BusMessage;
use crate::core::error::TransportError;
use crate::registry::SecurityDefinition;

/// A connection to a bus engine.
///
/// Implementations queue inbound messages until the attachment polls them;
/// `send` must never deliver to the sending attachment synchronously.
pub trait Transport {
    /// Unique name assigned by the bus for this connection.
    fn unique_name(&self) -> &str;

    fn send(&self, msg: BusMessage) -> Result<(), TransportError>;

    fn receive(&self) -> Option<BusMessage>;

    fn is_connected(&self) -> bool;

    fn close(&self);

    /// Hand the credential bundle to the engine's security layer.
    fn set_security(&self, _security: Option<&SecurityDefinition>) {}
}
