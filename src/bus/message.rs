//! Bus messages exchanged between an attachment and its transport.

use crate::value::MsgValue;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use std::collections::BTreeMap;

/// Protocol error names carried by error replies.
pub mod error_names {
    /// Application handler rejected the request.
    pub const REJECTED: &str = "org.alljoyn.Bus.ErRejected";
    /// No served object, or the object lacks the interface.
    pub const SERVICE_UNKNOWN: &str = "org.freedesktop.DBus.Error.ServiceUnknown";
    /// The interface has no such member, or not of the requested kind.
    pub const UNKNOWN_METHOD: &str = "org.freedesktop.DBus.Error.UnknownMethod";
    /// Arguments do not match the declared signature.
    pub const INVALID_ARGS: &str = "org.freedesktop.DBus.Error.InvalidArgs";
    /// Property access mode forbids the operation.
    pub const ACCESS_DENIED: &str = "org.freedesktop.DBus.Error.AccessDenied";
    /// A SECURE object was called by an unauthenticated peer.
    pub const SECURITY_VIOLATION: &str = "org.alljoyn.Bus.SecurityViolation";
    /// The call did not complete in time.
    pub const TIMEOUT: &str = "org.alljoyn.Bus.Timeout";
}

/// Addressing shared by method calls and signals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageHeader {
    pub serial: u32,
    pub sender: String,
    /// `None` broadcasts.
    pub destination: Option<String>,
    pub path: String,
    pub interface: String,
    pub member: String,
    pub session_id: u32,
}

/// An object listed in an announcement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnnouncedObject {
    pub path: String,
    pub interfaces: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BusMessage {
    MethodCall {
        header: MessageHeader,
        args: Vec<MsgValue>,
    },
    Signal {
        header: MessageHeader,
        args: Vec<MsgValue>,
        sessionless: bool,
        ttl_s: u32,
    },
    MethodReply {
        sender: String,
        destination: String,
        reply_serial: u32,
        args: Vec<MsgValue>,
    },
    Error {
        sender: String,
        destination: String,
        reply_serial: u32,
        name: String,
        message: String,
    },
    Announce {
        sender: String,
        names: Vec<String>,
        port: u16,
        objects: Vec<AnnouncedObject>,
        about: BTreeMap<String, Json>,
    },
    JoinSession {
        sender: String,
        destination: String,
        port: u16,
        secure: bool,
    },
    JoinSessionReply {
        sender: String,
        destination: String,
        session_id: Option<u32>,
        secure: bool,
    },
    /// Retract sessionless signals previously sent by `sender` with the
    /// given serial.
    CancelSessionless { sender: String, serial: u32 },
    PeerLost { peer: String },
    PolicyChanged,
}

impl BusMessage {
    pub fn destination(&self) -> Option<&str> {
        match self {
            BusMessage::MethodCall { header, .. } | BusMessage::Signal { header, .. } => {
                header.destination.as_deref()
            }
            BusMessage::MethodReply { destination, .. }
            | BusMessage::Error { destination, .. }
            | BusMessage::JoinSession { destination, .. }
            | BusMessage::JoinSessionReply { destination, .. } => Some(destination),
            BusMessage::Announce { .. }
            | BusMessage::CancelSessionless { .. }
            | BusMessage::PeerLost { .. }
            | BusMessage::PolicyChanged => None,
        }
    }

    pub fn sender(&self) -> Option<&str> {
        match self {
            BusMessage::MethodCall { header, .. } | BusMessage::Signal { header, .. } => {
                Some(&header.sender)
            }
            BusMessage::MethodReply { sender, .. }
            | BusMessage::Error { sender, .. }
            | BusMessage::Announce { sender, .. }
            | BusMessage::JoinSession { sender, .. }
            | BusMessage::JoinSessionReply { sender, .. }
            | BusMessage::CancelSessionless { sender, .. } => Some(sender),
            BusMessage::PeerLost { .. } | BusMessage::PolicyChanged => None,
        }
    }

    /// Short label for logs.
    pub fn label(&self) -> &'static str {
        match self {
            BusMessage::MethodCall { .. } => "method_call",
            BusMessage::Signal { .. } => "signal",
            BusMessage::MethodReply { .. } => "method_reply",
            BusMessage::Error { .. } => "error",
            BusMessage::Announce { .. } => "announce",
            BusMessage::JoinSession { .. } => "join_session",
            BusMessage::JoinSessionReply { .. } => "join_session_reply",
            BusMessage::CancelSessionless { .. } => "cancel_sessionless",
            BusMessage::PeerLost { .. } => "peer_lost",
            BusMessage::PolicyChanged => "policy_changed",
        }
    }
}
