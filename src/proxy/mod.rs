//! Remote Proxy Factory
//!
//! A [`RemoteServiceProxy`] stands for one discovered peer object. It is an
//! `Rc` handle owned by the application: the attachment only keeps `Weak`
//! back-references for delivering replies. Once every handle is dropped (or
//! [`RemoteServiceProxy::close`] is called) the reply slots of calls still in
//! flight can no longer fire.

use crate::bus::error_names;
use crate::bus::link::{BusLink, PendingEntry};
use crate::bus::{BusAttachment, BusMessage, MessageHeader};
use crate::core::error::{AjsResult, ResourceError, TransportError};
use crate::registry::{Member, PROPERTIES_INTERFACE};
use crate::signature::Signature;
use crate::value::{check_values, MsgValue};
use serde_json::Value as Json;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::rc::{Rc, Weak};
use thiserror::Error;

/// `onReply` callback: receives the reply arguments.
pub type ReplyCallback = Box<dyn FnOnce(&mut BusAttachment, Vec<MsgValue>)>;
/// Error callback for an outbound call.
pub type ErrorCallback = Box<dyn FnOnce(&mut BusAttachment, CallError)>;

/// Why an outbound call did not produce a reply.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CallError {
    #[error("remote error {name}: {message}")]
    Remote { name: String, message: String },

    #[error("call timed out")]
    Timeout,

    #[error("peer was lost before replying")]
    PeerLost,

    #[error("bus attachment detached")]
    Detached,

    #[error("send failed: {0}")]
    Send(TransportError),

    #[error("reply does not match the declared shape: {0}")]
    InvalidReply(String),
}

impl CallError {
    /// Protocol error name, for errors that came from the remote side.
    pub fn name(&self) -> &str {
        match self {
            CallError::Remote { name, .. } => name,
            CallError::Timeout => error_names::TIMEOUT,
            _ => "",
        }
    }
}

/// How a reply is unpacked before it reaches `onReply`.
#[derive(Debug, Clone)]
enum ReplyUnwrap {
    Method(Signature),
    Property,
    PropertyMap,
    Ack,
}

impl ReplyUnwrap {
    fn apply(&self, args: Vec<MsgValue>) -> Result<Vec<MsgValue>, String> {
        match self {
            ReplyUnwrap::Method(sig) => {
                check_values(&args, sig)?;
                Ok(args)
            }
            ReplyUnwrap::Property => match <[MsgValue; 1]>::try_from(args) {
                Ok([value]) => Ok(vec![value.into_inner()]),
                Err(args) => Err(format!("Get reply carries {} values", args.len())),
            },
            ReplyUnwrap::PropertyMap => match <[MsgValue; 1]>::try_from(args) {
                Ok([MsgValue::Dict(entries)]) => Ok(vec![MsgValue::Dict(
                    entries.into_iter().map(|(k, v)| (k, v.into_inner())).collect(),
                )]),
                _ => Err("GetAll reply is not a property map".to_string()),
            },
            ReplyUnwrap::Ack => Ok(Vec::new()),
        }
    }
}

struct ReplySlot {
    unwrap: ReplyUnwrap,
    on_reply: Option<ReplyCallback>,
    on_error: Option<ErrorCallback>,
}

pub(crate) struct ProxyInner {
    peer: String,
    path: String,
    session_id: u32,
    interfaces: Vec<String>,
    link: Rc<BusLink>,
    valid: Cell<bool>,
    slots: RefCell<HashMap<u32, ReplySlot>>,
}

impl ProxyInner {
    pub(crate) fn peer(&self) -> &str {
        &self.peer
    }

    pub(crate) fn invalidate(&self) {
        self.valid.set(false);
    }
}

/// Handle to a service object on a remote peer.
#[derive(Clone)]
pub struct RemoteServiceProxy {
    inner: Rc<ProxyInner>,
}

impl RemoteServiceProxy {
    pub(crate) fn new(
        peer: &str,
        path: &str,
        session_id: u32,
        interfaces: Vec<String>,
        link: Rc<BusLink>,
    ) -> Self {
        Self {
            inner: Rc::new(ProxyInner {
                peer: peer.to_string(),
                path: path.to_string(),
                session_id,
                interfaces,
                link,
                valid: Cell::new(true),
                slots: RefCell::new(HashMap::new()),
            }),
        }
    }

    pub(crate) fn downgrade(&self) -> Weak<ProxyInner> {
        Rc::downgrade(&self.inner)
    }

    /// Unique bus name of the peer.
    pub fn peer(&self) -> &str {
        &self.inner.peer
    }

    pub fn path(&self) -> &str {
        &self.inner.path
    }

    pub fn session_id(&self) -> u32 {
        self.inner.session_id
    }

    pub fn interfaces(&self) -> &[String] {
        &self.inner.interfaces
    }

    /// False once the peer disconnected, the attachment detached or the proxy
    /// was closed.
    pub fn is_valid(&self) -> bool {
        self.inner.valid.get() && self.inner.link.is_open()
    }

    /// Calls still waiting for a reply.
    pub fn pending_calls(&self) -> usize {
        self.inner.slots.borrow().len()
    }

    /// Invalidate this proxy and drop its reply slots. Replies still in
    /// flight are discarded when they arrive.
    pub fn close(&self) {
        self.inner.invalidate();
        self.inner.slots.borrow_mut().clear();
    }

    fn check_usable(&self) -> AjsResult<()> {
        if !self.inner.link.is_open() {
            return Err(TransportError::Detached.into());
        }
        if !self.inner.valid.get() {
            return Err(ResourceError::ProxyInvalid {
                peer: self.inner.peer.clone(),
            }
            .into());
        }
        Ok(())
    }

    fn find_member(&self, name: &str, want: impl Fn(&Member) -> bool) -> Option<(&str, &Member)> {
        self.inner.interfaces.iter().find_map(|iface| {
            let member = self.inner.link.interface(iface)?.member(name)?;
            want(member).then_some((iface.as_str(), member))
        })
    }

    /// Method handle for `name`, looked up across the proxy's interfaces.
    pub fn method(&self, name: &str) -> AjsResult<MethodHandle> {
        let (iface, member) = self
            .find_member(name, |m| matches!(m, Member::Method { .. }))
            .ok_or_else(|| ResourceError::UnknownMember {
                member: name.to_string(),
            })?;
        Ok(MethodHandle {
            proxy: self.clone(),
            iface: iface.to_string(),
            member: name.to_string(),
            args: member.in_signature(),
            returns: member.out_signature(),
            timeout_ms: None,
        })
    }

    /// Method handle on an explicit interface.
    pub fn method_on(&self, iface: &str, name: &str) -> AjsResult<MethodHandle> {
        let member = self
            .inner
            .link
            .interface(iface)
            .and_then(|i| i.member(name))
            .filter(|m| matches!(m, Member::Method { .. }))
            .ok_or_else(|| ResourceError::UnknownMember {
                member: format!("{iface}.{name}"),
            })?;
        Ok(MethodHandle {
            proxy: self.clone(),
            iface: iface.to_string(),
            member: name.to_string(),
            args: member.in_signature(),
            returns: member.out_signature(),
            timeout_ms: None,
        })
    }

    /// Signal sender addressed to this peer over its session.
    pub fn signal(&self, path: &str, iface: &str, name: &str) -> AjsResult<SignalSender> {
        self.check_usable()?;
        let mut sender = SignalSender::new(Rc::clone(&self.inner.link), path, iface, name)?;
        sender.destination = Some(self.inner.peer.clone());
        sender.session_id = self.inner.session_id;
        Ok(sender)
    }

    fn property(&self, name: &str) -> AjsResult<(String, &Member)> {
        self.find_member(name, |m| matches!(m, Member::Property { .. }))
            .map(|(iface, m)| (iface.to_string(), m))
            .ok_or_else(|| {
                ResourceError::UnknownMember {
                    member: name.to_string(),
                }
                .into()
            })
    }

    /// Read a property through `org.freedesktop.DBus.Properties.Get`.
    pub fn get_prop(&self, name: &str) -> AjsResult<PendingCall> {
        let (iface, member) = self.property(name)?;
        if let Member::Property { access, .. } = member {
            if !access.readable() {
                return Err(ResourceError::PropertyAccess {
                    property: name.to_string(),
                    wanted: "readable",
                }
                .into());
            }
        }
        self.send_call(
            PROPERTIES_INTERFACE,
            "Get",
            vec![iface.into(), name.into()],
            ReplyUnwrap::Property,
            None,
        )
    }

    /// Write a property through `org.freedesktop.DBus.Properties.Set`.
    pub fn set_prop(&self, name: &str, value: impl Into<MsgValue>) -> AjsResult<PendingCall> {
        let (iface, member) = self.property(name)?;
        let value = value.into();
        if let Member::Property { access, signature } = member {
            if !access.writable() {
                return Err(ResourceError::PropertyAccess {
                    property: name.to_string(),
                    wanted: "writable",
                }
                .into());
            }
            if !value.conforms(signature) {
                return Err(ResourceError::ArgumentMismatch {
                    member: name.to_string(),
                    detail: format!("{} where '{signature}' is declared", value.type_label()),
                }
                .into());
            }
        }
        self.send_call(
            PROPERTIES_INTERFACE,
            "Set",
            vec![iface.into(), name.into(), MsgValue::Variant(Box::new(value))],
            ReplyUnwrap::Ack,
            None,
        )
    }

    /// Set a property from JSON, converted to its declared type.
    pub fn set_prop_json(&self, name: &str, value: &Json) -> AjsResult<PendingCall> {
        let (_, member) = self.property(name)?;
        let converted = match member {
            Member::Property { signature, .. } => MsgValue::from_json(value, signature)?,
            _ => MsgValue::infer_from_json(value),
        };
        self.set_prop(name, converted)
    }

    /// Read every property of `iface` through `GetAll`. The reply is a single
    /// dict of property name to value.
    pub fn get_all_props(&self, iface: &str) -> AjsResult<PendingCall> {
        if !self.inner.interfaces.iter().any(|i| i == iface) {
            return Err(ResourceError::UnknownMember {
                member: iface.to_string(),
            }
            .into());
        }
        self.send_call(
            PROPERTIES_INTERFACE,
            "GetAll",
            vec![iface.into()],
            ReplyUnwrap::PropertyMap,
            None,
        )
    }

    fn send_call(
        &self,
        iface: &str,
        member: &str,
        args: Vec<MsgValue>,
        unwrap: ReplyUnwrap,
        timeout_ms: Option<u64>,
    ) -> AjsResult<PendingCall> {
        self.check_usable()?;
        let link = &self.inner.link;
        let serial = link.next_serial();
        link.push(BusMessage::MethodCall {
            header: MessageHeader {
                serial,
                sender: link.unique_name().to_string(),
                destination: Some(self.inner.peer.clone()),
                path: self.inner.path.clone(),
                interface: iface.to_string(),
                member: member.to_string(),
                session_id: self.inner.session_id,
            },
            args,
        })?;
        self.inner.slots.borrow_mut().insert(
            serial,
            ReplySlot {
                unwrap,
                on_reply: None,
                on_error: None,
            },
        );
        link.track_pending(
            serial,
            PendingEntry {
                proxy: self.downgrade(),
                peer: self.inner.peer.clone(),
                deadline: match timeout_ms {
                    Some(0) => None,
                    Some(ms) => Some(link.now().saturating_add(ms)),
                    None => link.call_deadline(),
                },
            },
        );
        tracing::debug!(target: "ajs.proxy", peer = %self.inner.peer, iface, member, serial, "call sent");
        Ok(PendingCall {
            serial,
            proxy: self.downgrade(),
        })
    }
}

impl fmt::Debug for RemoteServiceProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteServiceProxy")
            .field("peer", &self.inner.peer)
            .field("path", &self.inner.path)
            .field("session_id", &self.inner.session_id)
            .field("valid", &self.is_valid())
            .finish()
    }
}

/// A method on a remote proxy, bound to its interface and signatures.
pub struct MethodHandle {
    proxy: RemoteServiceProxy,
    iface: String,
    member: String,
    args: Signature,
    returns: Signature,
    timeout_ms: Option<u64>,
}

impl MethodHandle {
    pub fn iface(&self) -> &str {
        &self.iface
    }

    pub fn member(&self) -> &str {
        &self.member
    }

    /// Override the configured call timeout for calls made through this
    /// handle. `0` waits forever.
    pub fn timeout(mut self, ms: u64) -> Self {
        self.timeout_ms = Some(ms);
        self
    }

    /// Send the call. The reply is delivered on a later poll, never inline.
    pub fn call(&self, args: Vec<MsgValue>) -> AjsResult<PendingCall> {
        check_values(&args, &self.args).map_err(|detail| ResourceError::ArgumentMismatch {
            member: self.member.clone(),
            detail,
        })?;
        self.proxy.send_call(
            &self.iface,
            &self.member,
            args,
            ReplyUnwrap::Method(self.returns.clone()),
            self.timeout_ms,
        )
    }

    /// Send the call with JSON arguments converted to the declared types.
    pub fn call_json(&self, args: &[Json]) -> AjsResult<PendingCall> {
        let args = MsgValue::list_from_json(args, &self.args)?;
        self.call(args)
    }
}

/// A call in flight. Assign `on_reply` (and optionally `on_error`) before
/// returning to the loop; at most one of them fires, once.
#[must_use = "a reply slot that is never assigned drops the reply"]
pub struct PendingCall {
    serial: u32,
    proxy: Weak<ProxyInner>,
}

impl PendingCall {
    pub fn serial(&self) -> u32 {
        self.serial
    }

    /// True while the reply can still be delivered.
    pub fn is_pending(&self) -> bool {
        self.proxy
            .upgrade()
            .is_some_and(|p| p.slots.borrow().contains_key(&self.serial))
    }

    pub fn on_reply(self, f: impl FnOnce(&mut BusAttachment, Vec<MsgValue>) + 'static) -> Self {
        if let Some(proxy) = self.proxy.upgrade() {
            if let Some(slot) = proxy.slots.borrow_mut().get_mut(&self.serial) {
                slot.on_reply = Some(Box::new(f));
            }
        }
        self
    }

    pub fn on_error(self, f: impl FnOnce(&mut BusAttachment, CallError) + 'static) -> Self {
        if let Some(proxy) = self.proxy.upgrade() {
            if let Some(slot) = proxy.slots.borrow_mut().get_mut(&self.serial) {
                slot.on_error = Some(Box::new(f));
            }
        }
        self
    }
}

/// Deliver the outcome of an outbound call to its reply slot.
///
/// Nothing fires when the proxy was released or closed.
pub(crate) fn complete(
    bus: &mut BusAttachment,
    serial: u32,
    entry: PendingEntry,
    result: Result<Vec<MsgValue>, CallError>,
) {
    let Some(proxy) = entry.proxy.upgrade() else {
        tracing::debug!(target: "ajs.proxy", serial, peer = %entry.peer, "reply for released proxy dropped");
        return;
    };
    let Some(slot) = proxy.slots.borrow_mut().remove(&serial) else {
        tracing::debug!(target: "ajs.proxy", serial, "reply slot already gone");
        return;
    };
    drop(proxy);

    let result = result.and_then(|args| slot.unwrap.apply(args).map_err(CallError::InvalidReply));
    match result {
        Ok(args) => match slot.on_reply {
            Some(on_reply) => on_reply(bus, args),
            None => tracing::debug!(target: "ajs.proxy", serial, "reply arrived with no onReply assigned"),
        },
        Err(err) => match slot.on_error {
            Some(on_error) => on_error(bus, err),
            None => tracing::debug!(target: "ajs.proxy", serial, %err, "call failed with no error slot"),
        },
    }
}

/// Builder for an outbound signal.
#[derive(Clone)]
pub struct SignalSender {
    link: Rc<BusLink>,
    destination: Option<String>,
    session_id: u32,
    path: String,
    iface: String,
    member: String,
    signature: Signature,
    sessionless: bool,
    ttl_s: u32,
}

impl SignalSender {
    pub(crate) fn new(link: Rc<BusLink>, path: &str, iface: &str, member: &str) -> AjsResult<Self> {
        let signature = link
            .interface(iface)
            .and_then(|i| i.member(member))
            .filter(|m| matches!(m, Member::Signal { .. }))
            .map(Member::in_signature)
            .ok_or_else(|| ResourceError::UnknownMember {
                member: format!("{iface}.{member}"),
            })?;
        let ttl_s = link.sessionless_ttl_s();
        Ok(Self {
            link,
            destination: None,
            session_id: 0,
            path: path.to_string(),
            iface: iface.to_string(),
            member: member.to_string(),
            signature,
            sessionless: false,
            ttl_s,
        })
    }

    /// Deliver without a session, to every attachment with a match rule.
    pub fn sessionless(mut self, sessionless: bool) -> Self {
        self.sessionless = sessionless;
        self
    }

    /// Seconds a sessionless signal stays available to late joiners.
    pub fn time_to_live(mut self, ttl_s: u32) -> Self {
        self.ttl_s = ttl_s;
        self
    }

    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    /// Send with JSON arguments converted to the declared types.
    pub fn send_json(&self, args: &[Json]) -> AjsResult<u32> {
        let args = MsgValue::list_from_json(args, &self.signature)?;
        self.send(args)
    }

    /// Fire-and-forget. Returns the serial, which identifies a sessionless
    /// signal for cancellation.
    pub fn send(&self, args: Vec<MsgValue>) -> AjsResult<u32> {
        check_values(&args, &self.signature).map_err(|detail| ResourceError::ArgumentMismatch {
            member: self.member.clone(),
            detail,
        })?;
        let serial = self.link.next_serial();
        let header = |destination: Option<String>, session_id: u32| MessageHeader {
            serial,
            sender: self.link.unique_name().to_string(),
            destination,
            path: self.path.clone(),
            interface: self.iface.clone(),
            member: self.member.clone(),
            session_id,
        };

        if self.sessionless || self.destination.is_some() {
            let (destination, session_id) = match &self.destination {
                Some(dest) => (Some(dest.clone()), self.session_id),
                None => (None, 0),
            };
            self.link.push(BusMessage::Signal {
                header: header(destination, session_id),
                args,
                sessionless: self.sessionless,
                ttl_s: if self.sessionless { self.ttl_s } else { 0 },
            })?;
        } else {
            let peers = self.link.session_peers();
            if peers.is_empty() {
                tracing::debug!(target: "ajs.proxy", member = %self.member, "session signal sent with no joined peers");
            }
            for (peer, session_id) in peers {
                self.link.push(BusMessage::Signal {
                    header: header(Some(peer), session_id),
                    args: args.clone(),
                    sessionless: false,
                    ttl_s: 0,
                })?;
            }
        }
        Ok(serial)
    }
}

impl fmt::Debug for SignalSender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignalSender")
            .field("path", &self.path)
            .field("iface", &self.iface)
            .field("member", &self.member)
            .field("sessionless", &self.sessionless)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BusConfig;
    use crate::core::error::AjsError;
    use crate::registry::{Access, InterfaceDescriptor};
    use std::collections::BTreeMap;

    const IFACE: &str = "org.alljoyn.alljoyn_test";

    fn link() -> Rc<BusLink> {
        let iface = InterfaceDescriptor::builder(IFACE)
            .method("my_ping", &["s"], &["s"])
            .signal("my_signal", &["s"])
            .property("int_val", "i", Access::ReadWrite)
            .property("ro_val", "s", Access::Read)
            .build()
            .unwrap();
        let mut interfaces = BTreeMap::new();
        interfaces.insert(IFACE.to_string(), iface);
        Rc::new(BusLink::new(":loop.1", &BusConfig::default(), interfaces, 0))
    }

    fn proxy(link: &Rc<BusLink>) -> RemoteServiceProxy {
        RemoteServiceProxy::new(":loop.2", "/org/alljoyn/alljoyn_test", 7, vec![IFACE.to_string()], Rc::clone(link))
    }

    #[test]
    fn test_method_call_queues_message() {
        let link = link();
        let proxy = proxy(&link);
        let call = proxy.method("my_ping").unwrap().call(vec!["hello".into()]).unwrap();
        assert!(call.is_pending());
        let out = link.drain_outbox();
        match out.as_slice() {
            [BusMessage::MethodCall { header, args }] => {
                assert_eq!(header.member, "my_ping");
                assert_eq!(header.destination.as_deref(), Some(":loop.2"));
                assert_eq!(header.session_id, 7);
                assert_eq!(args, &vec![MsgValue::from("hello")]);
            }
            other => panic!("unexpected outbox {other:?}"),
        }
        assert_eq!(link.pending_len(), 1);
    }

    #[test]
    fn test_unknown_method_and_bad_args() {
        let link = link();
        let proxy = proxy(&link);
        assert!(matches!(
            proxy.method("nonexistent"),
            Err(AjsError::Resource(ResourceError::UnknownMember { .. }))
        ));
        let err = proxy.method("my_ping").unwrap().call(vec![MsgValue::Int32(1)]).err().unwrap();
        assert!(matches!(err, AjsError::Resource(ResourceError::ArgumentMismatch { .. })));
    }

    #[test]
    fn test_property_access_checked_locally() {
        let link = link();
        let proxy = proxy(&link);
        assert!(matches!(
            proxy.set_prop("ro_val", "x"),
            Err(AjsError::Resource(ResourceError::PropertyAccess { wanted: "writable", .. }))
        ));
        let _call = proxy.set_prop("int_val", 42i32).unwrap();
        let out = link.drain_outbox();
        let [BusMessage::MethodCall { header, args }] = out.as_slice() else {
            panic!("expected one call");
        };
        assert_eq!(header.interface, PROPERTIES_INTERFACE);
        assert_eq!(header.member, "Set");
        assert_eq!(args[2], MsgValue::variant(42i32));
    }

    #[test]
    fn test_closed_proxy_rejects_calls() {
        let link = link();
        let proxy = proxy(&link);
        let call = proxy.get_prop("int_val").unwrap();
        proxy.close();
        assert!(!call.is_pending());
        assert!(!proxy.is_valid());
        assert!(matches!(
            proxy.get_prop("int_val"),
            Err(AjsError::Resource(ResourceError::ProxyInvalid { .. }))
        ));
    }

    #[test]
    fn test_dropped_proxy_leaves_call_unfulfillable() {
        let link = link();
        let call = proxy(&link).method("my_ping").unwrap().call(vec!["x".into()]).unwrap();
        assert!(!call.is_pending());
        let entry = link.take_pending(call.serial()).unwrap();
        assert!(entry.proxy.upgrade().is_none());
    }

    #[test]
    fn test_reply_unwrap() {
        assert_eq!(
            ReplyUnwrap::Property.apply(vec![MsgValue::variant(42i32)]).unwrap(),
            vec![MsgValue::Int32(42)]
        );
        let map = ReplyUnwrap::PropertyMap
            .apply(vec![MsgValue::Dict(vec![("a".into(), MsgValue::variant(true))])])
            .unwrap();
        assert_eq!(map, vec![MsgValue::Dict(vec![("a".into(), MsgValue::Bool(true))])]);
        assert!(ReplyUnwrap::Method(Signature::parse("s").unwrap())
            .apply(vec![MsgValue::Int32(1)])
            .is_err());
    }

    #[test]
    fn test_session_signal_fans_out() {
        let link = link();
        link.add_session(":loop.2", 11);
        link.add_session(":loop.3", 12);
        let sender = SignalSender::new(Rc::clone(&link), "/sig", IFACE, "my_signal").unwrap();
        sender.send(vec!["hi".into()]).unwrap();
        let out = link.drain_outbox();
        assert_eq!(out.len(), 2);
        assert!(out.iter().all(|m| matches!(m, BusMessage::Signal { sessionless: false, .. })));

        let sessionless = sender.sessionless(true).time_to_live(5);
        sessionless.send(vec!["hi".into()]).unwrap();
        assert!(matches!(
            link.drain_outbox().as_slice(),
            [BusMessage::Signal { sessionless: true, ttl_s: 5, .. }]
        ));
    }
}
