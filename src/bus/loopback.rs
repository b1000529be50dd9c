//! In-process bus engine.
//!
//! `LoopbackBus` routes messages between attachments living in the same
//! thread. It assigns unique names, replays announcements and unexpired
//! sessionless signals to late joiners, and reports lost peers. Delivery only
//! enqueues: nothing reaches an attachment until it polls.

use super::message::{BusMessage, MessageHeader};
use super::transport::Transport;
use crate::core::error::TransportError;
use crate::registry::SecurityDefinition;
use std::cell::RefCell;
use std::collections::{BTreeMap, VecDeque};
use std::rc::Rc;

#[derive(Default)]
struct Endpoint {
    inbox: VecDeque<BusMessage>,
    security: Option<SecurityDefinition>,
}

struct CachedSignal {
    msg: BusMessage,
    expires_at: u64,
}

#[derive(Default)]
struct Fabric {
    next_id: u32,
    now_ms: u64,
    endpoints: BTreeMap<String, Endpoint>,
    announcements: BTreeMap<String, BusMessage>,
    sessionless: Vec<CachedSignal>,
    sent: u64,
}

impl Fabric {
    fn deliver(&mut self, to: &str, msg: BusMessage) -> Result<(), TransportError> {
        let endpoint = self
            .endpoints
            .get_mut(to)
            .ok_or_else(|| TransportError::PeerUnreachable(to.to_string()))?;
        endpoint.inbox.push_back(msg);
        Ok(())
    }

    fn broadcast(&mut self, from: &str, msg: &BusMessage) {
        for (name, endpoint) in self.endpoints.iter_mut() {
            if name != from {
                endpoint.inbox.push_back(msg.clone());
            }
        }
    }

    fn purge_expired(&mut self) {
        let now = self.now_ms;
        self.sessionless.retain(|c| c.expires_at > now);
    }

    fn route(&mut self, from: &str, msg: BusMessage) -> Result<(), TransportError> {
        if !self.endpoints.contains_key(from) {
            return Err(TransportError::Closed);
        }
        self.sent += 1;
        tracing::trace!(target: "ajs.bus", from, kind = msg.label(), "loopback route");
        match msg {
            BusMessage::Announce { .. } => {
                self.broadcast(from, &msg);
                self.announcements.insert(from.to_string(), msg);
                Ok(())
            }
            BusMessage::Signal {
                sessionless: true,
                ttl_s,
                ref header,
                ..
            } if header.destination.is_none() => {
                self.broadcast(from, &msg);
                if ttl_s > 0 {
                    self.sessionless.push(CachedSignal {
                        expires_at: self.now_ms.saturating_add(u64::from(ttl_s) * 1000),
                        msg,
                    });
                }
                Ok(())
            }
            BusMessage::CancelSessionless { ref sender, serial } => {
                self.sessionless.retain(|c| match &c.msg {
                    BusMessage::Signal { header, .. } => {
                        !(header.sender == *sender && header.serial == serial)
                    }
                    _ => true,
                });
                Ok(())
            }
            other => match other.destination().map(str::to_string) {
                Some(to) => self.deliver(&to, other),
                None => {
                    self.broadcast(from, &other);
                    Ok(())
                }
            },
        }
    }

    fn remove(&mut self, name: &str) {
        if self.endpoints.remove(name).is_none() {
            return;
        }
        self.announcements.remove(name);
        let lost = BusMessage::PeerLost {
            peer: name.to_string(),
        };
        self.broadcast(name, &lost);
        tracing::debug!(target: "ajs.bus", peer = name, "loopback endpoint removed");
    }
}

/// A process-local bus. Cloning shares the same fabric.
#[derive(Clone, Default)]
pub struct LoopbackBus {
    fabric: Rc<RefCell<Fabric>>,
}

impl LoopbackBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a new connection. The new endpoint immediately has every current
    /// announcement and unexpired sessionless signal queued.
    pub fn connect(&self) -> Rc<LoopbackTransport> {
        let mut fabric = self.fabric.borrow_mut();
        fabric.next_id += 1;
        let name = format!(":loop.{}", fabric.next_id);
        fabric.purge_expired();
        let mut endpoint = Endpoint::default();
        endpoint.inbox.extend(fabric.announcements.values().cloned());
        endpoint
            .inbox
            .extend(fabric.sessionless.iter().map(|c| c.msg.clone()));
        fabric.endpoints.insert(name.clone(), endpoint);
        tracing::debug!(target: "ajs.bus", name = %name, "loopback endpoint connected");
        Rc::new(LoopbackTransport {
            name,
            fabric: Rc::clone(&self.fabric),
        })
    }

    /// Advance the bus clock used for sessionless time-to-live.
    pub fn advance(&self, ms: u64) {
        let mut fabric = self.fabric.borrow_mut();
        fabric.now_ms = fabric.now_ms.saturating_add(ms);
        fabric.purge_expired();
    }

    /// Drop a connection as if its link failed.
    pub fn disconnect(&self, name: &str) {
        self.fabric.borrow_mut().remove(name);
    }

    /// Tell one connection that its security policy changed.
    pub fn notify_policy_changed(&self, name: &str) -> Result<(), TransportError> {
        self.fabric
            .borrow_mut()
            .deliver(name, BusMessage::PolicyChanged)
    }

    pub fn peers(&self) -> Vec<String> {
        self.fabric.borrow().endpoints.keys().cloned().collect()
    }

    /// Messages waiting for `name` to poll.
    pub fn queued(&self, name: &str) -> usize {
        self.fabric
            .borrow()
            .endpoints
            .get(name)
            .map_or(0, |e| e.inbox.len())
    }

    /// Sessionless signals still cached.
    pub fn cached_sessionless(&self) -> usize {
        self.fabric.borrow().sessionless.len()
    }

    pub fn security_of(&self, name: &str) -> Option<SecurityDefinition> {
        self.fabric
            .borrow()
            .endpoints
            .get(name)
            .and_then(|e| e.security.clone())
    }

    /// Total messages routed since creation.
    pub fn routed(&self) -> u64 {
        self.fabric.borrow().sent
    }

    /// Inject a signal as if an outside peer had sent it.
    pub fn inject_signal(&self, header: MessageHeader, args: Vec<crate::value::MsgValue>) -> Result<(), TransportError> {
        let msg = BusMessage::Signal {
            header,
            args,
            sessionless: false,
            ttl_s: 0,
        };
        let mut fabric = self.fabric.borrow_mut();
        match msg.destination().map(str::to_string) {
            Some(to) => fabric.deliver(&to, msg),
            None => {
                fabric.broadcast("", &msg);
                Ok(())
            }
        }
    }
}

/// One connection to a [`LoopbackBus`].
pub struct LoopbackTransport {
    name: String,
    fabric: Rc<RefCell<Fabric>>,
}

impl Transport for LoopbackTransport {
    fn unique_name(&self) -> &str {
        &self.name
    }

    fn send(&self, msg: BusMessage) -> Result<(), TransportError> {
        self.fabric.borrow_mut().route(&self.name, msg)
    }

    fn receive(&self) -> Option<BusMessage> {
        self.fabric
            .borrow_mut()
            .endpoints
            .get_mut(&self.name)
            .and_then(|e| e.inbox.pop_front())
    }

    fn is_connected(&self) -> bool {
        self.fabric.borrow().endpoints.contains_key(&self.name)
    }

    fn close(&self) {
        self.fabric.borrow_mut().remove(&self.name);
    }

    fn set_security(&self, security: Option<&SecurityDefinition>) {
        if let Some(endpoint) = self.fabric.borrow_mut().endpoints.get_mut(&self.name) {
            endpoint.security = security.cloned();
        }
    }
}

impl Drop for LoopbackTransport {
    fn drop(&mut self) {
        if let Ok(mut fabric) = self.fabric.try_borrow_mut() {
            fabric.remove(&self.name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::MsgValue;

    fn header(sender: &str, destination: Option<&str>, serial: u32) -> MessageHeader {
        MessageHeader {
            serial,
            sender: sender.to_string(),
            destination: destination.map(str::to_string),
            path: "/test".to_string(),
            interface: "org.test.sig".to_string(),
            member: "changed".to_string(),
            session_id: 0,
        }
    }

    #[test]
    fn test_directed_delivery_is_queued() {
        let bus = LoopbackBus::new();
        let a = bus.connect();
        let b = bus.connect();
        a.send(BusMessage::MethodReply {
            sender: a.unique_name().to_string(),
            destination: b.unique_name().to_string(),
            reply_serial: 1,
            args: vec![],
        })
        .unwrap();
        assert!(a.receive().is_none());
        assert!(matches!(b.receive(), Some(BusMessage::MethodReply { .. })));
    }

    #[test]
    fn test_unknown_destination() {
        let bus = LoopbackBus::new();
        let a = bus.connect();
        let err = a
            .send(BusMessage::PolicyChanged)
            .and_then(|_| {
                a.send(BusMessage::MethodReply {
                    sender: a.unique_name().to_string(),
                    destination: ":loop.99".to_string(),
                    reply_serial: 1,
                    args: vec![],
                })
            })
            .unwrap_err();
        assert_eq!(err, TransportError::PeerUnreachable(":loop.99".to_string()));
    }

    #[test]
    fn test_sessionless_replay_respects_ttl() {
        let bus = LoopbackBus::new();
        let a = bus.connect();
        a.send(BusMessage::Signal {
            header: header(a.unique_name(), None, 1),
            args: vec![MsgValue::Bool(true)],
            sessionless: true,
            ttl_s: 2,
        })
        .unwrap();
        assert_eq!(bus.cached_sessionless(), 1);

        let late = bus.connect();
        assert!(matches!(late.receive(), Some(BusMessage::Signal { .. })));

        bus.advance(2_000);
        let too_late = bus.connect();
        assert!(too_late.receive().is_none());
        assert_eq!(bus.cached_sessionless(), 0);
    }

    #[test]
    fn test_cancel_sessionless() {
        let bus = LoopbackBus::new();
        let a = bus.connect();
        a.send(BusMessage::Signal {
            header: header(a.unique_name(), None, 7),
            args: vec![],
            sessionless: true,
            ttl_s: 30,
        })
        .unwrap();
        a.send(BusMessage::CancelSessionless {
            sender: a.unique_name().to_string(),
            serial: 7,
        })
        .unwrap();
        assert_eq!(bus.cached_sessionless(), 0);
    }

    #[test]
    fn test_disconnect_reports_peer_lost() {
        let bus = LoopbackBus::new();
        let a = bus.connect();
        let b = bus.connect();
        let a_name = a.unique_name().to_string();
        bus.disconnect(&a_name);
        assert!(!a.is_connected());
        assert_eq!(
            b.receive(),
            Some(BusMessage::PeerLost { peer: a_name })
        );
    }

    #[test]
    fn test_announcements_replayed_to_late_joiners() {
        let bus = LoopbackBus::new();
        let a = bus.connect();
        a.send(BusMessage::Announce {
            sender: a.unique_name().to_string(),
            names: vec![],
            port: 2,
            objects: vec![],
            about: Default::default(),
        })
        .unwrap();
        let b = bus.connect();
        assert!(matches!(b.receive(), Some(BusMessage::Announce { .. })));
        drop(a);
        assert!(matches!(b.receive(), Some(BusMessage::PeerLost { .. })));
        let c = bus.connect();
        assert!(c.receive().is_none());
    }
}
