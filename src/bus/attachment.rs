//! Bus attachment: one application's connection to the bus.
//!
//! A [`BusAttachment`] owns the descriptor registry, the handler slots, the
//! cooperative event loop and the dispatch router. Nothing it receives is
//! handled until [`poll`](BusAttachment::poll) or
//! [`advance`](BusAttachment::advance) runs, and every callback runs to
//! completion on the calling thread before the next one starts.

use super::link::{BusLink, PendingEntry};
use super::message::{AnnouncedObject, BusMessage, MessageHeader};
use super::transport::Transport;
use crate::config::BindingConfig;
use crate::core::error::{
    AjsResult, ContractViolation, LifecyclePhase, RegistrationError, RegistrationResult, ResourceError,
    StoreResult, TimerResult, TransportError,
};
use crate::core::event_loop::{EventLoop, TimerId, TimerKind};
use crate::dispatch::{
    CallContext, CallKind, Caller, DispatchRouter, DispatchStats, HandlerResult, HandlerTable, Rejection, Routed,
    Target,
};
use crate::proxy::{self, CallError, ProxyInner, RemoteServiceProxy, SignalSender};
use crate::registry::{
    AboutDefinition, DescriptorRegistry, InterfaceDescriptor, ObjectDescriptor, SecurityDefinition,
};
use crate::services::notification::{self, NOTIFICATION_INTERFACE, NOTIFICATION_SIGNAL};
use crate::services::{ControlPanel, Notification, NotificationType, PropertyStore, Translations};
use crate::value::MsgValue;
use serde_json::Value as Json;
use std::any::Any;
use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::rc::{Rc, Weak};

/// Take a handler out of its slot, run it with panics contained, and put it
/// back unless the handler installed a replacement while it ran.
macro_rules! invoke_slot {
    ($bus:expr, $slot:ident, |$h:ident| $call:expr) => {{
        match $bus.handlers.$slot.take() {
            Some(mut $h) => {
                let result = panic::catch_unwind(AssertUnwindSafe(|| $call));
                if $bus.handlers.$slot.is_none() {
                    $bus.handlers.$slot = Some($h);
                }
                Some(result)
            }
            None => None,
        }
    }};
}

/// `findService` callback, invoked once per discovered object.
pub type FoundCallback = Box<dyn FnMut(&mut BusAttachment, RemoteServiceProxy)>;

/// The peer asking to join a session, as seen by `on_peer_connected`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub name: String,
    pub session_id: u32,
    pub port: u16,
    pub authenticated: bool,
}

/// Where to look for a service found by well-known name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceName {
    pub interfaces: Vec<String>,
    pub path: String,
    /// `0` accepts any session port.
    pub port: u16,
}

enum FindQuery {
    Interface(String),
    Name { name: String, target: ServiceName },
}

impl FindQuery {
    /// Objects of an announcement this query matches, as (path, interfaces).
    fn matches(&self, peer: &str, ann: &Announcement) -> Vec<(String, Vec<String>)> {
        match self {
            FindQuery::Interface(iface) => ann
                .objects
                .iter()
                .filter(|o| o.interfaces.iter().any(|i| i == iface))
                .map(|o| (o.path.clone(), o.interfaces.clone()))
                .collect(),
            FindQuery::Name { name, target } => {
                let named = peer == name || ann.names.iter().any(|n| n == name);
                let port_ok = target.port == 0 || target.port == ann.port;
                if named && port_ok {
                    vec![(target.path.clone(), target.interfaces.clone())]
                } else {
                    Vec::new()
                }
            }
        }
    }
}

struct FindRequest {
    query: FindQuery,
    callback: Rc<RefCell<FoundCallback>>,
    seen: BTreeSet<(String, String)>,
}

struct Announcement {
    names: Vec<String>,
    port: u16,
    objects: Vec<AnnouncedObject>,
    about: BTreeMap<String, Json>,
}

struct Hit {
    callback: Rc<RefCell<FoundCallback>>,
    peer: String,
    path: String,
    interfaces: Vec<String>,
    port: u16,
}

struct PendingJoin {
    peer: String,
    deadline: u64,
    waiting: Vec<Hit>,
}

/// One application's connection to the bus.
pub struct BusAttachment {
    config: BindingConfig,
    registry: DescriptorRegistry,
    pub(crate) handlers: HandlerTable,
    event_loop: EventLoop<BusAttachment>,
    router: DispatchRouter,
    transport: Option<Rc<dyn Transport>>,
    link: Option<Rc<BusLink>>,
    store: PropertyStore,
    translations: Translations,
    control_panel: ControlPanel,
    matches: BTreeSet<(String, String)>,
    advertised: Vec<String>,
    finds: Vec<FindRequest>,
    announcements: BTreeMap<String, Announcement>,
    pending_joins: Vec<PendingJoin>,
    authenticated_peers: BTreeSet<String>,
    proxies: Vec<Weak<ProxyInner>>,
    retained: Vec<RemoteServiceProxy>,
    last_notification: BTreeMap<NotificationType, u32>,
    next_session_id: u32,
    next_notification_id: i32,
}

impl BusAttachment {
    /// Create a detached attachment with an in-memory property store.
    pub fn new(config: BindingConfig) -> Self {
        Self::with_store(config, PropertyStore::in_memory())
    }

    /// Create a detached attachment whose store follows `config.storage`.
    pub fn from_config(config: BindingConfig) -> AjsResult<Self> {
        let store = PropertyStore::from_config(&config.storage)?;
        Ok(Self::with_store(config, store))
    }

    pub fn with_store(config: BindingConfig, store: PropertyStore) -> Self {
        let mut registry = DescriptorRegistry::new();
        if let Err(err) = notification::interface_descriptor().and_then(|d| registry.define_interface(d)) {
            tracing::warn!(target: "ajs.bus", %err, "notification interface unavailable");
        }
        let max_timers = config.bus.max_timers;
        Self {
            config,
            registry,
            handlers: HandlerTable::default(),
            event_loop: EventLoop::new(max_timers),
            router: DispatchRouter::new(),
            transport: None,
            link: None,
            store,
            translations: Translations::new(),
            control_panel: ControlPanel::new(),
            matches: BTreeSet::new(),
            advertised: Vec::new(),
            finds: Vec::new(),
            announcements: BTreeMap::new(),
            pending_joins: Vec::new(),
            authenticated_peers: BTreeSet::new(),
            proxies: Vec::new(),
            retained: Vec::new(),
            last_notification: BTreeMap::new(),
            next_session_id: 1,
            next_notification_id: 1,
        }
    }

    pub fn config(&self) -> &BindingConfig {
        &self.config
    }

    pub fn registry(&self) -> &DescriptorRegistry {
        &self.registry
    }

    // ------------------------------------------------------------------
    // Registration
    // ------------------------------------------------------------------

    pub fn define_interface(&mut self, desc: InterfaceDescriptor) -> RegistrationResult<()> {
        self.registry.define_interface(desc)
    }

    pub fn define_object(&mut self, desc: ObjectDescriptor) -> RegistrationResult<()> {
        self.registry.define_object(desc)
    }

    pub fn set_about(&mut self, about: AboutDefinition) -> RegistrationResult<()> {
        self.registry.set_about(about)
    }

    pub fn set_security(&mut self, security: SecurityDefinition) -> RegistrationResult<()> {
        self.registry.set_security(security)
    }

    /// Load `interfaceDefinition`, `objectDefinition`, `aboutDefinition` and
    /// `securityDefinition` in their script JSON shapes.
    pub fn load_json(
        &mut self,
        interfaces: Option<&Json>,
        objects: Option<&Json>,
        about: Option<&Json>,
        security: Option<&Json>,
    ) -> RegistrationResult<()> {
        self.registry.load_json(interfaces, objects, about, security)
    }

    pub fn set_translations(&mut self, translations: Translations) {
        self.translations = translations;
    }

    pub fn translations(&self) -> &Translations {
        &self.translations
    }

    /// Translate into the stored `DefaultLanguage`, or the first language.
    pub fn translate(&self, key: &str) -> String {
        self.translations.translate_stored(key, &self.store)
    }

    // ------------------------------------------------------------------
    // Handler slots
    // ------------------------------------------------------------------

    pub fn on_attach(&mut self, f: impl FnMut(&mut BusAttachment) + 'static) {
        self.handlers.on_attach = Some(Box::new(f));
    }

    pub fn on_detach(&mut self, f: impl FnMut(&mut BusAttachment) + 'static) {
        self.handlers.on_detach = Some(Box::new(f));
    }

    pub fn on_method_call(
        &mut self,
        f: impl FnMut(&mut BusAttachment, &mut CallContext, Vec<MsgValue>) -> HandlerResult + 'static,
    ) {
        self.handlers.on_method_call = Some(Box::new(f));
    }

    pub fn on_signal(
        &mut self,
        f: impl FnMut(&mut BusAttachment, &mut CallContext, Vec<MsgValue>) -> HandlerResult + 'static,
    ) {
        self.handlers.on_signal = Some(Box::new(f));
    }

    pub fn on_prop_get(
        &mut self,
        f: impl FnMut(&mut BusAttachment, &mut CallContext, &str, &str) -> HandlerResult + 'static,
    ) {
        self.handlers.on_prop_get = Some(Box::new(f));
    }

    pub fn on_prop_set(
        &mut self,
        f: impl FnMut(&mut BusAttachment, &mut CallContext, &str, &str, MsgValue) -> HandlerResult + 'static,
    ) {
        self.handlers.on_prop_set = Some(Box::new(f));
    }

    pub fn on_prop_get_all(
        &mut self,
        f: impl FnMut(&mut BusAttachment, &mut CallContext, &str) -> HandlerResult + 'static,
    ) {
        self.handlers.on_prop_get_all = Some(Box::new(f));
    }

    /// Gate inbound session joins. Without a handler every join is accepted.
    pub fn on_peer_connected(&mut self, f: impl FnMut(&mut BusAttachment, &PeerInfo) -> bool + 'static) {
        self.handlers.on_peer_connected = Some(Box::new(f));
    }

    pub fn on_peer_disconnected(&mut self, f: impl FnMut(&mut BusAttachment, &str) + 'static) {
        self.handlers.on_peer_disconnected = Some(Box::new(f));
    }

    pub fn on_policy_changed(&mut self, f: impl FnMut(&mut BusAttachment) + 'static) {
        self.handlers.on_policy_changed = Some(Box::new(f));
    }

    pub fn handlers(&self) -> &HandlerTable {
        &self.handlers
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Attach over `transport`. Seals the registry, announces, and schedules
    /// `on_attach` for the next poll.
    pub fn attach(&mut self, transport: Rc<dyn Transport>) -> AjsResult<()> {
        if self.link.is_some() {
            return Err(RegistrationError::Lifecycle(LifecyclePhase::Attached).into());
        }
        if !transport.is_connected() {
            return Err(TransportError::Closed.into());
        }
        self.registry.seal();
        let interfaces = self
            .registry
            .interfaces()
            .map(|i| (i.name().to_string(), i.clone()))
            .collect();
        let link = Rc::new(BusLink::new(
            transport.unique_name(),
            &self.config.bus,
            interfaces,
            self.event_loop.now(),
        ));
        transport.set_security(self.registry.security());
        tracing::info!(target: "ajs.bus", name = transport.unique_name(), "attached");
        self.transport = Some(transport);
        self.link = Some(link);
        self.announce()?;
        self.flush();
        self.event_loop.post(Box::new(|bus: &mut BusAttachment| {
            if let Some(Err(payload)) = invoke_slot!(bus, on_attach, |h| h(bus)) {
                tracing::error!(target: "ajs.bus", message = %panic_message(payload.as_ref()), "onAttach panicked");
            }
        }));
        Ok(())
    }

    /// Leave the bus. Pending calls fail with [`CallError::Detached`],
    /// proxies become invalid, and `on_detach` runs before this returns.
    pub fn detach(&mut self) -> AjsResult<()> {
        if self.link.is_none() {
            return Err(ResourceError::NotAttached.into());
        }
        self.flush();
        self.teardown("detach requested");
        Ok(())
    }

    fn teardown(&mut self, reason: &str) {
        let Some(link) = self.link.take() else {
            return;
        };
        let transport = self.transport.take();
        let pending = link.take_all_pending();
        link.close();
        for proxy in self.proxies.drain(..).filter_map(|w| w.upgrade()) {
            proxy.invalidate();
        }
        for (serial, entry) in pending {
            self.finish_call(serial, entry, Err(CallError::Detached));
        }
        self.retained.clear();
        if let Some(transport) = transport {
            transport.close();
        }
        let dropped = self.event_loop.discard_ready();
        self.pending_joins.clear();
        self.announcements.clear();
        for find in &mut self.finds {
            find.seen.clear();
        }
        self.authenticated_peers.clear();
        self.last_notification.clear();
        self.control_panel = ControlPanel::new();
        self.registry.unseal();
        tracing::info!(target: "ajs.bus", reason, dropped_tasks = dropped, "detached");

        if let Some(Err(payload)) = invoke_slot!(self, on_detach, |h| h(self)) {
            tracing::error!(target: "ajs.bus", message = %panic_message(payload.as_ref()), "onDetach panicked");
        }
    }

    pub fn is_attached(&self) -> bool {
        self.link.is_some()
    }

    /// Unique bus name while attached.
    pub fn unique_name(&self) -> Option<&str> {
        self.link.as_deref().map(BusLink::unique_name)
    }

    /// Script-facing form of [`unique_name`](Self::unique_name).
    pub fn get_unique_name(&self) -> Option<String> {
        self.unique_name().map(str::to_string)
    }

    fn require_link(&self) -> AjsResult<Rc<BusLink>> {
        self.link
            .clone()
            .ok_or_else(|| ResourceError::NotAttached.into())
    }

    fn announce(&self) -> AjsResult<()> {
        let link = self.require_link()?;
        let objects = self
            .registry
            .announced_objects()
            .into_iter()
            .map(|(path, interfaces)| AnnouncedObject { path, interfaces })
            .collect();
        link.push(BusMessage::Announce {
            sender: link.unique_name().to_string(),
            names: self.advertised.clone(),
            port: self.config.bus.app_port,
            objects,
            about: self.registry.about().announced_fields(),
        })?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Event loop
    // ------------------------------------------------------------------

    /// Run everything that is ready: posted tasks, inbound messages, due
    /// timers and expired calls. Returns the number of events handled.
    pub fn poll(&mut self) -> usize {
        let mut handled = 0;
        loop {
            let mut progress = false;
            self.sync_clock();

            while let Some(task) = self.event_loop.pop_ready() {
                self.run_guarded("task", task);
                handled += 1;
                progress = true;
            }
            self.flush();

            if let Some(transport) = self.transport.clone() {
                while self.transport.is_some() {
                    let Some(msg) = transport.receive() else {
                        break;
                    };
                    self.handle_message(msg);
                    self.flush();
                    handled += 1;
                    progress = true;
                }
                if self.transport.is_some() && !transport.is_connected() {
                    self.teardown("transport disconnected");
                    progress = true;
                }
            }

            let fired = self.run_due_timers();
            handled += fired;
            progress |= fired > 0;
            self.expire();
            self.flush();

            if !progress {
                return handled;
            }
        }
    }

    /// Move the loop clock forward by `ms`, stopping at every timer deadline
    /// on the way so timers fire in order.
    pub fn advance(&mut self, ms: u64) -> usize {
        let target = self.event_loop.now().saturating_add(ms);
        let mut handled = self.poll();
        while let Some(deadline) = self.event_loop.timers().next_deadline() {
            if deadline > target {
                break;
            }
            self.event_loop.advance_to(deadline);
            handled += self.poll();
        }
        self.event_loop.advance_to(target);
        handled + self.poll()
    }

    pub fn now_ms(&self) -> u64 {
        self.event_loop.now()
    }

    /// Earliest timer deadline, for hosts that sleep between polls.
    pub fn next_deadline(&self) -> Option<u64> {
        self.event_loop.timers().next_deadline()
    }

    fn sync_clock(&self) {
        if let Some(link) = &self.link {
            link.set_now(self.event_loop.now());
        }
    }

    fn run_due_timers(&mut self) -> usize {
        let now = self.event_loop.now();
        let mut fired = 0;
        while let Some((id, mut callback)) = self.event_loop.timers_mut().take_due(now) {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| callback(self))) {
                tracing::error!(target: "ajs.timer", id, message = %panic_message(payload.as_ref()), "timer callback panicked");
            }
            self.event_loop.timers_mut().restore(id, callback);
            fired += 1;
        }
        fired
    }

    fn run_guarded(&mut self, what: &'static str, f: impl FnOnce(&mut Self)) {
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| f(self))) {
            tracing::error!(target: "ajs.bus", what, message = %panic_message(payload.as_ref()), "callback panicked");
        }
    }

    fn flush(&mut self) {
        let (Some(link), Some(transport)) = (self.link.clone(), self.transport.clone()) else {
            return;
        };
        loop {
            let batch = link.drain_outbox();
            if batch.is_empty() {
                return;
            }
            for msg in batch {
                let call_serial = match &msg {
                    BusMessage::MethodCall { header, .. } => Some(header.serial),
                    _ => None,
                };
                let kind = msg.label();
                if let Err(err) = transport.send(msg) {
                    tracing::warn!(target: "ajs.bus", kind, %err, "send failed");
                    if let Some(serial) = call_serial {
                        if let Some(entry) = link.take_pending(serial) {
                            self.finish_call(serial, entry, Err(CallError::Send(err)));
                        }
                    }
                }
            }
        }
    }

    fn expire(&mut self) {
        let Some(link) = self.link.clone() else {
            return;
        };
        let now = self.event_loop.now();
        link.set_now(now);
        for (serial, entry) in link.take_expired_pending(now) {
            tracing::warn!(target: "ajs.bus", serial, peer = %entry.peer, "outbound call timed out");
            self.finish_call(serial, entry, Err(CallError::Timeout));
        }
        self.router.expire(&link, now);

        let (expired, live): (Vec<_>, Vec<_>) = std::mem::take(&mut self.pending_joins)
            .into_iter()
            .partition(|j| j.deadline <= now);
        self.pending_joins = live;
        for join in expired {
            tracing::warn!(target: "ajs.bus", peer = %join.peer, "session join timed out");
            self.forget_hits(&join.waiting);
        }
        self.proxies.retain(|w| w.strong_count() > 0);
    }

    fn finish_call(&mut self, serial: u32, entry: PendingEntry, result: Result<Vec<MsgValue>, CallError>) {
        self.run_guarded("reply", move |bus| proxy::complete(bus, serial, entry, result));
    }

    // ------------------------------------------------------------------
    // Inbound messages
    // ------------------------------------------------------------------

    fn handle_message(&mut self, msg: BusMessage) {
        let Some(link) = self.link.clone() else {
            return;
        };
        tracing::trace!(target: "ajs.bus", kind = msg.label(), "message received");
        match msg {
            BusMessage::MethodCall { header, args } => self.handle_call(header, args, &link),
            BusMessage::Signal {
                header,
                args,
                sessionless,
                ..
            } => self.handle_signal(header, args, sessionless, &link),
            BusMessage::MethodReply {
                sender,
                reply_serial,
                args,
                ..
            } => self.handle_reply(&link, &sender, reply_serial, Ok(args)),
            BusMessage::Error {
                sender,
                reply_serial,
                name,
                message,
                ..
            } => self.handle_reply(&link, &sender, reply_serial, Err(CallError::Remote { name, message })),
            BusMessage::Announce {
                sender,
                names,
                port,
                objects,
                about,
            } => {
                tracing::debug!(target: "ajs.bus", peer = %sender, objects = objects.len(), "announcement received");
                self.announcements.insert(
                    sender.clone(),
                    Announcement {
                        names,
                        port,
                        objects,
                        about,
                    },
                );
                self.discover(Some(&sender));
            }
            BusMessage::JoinSession {
                sender, port, secure, ..
            } => self.handle_join(&link, sender, port, secure),
            BusMessage::JoinSessionReply {
                sender,
                session_id,
                secure,
                ..
            } => self.handle_join_reply(&link, &sender, session_id, secure),
            BusMessage::PeerLost { peer } => self.peer_lost(&link, &peer),
            BusMessage::PolicyChanged => {
                tracing::info!(target: "ajs.bus", "security policy changed");
                if let Some(Err(payload)) = invoke_slot!(self, on_policy_changed, |h| h(self)) {
                    tracing::error!(target: "ajs.bus", message = %panic_message(payload.as_ref()), "onPolicyChanged panicked");
                }
            }
            BusMessage::CancelSessionless { .. } => {}
        }
    }

    fn handle_call(&mut self, header: MessageHeader, args: Vec<MsgValue>, link: &Rc<BusLink>) {
        let caller = Caller {
            from_self: header.sender == link.unique_name(),
            authenticated: self.authenticated_peers.contains(&header.sender),
        };
        match self.router.route_call(&self.registry, &header, args, caller, link) {
            Ok(routed) => self.dispatch(routed, link),
            Err(rejection) => self.router.reject_unrouted(&header, rejection, link),
        }
    }

    fn handle_signal(&mut self, header: MessageHeader, args: Vec<MsgValue>, sessionless: bool, link: &Rc<BusLink>) {
        if sessionless
            && !self
                .matches
                .contains(&(header.interface.clone(), header.member.clone()))
        {
            tracing::trace!(target: "ajs.bus", iface = %header.interface, member = %header.member, "sessionless signal without match rule");
            return;
        }
        let from_self = header.sender == link.unique_name();
        if let Some(routed) = self
            .router
            .route_signal(&self.registry, &header, args, from_self, link)
        {
            self.dispatch(routed, link);
        }
    }

    /// Invoke the single handler slot a routed event targets, then send
    /// whatever it decided.
    fn dispatch(&mut self, routed: Routed, link: &BusLink) {
        let Routed { mut ctx, args, target } = routed;
        let invoked = match target {
            Target::Method => invoke_slot!(self, on_method_call, |h| h(self, &mut ctx, args)),
            Target::Signal => invoke_slot!(self, on_signal, |h| h(self, &mut ctx, args)),
            Target::PropGet { iface, prop } => {
                invoke_slot!(self, on_prop_get, |h| h(self, &mut ctx, &iface, &prop))
            }
            Target::PropSet { iface, prop, value } => {
                invoke_slot!(self, on_prop_set, |h| h(self, &mut ctx, &iface, &prop, value))
            }
            Target::PropGetAll { iface } => {
                invoke_slot!(self, on_prop_get_all, |h| h(self, &mut ctx, &iface))
            }
        };
        let result = match invoked {
            Some(Ok(result)) => result,
            Some(Err(payload)) => {
                ctx.record_panic(panic_message(payload.as_ref()));
                Ok(())
            }
            None if ctx.kind() == CallKind::Signal => Ok(()),
            None => Err(Rejection::new(format!("no handler installed for '{}'", ctx.member()))),
        };
        ctx.settle(result);
        let state = self.router.complete(ctx, link);
        tracing::trace!(target: "ajs.dispatch", ?state, "dispatch finished");
    }

    fn handle_reply(&mut self, link: &BusLink, sender: &str, serial: u32, result: Result<Vec<MsgValue>, CallError>) {
        let Some(entry) = link.take_pending(serial) else {
            tracing::debug!(target: "ajs.bus", serial, sender, "reply for unknown call dropped");
            return;
        };
        if entry.peer != sender {
            tracing::warn!(target: "ajs.bus", serial, sender, expected = %entry.peer, "reply from unexpected peer ignored");
            link.track_pending(serial, entry);
            return;
        }
        self.finish_call(serial, entry, result);
    }

    fn handle_join(&mut self, link: &BusLink, peer: String, port: u16, secure: bool) {
        let session_id = self.next_session_id;
        let authenticated = secure && self.registry.security().is_some_and(SecurityDefinition::authenticates);
        let accepted = if port != self.config.bus.app_port {
            tracing::info!(target: "ajs.bus", peer = %peer, port, "join refused: wrong session port");
            false
        } else {
            let info = PeerInfo {
                name: peer.clone(),
                session_id,
                port,
                authenticated,
            };
            match invoke_slot!(self, on_peer_connected, |h| h(self, &info)) {
                None => true,
                Some(Ok(accept)) => accept,
                Some(Err(payload)) => {
                    tracing::error!(target: "ajs.bus", message = %panic_message(payload.as_ref()), "onPeerConnected panicked");
                    false
                }
            }
        };
        if accepted {
            self.next_session_id = self.next_session_id.wrapping_add(1).max(1);
            link.add_session(&peer, session_id);
            if authenticated {
                self.authenticated_peers.insert(peer.clone());
            }
            tracing::info!(target: "ajs.bus", peer = %peer, session_id, authenticated, "session joined");
        }
        let reply = link.push(BusMessage::JoinSessionReply {
            sender: link.unique_name().to_string(),
            destination: peer,
            session_id: accepted.then_some(session_id),
            secure: authenticated,
        });
        if let Err(err) = reply {
            tracing::debug!(target: "ajs.bus", %err, "join reply dropped");
        }
    }

    fn handle_join_reply(&mut self, link: &Rc<BusLink>, peer: &str, session_id: Option<u32>, secure: bool) {
        let (joins, rest): (Vec<_>, Vec<_>) = std::mem::take(&mut self.pending_joins)
            .into_iter()
            .partition(|j| j.peer == peer);
        self.pending_joins = rest;
        let Some(session_id) = session_id else {
            tracing::warn!(target: "ajs.bus", peer, "session join refused");
            return;
        };
        link.add_session(peer, session_id);
        if secure {
            self.authenticated_peers.insert(peer.to_string());
        }
        for hit in joins.into_iter().flat_map(|j| j.waiting) {
            self.deliver_found(hit, session_id, link);
        }
    }

    fn peer_lost(&mut self, link: &BusLink, peer: &str) {
        if peer == link.unique_name() {
            self.teardown("link lost");
            return;
        }
        tracing::info!(target: "ajs.bus", peer, "peer lost");
        self.announcements.remove(peer);
        self.pending_joins.retain(|j| j.peer != peer);
        for find in &mut self.finds {
            find.seen.retain(|(p, _)| p != peer);
        }
        self.authenticated_peers.remove(peer);
        self.proxies.retain(|w| match w.upgrade() {
            Some(proxy) if proxy.peer() == peer => {
                proxy.invalidate();
                false
            }
            Some(_) => true,
            None => false,
        });
        for (serial, entry) in link.take_pending_for_peer(peer) {
            self.finish_call(serial, entry, Err(CallError::PeerLost));
        }
        self.retained.retain(|p| p.peer() != peer);
        if link.remove_session(peer).is_some() {
            if let Some(Err(payload)) = invoke_slot!(self, on_peer_disconnected, |h| h(self, peer)) {
                tracing::error!(target: "ajs.bus", message = %panic_message(payload.as_ref()), "onPeerDisconnected panicked");
            }
        }
    }

    // ------------------------------------------------------------------
    // Discovery
    // ------------------------------------------------------------------

    /// Call `f` with a proxy for every announced object implementing `iface`,
    /// joining a session with its peer first. Never fires inline.
    pub fn find_service(&mut self, iface: &str, f: impl FnMut(&mut BusAttachment, RemoteServiceProxy) + 'static) {
        self.add_find(FindQuery::Interface(iface.to_string()), Box::new(f));
    }

    /// Call `f` with a proxy for `target.path` on the peer advertising `name`.
    pub fn find_service_by_name(
        &mut self,
        name: &str,
        target: ServiceName,
        f: impl FnMut(&mut BusAttachment, RemoteServiceProxy) + 'static,
    ) {
        self.add_find(
            FindQuery::Name {
                name: name.to_string(),
                target,
            },
            Box::new(f),
        );
    }

    fn add_find(&mut self, query: FindQuery, callback: FoundCallback) {
        self.finds.push(FindRequest {
            query,
            callback: Rc::new(RefCell::new(callback)),
            seen: BTreeSet::new(),
        });
        self.event_loop.post(Box::new(|bus: &mut BusAttachment| bus.discover(None)));
    }

    /// Peers whose announcement is cached.
    pub fn known_peers(&self) -> Vec<String> {
        self.announcements.keys().cloned().collect()
    }

    /// About fields announced by `peer`.
    pub fn peer_about(&self, peer: &str) -> Option<&BTreeMap<String, Json>> {
        self.announcements.get(peer).map(|a| &a.about)
    }

    fn discover(&mut self, only_peer: Option<&str>) {
        let Some(link) = self.link.clone() else {
            return;
        };
        let mut hits = Vec::new();
        for find in &mut self.finds {
            for (peer, ann) in &self.announcements {
                if only_peer.is_some_and(|p| p != peer) {
                    continue;
                }
                for (path, interfaces) in find.query.matches(peer, ann) {
                    if find.seen.insert((peer.clone(), path.clone())) {
                        hits.push(Hit {
                            callback: Rc::clone(&find.callback),
                            peer: peer.clone(),
                            path,
                            interfaces,
                            port: ann.port,
                        });
                    }
                }
            }
        }
        for hit in hits {
            self.connect_hit(hit, &link);
        }
    }

    fn connect_hit(&mut self, hit: Hit, link: &Rc<BusLink>) {
        if let Some(session_id) = link.session_with(&hit.peer) {
            self.deliver_found(hit, session_id, link);
            return;
        }
        if let Some(join) = self.pending_joins.iter_mut().find(|j| j.peer == hit.peer) {
            join.waiting.push(hit);
            return;
        }
        let secure = self
            .registry
            .security()
            .is_some_and(SecurityDefinition::authenticates);
        let sent = link.push(BusMessage::JoinSession {
            sender: link.unique_name().to_string(),
            destination: hit.peer.clone(),
            port: hit.port,
            secure,
        });
        if let Err(err) = sent {
            tracing::warn!(target: "ajs.bus", peer = %hit.peer, %err, "join request not sent");
            return;
        }
        tracing::debug!(target: "ajs.bus", peer = %hit.peer, port = hit.port, "joining session");
        self.pending_joins.push(PendingJoin {
            peer: hit.peer.clone(),
            deadline: self
                .event_loop
                .now()
                .saturating_add(self.config.bus.link_timeout_ms),
            waiting: vec![hit],
        });
    }

    fn deliver_found(&mut self, hit: Hit, session_id: u32, link: &Rc<BusLink>) {
        let proxy = RemoteServiceProxy::new(&hit.peer, &hit.path, session_id, hit.interfaces, Rc::clone(link));
        self.proxies.push(proxy.downgrade());
        tracing::debug!(target: "ajs.bus", peer = %hit.peer, path = %hit.path, "service found");
        let callback = hit.callback;
        self.run_guarded("findService", move |bus| {
            let Ok(mut found) = callback.try_borrow_mut() else {
                tracing::warn!(target: "ajs.bus", "findService callback re-entered; discovery dropped");
                return;
            };
            let found: &mut FoundCallback = &mut found;
            found(bus, proxy);
        });
    }

    fn forget_hits(&mut self, hits: &[Hit]) {
        for hit in hits {
            for find in &mut self.finds {
                if Rc::ptr_eq(&find.callback, &hit.callback) {
                    find.seen.remove(&(hit.peer.clone(), hit.path.clone()));
                }
            }
        }
    }

    /// Keep a proxy alive beyond its callback. Without this, dropping the
    /// last handle makes its pending replies undeliverable.
    pub fn retain_proxy(&mut self, proxy: RemoteServiceProxy) {
        self.retained.push(proxy);
    }

    pub fn release_proxies(&mut self) {
        self.retained.clear();
    }

    /// Proxies created by discovery that are still alive.
    pub fn live_proxies(&self) -> usize {
        self.proxies.iter().filter(|w| w.strong_count() > 0).count()
    }

    // ------------------------------------------------------------------
    // Names, match rules and signals
    // ------------------------------------------------------------------

    /// Advertise a well-known name; re-announces when attached.
    pub fn advertise_name(&mut self, name: &str) -> AjsResult<()> {
        if !self.advertised.iter().any(|n| n == name) {
            self.advertised.push(name.to_string());
        }
        if self.link.is_some() {
            self.announce()?;
        }
        Ok(())
    }

    /// Accept sessionless `iface.member` signals.
    pub fn add_match(&mut self, iface: &str, member: &str) {
        self.matches.insert((iface.to_string(), member.to_string()));
    }

    pub fn remove_match(&mut self, iface: &str, member: &str) -> bool {
        self.matches.remove(&(iface.to_string(), member.to_string()))
    }

    /// Sender for a signal declared in the registry.
    pub fn signal(&self, path: &str, iface: &str, member: &str) -> AjsResult<SignalSender> {
        SignalSender::new(self.require_link()?, path, iface, member)
    }

    // ------------------------------------------------------------------
    // Timers
    // ------------------------------------------------------------------

    pub fn set_interval(&mut self, ms: u64, f: impl FnMut(&mut BusAttachment) + 'static) -> TimerResult<TimerId> {
        let now = self.event_loop.now();
        self.event_loop
            .timers_mut()
            .add(TimerKind::Interval, ms, now, Box::new(f))
    }

    pub fn set_timeout(&mut self, ms: u64, f: impl FnOnce(&mut BusAttachment) + 'static) -> TimerResult<TimerId> {
        let now = self.event_loop.now();
        let mut once = Some(f);
        self.event_loop.timers_mut().add(
            TimerKind::Timeout,
            ms,
            now,
            Box::new(move |bus: &mut BusAttachment| {
                if let Some(f) = once.take() {
                    f(bus);
                }
            }),
        )
    }

    /// Restart an interval's countdown, optionally with a new period.
    pub fn reset_interval(&mut self, id: TimerId, ms: Option<u64>) -> TimerResult<()> {
        let now = self.event_loop.now();
        self.event_loop
            .timers_mut()
            .reset(id, TimerKind::Interval, ms, now)
    }

    pub fn reset_timeout(&mut self, id: TimerId, ms: Option<u64>) -> TimerResult<()> {
        let now = self.event_loop.now();
        self.event_loop
            .timers_mut()
            .reset(id, TimerKind::Timeout, ms, now)
    }

    /// Once this returns the interval never fires again.
    pub fn clear_interval(&mut self, id: TimerId) -> TimerResult<()> {
        self.event_loop.timers_mut().clear(id, TimerKind::Interval)
    }

    pub fn clear_timeout(&mut self, id: TimerId) -> TimerResult<()> {
        self.event_loop.timers_mut().clear(id, TimerKind::Timeout)
    }

    pub fn timer_count(&self) -> usize {
        self.event_loop.timers().len()
    }

    /// Timers that can still be set before `TooManyTimers`.
    pub fn free_timer_slots(&self) -> usize {
        let timers = self.event_loop.timers();
        timers.capacity().saturating_sub(timers.len())
    }

    /// Queue a task for the next poll.
    pub fn post(&mut self, f: impl FnOnce(&mut BusAttachment) + 'static) {
        self.event_loop.post(Box::new(f));
    }

    // ------------------------------------------------------------------
    // Store, credentials, diagnostics
    // ------------------------------------------------------------------

    pub fn store(&self, key: &str, value: Json) -> StoreResult<()> {
        self.store.store(key, value)
    }

    pub fn load(&self, key: &str) -> StoreResult<Option<Json>> {
        self.store.load(key)
    }

    pub fn property_store(&self) -> &PropertyStore {
        &self.store
    }

    /// Wipe the store and credentials, then detach. The application may
    /// attach again afterwards.
    pub fn factory_reset(&mut self) -> AjsResult<()> {
        tracing::warn!(target: "ajs.bus", "factory reset");
        self.store.clear()?;
        self.clear_credentials();
        if self.link.is_some() {
            self.teardown("factory reset");
        }
        Ok(())
    }

    pub fn clear_credentials(&mut self) {
        self.registry.clear_security();
        if let Some(transport) = &self.transport {
            transport.set_security(None);
        }
    }

    pub fn dispatch_stats(&self) -> DispatchStats {
        self.router.stats()
    }

    /// Recent handler contract violations, oldest first.
    pub fn contract_violations(&self) -> Vec<ContractViolation> {
        self.router.violations().cloned().collect()
    }

    /// Outbound calls waiting for a reply.
    pub fn pending_calls(&self) -> usize {
        self.link.as_deref().map_or(0, BusLink::pending_len)
    }

    // ------------------------------------------------------------------
    // Control panel and notifications
    // ------------------------------------------------------------------

    pub fn control_panel(&mut self) -> &mut ControlPanel {
        &mut self.control_panel
    }

    /// Finalise the control panel tree and return its object paths.
    pub fn load_control_panel(&mut self) -> AjsResult<Vec<String>> {
        self.require_link()?;
        Ok(self.control_panel.load())
    }

    /// Build a notification in the default language.
    pub fn notification(&self, kind: NotificationType, text: &str) -> Notification {
        let lang = self
            .translations
            .languages()
            .first()
            .cloned()
            .unwrap_or_else(|| "en".to_string());
        Notification::new(kind, text, &lang)
    }

    /// Emit a notification as a sessionless signal. Returns its serial.
    pub fn send_notification(&mut self, notification: &Notification, ttl_s: u32) -> AjsResult<u32> {
        let link = self.require_link()?;
        let id = self.next_notification_id;
        self.next_notification_id = self.next_notification_id.wrapping_add(1);
        let about = self.registry.about();
        let field = |name: &str| {
            about
                .get(name)
                .and_then(|f| f.value.as_str())
                .map(str::to_string)
        };
        let device_id = field("DeviceId").unwrap_or_else(|| link.unique_name().to_string());
        let args = notification.to_args(
            id,
            &device_id,
            &field("DeviceName").unwrap_or_default(),
            &field("AppName").unwrap_or_default(),
        );
        let serial = SignalSender::new(
            Rc::clone(&link),
            &notification.kind.object_path(),
            NOTIFICATION_INTERFACE,
            NOTIFICATION_SIGNAL,
        )?
        .sessionless(true)
        .time_to_live(ttl_s)
        .send(args)?;
        self.last_notification.insert(notification.kind, serial);
        tracing::info!(target: "ajs.bus", kind = %notification.kind, id, serial, "notification sent");
        Ok(serial)
    }

    /// Retract the last notification of `kind`. Returns false when there is
    /// nothing to retract.
    pub fn cancel_notification(&mut self, kind: NotificationType) -> AjsResult<bool> {
        let link = self.require_link()?;
        let Some(serial) = self.last_notification.remove(&kind) else {
            return Ok(false);
        };
        link.push(BusMessage::CancelSessionless {
            sender: link.unique_name().to_string(),
            serial,
        })?;
        Ok(true)
    }
}

impl fmt::Debug for BusAttachment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BusAttachment")
            .field("unique_name", &self.unique_name())
            .field("handlers", &self.handlers)
            .field("timers", &self.event_loop.timers().len())
            .field("known_peers", &self.announcements.len())
            .field("stats", &self.router.stats())
            .finish()
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
