//! Script host: applies a [`BindingAdapter`] to a [`BusAttachment`].
//!
//! Every script entry (top-level evaluation, handler, timer, reply) runs to
//! completion first; the commands it queued are applied afterwards, before
//! anything else is dispatched.

use super::protocol::{BindingAdapter, BindingCommand, BindingEvent, BindingOutcome, CallInfo};
use crate::bus::{error_names, BusAttachment, ServiceName};
use crate::core::error::{AjsResult, ResourceError, ScriptError, ValueError};
use crate::core::event_loop::TimerId;
use crate::dispatch::{CallContext, CallKind, DeferredReply, HandlerResult, Rejection};
use crate::proxy::{PendingCall, RemoteServiceProxy};
use crate::services::{NotificationType, Translations};
use crate::signature::{SigType, Signature};
use crate::value::MsgValue;
use serde_json::Value as Json;
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

/// Owns a script engine and wires it to a bus attachment.
#[derive(Clone)]
pub struct ScriptHost {
    inner: Rc<HostInner>,
}

struct HostInner {
    adapter: RefCell<Box<dyn BindingAdapter>>,
    state: RefCell<HostState>,
}

#[derive(Default)]
struct HostState {
    /// Script timer id -> (bus timer id, repeating)
    timers: HashMap<u32, (TimerId, bool)>,
    proxies: HashMap<u32, RemoteServiceProxy>,
    deferred: HashMap<u32, Deferred>,
    next_proxy: u32,
    next_context: u32,
}

struct Deferred {
    reply: DeferredReply,
    types: ReplyTypes,
}

/// Declared types a script reply is converted to.
#[derive(Debug, Clone)]
enum ReplyTypes {
    Method(Signature),
    Property(SigType),
    All(Vec<(String, SigType)>),
    Ack,
}

impl ReplyTypes {
    fn of(ctx: &CallContext) -> Self {
        if let Some(sig) = ctx.reply_signature() {
            ReplyTypes::Method(sig.clone())
        } else if let Some(ty) = ctx.property_type() {
            ReplyTypes::Property(ty.clone())
        } else if let Some(props) = ctx.property_set() {
            ReplyTypes::All(props.to_vec())
        } else {
            ReplyTypes::Ack
        }
    }

    fn convert(&self, args: &[Json]) -> Result<Vec<MsgValue>, ValueError> {
        match self {
            ReplyTypes::Method(sig) => MsgValue::list_from_json(args, sig),
            ReplyTypes::Property(ty) => match args {
                [value] => Ok(vec![MsgValue::from_json(value, ty)?]),
                _ => Err(ValueError::Arity {
                    expected: 1,
                    found: args.len(),
                }),
            },
            ReplyTypes::All(props) => {
                let map = match args {
                    [Json::Object(map)] => map,
                    _ => {
                        return Err(ValueError::TypeMismatch {
                            expected: "a{sv}".to_string(),
                            found: format!("{} arguments", args.len()),
                        })
                    }
                };
                let mut entries = Vec::with_capacity(props.len());
                for (name, ty) in props {
                    if let Some(value) = map.get(name) {
                        entries.push((MsgValue::Str(name.clone()), MsgValue::from_json(value, ty)?));
                    }
                }
                Ok(vec![MsgValue::Dict(entries)])
            }
            ReplyTypes::Ack => Ok(Vec::new()),
        }
    }
}

fn to_json(values: &[MsgValue]) -> Vec<Json> {
    values.iter().map(MsgValue::to_json).collect()
}

impl ScriptHost {
    pub fn new(adapter: impl BindingAdapter + 'static) -> Self {
        Self {
            inner: Rc::new(HostInner {
                adapter: RefCell::new(Box::new(adapter)),
                state: RefCell::new(HostState::default()),
            }),
        }
    }

    /// Evaluate a script, load its definitions into `bus`, install its
    /// handlers and apply the commands its top level queued.
    pub fn run(&self, bus: &mut BusAttachment, name: &str, source: &str) -> AjsResult<()> {
        self.inner.eval(bus, name, source)?;
        self.install(bus)?;
        self.inner.drain(bus);
        tracing::info!(target: "ajs.script", script = name, "script loaded");
        Ok(())
    }

    /// Evaluate more code against an already running script.
    pub fn eval(&self, bus: &mut BusAttachment, name: &str, source: &str) -> AjsResult<()> {
        self.inner.eval(bus, name, source)?;
        self.inner.drain(bus);
        Ok(())
    }

    fn install(&self, bus: &mut BusAttachment) -> AjsResult<()> {
        let defs = self.inner.adapter.borrow_mut().definitions()?;
        bus.load_json(
            defs.interface_definition.as_ref(),
            defs.object_definition.as_ref(),
            defs.about_definition.as_ref(),
            defs.security_definition.as_ref(),
        )?;
        if let Some(translations) = &defs.translations {
            bus.set_translations(Translations::from_json(translations)?);
        }
        self.install_handlers(bus);
        Ok(())
    }

    fn install_handlers(&self, bus: &mut BusAttachment) {
        let host = Rc::clone(&self.inner);
        bus.on_attach(move |bus| host.notify(bus, &BindingEvent::Attach));

        let host = Rc::clone(&self.inner);
        bus.on_detach(move |bus| {
            {
                let mut state = host.state.borrow_mut();
                state.deferred.clear();
                state.proxies.clear();
            }
            host.notify(bus, &BindingEvent::Detach);
        });

        let host = Rc::clone(&self.inner);
        bus.on_policy_changed(move |bus| host.notify(bus, &BindingEvent::PolicyChanged));

        let host = Rc::clone(&self.inner);
        bus.on_peer_connected(move |bus, peer| {
            let event = BindingEvent::PeerConnected {
                peer: peer.name.clone(),
                session_id: peer.session_id,
                port: peer.port,
                authenticated: peer.authenticated,
            };
            match host.dispatch(bus, &event) {
                Ok(BindingOutcome::Accepted { accept }) => accept,
                Ok(BindingOutcome::Thrown { message }) => {
                    tracing::warn!(target: "ajs.script", peer = %peer.name, %message, "onPeerConnected threw; refusing");
                    false
                }
                Ok(_) => true,
                Err(err) => {
                    tracing::warn!(target: "ajs.script", peer = %peer.name, %err, "onPeerConnected failed; refusing");
                    false
                }
            }
        });

        let host = Rc::clone(&self.inner);
        bus.on_peer_disconnected(move |bus, peer| {
            host.state.borrow_mut().proxies.retain(|_, proxy| proxy.peer() != peer);
            host.notify(
                bus,
                &BindingEvent::PeerDisconnected {
                    peer: peer.to_string(),
                },
            )
        });

        let host = Rc::clone(&self.inner);
        bus.on_method_call(move |bus, ctx, args| {
            let id = host.next_context();
            let event = BindingEvent::MethodCall {
                context: CallInfo::from_context(id, ctx),
                args: to_json(&args),
            };
            host.request(bus, ctx, id, &event)
        });

        let host = Rc::clone(&self.inner);
        bus.on_signal(move |bus, ctx, args| {
            let event = BindingEvent::Signal {
                context: CallInfo::from_context(0, ctx),
                args: to_json(&args),
            };
            match host.dispatch(bus, &event) {
                Ok(BindingOutcome::Done) => Ok(()),
                // `ctx` records any reply to a signal as a violation.
                Ok(outcome) => answer(ctx, &ReplyTypes::Ack, outcome),
                Err(err) => Err(Rejection::new(err.to_string())),
            }
        });

        let host = Rc::clone(&self.inner);
        bus.on_prop_get(move |bus, ctx, iface, prop| {
            let id = host.next_context();
            let event = BindingEvent::PropGet {
                context: CallInfo::from_context(id, ctx),
                iface: iface.to_string(),
                prop: prop.to_string(),
            };
            host.request(bus, ctx, id, &event)
        });

        let host = Rc::clone(&self.inner);
        bus.on_prop_set(move |bus, ctx, iface, prop, value| {
            let id = host.next_context();
            let event = BindingEvent::PropSet {
                context: CallInfo::from_context(id, ctx),
                iface: iface.to_string(),
                prop: prop.to_string(),
                value: value.to_json(),
            };
            host.request(bus, ctx, id, &event)
        });

        let host = Rc::clone(&self.inner);
        bus.on_prop_get_all(move |bus, ctx, iface| {
            let id = host.next_context();
            let event = BindingEvent::PropGetAll {
                context: CallInfo::from_context(id, ctx),
                iface: iface.to_string(),
            };
            host.request(bus, ctx, id, &event)
        });
    }

    /// Requests that returned without an answer and still wait for one.
    pub fn pending_replies(&self) -> usize {
        self.inner.sweep();
        self.inner.state.borrow().deferred.len()
    }

    /// Proxies handed to the script that are still usable.
    pub fn proxies(&self) -> usize {
        self.inner.sweep();
        self.inner.state.borrow().proxies.len()
    }

    /// Live script timers.
    pub fn timers(&self) -> usize {
        self.inner.state.borrow().timers.len()
    }
}

impl fmt::Debug for ScriptHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.borrow();
        f.debug_struct("ScriptHost")
            .field("timers", &state.timers.len())
            .field("proxies", &state.proxies.len())
            .field("deferred", &state.deferred.len())
            .finish()
    }
}

impl HostInner {
    fn next_context(&self) -> u32 {
        let mut state = self.state.borrow_mut();
        state.next_context = state.next_context.wrapping_add(1).max(1);
        state.next_context
    }

    fn eval(&self, bus: &BusAttachment, name: &str, source: &str) -> Result<(), ScriptError> {
        let mut adapter = self
            .adapter
            .try_borrow_mut()
            .map_err(|_| ScriptError::Command("script engine re-entered".to_string()))?;
        adapter.set_timer_slots(bus.free_timer_slots());
        adapter.eval(name, source)
    }

    /// Deliver one event, then apply what the script queued.
    fn dispatch(self: &Rc<Self>, bus: &mut BusAttachment, event: &BindingEvent) -> Result<BindingOutcome, ScriptError> {
        self.sweep();
        let outcome = {
            let mut adapter = self
                .adapter
                .try_borrow_mut()
                .map_err(|_| ScriptError::Command("script engine re-entered".to_string()))?;
            adapter.set_timer_slots(bus.free_timer_slots());
            adapter.dispatch_event(event)
        };
        self.drain(bus);
        outcome
    }

    /// Forget requests the router timed out and proxies whose peer is gone.
    fn sweep(&self) {
        let mut state = self.state.borrow_mut();
        let before = state.deferred.len();
        state.deferred.retain(|_, deferred| deferred.reply.is_pending());
        let expired = before - state.deferred.len();
        if expired > 0 {
            tracing::debug!(target: "ajs.script", expired, "dropped timed-out requests");
        }
        state.proxies.retain(|_, proxy| proxy.is_valid());
    }

    /// Dispatch an event nobody answers; failures are only logged.
    fn notify(self: &Rc<Self>, bus: &mut BusAttachment, event: &BindingEvent) {
        match self.dispatch(bus, event) {
            Ok(BindingOutcome::Thrown { message }) => {
                tracing::warn!(target: "ajs.script", event = event.label(), %message, "script handler threw");
            }
            Ok(_) => {}
            Err(err) => {
                tracing::warn!(target: "ajs.script", event = event.label(), %err, "script dispatch failed");
            }
        }
    }

    /// Method and property requests: apply the script's answer to `ctx`.
    fn request(
        self: &Rc<Self>,
        bus: &mut BusAttachment,
        ctx: &mut CallContext,
        id: u32,
        event: &BindingEvent,
    ) -> HandlerResult {
        let outcome = self.dispatch(bus, event).map_err(|err| Rejection::new(err.to_string()))?;
        let types = ReplyTypes::of(ctx);
        match outcome {
            BindingOutcome::Done | BindingOutcome::Accepted { .. } => {
                if let Some(reply) = ctx.defer() {
                    tracing::debug!(target: "ajs.script", member = ctx.member(), id, "request deferred by script");
                    self.state.borrow_mut().deferred.insert(id, Deferred { reply, types });
                }
                Ok(())
            }
            answered => answer(ctx, &types, answered),
        }
    }

    /// Apply queued commands until the script stops queueing.
    fn drain(self: &Rc<Self>, bus: &mut BusAttachment) {
        loop {
            let commands = match self.adapter.try_borrow_mut() {
                Ok(mut adapter) => adapter.poll_commands(),
                Err(_) => return,
            };
            if commands.is_empty() {
                return;
            }
            for command in commands {
                tracing::trace!(target: "ajs.script", ?command, "apply");
                let timer = match &command {
                    BindingCommand::SetTimer { id, .. } => Some(*id),
                    _ => None,
                };
                if let Err(err) = self.apply(bus, command) {
                    tracing::warn!(target: "ajs.script", %err, "script command failed");
                    if let Some(id) = timer {
                        let message = err.to_string();
                        self.notify(bus, &BindingEvent::TimerFailed { id, message });
                    }
                }
            }
        }
    }

    fn proxy(&self, id: u32) -> AjsResult<RemoteServiceProxy> {
        self.state.borrow().proxies.get(&id).cloned().ok_or_else(|| {
            ResourceError::ProxyInvalid {
                peer: format!("proxy #{id}"),
            }
            .into()
        })
    }

    fn apply(self: &Rc<Self>, bus: &mut BusAttachment, command: BindingCommand) -> AjsResult<()> {
        match command {
            BindingCommand::SetTimer { id, ms, repeat } => {
                let host = Rc::clone(self);
                let timer = if repeat {
                    bus.set_interval(ms, move |bus| host.notify(bus, &BindingEvent::Timer { id }))?
                } else {
                    bus.set_timeout(ms, move |bus| {
                        host.state.borrow_mut().timers.remove(&id);
                        host.notify(bus, &BindingEvent::Timer { id });
                    })?
                };
                self.state.borrow_mut().timers.insert(id, (timer, repeat));
            }
            BindingCommand::ResetTimer { id, ms } => {
                let entry = self.state.borrow().timers.get(&id).copied();
                let (timer, repeat) = entry.ok_or_else(|| ScriptError::Command(format!("unknown timer {id}")))?;
                if repeat {
                    bus.reset_interval(timer, ms)?;
                } else {
                    bus.reset_timeout(timer, ms)?;
                }
            }
            BindingCommand::ClearTimer { id } => {
                let entry = self.state.borrow_mut().timers.remove(&id);
                match entry {
                    Some((timer, true)) => bus.clear_interval(timer)?,
                    Some((timer, false)) => bus.clear_timeout(timer)?,
                    None => tracing::debug!(target: "ajs.script", id, "clear of a finished timer ignored"),
                }
            }
            BindingCommand::FindService { id, iface } => {
                let host = Rc::clone(self);
                bus.find_service(&iface, move |bus, proxy| host.found(bus, id, proxy));
            }
            BindingCommand::FindServiceByName {
                id,
                name,
                interfaces,
                path,
                port,
            } => {
                let host = Rc::clone(self);
                let target = ServiceName { interfaces, path, port };
                bus.find_service_by_name(&name, target, move |bus, proxy| host.found(bus, id, proxy));
            }
            BindingCommand::AdvertiseName { name } => bus.advertise_name(&name)?,
            BindingCommand::ReleaseProxy { proxy } => {
                self.state.borrow_mut().proxies.remove(&proxy);
            }
            BindingCommand::Call {
                proxy,
                call,
                member,
                args,
                timeout,
            } => {
                let pending = self.proxy(proxy).and_then(|proxy| {
                    let mut method = proxy.method(&member)?;
                    if let Some(ms) = timeout {
                        method = method.timeout(ms);
                    }
                    method.call_json(&args)
                });
                self.track(bus, call, pending);
            }
            BindingCommand::GetProp { proxy, call, name } => {
                let pending = self.proxy(proxy).and_then(|proxy| proxy.get_prop(&name));
                self.track(bus, call, pending);
            }
            BindingCommand::SetProp {
                proxy,
                call,
                name,
                value,
            } => {
                let pending = self.proxy(proxy).and_then(|proxy| proxy.set_prop_json(&name, &value));
                self.track(bus, call, pending);
            }
            BindingCommand::GetAllProps { proxy, call, iface } => {
                let pending = self.proxy(proxy).and_then(|proxy| proxy.get_all_props(&iface));
                self.track(bus, call, pending);
            }
            BindingCommand::Signal {
                path,
                iface,
                member,
                args,
                sessionless,
                ttl,
                proxy,
            } => {
                let mut sender = match proxy {
                    Some(id) => self.proxy(id)?.signal(&path, &iface, &member)?,
                    None => bus.signal(&path, &iface, &member)?,
                };
                sender = sender.sessionless(sessionless);
                if let Some(ttl) = ttl {
                    sender = sender.time_to_live(ttl);
                }
                sender.send_json(&args)?;
            }
            BindingCommand::AddMatch { iface, member } => bus.add_match(&iface, &member),
            BindingCommand::RemoveMatch { iface, member } => {
                bus.remove_match(&iface, &member);
            }
            BindingCommand::Reply { context, args } => {
                let deferred = self.take_deferred(context)?;
                let values = deferred.types.convert(&args)?;
                deferred.reply.reply(values)?;
            }
            BindingCommand::ErrorReply { context, name, message } => {
                self.take_deferred(context)?.reply.error_reply(name, message)?;
            }
            BindingCommand::Notify { kind, text, ttl } => {
                let kind = notification_kind(kind)?;
                let notification = bus.notification(kind, &text);
                bus.send_notification(&notification, ttl)?;
            }
            BindingCommand::CancelNotification { kind } => {
                bus.cancel_notification(notification_kind(kind)?)?;
            }
            BindingCommand::FactoryReset => bus.factory_reset()?,
            BindingCommand::ClearCredentials => bus.clear_credentials(),
            BindingCommand::Detach => bus.detach()?,
        }
        Ok(())
    }

    fn take_deferred(&self, context: u32) -> AjsResult<Deferred> {
        self.state.borrow_mut().deferred.remove(&context).ok_or_else(|| {
            ResourceError::ReplyExpired {
                member: format!("request #{context}"),
            }
            .into()
        })
    }

    fn found(self: &Rc<Self>, bus: &mut BusAttachment, id: u32, proxy: RemoteServiceProxy) {
        let event = {
            let mut state = self.state.borrow_mut();
            state.next_proxy += 1;
            let handle = state.next_proxy;
            let event = BindingEvent::Found {
                id,
                proxy: handle,
                peer: proxy.peer().to_string(),
                path: proxy.path().to_string(),
                interfaces: proxy.interfaces().to_vec(),
            };
            state.proxies.insert(handle, proxy);
            event
        };
        self.notify(bus, &event);
    }

    /// Route the outcome of an outbound call back to the script. A call that
    /// could not be sent reports its error on the next poll.
    fn track(self: &Rc<Self>, bus: &mut BusAttachment, call: u32, pending: AjsResult<PendingCall>) {
        match pending {
            Ok(pending) => {
                let on_reply = Rc::clone(self);
                let on_error = Rc::clone(self);
                let _ = pending
                    .on_reply(move |bus, values| {
                        on_reply.notify(
                            bus,
                            &BindingEvent::Reply {
                                call,
                                args: to_json(&values),
                            },
                        )
                    })
                    .on_error(move |bus, err| {
                        on_error.notify(
                            bus,
                            &BindingEvent::CallError {
                                call,
                                name: err.name().to_string(),
                                message: err.to_string(),
                            },
                        )
                    });
            }
            Err(err) => {
                let host = Rc::clone(self);
                let message = err.to_string();
                bus.post(move |bus| {
                    host.notify(
                        bus,
                        &BindingEvent::CallError {
                            call,
                            name: String::new(),
                            message,
                        },
                    )
                });
            }
        }
    }
}

/// Apply a handler's answers to `ctx` in the order the script gave them.
/// `ctx` records every answer after the first as a violation and never sends it.
fn answer(ctx: &mut CallContext, types: &ReplyTypes, outcome: BindingOutcome) -> HandlerResult {
    match outcome {
        BindingOutcome::Replied { args } => {
            if ctx.is_completed() || ctx.kind() == CallKind::Signal {
                ctx.reply(Vec::new());
            } else {
                let values = types
                    .convert(&args)
                    .map_err(|err| Rejection::with_name(error_names::INVALID_ARGS, err.to_string()))?;
                ctx.reply(values);
            }
        }
        BindingOutcome::Errored { name, message } => ctx.error_reply(name, message),
        BindingOutcome::Thrown { message } => return Err(Rejection::new(message)),
        BindingOutcome::Answers { answers } => {
            for outcome in answers {
                answer(ctx, types, outcome)?;
            }
        }
        BindingOutcome::Done | BindingOutcome::Accepted { .. } => {}
    }
    Ok(())
}

fn notification_kind(code: u16) -> AjsResult<NotificationType> {
    NotificationType::from_code(code)
        .ok_or_else(|| ResourceError::OutOfRange(format!("notification type {code}")).into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bindings::protocol::ScriptDefinitions;
    use crate::bus::{LoopbackBus, MessageHeader};
    use crate::config::BindingConfig;
    use crate::core::error::ContractViolation;
    use serde_json::json;
    use std::cell::Cell;

    const IFACE: &str = "org.alljoyn.alljoyn_test";
    const PATH: &str = "/org/alljoyn/alljoyn_test";

    /// Adapter whose answers and commands are scripted by the test.
    #[derive(Clone, Default)]
    struct Scripted {
        defs: ScriptDefinitions,
        events: Rc<RefCell<Vec<BindingEvent>>>,
        /// Answer per event label; anything else returns without answering.
        outcomes: Rc<RefCell<HashMap<&'static str, BindingOutcome>>>,
        queued: Rc<RefCell<Vec<BindingCommand>>>,
        /// Commands queued the next time an event of this label arrives.
        on_event: Rc<RefCell<HashMap<&'static str, Vec<BindingCommand>>>>,
        /// Last timer slot count the host published.
        slots: Rc<Cell<Option<usize>>>,
    }

    impl BindingAdapter for Scripted {
        fn eval(&mut self, _name: &str, _source: &str) -> Result<(), ScriptError> {
            Ok(())
        }

        fn definitions(&mut self) -> Result<ScriptDefinitions, ScriptError> {
            Ok(self.defs.clone())
        }

        fn dispatch_event(&mut self, event: &BindingEvent) -> Result<BindingOutcome, ScriptError> {
            self.events.borrow_mut().push(event.clone());
            if let Some(commands) = self.on_event.borrow_mut().remove(event.label()) {
                self.queued.borrow_mut().extend(commands);
            }
            Ok(self
                .outcomes
                .borrow()
                .get(event.label())
                .cloned()
                .unwrap_or(BindingOutcome::Done))
        }

        fn poll_commands(&mut self) -> Vec<BindingCommand> {
            self.queued.borrow_mut().drain(..).collect()
        }

        fn set_timer_slots(&mut self, slots: usize) {
            self.slots.set(Some(slots));
        }
    }

    fn test_defs() -> ScriptDefinitions {
        ScriptDefinitions {
            interface_definition: Some(json!({
                IFACE: {
                    "my_ping": {"type": "METHOD", "args": ["s"], "returns": ["s"]},
                    "my_signal": {"type": "SIGNAL", "args": ["s"]},
                    "int_val": {"type": "PROPERTY", "signature": "i", "access": "RW"}
                }
            })),
            object_definition: Some(json!({ PATH: {"interfaces": [IFACE]} })),
            ..Default::default()
        }
    }

    fn events_labelled(adapter: &Scripted, label: &str) -> Vec<BindingEvent> {
        adapter
            .events
            .borrow()
            .iter()
            .filter(|e| e.label() == label)
            .cloned()
            .collect()
    }

    fn scripted_service(fabric: &LoopbackBus, adapter: &Scripted, config: BindingConfig) -> (ScriptHost, BusAttachment) {
        let host = ScriptHost::new(adapter.clone());
        let mut bus = BusAttachment::new(config);
        host.run(&mut bus, "svc.js", "").unwrap();
        bus.attach(fabric.connect()).unwrap();
        (host, bus)
    }

    /// A client that calls `my_ping` as call `call` on the first service it finds.
    fn pinging_client(fabric: &LoopbackBus, call: u32) -> (Scripted, ScriptHost, BusAttachment) {
        let adapter = Scripted {
            defs: test_defs(),
            ..Default::default()
        };
        adapter
            .queued
            .borrow_mut()
            .push(BindingCommand::FindService { id: 1, iface: IFACE.to_string() });
        adapter.on_event.borrow_mut().insert(
            "found",
            vec![BindingCommand::Call {
                proxy: 1,
                call,
                member: "my_ping".to_string(),
                args: vec![json!("x")],
                timeout: None,
            }],
        );
        let host = ScriptHost::new(adapter.clone());
        let mut bus = BusAttachment::new(BindingConfig::default());
        host.run(&mut bus, "client.js", "").unwrap();
        bus.attach(fabric.connect()).unwrap();
        (adapter, host, bus)
    }

    #[test]
    fn test_run_loads_definitions_and_attach_reaches_script() {
        let adapter = Scripted {
            defs: test_defs(),
            ..Default::default()
        };
        let host = ScriptHost::new(adapter.clone());
        let mut bus = BusAttachment::new(BindingConfig::default());
        host.run(&mut bus, "test.js", "").unwrap();
        assert!(bus.registry().interface(IFACE).is_some());

        let fabric = LoopbackBus::new();
        bus.attach(fabric.connect()).unwrap();
        bus.poll();
        assert_eq!(events_labelled(&adapter, "attach").len(), 1);
    }

    #[test]
    fn test_cleared_timer_never_reaches_script() {
        let adapter = Scripted::default();
        adapter.queued.borrow_mut().extend([
            BindingCommand::SetTimer { id: 1, ms: 100, repeat: true },
            BindingCommand::SetTimer { id: 2, ms: 100, repeat: false },
        ]);
        // The first tick of timer 1 clears timer 2, which is due in the same tick.
        adapter
            .on_event
            .borrow_mut()
            .insert("timer", vec![BindingCommand::ClearTimer { id: 2 }]);

        let host = ScriptHost::new(adapter.clone());
        let mut bus = BusAttachment::new(BindingConfig::default());
        host.run(&mut bus, "timers.js", "").unwrap();
        assert_eq!(host.timers(), 2);

        bus.advance(100);
        assert_eq!(events_labelled(&adapter, "timer"), vec![BindingEvent::Timer { id: 1 }]);
        assert_eq!(host.timers(), 1);
        bus.advance(100);
        assert_eq!(events_labelled(&adapter, "timer").len(), 2);
    }

    #[test]
    fn test_unanswered_request_is_answered_later() {
        let fabric = LoopbackBus::new();
        let adapter = Scripted {
            defs: test_defs(),
            ..Default::default()
        };
        let host = ScriptHost::new(adapter.clone());
        let mut svc = BusAttachment::new(BindingConfig::default());
        host.run(&mut svc, "svc.js", "").unwrap();
        svc.attach(fabric.connect()).unwrap();

        let client_adapter = Scripted {
            defs: test_defs(),
            ..Default::default()
        };
        client_adapter
            .queued
            .borrow_mut()
            .push(BindingCommand::FindService { id: 1, iface: IFACE.to_string() });
        client_adapter.on_event.borrow_mut().insert(
            "found",
            vec![BindingCommand::Call {
                proxy: 1,
                call: 5,
                member: "my_ping".to_string(),
                args: vec![json!("hello")],
                timeout: None,
            }],
        );
        let client_host = ScriptHost::new(client_adapter.clone());
        let mut client = BusAttachment::new(BindingConfig::default());
        client_host.run(&mut client, "client.js", "").unwrap();
        client.attach(fabric.connect()).unwrap();

        for _ in 0..4 {
            client.poll();
            svc.poll();
        }
        let calls = events_labelled(&adapter, "methodCall");
        assert_eq!(calls.len(), 1);
        assert_eq!(host.pending_replies(), 1);
        assert_eq!(client_host.proxies(), 1);

        let BindingEvent::MethodCall { context, args } = &calls[0] else {
            panic!("expected a method call");
        };
        assert_eq!(args, &vec![json!("hello")]);
        adapter.queued.borrow_mut().push(BindingCommand::Reply {
            context: context.id,
            args: vec![json!("pong")],
        });
        host.eval(&mut svc, "late.js", "").unwrap();
        assert_eq!(host.pending_replies(), 0);

        for _ in 0..2 {
            svc.poll();
            client.poll();
        }
        assert_eq!(
            events_labelled(&client_adapter, "reply"),
            vec![BindingEvent::Reply {
                call: 5,
                args: vec![json!("pong")]
            }]
        );
    }

    #[test]
    fn test_thrown_handler_becomes_rejection() {
        let fabric = LoopbackBus::new();
        let adapter = Scripted {
            defs: test_defs(),
            ..Default::default()
        };
        adapter.outcomes.borrow_mut().insert(
            "methodCall",
            BindingOutcome::Thrown {
                message: "nope".to_string(),
            },
        );
        let host = ScriptHost::new(adapter.clone());
        let mut svc = BusAttachment::new(BindingConfig::default());
        host.run(&mut svc, "svc.js", "").unwrap();
        svc.attach(fabric.connect()).unwrap();

        let client_adapter = Scripted {
            defs: test_defs(),
            ..Default::default()
        };
        client_adapter
            .queued
            .borrow_mut()
            .push(BindingCommand::FindService { id: 1, iface: IFACE.to_string() });
        client_adapter.on_event.borrow_mut().insert(
            "found",
            vec![BindingCommand::Call {
                proxy: 1,
                call: 9,
                member: "my_ping".to_string(),
                args: vec![json!("x")],
                timeout: None,
            }],
        );
        let client_host = ScriptHost::new(client_adapter.clone());
        let mut client = BusAttachment::new(BindingConfig::default());
        client_host.run(&mut client, "client.js", "").unwrap();
        client.attach(fabric.connect()).unwrap();

        for _ in 0..6 {
            client.poll();
            svc.poll();
        }
        let errors = events_labelled(&client_adapter, "callError");
        assert_eq!(errors.len(), 1);
        match &errors[0] {
            BindingEvent::CallError { call, name, message } => {
                assert_eq!(*call, 9);
                assert_eq!(name, error_names::REJECTED);
                assert!(message.contains("nope"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_bad_command_is_logged_not_fatal() {
        let adapter = Scripted::default();
        adapter.queued.borrow_mut().extend([
            BindingCommand::ResetTimer { id: 42, ms: None },
            BindingCommand::SetTimer { id: 1, ms: 10, repeat: false },
        ]);
        let host = ScriptHost::new(adapter);
        let mut bus = BusAttachment::new(BindingConfig::default());
        host.run(&mut bus, "bad.js", "").unwrap();
        assert_eq!(host.timers(), 1);
        bus.advance(10);
        assert_eq!(host.timers(), 0);
    }

    #[test]
    fn test_repeated_answers_keep_the_first() {
        let fabric = LoopbackBus::new();
        let adapter = Scripted {
            defs: test_defs(),
            ..Default::default()
        };
        adapter.outcomes.borrow_mut().insert(
            "methodCall",
            BindingOutcome::Answers {
                answers: vec![
                    BindingOutcome::Replied { args: vec![json!("first")] },
                    BindingOutcome::Replied { args: vec![json!("second")] },
                    BindingOutcome::Thrown {
                        message: "and then some".to_string(),
                    },
                ],
            },
        );
        let (_host, mut svc) = scripted_service(&fabric, &adapter, BindingConfig::default());
        let (client_adapter, _client_host, mut client) = pinging_client(&fabric, 3);

        for _ in 0..6 {
            client.poll();
            svc.poll();
        }
        assert_eq!(
            events_labelled(&client_adapter, "reply"),
            vec![BindingEvent::Reply {
                call: 3,
                args: vec![json!("first")]
            }]
        );
        assert!(events_labelled(&client_adapter, "callError").is_empty());
        assert!(matches!(
            svc.contract_violations().as_slice(),
            [ContractViolation::AlreadyReplied { .. }, ContractViolation::RejectAfterReply { .. }]
        ));
    }

    #[test]
    fn test_reply_to_signal_is_a_violation() {
        let fabric = LoopbackBus::new();
        let adapter = Scripted {
            defs: test_defs(),
            ..Default::default()
        };
        adapter
            .outcomes
            .borrow_mut()
            .insert("signal", BindingOutcome::Replied { args: Vec::new() });
        let (_host, mut svc) = scripted_service(&fabric, &adapter, BindingConfig::default());
        svc.poll();

        let name = svc.unique_name().unwrap().to_string();
        fabric
            .inject_signal(
                MessageHeader {
                    serial: 1,
                    sender: ":outside.1".to_string(),
                    destination: Some(name),
                    path: PATH.to_string(),
                    interface: IFACE.to_string(),
                    member: "my_signal".to_string(),
                    session_id: 0,
                },
                vec![MsgValue::from("hi")],
            )
            .unwrap();
        svc.poll();

        assert_eq!(events_labelled(&adapter, "signal").len(), 1);
        assert!(matches!(
            svc.contract_violations().as_slice(),
            [ContractViolation::ReplyToSignal { member }] if member == "my_signal"
        ));
    }

    #[test]
    fn test_timed_out_request_is_forgotten() {
        let fabric = LoopbackBus::new();
        let adapter = Scripted {
            defs: test_defs(),
            ..Default::default()
        };
        let mut config = BindingConfig::default();
        config.bus.call_timeout_ms = 100;
        let (host, mut svc) = scripted_service(&fabric, &adapter, config);
        let (_client_adapter, _client_host, mut client) = pinging_client(&fabric, 1);

        for _ in 0..6 {
            client.poll();
            svc.poll();
        }
        assert_eq!(host.pending_replies(), 1);
        let calls = events_labelled(&adapter, "methodCall");
        let BindingEvent::MethodCall { context, .. } = &calls[0] else {
            panic!("expected a method call");
        };

        svc.advance(150);
        assert_eq!(svc.dispatch_stats().timed_out, 1);
        assert_eq!(host.pending_replies(), 0);

        // A late answer finds nothing to complete and sends nothing.
        adapter.queued.borrow_mut().push(BindingCommand::Reply {
            context: context.id,
            args: vec![json!("late")],
        });
        host.eval(&mut svc, "late.js", "").unwrap();
        assert_eq!(svc.dispatch_stats().replied, 0);
    }

    #[test]
    fn test_lost_peer_drops_proxies_and_fails_calls() {
        let fabric = LoopbackBus::new();
        let adapter = Scripted {
            defs: test_defs(),
            ..Default::default()
        };
        adapter
            .outcomes
            .borrow_mut()
            .insert("methodCall", BindingOutcome::Replied { args: vec![json!("pong")] });
        let (_host, mut svc) = scripted_service(&fabric, &adapter, BindingConfig::default());
        let (client_adapter, client_host, mut client) = pinging_client(&fabric, 1);
        for _ in 0..6 {
            client.poll();
            svc.poll();
        }
        assert_eq!(events_labelled(&client_adapter, "reply").len(), 1);
        assert_eq!(client_host.proxies(), 1);

        fabric.disconnect(svc.unique_name().unwrap());
        client.poll();
        assert_eq!(events_labelled(&client_adapter, "peerDisconnected").len(), 1);
        assert_eq!(client_host.proxies(), 0);

        client_adapter.queued.borrow_mut().push(BindingCommand::Call {
            proxy: 1,
            call: 2,
            member: "my_ping".to_string(),
            args: vec![json!("again")],
            timeout: None,
        });
        client_host.eval(&mut client, "again.js", "").unwrap();
        client.poll();
        assert!(matches!(
            events_labelled(&client_adapter, "callError").as_slice(),
            [BindingEvent::CallError { call: 2, .. }]
        ));
    }

    #[test]
    fn test_refused_timer_is_reported_to_script() {
        let adapter = Scripted::default();
        adapter.queued.borrow_mut().extend([
            BindingCommand::SetTimer { id: 1, ms: 0, repeat: false },
            BindingCommand::SetTimer { id: 2, ms: 10, repeat: true },
            BindingCommand::SetTimer { id: 3, ms: 10, repeat: false },
        ]);
        let mut config = BindingConfig::default();
        config.bus.max_timers = 1;
        let host = ScriptHost::new(adapter.clone());
        let mut bus = BusAttachment::new(config);
        assert_eq!(bus.free_timer_slots(), 1);
        host.run(&mut bus, "timers.js", "").unwrap();

        let failed: Vec<u32> = events_labelled(&adapter, "timerFailed")
            .into_iter()
            .map(|event| match event {
                BindingEvent::TimerFailed { id, .. } => id,
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(failed, vec![1, 3]);
        assert_eq!(host.timers(), 1);

        host.eval(&mut bus, "more.js", "").unwrap();
        assert_eq!(adapter.slots.get(), Some(0));
    }
}
