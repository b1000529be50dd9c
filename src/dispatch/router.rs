use super::context::{CallContext, CallKind, Outcome, Rejection, ReplyShape};
use crate::bus::error_names;
use crate::bus::link::{BusLink, DeferredEntry};
use crate::bus::{BusMessage, MessageHeader};
use crate::core::error::ContractViolation;
use crate::registry::{DescriptorRegistry, Member, MemberKind, ObjectFlags, ResolveError, PROPERTIES_INTERFACE};
use crate::value::{check_values, MsgValue};
use std::collections::VecDeque;
use std::rc::Rc;

const VIOLATION_LOG_CAPACITY: usize = 128;

/// Per-event dispatch state.
///
/// `Received → Resolving → Dispatched → {Replied | Rejected | TimedOut}`.
/// Resolution failures go straight from `Resolving` to `Rejected` without
/// reaching a handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchState {
    Received,
    Resolving,
    Dispatched,
    Replied,
    Rejected,
    TimedOut,
}

/// Running counters, one per terminal transition.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchStats {
    pub received: u64,
    pub unresolved: u64,
    pub dispatched: u64,
    pub replied: u64,
    pub rejected: u64,
    pub deferred: u64,
    pub timed_out: u64,
    pub violations: u64,
    pub signals: u64,
}

/// Which handler slot a routed event goes to, with the slot's extra
/// parameters.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Target {
    Method,
    Signal,
    PropGet { iface: String, prop: String },
    PropSet { iface: String, prop: String, value: MsgValue },
    PropGetAll { iface: String },
}

pub(crate) struct Routed {
    pub ctx: CallContext,
    pub args: Vec<MsgValue>,
    pub target: Target,
}

/// Identity of the caller as seen by the router.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Caller {
    pub from_self: bool,
    pub authenticated: bool,
}

#[derive(Debug, Default)]
pub struct DispatchRouter {
    stats: DispatchStats,
    violations: VecDeque<ContractViolation>,
}

impl DispatchRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> DispatchStats {
        self.stats
    }

    /// Most recent contract violations, oldest first.
    pub fn violations(&self) -> impl Iterator<Item = &ContractViolation> {
        self.violations.iter()
    }

    fn unresolved(&mut self, header: &MessageHeader, err: ResolveError) -> Rejection {
        self.stats.unresolved += 1;
        tracing::warn!(
            target: "ajs.dispatch",
            path = %header.path,
            iface = %header.interface,
            member = %header.member,
            error = %err,
            "unresolved call rejected"
        );
        let name = match err {
            ResolveError::NoSuchObject(_)
            | ResolveError::Disabled { .. }
            | ResolveError::NoSuchInterface { .. } => error_names::SERVICE_UNKNOWN,
            ResolveError::NoSuchMember { .. } | ResolveError::WrongKind { .. } => {
                error_names::UNKNOWN_METHOD
            }
        };
        Rejection::with_name(name, err.to_string())
    }

    fn refuse(&mut self, header: &MessageHeader, name: &str, message: String) -> Rejection {
        self.stats.unresolved += 1;
        tracing::warn!(target: "ajs.dispatch", member = %header.member, %message, "call refused before dispatch");
        Rejection::with_name(name, message)
    }

    /// Resolve an inbound method call (including property access through
    /// the standard properties interface).
    pub(crate) fn route_call(
        &mut self,
        registry: &DescriptorRegistry,
        header: &MessageHeader,
        args: Vec<MsgValue>,
        caller: Caller,
        link: &Rc<BusLink>,
    ) -> Result<Routed, Rejection> {
        self.stats.received += 1;
        tracing::trace!(target: "ajs.dispatch", serial = header.serial, state = ?DispatchState::Resolving, member = %header.member);

        let context = |kind: CallKind, member: &str, iface: &str, shape: ReplyShape| {
            CallContext::new(
                kind,
                member,
                iface,
                &header.path,
                &header.sender,
                caller.from_self,
                header.serial,
                header.session_id,
                shape,
                Some(Rc::clone(link)),
            )
        };

        if header.interface == PROPERTIES_INTERFACE {
            return match header.member.as_str() {
                "Get" => {
                    let [iface, prop] = match string_args::<2>(&args) {
                        Some(v) => v,
                        None => {
                            return Err(self.refuse(header, error_names::INVALID_ARGS, "Get expects (ss)".into()))
                        }
                    };
                    let resolved = registry
                        .resolve(&header.path, &iface, &prop, MemberKind::Property)
                        .map_err(|e| self.unresolved(header, e))?;
                    self.check_secure(header, resolved.object.flags(), caller)?;
                    let Member::Property { signature, access } = resolved.member else {
                        return Err(self.refuse(header, error_names::UNKNOWN_METHOD, format!("'{prop}' is not a property")));
                    };
                    if !access.readable() {
                        return Err(self.refuse(header, error_names::ACCESS_DENIED, format!("property '{prop}' is write-only")));
                    }
                    Ok(Routed {
                        ctx: context(CallKind::PropGet, &prop, &iface, ReplyShape::PropGet(signature.clone())),
                        args: Vec::new(),
                        target: Target::PropGet { iface, prop },
                    })
                }
                "Set" => {
                    let (iface, prop, value) = match (args.first(), args.get(1), args.get(2), args.len()) {
                        (Some(MsgValue::Str(i)), Some(MsgValue::Str(p)), Some(v), 3) => {
                            (i.clone(), p.clone(), v.clone())
                        }
                        _ => return Err(self.refuse(header, error_names::INVALID_ARGS, "Set expects (ssv)".into())),
                    };
                    let resolved = registry
                        .resolve(&header.path, &iface, &prop, MemberKind::Property)
                        .map_err(|e| self.unresolved(header, e))?;
                    self.check_secure(header, resolved.object.flags(), caller)?;
                    let Member::Property { signature, access } = resolved.member else {
                        return Err(self.refuse(header, error_names::UNKNOWN_METHOD, format!("'{prop}' is not a property")));
                    };
                    if !access.writable() {
                        return Err(self.refuse(header, error_names::ACCESS_DENIED, format!("property '{prop}' is read-only")));
                    }
                    let value = match value {
                        MsgValue::Variant(inner) if !matches!(signature, crate::signature::SigType::Variant) => *inner,
                        other => other,
                    };
                    if !value.conforms(signature) {
                        return Err(self.refuse(
                            header,
                            error_names::INVALID_ARGS,
                            format!("'{prop}' expects '{signature}', got {}", value.type_label()),
                        ));
                    }
                    Ok(Routed {
                        ctx: context(CallKind::PropSet, &prop, &iface, ReplyShape::PropSet),
                        args: Vec::new(),
                        target: Target::PropSet { iface, prop, value },
                    })
                }
                "GetAll" => {
                    let [iface] = match string_args::<1>(&args) {
                        Some(v) => v,
                        None => {
                            return Err(self.refuse(header, error_names::INVALID_ARGS, "GetAll expects (s)".into()))
                        }
                    };
                    let (object, interface) = registry
                        .resolve_interface(&header.path, &iface)
                        .map_err(|e| self.unresolved(header, e))?;
                    self.check_secure(header, object.flags(), caller)?;
                    let props = interface
                        .properties()
                        .map(|(name, ty, _)| (name.to_string(), ty.clone()))
                        .collect();
                    Ok(Routed {
                        ctx: context(CallKind::PropGetAll, "GetAll", &iface, ReplyShape::PropGetAll(props)),
                        args: Vec::new(),
                        target: Target::PropGetAll { iface },
                    })
                }
                other => Err(self.refuse(
                    header,
                    error_names::UNKNOWN_METHOD,
                    format!("{PROPERTIES_INTERFACE} has no member '{other}'"),
                )),
            };
        }

        let resolved = registry
            .resolve(&header.path, &header.interface, &header.member, MemberKind::Method)
            .map_err(|e| self.unresolved(header, e))?;
        self.check_secure(header, resolved.object.flags(), caller)?;
        if let Err(detail) = check_values(&args, &resolved.member.in_signature()) {
            return Err(self.refuse(header, error_names::INVALID_ARGS, detail));
        }
        let shape = ReplyShape::Method(resolved.member.out_signature());
        Ok(Routed {
            ctx: context(CallKind::MethodCall, &header.member, &header.interface, shape),
            args,
            target: Target::Method,
        })
    }

    fn check_secure(&mut self, header: &MessageHeader, flags: ObjectFlags, caller: Caller) -> Result<(), Rejection> {
        if flags.contains(ObjectFlags::SECURE) && !caller.authenticated && !caller.from_self {
            return Err(self.refuse(
                header,
                error_names::SECURITY_VIOLATION,
                format!("'{}' requires an authenticated peer", header.path),
            ));
        }
        Ok(())
    }

    /// Resolve an inbound signal by interface and member. Unknown signals and
    /// argument mismatches are dropped.
    pub(crate) fn route_signal(
        &mut self,
        registry: &DescriptorRegistry,
        header: &MessageHeader,
        args: Vec<MsgValue>,
        from_self: bool,
        link: &Rc<BusLink>,
    ) -> Option<Routed> {
        self.stats.received += 1;
        let member = match registry.find_member(&header.interface, &header.member) {
            Some(member) if member.kind() == MemberKind::Signal => member,
            _ => {
                self.stats.unresolved += 1;
                tracing::warn!(target: "ajs.dispatch", iface = %header.interface, member = %header.member, "unknown signal dropped");
                return None;
            }
        };
        if let Err(detail) = check_values(&args, &member.in_signature()) {
            self.stats.unresolved += 1;
            tracing::warn!(target: "ajs.dispatch", member = %header.member, %detail, "signal arguments do not match");
            return None;
        }
        Some(Routed {
            ctx: CallContext::new(
                CallKind::Signal,
                &header.member,
                &header.interface,
                &header.path,
                &header.sender,
                from_self,
                header.serial,
                header.session_id,
                ReplyShape::NoReply,
                Some(Rc::clone(link)),
            ),
            args,
            target: Target::Signal,
        })
    }

    /// Send a protocol error for a call that never reached a handler.
    pub(crate) fn reject_unrouted(&mut self, header: &MessageHeader, rejection: Rejection, link: &BusLink) {
        self.stats.rejected += 1;
        send(link, BusMessage::Error {
            sender: link.unique_name().to_string(),
            destination: header.sender.clone(),
            reply_serial: header.serial,
            name: rejection.name,
            message: rejection.message,
        });
    }

    /// Turn a settled context into its terminal state, sending whatever the
    /// handler decided.
    pub(crate) fn complete(&mut self, ctx: CallContext, link: &BusLink) -> DispatchState {
        self.stats.dispatched += 1;
        let kind = ctx.kind();
        let member = ctx.member().to_string();
        let destination = ctx.sender().to_string();
        let serial = ctx.serial();
        let (outcome, violations) = ctx.into_parts();

        if kind == CallKind::Signal {
            self.stats.signals += 1;
        }
        // Violations are logged; the first answer, if any, still goes out.
        self.stats.violations += violations.len() as u64;
        for violation in violations {
            if self.violations.len() == VIOLATION_LOG_CAPACITY {
                self.violations.pop_front();
            }
            self.violations.push_back(violation);
        }

        match outcome {
            Outcome::Replied(args) => {
                self.stats.replied += 1;
                send(link, BusMessage::MethodReply {
                    sender: link.unique_name().to_string(),
                    destination,
                    reply_serial: serial,
                    args,
                });
                DispatchState::Replied
            }
            Outcome::Errored { name, message } => {
                self.stats.rejected += 1;
                tracing::info!(target: "ajs.dispatch", %member, %name, %message, "handler rejected call");
                send(link, BusMessage::Error {
                    sender: link.unique_name().to_string(),
                    destination,
                    reply_serial: serial,
                    name,
                    message,
                });
                DispatchState::Rejected
            }
            Outcome::Deferred => {
                self.stats.deferred += 1;
                link.track_deferred(
                    &destination,
                    serial,
                    DeferredEntry {
                        member,
                        deadline: link.call_deadline(),
                    },
                );
                DispatchState::Dispatched
            }
            Outcome::Pending => DispatchState::Dispatched,
        }
    }

    /// Time out deferred calls whose deadline passed.
    pub(crate) fn expire(&mut self, link: &BusLink, now: u64) -> usize {
        let expired = link.take_expired_deferred(now);
        for entry in &expired {
            self.stats.timed_out += 1;
            tracing::warn!(target: "ajs.dispatch", member = %entry.member, state = ?DispatchState::TimedOut, "deferred call was never answered");
        }
        expired.len()
    }
}

fn send(link: &BusLink, msg: BusMessage) {
    if let Err(err) = link.push(msg) {
        tracing::debug!(target: "ajs.dispatch", %err, "reply dropped");
    }
}

fn string_args<const N: usize>(args: &[MsgValue]) -> Option<[String; N]> {
    if args.len() != N {
        return None;
    }
    let strings: Vec<String> = args
        .iter()
        .map(|a| match a {
            MsgValue::Str(s) => Some(s.clone()),
            _ => None,
        })
        .collect::<Option<_>>()?;
    strings.try_into().ok()
}
