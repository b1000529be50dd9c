use crate::bus::error_names;
use crate::bus::link::{BusLink, DeferredEntry};
use crate::bus::BusMessage;
use crate::core::error::{AjsError, AjsResult, ContractViolation, ResourceError, TransportError};
use crate::signature::{SigType, Signature};
use crate::value::{check_values, MsgValue};
use std::fmt;
use std::rc::Rc;

/// Handler outcome: `Err` rejects the request with a protocol error.
pub type HandlerResult = Result<(), Rejection>;

/// A handler's refusal of a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub name: String,
    pub message: String,
}

impl Rejection {
    /// Reject with the default `org.alljoyn.Bus.ErRejected` name.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            name: error_names::REJECTED.to_string(),
            message: message.into(),
        }
    }

    pub fn with_name(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.message)
    }
}

impl From<&str> for Rejection {
    fn from(message: &str) -> Self {
        Rejection::new(message)
    }
}

impl From<String> for Rejection {
    fn from(message: String) -> Self {
        Rejection::new(message)
    }
}

/// Which handler slot an inbound event is routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    MethodCall,
    Signal,
    PropGet,
    PropSet,
    PropGetAll,
}

/// Expected shape of a reply, derived from the registry at resolution time.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum ReplyShape {
    Method(Signature),
    PropGet(SigType),
    PropSet,
    PropGetAll(Vec<(String, SigType)>),
    NoReply,
}

impl ReplyShape {
    /// Validate handler reply values and convert them to wire form.
    ///
    /// `Get` replies are wrapped in a variant; `GetAll` replies become an
    /// `a{sv}` in declaration order with undeclared keys dropped.
    pub(crate) fn shape(&self, values: Vec<MsgValue>) -> Result<Vec<MsgValue>, String> {
        match self {
            ReplyShape::Method(sig) => {
                check_values(&values, sig)?;
                Ok(values)
            }
            ReplyShape::PropGet(ty) => {
                let [value]: [MsgValue; 1] = values
                    .try_into()
                    .map_err(|v: Vec<MsgValue>| format!("expected exactly one value, got {}", v.len()))?;
                if value.conforms(ty) {
                    return Ok(vec![MsgValue::Variant(Box::new(value))]);
                }
                match value {
                    MsgValue::Variant(inner) if inner.conforms(ty) => Ok(vec![MsgValue::Variant(inner)]),
                    other => Err(format!("{} where '{ty}' is declared", other.type_label())),
                }
            }
            ReplyShape::PropSet => {
                if values.is_empty() {
                    Ok(values)
                } else {
                    Err(format!("set replies carry no value, got {}", values.len()))
                }
            }
            ReplyShape::PropGetAll(props) => {
                let [MsgValue::Dict(entries)]: [MsgValue; 1] = values
                    .try_into()
                    .map_err(|_| "expected a single property map".to_string())?
                else {
                    return Err("expected a single property map".to_string());
                };
                let mut out = Vec::with_capacity(props.len());
                for (name, ty) in props {
                    let value = entries
                        .iter()
                        .find(|(k, _)| k.as_str() == Some(name.as_str()))
                        .map(|(_, v)| v.clone())
                        .ok_or_else(|| format!("missing property '{name}'"))?;
                    let value = if value.conforms(ty) {
                        value
                    } else {
                        match value {
                            MsgValue::Variant(inner) if inner.conforms(ty) => *inner,
                            other => {
                                return Err(format!(
                                    "property '{name}' is {} where '{ty}' is declared",
                                    other.type_label()
                                ))
                            }
                        }
                    };
                    out.push((MsgValue::Str(name.clone()), MsgValue::Variant(Box::new(value))));
                }
                let extra = entries.len().saturating_sub(out.len());
                if extra > 0 {
                    tracing::trace!(target: "ajs.dispatch", extra, "undeclared properties dropped from GetAll reply");
                }
                Ok(vec![MsgValue::Dict(out)])
            }
            ReplyShape::NoReply => Err("signals take no reply".to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Outcome {
    Pending,
    Replied(Vec<MsgValue>),
    Errored { name: String, message: String },
    Deferred,
}

/// Per-event context handed to a handler.
///
/// Carries the resolved `member`, `iface` and `path`, the `sender`, and
/// whether the event came from this same attachment. A method or property
/// request must be completed exactly once: by [`reply`](Self::reply), by
/// [`error_reply`](Self::error_reply), by returning `Err(Rejection)`, or by
/// taking a [`DeferredReply`] with [`defer`](Self::defer). Returning without
/// an answer is a contract violation and the request times out for the
/// caller. Answers after the first are violations too; they are never sent
/// and the first answer stands.
pub struct CallContext {
    kind: CallKind,
    member: String,
    iface: String,
    path: String,
    sender: String,
    from_self: bool,
    serial: u32,
    session_id: u32,
    shape: ReplyShape,
    outcome: Outcome,
    violations: Vec<ContractViolation>,
    link: Option<Rc<BusLink>>,
}

impl CallContext {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        kind: CallKind,
        member: &str,
        iface: &str,
        path: &str,
        sender: &str,
        from_self: bool,
        serial: u32,
        session_id: u32,
        shape: ReplyShape,
        link: Option<Rc<BusLink>>,
    ) -> Self {
        Self {
            kind,
            member: member.to_string(),
            iface: iface.to_string(),
            path: path.to_string(),
            sender: sender.to_string(),
            from_self,
            serial,
            session_id,
            shape,
            outcome: Outcome::Pending,
            violations: Vec::new(),
            link,
        }
    }

    pub fn kind(&self) -> CallKind {
        self.kind
    }

    /// Member name; the property name for property requests.
    pub fn member(&self) -> &str {
        &self.member
    }

    pub fn iface(&self) -> &str {
        &self.iface
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn sender(&self) -> &str {
        &self.sender
    }

    pub fn from_self(&self) -> bool {
        self.from_self
    }

    pub fn serial(&self) -> u32 {
        self.serial
    }

    pub fn session_id(&self) -> u32 {
        self.session_id
    }

    /// Declared reply types for a method call.
    pub fn reply_signature(&self) -> Option<&Signature> {
        match &self.shape {
            ReplyShape::Method(sig) => Some(sig),
            _ => None,
        }
    }

    /// Declared type of the property being read or written.
    pub fn property_type(&self) -> Option<&SigType> {
        match &self.shape {
            ReplyShape::PropGet(ty) => Some(ty),
            _ => None,
        }
    }

    /// Property names and types a `GetAll` reply must contain.
    pub fn property_set(&self) -> Option<&[(String, SigType)]> {
        match &self.shape {
            ReplyShape::PropGetAll(props) => Some(props),
            _ => None,
        }
    }

    pub fn violations(&self) -> &[ContractViolation] {
        &self.violations
    }

    pub fn is_completed(&self) -> bool {
        self.outcome != Outcome::Pending
    }

    fn violate(&mut self, violation: ContractViolation) {
        tracing::warn!(target: "ajs.dispatch", member = %self.member, %violation, "handler contract violation");
        self.violations.push(violation);
    }

    /// Reply with values matching the declared reply shape.
    pub fn reply(&mut self, values: Vec<MsgValue>) {
        let member = self.member.clone();
        if self.kind == CallKind::Signal {
            return self.violate(ContractViolation::ReplyToSignal { member });
        }
        match self.outcome {
            Outcome::Pending => {}
            Outcome::Errored { .. } => return self.violate(ContractViolation::ReplyAfterReject { member }),
            Outcome::Replied(_) | Outcome::Deferred => {
                return self.violate(ContractViolation::AlreadyReplied { member })
            }
        }
        match self.shape.shape(values) {
            Ok(wire) => self.outcome = Outcome::Replied(wire),
            Err(detail) => self.violate(ContractViolation::ReplyShape { member, detail }),
        }
    }

    /// Reply with a single value.
    pub fn reply_value(&mut self, value: impl Into<MsgValue>) {
        self.reply(vec![value.into()]);
    }

    /// Reply to `GetAll` with a property-name keyed map.
    pub fn reply_props<I, K>(&mut self, props: I)
    where
        I: IntoIterator<Item = (K, MsgValue)>,
        K: Into<String>,
    {
        let dict = props
            .into_iter()
            .map(|(k, v)| (MsgValue::Str(k.into()), v))
            .collect();
        self.reply(vec![MsgValue::Dict(dict)]);
    }

    /// Complete the request with a named protocol error.
    pub fn error_reply(&mut self, name: impl Into<String>, message: impl Into<String>) {
        let member = self.member.clone();
        if self.kind == CallKind::Signal {
            return self.violate(ContractViolation::ReplyToSignal { member });
        }
        match self.outcome {
            Outcome::Pending => {
                self.outcome = Outcome::Errored {
                    name: name.into(),
                    message: message.into(),
                }
            }
            Outcome::Errored { .. } => self.violate(ContractViolation::AlreadyReplied { member }),
            Outcome::Replied(_) | Outcome::Deferred => {
                self.violate(ContractViolation::RejectAfterReply { member })
            }
        }
    }

    /// Take over the request and answer it later.
    pub fn defer(&mut self) -> Option<DeferredReply> {
        let member = self.member.clone();
        if self.kind == CallKind::Signal {
            self.violate(ContractViolation::ReplyToSignal { member });
            return None;
        }
        if self.outcome != Outcome::Pending {
            self.violate(ContractViolation::AlreadyReplied { member });
            return None;
        }
        let link = self.link.clone()?;
        self.outcome = Outcome::Deferred;
        Some(DeferredReply {
            link,
            destination: self.sender.clone(),
            serial: self.serial,
            member: self.member.clone(),
            shape: self.shape.clone(),
        })
    }

    /// Apply the handler's return value. Called once by the router.
    pub(crate) fn settle(&mut self, result: HandlerResult) {
        if let Err(rejection) = result {
            let member = self.member.clone();
            match self.outcome {
                Outcome::Pending if self.kind != CallKind::Signal => {
                    self.outcome = Outcome::Errored {
                        name: rejection.name,
                        message: rejection.message,
                    }
                }
                Outcome::Pending => {
                    tracing::info!(target: "ajs.dispatch", member = %member, %rejection, "signal handler rejected");
                }
                Outcome::Errored { .. } => self.violate(ContractViolation::AlreadyReplied { member }),
                Outcome::Replied(_) | Outcome::Deferred => {
                    self.violate(ContractViolation::RejectAfterReply { member })
                }
            }
        } else if self.kind != CallKind::Signal
            && self.outcome == Outcome::Pending
            && self.violations.is_empty()
        {
            let member = self.member.clone();
            self.violate(ContractViolation::NoReply { member });
        }
    }

    pub(crate) fn record_panic(&mut self, message: String) {
        let member = self.member.clone();
        self.violate(ContractViolation::HandlerPanicked { member, message });
    }

    pub(crate) fn into_parts(self) -> (Outcome, Vec<ContractViolation>) {
        (self.outcome, self.violations)
    }
}

impl fmt::Debug for CallContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallContext")
            .field("kind", &self.kind)
            .field("member", &self.member)
            .field("iface", &self.iface)
            .field("path", &self.path)
            .field("sender", &self.sender)
            .field("from_self", &self.from_self)
            .field("serial", &self.serial)
            .finish()
    }
}

/// A request whose answer was postponed with [`CallContext::defer`].
///
/// Consumed by answering. It becomes unusable when the attachment detaches
/// or the request times out.
pub struct DeferredReply {
    link: Rc<BusLink>,
    destination: String,
    serial: u32,
    member: String,
    shape: ReplyShape,
}

impl DeferredReply {
    pub fn member(&self) -> &str {
        &self.member
    }

    pub fn reply_signature(&self) -> Option<&Signature> {
        match &self.shape {
            ReplyShape::Method(sig) => Some(sig),
            _ => None,
        }
    }

    /// False once the request timed out, was answered or the attachment
    /// detached.
    pub fn is_pending(&self) -> bool {
        self.link.is_open() && self.link.has_deferred(&self.destination, self.serial)
    }

    fn claim(&self) -> AjsResult<DeferredEntry> {
        if !self.link.is_open() {
            return Err(TransportError::Detached.into());
        }
        self.link
            .finish_deferred(&self.destination, self.serial)
            .ok_or_else(|| {
                AjsError::from(ResourceError::ReplyExpired {
                    member: self.member.clone(),
                })
            })
    }

    pub fn reply(self, values: Vec<MsgValue>) -> AjsResult<()> {
        let wire = self.shape.shape(values).map_err(|detail| ContractViolation::ReplyShape {
            member: self.member.clone(),
            detail,
        })?;
        self.claim()?;
        self.link.push(BusMessage::MethodReply {
            sender: self.link.unique_name().to_string(),
            destination: self.destination.clone(),
            reply_serial: self.serial,
            args: wire,
        })?;
        Ok(())
    }

    pub fn error_reply(self, name: impl Into<String>, message: impl Into<String>) -> AjsResult<()> {
        self.claim()?;
        self.link.push(BusMessage::Error {
            sender: self.link.unique_name().to_string(),
            destination: self.destination.clone(),
            reply_serial: self.serial,
            name: name.into(),
            message: message.into(),
        })?;
        Ok(())
    }

    pub fn reject(self, rejection: Rejection) -> AjsResult<()> {
        self.error_reply(rejection.name, rejection.message)
    }
}

impl fmt::Debug for DeferredReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeferredReply")
            .field("destination", &self.destination)
            .field("serial", &self.serial)
            .field("member", &self.member)
            .finish()
    }
}
