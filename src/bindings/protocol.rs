//! Script Command/Event Protocol
//!
//! The language-neutral seam between a script engine and the bus. Scripts
//! never touch the [`BusAttachment`](crate::bus::BusAttachment) directly:
//! they queue [`BindingCommand`]s, which the host applies once the current
//! script entry returns, and they receive [`BindingEvent`]s, answering each
//! with a [`BindingOutcome`]. All three travel as JSON.

use crate::core::error::ScriptError;
use crate::dispatch::CallContext;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

/// Commands sent from scripts to the bus.
///
/// Ids (`id`, `call`, `proxy`, `context`) are allocated by the script side,
/// except `proxy`, which the host hands out in [`BindingEvent::Found`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "camelCase")]
pub enum BindingCommand {
    // Timers
    SetTimer {
        id: u32,
        ms: u64,
        repeat: bool,
    },
    ResetTimer {
        id: u32,
        #[serde(default)]
        ms: Option<u64>,
    },
    ClearTimer {
        id: u32,
    },

    // Discovery
    FindService {
        id: u32,
        iface: String,
    },
    FindServiceByName {
        id: u32,
        name: String,
        #[serde(default)]
        interfaces: Vec<String>,
        path: String,
        port: u16,
    },
    AdvertiseName {
        name: String,
    },
    ReleaseProxy {
        proxy: u32,
    },

    // Outbound requests
    Call {
        proxy: u32,
        call: u32,
        member: String,
        #[serde(default)]
        args: Vec<Json>,
        #[serde(default)]
        timeout: Option<u64>,
    },
    GetProp {
        proxy: u32,
        call: u32,
        name: String,
    },
    SetProp {
        proxy: u32,
        call: u32,
        name: String,
        value: Json,
    },
    GetAllProps {
        proxy: u32,
        call: u32,
        iface: String,
    },

    // Signals
    Signal {
        path: String,
        iface: String,
        member: String,
        #[serde(default)]
        args: Vec<Json>,
        #[serde(default)]
        sessionless: bool,
        #[serde(default)]
        ttl: Option<u32>,
        /// Send within the session of this proxy instead of broadcasting.
        #[serde(default)]
        proxy: Option<u32>,
    },
    AddMatch {
        iface: String,
        member: String,
    },
    RemoveMatch {
        iface: String,
        member: String,
    },

    // Late answers to requests that returned without replying
    Reply {
        context: u32,
        #[serde(default)]
        args: Vec<Json>,
    },
    ErrorReply {
        context: u32,
        name: String,
        #[serde(default)]
        message: String,
    },

    // Services
    Notify {
        kind: u16,
        text: String,
        ttl: u32,
    },
    CancelNotification {
        kind: u16,
    },
    FactoryReset,
    ClearCredentials,
    Detach,
}

impl BindingCommand {
    pub fn from_json_str(text: &str) -> Result<Self, ScriptError> {
        serde_json::from_str(text).map_err(|e| ScriptError::Command(format!("{e}: {text}")))
    }
}

/// The request a handler event refers to, as seen by the script (`this`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallInfo {
    pub id: u32,
    pub member: String,
    pub iface: String,
    pub path: String,
    pub sender: String,
    pub from_self: bool,
    pub session_id: u32,
}

impl CallInfo {
    pub fn from_context(id: u32, ctx: &CallContext) -> Self {
        Self {
            id,
            member: ctx.member().to_string(),
            iface: ctx.iface().to_string(),
            path: ctx.path().to_string(),
            sender: ctx.sender().to_string(),
            from_self: ctx.from_self(),
            session_id: ctx.session_id(),
        }
    }
}

/// Events delivered from the bus to scripts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum BindingEvent {
    // Lifecycle
    Attach,
    Detach,
    PolicyChanged,
    #[serde(rename_all = "camelCase")]
    PeerConnected {
        peer: String,
        session_id: u32,
        port: u16,
        authenticated: bool,
    },
    PeerDisconnected {
        peer: String,
    },

    // Inbound requests
    MethodCall {
        context: CallInfo,
        args: Vec<Json>,
    },
    Signal {
        context: CallInfo,
        args: Vec<Json>,
    },
    PropGet {
        context: CallInfo,
        iface: String,
        prop: String,
    },
    PropSet {
        context: CallInfo,
        iface: String,
        prop: String,
        value: Json,
    },
    PropGetAll {
        context: CallInfo,
        iface: String,
    },

    // Callbacks
    Timer {
        id: u32,
    },
    /// The bus refused a timer the script already counted as set.
    TimerFailed {
        id: u32,
        message: String,
    },
    Found {
        id: u32,
        proxy: u32,
        peer: String,
        path: String,
        interfaces: Vec<String>,
    },
    Reply {
        call: u32,
        args: Vec<Json>,
    },
    CallError {
        call: u32,
        name: String,
        message: String,
    },
}

impl BindingEvent {
    /// Name used in logs.
    pub fn label(&self) -> &'static str {
        match self {
            BindingEvent::Attach => "attach",
            BindingEvent::Detach => "detach",
            BindingEvent::PolicyChanged => "policyChanged",
            BindingEvent::PeerConnected { .. } => "peerConnected",
            BindingEvent::PeerDisconnected { .. } => "peerDisconnected",
            BindingEvent::MethodCall { .. } => "methodCall",
            BindingEvent::Signal { .. } => "signal",
            BindingEvent::PropGet { .. } => "propGet",
            BindingEvent::PropSet { .. } => "propSet",
            BindingEvent::PropGetAll { .. } => "propGetAll",
            BindingEvent::Timer { .. } => "timer",
            BindingEvent::TimerFailed { .. } => "timerFailed",
            BindingEvent::Found { .. } => "found",
            BindingEvent::Reply { .. } => "reply",
            BindingEvent::CallError { .. } => "callError",
        }
    }
}

/// How a script answered an event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "camelCase")]
pub enum BindingOutcome {
    /// Returned without answering. A request is then deferred.
    Done,
    Replied {
        #[serde(default)]
        args: Vec<Json>,
    },
    Errored {
        name: String,
        #[serde(default)]
        message: String,
    },
    /// The handler threw.
    Thrown { message: String },
    /// Answer to `PeerConnected`.
    Accepted { accept: bool },
    /// The handler answered more than once, or answered and then threw.
    /// Answers are in call order; only the first can reach the caller.
    Answers { answers: Vec<BindingOutcome> },
}

impl BindingOutcome {
    pub fn from_json_str(text: &str) -> Result<Self, ScriptError> {
        serde_json::from_str(text).map_err(|e| ScriptError::Eval(format!("bad handler outcome: {e}")))
    }
}

/// Definitions a script declared at top level.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScriptDefinitions {
    #[serde(default)]
    pub interface_definition: Option<Json>,
    #[serde(default)]
    pub object_definition: Option<Json>,
    #[serde(default)]
    pub about_definition: Option<Json>,
    #[serde(default)]
    pub security_definition: Option<Json>,
    #[serde(default)]
    pub translations: Option<Json>,
}

/// Interface that every script engine adapter implements.
pub trait BindingAdapter {
    /// Evaluate a script at top level.
    fn eval(&mut self, name: &str, source: &str) -> Result<(), ScriptError>;

    /// Read the `AJ.*Definition` tables after evaluation.
    fn definitions(&mut self) -> Result<ScriptDefinitions, ScriptError>;

    /// Deliver an event and report how the script answered it.
    fn dispatch_event(&mut self, event: &BindingEvent) -> Result<BindingOutcome, ScriptError>;

    /// Drain commands queued since the last poll.
    fn poll_commands(&mut self) -> Vec<BindingCommand>;

    /// Timer slots the bus has free for the next script entry. Adapters
    /// that honour it refuse new timers synchronously once it runs out.
    fn set_timer_slots(&mut self, _slots: usize) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_command_wire_shape() {
        let cmd = BindingCommand::from_json_str(r#"{"cmd":"setTimer","id":3,"ms":250,"repeat":true}"#).unwrap();
        assert_eq!(cmd, BindingCommand::SetTimer { id: 3, ms: 250, repeat: true });

        let cmd = BindingCommand::from_json_str(r#"{"cmd":"call","proxy":1,"call":7,"member":"my_ping"}"#).unwrap();
        match cmd {
            BindingCommand::Call { args, timeout, .. } => {
                assert!(args.is_empty());
                assert_eq!(timeout, None);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(BindingCommand::from_json_str(r#"{"cmd":"launchRocket"}"#).is_err());
    }

    #[test]
    fn test_event_and_outcome_wire_shape() {
        let event = BindingEvent::PeerConnected {
            peer: ":1.4".into(),
            session_id: 9,
            port: 2,
            authenticated: false,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["event"], "peerConnected");
        assert_eq!(value["sessionId"], 9);

        let outcome = BindingOutcome::from_json_str(r#"{"outcome":"replied","args":["pong"]}"#).unwrap();
        assert_eq!(outcome, BindingOutcome::Replied { args: vec![json!("pong")] });

        let outcome = BindingOutcome::from_json_str(
            r#"{"outcome":"answers","answers":[{"outcome":"replied","args":["first"]},{"outcome":"thrown","message":"late"}]}"#,
        )
        .unwrap();
        assert_eq!(
            outcome,
            BindingOutcome::Answers {
                answers: vec![
                    BindingOutcome::Replied { args: vec![json!("first")] },
                    BindingOutcome::Thrown { message: "late".to_string() },
                ]
            }
        );
    }
}
