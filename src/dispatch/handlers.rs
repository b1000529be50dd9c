use super::context::{CallContext, HandlerResult};
use crate::bus::{BusAttachment, PeerInfo};
use crate::value::MsgValue;

/// `onMethodCall` / `onSignal`: receives the call context and arguments.
pub type CallHandler = Box<dyn FnMut(&mut BusAttachment, &mut CallContext, Vec<MsgValue>) -> HandlerResult>;
/// `onPropGet(iface, prop)`
pub type PropGetHandler = Box<dyn FnMut(&mut BusAttachment, &mut CallContext, &str, &str) -> HandlerResult>;
/// `onPropSet(iface, prop, value)`
pub type PropSetHandler =
    Box<dyn FnMut(&mut BusAttachment, &mut CallContext, &str, &str, MsgValue) -> HandlerResult>;
/// `onPropGetAll(iface)`
pub type PropGetAllHandler = Box<dyn FnMut(&mut BusAttachment, &mut CallContext, &str) -> HandlerResult>;
/// `onAttach`, `onDetach`, `onPolicyChanged`
pub type LifecycleHandler = Box<dyn FnMut(&mut BusAttachment)>;
/// `onPeerConnected`: returning `false` refuses the session.
pub type PeerConnectedHandler = Box<dyn FnMut(&mut BusAttachment, &PeerInfo) -> bool>;
/// `onPeerDisconnected(peer)`
pub type PeerDisconnectedHandler = Box<dyn FnMut(&mut BusAttachment, &str)>;

/// Per-connection callback slots. Each slot holds at most one handler;
/// setting a slot replaces the previous handler.
#[derive(Default)]
pub struct HandlerTable {
    pub(crate) on_attach: Option<LifecycleHandler>,
    pub(crate) on_detach: Option<LifecycleHandler>,
    pub(crate) on_method_call: Option<CallHandler>,
    pub(crate) on_signal: Option<CallHandler>,
    pub(crate) on_prop_get: Option<PropGetHandler>,
    pub(crate) on_prop_set: Option<PropSetHandler>,
    pub(crate) on_prop_get_all: Option<PropGetAllHandler>,
    pub(crate) on_peer_connected: Option<PeerConnectedHandler>,
    pub(crate) on_peer_disconnected: Option<PeerDisconnectedHandler>,
    pub(crate) on_policy_changed: Option<LifecycleHandler>,
}

impl HandlerTable {
    /// Names of the populated slots, for diagnostics.
    pub fn installed(&self) -> Vec<&'static str> {
        let slots = [
            ("onAttach", self.on_attach.is_some()),
            ("onDetach", self.on_detach.is_some()),
            ("onMethodCall", self.on_method_call.is_some()),
            ("onSignal", self.on_signal.is_some()),
            ("onPropGet", self.on_prop_get.is_some()),
            ("onPropSet", self.on_prop_set.is_some()),
            ("onPropGetAll", self.on_prop_get_all.is_some()),
            ("onPeerConnected", self.on_peer_connected.is_some()),
            ("onPeerDisconnected", self.on_peer_disconnected.is_some()),
            ("onPolicyChanged", self.on_policy_changed.is_some()),
        ];
        slots
            .into_iter()
            .filter(|(_, set)| *set)
            .map(|(name, _)| name)
            .collect()
    }
}

impl std::fmt::Debug for HandlerTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.installed()).finish()
    }
}
