//! 单次连接期间的共享状态
//!
//! 每次 attach 创建一个新的 `BusLink`，由连接本身、它创建的代理以及延迟回复
//! 句柄共享。detach 关闭链路后，所有持有者的后续操作都会失败。

use super::message::BusMessage;
use crate::config::BusConfig;
use crate::core::error::TransportError;
use crate::proxy::ProxyInner;
use crate::registry::InterfaceDescriptor;
use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::rc::Weak;

/// 等待回复的出站调用
pub(crate) struct PendingEntry {
    pub proxy: Weak<ProxyInner>,
    pub peer: String,
    pub deadline: Option<u64>,
}

/// 已延迟回复的入站调用
pub(crate) struct DeferredEntry {
    pub member: String,
    pub deadline: Option<u64>,
}

pub(crate) struct BusLink {
    unique_name: String,
    open: Cell<bool>,
    now_ms: Cell<u64>,
    next_serial: Cell<u32>,
    outbox: RefCell<VecDeque<BusMessage>>,
    pending: RefCell<HashMap<u32, PendingEntry>>,
    deferred: RefCell<HashMap<(String, u32), DeferredEntry>>,
    sessions: RefCell<BTreeMap<String, u32>>,
    interfaces: BTreeMap<String, InterfaceDescriptor>,
    call_timeout_ms: u64,
    sessionless_ttl_s: u32,
}

impl BusLink {
    pub fn new(
        unique_name: &str,
        config: &BusConfig,
        interfaces: BTreeMap<String, InterfaceDescriptor>,
        now_ms: u64,
    ) -> Self {
        Self {
            unique_name: unique_name.to_string(),
            open: Cell::new(true),
            now_ms: Cell::new(now_ms),
            next_serial: Cell::new(0),
            outbox: RefCell::new(VecDeque::new()),
            pending: RefCell::new(HashMap::new()),
            deferred: RefCell::new(HashMap::new()),
            sessions: RefCell::new(BTreeMap::new()),
            interfaces,
            call_timeout_ms: config.call_timeout_ms,
            sessionless_ttl_s: config.sessionless_ttl_s,
        }
    }

    pub fn unique_name(&self) -> &str {
        &self.unique_name
    }

    pub fn is_open(&self) -> bool {
        self.open.get()
    }

    pub fn close(&self) {
        self.open.set(false);
        self.outbox.borrow_mut().clear();
        self.deferred.borrow_mut().clear();
        self.sessions.borrow_mut().clear();
    }

    pub fn now(&self) -> u64 {
        self.now_ms.get()
    }

    pub fn set_now(&self, now: u64) {
        self.now_ms.set(now);
    }

    pub fn sessionless_ttl_s(&self) -> u32 {
        self.sessionless_ttl_s
    }

    /// 序号从 1 开始，跳过 0
    pub fn next_serial(&self) -> u32 {
        let mut serial = self.next_serial.get().wrapping_add(1);
        if serial == 0 {
            serial = 1;
        }
        self.next_serial.set(serial);
        serial
    }

    pub fn interface(&self, name: &str) -> Option<&InterfaceDescriptor> {
        self.interfaces.get(name)
    }

    pub fn interfaces(&self) -> impl Iterator<Item = &InterfaceDescriptor> {
        self.interfaces.values()
    }

    pub fn push(&self, msg: BusMessage) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::Detached);
        }
        self.outbox.borrow_mut().push_back(msg);
        Ok(())
    }

    pub fn drain_outbox(&self) -> Vec<BusMessage> {
        self.outbox.borrow_mut().drain(..).collect()
    }

    pub fn call_deadline(&self) -> Option<u64> {
        (self.call_timeout_ms > 0).then(|| self.now().saturating_add(self.call_timeout_ms))
    }

    pub fn track_pending(&self, serial: u32, entry: PendingEntry) {
        self.pending.borrow_mut().insert(serial, entry);
    }

    pub fn take_pending(&self, serial: u32) -> Option<PendingEntry> {
        self.pending.borrow_mut().remove(&serial)
    }

    pub fn pending_len(&self) -> usize {
        self.pending.borrow().len()
    }

    /// 取出所有已超时的出站调用
    pub fn take_expired_pending(&self, now: u64) -> Vec<(u32, PendingEntry)> {
        let mut pending = self.pending.borrow_mut();
        let expired: Vec<u32> = pending
            .iter()
            .filter(|(_, e)| e.deadline.is_some_and(|d| d <= now))
            .map(|(serial, _)| *serial)
            .collect();
        let mut out: Vec<(u32, PendingEntry)> = expired
            .into_iter()
            .filter_map(|serial| pending.remove(&serial).map(|e| (serial, e)))
            .collect();
        out.sort_by_key(|(serial, _)| *serial);
        out
    }

    /// 取出发往某个对端的所有出站调用
    pub fn take_pending_for_peer(&self, peer: &str) -> Vec<(u32, PendingEntry)> {
        let mut pending = self.pending.borrow_mut();
        let serials: Vec<u32> = pending
            .iter()
            .filter(|(_, e)| e.peer == peer)
            .map(|(serial, _)| *serial)
            .collect();
        let mut out: Vec<(u32, PendingEntry)> = serials
            .into_iter()
            .filter_map(|serial| pending.remove(&serial).map(|e| (serial, e)))
            .collect();
        out.sort_by_key(|(serial, _)| *serial);
        out
    }

    pub fn take_all_pending(&self) -> Vec<(u32, PendingEntry)> {
        let mut out: Vec<(u32, PendingEntry)> = self.pending.borrow_mut().drain().collect();
        out.sort_by_key(|(serial, _)| *serial);
        out
    }

    pub fn track_deferred(&self, sender: &str, serial: u32, entry: DeferredEntry) {
        self.deferred
            .borrow_mut()
            .insert((sender.to_string(), serial), entry);
    }

    pub fn finish_deferred(&self, sender: &str, serial: u32) -> Option<DeferredEntry> {
        self.deferred
            .borrow_mut()
            .remove(&(sender.to_string(), serial))
    }

    pub fn has_deferred(&self, sender: &str, serial: u32) -> bool {
        self.deferred
            .borrow()
            .contains_key(&(sender.to_string(), serial))
    }

    pub fn take_expired_deferred(&self, now: u64) -> Vec<DeferredEntry> {
        let mut deferred = self.deferred.borrow_mut();
        let keys: Vec<(String, u32)> = deferred
            .iter()
            .filter(|(_, e)| e.deadline.is_some_and(|d| d <= now))
            .map(|(k, _)| k.clone())
            .collect();
        keys.into_iter()
            .filter_map(|k| deferred.remove(&k))
            .collect()
    }

    pub fn session_with(&self, peer: &str) -> Option<u32> {
        self.sessions.borrow().get(peer).copied()
    }

    pub fn session_peers(&self) -> Vec<(String, u32)> {
        self.sessions
            .borrow()
            .iter()
            .map(|(p, id)| (p.clone(), *id))
            .collect()
    }

    pub fn add_session(&self, peer: &str, id: u32) {
        self.sessions.borrow_mut().insert(peer.to_string(), id);
    }

    pub fn remove_session(&self, peer: &str) -> Option<u32> {
        self.sessions.borrow_mut().remove(peer)
    }
}
