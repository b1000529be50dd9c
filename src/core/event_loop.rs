//! 协作式事件循环
//!
//! 单线程的定时器表加就绪队列。所有回调都在同一逻辑线程上运行至完成，
//! 循环本身不持有时钟：调用者通过 `advance_to` 推进时间（二进制程序使用
//! 单调时钟，测试手动推进）。
//!
//! 定时器 ID 的格式为 `(slot << 24) | salt`，其中 salt 为每次注册递增的
//! 24 位序号，因此过期的 ID 不会误伤复用同一槽位的新定时器。

use crate::core::error::{TimerError, TimerResult};
use std::collections::VecDeque;

/// 定时器句柄
pub type TimerId = u32;

/// 定时器回调
pub type TimerCallback<C> = Box<dyn FnMut(&mut C)>;

/// 就绪队列任务
pub type Task<C> = Box<dyn FnOnce(&mut C)>;

const SALT_BITS: u32 = 24;
const SALT_MASK: u32 = (1 << SALT_BITS) - 1;

/// 定时器表容量上限（槽位编号占 8 位）
pub const MAX_TIMER_SLOTS: usize = 256;

/// 定时器类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    /// 周期触发
    Interval,
    /// 单次触发
    Timeout,
}

impl TimerKind {
    fn label(self) -> &'static str {
        match self {
            TimerKind::Interval => "interval",
            TimerKind::Timeout => "timeout",
        }
    }
}

struct TimerSlot<C> {
    id: TimerId,
    kind: TimerKind,
    period_ms: u64,
    deadline: u64,
    seq: u64,
    /// 回调运行期间为 None
    callback: Option<TimerCallback<C>>,
}

/// 定时器表
pub struct TimerTable<C> {
    slots: Vec<Option<TimerSlot<C>>>,
    capacity: usize,
    salt: u32,
    seq: u64,
}

impl<C> TimerTable<C> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.clamp(1, MAX_TIMER_SLOTS);
        Self {
            slots: Vec::new(),
            capacity,
            salt: 0,
            seq: 0,
        }
    }

    fn next_salt(&mut self) -> u32 {
        self.salt = (self.salt + 1) & SALT_MASK;
        if self.salt == 0 {
            self.salt = 1;
        }
        self.salt
    }

    fn slot_index(id: TimerId) -> usize {
        (id >> SALT_BITS) as usize
    }

    fn lookup(&mut self, id: TimerId, kind: TimerKind) -> TimerResult<&mut TimerSlot<C>> {
        let slot = self
            .slots
            .get_mut(Self::slot_index(id))
            .and_then(Option::as_mut)
            .filter(|s| s.id == id)
            .ok_or(TimerError::NoSuchTimer(id))?;
        if slot.kind != kind {
            return Err(TimerError::WrongKind(id));
        }
        Ok(slot)
    }

    /// 注册定时器，`ms` 必须大于 0
    pub fn add(
        &mut self,
        kind: TimerKind,
        ms: u64,
        now: u64,
        callback: TimerCallback<C>,
    ) -> TimerResult<TimerId> {
        if ms == 0 {
            return Err(TimerError::InvalidPeriod(kind.label()));
        }
        let index = match self.slots.iter().position(Option::is_none) {
            Some(free) => free,
            None if self.slots.len() < self.capacity => {
                self.slots.push(None);
                self.slots.len() - 1
            }
            None => return Err(TimerError::TooManyTimers(self.capacity)),
        };
        let id = ((index as u32) << SALT_BITS) | self.next_salt();
        self.seq += 1;
        self.slots[index] = Some(TimerSlot {
            id,
            kind,
            period_ms: ms,
            deadline: now.saturating_add(ms),
            seq: self.seq,
            callback: Some(callback),
        });
        tracing::trace!(target: "ajs.timer", id, kind = kind.label(), ms, "timer added");
        Ok(id)
    }

    /// 重新开始倒计时，`ms` 为 None 时沿用原周期
    pub fn reset(&mut self, id: TimerId, kind: TimerKind, ms: Option<u64>, now: u64) -> TimerResult<()> {
        if ms == Some(0) {
            return Err(TimerError::InvalidPeriod(kind.label()));
        }
        let slot = self.lookup(id, kind)?;
        if let Some(ms) = ms {
            slot.period_ms = ms;
        }
        slot.deadline = now.saturating_add(slot.period_ms);
        Ok(())
    }

    /// 取消定时器；返回后该回调保证不会再被调用
    pub fn clear(&mut self, id: TimerId, kind: TimerKind) -> TimerResult<()> {
        self.lookup(id, kind)?;
        self.slots[Self::slot_index(id)] = None;
        tracing::trace!(target: "ajs.timer", id, "timer cleared");
        Ok(())
    }

    /// 最早的截止时间
    pub fn next_deadline(&self) -> Option<u64> {
        self.slots
            .iter()
            .flatten()
            .filter(|s| s.callback.is_some())
            .map(|s| s.deadline)
            .min()
    }

    /// 取出一个已到期的定时器回调（按截止时间和注册顺序）
    ///
    /// 单次定时器在此处释放槽位；周期定时器推进到下一个截止时间，回调需通过
    /// [`TimerTable::restore`] 放回。
    pub fn take_due(&mut self, now: u64) -> Option<(TimerId, TimerCallback<C>)> {
        let index = self
            .slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|s| (i, s)))
            .filter(|(_, s)| s.callback.is_some() && s.deadline <= now)
            .min_by_key(|(_, s)| (s.deadline, s.seq))
            .map(|(i, _)| i)?;

        let slot = self.slots[index].as_mut()?;
        let id = slot.id;
        let callback = slot.callback.take()?;
        if slot.kind == TimerKind::Interval {
            slot.deadline = slot.deadline.saturating_add(slot.period_ms);
        } else {
            self.slots[index] = None;
        }
        Some((id, callback))
    }

    /// 放回周期定时器的回调；若回调运行期间定时器已被清除则丢弃
    pub fn restore(&mut self, id: TimerId, callback: TimerCallback<C>) {
        if let Some(slot) = self
            .slots
            .get_mut(Self::slot_index(id))
            .and_then(Option::as_mut)
            .filter(|s| s.id == id && s.callback.is_none())
        {
            slot.callback = Some(callback);
        }
    }

    pub fn len(&self) -> usize {
        self.slots.iter().flatten().count()
    }

    /// 定时器数量上限
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 清空所有定时器
    pub fn clear_all(&mut self) {
        self.slots.clear();
    }
}

/// 事件循环：定时器表加就绪队列
pub struct EventLoop<C> {
    timers: TimerTable<C>,
    ready: VecDeque<Task<C>>,
    now_ms: u64,
}

impl<C> EventLoop<C> {
    pub fn new(max_timers: usize) -> Self {
        Self {
            timers: TimerTable::new(max_timers),
            ready: VecDeque::new(),
            now_ms: 0,
        }
    }

    /// 循环的当前时间（毫秒）
    pub fn now(&self) -> u64 {
        self.now_ms
    }

    /// 推进时钟到 `now`，时间不会倒退
    pub fn advance_to(&mut self, now: u64) {
        self.now_ms = self.now_ms.max(now);
    }

    pub fn timers(&self) -> &TimerTable<C> {
        &self.timers
    }

    pub fn timers_mut(&mut self) -> &mut TimerTable<C> {
        &mut self.timers
    }

    /// 投递任务，下一轮循环执行
    pub fn post(&mut self, task: Task<C>) {
        self.ready.push_back(task);
    }

    pub fn pop_ready(&mut self) -> Option<Task<C>> {
        self.ready.pop_front()
    }

    pub fn has_ready(&self) -> bool {
        !self.ready.is_empty()
    }

    /// 丢弃就绪任务，保留定时器
    pub fn discard_ready(&mut self) -> usize {
        let dropped = self.ready.len();
        self.ready.clear();
        dropped
    }

    /// 丢弃所有定时器与就绪任务
    pub fn reset(&mut self) {
        self.timers.clear_all();
        self.ready.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Counter {
        hits: Vec<&'static str>,
    }

    fn noop() -> TimerCallback<Counter> {
        Box::new(|_| {})
    }

    fn run_due(table: &mut TimerTable<Counter>, ctx: &mut Counter, now: u64) {
        while let Some((id, mut cb)) = table.take_due(now) {
            cb(ctx);
            table.restore(id, cb);
        }
    }

    #[test]
    fn test_zero_period_is_rejected() {
        let mut table = TimerTable::<Counter>::new(4);
        assert_eq!(
            table.add(TimerKind::Timeout, 0, 0, noop()),
            Err(TimerError::InvalidPeriod("timeout"))
        );
    }

    #[test]
    fn test_id_layout_and_stale_ids() {
        let mut table = TimerTable::<Counter>::new(4);
        let first = table.add(TimerKind::Interval, 10, 0, noop()).unwrap();
        assert_eq!(first >> 24, 0);
        table.clear(first, TimerKind::Interval).unwrap();

        let second = table.add(TimerKind::Interval, 10, 0, noop()).unwrap();
        assert_eq!(second >> 24, 0);
        assert_ne!(first, second);
        assert_eq!(
            table.clear(first, TimerKind::Interval),
            Err(TimerError::NoSuchTimer(first))
        );
    }

    #[test]
    fn test_wrong_kind() {
        let mut table = TimerTable::<Counter>::new(4);
        let id = table.add(TimerKind::Timeout, 10, 0, noop()).unwrap();
        assert_eq!(
            table.clear(id, TimerKind::Interval),
            Err(TimerError::WrongKind(id))
        );
        assert_eq!(
            table.reset(id, TimerKind::Interval, None, 0),
            Err(TimerError::WrongKind(id))
        );
    }

    #[test]
    fn test_capacity() {
        let mut table = TimerTable::<Counter>::new(2);
        table.add(TimerKind::Timeout, 1, 0, noop()).unwrap();
        table.add(TimerKind::Timeout, 1, 0, noop()).unwrap();
        assert_eq!(table.capacity(), 2);
        assert_eq!(
            table.add(TimerKind::Timeout, 1, 0, noop()),
            Err(TimerError::TooManyTimers(2))
        );
    }

    #[test]
    fn test_deadline_order_and_interval_catch_up() {
        let mut table = TimerTable::<Counter>::new(8);
        table
            .add(TimerKind::Interval, 100, 0, Box::new(|c: &mut Counter| c.hits.push("tick")))
            .unwrap();
        table
            .add(TimerKind::Timeout, 150, 0, Box::new(|c: &mut Counter| c.hits.push("once")))
            .unwrap();
        let mut ctx = Counter::default();
        run_due(&mut table, &mut ctx, 300);
        assert_eq!(ctx.hits, vec!["tick", "once", "tick", "tick"]);
        assert_eq!(table.len(), 1);
        assert_eq!(table.next_deadline(), Some(400));
    }

    #[test]
    fn test_reset_restarts_countdown() {
        let mut table = TimerTable::<Counter>::new(8);
        let id = table
            .add(TimerKind::Timeout, 100, 0, Box::new(|c: &mut Counter| c.hits.push("fired")))
            .unwrap();
        table.reset(id, TimerKind::Timeout, None, 90).unwrap();
        let mut ctx = Counter::default();
        run_due(&mut table, &mut ctx, 150);
        assert!(ctx.hits.is_empty());
        run_due(&mut table, &mut ctx, 190);
        assert_eq!(ctx.hits, vec!["fired"]);
    }

    #[test]
    fn test_clear_while_running_drops_callback() {
        let mut table = TimerTable::<Counter>::new(8);
        let id = table.add(TimerKind::Interval, 10, 0, noop()).unwrap();
        let (due, cb) = table.take_due(10).unwrap();
        assert_eq!(due, id);
        table.clear(id, TimerKind::Interval).unwrap();
        table.restore(id, cb);
        assert!(table.is_empty());
        assert!(table.take_due(1000).is_none());
    }

    #[test]
    fn test_ready_queue_is_fifo() {
        let mut event_loop = EventLoop::<Counter>::new(4);
        event_loop.post(Box::new(|c| c.hits.push("a")));
        event_loop.post(Box::new(|c| c.hits.push("b")));
        let mut ctx = Counter::default();
        while let Some(task) = event_loop.pop_ready() {
            task(&mut ctx);
        }
        assert_eq!(ctx.hits, vec!["a", "b"]);
        event_loop.advance_to(50);
        event_loop.advance_to(20);
        assert_eq!(event_loop.now(), 50);
    }
}
