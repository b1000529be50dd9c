//! 外设板
//!
//! `IoBoard` 在 `PinBackend` 之上分配引脚句柄。每个引脚同一时刻只能被一个句柄
//! 占用，句柄释放（Drop）时归还引脚。默认后端 `SimulatedPins` 在内存中模拟电平、
//! PWM、模拟量以及串行总线收发，供测试和脚本宿主使用。

use crate::core::error::ResourceError;
use serde::Deserialize;
use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::rc::Rc;

pub type IoResult<T> = Result<T, ResourceError>;

/// 上下拉配置
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Pull {
    #[default]
    None,
    Up,
    Down,
}

/// 数字输入触发方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trigger {
    #[default]
    Disabled,
    Rising,
    Falling,
    Both,
}

/// 引脚后端
pub trait PinBackend {
    fn pin_count(&self) -> u16;
    fn set_level(&mut self, pin: u16, high: bool);
    fn level(&self, pin: u16) -> bool;
    fn set_pull(&mut self, pin: u16, pull: Pull);
    fn set_pwm(&mut self, pin: u16, duty: f64, freq_hz: u32);
    fn analog_read(&self, pin: u16) -> u16;
    fn analog_write(&mut self, pin: u16, value: u16);
    /// 串行总线写（以首个引脚标识总线）
    fn bus_write(&mut self, bus_pin: u16, data: &[u8]);
    /// 串行总线读，最多 `max` 字节
    fn bus_read(&mut self, bus_pin: u16, max: usize) -> Vec<u8>;
}

#[derive(Debug, Default)]
struct SimState {
    levels: BTreeMap<u16, bool>,
    pulls: BTreeMap<u16, Pull>,
    pwm: BTreeMap<u16, (f64, u32)>,
    analog: BTreeMap<u16, u16>,
    rx: BTreeMap<u16, VecDeque<u8>>,
    tx: BTreeMap<u16, Vec<u8>>,
}

/// 内存模拟后端，克隆后共享状态，便于测试从外部驱动输入
#[derive(Debug, Clone)]
pub struct SimulatedPins {
    count: u16,
    state: Rc<RefCell<SimState>>,
}

impl SimulatedPins {
    pub fn new(count: u16) -> Self {
        Self {
            count,
            state: Rc::default(),
        }
    }

    /// 外部驱动引脚电平
    pub fn drive(&self, pin: u16, high: bool) {
        self.state.borrow_mut().levels.insert(pin, high);
    }

    pub fn set_analog(&self, pin: u16, value: u16) {
        self.state.borrow_mut().analog.insert(pin, value);
    }

    pub fn pwm(&self, pin: u16) -> Option<(f64, u32)> {
        self.state.borrow().pwm.get(&pin).copied()
    }

    pub fn pull(&self, pin: u16) -> Pull {
        self.state.borrow().pulls.get(&pin).copied().unwrap_or_default()
    }

    /// 向总线接收缓冲注入数据
    pub fn inject_rx(&self, bus_pin: u16, data: &[u8]) {
        self.state.borrow_mut().rx.entry(bus_pin).or_default().extend(data);
    }

    /// 总线上已写出的全部数据
    pub fn written(&self, bus_pin: u16) -> Vec<u8> {
        self.state.borrow().tx.get(&bus_pin).cloned().unwrap_or_default()
    }
}

impl Default for SimulatedPins {
    fn default() -> Self {
        Self::new(32)
    }
}

impl PinBackend for SimulatedPins {
    fn pin_count(&self) -> u16 {
        self.count
    }

    fn set_level(&mut self, pin: u16, high: bool) {
        let mut state = self.state.borrow_mut();
        state.pwm.remove(&pin);
        state.levels.insert(pin, high);
    }

    fn level(&self, pin: u16) -> bool {
        let state = self.state.borrow();
        match state.levels.get(&pin) {
            Some(level) => *level,
            None => state.pulls.get(&pin) == Some(&Pull::Up),
        }
    }

    fn set_pull(&mut self, pin: u16, pull: Pull) {
        self.state.borrow_mut().pulls.insert(pin, pull);
    }

    fn set_pwm(&mut self, pin: u16, duty: f64, freq_hz: u32) {
        self.state.borrow_mut().pwm.insert(pin, (duty, freq_hz));
    }

    fn analog_read(&self, pin: u16) -> u16 {
        self.state.borrow().analog.get(&pin).copied().unwrap_or(0)
    }

    fn analog_write(&mut self, pin: u16, value: u16) {
        self.state.borrow_mut().analog.insert(pin, value);
    }

    fn bus_write(&mut self, bus_pin: u16, data: &[u8]) {
        self.state.borrow_mut().tx.entry(bus_pin).or_default().extend_from_slice(data);
    }

    fn bus_read(&mut self, bus_pin: u16, max: usize) -> Vec<u8> {
        let mut state = self.state.borrow_mut();
        match state.rx.get_mut(&bus_pin) {
            Some(queue) => {
                let n = max.min(queue.len());
                queue.drain(..n).collect()
            }
            None => Vec::new(),
        }
    }
}

struct BoardState {
    backend: Box<dyn PinBackend>,
    bound: BTreeSet<u16>,
}

/// 外设板，克隆后共享同一组引脚
#[derive(Clone)]
pub struct IoBoard {
    state: Rc<RefCell<BoardState>>,
}

impl Default for IoBoard {
    fn default() -> Self {
        Self::new(SimulatedPins::default())
    }
}

impl std::fmt::Debug for IoBoard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.borrow();
        f.debug_struct("IoBoard")
            .field("pins", &state.backend.pin_count())
            .field("bound", &state.bound)
            .finish()
    }
}

impl IoBoard {
    pub fn new(backend: impl PinBackend + 'static) -> Self {
        Self {
            state: Rc::new(RefCell::new(BoardState {
                backend: Box::new(backend),
                bound: BTreeSet::new(),
            })),
        }
    }

    pub fn pin_count(&self) -> u16 {
        self.state.borrow().backend.pin_count()
    }

    pub fn is_bound(&self, pin: u16) -> bool {
        self.state.borrow().bound.contains(&pin)
    }

    /// 一次性占用一组引脚；任何一个失败则全部不占用
    fn claim(&self, pins: &[u16]) -> IoResult<PinClaim> {
        let mut state = self.state.borrow_mut();
        let count = state.backend.pin_count();
        let mut seen = BTreeSet::new();
        for &pin in pins {
            if pin >= count {
                return Err(ResourceError::NoSuchPin(pin));
            }
            if state.bound.contains(&pin) || !seen.insert(pin) {
                return Err(ResourceError::ResourceAlreadyBound(pin));
            }
        }
        state.bound.extend(pins.iter().copied());
        tracing::debug!(target: "ajs.io", ?pins, "pins claimed");
        Ok(PinClaim {
            board: self.clone(),
            pins: pins.to_vec(),
        })
    }

    fn with<R>(&self, f: impl FnOnce(&mut dyn PinBackend) -> R) -> R {
        let mut state = self.state.borrow_mut();
        f(&mut *state.backend)
    }

    pub fn digital_out(&self, pin: u16, initial: bool) -> IoResult<DigitalOut> {
        let claim = self.claim(&[pin])?;
        self.with(|b| b.set_level(pin, initial));
        Ok(DigitalOut { claim, pin })
    }

    pub fn digital_in(&self, pin: u16, pull: Pull) -> IoResult<DigitalIn> {
        let claim = self.claim(&[pin])?;
        let last = self.with(|b| {
            b.set_pull(pin, pull);
            b.level(pin)
        });
        Ok(DigitalIn {
            claim,
            pin,
            trigger: Trigger::Disabled,
            last,
        })
    }

    pub fn analog_in(&self, pin: u16) -> IoResult<AnalogIn> {
        Ok(AnalogIn {
            claim: self.claim(&[pin])?,
            pin,
        })
    }

    pub fn analog_out(&self, pin: u16) -> IoResult<AnalogOut> {
        Ok(AnalogOut {
            claim: self.claim(&[pin])?,
            pin,
        })
    }

    pub fn uart(&self, tx: u16, rx: u16, baud: u32) -> IoResult<SerialPort> {
        if baud == 0 {
            return Err(ResourceError::OutOfRange("baud rate must be > 0".into()));
        }
        Ok(SerialPort {
            claim: self.claim(&[tx, rx])?,
            rate: baud,
        })
    }

    pub fn spi(&self, mosi: u16, miso: u16, clk: u16, ss: u16, bitrate: u32) -> IoResult<SerialPort> {
        if bitrate == 0 {
            return Err(ResourceError::OutOfRange("bit rate must be > 0".into()));
        }
        Ok(SerialPort {
            claim: self.claim(&[mosi, miso, clk, ss])?,
            rate: bitrate,
        })
    }

    pub fn i2c_master(&self, sda: u16, scl: u16, clock: u32) -> IoResult<SerialPort> {
        if clock == 0 {
            return Err(ResourceError::OutOfRange("clock must be > 0".into()));
        }
        Ok(SerialPort {
            claim: self.claim(&[sda, scl])?,
            rate: clock,
        })
    }
}

/// 引脚占用凭证，Drop 时释放
pub struct PinClaim {
    board: IoBoard,
    pins: Vec<u16>,
}

impl Drop for PinClaim {
    fn drop(&mut self) {
        if let Ok(mut state) = self.board.state.try_borrow_mut() {
            for pin in &self.pins {
                state.bound.remove(pin);
            }
        }
        tracing::debug!(target: "ajs.io", pins = ?self.pins, "pins released");
    }
}

impl std::fmt::Debug for PinClaim {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("PinClaim").field(&self.pins).finish()
    }
}

/// 数字输出
#[derive(Debug)]
pub struct DigitalOut {
    claim: PinClaim,
    pin: u16,
}

impl DigitalOut {
    pub fn pin(&self) -> u16 {
        self.pin
    }

    pub fn level(&self) -> bool {
        self.claim.board.with(|b| b.level(self.pin))
    }

    pub fn set_level(&self, high: bool) {
        self.claim.board.with(|b| b.set_level(self.pin, high));
    }

    pub fn toggle(&self) -> bool {
        let next = !self.level();
        self.set_level(next);
        next
    }

    /// 占空比 `duty` 取值 `[0, 1]`，`freq_hz` 必须大于 0
    pub fn pwm(&self, duty: f64, freq_hz: u32) -> IoResult<()> {
        if !(0.0..=1.0).contains(&duty) {
            return Err(ResourceError::OutOfRange(format!("duty cycle {duty}")));
        }
        if freq_hz == 0 {
            return Err(ResourceError::OutOfRange("pwm frequency must be > 0".into()));
        }
        self.claim.board.with(|b| b.set_pwm(self.pin, duty, freq_hz));
        Ok(())
    }
}

/// 数字输入
#[derive(Debug)]
pub struct DigitalIn {
    claim: PinClaim,
    pin: u16,
    trigger: Trigger,
    last: bool,
}

impl DigitalIn {
    pub fn pin(&self) -> u16 {
        self.pin
    }

    pub fn level(&self) -> bool {
        self.claim.board.with(|b| b.level(self.pin))
    }

    pub fn set_trigger(&mut self, trigger: Trigger) {
        self.trigger = trigger;
        self.last = self.level();
    }

    pub fn trigger(&self) -> Trigger {
        self.trigger
    }

    /// 采样一次；按触发方式检测到边沿时返回新电平
    pub fn poll_edge(&mut self) -> Option<bool> {
        let now = self.level();
        let prev = std::mem::replace(&mut self.last, now);
        let fired = match self.trigger {
            Trigger::Disabled => false,
            Trigger::Rising => !prev && now,
            Trigger::Falling => prev && !now,
            Trigger::Both => prev != now,
        };
        fired.then_some(now)
    }
}

#[derive(Debug)]
pub struct AnalogIn {
    claim: PinClaim,
    pin: u16,
}

impl AnalogIn {
    pub fn value(&self) -> u16 {
        self.claim.board.with(|b| b.analog_read(self.pin))
    }
}

#[derive(Debug)]
pub struct AnalogOut {
    claim: PinClaim,
    pin: u16,
}

impl AnalogOut {
    pub fn set_value(&self, value: u16) {
        self.claim.board.with(|b| b.analog_write(self.pin, value));
    }

    pub fn value(&self) -> u16 {
        self.claim.board.with(|b| b.analog_read(self.pin))
    }
}

/// UART / SPI / I2C 共用的串行端口
#[derive(Debug)]
pub struct SerialPort {
    claim: PinClaim,
    rate: u32,
}

impl SerialPort {
    fn bus_pin(&self) -> u16 {
        self.claim.pins[0]
    }

    pub fn rate(&self) -> u32 {
        self.rate
    }

    pub fn write(&self, data: &[u8]) -> usize {
        let pin = self.bus_pin();
        self.claim.board.with(|b| b.bus_write(pin, data));
        data.len()
    }

    pub fn read(&self, max: usize) -> Vec<u8> {
        let pin = self.bus_pin();
        self.claim.board.with(|b| b.bus_read(pin, max))
    }

    /// 先写后读，I2C/SPI 的常见事务
    pub fn transfer(&self, data: &[u8], read_len: usize) -> Vec<u8> {
        self.write(data);
        self.read(read_len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pin_exclusive_until_dropped() {
        let board = IoBoard::default();
        let led = board.digital_out(3, false).unwrap();
        assert_eq!(
            board.digital_in(3, Pull::None).unwrap_err(),
            ResourceError::ResourceAlreadyBound(3)
        );
        drop(led);
        assert!(board.digital_in(3, Pull::None).is_ok());
    }

    #[test]
    fn test_multi_pin_claim_is_atomic() {
        let board = IoBoard::default();
        let _held = board.digital_out(7, false).unwrap();
        assert_eq!(
            board.spi(4, 5, 6, 7, 1_000_000).unwrap_err(),
            ResourceError::ResourceAlreadyBound(7)
        );
        assert!(!board.is_bound(4));
        assert_eq!(board.uart(1, 1, 9600).unwrap_err(), ResourceError::ResourceAlreadyBound(1));
        assert_eq!(board.analog_in(99).unwrap_err(), ResourceError::NoSuchPin(99));
    }

    #[test]
    fn test_toggle_and_pwm() {
        let pins = SimulatedPins::default();
        let board = IoBoard::new(pins.clone());
        let led = board.digital_out(2, false).unwrap();
        assert!(led.toggle());
        assert!(led.level());
        led.pwm(0.25, 1000).unwrap();
        assert_eq!(pins.pwm(2), Some((0.25, 1000)));
        assert!(led.pwm(1.5, 1000).is_err());
        assert!(led.pwm(0.5, 0).is_err());
    }

    #[test]
    fn test_edge_detection() {
        let pins = SimulatedPins::default();
        let board = IoBoard::new(pins.clone());
        let mut button = board.digital_in(0, Pull::Up).unwrap();
        assert!(button.level());
        button.set_trigger(Trigger::Falling);
        assert_eq!(button.poll_edge(), None);
        pins.drive(0, false);
        assert_eq!(button.poll_edge(), Some(false));
        pins.drive(0, true);
        assert_eq!(button.poll_edge(), None);
    }

    #[test]
    fn test_serial_loop() {
        let pins = SimulatedPins::default();
        let board = IoBoard::new(pins.clone());
        let i2c = board.i2c_master(10, 11, 100_000).unwrap();
        pins.inject_rx(10, &[0x12, 0x34, 0x56]);
        assert_eq!(i2c.transfer(&[0x40], 2), vec![0x12, 0x34]);
        assert_eq!(pins.written(10), vec![0x40]);
        assert_eq!(i2c.read(8), vec![0x56]);
    }
}
