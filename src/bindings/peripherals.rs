//! Peripheral requests from scripts
//!
//! The `IO` object in the prelude turns every pin operation into a JSON
//! request. [`IoBridge`] owns the handles those requests create, so a pin
//! stays bound until the script releases it or the bridge is dropped.

use crate::core::error::ResourceError;
use crate::io::{AnalogIn, AnalogOut, DigitalIn, DigitalOut, IoBoard, IoResult, Pull, SerialPort, Trigger};
use serde::Deserialize;
use serde_json::{json, Value as Json};
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum IoRequest {
    Pins,
    DigitalOut {
        pin: u16,
        #[serde(default)]
        initial: bool,
    },
    DigitalIn {
        pin: u16,
        #[serde(default)]
        pull: Pull,
    },
    AnalogIn {
        pin: u16,
    },
    AnalogOut {
        pin: u16,
    },
    Uart {
        tx: u16,
        rx: u16,
        baud: u32,
    },
    Spi {
        mosi: u16,
        miso: u16,
        clk: u16,
        ss: u16,
        bitrate: u32,
    },
    I2cMaster {
        sda: u16,
        scl: u16,
        clock: u32,
    },
    Level {
        handle: u32,
    },
    SetLevel {
        handle: u32,
        high: bool,
    },
    Toggle {
        handle: u32,
    },
    Pwm {
        handle: u32,
        duty: f64,
        freq: u32,
    },
    SetTrigger {
        handle: u32,
        trigger: Trigger,
    },
    /// Sample every input with a trigger; answers `[[handle, level], ...]`.
    PollEdges,
    Value {
        handle: u32,
    },
    SetValue {
        handle: u32,
        value: u16,
    },
    Read {
        handle: u32,
        max: usize,
    },
    Write {
        handle: u32,
        data: Vec<u8>,
    },
    Transfer {
        handle: u32,
        data: Vec<u8>,
        #[serde(rename = "readLength")]
        read_len: usize,
    },
    Release {
        handle: u32,
    },
}

#[derive(Debug)]
enum Peripheral {
    DigitalOut(DigitalOut),
    DigitalIn(DigitalIn),
    AnalogIn(AnalogIn),
    AnalogOut(AnalogOut),
    Serial(SerialPort),
}

impl Peripheral {
    fn kind(&self) -> &'static str {
        match self {
            Peripheral::DigitalOut(_) => "digital output",
            Peripheral::DigitalIn(_) => "digital input",
            Peripheral::AnalogIn(_) => "analog input",
            Peripheral::AnalogOut(_) => "analog output",
            Peripheral::Serial(_) => "serial port",
        }
    }
}

#[derive(Debug)]
pub struct IoBridge {
    board: IoBoard,
    handles: HashMap<u32, Peripheral>,
    next_handle: u32,
}

impl IoBridge {
    pub fn new(board: IoBoard) -> Self {
        Self {
            board,
            handles: HashMap::new(),
            next_handle: 0,
        }
    }

    pub fn board(&self) -> &IoBoard {
        &self.board
    }

    /// Handles the script still holds.
    pub fn live_handles(&self) -> usize {
        self.handles.len()
    }

    /// Parse and run one request. The answer is `{"ok": value}` or
    /// `{"error": message}`; the prelude throws on the latter.
    pub fn handle_json(&mut self, request: &str) -> String {
        let answer = match serde_json::from_str::<IoRequest>(request) {
            Ok(request) => match self.handle(request) {
                Ok(value) => json!({ "ok": value }),
                Err(err) => json!({ "error": err.to_string() }),
            },
            Err(err) => {
                tracing::warn!(target: "ajs.io", %err, "malformed IO request");
                json!({ "error": format!("malformed IO request: {err}") })
            }
        };
        answer.to_string()
    }

    pub fn handle(&mut self, request: IoRequest) -> IoResult<Json> {
        let created = match request {
            IoRequest::Pins => return Ok(json!(self.board.pin_count())),
            IoRequest::DigitalOut { pin, initial } => Peripheral::DigitalOut(self.board.digital_out(pin, initial)?),
            IoRequest::DigitalIn { pin, pull } => Peripheral::DigitalIn(self.board.digital_in(pin, pull)?),
            IoRequest::AnalogIn { pin } => Peripheral::AnalogIn(self.board.analog_in(pin)?),
            IoRequest::AnalogOut { pin } => Peripheral::AnalogOut(self.board.analog_out(pin)?),
            IoRequest::Uart { tx, rx, baud } => Peripheral::Serial(self.board.uart(tx, rx, baud)?),
            IoRequest::Spi {
                mosi,
                miso,
                clk,
                ss,
                bitrate,
            } => Peripheral::Serial(self.board.spi(mosi, miso, clk, ss, bitrate)?),
            IoRequest::I2cMaster { sda, scl, clock } => Peripheral::Serial(self.board.i2c_master(sda, scl, clock)?),
            IoRequest::PollEdges => return Ok(self.poll_edges()),
            IoRequest::Release { handle } => {
                return Ok(json!(self.handles.remove(&handle).is_some()));
            }
            other => return self.operate(other),
        };
        self.next_handle += 1;
        let handle = self.next_handle;
        tracing::debug!(target: "ajs.io", handle, kind = created.kind(), "peripheral opened");
        self.handles.insert(handle, created);
        Ok(json!(handle))
    }

    fn operate(&mut self, request: IoRequest) -> IoResult<Json> {
        let handle = match &request {
            IoRequest::Level { handle }
            | IoRequest::SetLevel { handle, .. }
            | IoRequest::Toggle { handle }
            | IoRequest::Pwm { handle, .. }
            | IoRequest::SetTrigger { handle, .. }
            | IoRequest::Value { handle }
            | IoRequest::SetValue { handle, .. }
            | IoRequest::Read { handle, .. }
            | IoRequest::Write { handle, .. }
            | IoRequest::Transfer { handle, .. } => *handle,
            _ => return Err(ResourceError::OutOfRange("not a handle operation".to_string())),
        };
        let peripheral = self
            .handles
            .get_mut(&handle)
            .ok_or(ResourceError::NoSuchHandle(handle))?;
        let kind = peripheral.kind();
        let value = match (peripheral, request) {
            (Peripheral::DigitalOut(out), IoRequest::Level { .. }) => json!(u8::from(out.level())),
            (Peripheral::DigitalIn(input), IoRequest::Level { .. }) => json!(u8::from(input.level())),
            (Peripheral::DigitalOut(out), IoRequest::SetLevel { high, .. }) => {
                out.set_level(high);
                Json::Null
            }
            (Peripheral::DigitalOut(out), IoRequest::Toggle { .. }) => json!(u8::from(out.toggle())),
            (Peripheral::DigitalOut(out), IoRequest::Pwm { duty, freq, .. }) => {
                out.pwm(duty, freq)?;
                Json::Null
            }
            (Peripheral::DigitalIn(input), IoRequest::SetTrigger { trigger, .. }) => {
                input.set_trigger(trigger);
                Json::Null
            }
            (Peripheral::AnalogIn(input), IoRequest::Value { .. }) => json!(input.value()),
            (Peripheral::AnalogOut(out), IoRequest::Value { .. }) => json!(out.value()),
            (Peripheral::AnalogOut(out), IoRequest::SetValue { value, .. }) => {
                out.set_value(value);
                Json::Null
            }
            (Peripheral::Serial(port), IoRequest::Read { max, .. }) => json!(port.read(max)),
            (Peripheral::Serial(port), IoRequest::Write { data, .. }) => json!(port.write(&data)),
            (Peripheral::Serial(port), IoRequest::Transfer { data, read_len, .. }) => {
                json!(port.transfer(&data, read_len))
            }
            (_, request) => {
                return Err(ResourceError::OutOfRange(format!(
                    "{request:?} is not supported on a {kind}"
                )))
            }
        };
        Ok(value)
    }

    fn poll_edges(&mut self) -> Json {
        let mut edges: Vec<(u32, bool)> = self
            .handles
            .iter_mut()
            .filter_map(|(&handle, peripheral)| match peripheral {
                Peripheral::DigitalIn(input) if input.trigger() != Trigger::Disabled => {
                    input.poll_edge().map(|level| (handle, level))
                }
                _ => None,
            })
            .collect();
        edges.sort_unstable_by_key(|(handle, _)| *handle);
        Json::Array(
            edges
                .into_iter()
                .map(|(handle, level)| json!([handle, u8::from(level)]))
                .collect(),
        )
    }
}
