//! Script Binding Layer
//!
//! Connects a script engine to a [`BusAttachment`](crate::bus::BusAttachment)
//! through a JSON command/event protocol, so the engine never holds the bus.
//!
//! Architecture:
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  AllJoyn.js script (QuickJS)                │
//! │      AJ.onMethodCall, AJ.findService, setTimeout, ...       │
//! │                    │                  ^                     │
//! │        BindingCommand (queued)   BindingEvent -> Outcome    │
//! │                    v                  │                     │
//! │  ┌─────────────────────────────────────────────────────┐   │
//! │  │     BindingAdapter (QuickJsAdapter, test doubles)   │   │
//! │  └───────────────────────┬─────────────────────────────┘   │
//! │                          v                                  │
//! │  ┌─────────────────────────────────────────────────────┐   │
//! │  │   ScriptHost: handlers, timers, proxies, replies    │   │
//! │  └───────────────────────┬─────────────────────────────┘   │
//! │                          v                                  │
//! │  ┌─────────────────────────────────────────────────────┐   │
//! │  │   BusAttachment (registry, dispatch, event loop)    │   │
//! │  └─────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod host;
#[cfg(feature = "script")]
pub mod js;
pub mod peripherals;
pub mod protocol;

pub use host::ScriptHost;
#[cfg(feature = "script")]
pub use js::QuickJsAdapter;
pub use peripherals::{IoBridge, IoRequest};
pub use protocol::*;
