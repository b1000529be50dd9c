//! # AllJoyn.js
//!
//! The binding surface between AllJoyn.js device scripts and an AllJoyn bus.
//!
//! ## Features
//!
//! - **Descriptor Registry**: interfaces, objects, About data and security
//!   credentials declared once, validated, and sealed while attached
//! - **Dispatch Router**: inbound calls, signals and property accesses routed
//!   to handler slots with an exactly-once reply contract
//! - **Remote Proxies**: discovered services as owned handles with `onReply`
//!   slots that never fire after release
//! - **Cooperative Event Loop**: timers and posted tasks run to completion on
//!   one thread
//! - **Device Services**: property store, translations, notifications,
//!   control panel and a peripheral pin board
//! - **Scripting**: QuickJS host for AllJoyn.js scripts (feature `script`)
//!
//! ### Example
//!
//! ```ignore
//! use alljoyn_js::bus::{BusAttachment, LoopbackBus};
//! use alljoyn_js::config::BindingConfig;
//!
//! let fabric = LoopbackBus::new();
//! let mut bus = BusAttachment::new(BindingConfig::default());
//! bus.on_method_call(|_, ctx, args| {
//!     ctx.reply(args);
//!     Ok(())
//! });
//! bus.attach(fabric.connect())?;
//! bus.poll();
//! ```
//!
//! ## Modules
//!
//! - [`registry`]: interface and object descriptors
//! - [`dispatch`]: handler slots and the router
//! - [`proxy`]: remote service proxies
//! - [`bus`]: the bus attachment and its transports
//! - [`services`]: store, translations, notifications, control panel
//! - [`bindings`]: script engine bindings

/// Error types, the event loop and naming rules
pub mod core;
/// Configuration system
pub mod config;
/// Type signatures
pub mod signature;
/// Typed message values
pub mod value;
/// Interface, object and About descriptors
pub mod registry;
/// Inbound dispatch and handler contracts
pub mod dispatch;
/// Outbound proxies
pub mod proxy;
/// Bus attachment, transports and the loopback bus
pub mod bus;
/// Device services
pub mod services;
/// Peripheral IO
pub mod io;
/// Script bindings
pub mod bindings;

pub use crate::bus::{BusAttachment, LoopbackBus};
pub use crate::config::BindingConfig;
pub use crate::core::error::{AjsError, AjsResult};

/// Install the global `tracing` subscriber.
///
/// `RUST_LOG` wins over the configured level. Returns `false` when a
/// subscriber was already installed; embedding hosts and test harnesses
/// install their own first, and that one is kept.
pub fn init_logging(config: &config::LoggingConfig) -> bool {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.level.as_filter()));
    match tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(config.with_target)
        .try_init()
    {
        Ok(()) => true,
        Err(err) => {
            tracing::debug!(target: "ajs.bus", %err, "keeping the existing tracing subscriber");
            false
        }
    }
}
