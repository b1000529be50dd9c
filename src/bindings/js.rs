//! JavaScript binding adapter using rquickjs
//!
//! Runs AllJoyn.js scripts on QuickJS. The prelude defines the `AJ`
//! namespace, the `IO` object and the timer globals on top of a few natives.
//! Everything that touches the bus is queued as a [`BindingCommand`] on a
//! channel and applied by the [`ScriptHost`] once the script returns. Pin
//! operations run synchronously through the [`IoBridge`].

use super::host::ScriptHost;
use super::peripherals::IoBridge;
use super::protocol::{BindingAdapter, BindingCommand, BindingEvent, BindingOutcome, ScriptDefinitions};
use crate::core::error::{AjsResult, ScriptError, StoreError};
use crate::io::IoBoard;
use crate::services::{PropertyStore, Translations};
use crossbeam_channel::{Receiver, Sender};
use rquickjs::{Context, Ctx, Exception, Function, Runtime};
use serde_json::Value as Json;
use std::cell::{Cell, RefCell};
use std::rc::Rc;

const PRELUDE: &str = include_str!("prelude.js");

pub struct QuickJsAdapter {
    #[allow(dead_code)]
    runtime: Runtime,
    context: Context,
    commands: Receiver<BindingCommand>,
    translations: Rc<RefCell<Translations>>,
    io: Rc<RefCell<IoBridge>>,
    /// New timers the script may still set in this entry.
    timer_slots: Rc<Cell<usize>>,
}

impl QuickJsAdapter {
    /// Create a runtime whose `AJ.store`/`AJ.load` go to `store`, with a
    /// simulated peripheral board behind `IO`.
    pub fn new(store: PropertyStore) -> Result<Self, ScriptError> {
        Self::with_board(store, IoBoard::default())
    }

    pub fn with_board(store: PropertyStore, board: IoBoard) -> Result<Self, ScriptError> {
        let runtime = Runtime::new().map_err(|e| ScriptError::Eval(format!("runtime: {e}")))?;
        let context = Context::full(&runtime).map_err(|e| ScriptError::Eval(format!("context: {e}")))?;
        let (sender, commands) = crossbeam_channel::unbounded();
        let adapter = Self {
            runtime,
            context,
            commands,
            translations: Rc::new(RefCell::new(Translations::new())),
            io: Rc::new(RefCell::new(IoBridge::new(board))),
            // Unlimited until a host publishes the bus's free slots.
            timer_slots: Rc::new(Cell::new(usize::MAX)),
        };
        adapter.bind_natives(sender, store)?;
        adapter.eval_source("prelude.js", PRELUDE)?;
        Ok(adapter)
    }

    fn bind_natives(&self, sender: Sender<BindingCommand>, store: PropertyStore) -> Result<(), ScriptError> {
        let translations = Rc::clone(&self.translations);
        let io = Rc::clone(&self.io);
        let timer_slots = Rc::clone(&self.timer_slots);
        let load_store = store.clone();
        let translate_store = store.clone();

        self.context
            .with(|ctx| -> rquickjs::Result<()> {
                let global = ctx.globals();

                global.set(
                    "__ajsCommand",
                    Function::new(ctx.clone(), move |json: String| {
                        match BindingCommand::from_json_str(&json) {
                            Ok(command) => {
                                if sender.send(command).is_err() {
                                    tracing::warn!(target: "ajs.script", "command queue closed");
                                }
                            }
                            Err(err) => tracing::warn!(target: "ajs.script", %err, "malformed script command"),
                        }
                    })?,
                )?;

                global.set(
                    "__ajsStore",
                    Function::new(
                        ctx.clone(),
                        move |ctx: Ctx<'_>, key: String, json: String| -> rquickjs::Result<bool> {
                            let stored = serde_json::from_str::<Json>(&json)
                                .map_err(StoreError::from)
                                .and_then(|value| store.store(&key, value));
                            match stored {
                                Ok(()) => Ok(true),
                                Err(err) => {
                                    tracing::warn!(target: "ajs.store", key = %key, %err, "store failed");
                                    Err(Exception::throw_message(&ctx, &format!("AJ.store('{key}'): {err}")))
                                }
                            }
                        },
                    )?,
                )?;

                global.set(
                    "__ajsLoad",
                    Function::new(ctx.clone(), move |key: String| -> Option<String> {
                        match load_store.load(&key) {
                            Ok(value) => value.map(|v| v.to_string()),
                            Err(err) => {
                                tracing::warn!(target: "ajs.store", key = %key, %err, "load failed");
                                None
                            }
                        }
                    })?,
                )?;

                global.set(
                    "__ajsTranslate",
                    Function::new(ctx.clone(), move |key: String| -> String {
                        translations.borrow().translate_stored(&key, &translate_store)
                    })?,
                )?;

                global.set(
                    "__ajsIo",
                    Function::new(ctx.clone(), move |request: String| -> String {
                        match io.try_borrow_mut() {
                            Ok(mut bridge) => bridge.handle_json(&request),
                            Err(_) => r#"{"error":"IO request re-entered"}"#.to_string(),
                        }
                    })?,
                )?;

                global.set(
                    "__ajsTakeTimerSlot",
                    Function::new(ctx.clone(), move || -> bool {
                        match timer_slots.get() {
                            0 => false,
                            free => {
                                timer_slots.set(free - 1);
                                true
                            }
                        }
                    })?,
                )?;

                global.set(
                    "__ajsPrint",
                    Function::new(ctx.clone(), |text: String| {
                        println!("{text}");
                    })?,
                )?;

                Ok(())
            })
            .map_err(|e| ScriptError::Definition(format!("binding natives: {e}")))
    }

    pub fn eval_source(&self, name: &str, source: &str) -> Result<(), ScriptError> {
        self.context.with(|ctx| {
            ctx.eval::<(), _>(source)
                .map_err(|err| ScriptError::Eval(format!("{name}: {}", describe(&ctx, err))))
        })
    }

    /// Peripheral handles the script holds open.
    pub fn io_handles(&self) -> usize {
        self.io.borrow().live_handles()
    }

    fn call_global(&self, name: &str, arg: String) -> Result<String, ScriptError> {
        self.context.with(|ctx| {
            let func = ctx
                .globals()
                .get::<_, Function>(name)
                .map_err(|e| ScriptError::Eval(format!("{name} is not callable: {e}")))?;
            func.call::<_, String>((arg,))
                .map_err(|err| ScriptError::Eval(format!("{name}: {}", describe(&ctx, err))))
        })
    }
}

/// Message of a pending JS exception, or the engine error itself.
fn describe(ctx: &Ctx<'_>, err: rquickjs::Error) -> String {
    if !matches!(err, rquickjs::Error::Exception) {
        return err.to_string();
    }
    let caught = ctx.catch();
    if let Some(exception) = caught.as_exception() {
        return exception.message().unwrap_or_else(|| "exception".to_string());
    }
    caught
        .as_string()
        .and_then(|s| s.to_string().ok())
        .unwrap_or_else(|| err.to_string())
}

fn is_blank(value: &Json) -> bool {
    match value {
        Json::Null => true,
        Json::Object(map) => map.is_empty(),
        _ => false,
    }
}

impl BindingAdapter for QuickJsAdapter {
    fn eval(&mut self, name: &str, source: &str) -> Result<(), ScriptError> {
        self.eval_source(name, source)
    }

    fn definitions(&mut self) -> Result<ScriptDefinitions, ScriptError> {
        let text = self.call_global("__ajsDefinitions", String::new())?;
        let mut defs: ScriptDefinitions =
            serde_json::from_str(&text).map_err(|e| ScriptError::Definition(e.to_string()))?;
        for slot in [
            &mut defs.interface_definition,
            &mut defs.object_definition,
            &mut defs.about_definition,
            &mut defs.security_definition,
            &mut defs.translations,
        ] {
            if slot.as_ref().is_some_and(is_blank) {
                *slot = None;
            }
        }
        if let Some(def) = &defs.translations {
            let parsed = Translations::from_json(def).map_err(|e| ScriptError::Definition(e.to_string()))?;
            *self.translations.borrow_mut() = parsed;
        }
        Ok(defs)
    }

    fn dispatch_event(&mut self, event: &BindingEvent) -> Result<BindingOutcome, ScriptError> {
        let json = serde_json::to_string(event).map_err(|e| ScriptError::Command(e.to_string()))?;
        let out = self.call_global("__ajsDispatch", json)?;
        BindingOutcome::from_json_str(&out)
    }

    fn poll_commands(&mut self) -> Vec<BindingCommand> {
        self.commands.try_iter().collect()
    }

    fn set_timer_slots(&mut self, slots: usize) {
        self.timer_slots.set(slots);
    }
}

impl ScriptHost {
    /// A host running scripts on QuickJS, persisting through `store`.
    pub fn quickjs(store: PropertyStore) -> AjsResult<Self> {
        Ok(ScriptHost::new(QuickJsAdapter::new(store)?))
    }
}
