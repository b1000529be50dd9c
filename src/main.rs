use alljoyn_js::bus::{BusAttachment, LoopbackBus};
use alljoyn_js::config::BindingConfig;
use alljoyn_js::core::error::{AjsResult, ScriptError};
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

/// Longest sleep between polls when no timer is due sooner.
const IDLE_MS: u64 = 20;

fn main() {
    if let Err(e) = run() {
        eprintln!("alljoyn_js failed: {}", e);
        std::process::exit(1);
    }
}

/// `alljoyn_js [script.js] [config.toml]`
fn run() -> AjsResult<()> {
    let mut args = std::env::args().skip(1);
    let script = args.next();
    let mut config = match args.next() {
        Some(path) => BindingConfig::from_toml_file(path)?,
        None => BindingConfig::load_or_default(),
    };
    config.apply_env_overrides();
    config.validate()?;
    alljoyn_js::init_logging(&config.logging);

    let fabric = LoopbackBus::new();
    let mut bus = BusAttachment::from_config(config)?;
    let _host = match script {
        Some(path) => Some(load_script(&mut bus, Path::new(&path))?),
        None => None,
    };

    bus.attach(fabric.connect())?;
    tracing::info!(target: "ajs.bus", name = ?bus.unique_name(), "attached to loopback bus");

    let start = Instant::now();
    let mut elapsed = 0u64;
    while bus.is_attached() {
        let now = start.elapsed().as_millis() as u64;
        if now > elapsed {
            fabric.advance(now - elapsed);
            bus.advance(now - elapsed);
            elapsed = now;
        } else {
            bus.poll();
        }
        let wait = bus
            .next_deadline()
            .map(|deadline| deadline.saturating_sub(bus.now_ms()))
            .unwrap_or(IDLE_MS)
            .clamp(1, IDLE_MS);
        thread::sleep(Duration::from_millis(wait));
    }

    tracing::info!(target: "ajs.bus", stats = ?bus.dispatch_stats(), "detached, exiting");
    Ok(())
}

#[cfg(feature = "script")]
fn load_script(bus: &mut BusAttachment, path: &Path) -> AjsResult<alljoyn_js::bindings::ScriptHost> {
    let source = std::fs::read_to_string(path).map_err(ScriptError::Io)?;
    let host = alljoyn_js::bindings::ScriptHost::quickjs(bus.property_store().clone())?;
    host.run(bus, &path.display().to_string(), &source)?;
    Ok(host)
}

#[cfg(not(feature = "script"))]
fn load_script(_bus: &mut BusAttachment, path: &Path) -> AjsResult<()> {
    Err(ScriptError::Definition(format!(
        "cannot run {}: built without the `script` feature",
        path.display()
    ))
    .into())
}
