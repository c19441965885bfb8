//! The bridge loop

use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use nix::sys::signal::{SigSet, Signal};
use usbpty_bridge::{BridgeConfig, BridgeRegistry, Collaborators, EventSender};
use usbpty_core::platform::PtyFactory;
use usbpty_core::prefs::TomlPreferences;
use usbpty_pty::NativePtyFactory;
use usbpty_serial::{watch_devices, SerialPortPlatform, TtyPermissions, UsbChange};

use crate::cli::RunArgs;

/// Block SIGINT and SIGTERM in the calling thread
///
/// Threads spawned afterwards inherit the mask, so only [`wait_for_signal`]
/// sees them.
fn block_shutdown_signals() -> nix::Result<SigSet> {
    let mut signals = SigSet::empty();
    signals.add(Signal::SIGINT);
    signals.add(Signal::SIGTERM);
    signals.thread_block()?;
    Ok(signals)
}

/// Wait for one of the blocked `signals`
fn wait_for_signal(signals: &SigSet) -> Option<Signal> {
    signals.wait().ok()
}

/// Post a shutdown to the registry once a signal arrives
fn shutdown_on_signal(signals: SigSet, events: EventSender) {
    thread::spawn(move || {
        if let Some(signal) = wait_for_signal(&signals) {
            log::info!("Received {}, shutting down", signal.as_str());
            events.shutdown();
        }
    });
}

/// Bridge adapters until SIGINT or SIGTERM
///
/// Links left behind by a killed run are removed when the next one starts.
pub fn run_bridge(args: &RunArgs, prefs_path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let signals = block_shutdown_signals()?;

    let ptys = NativePtyFactory::new(&args.link_dir).map_err(|e| {
        format!(
            "{}\nMake sure {} is writable or pick another --link-dir",
            e,
            args.link_dir.display()
        )
    })?;
    let ptys: Arc<dyn PtyFactory> = Arc::new(ptys);
    let config = BridgeConfig {
        write_timeout: Duration::from_millis(args.write_timeout_ms),
        connect_all: args.all || args.dummy,
        ..BridgeConfig::default()
    };

    if args.dummy {
        return run_dummy(ptys, config, signals);
    }

    let prefs = TomlPreferences::open(prefs_path)?;
    log::info!("Using preferences from {}", prefs.path().display());
    let collab = Collaborators {
        platform: Arc::new(SerialPortPlatform::new()),
        ptys,
        permissions: Arc::new(TtyPermissions::default()),
        prefs: Arc::new(prefs),
    };
    let registry = BridgeRegistry::new(collab, config);
    shutdown_on_signal(signals, registry.events());

    let events = registry.events();
    let _watcher = watch_devices(move |change| match change {
        UsbChange::Attached(raw) => events.attached(raw),
        UsbChange::Detached(id) => events.detached(id),
    })
    .map_err(|e| format!("{}\nMake sure you have permission to access USB devices", e))?;

    log::info!("Bridging USB serial adapters, links in {}", args.link_dir.display());
    registry.run();
    Ok(())
}

#[cfg(feature = "dummy")]
fn run_dummy(
    ptys: Arc<dyn PtyFactory>,
    config: BridgeConfig,
    signals: SigSet,
) -> Result<(), Box<dyn std::error::Error>> {
    use usbpty_core::driver::RawUsbDevice;
    use usbpty_core::prefs::MemoryPreferences;
    use usbpty_dummy::{DummyConfig, DummyPermissions, DummyPlatform, PermissionMode};

    let collab = Collaborators {
        platform: Arc::new(DummyPlatform::new(DummyConfig::default())),
        ptys,
        permissions: Arc::new(DummyPermissions::new(PermissionMode::GrantAll)),
        prefs: Arc::new(MemoryPreferences::new()),
    };
    let registry = BridgeRegistry::new(collab, config);
    shutdown_on_signal(signals, registry.events());

    let printer = RawUsbDevice::new(0x0403, 0x6001, "dummy").with_product("Emulated printer");
    log::info!("Bridging an emulated printer as device {}", printer.identity().id());
    registry.events().attached(printer);
    registry.run();
    Ok(())
}

#[cfg(not(feature = "dummy"))]
fn run_dummy(
    _ptys: Arc<dyn PtyFactory>,
    _config: BridgeConfig,
    _signals: SigSet,
) -> Result<(), Box<dyn std::error::Error>> {
    Err("usbpty was built without the `dummy` feature".into())
}
