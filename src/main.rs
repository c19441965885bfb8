//! usbpty - USB serial adapters as pseudo terminals
//!
//! Exposes every attached 3D printer board (FTDI, CH340, CP210x, PL2303 or
//! native USB CDC) as a pseudo terminal with a stable link such as
//! `/tmp/usbpty/67330049`, so host software opens it like a local port.
//!
//! # Architecture
//!
//! - `usbpty-serial` enumerates adapters with nusb and opens their tty nodes
//! - `usbpty-pty` creates a packet-mode pty per connected device
//! - `usbpty-bridge` owns the device registry and moves bytes between them
//!
//! Device preferences (auto-connect, driver override) live in a TOML file
//! and can be edited with the `driver` and `auto-connect` commands.

mod cli;
mod commands;

use clap::Parser;
use cli::{Cli, Commands, Toggle};
use std::path::PathBuf;
use usbpty_core::prefs::TomlPreferences;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logger
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    // Set log level based on verbosity
    match cli.verbose {
        0 => {} // default (info)
        1 => log::set_max_level(log::LevelFilter::Debug),
        _ => log::set_max_level(log::LevelFilter::Trace),
    }

    let prefs_path = match cli.prefs {
        Some(path) => path,
        None => default_prefs_path()
            .ok_or("Cannot determine the config directory. Use --prefs <PATH>")?,
    };

    match cli.command {
        Commands::Drivers => {
            commands::list_drivers();
            Ok(())
        }
        Commands::Driver { device, family } => {
            let prefs = TomlPreferences::open(&prefs_path)?;
            commands::set_driver(&prefs, &device, &family)
        }
        Commands::AutoConnect { device, state } => {
            let prefs = TomlPreferences::open(&prefs_path)?;
            commands::set_auto_connect(&prefs, &device, state == Toggle::On)
        }
        #[cfg(feature = "native")]
        Commands::List => {
            let prefs = TomlPreferences::open(&prefs_path)?;
            commands::list_devices(&prefs)
        }
        #[cfg(feature = "native")]
        Commands::Run(args) => commands::run_bridge(&args, &prefs_path),
        #[cfg(not(feature = "native"))]
        Commands::List | Commands::Run(_) => {
            Err("usbpty was built without the `native` feature".into())
        }
    }
}

/// `<config dir>/usbpty/preferences.toml`
fn default_prefs_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("usbpty").join("preferences.toml"))
}
