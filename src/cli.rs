//! CLI argument parsing

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use usbpty_core::identity::DeviceIdentity;

/// Parse a `vendor:product` device id (decimal or 0x-prefixed hex)
fn parse_device_id(s: &str) -> Result<DeviceIdentity, String> {
    s.parse()
}

#[derive(Parser)]
#[command(name = "usbpty")]
#[command(
    author,
    version,
    about = "Bridge USB serial adapters to pseudo terminals",
    long_about = None
)]
pub struct Cli {
    /// Verbosity level (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Preference file (TOML)
    /// Defaults to <config dir>/usbpty/preferences.toml
    #[arg(long, global = true)]
    pub prefs: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Options of the `run` command
#[derive(clap::Args, Debug, Clone)]
pub struct RunArgs {
    /// Directory holding one pty link per device
    #[arg(long, default_value = "/tmp/usbpty")]
    pub link_dir: PathBuf,

    /// Connect every attached adapter, not only auto-connect ones
    #[arg(long)]
    pub all: bool,

    /// Bridge an emulated printer instead of real hardware
    #[arg(long)]
    pub dummy: bool,

    /// Upper bound for one write to the device, in milliseconds
    #[arg(long, default_value_t = 2000)]
    pub write_timeout_ms: u64,
}

/// On/off switch
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Toggle {
    On,
    Off,
}

#[derive(Subcommand)]
pub enum Commands {
    /// List attached USB serial adapters
    List,

    /// List driver families and known adapters
    Drivers,

    /// Bridge adapters to pseudo terminals until interrupted (Ctrl-C or SIGTERM)
    Run(RunArgs),

    /// Choose the driver family of a device ("unknown" clears the choice)
    Driver {
        /// Device id (vendor:product, e.g. 1027:24577 or 0x0403:0x6001)
        #[arg(value_parser = parse_device_id)]
        device: DeviceIdentity,

        /// Driver family (Prolific, CDC, FTDI, CH340, CP21xx, Unknown)
        family: String,
    },

    /// Connect a device as soon as it is attached
    AutoConnect {
        /// Device id (vendor:product, e.g. 1027:24577 or 0x0403:0x6001)
        #[arg(value_parser = parse_device_id)]
        device: DeviceIdentity,

        /// Enable or disable
        #[arg(value_enum)]
        state: Toggle,
    },
}
