//! CLI command implementations
//!
//! `drivers`, `driver` and `auto-connect` only touch the preference file and
//! the driver table. `list` and `run` talk to real hardware and need the
//! `native` feature.

mod drivers;
#[cfg(feature = "native")]
mod list;
mod prefs;
#[cfg(feature = "native")]
mod run;

pub use drivers::list_drivers;
#[cfg(feature = "native")]
pub use list::list_devices;
pub use prefs::{set_auto_connect, set_driver};
#[cfg(feature = "native")]
pub use run::run_bridge;
