//! usbpty-bridge - Bridge USB serial devices to pseudo terminals
//!
//! This crate owns the moving parts: the registry of attached devices, the
//! per-device connection state machine, the serial session that reopens and
//! reconfigures the port on demand, and the threads pumping bytes between
//! the port and the pty peer.
//!
//! # Architecture
//!
//! ```text
//!   attach/detach notifier      permission authority      UI / CLI
//!            │                          │                     │
//!            └──────── BridgeEvent ─────┘                     │
//!                          │                                  │
//!                          ▼                                  ▼
//! ┌──────────────────────────────────────────────────────────────────┐
//! │ BridgeRegistry: id -> DeviceSlot (copy-on-write map)             │
//! │   attach / detach / try_connect / disconnect / permission result │
//! └──────────────────────────────────────────────────────────────────┘
//!                          │ one slot per device
//!                          ▼
//! ┌──────────────────────────┐  packets   ┌─────────────────────────┐
//! │ SerialDevice             │◄───────────│ PtyWorker (thread)      │
//! │  state, driver, session  │            │  peer.receive + decode  │
//! └──────────────────────────┘            └─────────────────────────┘
//!                          │
//!                          ▼
//! ┌──────────────────────────┐  bytes     ┌─────────────────────────┐
//! │ SerialSession            │───────────►│ ReadPump (thread)       │
//! │  ensure_open / forward   │            │  handle -> peer.write   │
//! └──────────────────────────┘            └─────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use usbpty_bridge::{BridgeConfig, BridgeRegistry, Collaborators};
//!
//! let registry = Arc::new(BridgeRegistry::new(collaborators, BridgeConfig::default()));
//! let events = registry.events();
//! // hand `events` to the hotplug notifier, then
//! registry.run();
//! ```

#![warn(missing_docs)]

mod device;
mod event;
mod registry;
mod session;
mod worker;

pub use device::{DeviceState, DeviceStatus, SerialDevice};
pub use event::{BridgeEvent, EventSender};
pub use registry::{
    BridgeConfig, BridgeRegistry, Collaborators, DeviceMap, DeviceSlot, DEFAULT_POLL_INTERVAL,
    DEFAULT_WRITE_TIMEOUT,
};
pub use session::{on_device_bytes, SerialSession};

use std::sync::{Mutex, MutexGuard};

/// Lock a mutex, recovering the data if a panicking thread poisoned it
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
