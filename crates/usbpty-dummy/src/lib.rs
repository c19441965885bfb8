//! usbpty-dummy - In-memory collaborators for testing
//!
//! This crate provides stand-ins for everything the bridge talks to, so it
//! can run without hardware or a real pseudo terminal:
//!
//! - [`DummyPlatform`] opens handles to an emulated printer that answers
//!   every G-code line with `ok`
//! - [`DummyBus`] gives every device identity its own emulated printer
//! - [`DummyPtyFactory`] hands out [`DummyPeer`]s fed from a channel
//! - [`DummyPermissions`] grants, denies or holds permission requests
//!
//! All of them record what happened so tests can inspect it afterwards.

#![warn(missing_docs)]

mod bus;
mod peer;
mod permissions;
mod platform;

pub use bus::DummyBus;
pub use peer::{DummyPeer, DummyPtyFactory};
pub use permissions::{DummyPermissions, PermissionMode};
pub use platform::{DummyConfig, DummyPlatform};

use std::time::{Duration, Instant};

/// Poll `condition` until it holds or `timeout` expires
///
/// Returns whether the condition was met.
pub fn wait_for(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
}
