//! tty node permissions
//!
//! On a desktop the "permission" to use a USB serial adapter is read/write
//! access to its tty node, usually granted through the `dialout` group or a
//! udev rule. There is no dialog to show, so a request logs what to do and
//! then watches the node until access appears or the request times out.

use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

use nix::unistd::{access, AccessFlags};
use usbpty_core::driver::RawUsbDevice;
use usbpty_core::identity::DeviceIdentity;
use usbpty_core::platform::{PermissionAuthority, PermissionReply};

use crate::port::find_port;

/// [`PermissionAuthority`] checking access to tty nodes
#[derive(Debug, Clone)]
pub struct TtyPermissions {
    poll_interval: Duration,
    timeout: Duration,
}

impl Default for TtyPermissions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            timeout: Duration::from_secs(120),
        }
    }
}

impl TtyPermissions {
    /// Create an authority that waits up to `timeout` for access
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            ..Self::default()
        }
    }
}

/// Whether the process may read and write `path`
pub fn can_access(path: &Path) -> bool {
    access(path, AccessFlags::R_OK | AccessFlags::W_OK).is_ok()
}

fn tty_for(identity: &DeviceIdentity) -> Option<String> {
    find_port(&RawUsbDevice::new(identity.vendor_id, identity.product_id, "")).ok()
}

fn accessible(identity: &DeviceIdentity) -> bool {
    tty_for(identity).is_some_and(|tty| can_access(Path::new(&tty)))
}

impl PermissionAuthority for TtyPermissions {
    fn has_permission(&self, identity: &DeviceIdentity) -> bool {
        accessible(identity)
    }

    fn request_permission(&self, identity: &DeviceIdentity, reply: PermissionReply) {
        match tty_for(identity) {
            Some(tty) => log::warn!(
                "No read/write access to {}. Add your user to the group owning it \
                 (usually dialout) or install a udev rule such as\n  \
                 SUBSYSTEM==\"tty\", ATTRS{{idVendor}}==\"{:04x}\", \
                 ATTRS{{idProduct}}==\"{:04x}\", MODE=\"0660\", TAG+=\"uaccess\"",
                tty,
                identity.vendor_id,
                identity.product_id
            ),
            None => log::warn!(
                "No tty node for {} yet. Make sure the kernel driver is loaded",
                identity
            ),
        }

        let identity = *identity;
        let poll_interval = self.poll_interval;
        let deadline = Instant::now() + self.timeout;
        thread::spawn(move || {
            let granted = loop {
                if accessible(&identity) {
                    break true;
                }
                if Instant::now() >= deadline {
                    break false;
                }
                thread::sleep(poll_interval);
            };
            log::debug!("Permission for {} resolved: {}", identity, granted);
            reply.resolve(granted);
        });
    }
}
