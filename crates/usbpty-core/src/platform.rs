//! Collaborator traits
//!
//! The bridge never talks to hardware or to the pty directly. Everything
//! outside the core is reached through these traits:
//!
//! - [`UsbPlatform`] produces [`SerialHandle`]s for a driver instance
//! - [`PtyPeer`] is the byte stream to the pseudo terminal, one per device,
//!   created by a [`PtyFactory`]
//! - [`PermissionAuthority`] answers and requests device access
//!
//! Implementations live in `usbpty-serial` (nusb + serialport),
//! `usbpty-pty` (native pty) and `usbpty-dummy` (in-memory).

use std::io;
use std::sync::Arc;
use std::time::Duration;

use crate::driver::DriverInstance;
use crate::error::{PortResult, Result};
use crate::identity::DeviceIdentity;

/// Number of data bits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DataBits {
    /// 5 data bits
    Five,
    /// 6 data bits
    Six,
    /// 7 data bits
    Seven,
    /// 8 data bits
    #[default]
    Eight,
}

/// Number of stop bits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StopBits {
    /// 1 stop bit
    #[default]
    One,
    /// 2 stop bits
    Two,
}

/// Parity mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Parity {
    /// No parity
    #[default]
    None,
    /// Odd parity
    Odd,
    /// Even parity
    Even,
}

/// Line configuration applied to a serial handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineConfig {
    /// Baud rate
    pub baud_rate: u32,
    /// Data bits
    pub data_bits: DataBits,
    /// Stop bits
    pub stop_bits: StopBits,
    /// Parity
    pub parity: Parity,
}

impl LineConfig {
    /// 8 data bits, no parity, 1 stop bit
    pub const fn eight_n_one(baud_rate: u32) -> Self {
        Self {
            baud_rate,
            data_bits: DataBits::Eight,
            stop_bits: StopBits::One,
            parity: Parity::None,
        }
    }
}

/// An open OS serial handle
///
/// At most one exists per device. Closing it must make the reader returned
/// by [`SerialHandle::reader`] return `Ok(0)` in bounded time.
pub trait SerialHandle: Send {
    /// Apply a line configuration
    fn configure(&mut self, config: &LineConfig) -> PortResult<()>;

    /// Drive the DTR line
    fn set_dtr(&mut self, level: bool) -> PortResult<()>;

    /// Drive the RTS line
    fn set_rts(&mut self, level: bool) -> PortResult<()>;

    /// Write all of `data`, failing with [`crate::PortError::Timeout`] when it
    /// does not complete within `timeout`
    fn write(&mut self, data: &[u8], timeout: Duration) -> PortResult<()>;

    /// Create the reader used by the read pump
    fn reader(&mut self) -> PortResult<Box<dyn SerialReader>>;

    /// Whether the handle is still open
    fn is_open(&self) -> bool;

    /// Close the handle and release the OS resources
    fn close(&mut self) -> PortResult<()>;
}

/// Read side of a serial handle, owned by the read pump
pub trait SerialReader: Send {
    /// Block until bytes arrive
    ///
    /// Returns `Ok(0)` once the handle was closed. Errors mean the device is
    /// gone or the handle was revoked.
    fn read(&mut self, buf: &mut [u8]) -> PortResult<usize>;
}

/// Source of serial handles
pub trait UsbPlatform: Send + Sync {
    /// Open the serial port the driver instance talks to
    fn open(&self, driver: &DriverInstance) -> PortResult<Box<dyn SerialHandle>>;
}

/// The pseudo-terminal side of a device
pub trait PtyPeer: Send + Sync {
    /// Deliver bytes read from the device to the pty
    fn write(&self, data: &[u8]) -> io::Result<()>;

    /// Wait up to `timeout` for the next frame
    ///
    /// Returns `Ok(None)` when nothing arrived in time. Frames use the
    /// format described in [`crate::packet`].
    fn receive(&self, timeout: Duration) -> io::Result<Option<Vec<u8>>>;
}

/// Creates one pty peer per connected device
pub trait PtyFactory: Send + Sync {
    /// Open the pty for a device
    fn open(&self, identity: &DeviceIdentity) -> Result<Arc<dyn PtyPeer>>;
}

/// Deferred answer to a permission request
///
/// Resolving the reply routes the result back into the bridge, where it is
/// correlated with the pending device by its token.
pub struct PermissionReply {
    token: u32,
    deliver: Box<dyn FnOnce(u32, bool) + Send>,
}

impl PermissionReply {
    /// Create a reply that hands `(token, granted)` to `deliver`
    pub fn new(token: u32, deliver: impl FnOnce(u32, bool) + Send + 'static) -> Self {
        Self {
            token,
            deliver: Box::new(deliver),
        }
    }

    /// Correlation token of the request
    pub fn token(&self) -> u32 {
        self.token
    }

    /// Deliver the result
    pub fn resolve(self, granted: bool) {
        (self.deliver)(self.token, granted)
    }
}

impl std::fmt::Debug for PermissionReply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PermissionReply")
            .field("token", &format_args!("{:#010x}", self.token))
            .finish_non_exhaustive()
    }
}

/// Grants or denies access to USB devices
pub trait PermissionAuthority: Send + Sync {
    /// Whether the process may open the device now
    fn has_permission(&self, identity: &DeviceIdentity) -> bool;

    /// Ask for access; the answer arrives later through `reply`
    fn request_permission(&self, identity: &DeviceIdentity, reply: PermissionReply);
}
