//! usbpty-serial - native USB serial adapters
//!
//! This crate connects the bridge to real hardware. USB devices are listed
//! and watched with `nusb`; the tty node the kernel driver creates for an
//! adapter is opened with `serialport`.
//!
//! # Overview
//!
//! - [`enumerate`]: USB enumeration and hotplug, reported as
//!   [`RawUsbDevice`](usbpty_core::driver::RawUsbDevice)s
//! - [`port`]: [`SerialPortPlatform`], the
//!   [`UsbPlatform`](usbpty_core::platform::UsbPlatform) for tty nodes
//! - [`permissions`]: [`TtyPermissions`], read/write access to tty nodes
//!
//! # Example
//!
//! ```no_run
//! use usbpty_serial::{list_devices, find_port};
//!
//! for device in list_devices()? {
//!     match find_port(&device) {
//!         Ok(tty) => println!("{} -> {}", device.display_name(), tty),
//!         Err(e) => println!("{}: {}", device.display_name(), e),
//!     }
//! }
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! # System Requirements
//!
//! - The kernel driver for the adapter (`ftdi_sio`, `ch341`, `cp210x`,
//!   `pl2303` or `cdc_acm`)
//! - Read/write access to the tty node, usually via the `dialout` group or
//!   a udev rule

#![warn(missing_docs)]

pub mod enumerate;
pub mod error;
pub mod permissions;
pub mod port;

// Re-exports
pub use enumerate::{is_serial_candidate, list_devices, raw_device, watch_devices, UsbChange};
pub use error::{Result, SerialError};
pub use permissions::{can_access, TtyPermissions};
pub use port::{find_port, SerialPortHandle, SerialPortPlatform, READ_POLL};
