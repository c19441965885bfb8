//! usbpty-core - Core library for the USB serial to pty bridge
//!
//! This crate holds everything that does not touch real hardware:
//!
//! - [`identity`] - vendor/product identity and the permission token
//! - [`driver`] - serial chip driver families, probing and instantiation
//! - [`packet`] - control packets from the pty peer and their wire framing
//! - [`baud`] - translation of termios speed codes into numeric baud rates
//! - [`platform`] - traits for the collaborators the bridge talks to
//! - [`prefs`] - preference stores (auto-connect, driver overrides)
//!
//! # Example
//!
//! ```
//! use usbpty_core::driver::{probe, DriverFamily, RawUsbDevice};
//! use usbpty_core::packet::{encode_frame, decode_frame, TermiosFlags};
//!
//! let raw = RawUsbDevice::new(0x0403, 0x6001, "1-3.2");
//! let driver = probe(&raw);
//! assert_eq!(usbpty_core::driver::classify(driver.as_ref()), DriverFamily::Ftdi);
//!
//! let frame = encode_frame(0, 115200, TermiosFlags::default(), b"M105\n");
//! let packet = decode_frame(&frame)?;
//! assert_eq!(packet.payload(), b"M105\n");
//! # Ok::<(), usbpty_core::BridgeError>(())
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod baud;
pub mod driver;
pub mod error;
pub mod identity;
pub mod packet;
pub mod platform;
pub mod prefs;

pub use driver::{DriverFamily, DriverInstance, RawUsbDevice};
pub use error::{BridgeError, PortError, PortResult, Result};
pub use identity::DeviceIdentity;
pub use packet::{ControlFlags, ControlPacket, TermiosFlags};
