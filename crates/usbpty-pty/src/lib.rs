//! usbpty-pty - native pseudo-terminal peer
//!
//! Gives every connected device a pseudo-terminal that serial clients
//! (OctoPrint, Pronterface, `screen`) open like a real port. The master side
//! runs in packet mode so the bridge sees when a client starts a session and
//! which baud rate it asked for.
//!
//! # Example
//!
//! ```no_run
//! use usbpty_core::identity::DeviceIdentity;
//! use usbpty_core::platform::PtyFactory;
//! use usbpty_pty::NativePtyFactory;
//!
//! let factory = NativePtyFactory::new("/tmp/usbpty")?;
//! // Creates /tmp/usbpty/67330049 -> /dev/pts/N
//! let peer = factory.open(&DeviceIdentity::new(0x0403, 0x6001))?;
//! peer.write(b"start\n")?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! # System Requirements
//!
//! - A Unix system with `openpty` and `TIOCPKT`
//! - Write access to the link directory

pub mod error;
pub mod factory;
pub mod pty;

// Re-exports
pub use error::{PtyError, Result};
pub use factory::{link_path, prepare_link_dir, NativePtyFactory};
pub use pty::PacketPty;
