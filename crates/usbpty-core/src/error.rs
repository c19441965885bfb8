//! Error types for usbpty
//!
//! [`BridgeError`] is the taxonomy the bridge reports to its callers.
//! Frame, write, open and pump errors are recoverable and never leave the
//! serial session; driver, permission and state errors are surfaced to the
//! caller that triggered them.
//!
//! [`PortError`] is the narrower error type of OS serial handles.

use std::time::Duration;

use thiserror::Error;

/// Errors reported by the bridge
#[derive(Debug, Error)]
pub enum BridgeError {
    /// Empty or truncated frame from the pty peer (the frame is dropped)
    #[error("Malformed frame from pty peer: {0}")]
    MalformedFrame(String),

    /// Connect attempted while the device has no driver family
    #[error("No driver selected for device {0}. Choose a driver family first")]
    NoDriverSelected(String),

    /// The OS declined access to the device
    #[error("USB permission denied for device {0}")]
    PermissionDenied(String),

    /// Writing to the serial handle failed or timed out; the handle was closed
    #[error("Write to device {device} failed: {source}")]
    WriteFailed {
        /// Device id
        device: String,
        /// Underlying port error
        #[source]
        source: PortError,
    },

    /// The platform could not produce or configure a serial handle
    #[error("Failed to open serial port for device {device}: {source}")]
    OpenFailed {
        /// Device id
        device: String,
        /// Underlying port error
        #[source]
        source: PortError,
    },

    /// The read pump of a session failed (handle revoked, device unplugged)
    #[error("Read pump for device {device} failed: {reason}")]
    PumpFault {
        /// Device id
        device: String,
        /// Description of the failure
        reason: String,
    },

    /// Driver family change requested on a connected device
    #[error("Cannot change the driver of device {0} while it is connected")]
    DriverChangeWhileConnected(String),

    /// No device with this id is known to the registry
    #[error("Unknown device: {0}")]
    UnknownDevice(String),

    /// The operation needs a connected device
    #[error("Device {0} is not connected")]
    NotConnected(String),

    /// The registry was shut down and accepts no further operations
    #[error("Bridge has been shut down")]
    ShutDown,

    /// Reading or writing preferences failed
    #[error("Preference store error: {0}")]
    Preferences(String),

    /// The pty peer could not be created or used
    #[error("Pty error: {0}")]
    Pty(String),
}

impl BridgeError {
    /// Whether the bridge recovers from this error locally
    ///
    /// Recoverable errors are logged by the session and the device keeps
    /// running; the next control packet decides what happens next.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            BridgeError::MalformedFrame(_)
                | BridgeError::WriteFailed { .. }
                | BridgeError::OpenFailed { .. }
                | BridgeError::PumpFault { .. }
        )
    }
}

/// Result type alias using [`BridgeError`]
pub type Result<T> = std::result::Result<T, BridgeError>;

/// Errors of OS serial handles
#[derive(Debug, Error)]
pub enum PortError {
    /// The operation did not complete within the allowed time
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// The handle was closed
    #[error("Port is closed")]
    Closed,

    /// No OS serial port belongs to the USB device
    #[error("No serial port found for {0}")]
    NotFound(String),

    /// I/O error on the handle
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Backend specific error
    #[error("{0}")]
    Other(String),
}

/// Result type alias using [`PortError`]
pub type PortResult<T> = std::result::Result<T, PortError>;
