//! Error types for the serial backend

use std::io;

use thiserror::Error;
use usbpty_core::error::PortError;

/// Serial backend errors
#[derive(Debug, Error)]
pub enum SerialError {
    /// USB enumeration or hotplug failed
    #[error("USB error: {0}")]
    Usb(String),

    /// No tty node belongs to the USB device
    #[error("No serial port found for {0}. Is the kernel driver loaded?")]
    PortNotFound(String),

    /// Opening the tty failed
    #[error("Failed to open {path}: {source}")]
    OpenFailed {
        /// tty path
        path: String,
        /// Underlying error
        #[source]
        source: serialport::Error,
    },

    /// The tty is bound to a different kernel driver than the device's family uses
    #[error(
        "{path} is bound to the {bound} driver, but the {family} family uses {expected}. \
         Pick the matching driver with `usbpty driver`"
    )]
    DriverMismatch {
        /// tty path
        path: String,
        /// Driver the kernel bound
        bound: String,
        /// Family chosen for the device
        family: String,
        /// Driver of that family
        expected: &'static str,
    },

    /// Serial port error
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Result type alias using [`SerialError`]
pub type Result<T> = std::result::Result<T, SerialError>;

impl From<SerialError> for PortError {
    fn from(err: SerialError) -> Self {
        match err {
            SerialError::PortNotFound(device) => PortError::NotFound(device),
            SerialError::Io(e) => PortError::Io(e),
            SerialError::Serial(e) => port_error(e),
            other => PortError::Other(other.to_string()),
        }
    }
}

/// Map a `serialport` error onto [`PortError`]
pub(crate) fn port_error(err: serialport::Error) -> PortError {
    match err.kind() {
        serialport::ErrorKind::NoDevice => PortError::NotFound(err.description),
        serialport::ErrorKind::Io(kind) => PortError::Io(io::Error::new(kind, err.description)),
        _ => PortError::Other(err.description),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_error_mapping() {
        let err = serialport::Error::new(serialport::ErrorKind::NoDevice, "gone");
        assert!(matches!(port_error(err), PortError::NotFound(d) if d == "gone"));

        let err = serialport::Error::new(
            serialport::ErrorKind::Io(io::ErrorKind::PermissionDenied),
            "denied",
        );
        match port_error(err) {
            PortError::Io(e) => assert_eq!(e.kind(), io::ErrorKind::PermissionDenied),
            other => panic!("unexpected {:?}", other),
        }

        let err: PortError = SerialError::PortNotFound("1027:24577".into()).into();
        assert!(matches!(err, PortError::NotFound(_)));
    }
}
