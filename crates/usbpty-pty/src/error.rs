//! Error types for the native pty peer

use std::path::PathBuf;

use thiserror::Error;
use usbpty_core::error::BridgeError;

/// Native pty errors
#[derive(Debug, Error)]
pub enum PtyError {
    /// openpty failed
    #[error("Failed to open pty: {0}")]
    Open(#[source] nix::Error),

    /// The slave side could not be configured
    #[error("Failed to configure pty slave: {0}")]
    Configure(#[source] nix::Error),

    /// Enabling packet mode on the master failed
    #[error("Failed to enable packet mode: {0}")]
    PacketMode(#[source] nix::Error),

    /// Creating or cleaning up a symlink failed
    #[error("Failed to link {path}: {source}")]
    Link {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// I/O error on the master
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for pty operations
pub type Result<T> = std::result::Result<T, PtyError>;

impl From<PtyError> for BridgeError {
    fn from(err: PtyError) -> Self {
        BridgeError::Pty(err.to_string())
    }
}
