//! One linked pty per device
//!
//! Every connected device gets a fresh [`PacketPty`] and a stable symlink
//! `<link_dir>/<numeric id>` pointing at its slave, so clients can be
//! configured once per printer.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use usbpty_core::error::Result as BridgeResult;
use usbpty_core::identity::DeviceIdentity;
use usbpty_core::platform::{PtyFactory, PtyPeer};

use crate::error::{PtyError, Result};
use crate::pty::PacketPty;

/// Symlink path for a device inside `link_dir`
pub fn link_path(link_dir: &Path, identity: &DeviceIdentity) -> PathBuf {
    link_dir.join(identity.numeric_id().to_string())
}

/// Create `link_dir` and remove symlinks left behind by an earlier run
///
/// Only symlinks are removed. Returns how many were.
pub fn prepare_link_dir(link_dir: &Path) -> Result<usize> {
    let link_err = |source| PtyError::Link {
        path: link_dir.to_path_buf(),
        source,
    };
    fs::create_dir_all(link_dir).map_err(link_err)?;

    let mut removed = 0;
    for entry in fs::read_dir(link_dir).map_err(link_err)? {
        let path = entry.map_err(link_err)?.path();
        let is_link = fs::symlink_metadata(&path).is_ok_and(|m| m.file_type().is_symlink());
        if !is_link {
            continue;
        }
        match fs::remove_file(&path) {
            Ok(()) => removed += 1,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(source) => return Err(PtyError::Link { path, source }),
        }
    }
    if removed > 0 {
        log::info!("Removed {} stale link(s) from {}", removed, link_dir.display());
    }
    Ok(removed)
}

/// [`PtyFactory`] creating [`PacketPty`]s linked under one directory
#[derive(Debug, Clone)]
pub struct NativePtyFactory {
    link_dir: PathBuf,
}

impl NativePtyFactory {
    /// Create a factory, preparing `link_dir`
    pub fn new(link_dir: impl Into<PathBuf>) -> Result<Self> {
        let link_dir = link_dir.into();
        prepare_link_dir(&link_dir)?;
        Ok(Self { link_dir })
    }

    /// Directory holding the device links
    pub fn link_dir(&self) -> &Path {
        &self.link_dir
    }
}

impl PtyFactory for NativePtyFactory {
    fn open(&self, identity: &DeviceIdentity) -> BridgeResult<Arc<dyn PtyPeer>> {
        let mut pty = PacketPty::open()?;
        let link = link_path(&self.link_dir, identity);
        pty.link(&link)?;
        log::info!(
            "{}: {} -> {}",
            identity.id(),
            link.display(),
            pty.slave_path().display()
        );
        Ok(Arc::new(pty))
    }
}
