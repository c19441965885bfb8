//! Preference stores
//!
//! Two preferences are kept per device identity: whether to connect as soon
//! as the device is attached, and a user-selected driver family overriding
//! the probed one. The bridge sees them through [`PreferenceStore`].
//!
//! [`TomlPreferences`] keeps them in a TOML file:
//!
//! ```toml
//! auto_connect = ["1027:24577"]
//!
//! [driver_override]
//! "6790:29987" = "CH340"
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, Result};
use crate::identity::DeviceIdentity;

/// Persistent per-device preferences
pub trait PreferenceStore: Send + Sync {
    /// Whether the device connects automatically on attach
    fn auto_connect(&self, identity: &DeviceIdentity) -> bool;

    /// Enable or disable auto-connect for a device
    fn set_auto_connect(&self, identity: &DeviceIdentity, enabled: bool) -> Result<()>;

    /// Persisted driver family name for a device, if overridden
    fn driver_override(&self, identity: &DeviceIdentity) -> Option<String>;

    /// Set (`Some`) or clear (`None`) the driver override for a device
    fn set_driver_override(&self, identity: &DeviceIdentity, name: Option<&str>) -> Result<()>;
}

/// Contents of the preference file
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
struct Preferences {
    #[serde(default)]
    auto_connect: BTreeSet<String>,
    #[serde(default)]
    driver_override: BTreeMap<String, String>,
}

impl Preferences {
    fn set_auto_connect(&mut self, identity: &DeviceIdentity, enabled: bool) {
        if enabled {
            self.auto_connect.insert(identity.id());
        } else {
            self.auto_connect.remove(&identity.id());
        }
    }

    fn set_driver_override(&mut self, identity: &DeviceIdentity, name: Option<&str>) {
        match name {
            Some(name) => {
                self.driver_override.insert(identity.id(), name.to_string());
            }
            None => {
                self.driver_override.remove(&identity.id());
            }
        }
    }
}

fn lock(prefs: &Mutex<Preferences>) -> MutexGuard<'_, Preferences> {
    prefs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// In-memory preference store
#[derive(Debug, Default)]
pub struct MemoryPreferences {
    prefs: Mutex<Preferences>,
}

impl MemoryPreferences {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }
}

impl PreferenceStore for MemoryPreferences {
    fn auto_connect(&self, identity: &DeviceIdentity) -> bool {
        lock(&self.prefs).auto_connect.contains(&identity.id())
    }

    fn set_auto_connect(&self, identity: &DeviceIdentity, enabled: bool) -> Result<()> {
        lock(&self.prefs).set_auto_connect(identity, enabled);
        Ok(())
    }

    fn driver_override(&self, identity: &DeviceIdentity) -> Option<String> {
        lock(&self.prefs).driver_override.get(&identity.id()).cloned()
    }

    fn set_driver_override(&self, identity: &DeviceIdentity, name: Option<&str>) -> Result<()> {
        lock(&self.prefs).set_driver_override(identity, name);
        Ok(())
    }
}

/// Preference store backed by a TOML file
///
/// The file is read once when opened and rewritten after every change.
#[derive(Debug)]
pub struct TomlPreferences {
    path: PathBuf,
    prefs: Mutex<Preferences>,
}

impl TomlPreferences {
    /// Open the store at `path`; a missing file is an empty store
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let prefs = match fs::read_to_string(&path) {
            Ok(text) => toml::from_str(&text).map_err(|e| {
                BridgeError::Preferences(format!("failed to parse {}: {}", path.display(), e))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::debug!("No preference file at {}, starting empty", path.display());
                Preferences::default()
            }
            Err(e) => {
                return Err(BridgeError::Preferences(format!(
                    "failed to read {}: {}",
                    path.display(),
                    e
                )))
            }
        };
        Ok(Self {
            path,
            prefs: Mutex::new(prefs),
        })
    }

    /// Location of the preference file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Identities with auto-connect enabled
    pub fn auto_connect_ids(&self) -> Vec<String> {
        lock(&self.prefs).auto_connect.iter().cloned().collect()
    }

    /// All driver overrides as `(id, family name)` pairs
    pub fn driver_overrides(&self) -> Vec<(String, String)> {
        lock(&self.prefs)
            .driver_override
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Apply `change` and save; the stored value only changes if the save succeeds
    fn update(&self, change: impl FnOnce(&mut Preferences)) -> Result<()> {
        let mut prefs = lock(&self.prefs);
        let mut next = prefs.clone();
        change(&mut next);
        self.save(&next)?;
        *prefs = next;
        Ok(())
    }

    fn save(&self, prefs: &Preferences) -> Result<()> {
        let text = toml::to_string_pretty(prefs)
            .map_err(|e| BridgeError::Preferences(format!("failed to serialize: {}", e)))?;

        if let Some(dir) = self.path.parent() {
            if !dir.as_os_str().is_empty() {
                fs::create_dir_all(dir).map_err(|e| {
                    BridgeError::Preferences(format!("failed to create {}: {}", dir.display(), e))
                })?;
            }
        }

        let tmp = self.path.with_extension("toml.tmp");
        fs::write(&tmp, text)
            .and_then(|()| fs::rename(&tmp, &self.path))
            .map_err(|e| {
                BridgeError::Preferences(format!("failed to write {}: {}", self.path.display(), e))
            })?;
        log::debug!("Saved preferences to {}", self.path.display());
        Ok(())
    }
}

impl PreferenceStore for TomlPreferences {
    fn auto_connect(&self, identity: &DeviceIdentity) -> bool {
        lock(&self.prefs).auto_connect.contains(&identity.id())
    }

    fn set_auto_connect(&self, identity: &DeviceIdentity, enabled: bool) -> Result<()> {
        self.update(|prefs| prefs.set_auto_connect(identity, enabled))
    }

    fn driver_override(&self, identity: &DeviceIdentity) -> Option<String> {
        lock(&self.prefs).driver_override.get(&identity.id()).cloned()
    }

    fn set_driver_override(&self, identity: &DeviceIdentity, name: Option<&str>) -> Result<()> {
        self.update(|prefs| prefs.set_driver_override(identity, name))
    }
}
