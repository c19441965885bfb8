//! Preference editing commands

use usbpty_core::driver::DriverFamily;
use usbpty_core::identity::DeviceIdentity;
use usbpty_core::prefs::{PreferenceStore, TomlPreferences};

/// Names that clear a driver override
const CLEAR_NAMES: &[&str] = &["unknown", "none", "auto"];

/// Persist the driver family of a device
///
/// `Unknown` (or `none`/`auto`) removes the override so the device is
/// probed again on its next attach.
pub fn set_driver(
    prefs: &TomlPreferences,
    device: &DeviceIdentity,
    name: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let family = DriverFamily::from_name(name);
    if !family.is_known() && !CLEAR_NAMES.contains(&name.trim().to_ascii_lowercase().as_str()) {
        let names: Vec<&str> = DriverFamily::ALL.iter().map(|f| f.name()).collect();
        return Err(format!(
            "Unknown driver family '{}'. Available: {}",
            name,
            names.join(", ")
        )
        .into());
    }

    if family.is_known() {
        prefs.set_driver_override(device, Some(family.name()))?;
        println!("{}: driver set to {}", device.id(), family);
    } else {
        prefs.set_driver_override(device, None)?;
        println!("{}: driver override cleared", device.id());
    }
    println!("Saved to {}", prefs.path().display());
    Ok(())
}

/// Persist the auto-connect flag of a device
pub fn set_auto_connect(
    prefs: &TomlPreferences,
    device: &DeviceIdentity,
    enabled: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    prefs.set_auto_connect(device, enabled)?;
    println!(
        "{}: auto-connect {}",
        device.id(),
        if enabled { "on" } else { "off" }
    );
    println!("Saved to {}", prefs.path().display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn temp_prefs(name: &str) -> (PathBuf, TomlPreferences) {
        let path = std::env::temp_dir().join(format!(
            "usbpty-cli-{}-{}.toml",
            name,
            std::process::id()
        ));
        let _ = std::fs::remove_file(&path);
        let prefs = TomlPreferences::open(&path).unwrap();
        (path, prefs)
    }

    #[test]
    fn test_set_and_clear_driver() {
        let (path, prefs) = temp_prefs("driver");
        let device = DeviceIdentity::new(0x1A86, 0x7523);

        set_driver(&prefs, &device, "ch341").unwrap();
        assert_eq!(prefs.driver_override(&device).as_deref(), Some("CH340"));

        set_driver(&prefs, &device, "Unknown").unwrap();
        assert_eq!(prefs.driver_override(&device), None);

        assert!(set_driver(&prefs, &device, "ft232").is_err());
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn test_auto_connect_persists() {
        let (path, prefs) = temp_prefs("auto");
        let device = DeviceIdentity::new(0x0403, 0x6001);

        set_auto_connect(&prefs, &device, true).unwrap();
        let reopened = TomlPreferences::open(&path).unwrap();
        assert!(reopened.auto_connect(&device));
        assert_eq!(reopened.auto_connect_ids(), vec!["1027:24577".to_string()]);
        let _ = std::fs::remove_file(path);
    }
}
