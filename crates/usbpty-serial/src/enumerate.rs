//! USB enumeration and hotplug
//!
//! Lists USB devices with `nusb` and turns them into [`RawUsbDevice`]s.
//! Only devices that look like serial adapters are reported: devices the
//! probe table knows, devices with a CDC communications interface, and
//! devices with a vendor-specific interface (which may need a manual driver
//! choice).

use std::collections::HashMap;
use std::thread::{self, JoinHandle};

use nusb::hotplug::HotplugEvent;
use nusb::{DeviceId, DeviceInfo, MaybeFuture};
use usbpty_core::driver::{probe, RawUsbDevice, USB_CLASS_CDC_COMM};

use crate::error::{Result, SerialError};

/// Interface class of vendor-specific interfaces
pub const USB_CLASS_VENDOR_SPECIFIC: u8 = 0xFF;

/// A change reported by [`watch_devices`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UsbChange {
    /// A serial candidate appeared
    Attached(RawUsbDevice),
    /// The device with this id went away
    Detached(String),
}

/// Build the raw device description from nusb's device info
pub fn raw_device(info: &DeviceInfo) -> RawUsbDevice {
    let classes: Vec<u8> = info.interfaces().map(|i| i.class()).collect();
    let mut raw = RawUsbDevice::new(
        info.vendor_id(),
        info.product_id(),
        format!("{}-{}", info.bus_id(), info.device_address()),
    )
    .with_interface_classes(&classes);
    if let Some(product) = info.product_string() {
        raw = raw.with_product(product);
    }
    if let Some(serial) = info.serial_number() {
        raw = raw.with_serial(serial);
    }
    raw
}

/// Whether a device is worth offering to the bridge
pub fn is_serial_candidate(raw: &RawUsbDevice) -> bool {
    probe(raw).is_some()
        || raw
            .interface_classes
            .iter()
            .any(|&c| c == USB_CLASS_CDC_COMM || c == USB_CLASS_VENDOR_SPECIFIC)
}

/// List attached serial candidates
pub fn list_devices() -> Result<Vec<RawUsbDevice>> {
    let devices = nusb::list_devices()
        .wait()
        .map_err(|e| SerialError::Usb(e.to_string()))?
        .map(|info| raw_device(&info))
        .filter(is_serial_candidate)
        .collect();
    Ok(devices)
}

/// Report attached serial candidates, then keep reporting changes
///
/// `on_change` first receives an `Attached` for every device present now,
/// then runs on a background thread for every later attach or detach.
pub fn watch_devices(
    mut on_change: impl FnMut(UsbChange) + Send + 'static,
) -> Result<JoinHandle<()>> {
    // Subscribe before listing so nothing slips through in between
    let watch = nusb::watch_devices().map_err(|e| SerialError::Usb(e.to_string()))?;

    let mut known: HashMap<DeviceId, String> = HashMap::new();
    for info in nusb::list_devices()
        .wait()
        .map_err(|e| SerialError::Usb(e.to_string()))?
    {
        let raw = raw_device(&info);
        if is_serial_candidate(&raw) {
            known.insert(info.id(), raw.identity().id());
            on_change(UsbChange::Attached(raw));
        }
    }
    log::debug!("Found {} serial candidate(s), watching for hotplug", known.len());

    let thread = thread::spawn(move || {
        for event in futures_lite::stream::block_on(Box::pin(watch)) {
            match event {
                HotplugEvent::Connected(info) => {
                    if known.contains_key(&info.id()) {
                        continue;
                    }
                    let raw = raw_device(&info);
                    if is_serial_candidate(&raw) {
                        known.insert(info.id(), raw.identity().id());
                        on_change(UsbChange::Attached(raw));
                    } else {
                        log::trace!(
                            "Ignoring USB device {:04x}:{:04x}",
                            raw.vendor_id,
                            raw.product_id
                        );
                    }
                }
                HotplugEvent::Disconnected(id) => {
                    if let Some(device) = known.remove(&id) {
                        on_change(UsbChange::Detached(device));
                    }
                }
            }
        }
        log::debug!("Hotplug watch ended");
    });
    Ok(thread)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_candidates() {
        assert!(is_serial_candidate(&RawUsbDevice::new(0x0403, 0x6001, "1-1")));
        assert!(is_serial_candidate(
            &RawUsbDevice::new(0x1234, 0x0001, "1-2").with_interface_classes(&[0x02, 0x0A])
        ));
        assert!(is_serial_candidate(
            &RawUsbDevice::new(0x1234, 0x0002, "1-3").with_interface_classes(&[0xFF])
        ));
        // Keyboard
        assert!(!is_serial_candidate(
            &RawUsbDevice::new(0x046D, 0xC31C, "1-4").with_interface_classes(&[0x03, 0x03])
        ));
    }
}
