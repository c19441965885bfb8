//! Serial chip driver families
//!
//! Every USB serial adapter speaks one of a handful of chip protocols. A
//! [`DriverFamily`] names the protocol, a [`DriverInstance`] binds it to a
//! concrete [`RawUsbDevice`]. Probing uses a table of known vendor/product
//! ids and falls back to CDC-ACM for devices exposing a CDC communications
//! interface (most 32-bit printer boards).

use core::fmt;

use crate::identity::DeviceIdentity;

/// USB interface class code for CDC communications interfaces
pub const USB_CLASS_CDC_COMM: u8 = 0x02;

/// Serial chip driver family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DriverFamily {
    /// Prolific PL2303 and variants
    Prolific,
    /// USB CDC-ACM (native USB on printer boards)
    Cdc,
    /// FTDI FT232/FT2232/FT4232
    Ftdi,
    /// WCH CH340/CH341
    Ch340,
    /// Silicon Labs CP210x
    Cp21xx,
    /// No driver known; the device cannot be talked to yet
    #[default]
    Unknown,
}

impl DriverFamily {
    /// All families, `Unknown` last
    pub const ALL: [DriverFamily; 6] = [
        DriverFamily::Prolific,
        DriverFamily::Cdc,
        DriverFamily::Ftdi,
        DriverFamily::Ch340,
        DriverFamily::Cp21xx,
        DriverFamily::Unknown,
    ];

    /// Persisted name of the family
    pub const fn name(&self) -> &'static str {
        match self {
            DriverFamily::Prolific => "Prolific",
            DriverFamily::Cdc => "CDC",
            DriverFamily::Ftdi => "FTDI",
            DriverFamily::Ch340 => "CH340",
            DriverFamily::Cp21xx => "CP21xx",
            DriverFamily::Unknown => "Unknown",
        }
    }

    /// Parse a persisted name (case-insensitive)
    ///
    /// Never fails: names that match no family yield `Unknown`.
    pub fn from_name(name: &str) -> DriverFamily {
        match name.trim().to_ascii_lowercase().as_str() {
            "prolific" | "pl2303" => DriverFamily::Prolific,
            "cdc" | "cdc_acm" | "cdc-acm" => DriverFamily::Cdc,
            "ftdi" => DriverFamily::Ftdi,
            "ch340" | "ch341" | "ch34x" => DriverFamily::Ch340,
            "cp21xx" | "cp210x" => DriverFamily::Cp21xx,
            _ => DriverFamily::Unknown,
        }
    }

    /// Whether the family can produce a driver instance
    pub const fn is_known(&self) -> bool {
        !matches!(self, DriverFamily::Unknown)
    }

    /// Name of the Linux kernel driver binding this chip to a tty
    pub const fn kernel_driver(&self) -> Option<&'static str> {
        match self {
            DriverFamily::Prolific => Some("pl2303"),
            DriverFamily::Cdc => Some("cdc_acm"),
            DriverFamily::Ftdi => Some("ftdi_sio"),
            DriverFamily::Ch340 => Some("ch341"),
            DriverFamily::Cp21xx => Some("cp210x"),
            DriverFamily::Unknown => None,
        }
    }
}

impl fmt::Display for DriverFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A USB device as delivered by the attach notifier
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawUsbDevice {
    /// USB vendor id
    pub vendor_id: u16,
    /// USB product id
    pub product_id: u16,
    /// Product string descriptor, if the device has one
    pub product_name: Option<String>,
    /// Serial number string descriptor, if the device has one
    pub serial_number: Option<String>,
    /// Raw bus name (bus/address or OS path)
    pub bus_name: String,
    /// Class codes of the device's interfaces
    pub interface_classes: Vec<u8>,
}

impl RawUsbDevice {
    /// Create a device with no string descriptors and no interfaces
    pub fn new(vendor_id: u16, product_id: u16, bus_name: impl Into<String>) -> Self {
        Self {
            vendor_id,
            product_id,
            product_name: None,
            serial_number: None,
            bus_name: bus_name.into(),
            interface_classes: Vec::new(),
        }
    }

    /// Set the product string
    #[must_use]
    pub fn with_product(mut self, product: impl Into<String>) -> Self {
        self.product_name = Some(product.into());
        self
    }

    /// Set the serial number string
    #[must_use]
    pub fn with_serial(mut self, serial: impl Into<String>) -> Self {
        self.serial_number = Some(serial.into());
        self
    }

    /// Set the interface class codes
    #[must_use]
    pub fn with_interface_classes(mut self, classes: &[u8]) -> Self {
        self.interface_classes = classes.to_vec();
        self
    }

    /// Vendor/product identity
    pub fn identity(&self) -> DeviceIdentity {
        DeviceIdentity::new(self.vendor_id, self.product_id)
    }

    /// Product name if available, else the raw bus name
    pub fn display_name(&self) -> &str {
        self.product_name.as_deref().unwrap_or(&self.bus_name)
    }

    fn has_cdc_interface(&self) -> bool {
        self.interface_classes.contains(&USB_CLASS_CDC_COMM)
    }
}

/// A driver family bound to a concrete USB device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverInstance {
    family: DriverFamily,
    device: RawUsbDevice,
}

impl DriverInstance {
    /// The family this driver speaks (never `Unknown`)
    pub fn family(&self) -> DriverFamily {
        self.family
    }

    /// The USB device this driver talks to
    pub fn device(&self) -> &RawUsbDevice {
        &self.device
    }
}

/// Known USB serial adapter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KnownDevice {
    /// USB vendor id
    pub vendor_id: u16,
    /// USB product id
    pub product_id: u16,
    /// Driver family
    pub family: DriverFamily,
    /// Human readable name
    pub name: &'static str,
}

const fn known(
    vendor_id: u16,
    product_id: u16,
    family: DriverFamily,
    name: &'static str,
) -> KnownDevice {
    KnownDevice {
        vendor_id,
        product_id,
        family,
        name,
    }
}

/// Vendor/product ids recognized by [`probe`]
pub const KNOWN_DEVICES: &[KnownDevice] = &[
    known(0x0403, 0x6001, DriverFamily::Ftdi, "FTDI FT232R"),
    known(0x0403, 0x6010, DriverFamily::Ftdi, "FTDI FT2232H"),
    known(0x0403, 0x6011, DriverFamily::Ftdi, "FTDI FT4232H"),
    known(0x0403, 0x6014, DriverFamily::Ftdi, "FTDI FT232H"),
    known(0x0403, 0x6015, DriverFamily::Ftdi, "FTDI FT231X"),
    known(0x1A86, 0x7523, DriverFamily::Ch340, "WCH CH340"),
    known(0x1A86, 0x5523, DriverFamily::Ch340, "WCH CH341"),
    known(0x10C4, 0xEA60, DriverFamily::Cp21xx, "Silicon Labs CP2102"),
    known(0x10C4, 0xEA70, DriverFamily::Cp21xx, "Silicon Labs CP2105"),
    known(0x10C4, 0xEA71, DriverFamily::Cp21xx, "Silicon Labs CP2108"),
    known(0x067B, 0x2303, DriverFamily::Prolific, "Prolific PL2303"),
    known(0x067B, 0x23A3, DriverFamily::Prolific, "Prolific PL2303GC"),
    known(0x067B, 0x23C3, DriverFamily::Prolific, "Prolific PL2303GT"),
    known(0x067B, 0x23D3, DriverFamily::Prolific, "Prolific PL2303GL"),
    // Printer boards with native USB
    known(0x2341, 0x0010, DriverFamily::Cdc, "Arduino Mega 2560"),
    known(0x2341, 0x0042, DriverFamily::Cdc, "Arduino Mega 2560 R3"),
    known(0x2341, 0x0043, DriverFamily::Cdc, "Arduino Uno R3"),
    known(0x2C99, 0x0002, DriverFamily::Cdc, "Prusa i3 MK3"),
    known(0x0483, 0x5740, DriverFamily::Cdc, "STM32 Virtual COM Port"),
    known(0x1D50, 0x6015, DriverFamily::Cdc, "Smoothieboard"),
    known(0x1D50, 0x614E, DriverFamily::Cdc, "Klipper USB"),
    known(0x1EAF, 0x0004, DriverFamily::Cdc, "Maple/LeafLabs"),
];

/// Look up a vendor/product id in [`KNOWN_DEVICES`]
pub fn find_known_device(vendor_id: u16, product_id: u16) -> Option<&'static KnownDevice> {
    KNOWN_DEVICES
        .iter()
        .find(|d| d.vendor_id == vendor_id && d.product_id == product_id)
}

/// Probe a USB device for a driver
///
/// Returns `None` when neither the id table nor the interface classes
/// identify a serial chip.
pub fn probe(device: &RawUsbDevice) -> Option<DriverInstance> {
    let family = match find_known_device(device.vendor_id, device.product_id) {
        Some(known) => known.family,
        None if device.has_cdc_interface() => DriverFamily::Cdc,
        None => return None,
    };
    log::debug!(
        "Probed {} ({}) as {}",
        device.identity(),
        device.display_name(),
        family
    );
    instantiate(family, device)
}

/// Family of a probe result, `Unknown` if probing failed
pub fn classify(probe_result: Option<&DriverInstance>) -> DriverFamily {
    probe_result.map_or(DriverFamily::Unknown, DriverInstance::family)
}

/// Build a driver of the given family for a device
///
/// Returns `None` for `Unknown`.
pub fn instantiate(family: DriverFamily, device: &RawUsbDevice) -> Option<DriverInstance> {
    let factory: fn(&RawUsbDevice) -> DriverInstance = match family {
        DriverFamily::Prolific => prolific,
        DriverFamily::Cdc => cdc,
        DriverFamily::Ftdi => ftdi,
        DriverFamily::Ch340 => ch340,
        DriverFamily::Cp21xx => cp21xx,
        DriverFamily::Unknown => return None,
    };
    Some(factory(device))
}

fn bind(family: DriverFamily, device: &RawUsbDevice) -> DriverInstance {
    DriverInstance {
        family,
        device: device.clone(),
    }
}

fn prolific(device: &RawUsbDevice) -> DriverInstance {
    bind(DriverFamily::Prolific, device)
}

fn cdc(device: &RawUsbDevice) -> DriverInstance {
    bind(DriverFamily::Cdc, device)
}

fn ftdi(device: &RawUsbDevice) -> DriverInstance {
    bind(DriverFamily::Ftdi, device)
}

fn ch340(device: &RawUsbDevice) -> DriverInstance {
    bind(DriverFamily::Ch340, device)
}

fn cp21xx(device: &RawUsbDevice) -> DriverInstance {
    bind(DriverFamily::Cp21xx, device)
}
