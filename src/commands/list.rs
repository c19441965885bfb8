//! Device listing

use usbpty_bridge::SerialDevice;
use usbpty_core::prefs::PreferenceStore;
use usbpty_serial::{find_port, list_devices as list_usb_devices};

/// Print the attached serial adapters with their driver and tty node
pub fn list_devices(prefs: &dyn PreferenceStore) -> Result<(), Box<dyn std::error::Error>> {
    let devices = list_usb_devices()?;
    if devices.is_empty() {
        println!("No USB serial adapters found.");
        return Ok(());
    }

    println!(
        "{:<13} {:<11} {:<9} {:<5} {:<14} {}",
        "ID", "VID:PID", "Driver", "Auto", "Port", "Name"
    );
    println!("{}", "-".repeat(72));
    for raw in devices {
        let port = find_port(&raw).unwrap_or_else(|_| "-".to_string());
        let vid_pid = format!("{:04x}:{:04x}", raw.vendor_id, raw.product_id);
        let device = SerialDevice::new(raw, prefs);
        println!(
            "{:<13} {:<11} {:<9} {:<5} {:<14} {}",
            device.id(),
            vid_pid,
            device.family().name(),
            if device.auto_connect() { "yes" } else { "no" },
            port,
            device.name()
        );
    }
    Ok(())
}
