//! Driver family listing

use usbpty_core::driver::{DriverFamily, KNOWN_DEVICES};

/// Print the driver families and the known adapter table
pub fn list_drivers() {
    println!("Driver families:");
    println!();
    for family in DriverFamily::ALL {
        match family.kernel_driver() {
            Some(module) => println!("  {:<9} - kernel driver {}", family.name(), module),
            None => println!("  {:<9} - no driver, device stays unusable", family.name()),
        }
    }

    println!();
    println!("Known adapters:");
    println!();
    println!("{:<11} {:<9} {}", "VID:PID", "Driver", "Name");
    println!("{}", "-".repeat(50));
    for device in KNOWN_DEVICES {
        println!(
            "{:04x}:{:04x}   {:<9} {}",
            device.vendor_id,
            device.product_id,
            device.family.name(),
            device.name
        );
    }
    println!();
    println!("Other devices with a CDC interface use the CDC driver.");
}
