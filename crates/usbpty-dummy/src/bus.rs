//! Several emulated printers on one bus

use std::collections::BTreeMap;
use std::sync::Mutex;

use usbpty_core::driver::DriverInstance;
use usbpty_core::error::PortResult;
use usbpty_core::identity::DeviceIdentity;
use usbpty_core::platform::{SerialHandle, UsbPlatform};

use crate::platform::{DummyConfig, DummyPlatform};

/// [`UsbPlatform`] with one [`DummyPlatform`] per device identity
///
/// Printers are created on first use, so a test can grab a device's
/// printer before or after the bridge opens it.
#[derive(Debug, Default)]
pub struct DummyBus {
    config: DummyConfig,
    printers: Mutex<BTreeMap<DeviceIdentity, DummyPlatform>>,
}

impl DummyBus {
    /// Create a bus whose printers use `config`
    pub fn new(config: DummyConfig) -> Self {
        Self {
            config,
            printers: Mutex::default(),
        }
    }

    /// The printer behind `identity`
    pub fn printer(&self, identity: &DeviceIdentity) -> DummyPlatform {
        self.printers
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .entry(*identity)
            .or_insert_with(|| DummyPlatform::new(self.config.clone()))
            .clone()
    }
}

impl UsbPlatform for DummyBus {
    fn open(&self, driver: &DriverInstance) -> PortResult<Box<dyn SerialHandle>> {
        self.printer(&driver.device().identity()).open(driver)
    }
}
