//! Per-device record and connection state

use std::fmt;

use usbpty_core::driver::{classify, instantiate, probe, DriverFamily, DriverInstance, RawUsbDevice};
use usbpty_core::error::{BridgeError, Result};
use usbpty_core::identity::DeviceIdentity;
use usbpty_core::packet::ControlPacket;
use usbpty_core::prefs::PreferenceStore;

use crate::session::SerialSession;

/// Connection state of a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeviceState {
    /// Not connected; the initial and terminal state
    #[default]
    Disconnected,
    /// A permission request is outstanding
    AwaitingPermission,
    /// Accepting packets from the pty peer
    Connected,
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DeviceState::Disconnected => "disconnected",
            DeviceState::AwaitingPermission => "awaiting permission",
            DeviceState::Connected => "connected",
        })
    }
}

/// Point-in-time view of a device for observers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceStatus {
    /// Device id (`vendor:product` in decimal)
    pub id: String,
    /// Product name or bus name
    pub name: String,
    /// Active driver family
    pub family: DriverFamily,
    /// Connection state
    pub state: DeviceState,
    /// Auto-connect preference
    pub auto_connect: bool,
    /// Last speed code the port was opened with, -1 if never
    pub last_baud: i32,
    /// Whether an OS serial handle is open
    pub port_open: bool,
}

/// A known USB serial device
pub struct SerialDevice {
    identity: DeviceIdentity,
    raw: RawUsbDevice,
    family: DriverFamily,
    driver: Option<DriverInstance>,
    state: DeviceState,
    auto_connect: bool,
    last_negotiated_baud: i32,
    session: Option<SerialSession>,
}

impl SerialDevice {
    /// Build the record for a newly attached device
    ///
    /// A persisted driver override takes precedence over probing.
    pub fn new(raw: RawUsbDevice, prefs: &dyn PreferenceStore) -> Self {
        let identity = raw.identity();
        let overridden = prefs
            .driver_override(&identity)
            .map(|name| DriverFamily::from_name(&name))
            .filter(DriverFamily::is_known);

        let (family, driver) = match overridden {
            Some(family) => {
                log::debug!("{}: using driver override {}", identity.id(), family);
                (family, instantiate(family, &raw))
            }
            None => {
                let probed = probe(&raw);
                (classify(probed.as_ref()), probed)
            }
        };

        Self {
            auto_connect: prefs.auto_connect(&identity),
            identity,
            raw,
            family,
            driver,
            state: DeviceState::Disconnected,
            last_negotiated_baud: -1,
            session: None,
        }
    }

    /// Vendor/product identity
    pub fn identity(&self) -> DeviceIdentity {
        self.identity
    }

    /// Device id used as registry key
    pub fn id(&self) -> String {
        self.identity.id()
    }

    /// Product name, else bus name
    pub fn name(&self) -> &str {
        self.raw.display_name()
    }

    /// The USB device as attached
    pub fn raw(&self) -> &RawUsbDevice {
        &self.raw
    }

    /// Active driver family
    pub fn family(&self) -> DriverFamily {
        self.family
    }

    /// Driver instance for the active family
    pub fn driver(&self) -> Option<&DriverInstance> {
        self.driver.as_ref()
    }

    /// Connection state
    pub fn state(&self) -> DeviceState {
        self.state
    }

    /// Whether the device is connected
    pub fn is_connected(&self) -> bool {
        self.state == DeviceState::Connected
    }

    /// Auto-connect preference
    pub fn auto_connect(&self) -> bool {
        self.auto_connect
    }

    /// Last speed code the port was opened with, -1 if never
    pub fn last_negotiated_baud(&self) -> i32 {
        self.last_negotiated_baud
    }

    /// Whether an OS serial handle is open
    pub fn port_open(&self) -> bool {
        self.session.as_ref().is_some_and(SerialSession::is_open)
    }

    /// Session of the connected device
    pub fn session(&self) -> Option<&SerialSession> {
        self.session.as_ref()
    }

    /// Switch the driver family
    ///
    /// Rejected with [`BridgeError::DriverChangeWhileConnected`] while
    /// connected. A known family is persisted as override, `Unknown` clears
    /// the override.
    pub fn set_driver_family(
        &mut self,
        family: DriverFamily,
        prefs: &dyn PreferenceStore,
    ) -> Result<()> {
        if self.is_connected() {
            return Err(BridgeError::DriverChangeWhileConnected(self.id()));
        }

        let name = family.is_known().then(|| family.name());
        prefs.set_driver_override(&self.identity, name)?;

        self.family = family;
        self.driver = instantiate(family, &self.raw);
        log::info!("{}: driver set to {}", self.id(), family);
        Ok(())
    }

    /// Enable or disable auto-connect and persist it
    pub fn set_auto_connect(&mut self, enabled: bool, prefs: &dyn PreferenceStore) -> Result<()> {
        prefs.set_auto_connect(&self.identity, enabled)?;
        self.auto_connect = enabled;
        Ok(())
    }

    /// Reopen the port if `packet` requires it
    pub fn ensure_open(&mut self, packet: &ControlPacket) -> Result<bool> {
        let session = self
            .session
            .as_mut()
            .ok_or_else(|| BridgeError::NotConnected(self.identity.id()))?;
        session.ensure_open(self.driver.as_ref(), &mut self.last_negotiated_baud, packet)
    }

    /// Forward the payload of `packet` to the port
    pub fn forward_payload(&mut self, packet: &ControlPacket) -> Result<()> {
        let session = self
            .session
            .as_mut()
            .ok_or_else(|| BridgeError::NotConnected(self.identity.id()))?;
        session.forward_payload(packet)
    }

    /// Process one packet from the pty peer
    pub fn handle_packet(&mut self, packet: &ControlPacket) -> Result<()> {
        if !self.is_connected() {
            return Err(BridgeError::NotConnected(self.id()));
        }
        log::trace!(
            "{}: packet {:?} speed {} payload {} bytes",
            self.identity.id(),
            packet.flags(),
            packet.requested_baud(),
            packet.payload().len()
        );
        self.ensure_open(packet)?;
        self.forward_payload(packet)
    }

    /// Snapshot for observers
    pub fn status(&self) -> DeviceStatus {
        DeviceStatus {
            id: self.id(),
            name: self.name().to_string(),
            family: self.family,
            state: self.state,
            auto_connect: self.auto_connect,
            last_baud: self.last_negotiated_baud,
            port_open: self.port_open(),
        }
    }

    pub(crate) fn set_awaiting_permission(&mut self) {
        self.state = DeviceState::AwaitingPermission;
    }

    pub(crate) fn begin_session(&mut self, session: SerialSession) {
        self.session = Some(session);
        self.state = DeviceState::Connected;
    }

    /// Move to `Disconnected`, handing back the session for teardown
    pub(crate) fn end_session(&mut self) -> Option<SerialSession> {
        self.state = DeviceState::Disconnected;
        self.session.take()
    }
}

impl fmt::Debug for SerialDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SerialDevice")
            .field("id", &self.id())
            .field("name", &self.name())
            .field("family", &self.family)
            .field("state", &self.state)
            .field("auto_connect", &self.auto_connect)
            .field("last_negotiated_baud", &self.last_negotiated_baud)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use usbpty_core::prefs::MemoryPreferences;

    #[test]
    fn test_probe_on_construction() {
        let prefs = MemoryPreferences::new();
        let device = SerialDevice::new(
            RawUsbDevice::new(0x0403, 0x6001, "1-3").with_product("FT232R USB UART"),
            &prefs,
        );
        assert_eq!(device.id(), "1027:24577");
        assert_eq!(device.family(), DriverFamily::Ftdi);
        assert_eq!(device.name(), "FT232R USB UART");
        assert_eq!(device.state(), DeviceState::Disconnected);
        assert_eq!(device.last_negotiated_baud(), -1);
        assert!(!device.port_open());
    }

    #[test]
    fn test_override_wins_over_probe() {
        let prefs = MemoryPreferences::new();
        let raw = RawUsbDevice::new(0x1234, 0x5678, "2-1");
        prefs.set_driver_override(&raw.identity(), Some("ch341")).unwrap();

        let device = SerialDevice::new(raw, &prefs);
        assert_eq!(device.family(), DriverFamily::Ch340);
        assert_eq!(device.driver().map(DriverInstance::family), Some(DriverFamily::Ch340));
    }

    #[test]
    fn test_garbage_override_falls_back_to_probe() {
        let prefs = MemoryPreferences::new();
        let raw = RawUsbDevice::new(0x10C4, 0xEA60, "2-1");
        prefs.set_driver_override(&raw.identity(), Some("not-a-driver")).unwrap();

        let device = SerialDevice::new(raw, &prefs);
        assert_eq!(device.family(), DriverFamily::Cp21xx);
    }

    #[test]
    fn test_set_driver_family_persists() {
        let prefs = MemoryPreferences::new();
        let raw = RawUsbDevice::new(0x1234, 0x5678, "2-1");
        let ident = raw.identity();
        let mut device = SerialDevice::new(raw, &prefs);
        assert_eq!(device.family(), DriverFamily::Unknown);
        assert!(device.driver().is_none());

        device.set_driver_family(DriverFamily::Cdc, &prefs).unwrap();
        assert_eq!(device.family(), DriverFamily::Cdc);
        assert!(device.driver().is_some());
        assert_eq!(prefs.driver_override(&ident).as_deref(), Some("CDC"));

        device.set_driver_family(DriverFamily::Unknown, &prefs).unwrap();
        assert!(device.driver().is_none());
        assert_eq!(prefs.driver_override(&ident), None);
    }

    #[test]
    fn test_auto_connect_from_prefs() {
        let prefs = MemoryPreferences::new();
        let raw = RawUsbDevice::new(0x2C99, 0x0002, "1-1");
        prefs.set_auto_connect(&raw.identity(), true).unwrap();

        let mut device = SerialDevice::new(raw, &prefs);
        assert!(device.auto_connect());
        device.set_auto_connect(false, &prefs).unwrap();
        assert!(!prefs.auto_connect(&device.identity()));
    }

    #[test]
    fn test_packet_needs_connection() {
        let prefs = MemoryPreferences::new();
        let mut device = SerialDevice::new(RawUsbDevice::new(0x0403, 0x6001, "1-1"), &prefs);
        let packet = ControlPacket::decode(vec![1], 115200, Default::default()).unwrap();
        assert!(matches!(
            device.handle_packet(&packet),
            Err(BridgeError::NotConnected(_))
        ));
    }
}
