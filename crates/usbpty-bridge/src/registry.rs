//! Registry of attached devices
//!
//! The registry maps device ids to [`DeviceSlot`]s. The map itself is
//! copy-on-write: every change builds a new map and swaps it in, so
//! [`BridgeRegistry::snapshot`] always returns a consistent view. Operations
//! on one device are serialized by the slot's operation lock; operations on
//! different devices run concurrently.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, TryRecvError};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use usbpty_core::driver::{DriverFamily, RawUsbDevice};
use usbpty_core::error::{BridgeError, Result};
use usbpty_core::identity::DeviceIdentity;
use usbpty_core::platform::{PermissionAuthority, PtyFactory, UsbPlatform};
use usbpty_core::prefs::PreferenceStore;

use crate::device::{DeviceState, DeviceStatus, SerialDevice};
use crate::event::{BridgeEvent, EventSender};
use crate::lock;
use crate::session::SerialSession;
use crate::worker::PtyWorker;

/// Upper bound for one write to a serial handle
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_millis(2000);

/// How long a pty worker waits for a frame before checking for cancellation
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Registry settings
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Upper bound for one write to a serial handle
    pub write_timeout: Duration,
    /// Pty receive poll interval
    pub poll_interval: Duration,
    /// Connect every attached device, not only auto-connect ones
    pub connect_all: bool,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            connect_all: false,
        }
    }
}

/// Everything outside the bridge the registry talks to
#[derive(Clone)]
pub struct Collaborators {
    /// Opens serial handles
    pub platform: Arc<dyn UsbPlatform>,
    /// Opens one pty peer per connected device
    pub ptys: Arc<dyn PtyFactory>,
    /// Grants device access
    pub permissions: Arc<dyn PermissionAuthority>,
    /// Auto-connect and driver override storage
    pub prefs: Arc<dyn PreferenceStore>,
}

/// Registry entry of one device
pub struct DeviceSlot {
    identity: DeviceIdentity,
    id: String,
    ops: Mutex<()>,
    device: Arc<Mutex<SerialDevice>>,
    worker: Mutex<Option<PtyWorker>>,
    removed: AtomicBool,
}

impl DeviceSlot {
    fn new(device: SerialDevice) -> Self {
        Self {
            identity: device.identity(),
            id: device.id(),
            ops: Mutex::new(()),
            device: Arc::new(Mutex::new(device)),
            worker: Mutex::new(None),
            removed: AtomicBool::new(false),
        }
    }

    /// Device id
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Vendor/product identity
    pub fn identity(&self) -> DeviceIdentity {
        self.identity
    }

    /// Current status of the device
    ///
    /// May wait for a packet of this device that is being written.
    pub fn status(&self) -> DeviceStatus {
        lock(&self.device).status()
    }

    /// Run `f` with the device locked
    pub fn with_device<R>(&self, f: impl FnOnce(&SerialDevice) -> R) -> R {
        f(&lock(&self.device))
    }

    /// Take the operation lock, failing if the slot left the registry
    fn begin(&self) -> Result<MutexGuard<'_, ()>> {
        let guard = lock(&self.ops);
        if self.removed.load(Ordering::Acquire) {
            return Err(BridgeError::UnknownDevice(self.id.clone()));
        }
        Ok(guard)
    }
}

/// Device id to slot
pub type DeviceMap = BTreeMap<String, Arc<DeviceSlot>>;

/// The set of known devices and the entry point for all device operations
pub struct BridgeRegistry {
    collab: Collaborators,
    config: BridgeConfig,
    devices: RwLock<Arc<DeviceMap>>,
    events: EventSender,
    inbox: Mutex<Receiver<BridgeEvent>>,
    shut_down: AtomicBool,
}

impl BridgeRegistry {
    /// Create an empty registry
    pub fn new(collab: Collaborators, config: BridgeConfig) -> Self {
        let (tx, rx) = mpsc::channel();
        Self {
            collab,
            config,
            devices: RwLock::new(Arc::new(DeviceMap::new())),
            events: EventSender::new(tx),
            inbox: Mutex::new(rx),
            shut_down: AtomicBool::new(false),
        }
    }

    /// Sender for notifiers and other event sources
    pub fn events(&self) -> EventSender {
        self.events.clone()
    }

    /// Registry settings
    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Consistent view of the device map
    pub fn snapshot(&self) -> Arc<DeviceMap> {
        let devices = self.devices.read().unwrap_or_else(|p| p.into_inner());
        Arc::clone(&devices)
    }

    /// Status of every known device, ordered by id
    pub fn status(&self) -> Vec<DeviceStatus> {
        self.snapshot().values().map(|slot| slot.status()).collect()
    }

    /// Status of one device
    pub fn device_status(&self, id: &str) -> Option<DeviceStatus> {
        self.snapshot().get(id).map(|slot| slot.status())
    }

    /// Whether [`BridgeRegistry::shutdown`] ran
    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    fn check_running(&self) -> Result<()> {
        if self.is_shut_down() {
            Err(BridgeError::ShutDown)
        } else {
            Ok(())
        }
    }

    fn slot(&self, id: &str) -> Result<Arc<DeviceSlot>> {
        self.snapshot()
            .get(id)
            .cloned()
            .ok_or_else(|| BridgeError::UnknownDevice(id.to_string()))
    }

    /// Apply `change` to a copy of the map and publish it
    fn update_map<R>(&self, change: impl FnOnce(&mut DeviceMap) -> R) -> R {
        let mut devices = self.devices.write().unwrap_or_else(|p| p.into_inner());
        let mut map = DeviceMap::clone(&devices);
        let result = change(&mut map);
        *devices = Arc::new(map);
        result
    }

    /// Register a newly attached device
    ///
    /// The device is classified and connected right away when auto-connect
    /// is set for it (or for every device). An existing record with the same
    /// id is disconnected and replaced. Returns the device id.
    pub fn attach(&self, raw: RawUsbDevice) -> Result<String> {
        self.check_running()?;

        let device = SerialDevice::new(raw, self.collab.prefs.as_ref());
        let connect = device.auto_connect() || self.config.connect_all;
        log::info!(
            "Attached {} ({}, {}), driver {}",
            device.name(),
            device.id(),
            device.identity(),
            device.family()
        );

        let slot = Arc::new(DeviceSlot::new(device));
        let id = slot.id.clone();
        let previous = self.update_map(|map| map.insert(id.clone(), Arc::clone(&slot)));
        if let Some(previous) = previous {
            log::warn!(
                "{}: another device with the same id was already attached, replacing it",
                id
            );
            let _ops = lock(&previous.ops);
            previous.removed.store(true, Ordering::Release);
            self.disconnect_locked(&previous);
        }

        if connect {
            match self.try_connect(&id) {
                Ok(state) => log::debug!("{}: auto-connect: {}", id, state),
                Err(e) => log::warn!("{}: auto-connect failed: {}", id, e),
            }
        }
        Ok(id)
    }

    /// Forget a device that went away
    ///
    /// Disconnects it first. Unknown ids are ignored.
    pub fn detach(&self, id: &str) -> Result<()> {
        self.check_running()?;

        let Ok(slot) = self.slot(id) else {
            log::debug!("Detach of unknown device {}", id);
            return Ok(());
        };
        let Ok(_ops) = slot.begin() else {
            return Ok(());
        };
        self.disconnect_locked(&slot);
        slot.removed.store(true, Ordering::Release);
        self.update_map(|map| {
            if map.get(id).is_some_and(|current| Arc::ptr_eq(current, &slot)) {
                map.remove(id);
            }
        });
        log::info!("Detached {}", id);
        Ok(())
    }

    /// Connect a device
    ///
    /// Returns the state reached: `Connected`, or `AwaitingPermission` when
    /// a permission request was issued (or is still outstanding). Fails
    /// with [`BridgeError::NoDriverSelected`] for devices without a driver.
    pub fn try_connect(&self, id: &str) -> Result<DeviceState> {
        self.check_running()?;
        let slot = self.slot(id)?;
        let _ops = slot.begin()?;
        self.connect_locked(&slot)
    }

    fn connect_locked(&self, slot: &DeviceSlot) -> Result<DeviceState> {
        let mut device = lock(&slot.device);
        if device.family() == DriverFamily::Unknown || device.driver().is_none() {
            return Err(BridgeError::NoDriverSelected(slot.id.clone()));
        }

        match device.state() {
            DeviceState::Connected => {
                log::debug!("{}: already connected", slot.id);
                return Ok(DeviceState::Connected);
            }
            DeviceState::AwaitingPermission => {
                log::debug!("{}: permission request still pending", slot.id);
                return Ok(DeviceState::AwaitingPermission);
            }
            DeviceState::Disconnected => {}
        }

        if !self.collab.permissions.has_permission(&slot.identity) {
            device.set_awaiting_permission();
            drop(device);
            log::info!("{}: requesting USB permission", slot.id);
            let reply = self.events.permission_reply(slot.identity.numeric_id());
            self.collab.permissions.request_permission(&slot.identity, reply);
            return Ok(DeviceState::AwaitingPermission);
        }

        let peer = self.collab.ptys.open(&slot.identity)?;
        device.begin_session(SerialSession::new(
            slot.id.clone(),
            Arc::clone(&self.collab.platform),
            Arc::clone(&peer),
            self.events.clone(),
            self.config.write_timeout,
        ));
        let family = device.family();
        drop(device);

        let worker = PtyWorker::spawn(
            slot.id.clone(),
            Arc::clone(&slot.device),
            peer,
            self.config.poll_interval,
        );
        *lock(&slot.worker) = Some(worker);
        log::info!("{}: connected using {} driver", slot.id, family);
        Ok(DeviceState::Connected)
    }

    /// Disconnect a device; disconnected devices are left alone
    pub fn disconnect(&self, id: &str) -> Result<()> {
        self.check_running()?;
        let slot = self.slot(id)?;
        let _ops = slot.begin()?;
        self.disconnect_locked(&slot);
        Ok(())
    }

    /// Tear down the session and worker; returns whether the device was
    /// connected
    fn disconnect_locked(&self, slot: &DeviceSlot) -> bool {
        let (previous, session) = {
            let mut device = lock(&slot.device);
            let previous = device.state();
            (previous, device.end_session())
        };

        let worker = lock(&slot.worker).take();
        if let Some(worker) = worker {
            worker.stop();
        }
        if let Some(mut session) = session {
            session.close();
        }

        if previous != DeviceState::Disconnected {
            log::info!("{}: disconnected", slot.id);
        }
        previous == DeviceState::Connected
    }

    /// Handle the answer to a permission request
    ///
    /// `token` is the numeric identity the request was made for. Results for
    /// devices that are gone or no longer waiting are logged and ignored. A
    /// denial leaves the device disconnected and is reported as
    /// [`BridgeError::PermissionDenied`]; a grant connects it.
    pub fn on_permission_result(&self, token: u32, granted: bool) -> Result<()> {
        self.check_running()?;

        let slot = self
            .snapshot()
            .values()
            .find(|slot| slot.identity.numeric_id() == token)
            .cloned();
        let Some(slot) = slot else {
            log::warn!(
                "Permission result for {:#010x} matches no attached device, ignoring",
                token
            );
            return Ok(());
        };
        let Ok(_ops) = slot.begin() else {
            log::warn!("{}: permission result after detach, ignoring", slot.id);
            return Ok(());
        };

        {
            let mut device = lock(&slot.device);
            if device.state() != DeviceState::AwaitingPermission {
                log::warn!(
                    "{}: unexpected permission result while {}, ignoring",
                    slot.id,
                    device.state()
                );
                return Ok(());
            }
            device.end_session();
        }

        if !granted {
            log::warn!("{}: USB permission denied", slot.id);
            return Err(BridgeError::PermissionDenied(slot.id.clone()));
        }
        log::info!("{}: USB permission granted", slot.id);
        self.connect_locked(&slot).map(|_| ())
    }

    /// Tear down a device whose read pump failed
    ///
    /// Faults from a session that was already replaced are ignored. The
    /// device stays registered and can be connected again.
    fn on_pump_fault(&self, id: &str, generation: u64, reason: String) {
        let Ok(slot) = self.slot(id) else {
            log::debug!("Pump fault for unknown device {}", id);
            return;
        };
        let Ok(_ops) = slot.begin() else {
            return;
        };

        let current = lock(&slot.device).session().map(SerialSession::generation);
        if current != Some(generation) {
            log::debug!("{}: ignoring stale pump fault from generation {}", id, generation);
            return;
        }

        let err = BridgeError::PumpFault {
            device: id.to_string(),
            reason,
        };
        log::warn!("{}, disconnecting", err);
        self.disconnect_locked(&slot);
    }

    /// Change the driver family of a disconnected device
    pub fn set_driver_family(&self, id: &str, family: DriverFamily) -> Result<()> {
        self.check_running()?;
        let slot = self.slot(id)?;
        let _ops = slot.begin()?;
        let mut device = lock(&slot.device);
        device.set_driver_family(family, self.collab.prefs.as_ref())
    }

    /// Change and persist the auto-connect preference of a device
    pub fn set_auto_connect(&self, id: &str, enabled: bool) -> Result<()> {
        self.check_running()?;
        let slot = self.slot(id)?;
        let _ops = slot.begin()?;
        let mut device = lock(&slot.device);
        device.set_auto_connect(enabled, self.collab.prefs.as_ref())
    }

    /// Disconnect every device and stop accepting operations
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        let devices = self.update_map(std::mem::take);
        log::info!("Shutting down, disconnecting {} device(s)", devices.len());
        for slot in devices.values() {
            let _ops = lock(&slot.ops);
            slot.removed.store(true, Ordering::Release);
            self.disconnect_locked(slot);
        }
    }

    /// Apply one event; returns `false` once the registry is shut down
    pub fn handle_event(&self, event: BridgeEvent) -> bool {
        match event {
            BridgeEvent::Attached(raw) => {
                if let Err(e) = self.attach(raw) {
                    log::warn!("Attach failed: {}", e);
                }
            }
            BridgeEvent::Detached(id) => {
                if let Err(e) = self.detach(&id) {
                    log::warn!("Detach of {} failed: {}", id, e);
                }
            }
            BridgeEvent::PermissionResult { token, granted } => {
                if let Err(e) = self.on_permission_result(token, granted) {
                    log::warn!("{}", e);
                }
            }
            BridgeEvent::PumpFault {
                device,
                generation,
                reason,
            } => {
                if !self.is_shut_down() {
                    self.on_pump_fault(&device, generation, reason);
                }
            }
            BridgeEvent::Shutdown => self.shutdown(),
        }
        !self.is_shut_down()
    }

    /// Handle events until shut down
    pub fn run(&self) {
        let inbox = lock(&self.inbox);
        // The registry holds a sender itself, so recv only ends on shutdown
        while let Ok(event) = inbox.recv() {
            if !self.handle_event(event) {
                break;
            }
        }
    }

    /// Handle all queued events without blocking; returns how many ran
    pub fn poll_events(&self) -> usize {
        let inbox = lock(&self.inbox);
        let mut handled = 0;
        loop {
            match inbox.try_recv() {
                Ok(event) => {
                    handled += 1;
                    if !self.handle_event(event) {
                        break;
                    }
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
        handled
    }
}

impl Drop for BridgeRegistry {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use usbpty_core::error::PortError;
    use usbpty_core::platform::LineConfig;
    use usbpty_core::prefs::MemoryPreferences;
    use usbpty_dummy::{
        wait_for, DummyBus, DummyPeer, DummyPermissions, DummyPlatform, DummyPtyFactory,
        PermissionMode,
    };

    const FTDI_ID: &str = "1027:24577";
    const WAIT: Duration = Duration::from_secs(3);

    struct Harness {
        registry: BridgeRegistry,
        platform: DummyPlatform,
        ptys: Arc<DummyPtyFactory>,
        permissions: Arc<DummyPermissions>,
        prefs: Arc<MemoryPreferences>,
    }

    impl Harness {
        fn new(mode: PermissionMode) -> Self {
            let platform = DummyPlatform::default();
            let ptys = Arc::new(DummyPtyFactory::new());
            let permissions = Arc::new(DummyPermissions::new(mode));
            let prefs = Arc::new(MemoryPreferences::new());
            let collab = Collaborators {
                platform: Arc::new(platform.clone()),
                ptys: ptys.clone(),
                permissions: permissions.clone(),
                prefs: prefs.clone(),
            };
            let config = BridgeConfig {
                poll_interval: Duration::from_millis(10),
                ..Default::default()
            };
            Self {
                registry: BridgeRegistry::new(collab, config),
                platform,
                ptys,
                permissions,
                prefs,
            }
        }

        fn peer(&self) -> Arc<DummyPeer> {
            self.ptys.peer(&ftdi().identity()).unwrap()
        }

        fn status(&self) -> DeviceStatus {
            self.registry.device_status(FTDI_ID).unwrap()
        }

        /// Attach and connect the FTDI adapter, then open it at 115200
        fn connected(mode: PermissionMode) -> Self {
            let h = Self::new(mode);
            h.registry.attach(ftdi()).unwrap();
            assert_eq!(h.registry.try_connect(FTDI_ID).unwrap(), DeviceState::Connected);
            h.peer().send_packet(0b1, 115200, &[]);
            assert!(wait_for(WAIT, || h.status().last_baud == 115200));
            h
        }
    }

    fn ftdi() -> RawUsbDevice {
        RawUsbDevice::new(0x0403, 0x6001, "1-1.2").with_product("FT232R USB UART")
    }

    #[test]
    fn test_scenario_start_of_session() {
        let h = Harness::new(PermissionMode::GrantAll);
        assert_eq!(h.registry.attach(ftdi()).unwrap(), FTDI_ID);
        assert_eq!(h.status().family, DriverFamily::Ftdi);
        assert_eq!(h.registry.try_connect(FTDI_ID).unwrap(), DeviceState::Connected);
        // Connecting does not open the port
        assert_eq!(h.platform.open_count(), 0);

        h.peer().send_packet(0b1, 115200, &[]);
        assert!(wait_for(WAIT, || h.status().last_baud == 115200));
        assert_eq!(h.platform.open_count(), 1);
        assert_eq!(h.platform.configs(), vec![LineConfig::eight_n_one(115200)]);
        assert_eq!(h.platform.line_signals(), (true, true));
        assert!(h.status().port_open);
        assert!(h.platform.written().is_empty());
    }

    #[test]
    fn test_scenario_payload_without_reopen() {
        let h = Harness::connected(PermissionMode::GrantAll);
        h.peer().send_packet(0b0, 115200, &[0x4D, 0x31, 0x30, 0x35]);
        assert!(wait_for(WAIT, || h.platform.written() == b"M105"));
        assert_eq!(h.platform.open_count(), 1);
        assert_eq!(h.platform.line_assert_count(), 1);
    }

    #[test]
    fn test_scenario_write_timeout_reopens() {
        let h = Harness::connected(PermissionMode::GrantAll);
        h.platform.set_stall_writes(true);
        h.peer().send_packet(0, 115200, b"M105\n");
        assert!(wait_for(WAIT, || !h.platform.is_open()));
        assert_eq!(h.status().state, DeviceState::Connected);

        h.platform.set_stall_writes(false);
        h.peer().send_packet(0, 115200, b"M105\n");
        assert!(wait_for(WAIT, || h.platform.written() == b"M105\n"));
        assert_eq!(h.platform.open_count(), 2);
        assert!(h.status().port_open);
    }

    #[test]
    fn test_scenario_detach_then_late_permission() {
        let h = Harness::connected(PermissionMode::GrantAll);
        h.registry.detach(FTDI_ID).unwrap();
        assert!(!h.platform.is_open());
        assert!(h.registry.snapshot().get(FTDI_ID).is_none());

        // A permission answer for the identity that just left
        h.registry
            .events()
            .send(BridgeEvent::PermissionResult {
                token: ftdi().identity().numeric_id(),
                granted: true,
            });
        assert_eq!(h.registry.poll_events(), 1);
        assert!(h.registry.snapshot().is_empty());
        assert_eq!(h.platform.open_count(), 1);
    }

    #[test]
    fn test_detach_while_permission_pending() {
        let h = Harness::new(PermissionMode::Hold);
        h.registry.attach(ftdi()).unwrap();
        assert_eq!(
            h.registry.try_connect(FTDI_ID).unwrap(),
            DeviceState::AwaitingPermission
        );
        h.registry.detach(FTDI_ID).unwrap();

        assert_eq!(h.permissions.resolve_pending(true), 1);
        assert_eq!(h.registry.poll_events(), 1);
        assert!(h.registry.snapshot().is_empty());
        assert_eq!(h.ptys.open_count(), 0);
    }

    #[test]
    fn test_start_signal_always_reopens() {
        let h = Harness::connected(PermissionMode::GrantAll);
        h.peer().send_packet(0b1, 115200, &[]);
        assert!(wait_for(WAIT, || h.platform.open_count() == 2));
        assert!(wait_for(WAIT, || h.platform.line_assert_count() == 2));
    }

    #[test]
    fn test_baud_change_reopens() {
        let h = Harness::connected(PermissionMode::GrantAll);
        h.peer().send_packet(0, 250000, b"G28\n");
        assert!(wait_for(WAIT, || h.platform.written() == b"G28\n"));
        assert_eq!(h.platform.open_count(), 2);
        assert_eq!(h.platform.current_baud(), Some(250000));
        assert_eq!(h.status().last_baud, 250000);
        // No start signal on the second open
        assert_eq!(h.platform.line_assert_count(), 1);
    }

    #[test]
    fn test_device_bytes_reach_peer() {
        let h = Harness::connected(PermissionMode::GrantAll);
        h.peer().send_packet(0, 115200, b"M105\n");
        assert!(wait_for(WAIT, || h.peer().output() == b"ok T:21.0 /0.0 B:20.0 /0.0\n"));
    }

    #[test]
    fn test_peer_write_failure_drops_chunk() {
        let h = Harness::connected(PermissionMode::GrantAll);
        let peer = h.peer();
        peer.set_fail_writes(true);
        h.platform.push_reply(b"echo:lost\n");
        std::thread::sleep(Duration::from_millis(100));
        peer.set_fail_writes(false);

        peer.send_packet(0, 115200, b"G1 X10\n");
        assert!(wait_for(WAIT, || peer.output() == b"ok\n"));
        assert_eq!(h.status().state, DeviceState::Connected);
    }

    #[test]
    fn test_malformed_frames_are_skipped() {
        let h = Harness::connected(PermissionMode::GrantAll);
        let peer = h.peer();
        peer.send_frame(Vec::new());
        peer.send_frame(vec![0, 1, 2]);
        peer.send_packet(0, 115200, b"M400\n");
        assert!(wait_for(WAIT, || h.platform.written() == b"M400\n"));
        assert_eq!(h.status().state, DeviceState::Connected);
        assert_eq!(h.platform.open_count(), 1);
    }

    #[test]
    fn test_open_failure_is_recovered() {
        let h = Harness::new(PermissionMode::GrantAll);
        h.registry.attach(ftdi()).unwrap();
        h.registry.try_connect(FTDI_ID).unwrap();
        h.platform.set_fail_open(true);
        h.peer().send_packet(1, 115200, b"M105\n");
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(h.status().state, DeviceState::Connected);
        assert!(!h.status().port_open);
        assert_eq!(h.status().last_baud, -1);

        h.platform.set_fail_open(false);
        h.peer().send_packet(1, 115200, b"M105\n");
        assert!(wait_for(WAIT, || h.platform.written().ends_with(b"M105\n")));
    }

    #[test]
    fn test_unknown_driver_never_connects() {
        let h = Harness::new(PermissionMode::Hold);
        let id = h.registry.attach(RawUsbDevice::new(0x1234, 0x5678, "3-1")).unwrap();
        assert_eq!(id, "4660:22136");

        for _ in 0..3 {
            let err = h.registry.try_connect(&id).unwrap_err();
            assert!(matches!(err, BridgeError::NoDriverSelected(_)));
            assert_eq!(
                h.registry.device_status(&id).unwrap().state,
                DeviceState::Disconnected
            );
        }
        assert_eq!(h.permissions.request_count(), 0);
    }

    #[test]
    fn test_driver_change_while_connected() {
        let h = Harness::connected(PermissionMode::GrantAll);
        let err = h
            .registry
            .set_driver_family(FTDI_ID, DriverFamily::Ch340)
            .unwrap_err();
        assert!(matches!(err, BridgeError::DriverChangeWhileConnected(_)));
        assert_eq!(h.status().family, DriverFamily::Ftdi);
        assert_eq!(h.prefs.driver_override(&ftdi().identity()), None);

        h.registry.disconnect(FTDI_ID).unwrap();
        h.registry.set_driver_family(FTDI_ID, DriverFamily::Ch340).unwrap();
        assert_eq!(h.status().family, DriverFamily::Ch340);
        assert_eq!(
            h.prefs.driver_override(&ftdi().identity()).as_deref(),
            Some("CH340")
        );
    }

    #[test]
    fn test_override_applied_on_attach() {
        let h = Harness::new(PermissionMode::GrantAll);
        h.prefs
            .set_driver_override(&ftdi().identity(), Some("cp210x"))
            .unwrap();
        h.registry.attach(ftdi()).unwrap();
        assert_eq!(h.status().family, DriverFamily::Cp21xx);
    }

    #[test]
    fn test_auto_connect_on_attach() {
        let h = Harness::new(PermissionMode::GrantAll);
        h.prefs.set_auto_connect(&ftdi().identity(), true).unwrap();
        h.registry.attach(ftdi()).unwrap();
        assert_eq!(h.status().state, DeviceState::Connected);
        assert!(h.status().auto_connect);
    }

    #[test]
    fn test_set_auto_connect_persists() {
        let h = Harness::new(PermissionMode::GrantAll);
        h.registry.attach(ftdi()).unwrap();
        h.registry.set_auto_connect(FTDI_ID, true).unwrap();
        assert!(h.prefs.auto_connect(&ftdi().identity()));
        assert!(h.status().auto_connect);
    }

    #[test]
    fn test_permission_granted_connects() {
        let h = Harness::new(PermissionMode::GrantOnRequest);
        h.registry.attach(ftdi()).unwrap();
        assert_eq!(
            h.registry.try_connect(FTDI_ID).unwrap(),
            DeviceState::AwaitingPermission
        );
        assert_eq!(h.status().state, DeviceState::AwaitingPermission);
        // Still pending until the answer is processed
        assert_eq!(
            h.registry.try_connect(FTDI_ID).unwrap(),
            DeviceState::AwaitingPermission
        );

        assert_eq!(h.registry.poll_events(), 1);
        assert_eq!(h.status().state, DeviceState::Connected);
        assert_eq!(h.permissions.request_count(), 1);
    }

    #[test]
    fn test_permission_denied_stays_disconnected() {
        let h = Harness::new(PermissionMode::DenyOnRequest);
        h.registry.attach(ftdi()).unwrap();
        h.registry.try_connect(FTDI_ID).unwrap();

        let err = h
            .registry
            .on_permission_result(ftdi().identity().numeric_id(), false)
            .unwrap_err();
        assert!(matches!(err, BridgeError::PermissionDenied(_)));
        assert_eq!(h.status().state, DeviceState::Disconnected);

        // The queued denial finds nothing pending
        h.registry.poll_events();
        assert_eq!(h.status().state, DeviceState::Disconnected);
        assert_eq!(h.permissions.request_count(), 1);
    }

    #[test]
    fn test_pump_fault_disconnects() {
        let h = Harness::connected(PermissionMode::GrantAll);
        h.platform.inject_read_fault();
        assert!(wait_for(WAIT, || {
            h.registry.poll_events();
            h.status().state == DeviceState::Disconnected
        }));
        assert!(!h.platform.is_open());
        assert!(h.registry.snapshot().contains_key(FTDI_ID));

        assert_eq!(h.registry.try_connect(FTDI_ID).unwrap(), DeviceState::Connected);
        h.peer().send_packet(1, 115200, &[]);
        assert!(wait_for(WAIT, || h.platform.open_count() == 2));
    }

    #[test]
    fn test_stale_pump_fault_is_ignored() {
        let h = Harness::connected(PermissionMode::GrantAll);
        h.registry.events().send(BridgeEvent::PumpFault {
            device: FTDI_ID.to_string(),
            generation: 0,
            reason: PortError::Closed.to_string(),
        });
        h.registry.poll_events();
        assert_eq!(h.status().state, DeviceState::Connected);
    }

    #[test]
    fn test_disconnect_is_idempotent() {
        let h = Harness::connected(PermissionMode::GrantAll);
        h.registry.disconnect(FTDI_ID).unwrap();
        h.registry.disconnect(FTDI_ID).unwrap();
        assert_eq!(h.status().state, DeviceState::Disconnected);
        assert!(!h.status().port_open);
        assert!(!h.platform.is_open());
        assert!(matches!(
            h.registry.disconnect("1:2"),
            Err(BridgeError::UnknownDevice(_))
        ));
    }

    #[test]
    fn test_reattach_replaces_record() {
        let h = Harness::connected(PermissionMode::GrantAll);
        let old = h.registry.snapshot();
        h.registry.attach(ftdi()).unwrap();

        assert!(!h.platform.is_open());
        let new = h.registry.snapshot();
        assert!(!Arc::ptr_eq(&old[FTDI_ID], &new[FTDI_ID]));
        assert_eq!(h.status().state, DeviceState::Disconnected);
        assert!(matches!(
            old[FTDI_ID].status().state,
            DeviceState::Disconnected
        ));
    }

    #[test]
    fn test_snapshot_is_point_in_time() {
        let h = Harness::new(PermissionMode::GrantAll);
        let before = h.registry.snapshot();
        h.registry.attach(ftdi()).unwrap();
        assert!(before.is_empty());
        assert_eq!(h.registry.snapshot().len(), 1);
        assert_eq!(h.registry.status()[0].id, FTDI_ID);
    }

    #[test]
    fn test_connect_all() {
        let platform = DummyPlatform::default();
        let collab = Collaborators {
            platform: Arc::new(platform),
            ptys: Arc::new(DummyPtyFactory::new()),
            permissions: Arc::new(DummyPermissions::new(PermissionMode::GrantAll)),
            prefs: Arc::new(MemoryPreferences::new()),
        };
        let registry = BridgeRegistry::new(
            collab,
            BridgeConfig {
                connect_all: true,
                ..Default::default()
            },
        );
        registry.attach(ftdi()).unwrap();
        assert_eq!(
            registry.device_status(FTDI_ID).unwrap().state,
            DeviceState::Connected
        );
    }

    #[test]
    fn test_shutdown() {
        let h = Harness::connected(PermissionMode::GrantAll);
        h.registry.shutdown();
        assert!(h.registry.is_shut_down());
        assert!(!h.platform.is_open());
        assert!(h.registry.snapshot().is_empty());
        assert!(matches!(h.registry.attach(ftdi()), Err(BridgeError::ShutDown)));
        assert!(matches!(
            h.registry.try_connect(FTDI_ID),
            Err(BridgeError::ShutDown)
        ));
    }

    #[test]
    fn test_slow_device_does_not_stall_others() {
        let bus = Arc::new(DummyBus::default());
        let ptys = Arc::new(DummyPtyFactory::new());
        let collab = Collaborators {
            platform: bus.clone(),
            ptys: ptys.clone(),
            permissions: Arc::new(DummyPermissions::new(PermissionMode::GrantAll)),
            prefs: Arc::new(MemoryPreferences::new()),
        };
        let config = BridgeConfig {
            poll_interval: Duration::from_millis(10),
            ..Default::default()
        };
        let registry = BridgeRegistry::new(collab, config);

        let ch340 = RawUsbDevice::new(0x1A86, 0x7523, "1-1.3").with_product("USB Serial");
        let ch340_id = registry.attach(ch340.clone()).unwrap();
        registry.attach(ftdi()).unwrap();
        for id in [FTDI_ID, ch340_id.as_str()] {
            assert_eq!(registry.try_connect(id).unwrap(), DeviceState::Connected);
        }

        let slow = bus.printer(&ftdi().identity());
        let fast = bus.printer(&ch340.identity());
        let slow_peer = ptys.peer(&ftdi().identity()).unwrap();
        let fast_peer = ptys.peer(&ch340.identity()).unwrap();
        slow_peer.send_packet(0b1, 115200, &[]);
        fast_peer.send_packet(0b1, 250000, &[]);
        assert!(wait_for(WAIT, || slow.is_open() && fast.is_open()));

        slow.set_write_delay(Duration::from_millis(1500));
        slow_peer.send_packet(0, 115200, b"G28\n");
        std::thread::sleep(Duration::from_millis(50));
        fast_peer.send_packet(0, 250000, b"M105\n");

        assert!(wait_for(Duration::from_millis(500), || fast.written() == b"M105\n"));
        assert!(slow.written().is_empty());
        assert!(wait_for(WAIT, || slow.written() == b"G28\n"));

        // Each record keeps its own state
        registry.disconnect(&ch340_id).unwrap();
        assert_eq!(
            registry.device_status(&ch340_id).unwrap().state,
            DeviceState::Disconnected
        );
        assert!(!fast.is_open());
        let ftdi_status = registry.device_status(FTDI_ID).unwrap();
        assert_eq!(ftdi_status.state, DeviceState::Connected);
        assert_eq!(ftdi_status.last_baud, 115200);
        assert!(slow.is_open());
    }

    #[test]
    fn test_run_loop() {
        let h = Harness::new(PermissionMode::GrantAll);
        let registry = Arc::new(h.registry);
        let events = registry.events();
        let runner = {
            let registry = Arc::clone(&registry);
            std::thread::spawn(move || registry.run())
        };

        events.attached(ftdi());
        assert!(wait_for(WAIT, || registry.snapshot().contains_key(FTDI_ID)));
        events.detached(FTDI_ID);
        assert!(wait_for(WAIT, || registry.snapshot().is_empty()));

        events.shutdown();
        runner.join().unwrap();
        assert!(registry.is_shut_down());
    }
}
