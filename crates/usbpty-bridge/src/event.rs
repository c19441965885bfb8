//! Messages into the registry
//!
//! Attach/detach notifications, permission answers and read pump faults all
//! arrive as [`BridgeEvent`]s on one channel and are handled by
//! [`crate::BridgeRegistry::run`] or [`crate::BridgeRegistry::poll_events`].

use std::sync::mpsc::Sender;

use usbpty_core::driver::RawUsbDevice;
use usbpty_core::platform::PermissionReply;

/// Input message for the registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeEvent {
    /// A USB device appeared
    Attached(RawUsbDevice),
    /// A USB device with this id went away
    Detached(String),
    /// Answer to a permission request, correlated by token
    PermissionResult {
        /// Numeric identity of the device the request was made for
        token: u32,
        /// Whether access was granted
        granted: bool,
    },
    /// The read pump of a session failed
    PumpFault {
        /// Device id
        device: String,
        /// Generation of the session the pump belonged to
        generation: u64,
        /// What went wrong
        reason: String,
    },
    /// Stop the event loop and shut the registry down
    Shutdown,
}

/// Cloneable handle for posting [`BridgeEvent`]s
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: Sender<BridgeEvent>,
}

impl EventSender {
    pub(crate) fn new(tx: Sender<BridgeEvent>) -> Self {
        Self { tx }
    }

    /// Post an event
    ///
    /// Events posted after the registry was dropped are discarded.
    pub fn send(&self, event: BridgeEvent) {
        if let Err(e) = self.tx.send(event) {
            log::debug!("Registry gone, dropping {:?}", e.0);
        }
    }

    /// Report a newly attached device
    pub fn attached(&self, device: RawUsbDevice) {
        self.send(BridgeEvent::Attached(device));
    }

    /// Report a removed device
    pub fn detached(&self, id: impl Into<String>) {
        self.send(BridgeEvent::Detached(id.into()));
    }

    /// Ask the event loop to shut the registry down
    pub fn shutdown(&self) {
        self.send(BridgeEvent::Shutdown);
    }

    /// Create the reply a permission authority resolves for `token`
    pub fn permission_reply(&self, token: u32) -> PermissionReply {
        let sender = self.clone();
        PermissionReply::new(token, move |token, granted| {
            sender.send(BridgeEvent::PermissionResult { token, granted });
        })
    }
}
