//! Per-device pty worker
//!
//! Receives frames from the pty peer, decodes them and applies them to the
//! device one at a time, so a device's packets are handled in arrival order
//! and a slow write only stalls its own device.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use usbpty_core::error::BridgeError;
use usbpty_core::packet::decode_frame;
use usbpty_core::platform::PtyPeer;

use crate::device::SerialDevice;
use crate::lock;

/// Thread feeding one device from its pty peer
pub(crate) struct PtyWorker {
    cancel: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl PtyWorker {
    pub(crate) fn spawn(
        device_id: String,
        device: Arc<Mutex<SerialDevice>>,
        peer: Arc<dyn PtyPeer>,
        poll_interval: Duration,
    ) -> Self {
        let cancel = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&cancel);
        let thread = thread::spawn(move || {
            run(&device_id, &device, peer.as_ref(), poll_interval, &flag);
            log::debug!("{}: pty worker stopped", device_id);
        });
        Self {
            cancel,
            thread: Some(thread),
        }
    }

    /// Cancel the worker and wait for it
    ///
    /// Must not be called with the device lock held.
    pub(crate) fn stop(mut self) {
        self.cancel.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("pty worker panicked");
            }
        }
    }
}

impl Drop for PtyWorker {
    fn drop(&mut self) {
        self.cancel.store(true, Ordering::Release);
    }
}

fn run(
    device_id: &str,
    device: &Mutex<SerialDevice>,
    peer: &dyn PtyPeer,
    poll_interval: Duration,
    cancel: &AtomicBool,
) {
    while !cancel.load(Ordering::Acquire) {
        let frame = match peer.receive(poll_interval) {
            Ok(Some(frame)) => frame,
            Ok(None) => continue,
            Err(e) => {
                log::warn!("{}: pty receive failed: {}", device_id, e);
                thread::sleep(poll_interval);
                continue;
            }
        };

        let packet = match decode_frame(&frame) {
            Ok(packet) => packet,
            Err(e) => {
                log::warn!("{}: {}", device_id, e);
                continue;
            }
        };

        if cancel.load(Ordering::Acquire) {
            break;
        }
        match lock(device).handle_packet(&packet) {
            Ok(()) => {}
            Err(BridgeError::NotConnected(_)) => break,
            Err(e) if e.is_recoverable() => log::warn!("{}", e),
            Err(e) => log::error!("{}", e),
        }
    }
}
