//! Channel-fed pty peer

use std::collections::BTreeMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use usbpty_core::error::{BridgeError, Result};
use usbpty_core::identity::DeviceIdentity;
use usbpty_core::packet::{encode_frame, TermiosFlags};
use usbpty_core::platform::{PtyFactory, PtyPeer};

/// In-memory [`PtyPeer`]
///
/// Frames queued with [`DummyPeer::send_frame`] are returned by `receive`
/// in order. Bytes the bridge writes are collected in [`DummyPeer::output`].
#[derive(Debug)]
pub struct DummyPeer {
    tx: Mutex<Sender<Vec<u8>>>,
    rx: Mutex<Receiver<Vec<u8>>>,
    output: Mutex<Vec<u8>>,
    fail_writes: AtomicBool,
}

impl Default for DummyPeer {
    fn default() -> Self {
        let (tx, rx) = mpsc::channel();
        Self {
            tx: Mutex::new(tx),
            rx: Mutex::new(rx),
            output: Mutex::new(Vec::new()),
            fail_writes: AtomicBool::new(false),
        }
    }
}

impl DummyPeer {
    /// Create an empty peer
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a raw frame for the bridge
    pub fn send_frame(&self, frame: Vec<u8>) {
        let tx = self.tx.lock().unwrap_or_else(|p| p.into_inner());
        // The receiver lives in self, so the channel cannot be disconnected
        let _ = tx.send(frame);
    }

    /// Queue a packet with default termios flags
    pub fn send_packet(&self, control: u8, requested_baud: i32, payload: &[u8]) {
        self.send_frame(encode_frame(
            control,
            requested_baud,
            TermiosFlags::default(),
            payload,
        ));
    }

    /// Bytes the bridge delivered so far
    pub fn output(&self) -> Vec<u8> {
        self.output.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    /// Make writes from the bridge fail until cleared
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::Release);
    }
}

impl PtyPeer for DummyPeer {
    fn write(&self, data: &[u8]) -> io::Result<()> {
        if self.fail_writes.load(Ordering::Acquire) {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "peer write failed"));
        }
        self.output
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .extend_from_slice(data);
        Ok(())
    }

    fn receive(&self, timeout: Duration) -> io::Result<Option<Vec<u8>>> {
        let rx = self.rx.lock().unwrap_or_else(|p| p.into_inner());
        match rx.recv_timeout(timeout) {
            Ok(frame) => Ok(Some(frame)),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => Ok(None),
        }
    }
}

/// [`PtyFactory`] handing out [`DummyPeer`]s
///
/// Keeps the most recent peer of every device so tests can drive it.
#[derive(Debug, Default)]
pub struct DummyPtyFactory {
    peers: Mutex<BTreeMap<u32, Arc<DummyPeer>>>,
    opens: AtomicUsize,
    fail: AtomicBool,
}

impl DummyPtyFactory {
    /// Create a factory
    pub fn new() -> Self {
        Self::default()
    }

    /// The latest peer opened for `identity`
    pub fn peer(&self, identity: &DeviceIdentity) -> Option<Arc<DummyPeer>> {
        self.peers
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(&identity.numeric_id())
            .cloned()
    }

    /// Number of peers opened so far
    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::Acquire)
    }

    /// Make opening fail until cleared
    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::Release);
    }
}

impl PtyFactory for DummyPtyFactory {
    fn open(&self, identity: &DeviceIdentity) -> Result<Arc<dyn PtyPeer>> {
        if self.fail.load(Ordering::Acquire) {
            return Err(BridgeError::Pty(format!("cannot open pty for {}", identity.id())));
        }
        let peer = Arc::new(DummyPeer::new());
        self.peers
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(identity.numeric_id(), Arc::clone(&peer));
        self.opens.fetch_add(1, Ordering::AcqRel);
        Ok(peer)
    }
}
