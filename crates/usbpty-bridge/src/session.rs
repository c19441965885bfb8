//! Serial port session
//!
//! A [`SerialSession`] lives as long as its device is connected. It owns at
//! most one open [`SerialHandle`] plus the read pump draining that handle,
//! and reopens the handle whenever a packet asks for it.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use usbpty_core::driver::DriverInstance;
use usbpty_core::error::{BridgeError, PortError, Result};
use usbpty_core::packet::ControlPacket;
use usbpty_core::platform::{LineConfig, PtyPeer, SerialHandle, SerialReader, UsbPlatform};

use crate::event::{BridgeEvent, EventSender};

/// Bytes requested from the handle per read
const READ_CHUNK: usize = 512;

/// Generations are unique across all sessions so faults from a superseded
/// pump can never match a newer one
static NEXT_GENERATION: AtomicU64 = AtomicU64::new(1);

/// Open handle and read pump of one connected device
pub struct SerialSession {
    device_id: String,
    platform: Arc<dyn UsbPlatform>,
    peer: Arc<dyn PtyPeer>,
    events: EventSender,
    write_timeout: Duration,
    handle: Option<Box<dyn SerialHandle>>,
    pump: Option<ReadPump>,
    generation: u64,
}

impl SerialSession {
    /// Create a session; the handle opens on the first packet
    pub fn new(
        device_id: impl Into<String>,
        platform: Arc<dyn UsbPlatform>,
        peer: Arc<dyn PtyPeer>,
        events: EventSender,
        write_timeout: Duration,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            platform,
            peer,
            events,
            write_timeout,
            handle: None,
            pump: None,
            generation: 0,
        }
    }

    /// Generation of the current handle (0 before the first open)
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Whether a handle is open
    pub fn is_open(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| h.is_open())
    }

    /// Reopen the handle if `packet` requires it
    ///
    /// A reopen happens on a start signal, when the requested speed differs
    /// from `last_baud`, or when no handle is open. Returns whether the
    /// handle was reopened. Without a driver this fails with
    /// [`BridgeError::NoDriverSelected`] and changes nothing.
    pub fn ensure_open(
        &mut self,
        driver: Option<&DriverInstance>,
        last_baud: &mut i32,
        packet: &ControlPacket,
    ) -> Result<bool> {
        let Some(driver) = driver else {
            return Err(BridgeError::NoDriverSelected(self.device_id.clone()));
        };

        let start = packet.is_start_signal();
        let requested = packet.requested_baud();
        if !start && *last_baud == requested && self.is_open() {
            return Ok(false);
        }

        log::debug!(
            "{}: reopening port (start={}, baud {} -> {}, open={})",
            self.device_id,
            start,
            last_baud,
            requested,
            self.is_open()
        );
        self.close_handle();

        let baud = packet.baud_rate();
        let mut handle = self.platform.open(driver).map_err(|source| self.open_failed(source))?;
        if let Err(source) = handle.configure(&LineConfig::eight_n_one(baud)) {
            let _ = handle.close();
            return Err(self.open_failed(source));
        }
        *last_baud = requested;

        if start {
            let signals = handle.set_dtr(true).and_then(|()| handle.set_rts(true));
            if let Err(e) = signals {
                log::warn!("{}: failed to assert DTR/RTS: {}", self.device_id, e);
            }
        }

        let reader = match handle.reader() {
            Ok(reader) => reader,
            Err(source) => {
                let _ = handle.close();
                return Err(self.open_failed(source));
            }
        };

        let generation = NEXT_GENERATION.fetch_add(1, Ordering::Relaxed);
        self.pump = Some(ReadPump::start(
            self.device_id.clone(),
            generation,
            reader,
            Arc::clone(&self.peer),
            self.events.clone(),
        ));
        self.handle = Some(handle);
        self.generation = generation;

        log::info!(
            "{}: port open at {} baud 8N1 (client line {})",
            self.device_id,
            baud,
            packet.termios().line_summary()
        );
        Ok(true)
    }

    /// Write the packet payload to the open handle
    ///
    /// Empty payloads are a no-op. A failed or timed out write closes the
    /// handle, so the next packet reopens it, and is reported as
    /// [`BridgeError::WriteFailed`].
    pub fn forward_payload(&mut self, packet: &ControlPacket) -> Result<()> {
        let payload = packet.payload();
        if payload.is_empty() {
            return Ok(());
        }

        let result = match self.handle.as_mut() {
            Some(handle) => handle.write(payload, self.write_timeout),
            None => Err(PortError::Closed),
        };
        if let Err(source) = result {
            self.close_handle();
            return Err(BridgeError::WriteFailed {
                device: self.device_id.clone(),
                source,
            });
        }

        log::trace!("{}: wrote {} bytes", self.device_id, payload.len());
        Ok(())
    }

    /// Close the handle and stop the read pump
    pub fn close(&mut self) {
        if self.handle.is_some() {
            log::debug!("{}: closing port", self.device_id);
        }
        self.close_handle();
    }

    fn close_handle(&mut self) {
        if let Some(mut handle) = self.handle.take() {
            if let Err(e) = handle.close() {
                log::debug!("{}: error closing superseded handle: {}", self.device_id, e);
            }
        }
        if let Some(pump) = self.pump.take() {
            pump.stop();
        }
    }

    fn open_failed(&self, source: PortError) -> BridgeError {
        BridgeError::OpenFailed {
            device: self.device_id.clone(),
            source,
        }
    }
}

impl Drop for SerialSession {
    fn drop(&mut self) {
        self.close_handle();
    }
}

/// Deliver bytes read from the device to the pty
///
/// A failed pty write drops the chunk.
pub fn on_device_bytes(device_id: &str, peer: &dyn PtyPeer, bytes: &[u8]) {
    if let Err(e) = peer.write(bytes) {
        log::warn!(
            "{}: dropped {} bytes, pty write failed: {}",
            device_id,
            bytes.len(),
            e
        );
    }
}

/// Thread copying bytes from one handle to the pty
struct ReadPump {
    stopped: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl ReadPump {
    fn start(
        device_id: String,
        generation: u64,
        mut reader: Box<dyn SerialReader>,
        peer: Arc<dyn PtyPeer>,
        events: EventSender,
    ) -> Self {
        let stopped = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stopped);

        let thread = thread::spawn(move || {
            let mut buf = [0u8; READ_CHUNK];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        // Bytes already read still belong to the pty
                        on_device_bytes(&device_id, peer.as_ref(), &buf[..n]);
                        if flag.load(Ordering::Acquire) {
                            break;
                        }
                    }
                    Err(e) => {
                        if !flag.load(Ordering::Acquire) {
                            log::warn!("{}: read pump failed: {}", device_id, e);
                            events.send(BridgeEvent::PumpFault {
                                device: device_id.clone(),
                                generation,
                                reason: e.to_string(),
                            });
                        }
                        break;
                    }
                }
            }
            log::debug!("{}: read pump {} stopped", device_id, generation);
        });

        Self {
            stopped,
            thread: Some(thread),
        }
    }

    /// Wait for the pump to finish; the handle must already be closed
    fn stop(mut self) {
        self.stopped.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("read pump panicked");
            }
        }
    }
}

impl Drop for ReadPump {
    fn drop(&mut self) {
        self.stopped.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use usbpty_core::driver::{probe, RawUsbDevice};
    use usbpty_core::error::PortResult;
    use usbpty_core::packet::TermiosFlags;
    use usbpty_dummy::{wait_for, DummyPeer, DummyPlatform};

    fn session(
        platform: &DummyPlatform,
        peer: Arc<DummyPeer>,
    ) -> (SerialSession, mpsc::Receiver<BridgeEvent>) {
        let (tx, rx) = mpsc::channel();
        let session = SerialSession::new(
            "1027:24577",
            Arc::new(platform.clone()),
            peer,
            EventSender::new(tx),
            Duration::from_millis(2000),
        );
        (session, rx)
    }

    fn packet(control: u8, baud: i32, payload: &[u8]) -> ControlPacket {
        let mut raw = vec![control];
        raw.extend_from_slice(payload);
        ControlPacket::decode(raw, baud, TermiosFlags::default()).unwrap()
    }

    fn ftdi() -> DriverInstance {
        probe(&RawUsbDevice::new(0x0403, 0x6001, "1-1")).unwrap()
    }

    #[test]
    fn test_no_driver_changes_nothing() {
        let platform = DummyPlatform::default();
        let (mut session, _rx) = session(&platform, Arc::new(DummyPeer::new()));
        let mut last_baud = -1;

        let err = session
            .ensure_open(None, &mut last_baud, &packet(1, 115200, &[]))
            .unwrap_err();
        assert!(matches!(err, BridgeError::NoDriverSelected(_)));
        assert_eq!(last_baud, -1);
        assert!(!session.is_open());
        assert_eq!(platform.open_count(), 0);
    }

    #[test]
    fn test_same_baud_keeps_handle() {
        let platform = DummyPlatform::default();
        let (mut session, _rx) = session(&platform, Arc::new(DummyPeer::new()));
        let driver = ftdi();
        let mut last_baud = -1;

        assert!(session
            .ensure_open(Some(&driver), &mut last_baud, &packet(0, 115200, b"G28"))
            .unwrap());
        let generation = session.generation();
        assert!(!session
            .ensure_open(Some(&driver), &mut last_baud, &packet(0, 115200, b"G1"))
            .unwrap());
        assert!(!session
            .ensure_open(Some(&driver), &mut last_baud, &packet(0, 115200, b"G1"))
            .unwrap());
        assert_eq!(session.generation(), generation);
        assert_eq!(platform.open_count(), 1);
        assert_eq!(last_baud, 115200);
        // No start signal, no line assertion
        assert_eq!(platform.line_assert_count(), 0);
    }

    #[test]
    fn test_start_signal_reopens() {
        let platform = DummyPlatform::default();
        let (mut session, _rx) = session(&platform, Arc::new(DummyPeer::new()));
        let driver = ftdi();
        let mut last_baud = -1;

        for expected in 1..=3 {
            assert!(session
                .ensure_open(Some(&driver), &mut last_baud, &packet(1, 115200, &[]))
                .unwrap());
            assert_eq!(platform.open_count(), expected);
            assert_eq!(platform.line_assert_count(), expected);
        }
        assert!(platform.is_open());
    }

    #[test]
    fn test_write_failure_closes_handle() {
        let platform = DummyPlatform::default();
        let (mut session, _rx) = session(&platform, Arc::new(DummyPeer::new()));
        let driver = ftdi();
        let mut last_baud = -1;
        let data = packet(0, 115200, b"M105\n");

        session.ensure_open(Some(&driver), &mut last_baud, &data).unwrap();
        platform.set_stall_writes(true);
        let err = session.forward_payload(&data).unwrap_err();
        assert!(matches!(
            err,
            BridgeError::WriteFailed { source: PortError::Timeout(_), .. }
        ));
        assert!(err.is_recoverable());
        assert!(!session.is_open());

        platform.set_stall_writes(false);
        assert!(session.ensure_open(Some(&driver), &mut last_baud, &data).unwrap());
        session.forward_payload(&data).unwrap();
        assert_eq!(platform.written(), b"M105\n");
    }

    #[test]
    fn test_pump_forwards_and_reports_faults() {
        let platform = DummyPlatform::default();
        let peer = Arc::new(DummyPeer::new());
        let (mut session, rx) = session(&platform, Arc::clone(&peer));
        let driver = ftdi();
        let mut last_baud = -1;
        let data = packet(0, 250000, b"M115\n");

        session.ensure_open(Some(&driver), &mut last_baud, &data).unwrap();
        session.forward_payload(&data).unwrap();
        assert!(wait_for(Duration::from_secs(2), || peer.output().ends_with(b"ok\n")));

        platform.inject_read_fault();
        match rx.recv_timeout(Duration::from_secs(2)).unwrap() {
            BridgeEvent::PumpFault { generation, .. } => {
                assert_eq!(generation, session.generation())
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    /// Reader handing out whatever arrives on a channel
    struct ChannelReader(mpsc::Receiver<Vec<u8>>);

    impl SerialReader for ChannelReader {
        fn read(&mut self, buf: &mut [u8]) -> PortResult<usize> {
            match self.0.recv() {
                Ok(chunk) => {
                    buf[..chunk.len()].copy_from_slice(&chunk);
                    Ok(chunk.len())
                }
                Err(_) => Ok(0),
            }
        }
    }

    #[test]
    fn test_pump_delivers_chunk_read_while_stopping() {
        let peer = Arc::new(DummyPeer::new());
        let (events, _rx) = mpsc::channel();
        let (bytes, reader) = mpsc::channel();
        let pump = ReadPump::start(
            "1027:24577".to_string(),
            0,
            Box::new(ChannelReader(reader)),
            Arc::clone(&peer) as Arc<dyn PtyPeer>,
            EventSender::new(events),
        );

        // The stop request lands while the read is still in flight
        pump.stopped.store(true, Ordering::Release);
        bytes.send(b"ok T:21.0\n".to_vec()).unwrap();
        drop(bytes);
        pump.stop();

        assert_eq!(peer.output(), b"ok T:21.0\n");
    }

    #[test]
    fn test_close_stops_pump_quietly() {
        let platform = DummyPlatform::default();
        let (mut session, rx) = session(&platform, Arc::new(DummyPeer::new()));
        let mut last_baud = -1;

        session.ensure_open(Some(&ftdi()), &mut last_baud, &packet(1, 115200, &[])).unwrap();
        session.close();
        assert!(!platform.is_open());
        assert!(rx.try_recv().is_err());
    }
}
