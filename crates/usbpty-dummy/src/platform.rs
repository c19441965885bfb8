//! Emulated printer behind a serial handle

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use usbpty_core::driver::DriverInstance;
use usbpty_core::error::{PortError, PortResult};
use usbpty_core::platform::{LineConfig, SerialHandle, SerialReader, UsbPlatform};

/// Configuration for the emulated printer
#[derive(Debug, Clone)]
pub struct DummyConfig {
    /// Firmware name reported by M115
    pub firmware_name: String,
    /// Poll interval of blocked readers
    pub read_poll: Duration,
}

impl Default for DummyConfig {
    fn default() -> Self {
        Self {
            firmware_name: "usbpty-dummy".to_string(),
            read_poll: Duration::from_millis(20),
        }
    }
}

#[derive(Debug, Default)]
struct State {
    /// Number of handles opened so far; also the id of the last one
    opens: usize,
    /// Id of the handle that is currently open
    open_handle: Option<usize>,
    configs: Vec<LineConfig>,
    dtr: bool,
    rts: bool,
    line_asserts: usize,
    written: Vec<u8>,
    line_buf: Vec<u8>,
    replies: VecDeque<u8>,
    stall_writes: bool,
    write_delay: Duration,
    fail_open: bool,
    read_fault: bool,
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<State>,
    cond: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// In-memory [`UsbPlatform`]
///
/// Every handle talks to the same emulated printer. Cloning the platform
/// shares the printer, so a test can keep a clone for inspection.
#[derive(Debug, Clone, Default)]
pub struct DummyPlatform {
    config: DummyConfig,
    shared: Arc<Shared>,
}

impl DummyPlatform {
    /// Create a platform with the given configuration
    pub fn new(config: DummyConfig) -> Self {
        Self {
            config,
            shared: Arc::default(),
        }
    }

    /// Number of handles opened so far
    pub fn open_count(&self) -> usize {
        self.shared.lock().opens
    }

    /// Whether a handle is currently open
    pub fn is_open(&self) -> bool {
        self.shared.lock().open_handle.is_some()
    }

    /// Line configurations applied so far, oldest first
    pub fn configs(&self) -> Vec<LineConfig> {
        self.shared.lock().configs.clone()
    }

    /// Baud rate of the most recent configuration
    pub fn current_baud(&self) -> Option<u32> {
        self.shared.lock().configs.last().map(|c| c.baud_rate)
    }

    /// Current DTR and RTS levels
    pub fn line_signals(&self) -> (bool, bool) {
        let state = self.shared.lock();
        (state.dtr, state.rts)
    }

    /// How many times DTR and RTS were both asserted
    pub fn line_assert_count(&self) -> usize {
        self.shared.lock().line_asserts
    }

    /// Every byte written to the printer
    pub fn written(&self) -> Vec<u8> {
        self.shared.lock().written.clone()
    }

    /// Make writes fail with a timeout until cleared
    pub fn set_stall_writes(&self, stall: bool) {
        self.shared.lock().stall_writes = stall;
    }

    /// Make every write block for `delay` before the printer takes it
    pub fn set_write_delay(&self, delay: Duration) {
        self.shared.lock().write_delay = delay;
    }

    /// Make opening fail until cleared
    pub fn set_fail_open(&self, fail: bool) {
        self.shared.lock().fail_open = fail;
    }

    /// Make the reader of the open handle fail, as if the USB link dropped
    pub fn inject_read_fault(&self) {
        self.shared.lock().read_fault = true;
        self.shared.cond.notify_all();
    }

    /// Queue bytes as if the printer sent them unprompted
    pub fn push_reply(&self, data: &[u8]) {
        self.shared.lock().replies.extend(data);
        self.shared.cond.notify_all();
    }
}

impl UsbPlatform for DummyPlatform {
    fn open(&self, driver: &DriverInstance) -> PortResult<Box<dyn SerialHandle>> {
        let mut state = self.shared.lock();
        if state.fail_open {
            return Err(PortError::NotFound(driver.device().display_name().to_string()));
        }
        state.opens += 1;
        let id = state.opens;
        state.open_handle = Some(id);
        state.read_fault = false;
        state.dtr = false;
        state.rts = false;
        state.replies.clear();
        state.line_buf.clear();
        log::debug!(
            "dummy: opened handle {} for {} ({})",
            id,
            driver.device().display_name(),
            driver.family()
        );
        Ok(Box::new(DummyHandle {
            id,
            config: self.config.clone(),
            shared: Arc::clone(&self.shared),
            closed: Arc::new(AtomicBool::new(false)),
        }))
    }
}

struct DummyHandle {
    id: usize,
    config: DummyConfig,
    shared: Arc<Shared>,
    closed: Arc<AtomicBool>,
}

impl DummyHandle {
    fn check_open(&self) -> PortResult<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(PortError::Closed)
        } else {
            Ok(())
        }
    }

    fn respond(config: &DummyConfig, line: &[u8], replies: &mut VecDeque<u8>) {
        let line = String::from_utf8_lossy(line);
        let command = line.split_whitespace().next().unwrap_or("");
        let reply = match command {
            "" => return,
            "M105" => "ok T:21.0 /0.0 B:20.0 /0.0\n".to_string(),
            "M115" => format!("FIRMWARE_NAME:{} PROTOCOL_VERSION:1.0\nok\n", config.firmware_name),
            _ => "ok\n".to_string(),
        };
        replies.extend(reply.as_bytes());
    }
}

impl SerialHandle for DummyHandle {
    fn configure(&mut self, config: &LineConfig) -> PortResult<()> {
        self.check_open()?;
        self.shared.lock().configs.push(*config);
        Ok(())
    }

    fn set_dtr(&mut self, level: bool) -> PortResult<()> {
        self.check_open()?;
        let mut state = self.shared.lock();
        state.dtr = level;
        if state.dtr && state.rts {
            state.line_asserts += 1;
        }
        Ok(())
    }

    fn set_rts(&mut self, level: bool) -> PortResult<()> {
        self.check_open()?;
        let mut state = self.shared.lock();
        state.rts = level;
        if state.dtr && state.rts {
            state.line_asserts += 1;
        }
        Ok(())
    }

    fn write(&mut self, data: &[u8], timeout: Duration) -> PortResult<()> {
        self.check_open()?;
        let delay = self.shared.lock().write_delay;
        if !delay.is_zero() {
            thread::sleep(delay);
        }
        let mut state = self.shared.lock();
        if state.stall_writes {
            return Err(PortError::Timeout(timeout));
        }
        state.written.extend_from_slice(data);

        let mut replies = std::mem::take(&mut state.replies);
        for &byte in data {
            if byte == b'\n' {
                let line = std::mem::take(&mut state.line_buf);
                Self::respond(&self.config, &line, &mut replies);
            } else {
                state.line_buf.push(byte);
            }
        }
        state.replies = replies;
        drop(state);
        self.shared.cond.notify_all();
        Ok(())
    }

    fn reader(&mut self) -> PortResult<Box<dyn SerialReader>> {
        self.check_open()?;
        Ok(Box::new(DummyReader {
            poll: self.config.read_poll,
            shared: Arc::clone(&self.shared),
            closed: Arc::clone(&self.closed),
        }))
    }

    fn is_open(&self) -> bool {
        !self.closed.load(Ordering::Acquire)
    }

    fn close(&mut self) -> PortResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let mut state = self.shared.lock();
        if state.open_handle == Some(self.id) {
            state.open_handle = None;
        }
        drop(state);
        self.shared.cond.notify_all();
        log::debug!("dummy: closed handle {}", self.id);
        Ok(())
    }
}

impl Drop for DummyHandle {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

struct DummyReader {
    poll: Duration,
    shared: Arc<Shared>,
    closed: Arc<AtomicBool>,
}

impl SerialReader for DummyReader {
    fn read(&mut self, buf: &mut [u8]) -> PortResult<usize> {
        let mut state = self.shared.lock();
        loop {
            if self.closed.load(Ordering::Acquire) {
                return Ok(0);
            }
            if state.read_fault {
                state.read_fault = false;
                return Err(PortError::Io(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "device disconnected",
                )));
            }
            if !state.replies.is_empty() {
                let n = buf.len().min(state.replies.len());
                for (dst, src) in buf.iter_mut().zip(state.replies.drain(..n)) {
                    *dst = src;
                }
                return Ok(n);
            }
            state = match self.shared.cond.wait_timeout(state, self.poll) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }
}
