//! OS serial handles through `serialport`
//!
//! The kernel driver (`ftdi_sio`, `ch341`, `cp210x`, `pl2303`, `cdc_acm`)
//! exposes every adapter as a tty node. [`SerialPortPlatform`] finds the node
//! that belongs to a USB device by matching vendor id, product id and serial
//! number, and opens it.

use std::fs;
use std::io::{self, Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serialport::{FlowControl, SerialPort, SerialPortType};
use usbpty_core::driver::{DriverFamily, DriverInstance, RawUsbDevice};
use usbpty_core::error::{PortError, PortResult};
use usbpty_core::platform::{
    DataBits, LineConfig, Parity, SerialHandle, SerialReader, StopBits, UsbPlatform,
};

use crate::error::{port_error, Result, SerialError};

/// Baud rate used between opening and the first configuration
const OPEN_BAUD: u32 = 115_200;

/// Read timeout of the pump's handle; bounds how long closing takes
pub const READ_POLL: Duration = Duration::from_millis(100);

/// Where Linux lists tty nodes
const SYS_CLASS_TTY: &str = "/sys/class/tty";

/// Find the tty node of a USB device
pub fn find_port(device: &RawUsbDevice) -> Result<String> {
    let ports = serialport::available_ports()?;
    let mut fallback = None;
    for port in ports {
        let SerialPortType::UsbPort(usb) = &port.port_type else {
            continue;
        };
        if usb.vid != device.vendor_id || usb.pid != device.product_id {
            continue;
        }
        match (&device.serial_number, &usb.serial_number) {
            (Some(want), Some(have)) if want == have => return Ok(port.port_name),
            (Some(_), Some(_)) => continue,
            _ => {
                if fallback.is_none() {
                    fallback = Some(port.port_name);
                }
            }
        }
    }
    fallback.ok_or_else(|| SerialError::PortNotFound(device.identity().id()))
}

/// Kernel driver bound to a tty, read from `<sys_class_tty>/<name>/device/driver`
pub fn bound_driver(sys_class_tty: &Path, tty_name: &str) -> Option<String> {
    let link = fs::read_link(sys_class_tty.join(tty_name).join("device/driver")).ok()?;
    link.file_name().map(|name| name.to_string_lossy().into_owned())
}

/// Whether a bound driver name belongs to `expected`
///
/// Some drivers register with a suffix (`ch341-uart` for `ch341`).
pub fn driver_matches(expected: &str, bound: &str) -> bool {
    bound == expected
        || bound
            .strip_prefix(expected)
            .is_some_and(|rest| rest.starts_with('-'))
}

/// Check the driver bound to `path` against the one `family` uses
///
/// Passes when the bound driver is unknown or the family names none.
pub fn check_driver(path: &str, family: DriverFamily, bound: Option<&str>) -> Result<()> {
    let (Some(bound), Some(expected)) = (bound, family.kernel_driver()) else {
        return Ok(());
    };
    if driver_matches(expected, bound) {
        return Ok(());
    }
    Err(SerialError::DriverMismatch {
        path: path.to_string(),
        bound: bound.to_string(),
        family: family.to_string(),
        expected,
    })
}

/// Write `data` within `timeout` in total
///
/// `write_some` gets the time left and performs one partial write.
fn write_before(
    data: &[u8],
    timeout: Duration,
    mut write_some: impl FnMut(&[u8], Duration) -> io::Result<usize>,
) -> PortResult<()> {
    let deadline = Instant::now() + timeout;
    let mut rest = data;
    while !rest.is_empty() {
        let left = deadline.saturating_duration_since(Instant::now());
        if left.is_zero() {
            return Err(PortError::Timeout(timeout));
        }
        match write_some(rest, left) {
            Ok(0) => {
                return Err(PortError::Io(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "serial port accepted no data",
                )))
            }
            Ok(n) => rest = &rest[n..],
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) if e.kind() == io::ErrorKind::TimedOut => {
                return Err(PortError::Timeout(timeout))
            }
            Err(e) => return Err(PortError::Io(e)),
        }
    }
    Ok(())
}

/// [`UsbPlatform`] opening tty nodes with `serialport`
#[derive(Debug, Clone, Default)]
pub struct SerialPortPlatform;

impl SerialPortPlatform {
    /// Create the platform
    pub fn new() -> Self {
        Self
    }
}

impl UsbPlatform for SerialPortPlatform {
    fn open(&self, driver: &DriverInstance) -> PortResult<Box<dyn SerialHandle>> {
        let path = find_port(driver.device())?;
        let bound = Path::new(&path)
            .file_name()
            .and_then(|name| bound_driver(Path::new(SYS_CLASS_TTY), &name.to_string_lossy()));
        check_driver(&path, driver.family(), bound.as_deref())?;
        let port = serialport::new(&path, OPEN_BAUD)
            .flow_control(FlowControl::None)
            .timeout(READ_POLL)
            .open()
            .map_err(|source| {
                PortError::from(SerialError::OpenFailed {
                    path: path.clone(),
                    source,
                })
            })?;

        log::info!("Opened {} ({} driver)", path, driver.family());
        Ok(Box::new(SerialPortHandle {
            path,
            port: Some(port),
            closed: Arc::new(AtomicBool::new(false)),
        }))
    }
}

/// An open tty
pub struct SerialPortHandle {
    path: String,
    port: Option<Box<dyn SerialPort>>,
    closed: Arc<AtomicBool>,
}

impl SerialPortHandle {
    fn port(&mut self) -> PortResult<&mut Box<dyn SerialPort>> {
        self.port.as_mut().ok_or(PortError::Closed)
    }
}

impl SerialHandle for SerialPortHandle {
    fn configure(&mut self, config: &LineConfig) -> PortResult<()> {
        let port = self.port()?;
        port.set_baud_rate(config.baud_rate).map_err(port_error)?;
        port.set_data_bits(match config.data_bits {
            DataBits::Five => serialport::DataBits::Five,
            DataBits::Six => serialport::DataBits::Six,
            DataBits::Seven => serialport::DataBits::Seven,
            DataBits::Eight => serialport::DataBits::Eight,
        })
        .map_err(port_error)?;
        port.set_stop_bits(match config.stop_bits {
            StopBits::One => serialport::StopBits::One,
            StopBits::Two => serialport::StopBits::Two,
        })
        .map_err(port_error)?;
        port.set_parity(match config.parity {
            Parity::None => serialport::Parity::None,
            Parity::Odd => serialport::Parity::Odd,
            Parity::Even => serialport::Parity::Even,
        })
        .map_err(port_error)?;
        port.set_flow_control(FlowControl::None).map_err(port_error)?;
        log::debug!("{}: configured {:?}", self.path, config);
        Ok(())
    }

    fn set_dtr(&mut self, level: bool) -> PortResult<()> {
        self.port()?
            .write_data_terminal_ready(level)
            .map_err(port_error)
    }

    fn set_rts(&mut self, level: bool) -> PortResult<()> {
        self.port()?.write_request_to_send(level).map_err(port_error)
    }

    fn write(&mut self, data: &[u8], timeout: Duration) -> PortResult<()> {
        let port = self.port()?;
        write_before(data, timeout, |buf, left| {
            port.set_timeout(left).map_err(io::Error::from)?;
            port.write(buf)
        })
    }

    fn reader(&mut self) -> PortResult<Box<dyn SerialReader>> {
        let mut clone = self.port()?.try_clone().map_err(port_error)?;
        clone.set_timeout(READ_POLL).map_err(port_error)?;
        Ok(Box::new(SerialPortReader {
            port: clone,
            closed: Arc::clone(&self.closed),
        }))
    }

    fn is_open(&self) -> bool {
        self.port.is_some()
    }

    fn close(&mut self) -> PortResult<()> {
        self.closed.store(true, Ordering::Release);
        if self.port.take().is_some() {
            log::debug!("Closed {}", self.path);
        }
        Ok(())
    }
}

impl Drop for SerialPortHandle {
    fn drop(&mut self) {
        self.closed.store(true, Ordering::Release);
    }
}

/// Read side of a [`SerialPortHandle`]
struct SerialPortReader {
    port: Box<dyn SerialPort>,
    closed: Arc<AtomicBool>,
}

impl SerialReader for SerialPortReader {
    fn read(&mut self, buf: &mut [u8]) -> PortResult<usize> {
        loop {
            if self.closed.load(Ordering::Acquire) {
                return Ok(0);
            }
            match self.port.read(buf) {
                Ok(0) => {
                    return Err(PortError::Io(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "serial port hung up",
                    )))
                }
                Ok(n) => return Ok(n),
                Err(e)
                    if e.kind() == io::ErrorKind::TimedOut
                        || e.kind() == io::ErrorKind::Interrupted
                        || e.kind() == io::ErrorKind::WouldBlock => {}
                Err(_) if self.closed.load(Ordering::Acquire) => return Ok(0),
                Err(e) => return Err(PortError::Io(e)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::symlink;
    use std::path::PathBuf;
    use std::thread;

    fn temp_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("usbpty-{}-{}", name, std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        dir
    }

    #[test]
    fn test_driver_matches() {
        assert!(driver_matches("ftdi_sio", "ftdi_sio"));
        assert!(driver_matches("ch341", "ch341-uart"));
        assert!(!driver_matches("ch341", "ch3410"));
        assert!(!driver_matches("cdc_acm", "ftdi_sio"));
    }

    #[test]
    fn test_check_driver() {
        assert!(check_driver("/dev/ttyUSB0", DriverFamily::Ftdi, Some("ftdi_sio")).is_ok());
        assert!(check_driver("/dev/ttyUSB0", DriverFamily::Ch340, Some("ch341-uart")).is_ok());
        // Nothing to compare against
        assert!(check_driver("/dev/ttyUSB0", DriverFamily::Ftdi, None).is_ok());
        assert!(check_driver("/dev/ttyUSB0", DriverFamily::Unknown, Some("ftdi_sio")).is_ok());

        let err = check_driver("/dev/ttyUSB0", DriverFamily::Ch340, Some("ftdi_sio")).unwrap_err();
        assert!(matches!(err, SerialError::DriverMismatch { .. }));
        let msg = err.to_string();
        assert!(msg.contains("ftdi_sio"), "{}", msg);
        assert!(msg.contains("ch341"), "{}", msg);

        let err: PortError = err.into();
        assert!(matches!(err, PortError::Other(_)));
    }

    #[test]
    fn test_bound_driver_from_sysfs() {
        let root = temp_dir("sysfs");
        let device = root.join("ttyUSB0/device");
        fs::create_dir_all(&device).unwrap();
        symlink("../../../bus/usb-serial/drivers/ftdi_sio", device.join("driver")).unwrap();
        fs::create_dir_all(root.join("ttyS0")).unwrap();

        assert_eq!(bound_driver(&root, "ttyUSB0").as_deref(), Some("ftdi_sio"));
        assert_eq!(bound_driver(&root, "ttyS0"), None);
        assert_eq!(bound_driver(&root, "ttyACM9"), None);

        fs::remove_dir_all(&root).unwrap();
    }

    #[test]
    fn test_write_completes_in_pieces() {
        let mut sink = Vec::new();
        write_before(b"G28\nM105\n", Duration::from_millis(500), |buf, _| {
            let n = buf.len().min(3);
            sink.extend_from_slice(&buf[..n]);
            Ok(n)
        })
        .unwrap();
        assert_eq!(sink, b"G28\nM105\n");
    }

    #[test]
    fn test_write_deadline_covers_partial_writes() {
        let timeout = Duration::from_millis(100);
        let mut calls = 0;
        let started = Instant::now();
        // Each call accepts one byte and stays within its own timeout
        let result = write_before(&[0u8; 64], timeout, |_, left| {
            calls += 1;
            thread::sleep(left.min(Duration::from_millis(30)));
            Ok(1)
        });
        assert!(matches!(result, Err(PortError::Timeout(t)) if t == timeout));
        assert!(calls < 64);
        assert!(started.elapsed() < Duration::from_millis(300));
    }

    #[test]
    fn test_write_errors() {
        let result = write_before(b"M105\n", Duration::from_millis(100), |_, _| {
            Err(io::Error::from(io::ErrorKind::TimedOut))
        });
        assert!(matches!(result, Err(PortError::Timeout(_))));

        let result = write_before(b"M105\n", Duration::from_millis(100), |_, _| Ok(0));
        assert!(matches!(result, Err(PortError::Io(e)) if e.kind() == io::ErrorKind::WriteZero));

        let mut interrupted = false;
        let result = write_before(b"M105\n", Duration::from_millis(100), |buf, _| {
            if !interrupted {
                interrupted = true;
                return Err(io::Error::from(io::ErrorKind::Interrupted));
            }
            Ok(buf.len())
        });
        assert!(result.is_ok());
    }
}
