//! Packet-mode pseudo-terminal
//!
//! The bridge owns the master side; clients open the slave. The master runs
//! in packet mode (`TIOCPKT`), so every read starts with a status byte. Each
//! read becomes one frame together with the speed and termios flags the
//! client set on the slave, which the master shares on Linux.

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::os::fd::{AsFd, AsRawFd, OwnedFd, RawFd};
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use nix::pty::openpty;
use nix::sys::termios::{self, SetArg};
use usbpty_core::packet::{encode_frame, TermiosFlags};
use usbpty_core::platform::PtyPeer;

use crate::error::{PtyError, Result};

/// Largest packet-mode read, status byte included
pub const READ_SIZE: usize = 511;

/// How long a write waits for a client to drain the slave before dropping
pub const WRITE_STALL: Duration = Duration::from_secs(1);

/// pty ioctls
mod ioctl {
    nix::ioctl_write_ptr_bad!(tiocpkt, libc::TIOCPKT, libc::c_int);
}

/// A pty with its master in packet mode
#[derive(Debug)]
pub struct PacketPty {
    master: File,
    // Held open so the master never reads EIO between clients
    _slave: OwnedFd,
    slave_path: PathBuf,
    link: Option<PathBuf>,
}

impl PacketPty {
    /// Open a pty, put the slave in raw mode and the master in packet mode
    pub fn open() -> Result<Self> {
        let pty = openpty(None, None).map_err(PtyError::Open)?;

        let mut attrs = termios::tcgetattr(pty.slave.as_fd()).map_err(PtyError::Configure)?;
        termios::cfmakeraw(&mut attrs);
        termios::tcsetattr(pty.slave.as_fd(), SetArg::TCSANOW, &attrs)
            .map_err(PtyError::Configure)?;
        let slave_path = nix::unistd::ttyname(pty.slave.as_fd()).map_err(PtyError::Configure)?;

        let master = File::from(pty.master);
        let on: libc::c_int = 1;
        // SAFETY: the fd is open and TIOCPKT reads one c_int
        unsafe { ioctl::tiocpkt(master.as_raw_fd(), &on) }.map_err(PtyError::PacketMode)?;
        set_nonblocking(master.as_raw_fd())?;

        log::debug!("Opened pty {}", slave_path.display());
        Ok(Self {
            master,
            _slave: pty.slave,
            slave_path,
            link: None,
        })
    }

    /// Path of the slave device, e.g. `/dev/pts/3`
    pub fn slave_path(&self) -> &Path {
        &self.slave_path
    }

    /// Symlink created by [`PacketPty::link`]
    pub fn link_path(&self) -> Option<&Path> {
        self.link.as_deref()
    }

    /// Point `path` at the slave device, replacing whatever is there
    ///
    /// The link is removed again when the pty is dropped.
    pub fn link(&mut self, path: impl Into<PathBuf>) -> Result<()> {
        let path = path.into();
        match fs::remove_file(&path) {
            Ok(()) => log::debug!("Replaced existing {}", path.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(source) => return Err(PtyError::Link { path, source }),
        }
        if let Err(source) = symlink(&self.slave_path, &path) {
            return Err(PtyError::Link { path, source });
        }
        self.link = Some(path);
        Ok(())
    }

    /// Speed code and flag words the client configured on the slave
    fn line_settings(&self) -> io::Result<(i32, TermiosFlags)> {
        // SAFETY: termios is plain data, all zeroes is a valid value
        let mut attrs: libc::termios = unsafe { std::mem::zeroed() };
        // SAFETY: the master fd stays open while self lives and attrs is a valid termios
        if unsafe { libc::tcgetattr(self.master.as_raw_fd(), &mut attrs) } < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: attrs was filled by a successful tcgetattr
        let speed = unsafe { libc::cfgetospeed(&attrs) };
        Ok((
            speed as i32,
            TermiosFlags {
                input: attrs.c_iflag as u32,
                output: attrs.c_oflag as u32,
                control: attrs.c_cflag as u32,
                local: attrs.c_lflag as u32,
            },
        ))
    }
}

impl PtyPeer for PacketPty {
    fn write(&self, data: &[u8]) -> io::Result<()> {
        let deadline = Instant::now() + WRITE_STALL;
        let mut rest = data;
        while !rest.is_empty() {
            match (&self.master).write(rest) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => rest = &rest[n..],
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    let left = deadline.saturating_duration_since(Instant::now());
                    if left.is_zero() || !poll_fd(self.master.as_raw_fd(), libc::POLLOUT, left)? {
                        return Err(io::Error::new(
                            io::ErrorKind::TimedOut,
                            format!("no client is reading {}", self.slave_path.display()),
                        ));
                    }
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn receive(&self, timeout: Duration) -> io::Result<Option<Vec<u8>>> {
        if !poll_fd(self.master.as_raw_fd(), libc::POLLIN, timeout)? {
            return Ok(None);
        }

        let mut buf = [0u8; READ_SIZE];
        let n = match (&self.master).read(&mut buf) {
            Ok(0) => return Ok(None),
            Ok(n) => n,
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::Interrupted =>
            {
                return Ok(None)
            }
            Err(e) => return Err(e),
        };

        let (speed, termios) = self.line_settings()?;
        log::trace!(
            "{}: status {:#04x}, {} bytes, {}",
            self.slave_path.display(),
            buf[0],
            n - 1,
            termios.line_summary()
        );
        Ok(Some(encode_frame(buf[0], speed, termios, &buf[1..n])))
    }
}

impl Drop for PacketPty {
    fn drop(&mut self) {
        let Some(link) = self.link.take() else {
            return;
        };
        // Leave the link alone if another pty took it over
        if fs::read_link(&link).is_ok_and(|target| target == self.slave_path) {
            if let Err(e) = fs::remove_file(&link) {
                log::warn!("Failed to remove {}: {}", link.display(), e);
            }
        }
    }
}

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    // SAFETY: F_GETFL takes no argument and only reads the fd's flags
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: F_SETFL takes an int and fd is the caller's open descriptor
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Wait until `fd` is ready for `events`; `false` on timeout
fn poll_fd(fd: RawFd, events: libc::c_short, timeout: Duration) -> io::Result<bool> {
    let mut pfd = libc::pollfd {
        fd,
        events,
        revents: 0,
    };
    let millis = timeout.as_millis().min(libc::c_int::MAX as u128) as libc::c_int;
    // SAFETY: pfd is a single valid pollfd
    let ret = unsafe { libc::poll(&mut pfd, 1, millis) };
    match ret {
        0 => Ok(false),
        n if n > 0 => Ok(true),
        _ => {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                Ok(false)
            } else {
                Err(err)
            }
        }
    }
}
