//! Control packets from the pty peer
//!
//! The pty runs in packet mode: every read from the master side starts with
//! a control byte followed by the data the client wrote. Together with the
//! speed and termios flags the client configured on the slave side, that
//! read becomes one [`ControlPacket`].
//!
//! # Wire format
//!
//! Between the pty peer and the bridge a packet travels as one frame, all
//! integers little endian:
//!
//! ```text
//! offset  size  field
//! 0       1     control byte (bit 0 = start of session)
//! 1       4     termios speed code (i32)
//! 5       4     c_iflag
//! 9       4     c_oflag
//! 13      4     c_cflag
//! 17      4     c_lflag
//! 21      n     payload (absent for pure control updates)
//! ```

use bitflags::bitflags;

use crate::baud::translate_baud;
use crate::error::{BridgeError, Result};

/// Length of the frame header preceding the payload
pub const FRAME_HEADER_LEN: usize = 21;

bitflags! {
    /// Control byte flags
    ///
    /// Bit positions follow the pty packet mode status bits. Only
    /// [`ControlFlags::START`] changes the bridge's behavior; the others are
    /// kept for logging.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ControlFlags: u8 {
        /// Start of session: reopen the port and assert DTR/RTS
        const START       = 1 << 0;
        /// Output queue flushed
        const FLUSH_WRITE = 1 << 1;
        /// Output stopped (^S)
        const STOP        = 1 << 2;
        /// Output restarted (^Q)
        const RESUME      = 1 << 3;
        /// Software flow control disabled
        const NO_STOP     = 1 << 4;
        /// Software flow control enabled
        const DO_STOP     = 1 << 5;
        /// Termios changed on the slave side
        const IOCTL       = 1 << 6;
    }
}

/// Termios flag words reported by the pty peer
///
/// Carried through unchanged; the session always configures 8N1. The
/// helpers decode the character size and parity bits for diagnostics only.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TermiosFlags {
    /// Input modes (`c_iflag`)
    pub input: u32,
    /// Output modes (`c_oflag`)
    pub output: u32,
    /// Control modes (`c_cflag`)
    pub control: u32,
    /// Local modes (`c_lflag`)
    pub local: u32,
}

// Linux c_cflag bits
const CSIZE: u32 = 0o000060;
const CSTOPB: u32 = 0o000100;
const PARENB: u32 = 0o000400;
const PARODD: u32 = 0o001000;

impl TermiosFlags {
    /// Data bits requested by the client (5..=8)
    pub fn data_bits(&self) -> u8 {
        5 + ((self.control & CSIZE) >> 4) as u8
    }

    /// Line coding summary such as `8N1`
    pub fn line_summary(&self) -> String {
        let parity = match (self.control & PARENB != 0, self.control & PARODD != 0) {
            (false, _) => 'N',
            (true, false) => 'E',
            (true, true) => 'O',
        };
        let stop_bits = if self.control & CSTOPB != 0 { 2 } else { 1 };
        format!("{}{}{}", self.data_bits(), parity, stop_bits)
    }
}

/// One decoded packet from the pty peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlPacket {
    raw_frame: Vec<u8>,
    requested_baud: i32,
    termios: TermiosFlags,
}

impl ControlPacket {
    /// Build a packet from a packet-mode read
    ///
    /// `raw_frame[0]` is the control byte, the rest is payload. An empty
    /// frame is rejected with [`BridgeError::MalformedFrame`].
    pub fn decode(raw_frame: Vec<u8>, requested_baud: i32, termios: TermiosFlags) -> Result<Self> {
        if raw_frame.is_empty() {
            return Err(BridgeError::MalformedFrame("empty frame".into()));
        }
        Ok(Self {
            raw_frame,
            requested_baud,
            termios,
        })
    }

    /// The complete packet-mode read, control byte included
    pub fn raw_frame(&self) -> &[u8] {
        &self.raw_frame
    }

    /// Control byte
    pub fn control_byte(&self) -> u8 {
        self.raw_frame[0]
    }

    /// Control byte as flags
    pub fn flags(&self) -> ControlFlags {
        ControlFlags::from_bits_retain(self.control_byte())
    }

    /// Whether the peer signalled the start of a session
    pub fn is_start_signal(&self) -> bool {
        self.flags().contains(ControlFlags::START)
    }

    /// Termios speed code requested by the client
    pub fn requested_baud(&self) -> i32 {
        self.requested_baud
    }

    /// Numeric baud rate for the requested speed code
    pub fn baud_rate(&self) -> u32 {
        translate_baud(self.requested_baud)
    }

    /// Termios flag words
    pub fn termios(&self) -> TermiosFlags {
        self.termios
    }

    /// Data to write to the device (empty for pure control updates)
    pub fn payload(&self) -> &[u8] {
        &self.raw_frame[1..]
    }
}

/// Encode a packet into the frame format described in the module docs
pub fn encode_frame(
    control: u8,
    requested_baud: i32,
    termios: TermiosFlags,
    payload: &[u8],
) -> Vec<u8> {
    let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    frame.push(control);
    frame.extend_from_slice(&requested_baud.to_le_bytes());
    frame.extend_from_slice(&termios.input.to_le_bytes());
    frame.extend_from_slice(&termios.output.to_le_bytes());
    frame.extend_from_slice(&termios.control.to_le_bytes());
    frame.extend_from_slice(&termios.local.to_le_bytes());
    frame.extend_from_slice(payload);
    frame
}

fn read_u32(frame: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        frame[offset],
        frame[offset + 1],
        frame[offset + 2],
        frame[offset + 3],
    ])
}

/// Decode a frame received from the pty peer
///
/// Empty frames and frames shorter than the header are
/// [`BridgeError::MalformedFrame`].
pub fn decode_frame(frame: &[u8]) -> Result<ControlPacket> {
    if frame.is_empty() {
        return Err(BridgeError::MalformedFrame("empty frame".into()));
    }
    if frame.len() < FRAME_HEADER_LEN {
        return Err(BridgeError::MalformedFrame(format!(
            "frame of {} bytes is shorter than the {} byte header",
            frame.len(),
            FRAME_HEADER_LEN
        )));
    }

    let requested_baud = read_u32(frame, 1) as i32;
    let termios = TermiosFlags {
        input: read_u32(frame, 5),
        output: read_u32(frame, 9),
        control: read_u32(frame, 13),
        local: read_u32(frame, 17),
    };

    let mut raw_frame = Vec::with_capacity(1 + frame.len() - FRAME_HEADER_LEN);
    raw_frame.push(frame[0]);
    raw_frame.extend_from_slice(&frame[FRAME_HEADER_LEN..]);

    ControlPacket::decode(raw_frame, requested_baud, termios)
}
