//! Termios speed code translation
//!
//! The pty peer reports the speed a client configured on the slave side as a
//! raw termios speed value. On Linux that is a `Bxxx` code (`B115200` is
//! `0o010002`), on the BSDs and macOS the code is the rate itself.
//! [`translate_baud`] accepts both. Anything else maps to 250000, the usual
//! 3D printer rate, which has no termios constant on Linux.

/// Rate used when the speed code is not recognized
pub const FALLBACK_BAUD: u32 = 250_000;

/// Linux `Bxxx` speed codes and their rates
const LINUX_SPEED_CODES: &[(u32, u32)] = &[
    (0o000000, 0),
    (0o000001, 50),
    (0o000002, 75),
    (0o000003, 110),
    (0o000004, 134),
    (0o000005, 150),
    (0o000006, 200),
    (0o000007, 300),
    (0o000010, 600),
    (0o000011, 1200),
    (0o000012, 1800),
    (0o000013, 2400),
    (0o000014, 4800),
    (0o000015, 9600),
    (0o000016, 19200),
    (0o000017, 38400),
    (0o010001, 57600),
    (0o010002, 115200),
    (0o010003, 230400),
    (0o010004, 460800),
    (0o010005, 500000),
    (0o010006, 576000),
    (0o010007, 921600),
    (0o010010, 1000000),
    (0o010011, 1152000),
    (0o010012, 1500000),
    (0o010013, 2000000),
    (0o010014, 2500000),
    (0o010015, 3000000),
    (0o010016, 3500000),
    (0o010017, 4000000),
];

/// Rates accepted as-is when the peer reports numeric speeds
const NUMERIC_RATES: &[u32] = &[
    50, 75, 110, 134, 150, 200, 300, 600, 1200, 1800, 2400, 4800, 9600, 14400, 19200, 28800,
    38400, 57600, 76800, 115200, 230400, 250000, 460800, 500000, 576000, 921600, 1000000,
    1152000, 1500000, 2000000, 2500000, 3000000, 3500000, 4000000,
];

/// Translate a termios speed code into a baud rate
pub fn translate_baud(code: i32) -> u32 {
    let Ok(code) = u32::try_from(code) else {
        return FALLBACK_BAUD;
    };

    if let Some(&(_, rate)) = LINUX_SPEED_CODES.iter().find(|(c, _)| *c == code) {
        return rate;
    }
    if NUMERIC_RATES.contains(&code) {
        return code;
    }

    log::trace!("Unrecognized speed code {:#o}, using {}", code, FALLBACK_BAUD);
    FALLBACK_BAUD
}
