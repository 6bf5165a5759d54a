use std::time::Duration;

pub const FLAG_BYTE: u8 = 0x7E;
pub const ESCAPE_BYTE: u8 = 0x7D;
pub const XON_BYTE: u8 = 0x11;
pub const XOFF_BYTE: u8 = 0x13;
pub const SUB_BYTE: u8 = 0x18;
pub const CANCEL_BYTE: u8 = 0x1A;

pub const RESERVED_BYTES: [u8; 6] = [
    FLAG_BYTE,
    ESCAPE_BYTE,
    XON_BYTE,
    XOFF_BYTE,
    SUB_BYTE,
    CANCEL_BYTE,
];

pub const RESET_UNKNOWN: u8 = 0x00;
pub const RESET_EXTERNAL: u8 = 0x01;
pub const RESET_POWERON: u8 = 0x02;
pub const RESET_WATCHDOG: u8 = 0x03;
pub const RESET_ASSERT: u8 = 0x06;
pub const RESET_BOOTLOADER: u8 = 0x09;
pub const RESET_SOFTWARE: u8 = 0x0B;
pub const ERROR_MAX_ACK_TIMEOUT: u8 = 0x51;
pub const ERROR_CUSTOM_EM3XX: u8 = 0x80;

pub const ASH_VERSION_2: u8 = 0x02;

/// Size of the host transmit window (maximum unacknowledged DATA frames).
pub const TX_K: usize = 5;

/// Number of transmission attempts before the link is declared dead.
pub const ACK_TIMEOUTS: u8 = 4;

pub const T_RX_ACK_INIT: Duration = Duration::from_millis(1600);
pub const T_RX_ACK_MIN: Duration = Duration::from_millis(400);
pub const T_RX_ACK_MAX: Duration = Duration::from_millis(3200);

/// How long to hold off new DATA frames after the NCP reports not-ready.
pub const T_REMOTE_NOTRDY: Duration = Duration::from_millis(1000);

/// Deadline for the RST -> RSTACK handshake.
pub const RESET_TIMEOUT: Duration = Duration::from_secs(5);
