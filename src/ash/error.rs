use thiserror::Error;

/// Errors produced by the ASH link layer.
///
/// The parse-level variants (`Incomplete`, `InvalidChecksum`, `UnknownFrame`,
/// `InvalidDataField`) never escape the transport; malformed frames are
/// dropped and logged. The link-level variants are what callers of
/// [`AshHandle::send_data`](super::transport::AshHandle::send_data) observe.
#[derive(Debug, Error)]
pub enum Error {
    /// Not enough bytes buffered to hold a complete frame.
    #[error("incomplete frame")]
    Incomplete,
    #[error("frame checksum mismatch")]
    InvalidChecksum,
    #[error("control byte {0:#04x} does not match any frame type")]
    UnknownFrame(u8),
    #[error("frame data field is malformed")]
    InvalidDataField,
    /// The peer rejected the frame with a NAK.
    #[error("frame was not acknowledged by the NCP")]
    NotAcked,
    /// The retransmission budget was exhausted without an acknowledgement.
    #[error("no acknowledgement after {attempts} transmissions")]
    AckTimeout { attempts: u8 },
    /// The transport is in the failed state; only a reset can recover it.
    #[error("ASH transport has failed: {0}")]
    TransportFailed(&'static str),
    #[error("serial connection lost")]
    ConnectionLost,
    /// The NCP announced a reset the host did not initiate.
    #[error("NCP reset unexpectedly (code {0:#04x})")]
    UnexpectedReset(u8),
    #[error("reset handshake timed out")]
    ResetTimeout,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl PartialEq for Error {
    fn eq(&self, other: &Self) -> bool {
        core::mem::discriminant(self) == core::mem::discriminant(other)
    }
}

impl Clone for Error {
    fn clone(&self) -> Self {
        match self {
            Error::Incomplete => Error::Incomplete,
            Error::InvalidChecksum => Error::InvalidChecksum,
            Error::UnknownFrame(b) => Error::UnknownFrame(*b),
            Error::InvalidDataField => Error::InvalidDataField,
            Error::NotAcked => Error::NotAcked,
            Error::AckTimeout { attempts } => Error::AckTimeout {
                attempts: *attempts,
            },
            Error::TransportFailed(r) => Error::TransportFailed(r),
            Error::ConnectionLost => Error::ConnectionLost,
            Error::UnexpectedReset(code) => Error::UnexpectedReset(*code),
            Error::ResetTimeout => Error::ResetTimeout,
            Error::Io(e) => Error::Io(std::io::Error::new(e.kind(), e.to_string())),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
