use thiserror::Error;

use crate::ash;

/// Errors surfaced by the EZSP multiplexer.
#[derive(Debug, Error)]
pub enum Error {
    /// The EZSP layer is not started (no reset has completed, or the link
    /// went down); the command was refused without touching the wire.
    #[error("EZSP is not running")]
    NotRunning,
    #[error("no response to command within the deadline")]
    CommandTimeout,
    #[error("unknown EZSP command {0:?}")]
    UnknownCommand(String),
    #[error("malformed EZSP frame: {0}")]
    Decode(&'static str),
    #[error("cannot encode parameter {0}")]
    Encode(&'static str),
    #[error("EZSP multiplexer task stopped")]
    Stopped,
    #[error(transparent)]
    Transport(#[from] ash::Error),
}

impl Clone for Error {
    fn clone(&self) -> Self {
        match self {
            Error::NotRunning => Error::NotRunning,
            Error::CommandTimeout => Error::CommandTimeout,
            Error::UnknownCommand(name) => Error::UnknownCommand(name.clone()),
            Error::Decode(what) => Error::Decode(what),
            Error::Encode(what) => Error::Encode(what),
            Error::Stopped => Error::Stopped,
            Error::Transport(e) => Error::Transport(e.clone()),
        }
    }
}

impl PartialEq for Error {
    fn eq(&self, other: &Self) -> bool {
        core::mem::discriminant(self) == core::mem::discriminant(other)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
