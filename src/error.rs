//! Error types for port access, connection slots and the send pipeline.
//!
//! Parse errors, buffer overflow and listener panics have no variant here:
//! they are logged where they happen and never cross the public boundary.

use thiserror::Error;

use crate::port::PortDirection;

#[derive(Error, Debug)]
pub enum Error {
    #[error("no {direction} port matches search term '{term}'")]
    PortNotFound { direction: PortDirection, term: String },

    #[error("failed to open port '{id}': {reason}")]
    PortOpenFailed { id: String, reason: String },

    #[error("port '{id}' is no longer available")]
    ConnectionLost { id: String },

    #[error("output port is not connected")]
    NotConnected,

    #[error("MIDI send failed: {0}")]
    Send(String),

    #[error("MIDI backend error: {0}")]
    Backend(String),

    #[error("connection thread already running")]
    AlreadyRunning,

    #[error("slot has been closed")]
    SlotClosed,

    #[error("send pipeline has been shut down")]
    PipelineClosed,

    #[error("invalid config: {0}")]
    Config(String),
}

#[cfg(feature = "midir")]
impl From<midir::InitError> for Error {
    fn from(e: midir::InitError) -> Self {
        Error::Backend(e.to_string())
    }
}

#[cfg(feature = "midir")]
impl From<midir::SendError> for Error {
    fn from(e: midir::SendError) -> Self {
        Error::Send(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
