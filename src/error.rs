use std::io;
use std::time::SystemTimeError;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error, PartialEq)]
#[non_exhaustive]
pub enum Error {
    #[error("no transport or STUN client provided")]
    ErrNoTransport,
    #[error("client is closed")]
    ErrClientClosed,
    #[error("i/o timeout")]
    ErrTimeout,
    #[error("transaction canceled")]
    ErrCanceled,
    #[error("connection with TURN server lost")]
    ErrConnectionLost,
    #[error("allocation is dead")]
    ErrAllocationDead,
    #[error("only one allocation is allowed")]
    ErrOneAllocateOnly,
    #[error("response missing required attribute")]
    ErrMalformedResponse,
    #[error("message-integrity check failed")]
    ErrIntegrityFailed,
    #[error("server error: {code} {reason}")]
    ErrServer { code: u16, reason: String },
    #[error("channel number not in [0x4000, 0x7FFF]")]
    ErrInvalidChannelNumber,
    #[error("channel already bound")]
    ErrAlreadyBound,
    #[error("no free channel number")]
    ErrNoChannelsFree,
    #[error("channel binding not found")]
    ErrChannelBindNotFound,
    #[error("permission already exists for this peer")]
    ErrPermissionExists,
    #[error("unsupported peer address type")]
    ErrUnsupportedPeerType,
    #[error("conduit is closed")]
    ErrClosed,
    #[error("unexpected EOF")]
    ErrUnexpectedEof,
    #[error("channel data length mismatch")]
    ErrBadChannelDataLength,
    #[error("unexpected STUN request message")]
    ErrUnexpectedStunRequest,
    #[error("{0}")]
    Stun(#[from] stun::Error),
    #[error("{0}")]
    Io(#[from] IoError),
    #[error("{0}")]
    Other(String),
}

#[derive(Debug, Error)]
#[error("io error: {0}")]
pub struct IoError(#[from] pub io::Error);

// Workaround for wanting PartialEq for io::Error.
impl PartialEq for IoError {
    fn eq(&self, _: &Self) -> bool {
        false
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(IoError(e))
    }
}

impl From<SystemTimeError> for Error {
    fn from(e: SystemTimeError) -> Self {
        Error::Other(e.to_string())
    }
}
