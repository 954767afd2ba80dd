//! Error types, one enum per failure scope.
//!
//! None of these abort the process: room errors go back to the requester,
//! protocol violations are logged and ignored, channel and transfer errors
//! end one session or one file.

use thiserror::Error;

/// Capacity and lookup failures reported by the rendezvous registry
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RoomError {
    #[error("room {0} is full")]
    RoomFull(String),
    #[error("room {0} not found")]
    RoomNotFound(String),
    #[error("reconnection to room {0} failed")]
    ReconnectionFailed(String),
}

/// Failures of the framed direct channel
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("channel closed")]
    Closed,
    #[error("frame too large: {0} bytes")]
    FrameTooLarge(usize),
    #[error("unknown frame type: {0:#04x}")]
    UnknownFrameType(u8),
    #[error("control frame is not valid UTF-8")]
    InvalidUtf8,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Receiver-side protocol violations. Logged and ignored; the transfer
/// state is left as it was.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolViolation {
    #[error("data frame of {len} bytes with no file being received")]
    DataWithoutActiveFile { len: usize },
    #[error("metadata for {incoming} while {active} is still being received")]
    ConcurrentMetadata { active: String, incoming: String },
    #[error("fileEnd for {got} while receiving {active}")]
    MismatchedFileEnd { active: String, got: String },
    #[error("fileEnd for unknown file {0}")]
    UnknownFileEnd(String),
    #[error("duplicate fileEnd for already finalized file {0}")]
    DuplicateFileEnd(String),
    #[error("malformed control message: {0}")]
    MalformedControl(String),
    #[error("file rejected: {0}")]
    FileRejected(String),
}

/// Failures that end one outgoing file
#[derive(Debug, Error)]
pub enum TransferError {
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("source ended after {actual} of {expected} declared bytes")]
    SourceTruncated { expected: u64, actual: u64 },
    #[error("a transfer is already in progress")]
    Busy,
    #[error("no direct channel is open")]
    NotConnected,
}
