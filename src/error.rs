//! Crate-wide error type. Each variant corresponds to one row of the
//! connection engine's error table; none of them are retried, all are
//! terminal for the connection they occur on.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("no Sec-WebSocket-Key header found in the handshake request")]
    HandshakeMissingKey,

    #[error("handshake request did not terminate with a blank line")]
    HandshakeIncomplete,

    #[error("malformed HTTP request during handshake: {0}")]
    HandshakeMalformed(#[from] httparse::Error),

    #[error("I/O error during handshake: {0}")]
    HandshakeIo(std::io::Error),

    #[error("I/O error reading a frame: {0}")]
    Io(#[from] std::io::Error),

    #[error("reserved bits set in frame header")]
    ReservedBitsSet,

    #[error("invalid opcode: {0:#x}")]
    InvalidOpcode(u8),

    #[error("client frame was not masked")]
    FrameNotMasked,

    #[error("continuation frame received with no message in progress")]
    UnexpectedContinuation,

    #[error("new data frame received while a fragmented message is still in progress")]
    FragmentedMessageInProgress,

    #[error("control frame was fragmented or exceeded 125 bytes of payload")]
    ControlFrameMalformed,

    #[error("message exceeded the configured maximum frame length")]
    FrameTooLarge,

    #[error("text payload was not valid UTF-8")]
    InvalidUtf8,

    #[error("close frame carried an invalid close code: {0}")]
    InvalidCloseCode(u16),

    #[error("connection slot table is full")]
    RegistryFull,

    #[error("unknown or no-longer-live connection handle")]
    UnknownHandle,

    #[error("failed to send frame to peer")]
    SendFailed,

    #[error("connection context was requested at a different type than it was stored with")]
    ContextTypeMismatch,
}

impl Error {
    /// The close code the server should emit (if any) in response to this error,
    /// per the policy table in the specification's error handling section.
    pub fn close_code(&self) -> Option<u16> {
        match self {
            Error::ReservedBitsSet
            | Error::InvalidOpcode(_)
            | Error::FrameNotMasked
            | Error::UnexpectedContinuation
            | Error::FragmentedMessageInProgress
            | Error::ControlFrameMalformed
            | Error::InvalidCloseCode(_) => Some(1002),
            Error::InvalidUtf8 => Some(1007),
            _ => None,
        }
    }
}
