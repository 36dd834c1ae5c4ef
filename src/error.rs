use thiserror::Error;

/// Errors that can occur in session and stream operations
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Protocol error (malformed frame, bad unit framing, etc.)
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Stream is closed and has nothing left to read
    #[error("broken stream")]
    BrokenStream,

    /// Close was called on a stream that is already closed
    #[error("trying to close a closed stream")]
    RepeatClose,

    /// Session was closed or dropped
    #[error("Session closed")]
    SessionClosed,

    /// No stream IDs left for this side of the session
    #[error("Stream ID space exhausted")]
    StreamIdsExhausted,

    /// Stream table is full
    #[error("Too many streams: limit is {0}")]
    TooManyStreams(usize),

    /// Frame payload too large
    #[error("Frame too large: {0} bytes (max {1})")]
    FrameTooLarge(usize, usize),

    /// Frame with neither payload nor closing notice
    #[error("Frame carries neither payload nor closing notice")]
    EmptyFrame,

    /// Rejected configuration value
    #[error("Invalid config: {0}")]
    InvalidConfig(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<Error> for std::io::Error {
    fn from(err: Error) -> Self {
        use std::io::ErrorKind;

        match err {
            Error::Io(e) => e,
            Error::BrokenStream | Error::RepeatClose | Error::SessionClosed => {
                std::io::Error::new(ErrorKind::BrokenPipe, err)
            }
            Error::Protocol(_) | Error::FrameTooLarge(_, _) | Error::EmptyFrame => {
                std::io::Error::new(ErrorKind::InvalidData, err)
            }
            other => std::io::Error::other(other),
        }
    }
}
