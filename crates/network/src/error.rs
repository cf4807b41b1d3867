//! Connection-level errors.

use ds_types::MalformedHeaderError;

/// Result alias for results that possibly return [`FrameError`].
pub type FrameResult<T> = Result<T, FrameError>;

/// Errors that end a connection. None of these are reported in a reply packet.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The peer sent a frame that cannot be decoded.
    #[error("malformed header: {0}")]
    Malformed(#[from] MalformedHeaderError),
    /// Encoding a header record failed.
    #[error("failed to encode header record: {0}")]
    Encode(#[from] bcs::Error),
    /// The connection ended in the middle of a frame.
    #[error("connection closed with {0} bytes of a partial frame buffered")]
    Truncated(usize),
    /// The connection ended while a reply was expected.
    #[error("connection closed")]
    Closed,
    /// Error conversion from [std::io::Error]
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
