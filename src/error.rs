//! Error taxonomy for the VICI client
// (c) 2024 Ross Younger

use std::io;

/// The error type returned by fallible operations throughout this crate.
///
/// This is a flat enum rather than a hierarchy of contexts, mirroring the small,
/// closed set of failure modes the VICI wire protocol actually exhibits (see the
/// protocol specification's error handling section).
#[derive(thiserror::Error, Debug)]
pub enum VError {
    /// A value could not be encoded: it was too large for its length field, or
    /// was not one of the three permitted `Message` value shapes.
    #[error("encoding error: {0}")]
    Encoding(String),

    /// Bytes read from the peer did not conform to the wire grammar.
    #[error("malformed message: {0}")]
    Malformed(String),

    /// The underlying stream failed, reached EOF, or was closed. This is always
    /// terminal for the owning [`crate::connection::Connection`]; it must be reopened.
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),

    /// The peer's reply was not of the type this operation expected (e.g. an
    /// `EventConfirm` where a `CmdResponse` was expected), or the server rejected
    /// an event (un)registration as unknown.
    #[error("protocol mismatch: {0}")]
    ProtocolMismatch(String),

    /// A `CmdResponse` whose body carried `success = "no"`.
    #[error("command failed: {0}")]
    CommandFailed(String),

    /// The caller's cancellation token fired, or its deadline elapsed, while an
    /// operation was suspended. Reported preferentially over any I/O error the
    /// cancellation itself induced.
    #[error("operation cancelled")]
    Cancelled,

    /// The connection's reader task has terminated and the response queue or
    /// subscriber sink has been closed as part of its cleanup.
    #[error("connection closed")]
    Closed,
}

impl VError {
    pub(crate) fn malformed(msg: impl Into<String>) -> Self {
        Self::Malformed(msg.into())
    }

    pub(crate) fn encoding(msg: impl Into<String>) -> Self {
        Self::Encoding(msg.into())
    }

    pub(crate) fn protocol_mismatch(msg: impl Into<String>) -> Self {
        Self::ProtocolMismatch(msg.into())
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, VError>;
