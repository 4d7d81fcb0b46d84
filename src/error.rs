//! Error handling utils.
//!
//! All fallible operations in this crate return [`Result<T>`], a specialization of
//! [`std::result::Result`] around a single [`Error`] enum. The variants correspond to the error
//! kinds a fiber-oriented I/O runtime actually produces: misuse by the caller, transport
//! failures, cooperative shutdown, clean end-of-stream, and internal post-condition violations.
//!
//! Internal post-condition violations ([`Error::Internal`]) and OS worker panics are logged at
//! [`log::Level::Error`] and are expected to be treated as fatal by the caller: exceptions
//! escaping a fiber are not recoverable here.

use std::fmt;
use std::io;

/// A specialized [`Result`] type for this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// All error cases produced by this crate.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The caller violated a documented precondition (e.g. a non-sequential
    /// [`crate::net::range_reader::RangeReader::read`]).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A socket, SSL, or other transport-level error.
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),

    /// An error surfaced by the HTTP client backing [`crate::net::range_reader::RangeReader`].
    #[error("http error: {0}")]
    Http(#[from] Box<ureq::Error>),

    /// The operation did not complete before a deadline, or was cut short by a shutdown in
    /// progress.
    #[error("operation aborted")]
    Aborted,

    /// Clean end-of-stream; not an error condition by itself, but modeled as one so it can
    /// propagate through the same `Result` as transport failures.
    #[error("end of stream")]
    Eof,

    /// A post-condition the runtime itself is supposed to guarantee was violated. Callers
    /// should treat this as fatal; it is always logged at `error` before being returned.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    pub(crate) fn internal(msg: impl fmt::Display) -> Self {
        let msg = msg.to_string();
        log::error!("internal invariant violated: {msg}");
        Error::Internal(msg)
    }
}

impl From<ureq::Error> for Error {
    fn from(e: ureq::Error) -> Self {
        Error::Http(Box::new(e))
    }
}
