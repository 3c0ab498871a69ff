//! Error types for the transport and codec layer.
//!
//! # Design
//! Failures are grouped by where they happen: reaching the daemon
//! (`ConnectionError`), moving bytes (`IoError`), framing the HTTP exchange
//! (`ProtocolError`), and reading or writing tar archives (`ArchiveError`).
//! None of them are retried here. Callers that want a retry policy match on
//! the variant and decide for themselves.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::endpoint::{Endpoint, ParseEndpointError};

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error returned by every fallible operation in this crate.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Io(#[from] IoError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Archive(#[from] ArchiveError),

    #[error("invalid endpoint: {0}")]
    Endpoint(#[from] ParseEndpointError),

    /// A JSON request body could not be serialized, or a JSON-lines stream
    /// contained a value that could not be decoded.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<io::Error> for Error {
    /// Unwraps errors that were tunnelled through `std::io::Read` by
    /// `Error::into_io`, so callers see the original variant.
    fn from(err: io::Error) -> Self {
        if !err.get_ref().is_some_and(|inner| inner.is::<Error>()) {
            return Error::Io(IoError::Transport(err));
        }
        match err.into_inner().map(|inner| inner.downcast::<Error>()) {
            Some(Ok(inner)) => *inner,
            Some(Err(other)) => Error::Io(IoError::Transport(io::Error::other(other))),
            None => Error::Io(IoError::Transport(io::Error::other("unknown I/O error"))),
        }
    }
}

impl Error {
    /// Wrap this error for a `std::io::Read` implementation.
    pub(crate) fn into_io(self) -> io::Error {
        match self {
            Error::Io(IoError::Transport(err)) => err,
            Error::Io(_) => io::Error::new(io::ErrorKind::UnexpectedEof, self),
            other => io::Error::new(io::ErrorKind::InvalidData, other),
        }
    }
}

/// Opening a connection to the daemon failed.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// The Unix socket path does not exist. Usually the daemon is not running.
    #[error("socket {0} does not exist; is the daemon running?")]
    SocketNotFound(PathBuf),

    /// Nothing is listening at the endpoint.
    #[error("connection to {0} refused")]
    Refused(Endpoint),

    /// The socket exists but the current user may not open it.
    #[error("permission denied while connecting to {0}")]
    PermissionDenied(Endpoint),

    #[error("cannot connect to {endpoint}: {source}")]
    Other {
        endpoint: Endpoint,
        #[source]
        source: io::Error,
    },
}

impl ConnectionError {
    /// Classify a failed `connect` call.
    pub(crate) fn from_io(endpoint: &Endpoint, err: io::Error) -> Self {
        match (err.kind(), endpoint) {
            (io::ErrorKind::NotFound, Endpoint::Unix(path)) => {
                ConnectionError::SocketNotFound(path.clone())
            }
            (io::ErrorKind::ConnectionRefused, _) => ConnectionError::Refused(endpoint.clone()),
            (io::ErrorKind::PermissionDenied, _) => {
                ConnectionError::PermissionDenied(endpoint.clone())
            }
            _ => ConnectionError::Other {
                endpoint: endpoint.clone(),
                source: err,
            },
        }
    }
}

/// Moving bytes failed, or the peer stopped sending before it said it would.
#[derive(Debug, Error)]
pub enum IoError {
    /// EOF arrived before the declared body length was read.
    #[error("response body truncated: expected {expected} bytes, received {received}")]
    TruncatedBody { expected: u64, received: u64 },

    /// EOF arrived inside a tar header or entry.
    #[error("archive truncated: expected {expected} bytes, received {received}")]
    TruncatedArchive { expected: u64, received: u64 },

    #[error("transport I/O failed: {0}")]
    Transport(#[source] io::Error),
}

/// The peer sent something that is not the HTTP we understand.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Bad status line, bad header line, or a head cut off before the blank line.
    #[error("malformed response head: {0}")]
    MalformedHeader(String),

    #[error("malformed chunked body: {0}")]
    MalformedChunk(String),

    /// A multiplexed output frame had an unknown stream type.
    #[error("malformed multiplexed frame: {0}")]
    MalformedFrame(String),

    /// A request could not be written safely: a header name that is not a
    /// token, a header value with a line break, or a path with whitespace.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// An explicit `Content-Length` header disagrees with the body.
    #[error("Content-Length {declared} does not match body length {actual}")]
    ContentLengthMismatch { declared: String, actual: usize },
}

/// A tar archive could not be built or extracted.
#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("bad header checksum for entry {name:?}: stored {stored:?}, computed {computed:o}")]
    BadChecksum {
        name: String,
        stored: String,
        computed: u32,
    },

    /// The entry would land outside the extraction directory.
    #[error("refusing to extract {0:?} outside the destination directory")]
    UnsafePath(String),

    #[error("invalid tar header field {field}: {reason}")]
    InvalidHeader { field: &'static str, reason: String },

    #[error("entry name {0:?} does not fit in a classic tar header")]
    NameTooLong(String),

    /// Only regular files can be archived; directories are not walked.
    #[error("{0} is not a regular file")]
    NotARegularFile(PathBuf),
}
