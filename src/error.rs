use thiserror::Error;

use crate::status::HubError;

/// Result type used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by transports, tokens and the client
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Socket level failure
    #[error("i/o error: {0}")]
    IoError(#[from] std::io::Error),
    /// TLS negotiation failure
    #[error("tls error: {0}")]
    TlsError(#[from] native_tls::Error),
    /// HTTP client failure
    #[cfg(feature = "https")]
    #[error("http error: {0}")]
    HttpError(#[from] hyper::Error),
    /// Payload could not be (de)serialized
    #[error("json error: {0}")]
    JsonError(#[from] serde_json::Error),
    /// The hub answered with an error status
    #[error(transparent)]
    Hub(#[from] HubError),
    /// A message was offered to a transport that is closed
    #[error("transport is closed")]
    TransportClosed,
    /// An operation was attempted before `open()`
    #[error("{0} has not been opened")]
    NotInitialized(&'static str),
    /// Adding a message would push the batch past the wire limit
    #[error("batch of {size} bytes exceeds the {limit} byte limit")]
    BatchCapacity {
        /// Serialized size the batch would have had
        size: usize,
        /// Configured limit
        limit: usize,
    },
    /// Caller supplied an unusable value
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// Key material or identity could not produce a token
    #[error("authentication error: {0}")]
    Authentication(String),
    /// A bounded wait elapsed
    #[error("operation timed out")]
    Timeout,
    /// Unexpected protocol traffic
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Error::Timeout
    }
}
