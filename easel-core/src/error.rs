#[derive(Debug)]
/// An error that can occur inside the engine.
pub enum Error {
    /// The caller passed an argument outside the documented bounds.
    InvalidArgument(&'static str),
    /// The requested item does not exist; benign for cursor iterators.
    NotFound,
    /// An on-disk structure failed its magic, checksum, or size checks.
    Corruption(String),
    /// An I/O operation failed.
    Io(std::io::Error),
    /// A retryable remote failure (timeout, 5xx, connection loss).
    Transient(String),
    /// A non-retryable remote failure (404, 403, 410).
    Permanent(String),
    /// A construction path could not allocate what it needed.
    OutOfMemory,
    /// An explicit wait ran out of time.
    Timeout,
    /// The catalog client reported an error.
    Catalog(easel_catalog::ClientError),
}
impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::InvalidArgument(what) => write!(f, "invalid argument: {what}"),
            Error::NotFound => write!(f, "not found"),
            Error::Corruption(what) => write!(f, "corruption: {what}"),
            Error::Io(e) => write!(f, "I/O error: {e}"),
            Error::Transient(what) => write!(f, "transient failure: {what}"),
            Error::Permanent(what) => write!(f, "permanent failure: {what}"),
            Error::OutOfMemory => write!(f, "out of memory"),
            Error::Timeout => write!(f, "timed out"),
            Error::Catalog(e) => write!(f, "catalog error: {e}"),
        }
    }
}
impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            Error::Catalog(e) => Some(e),
            _ => None,
        }
    }
}
impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}
impl From<easel_catalog::ClientError> for Error {
    fn from(e: easel_catalog::ClientError) -> Self {
        Error::Catalog(e)
    }
}

/// A result type for the engine.
pub type Result<T> = std::result::Result<T, Error>;
