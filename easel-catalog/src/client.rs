use std::time::Duration;

#[derive(Debug)]
/// An error that can occur when interacting with the client.
pub enum ClientError {
    /// An error that occurred when making a request.
    ReqwestError(reqwest::Error),
    /// An error that occurred when deserializing a response.
    DeserializationError(serde_json::Error),
    /// The catalog service returned an error.
    CatalogError {
        /// The error code.
        code: i32,
        /// The error message.
        message: Option<String>,
    },
    /// A binary endpoint returned a non-success HTTP status.
    HttpStatus(u16),
}
impl std::fmt::Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientError::ReqwestError(e) => write!(f, "Reqwest error: {e}"),
            ClientError::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            ClientError::CatalogError { code, message } => {
                write!(f, "Catalog error: {code}")?;
                if let Some(message) = message {
                    write!(f, ": {message}")?;
                }
                Ok(())
            }
            ClientError::HttpStatus(status) => write!(f, "HTTP status {status}"),
        }
    }
}
impl std::error::Error for ClientError {}
impl From<reqwest::Error> for ClientError {
    fn from(e: reqwest::Error) -> Self {
        ClientError::ReqwestError(e)
    }
}
impl From<serde_json::Error> for ClientError {
    fn from(e: serde_json::Error) -> Self {
        ClientError::DeserializationError(e)
    }
}
impl ClientError {
    /// The HTTP status carried by this error, if any.
    pub fn http_status(&self) -> Option<u16> {
        match self {
            ClientError::HttpStatus(status) => Some(*status),
            ClientError::ReqwestError(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }
}

/// A result type for the client.
pub type ClientResult<T> = Result<T, ClientError>;

/// A client for the easel catalog service.
pub struct Client {
    pub(crate) base_url: String,
    pub(crate) device_id: String,
    pub(crate) device_token: String,
    pub(crate) client: reqwest::Client,
}
impl Client {
    /// The API version of the client.
    pub const API_VERSION: &str = "1";

    /// Artwork fetches follow at most this many redirects.
    pub const MAX_REDIRECTS: usize = 5;

    /// Create a new client. `total_timeout` bounds every request end to end.
    pub fn new(
        base_url: impl Into<String>,
        device_id: impl Into<String>,
        device_token: impl Into<String>,
        total_timeout: Duration,
    ) -> Self {
        Self {
            base_url: base_url.into(),
            device_id: device_id.into(),
            device_token: device_token.into(),
            client: reqwest::Client::builder()
                .redirect(reqwest::redirect::Policy::limited(Self::MAX_REDIRECTS))
                .timeout(total_timeout)
                .build()
                .expect("reqwest client construction cannot fail with static options"),
        }
    }
}
