use std::sync::Arc;

/// Represents a result type for operations in this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Enum representing possible errors that can occur while synchronizing or evaluating flags.
#[derive(thiserror::Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// Client was created with an empty deployment key.
    #[error("api key must be set")]
    MissingApiKey,

    /// Invalid server URL configuration.
    #[error("invalid server url configuration")]
    InvalidServerUrl(#[source] url::ParseError),

    /// The request was unauthorized, possibly due to an invalid deployment key.
    #[error("unauthorized, deployment key is likely invalid")]
    Unauthorized,

    /// Server responded with an unexpected status code.
    #[error("unexpected response status: {0}")]
    HttpStatus(u16),

    /// Cohort exceeds the configured maximum cohort size. Not retried.
    #[error("cohort exceeds max cohort size")]
    CohortTooLarge,

    /// One or more cohorts could not be downloaded. Holds the failed cohort ids.
    #[error("cohorts failed to download: {}", .0.join(", "))]
    CohortDownloadFailed(Vec<String>),

    /// The stream did not deliver its first message within the connection timeout.
    #[error("stream connection timed out")]
    StreamConnectTimeout,

    /// No message (including heartbeats) was received within the keepalive timeout.
    #[error("stream keepalive timed out")]
    StreamKeepaliveTimeout,

    /// The server closed the stream.
    #[error("stream disconnected")]
    StreamDisconnected,

    /// The stream delivered a payload that could not be parsed as flag configs.
    #[error("stream received corrupt data")]
    StreamCorruptData(#[source] Arc<serde_json::Error>),

    /// Transport level stream failure.
    #[error("stream error: {0}")]
    Stream(String),

    /// Flag dependencies form a cycle. Holds the dependency path.
    #[error("detected a cycle between flags {0:?}")]
    DependencyCycle(Vec<String>),

    /// A background worker thread panicked. This should normally never happen.
    #[error("background thread panicked")]
    ThreadPanicked,

    /// An I/O error.
    #[error(transparent)]
    // std::io::Error is not clonable, so we're wrapping it in an Arc.
    Io(Arc<std::io::Error>),

    /// Network error.
    #[error(transparent)]
    Network(Arc<reqwest::Error>),

    /// Response body is not valid JSON for the expected type.
    #[error(transparent)]
    Json(Arc<serde_json::Error>),
}

impl Error {
    /// Whether a request that failed with this error is worth retrying.
    pub(crate) fn is_transient(&self) -> bool {
        match self {
            Error::Network(_) => true,
            Error::HttpStatus(status) => *status == 429 || (500..600).contains(status),
            _ => false,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(Arc::new(value))
    }
}

impl From<reqwest::Error> for Error {
    fn from(value: reqwest::Error) -> Self {
        Error::Network(Arc::new(value.without_url()))
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Error::Json(Arc::new(value))
    }
}

impl From<url::ParseError> for Error {
    fn from(value: url::ParseError) -> Self {
        Error::InvalidServerUrl(value)
    }
}
