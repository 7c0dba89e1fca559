use serde::Serialize;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Feed, price source or RPC endpoint unreachable or timed out.
    #[error("network unavailable: {0}")]
    NetworkUnavailable(String),

    #[error("malformed response: {0}")]
    MalformedResponse(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    InvalidInput(String),

    #[error("store error: {0}")]
    Store(#[from] rusqlite::Error),

    /// A stored JSON column could not be decoded.
    #[error("corrupt wallet record {address}: {reason}")]
    Corrupt { address: String, reason: String },
}

impl Error {
    /// Whether retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::NetworkUnavailable(_))
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::NetworkUnavailable(_) => ErrorKind::NetworkUnavailable,
            Error::MalformedResponse(_) => ErrorKind::MalformedResponse,
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::InvalidInput(_) => ErrorKind::InvalidInput,
            Error::Store(_) | Error::Corrupt { .. } => ErrorKind::Internal,
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            Error::MalformedResponse(e.to_string())
        } else {
            Error::NetworkUnavailable(e.to_string())
        }
    }
}

impl From<ethers::providers::ProviderError> for Error {
    fn from(e: ethers::providers::ProviderError) -> Self {
        Error::NetworkUnavailable(e.to_string())
    }
}

impl From<ethers::abi::Error> for Error {
    fn from(e: ethers::abi::Error) -> Self {
        Error::MalformedResponse(e.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NetworkUnavailable,
    MalformedResponse,
    NotFound,
    InvalidInput,
    Internal,
}

/// Structured form of a query failure handed to the request layer.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorReport {
    #[serde(rename = "type")]
    pub kind: ErrorKind,
    pub status: &'static str,
    pub reason: String,
}

impl From<&Error> for ErrorReport {
    fn from(e: &Error) -> Self {
        ErrorReport {
            kind: e.kind(),
            status: "error",
            reason: e.to_string(),
        }
    }
}
