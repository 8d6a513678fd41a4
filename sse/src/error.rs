//! Error types for the `sse` distribution core.
use std::error::Error as StdError;
use std::fmt;

/// Top-level error type of the distribution core.
/// Errors are modeled as a tree with `sse::error::Error` as the root, holding an
/// `error_kind` that the web layer translates into HTTP status codes. The `source`
/// field keeps the original error that caused it, if any.
#[derive(Debug)]
pub struct Error {
    pub source: Option<Box<dyn StdError + Send + Sync>>,
    pub error_kind: ErrorKind,
}

#[derive(Debug, PartialEq)]
pub enum ErrorKind {
    Internal(InternalErrorKind),
    External(ExternalErrorKind),
}

#[derive(Debug, PartialEq)]
pub enum InternalErrorKind {
    Serialization,
    /// The engine went away before it could answer.
    Shutdown,
    Other(String),
}

/// Errors caused by callers or collaborators outside the core.
#[derive(Debug, PartialEq)]
pub enum ExternalErrorKind {
    InvalidInput(String),
    /// The publisher side did not answer a handshake in time.
    PublisherUnavailable,
    Other(String),
}

impl Error {
    pub fn internal(kind: InternalErrorKind) -> Self {
        Error {
            source: None,
            error_kind: ErrorKind::Internal(kind),
        }
    }

    pub fn external(kind: ExternalErrorKind) -> Self {
        Error {
            source: None,
            error_kind: ErrorKind::External(kind),
        }
    }

    pub fn invalid_input(reason: impl Into<String>) -> Self {
        Self::external(ExternalErrorKind::InvalidInput(reason.into()))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Distribution Error: {self:?}")
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn StdError + 'static))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error {
            source: Some(Box::new(err)),
            error_kind: ErrorKind::Internal(InternalErrorKind::Serialization),
        }
    }
}

impl From<tokio::sync::oneshot::error::RecvError> for Error {
    fn from(err: tokio::sync::oneshot::error::RecvError) -> Self {
        Error {
            source: Some(Box::new(err)),
            error_kind: ErrorKind::Internal(InternalErrorKind::Shutdown),
        }
    }
}
