use std::error::Error as StdError;
use std::fmt;

/// Failures the client can run into while talking to a relay.
#[derive(Debug)]
pub enum Error {
    /// The base URL or a derived URL could not be built.
    InvalidUrl(String),
    /// The request never produced a response.
    Network(String),
    /// A response arrived but its body could not be read.
    Body(String),
    /// The push transport could not be set up.
    Stream(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::InvalidUrl(reason) => write!(f, "invalid url: {reason}"),
            Error::Network(reason) => write!(f, "network error: {reason}"),
            Error::Body(reason) => write!(f, "unreadable response body: {reason}"),
            Error::Stream(reason) => write!(f, "event stream error: {reason}"),
        }
    }
}

impl StdError for Error {}

impl From<url::ParseError> for Error {
    fn from(err: url::ParseError) -> Self {
        Error::InvalidUrl(err.to_string())
    }
}
