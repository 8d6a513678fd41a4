use std::error::Error as StdError;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use sse::error::{Error as DistributionError, ErrorKind, ExternalErrorKind, InternalErrorKind};

use log::*;

pub type Result<T> = core::result::Result<T, Error>;

#[derive(Debug)]
pub struct Error(DistributionError);

impl StdError for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> core::result::Result<(), std::fmt::Error> {
        write!(fmt, "{self:?}")
    }
}

// List of possible StatusCode variants https://docs.rs/http/latest/http/status/struct.StatusCode.html#associatedconstant.UNPROCESSABLE_ENTITY
impl IntoResponse for Error {
    fn into_response(self) -> Response {
        match self.0.error_kind {
            ErrorKind::Internal(internal_error_kind) => {
                match internal_error_kind {
                    InternalErrorKind::Serialization => error!("Failed to serialize a reply"),
                    InternalErrorKind::Shutdown => warn!("Engine shut down before replying"),
                    InternalErrorKind::Other(reason) => error!("Internal error: {reason}"),
                }
                (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL SERVER ERROR").into_response()
            }
            ErrorKind::External(external_error_kind) => match external_error_kind {
                ExternalErrorKind::InvalidInput(reason) => {
                    (StatusCode::UNPROCESSABLE_ENTITY, reason).into_response()
                }
                ExternalErrorKind::PublisherUnavailable => {
                    (StatusCode::SERVICE_UNAVAILABLE, "SERVICE UNAVAILABLE").into_response()
                }
                ExternalErrorKind::Other(reason) => {
                    warn!("External error: {reason}");
                    (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL SERVER ERROR").into_response()
                }
            },
        }
    }
}

impl<E> From<E> for Error
where
    E: Into<DistributionError>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}
