//! Error shapes surfaced by the runtime's request handling.

use std::error::Error as StdError;
use std::fmt;

use http::StatusCode;
use thiserror::Error;

/// A structured framework error carrying an HTTP status, the shape a
/// handler raises to produce a specific response code. May wrap an
/// underlying cause.
#[derive(Debug, Error)]
#[error("{status}: {message}")]
pub struct HttpError {
    status: StatusCode,
    message: String,
    #[source]
    cause: Option<Box<dyn StdError + Send + Sync>>,
}

impl HttpError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        HttpError {
            status,
            message: message.into(),
            cause: None,
        }
    }

    pub fn with_cause(mut self, cause: impl StdError + Send + Sync + 'static) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn cause(&self) -> Option<&(dyn StdError + 'static)> {
        self.cause.as_ref().map(|cause| cause.as_ref() as _)
    }
}

/// Any failure the runtime can report for a request.
///
/// The three variants match the three shapes a request-handling
/// failure can take: a structured framework error, a generic error
/// value, and an opaque payload that is not an error value at all.
#[derive(Debug)]
pub enum HandlerError {
    Http(HttpError),
    Unexpected(Box<dyn StdError + Send + Sync>),
    Opaque(String),
}

impl HandlerError {
    pub fn unexpected(error: impl StdError + Send + Sync + 'static) -> Self {
        HandlerError::Unexpected(Box::new(error))
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandlerError::Http(error) => error.fmt(f),
            HandlerError::Unexpected(error) => error.fmt(f),
            HandlerError::Opaque(payload) => payload.fmt(f),
        }
    }
}

impl StdError for HandlerError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            HandlerError::Http(error) => error.source(),
            HandlerError::Unexpected(error) => Some(error.as_ref()),
            HandlerError::Opaque(_) => None,
        }
    }
}

impl From<HttpError> for HandlerError {
    fn from(error: HttpError) -> Self {
        HandlerError::Http(error)
    }
}
