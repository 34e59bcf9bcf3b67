use std::io;

use thiserror::Error;

use crate::http::Status;

/// Central error type for the ferry engine.
#[derive(Debug, Error)]
pub enum FerryError {
    /// Underlying I/O error from the OS or network.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Invalid or unreadable configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// The reactor owning an inbox has exited and no longer drains it.
    #[error("reactor inbox is closed")]
    QueueClosed,
}

pub type FerryResult<T> = Result<T, FerryError>;

/// A protocol error raised while parsing a request head.
///
/// Every `HttpError` becomes a queued error response. A `fatal` error
/// closes the connection once that response has been flushed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{} {}: {message}", status.code(), status.reason())]
pub struct HttpError {
    pub status: Status,
    pub message: String,
    pub fatal: bool,
}

impl HttpError {
    pub fn new(status: Status, message: impl Into<String>, fatal: bool) -> Self {
        Self {
            status,
            message: message.into(),
            fatal,
        }
    }

    pub fn bad_request(message: impl Into<String>, fatal: bool) -> Self {
        Self::new(Status::BadRequest, message, fatal)
    }

    pub fn uri_too_long(message: impl Into<String>, fatal: bool) -> Self {
        Self::new(Status::UriTooLong, message, fatal)
    }

    pub fn method_not_allowed(method: &str) -> Self {
        Self::new(
            Status::MethodNotAllowed,
            format!("method {method} is not supported"),
            true,
        )
    }

    pub fn payload_too_large() -> Self {
        Self::new(
            Status::PayloadTooLarge,
            "request bodies are not accepted",
            true,
        )
    }

    pub fn not_implemented(message: impl Into<String>) -> Self {
        Self::new(Status::NotImplemented, message, true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_error_display_includes_status() {
        let err = HttpError::method_not_allowed("POST");
        assert_eq!(err.to_string(), "405 Method Not Allowed: method POST is not supported");
        assert!(err.fatal);
    }

    #[test]
    fn io_errors_convert() {
        let err: FerryError = io::Error::new(io::ErrorKind::Other, "boom").into();
        assert!(matches!(err, FerryError::Io(_)));
        assert!(err.to_string().contains("boom"));
    }
}
