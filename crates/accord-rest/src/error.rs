use serde_json::Value;
use thiserror::Error;

/// Closed error taxonomy for REST calls.
///
/// Note that `429 Too Many Requests` is *not* part of this taxonomy: the
/// dispatcher treats it as a signal, logs it and returns the response body
/// to the caller (see [`crate::Dispatcher::request`]).
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("unauthorized (401), the token is invalid or missing")]
    Unauthorized,
    #[error("forbidden (403), the bot lacks access")]
    Forbidden,
    #[error("not found (404)")]
    NotFound,
    #[error("method not allowed (405)")]
    MethodNotAllowed,
    #[error("API error (status {status}, code {code:?})")]
    Client {
        status: u16,
        /// The platform's JSON error code, when the body carries one.
        code: Option<u64>,
        body: Value,
    },
    #[error("server error (status {status})")]
    Server { status: u16, body: Value },
    #[error(transparent)]
    Transport(#[from] TransportError),
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
}
