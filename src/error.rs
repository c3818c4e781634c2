//! Error types for the enhttp tunnel client and server.

use std::sync::PoisonError;
use thiserror::Error;

/// Errors surfaced by [`crate::client::VirtualConn`] and [`crate::client::Dialer`].
///
/// These are converted to `std::io::Error` at the `AsyncRead`/`AsyncWrite`
/// boundary so a `VirtualConn` behaves like any other byte stream to
/// generic callers; reach for this enum directly when you need to tell
/// a timeout apart from a transport failure.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The read deadline elapsed before a chunk (or EOF) arrived.
    #[error("read deadline exceeded")]
    Timeout,

    /// A POST to the server failed below the HTTP layer (DNS, connect,
    /// TLS, or the request otherwise never got a response).
    #[error("request to tunnel server failed: {0}")]
    Transport(String),

    /// The server answered with a non-success status.
    #[error("tunnel server returned status {0}")]
    BadStatus(u16),

    /// The upstream response body ended or errored while being read by
    /// the receive pump.
    #[error("upstream stream error: {0}")]
    Upstream(String),

    /// A lock guarding shared connection state was poisoned.
    #[error("lock poisoned: {context}")]
    Lock { context: String },
}

pub type ClientResult<T> = Result<T, ClientError>;

impl From<ClientError> for std::io::Error {
    fn from(err: ClientError) -> Self {
        let kind = match err {
            ClientError::Timeout => std::io::ErrorKind::TimedOut,
            ClientError::BadStatus(_) | ClientError::Transport(_) => std::io::ErrorKind::Other,
            ClientError::Upstream(_) => std::io::ErrorKind::ConnectionReset,
            ClientError::Lock { .. } => std::io::ErrorKind::Other,
        };
        std::io::Error::new(kind, err)
    }
}

/// Errors the server-side handler maps directly to an HTTP status code via
/// its `IntoResponse` impl below.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Request was missing or had a malformed `X-En-Conn-Id`.
    #[error("missing or malformed connection id")]
    MissingConnId,

    /// First POST for a connection id was missing `X-Origin`.
    #[error("missing origin for new connection")]
    MissingOrigin,

    /// Dialing the requested origin failed.
    #[error("failed to dial origin {origin}: {source}")]
    Dial {
        origin: String,
        source: std::io::Error,
    },

    /// Copying the POST body into the upstream connection failed.
    #[error("failed to write to upstream: {0}")]
    UpstreamWrite(std::io::Error),
}

pub type ServerResult<T> = Result<T, ServerError>;

impl axum::response::IntoResponse for ServerError {
    fn into_response(self) -> axum::response::Response {
        let status = match &self {
            ServerError::MissingConnId | ServerError::MissingOrigin | ServerError::UpstreamWrite(_) => {
                axum::http::StatusCode::BAD_REQUEST
            }
            ServerError::Dial { .. } => axum::http::StatusCode::BAD_GATEWAY,
        };
        (status, self.to_string()).into_response()
    }
}

/// Helper trait to recover from a poisoned `std::sync` lock rather than
/// propagate the poison, mirroring the failure mode this crate actually
/// cares about: a panicking holder, not corrupted data (we never panic
/// while a guard is held).
pub trait LockResultExt<T> {
    fn recover_poison(self, context: &str) -> T;
}

impl<T> LockResultExt<T> for Result<T, PoisonError<T>> {
    fn recover_poison(self, context: &str) -> T {
        match self {
            Ok(guard) => guard,
            Err(poisoned) => {
                log::warn!(target: "enhttp::lock_recovery", "recovered poisoned lock in {context}");
                poisoned.into_inner()
            }
        }
    }
}
