//! Error taxonomy for calls against the aggregator API.

use thiserror::Error;

use super::cookie::CookieError;

/// Errors produced by [`super::UpstreamClient`] and the [`super::MusicCatalog`] trait.
#[derive(Debug, Clone, Error)]
pub enum UpstreamError {
    /// Timeout, connection failure or a 5xx answer. Retried by the client.
    #[error("transient upstream failure: {0}")]
    Transient(String),

    /// Edge bot-check, missing cookies or a rejected signature.
    #[error("upstream refused the request: {0}")]
    Blocked(String),

    /// The session cookie could not be obtained.
    #[error("session cookie unavailable: {0}")]
    Cookie(#[from] CookieError),

    /// Non-retryable HTTP status.
    #[error("upstream returned status {status}: {message}")]
    Status { status: u16, message: String },

    /// The response body could not be interpreted.
    #[error("failed to parse upstream response: {0}")]
    Parse(String),

    /// The payload was well formed but contained nothing usable.
    #[error("nothing found: {0}")]
    NotFound(String),
}

impl UpstreamError {
    /// Returns true if another attempt may succeed with fresh credentials.
    pub fn is_retryable(&self) -> bool {
        matches!(self, UpstreamError::Transient(_))
    }

    pub(crate) fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() || err.is_request() {
            UpstreamError::Transient(err.to_string())
        } else if err.is_decode() || err.is_body() {
            UpstreamError::Parse(err.to_string())
        } else if let Some(status) = err.status() {
            Self::from_status(status.as_u16(), err.to_string())
        } else {
            UpstreamError::Transient(err.to_string())
        }
    }

    pub(crate) fn from_status(status: u16, message: String) -> Self {
        match status {
            401 | 403 => UpstreamError::Blocked(format!("status {}: {}", status, message)),
            500..=599 => UpstreamError::Transient(format!("status {}: {}", status, message)),
            _ => UpstreamError::Status { status, message },
        }
    }
}

pub type UpstreamResult<T> = Result<T, UpstreamError>;
