//! Failures of request construction and of single network attempts.
//!
//! Classified outcomes of completed exchanges (bad status, unexpected
//! content type, undecodable body) are not here; see
//! [`ErrorKind`](crate::ErrorKind).

use std::error::Error as StdError;
use std::time::Duration;
use thiserror::Error;

type Cause = Box<dyn StdError + Send + Sync>;

/// Why a URL was rejected. Match on this instead of the message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum InvalidUriKind {
    /// Not a syntactically valid URL
    ParseError,
    /// No host
    MissingAuthority,
    /// A relative path with no environment to resolve it against
    NoBaseUrl,
}

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum HttpError {
    #[error("invalid URL `{url}`: {reason}")]
    InvalidUri {
        url: String,
        kind: InvalidUriKind,
        /// Human-readable detail, not stable across releases
        reason: String,
    },

    /// Scheme refused by the client's [`TransportSecurity`](crate::TransportSecurity)
    #[error("scheme `{scheme}` refused: {reason}")]
    InvalidScheme { scheme: String, reason: String },

    #[error("bad header name: {0}")]
    InvalidHeaderName(#[from] http::header::InvalidHeaderName),

    #[error("bad header value: {0}")]
    InvalidHeaderValue(#[from] http::header::InvalidHeaderValue),

    #[error("could not assemble request: {0}")]
    RequestBuild(#[from] http::Error),

    #[error("could not encode JSON body: {0}")]
    Json(#[from] serde_json::Error),

    #[error("could not encode form body: {0}")]
    FormEncode(#[from] serde_urlencoded::ser::Error),

    /// Connection setup, I/O or protocol failure
    #[error("network failure: {0}")]
    Transport(#[source] Cause),

    #[error("TLS failure: {0}")]
    Tls(#[source] Cause),

    /// One attempt exceeded the transport's attempt timeout
    #[error("attempt timed out after {0:?}")]
    Timeout(Duration),

    #[error("response body over {limit} bytes (read {actual})")]
    BodyTooLarge { limit: usize, actual: usize },

    /// The transport's request buffer is full
    #[error("transport overloaded")]
    Overloaded,

    /// The transport's background worker is gone
    #[error("transport closed")]
    ServiceClosed,

    #[error("no Tokio runtime to run tasks on: {0}")]
    RuntimeUnavailable(#[source] tokio::runtime::TryCurrentError),
}

impl HttpError {
    /// Timeouts, TLS and connection failures. Errors raised while building
    /// the request, and transport back-pressure, are not network failures.
    #[must_use]
    pub fn is_network_failure(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Timeout(_) | Self::Tls(_))
    }

    pub(crate) fn invalid_uri(
        url: impl Into<String>,
        kind: InvalidUriKind,
        reason: impl Into<String>,
    ) -> Self {
        Self::InvalidUri {
            url: url.into(),
            kind,
            reason: reason.into(),
        }
    }
}

impl From<hyper::Error> for HttpError {
    fn from(err: hyper::Error) -> Self {
        Self::Transport(Box::new(err))
    }
}

impl From<hyper_util::client::legacy::Error> for HttpError {
    fn from(err: hyper_util::client::legacy::Error) -> Self {
        Self::Transport(Box::new(err))
    }
}
