//! Terminal task outcomes and response classification.

use crate::auth::Auth;
use crate::error::HttpError;
use crate::response::{ResponseHead, parse_json_body};
use bytes::Bytes;
use http::StatusCode;
use std::sync::Arc;
use thiserror::Error;
use url::Url;

/// Boxed error returned by a parse step.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Closed set of reasons a task can fail.
///
/// Every variant except [`ErrorKind::Parse`] reaches exactly one decision
/// point (the auth challenge handler for `Unauthorized`, the retry policy for
/// the others) before it becomes terminal.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ErrorKind {
    /// 401 on a request that carried an auth, after the auth declined to
    /// retry (or had already used its single retry).
    #[error("unauthorized: {} returned 401", .response.url())]
    Unauthorized {
        /// The auth that produced the rejected credential
        auth: Arc<dyn Auth>,
        response: ResponseHead,
        body: Bytes,
        /// Body parsed as JSON when the response declared a JSON document
        json: Option<serde_json::Value>,
    },

    /// 204 where the caller's parse step requires a body
    #[error("unexpected 204 No Content from {}", .response.url())]
    UnexpectedNoContent { response: ResponseHead },

    /// 2xx with a `Content-Type` outside the accepted set
    #[error("unexpected content type {content_type:?} from {}", .response.url())]
    UnexpectedContentType {
        /// `None` when the header was absent
        content_type: Option<String>,
        response: ResponseHead,
        body: Bytes,
    },

    /// 3xx the transport did not follow
    #[error("unexpected redirect {status} from {}", .response.url())]
    UnexpectedRedirect {
        status: StatusCode,
        /// `Location` header resolved against the request URL
        location: Option<Url>,
        response: ResponseHead,
        body: Bytes,
    },

    /// Any other non-2xx status
    #[error("request to {} failed with status {status}", .response.url())]
    FailedResponse {
        status: StatusCode,
        response: ResponseHead,
        body: Bytes,
        json: Option<serde_json::Value>,
    },

    /// The attempt never produced a response
    #[error(transparent)]
    Transport(#[from] HttpError),

    /// The parse step rejected a successful response
    #[error("failed to parse response: {0}")]
    Parse(#[source] BoxError),
}

impl ErrorKind {
    pub(crate) fn unauthorized(auth: Arc<dyn Auth>, response: ResponseHead, body: Bytes) -> Self {
        let json = parse_json_body(&response, &body);
        ErrorKind::Unauthorized {
            auth,
            response,
            body,
            json,
        }
    }

    /// Response that produced this error, if one was received
    #[must_use]
    pub fn response(&self) -> Option<&ResponseHead> {
        match self {
            ErrorKind::Unauthorized { response, .. }
            | ErrorKind::UnexpectedNoContent { response }
            | ErrorKind::UnexpectedContentType { response, .. }
            | ErrorKind::UnexpectedRedirect { response, .. }
            | ErrorKind::FailedResponse { response, .. } => Some(response),
            ErrorKind::Transport(_) | ErrorKind::Parse(_) => None,
        }
    }

    /// HTTP status of the response, if one was received
    #[must_use]
    pub fn status(&self) -> Option<StatusCode> {
        self.response().map(ResponseHead::status)
    }

    /// Raw response body carried by the error
    #[must_use]
    pub fn body(&self) -> Option<&Bytes> {
        match self {
            ErrorKind::Unauthorized { body, .. }
            | ErrorKind::UnexpectedContentType { body, .. }
            | ErrorKind::UnexpectedRedirect { body, .. }
            | ErrorKind::FailedResponse { body, .. } => Some(body),
            _ => None,
        }
    }

    /// Parsed JSON error document, if any
    #[must_use]
    pub fn json(&self) -> Option<&serde_json::Value> {
        match self {
            ErrorKind::Unauthorized { json, .. } | ErrorKind::FailedResponse { json, .. } => {
                json.as_ref()
            }
            _ => None,
        }
    }

    /// `true` for connection, TLS and timeout failures
    #[must_use]
    pub fn is_network_failure(&self) -> bool {
        matches!(self, ErrorKind::Transport(e) if e.is_network_failure())
    }
}

/// The single result delivered to a task's completion sink.
#[derive(Debug)]
pub enum Outcome<T> {
    /// Classified success; `value` is what the parse step returned
    Success { response: ResponseHead, value: T },
    /// Terminal failure, with the last response if one was received
    Failure {
        response: Option<ResponseHead>,
        error: ErrorKind,
    },
    /// The task was canceled before it finished
    Canceled,
}

impl<T> Outcome<T> {
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success { .. })
    }

    #[must_use]
    pub fn is_canceled(&self) -> bool {
        matches!(self, Outcome::Canceled)
    }

    /// Final response, if any was received
    #[must_use]
    pub fn response(&self) -> Option<&ResponseHead> {
        match self {
            Outcome::Success { response, .. } => Some(response),
            Outcome::Failure { response, .. } => response.as_ref(),
            Outcome::Canceled => None,
        }
    }

    #[must_use]
    pub fn error(&self) -> Option<&ErrorKind> {
        match self {
            Outcome::Failure { error, .. } => Some(error),
            _ => None,
        }
    }

    /// Consume the outcome and return the parsed value on success
    #[must_use]
    pub fn into_value(self) -> Option<T> {
        match self {
            Outcome::Success { value, .. } => Some(value),
            _ => None,
        }
    }

    /// Map the success value, leaving failures and cancellation untouched
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Outcome<U> {
        match self {
            Outcome::Success { response, value } => Outcome::Success {
                response,
                value: f(value),
            },
            Outcome::Failure { response, error } => Outcome::Failure { response, error },
            Outcome::Canceled => Outcome::Canceled,
        }
    }
}

/// Untyped outcome handed from the executor to the completion wrapper,
/// which runs the parse step and produces an [`Outcome<T>`].
#[derive(Debug)]
pub(crate) enum Completion {
    Success { response: ResponseHead, body: Bytes },
    Failure {
        response: Option<ResponseHead>,
        error: ErrorKind,
    },
    Canceled,
}

impl Completion {
    pub(crate) fn failure(error: ErrorKind) -> Self {
        let response = error.response().cloned();
        Completion::Failure { response, error }
    }

    /// Run the parse step on a classified success. A parse error becomes a
    /// terminal [`ErrorKind::Parse`] that keeps the response.
    pub(crate) fn into_outcome<T, P>(self, parse: P) -> Outcome<T>
    where
        P: FnOnce(&ResponseHead, Bytes) -> Result<T, BoxError>,
    {
        match self {
            Completion::Success { response, body } => match parse(&response, body) {
                Ok(value) => Outcome::Success { response, value },
                Err(e) => Outcome::Failure {
                    response: Some(response),
                    error: ErrorKind::Parse(e),
                },
            },
            Completion::Failure { response, error } => Outcome::Failure { response, error },
            Completion::Canceled => Outcome::Canceled,
        }
    }

    pub(crate) fn label(&self) -> &'static str {
        match self {
            Completion::Success { .. } => "success",
            Completion::Failure { .. } => "failure",
            Completion::Canceled => "canceled",
        }
    }
}

/// What the caller expects from a successful response.
#[derive(Debug, Clone, Default)]
pub struct Expectations {
    accept: Vec<mime::Mime>,
    requires_body: bool,
}

impl Expectations {
    /// Accept any content type, allow 204
    #[must_use]
    pub fn any() -> Self {
        Self::default()
    }

    /// Expect a JSON document (`application/json` or `+json`) with a body
    #[must_use]
    pub fn json() -> Self {
        Self {
            accept: vec![mime::APPLICATION_JSON],
            requires_body: true,
        }
    }

    #[must_use]
    pub fn with_accept(mut self, accept: Vec<mime::Mime>) -> Self {
        self.accept = accept;
        self
    }

    #[must_use]
    pub fn with_requires_body(mut self, requires_body: bool) -> Self {
        self.requires_body = requires_body;
        self
    }

    /// Accepted media types; empty means any
    #[must_use]
    pub fn accept(&self) -> &[mime::Mime] {
        &self.accept
    }

    #[must_use]
    pub fn requires_body(&self) -> bool {
        self.requires_body
    }

    fn accepts(&self, content_type: Option<&str>) -> bool {
        if self.accept.is_empty() {
            return true;
        }
        let Some(actual) = content_type.and_then(|ct| ct.parse::<mime::Mime>().ok()) else {
            return false;
        };
        self.accept.iter().any(|expected| media_matches(expected, &actual))
    }
}

/// `expected` may use `*` for type or subtype. `application/json` also
/// accepts structured-syntax suffix types such as `application/problem+json`.
fn media_matches(expected: &mime::Mime, actual: &mime::Mime) -> bool {
    if expected.type_() != mime::STAR && expected.type_() != actual.type_() {
        return false;
    }
    if expected.subtype() == mime::STAR || expected.subtype() == actual.subtype() {
        return true;
    }
    actual.suffix().is_some_and(|suffix| suffix == expected.subtype())
}

/// Result of classifying one received response.
#[derive(Debug)]
pub(crate) enum Classified {
    Success,
    /// 401 on a request with an auth attached
    Challenge,
    Failure(ErrorKind),
}

/// Map a response to success, an auth challenge, or a typed failure.
///
/// Order: 401 with auth, 3xx, 204 without an allowed empty body, content
/// type mismatch (any status), other non-2xx.
pub(crate) fn classify(
    head: &ResponseHead,
    body: &Bytes,
    expectations: &Expectations,
    has_auth: bool,
) -> Classified {
    let status = head.status();

    if status == StatusCode::UNAUTHORIZED && has_auth {
        return Classified::Challenge;
    }

    if status.is_redirection() {
        return Classified::Failure(ErrorKind::UnexpectedRedirect {
            status,
            location: head.location(),
            response: head.clone(),
            body: body.clone(),
        });
    }

    if status == StatusCode::NO_CONTENT {
        if expectations.requires_body {
            return Classified::Failure(ErrorKind::UnexpectedNoContent {
                response: head.clone(),
            });
        }
        return Classified::Success;
    }

    let content_type = head.content_type();
    // An empty untyped body carries nothing to mismatch.
    let untyped_empty = body.is_empty() && content_type.is_none();
    if !untyped_empty && !expectations.accepts(content_type) {
        return Classified::Failure(ErrorKind::UnexpectedContentType {
            content_type: content_type.map(str::to_owned),
            response: head.clone(),
            body: body.clone(),
        });
    }

    if !status.is_success() {
        return Classified::Failure(ErrorKind::FailedResponse {
            status,
            response: head.clone(),
            body: body.clone(),
            json: parse_json_body(head, body),
        });
    }

    Classified::Success
}
