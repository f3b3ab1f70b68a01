use crate::error::HttpError;
use bytes::{Bytes, BytesMut};
use http::header::{CONTENT_TYPE, LOCATION, RETRY_AFTER};
use http::{HeaderMap, StatusCode, Version};
use http_body_util::BodyExt;
use std::time::{Duration, SystemTime};
use url::Url;

/// Delay requested by a `Retry-After` header.
///
/// Accepts delta-seconds and HTTP-dates. A date in the past, a negative
/// number or anything unparseable yields `None`.
#[must_use]
pub fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    let raw = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();
    match raw.parse::<u64>() {
        Ok(secs) => Some(Duration::from_secs(secs)),
        Err(_) => httpdate::parse_http_date(raw)
            .ok()?
            .duration_since(SystemTime::now())
            .ok(),
    }
}

/// Body type handed out by the default transport, possibly decompressed
pub type ResponseBody =
    http_body_util::combinators::BoxBody<Bytes, Box<dyn std::error::Error + Send + Sync>>;

/// Status line and headers of a response received by one attempt.
///
/// The body travels separately (as [`Bytes`]) so that error kinds, auth
/// challenges and the parse step can all borrow the same head cheaply.
#[derive(Debug, Clone)]
pub struct ResponseHead {
    status: StatusCode,
    version: Version,
    headers: HeaderMap,
    url: Url,
}

impl ResponseHead {
    /// Create a response head for a request sent to `url`
    #[must_use]
    pub fn new(status: StatusCode, headers: HeaderMap, url: Url) -> Self {
        Self {
            status,
            version: Version::HTTP_11,
            headers,
            url,
        }
    }

    pub(crate) fn from_parts(parts: http::response::Parts, url: Url) -> Self {
        Self {
            status: parts.status,
            version: parts.version,
            headers: parts.headers,
            url,
        }
    }

    #[must_use]
    pub fn status(&self) -> StatusCode {
        self.status
    }

    #[must_use]
    pub fn version(&self) -> Version {
        self.version
    }

    #[must_use]
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// URL of the request that produced this response
    #[must_use]
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Raw `Content-Type` header value, if present and valid UTF-8
    #[must_use]
    pub fn content_type(&self) -> Option<&str> {
        self.headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
    }

    /// `Location` header resolved against the request URL
    #[must_use]
    pub fn location(&self) -> Option<Url> {
        let raw = self
            .headers
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())?;
        self.url.join(raw).ok()
    }

    /// Parsed `Retry-After` header, if present and valid
    #[must_use]
    pub fn retry_after(&self) -> Option<Duration> {
        parse_retry_after(&self.headers)
    }

    /// Whether the `Content-Type` declares a JSON document
    /// (`application/json`, `text/json` or any `+json` suffix type)
    #[must_use]
    pub fn is_json(&self) -> bool {
        self.content_type()
            .and_then(|ct| ct.parse::<mime::Mime>().ok())
            .is_some_and(|m| {
                let plain = m.subtype() == mime::JSON
                    && (m.type_() == mime::APPLICATION || m.type_() == mime::TEXT);
                plain || m.suffix() == Some(mime::JSON)
            })
    }
}

/// JSON error document of a response declaring one. Only objects count;
/// `null` members are dropped at every depth.
pub(crate) fn parse_json_body(head: &ResponseHead, body: &Bytes) -> Option<serde_json::Value> {
    if body.is_empty() || !head.is_json() {
        return None;
    }
    match serde_json::from_slice(body).ok()? {
        serde_json::Value::Object(map) => Some(strip_nulls(serde_json::Value::Object(map))),
        _ => None,
    }
}

fn strip_nulls(value: serde_json::Value) -> serde_json::Value {
    use serde_json::Value;

    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .filter(|(_, v)| !v.is_null())
                .map(|(k, v)| (k, strip_nulls(v)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.into_iter().map(strip_nulls).collect()),
        other => other,
    }
}

/// Buffer `body`, giving up as soon as more than `limit` bytes arrive.
///
/// Behind the decompression layer `limit` applies to decoded bytes.
///
/// # Errors
/// `HttpError::BodyTooLarge` past the limit, `HttpError::Transport` if the
/// body stream fails
pub async fn read_body_limited(body: ResponseBody, limit: usize) -> Result<Bytes, HttpError> {
    let mut body = std::pin::pin!(body);
    let mut buf = BytesMut::new();

    while let Some(frame) = body.frame().await.transpose().map_err(HttpError::Transport)? {
        let Ok(data) = frame.into_data() else {
            continue;
        };
        let actual = buf.len() + data.len();
        if actual > limit {
            return Err(HttpError::BodyTooLarge { limit, actual });
        }
        buf.extend_from_slice(&data);
    }

    Ok(buf.freeze())
}
