use crate::auth::Auth;
use crate::client::ClientContext;
use crate::config::TransportSecurity;
use crate::environment::Defaults;
use crate::error::{HttpError, InvalidUriKind};
use crate::queue::CompletionQueue;
use crate::response::ResponseHead;
use crate::retry::RetryPolicy;
use crate::task::{Sink, Task, TaskConfig};
use crate::taxonomy::{BoxError, Completion, Expectations, Outcome};
use bytes::Bytes;
use http::header::{CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};
use http::Method;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use tokio::sync::oneshot;
use url::Url;

/// Header that makes a non-idempotent request safe to replay
pub const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";

/// GET, HEAD, PUT, DELETE, OPTIONS and TRACE. PATCH is not included.
#[must_use]
pub fn is_idempotent_method(method: &Method) -> bool {
    matches!(
        *method,
        Method::GET | Method::HEAD | Method::PUT | Method::DELETE | Method::OPTIONS | Method::TRACE
    )
}

/// An idempotent method, or any method with an `Idempotency-Key` header
#[must_use]
pub fn is_idempotent_request(method: &Method, headers: &HeaderMap) -> bool {
    is_idempotent_method(method) || headers.contains_key(IDEMPOTENCY_KEY_HEADER)
}

/// A request as built, before any auth headers are applied.
///
/// Every attempt of a task is derived from the same `PreparedRequest`.
#[derive(Debug, Clone)]
pub struct PreparedRequest {
    method: Method,
    url: Url,
    headers: HeaderMap,
    body: Bytes,
}

impl PreparedRequest {
    #[must_use]
    pub fn new(method: Method, url: Url, headers: HeaderMap, body: Bytes) -> Self {
        Self {
            method,
            url,
            headers,
            body,
        }
    }

    #[must_use]
    pub fn method(&self) -> &Method {
        &self.method
    }

    #[must_use]
    pub fn url(&self) -> &Url {
        &self.url
    }

    #[must_use]
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    #[must_use]
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Idempotent method, or carries an `Idempotency-Key` header
    #[must_use]
    pub fn is_idempotent(&self) -> bool {
        is_idempotent_request(&self.method, &self.headers)
    }

    /// Build the request for one attempt. Auth headers replace same-named
    /// headers of the request.
    pub(crate) fn to_http(&self, auth_headers: HeaderMap) -> Result<http::Request<Bytes>, HttpError> {
        let mut headers = self.headers.clone();
        let mut current: Option<HeaderName> = None;
        for (name, value) in auth_headers {
            if let Some(name) = name {
                headers.remove(&name);
                current = Some(name);
            }
            if let Some(name) = &current {
                headers.append(name.clone(), value);
            }
        }

        let mut request = http::Request::builder()
            .method(self.method.clone())
            .uri(self.url.as_str())
            .body(self.body.clone())?;
        *request.headers_mut() = headers;
        Ok(request)
    }
}

/// Body type for the request builder
#[derive(Clone, Debug)]
enum BodyKind {
    Empty,
    Bytes(Bytes),
    /// Serialized JSON; implies `application/json` unless overridden
    Json(Bytes),
    /// URL-encoded form; implies `application/x-www-form-urlencoded`
    Form(Bytes),
}

/// Per-request override of a client default
enum Choice<T> {
    Default,
    Explicit(T),
    Disabled,
}

/// Fluent request builder.
///
/// Created by [`Client::get`](crate::Client::get) and friends. The client's
/// [`Defaults`] are captured when the builder is created; later changes to
/// the client do not affect it.
///
/// Errors in the fluent chain (invalid header, bad URL) are deferred to the
/// terminal call.
///
/// # Example
///
/// ```ignore
/// let outcome = client
///     .get("users/42")
///     .header("x-request-id", "abc123")
///     .send_json::<User>()
///     .await?;
///
/// if let Outcome::Success { value, .. } = outcome {
///     println!("{}", value.name);
/// }
/// ```
#[must_use = "RequestBuilder does nothing until a task is created or .send() is called"]
pub struct RequestBuilder {
    context: Arc<ClientContext>,
    defaults: Defaults,
    method: Method,
    url: String,
    headers: Vec<(HeaderName, HeaderValue)>,
    body: BodyKind,
    auth: Choice<Arc<dyn Auth>>,
    retry_policy: Choice<Arc<dyn RetryPolicy>>,
    accept: Option<Vec<mime::Mime>>,
    requires_body: Option<bool>,
    queue: Option<CompletionQueue>,
    /// Error captured during building (deferred to the terminal call)
    error: Option<HttpError>,
}

impl RequestBuilder {
    pub(crate) fn new(
        context: Arc<ClientContext>,
        defaults: Defaults,
        method: Method,
        url: String,
    ) -> Self {
        Self {
            context,
            defaults,
            method,
            url,
            headers: Vec::new(),
            body: BodyKind::Empty,
            auth: Choice::Default,
            retry_policy: Choice::Default,
            accept: None,
            requires_body: None,
            queue: None,
            error: None,
        }
    }

    /// Add a single header to the request
    pub fn header(mut self, name: &str, value: &str) -> Self {
        if self.error.is_some() {
            return self;
        }

        match (HeaderName::try_from(name), HeaderValue::try_from(value)) {
            (Ok(name), Ok(value)) => self.headers.push((name, value)),
            (Err(e), _) => self.error = Some(HttpError::InvalidHeaderName(e)),
            (_, Err(e)) => self.error = Some(HttpError::InvalidHeaderValue(e)),
        }
        self
    }

    /// Add multiple headers to the request
    pub fn headers<I, K, V>(mut self, headers: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        for (name, value) in headers {
            self = self.header(name.as_ref(), value.as_ref());
        }
        self
    }

    /// Set request body as JSON
    ///
    /// Sets `Content-Type: application/json` unless a Content-Type header
    /// was provided.
    ///
    /// # Errors
    ///
    /// Returns `Err(HttpError::Json)` if serialization fails.
    pub fn json<T: Serialize>(mut self, body: &T) -> Result<Self, HttpError> {
        if let Some(e) = self.error.take() {
            return Err(e);
        }
        self.body = BodyKind::Json(Bytes::from(serde_json::to_vec(body)?));
        Ok(self)
    }

    /// Set request body as form URL-encoded
    ///
    /// # Errors
    ///
    /// Returns `Err(HttpError::FormEncode)` if encoding fails.
    pub fn form<T: Serialize + ?Sized>(mut self, fields: &T) -> Result<Self, HttpError> {
        if let Some(e) = self.error.take() {
            return Err(e);
        }
        self.body = BodyKind::Form(Bytes::from(serde_urlencoded::to_string(fields)?));
        Ok(self)
    }

    pub fn body_bytes(mut self, body: Bytes) -> Self {
        self.body = BodyKind::Bytes(body);
        self
    }

    pub fn body_string(mut self, body: String) -> Self {
        self.body = BodyKind::Bytes(Bytes::from(body));
        self
    }

    /// Use `auth` for this request, whatever its origin
    pub fn auth(mut self, auth: Arc<dyn Auth>) -> Self {
        self.auth = Choice::Explicit(auth);
        self
    }

    /// Send without any auth, even if the client has a default
    pub fn no_auth(mut self) -> Self {
        self.auth = Choice::Disabled;
        self
    }

    pub fn retry_policy(mut self, policy: Arc<dyn RetryPolicy>) -> Self {
        self.retry_policy = Choice::Explicit(policy);
        self
    }

    /// Never retry this request
    pub fn no_retry_policy(mut self) -> Self {
        self.retry_policy = Choice::Disabled;
        self
    }

    /// Media types a successful response may declare. `*` wildcards are
    /// allowed for type and subtype.
    pub fn accept_content_types(mut self, types: impl IntoIterator<Item = mime::Mime>) -> Self {
        self.accept = Some(types.into_iter().collect());
        self
    }

    /// Whether a `204 No Content` should fail with `UnexpectedNoContent`
    pub fn requires_body(mut self, requires_body: bool) -> Self {
        self.requires_body = Some(requires_body);
        self
    }

    /// Where the completion callback (and parse step) runs. Defaults to the
    /// client's queue.
    pub fn completion_queue(mut self, queue: CompletionQueue) -> Self {
        self.queue = Some(queue);
        self
    }

    /// Auth this request would carry if built now
    #[must_use]
    pub fn attached_auth(&self) -> Option<Arc<dyn Auth>> {
        let url = self.resolve_url().ok()?;
        self.select_auth(&url)
    }

    fn select_auth(&self, url: &Url) -> Option<Arc<dyn Auth>> {
        match &self.auth {
            Choice::Default => self.defaults.auth_for(url),
            Choice::Explicit(auth) => Some(Arc::clone(auth)),
            Choice::Disabled => None,
        }
    }

    /// Resolve against the environment, then validate the scheme against
    /// transport security.
    fn resolve_url(&self) -> Result<Url, HttpError> {
        let url = match Url::parse(&self.url) {
            Ok(url) => url,
            Err(url::ParseError::RelativeUrlWithoutBase) => match self.defaults.environment() {
                Some(environment) => environment.resolve(&self.url)?,
                None => {
                    return Err(HttpError::invalid_uri(
                        self.url.as_str(),
                        InvalidUriKind::NoBaseUrl,
                        "relative URL and no environment configured",
                    ));
                }
            },
            Err(e) => {
                return Err(HttpError::invalid_uri(
                    self.url.as_str(),
                    InvalidUriKind::ParseError,
                    e.to_string(),
                ));
            }
        };

        match url.scheme() {
            "https" => {}
            "http" => {
                if self.context.security == TransportSecurity::TlsOnly {
                    return Err(HttpError::InvalidScheme {
                        scheme: "http".to_owned(),
                        reason: "HTTPS required (transport security is TlsOnly)".to_owned(),
                    });
                }
            }
            scheme => {
                return Err(HttpError::InvalidScheme {
                    scheme: scheme.to_owned(),
                    reason: "only http:// and https:// schemes are supported".to_owned(),
                });
            }
        }

        if url.host_str().is_none() {
            return Err(HttpError::invalid_uri(
                self.url.as_str(),
                InvalidUriKind::MissingAuthority,
                "missing host/authority",
            ));
        }
        Ok(url)
    }

    fn into_config(mut self, json_defaults: bool) -> Result<TaskConfig, HttpError> {
        if let Some(e) = self.error.take() {
            return Err(e);
        }

        let url = self.resolve_url()?;
        let auth = self.select_auth(&url);
        let retry_policy = match self.retry_policy {
            Choice::Default => self.defaults.retry_policy().cloned(),
            Choice::Explicit(policy) => Some(policy),
            Choice::Disabled => None,
        };

        let mut headers = HeaderMap::with_capacity(self.headers.len() + 1);
        for (name, value) in self.headers {
            headers.append(name, value);
        }
        let (body, implied_type) = match self.body {
            BodyKind::Empty => (Bytes::new(), None),
            BodyKind::Bytes(b) => (b, None),
            BodyKind::Json(b) => (b, Some("application/json")),
            BodyKind::Form(b) => (b, Some("application/x-www-form-urlencoded")),
        };
        if let Some(content_type) = implied_type
            && !headers.contains_key(CONTENT_TYPE)
        {
            headers.insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
        }

        let base = if json_defaults {
            Expectations::json()
        } else {
            Expectations::any()
        };
        let mut expectations = base;
        if let Some(accept) = self.accept {
            expectations = expectations.with_accept(accept);
        }
        if let Some(requires_body) = self.requires_body {
            expectations = expectations.with_requires_body(requires_body);
        }

        Ok(TaskConfig {
            request: PreparedRequest::new(self.method, url, headers, body),
            auth,
            retry_policy,
            expectations,
            transport: Arc::clone(&self.context.transport),
            queue: self.queue.unwrap_or_else(|| self.context.queue.clone()),
            runtime: self.context.runtime.clone(),
        })
    }

    /// Create a task whose successful responses go through `parse`.
    ///
    /// The task is not started; call [`Task::resume`]. `on_complete` runs
    /// exactly once, on the completion queue.
    ///
    /// # Errors
    ///
    /// Returns `HttpError` if building the request failed (invalid header,
    /// URL or scheme).
    pub fn create_task<T, P, F>(self, parse: P, on_complete: F) -> Result<Task, HttpError>
    where
        T: 'static,
        P: FnOnce(&ResponseHead, Bytes) -> Result<T, BoxError> + Send + 'static,
        F: FnOnce(Outcome<T>) + Send + 'static,
    {
        let config = self.into_config(false)?;
        let sink: Sink = Box::new(move |completion: Completion| {
            on_complete(completion.into_outcome(parse));
        });
        Ok(Task::new(config, sink))
    }

    /// Create a task delivering the raw response body.
    ///
    /// # Errors
    ///
    /// See [`create_task`](Self::create_task).
    pub fn create_data_task<F>(self, on_complete: F) -> Result<Task, HttpError>
    where
        F: FnOnce(Outcome<Bytes>) + Send + 'static,
    {
        self.create_task(|_, body| Ok(body), on_complete)
    }

    /// Create a task decoding the response body as JSON.
    ///
    /// Unless overridden, the response must declare a JSON content type and
    /// a `204` fails with `UnexpectedNoContent`.
    ///
    /// # Errors
    ///
    /// See [`create_task`](Self::create_task).
    pub fn create_json_task<T, F>(self, on_complete: F) -> Result<Task, HttpError>
    where
        T: DeserializeOwned + 'static,
        F: FnOnce(Outcome<T>) + Send + 'static,
    {
        let config = self.into_config(true)?;
        let sink: Sink = Box::new(move |completion: Completion| {
            on_complete(completion.into_outcome(|_, body| {
                serde_json::from_slice(&body).map_err(BoxError::from)
            }));
        });
        Ok(Task::new(config, sink))
    }

    /// Run the request and wait for its outcome.
    ///
    /// Dropping the returned future cancels the task. Unless a queue was set
    /// explicitly, completion runs inline on the executor.
    ///
    /// # Errors
    ///
    /// Returns `HttpError` if building the request failed. Failures of the
    /// request itself are reported through the [`Outcome`].
    pub async fn send(self) -> Result<Outcome<Bytes>, HttpError> {
        let (tx, rx) = oneshot::channel();
        let task = self.inline_unless_set().create_data_task(move |outcome| {
            tx.send(outcome).ok();
        })?;
        Ok(run_to_outcome(task, rx).await)
    }

    /// Like [`send`](Self::send), decoding the body as JSON.
    ///
    /// # Errors
    ///
    /// Returns `HttpError` if building the request failed.
    pub async fn send_json<T>(self) -> Result<Outcome<T>, HttpError>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let task = self.inline_unless_set().create_json_task(move |outcome| {
            tx.send(outcome).ok();
        })?;
        Ok(run_to_outcome(task, rx).await)
    }

    fn inline_unless_set(mut self) -> Self {
        if self.queue.is_none() {
            self.queue = Some(CompletionQueue::Inline);
        }
        self
    }
}

/// Cancels the task when the awaiting future is dropped early.
struct CancelOnDrop(Task);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

async fn run_to_outcome<T>(task: Task, rx: oneshot::Receiver<Outcome<T>>) -> Outcome<T> {
    let guard = CancelOnDrop(task);
    guard.0.resume();
    // A custom queue that drops the job never reports back.
    rx.await.unwrap_or(Outcome::Canceled)
}
