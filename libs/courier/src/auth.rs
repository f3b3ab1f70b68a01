//! Authentication providers.
//!
//! An [`Auth`] contributes headers to every attempt of a task and is the
//! only party consulted when such an attempt is answered with 401. The
//! executor grants it at most one retry per task; whatever the provider
//! answers after that, the next 401 is terminal.

use crate::decision::Decision;
use crate::request::PreparedRequest;
use crate::response::ResponseHead;
use crate::secret::SecretString;
use crate::taxonomy::BoxError;
use crate::task::Task;
use arc_swap::ArcSwap;
use base64::Engine;
use bytes::Bytes;
use http::header::{AUTHORIZATION, HeaderMap, HeaderValue};
use parking_lot::Mutex;
use std::any::Any;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use zeroize::Zeroizing;

/// Identity-comparable value correlating a 401 with the credential
/// generation that produced it.
///
/// Two tokens are equal only if they wrap the very same allocation.
#[derive(Clone)]
pub struct OpaqueToken(Arc<dyn Any + Send + Sync>);

impl OpaqueToken {
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self(Arc::new(value))
    }

    /// Wrap an existing allocation; tokens built from clones of the same
    /// `Arc` compare equal.
    pub fn from_arc<T: Any + Send + Sync>(value: Arc<T>) -> Self {
        Self(value)
    }

    #[must_use]
    pub fn ptr_eq(&self, other: &OpaqueToken) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    #[must_use]
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref::<T>()
    }
}

impl PartialEq for OpaqueToken {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl Eq for OpaqueToken {}

impl fmt::Debug for OpaqueToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OpaqueToken({:p})", Arc::as_ptr(&self.0).cast::<()>())
    }
}

/// Credential provider attached to a request.
///
/// Implementations are shared across tasks and threads. Calls for one task
/// are serialized by the executor; calls for different tasks are not.
pub trait Auth: fmt::Debug + Send + Sync + 'static {
    /// Headers to add to an attempt. They replace same-named headers set on
    /// the request itself.
    fn headers(&self, request: &PreparedRequest) -> HeaderMap;

    /// Token identifying the credential used for this attempt. Handed back
    /// unchanged to [`handle_unauthorized`](Auth::handle_unauthorized).
    fn opaque_token(&self, _request: &PreparedRequest) -> Option<OpaqueToken> {
        None
    }

    /// Headers and token for one attempt. Providers whose credential can
    /// change between the two calls override this to read it once, so the
    /// token always names the credential that was sent.
    fn credentials(&self, request: &PreparedRequest) -> (HeaderMap, Option<OpaqueToken>) {
        (self.headers(request), self.opaque_token(request))
    }

    /// Decide whether a 401 should be retried.
    ///
    /// May complete `decision` synchronously or from any thread later on.
    /// Must not block the calling thread.
    fn handle_unauthorized(
        &self,
        _response: &ResponseHead,
        _body: &Bytes,
        _task: &Task,
        _token: Option<OpaqueToken>,
        decision: Decision,
    ) {
        decision.complete(false);
    }
}

/// HTTP Basic credentials.
///
/// Stateless: the header is encoded once from the username and password
/// and sent unchanged on every attempt, so a 401 is never worth retrying.
pub struct BasicAuth {
    username: String,
    header: HeaderValue,
}

impl BasicAuth {
    pub fn new(username: impl Into<String>, password: impl Into<SecretString>) -> Self {
        let username = username.into();
        let password = password.into();
        let raw = Zeroizing::new(format!("{username}:{}", password.expose()));
        let mut encoded = Zeroizing::new(String::from("Basic "));
        base64::engine::general_purpose::STANDARD.encode_string(raw.as_bytes(), &mut encoded);
        // base64 output is always a valid header value
        let mut header = HeaderValue::from_str(&encoded)
            .unwrap_or_else(|_| HeaderValue::from_static("Basic"));
        header.set_sensitive(true);
        Self { username, header }
    }

    #[must_use]
    pub fn username(&self) -> &str {
        &self.username
    }
}

impl fmt::Debug for BasicAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BasicAuth")
            .field("username", &self.username)
            .field("password", &SecretString::default())
            .finish()
    }
}

impl Auth for BasicAuth {
    fn headers(&self, _request: &PreparedRequest) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, self.header.clone());
        headers
    }
}

type RefreshFuture = Pin<Box<dyn Future<Output = Result<String, BoxError>> + Send>>;
type Refresher = Arc<dyn Fn() -> RefreshFuture + Send + Sync>;

/// One issued bearer token. The `Arc` around it is the opaque token
/// identity.
struct Generation {
    id: u64,
    /// `None` when the token is not a valid header value
    header: Option<HeaderValue>,
}

impl Generation {
    fn new(id: u64, token: &SecretString) -> Self {
        let encoded = Zeroizing::new(format!("Bearer {}", token.expose()));
        let header = match HeaderValue::from_str(&encoded) {
            Ok(mut value) => {
                value.set_sensitive(true);
                Some(value)
            }
            Err(_) => {
                tracing::warn!(
                    generation = id,
                    "bearer token is not a valid header value; requests will be sent without it"
                );
                None
            }
        };
        Self { id, header }
    }
}

struct BearerShared {
    current: ArcSwap<Generation>,
    next_id: AtomicU64,
    refresher: Option<Refresher>,
    /// Decisions waiting on the refresh in flight, `None` when idle
    waiting: Mutex<Option<Vec<Decision>>>,
}

impl BearerShared {
    fn install(&self, token: &SecretString) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.current.store(Arc::new(Generation::new(id, token)));
    }
}

/// Owns the queue of a refresh in flight. Dropping it answers every queued
/// decision, so a refresher that panics or a runtime shutting down mid
/// refresh still releases the waiting tasks.
struct RefreshGuard {
    shared: Arc<BearerShared>,
    retry: bool,
}

impl Drop for RefreshGuard {
    fn drop(&mut self) {
        let waiting = self.shared.waiting.lock().take().unwrap_or_default();
        if !self.retry && !waiting.is_empty() {
            tracing::debug!(waiting = waiting.len(), "bearer refresh ended without a token");
        }
        for decision in waiting {
            decision.complete(self.retry);
        }
    }
}

/// Refreshable bearer token.
///
/// A 401 caused by the current token triggers one asynchronous refresh;
/// concurrent challenges for the same token wait on it instead of
/// refreshing again. A 401 caused by a token that was already replaced is
/// retried immediately with the newer one.
#[derive(Clone)]
pub struct BearerAuth {
    shared: Arc<BearerShared>,
}

impl BearerAuth {
    /// Fixed token without refresh: every 401 is terminal.
    pub fn new(token: impl Into<SecretString>) -> Self {
        Self::build(token.into(), None)
    }

    /// Token that is replaced by calling `refresh` when the server rejects it.
    pub fn with_refresh<F, Fut>(token: impl Into<SecretString>, refresh: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<String, BoxError>> + Send + 'static,
    {
        let refresher: Refresher = Arc::new(move || Box::pin(refresh()));
        Self::build(token.into(), Some(refresher))
    }

    fn build(token: SecretString, refresher: Option<Refresher>) -> Self {
        Self {
            shared: Arc::new(BearerShared {
                current: ArcSwap::from_pointee(Generation::new(0, &token)),
                next_id: AtomicU64::new(1),
                refresher,
                waiting: Mutex::new(None),
            }),
        }
    }

    /// Replace the token out of band. Tasks that later hit a 401 with the
    /// old token retry with this one without refreshing.
    pub fn set_token(&self, token: impl Into<SecretString>) {
        self.shared.install(&token.into());
    }

    /// Number of tokens installed after the initial one
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.shared.current.load().id
    }

    fn start_refresh(&self, refresher: Refresher) {
        let mut guard = RefreshGuard {
            shared: Arc::clone(&self.shared),
            retry: false,
        };
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::warn!("no Tokio runtime to refresh bearer token; declining retry");
            return;
        };
        handle.spawn(async move {
            match refresher().await {
                Ok(token) => {
                    guard.shared.install(&SecretString::from(token));
                    tracing::debug!(
                        generation = guard.shared.current.load().id,
                        "bearer token refreshed"
                    );
                    guard.retry = true;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "bearer token refresh failed");
                }
            }
        });
    }
}

impl fmt::Debug for BearerAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BearerAuth")
            .field("generation", &self.generation())
            .field("refreshable", &self.shared.refresher.is_some())
            .finish_non_exhaustive()
    }
}

impl Auth for BearerAuth {
    fn headers(&self, request: &PreparedRequest) -> HeaderMap {
        self.credentials(request).0
    }

    fn opaque_token(&self, _request: &PreparedRequest) -> Option<OpaqueToken> {
        Some(OpaqueToken::from_arc(self.shared.current.load_full()))
    }

    fn credentials(&self, _request: &PreparedRequest) -> (HeaderMap, Option<OpaqueToken>) {
        let current = self.shared.current.load_full();
        let mut headers = HeaderMap::new();
        if let Some(value) = &current.header {
            headers.insert(AUTHORIZATION, value.clone());
        }
        (headers, Some(OpaqueToken::from_arc(current)))
    }

    fn handle_unauthorized(
        &self,
        _response: &ResponseHead,
        _body: &Bytes,
        task: &Task,
        token: Option<OpaqueToken>,
        decision: Decision,
    ) {
        let Some(refresher) = self.shared.refresher.clone() else {
            decision.complete(false);
            return;
        };
        let Some(token) = token else {
            decision.complete(false);
            return;
        };

        let mut waiting = self.shared.waiting.lock();
        let current = OpaqueToken::from_arc(self.shared.current.load_full());
        if token != current {
            drop(waiting);
            tracing::debug!(task_id = task.id(), "401 from superseded bearer token; retrying");
            decision.complete(true);
            return;
        }

        if let Some(queue) = waiting.as_mut() {
            tracing::trace!(task_id = task.id(), "joining bearer refresh in flight");
            queue.push(decision);
            return;
        }

        *waiting = Some(vec![decision]);
        drop(waiting);
        tracing::debug!(task_id = task.id(), "refreshing bearer token after 401");
        self.start_refresh(refresher);
    }
}
