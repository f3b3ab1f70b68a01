use crate::auth::Auth;
use crate::builder::ClientBuilder;
use crate::config::TransportSecurity;
use crate::environment::{Defaults, Environment};
use crate::error::HttpError;
use crate::queue::CompletionQueue;
use crate::request::RequestBuilder;
use crate::retry::RetryPolicy;
use crate::transport::Transport;
use arc_swap::ArcSwap;
use http::Method;
use std::sync::Arc;
use tokio::runtime::Handle;

/// Shared, immutable parts of a client.
pub(crate) struct ClientContext {
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) runtime: Handle,
    pub(crate) security: TransportSecurity,
    pub(crate) queue: CompletionQueue,
}

/// Entry point for building requests and tasks.
///
/// `Client` is `Clone + Send + Sync`; clones share the transport and the
/// defaults. Defaults (environment, auth, retry policy) live in an
/// [`ArcSwap`] and are snapshotted by every request when it is built, so
/// updating them never affects requests already constructed.
///
/// # Example
///
/// ```ignore
/// let client = Client::builder()
///     .base_url("https://api.example.com/v1/")
///     .default_auth(Arc::new(BasicAuth::new("user", "secret")))
///     .build()?;
///
/// let task = client.get("users/42").create_json_task(|outcome: Outcome<User>| {
///     // runs once, on the client's completion queue
/// })?;
/// task.resume();
/// ```
#[derive(Clone)]
pub struct Client {
    context: Arc<ClientContext>,
    defaults: Arc<ArcSwap<Defaults>>,
}

impl Client {
    pub(crate) fn from_parts(context: ClientContext, defaults: Defaults) -> Self {
        Self {
            context: Arc::new(context),
            defaults: Arc::new(ArcSwap::from_pointee(defaults)),
        }
    }

    /// Create a client with default configuration on the current runtime
    ///
    /// # Errors
    /// Returns an error if no Tokio runtime is running or TLS initialization fails
    pub fn new() -> Result<Self, HttpError> {
        ClientBuilder::new().build()
    }

    #[must_use]
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    /// Start building a request.
    ///
    /// `url` may be absolute, or relative to the environment's base URL.
    pub fn request(&self, method: Method, url: &str) -> RequestBuilder {
        let defaults = Defaults::clone(&self.defaults.load());
        RequestBuilder::new(Arc::clone(&self.context), defaults, method, url.to_owned())
    }

    pub fn get(&self, url: &str) -> RequestBuilder {
        self.request(Method::GET, url)
    }

    pub fn post(&self, url: &str) -> RequestBuilder {
        self.request(Method::POST, url)
    }

    pub fn put(&self, url: &str) -> RequestBuilder {
        self.request(Method::PUT, url)
    }

    pub fn patch(&self, url: &str) -> RequestBuilder {
        self.request(Method::PATCH, url)
    }

    pub fn delete(&self, url: &str) -> RequestBuilder {
        self.request(Method::DELETE, url)
    }

    /// Current defaults snapshot
    #[must_use]
    pub fn defaults(&self) -> Arc<Defaults> {
        self.defaults.load_full()
    }

    /// Replace all defaults at once
    pub fn set_defaults(&self, defaults: Defaults) {
        self.defaults.store(Arc::new(defaults));
    }

    pub fn set_environment(&self, environment: Option<Environment>) {
        self.defaults.rcu(|current| {
            let mut next = Defaults::clone(current);
            next.set_environment(environment.clone());
            next
        });
    }

    /// Auth attached to requests targeting the environment's origin
    pub fn set_default_auth(&self, auth: Option<Arc<dyn Auth>>) {
        self.defaults.rcu(|current| {
            let mut next = Defaults::clone(current);
            next.set_auth(auth.clone());
            next
        });
    }

    pub fn set_default_retry_policy(&self, policy: Option<Arc<dyn RetryPolicy>>) {
        self.defaults.rcu(|current| {
            let mut next = Defaults::clone(current);
            next.set_retry_policy(policy.clone());
            next
        });
    }

    /// Runtime the client's tasks run on
    #[must_use]
    pub fn runtime(&self) -> &Handle {
        &self.context.runtime
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("security", &self.context.security)
            .field("queue", &self.context.queue)
            .field("defaults", &self.defaults.load())
            .finish_non_exhaustive()
    }
}
