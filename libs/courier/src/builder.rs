use crate::auth::Auth;
use crate::client::{Client, ClientContext};
use crate::config::{TlsRootConfig, TransportConfig, TransportSecurity};
use crate::environment::{Defaults, Environment};
use crate::error::HttpError;
use crate::queue::CompletionQueue;
use crate::redirect::RedirectConfig;
use crate::retry::RetryPolicy;
use crate::transport::{HyperTransport, Transport};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;

/// Builder for a [`Client`].
///
/// Transport settings only apply to the default [`HyperTransport`]; an
/// injected [`Transport`] is used as-is. Errors from fluent calls (such as
/// an unparsable base URL) are reported by [`build`](Self::build).
pub struct ClientBuilder {
    config: TransportConfig,
    defaults: Defaults,
    transport: Option<Arc<dyn Transport>>,
    runtime: Option<Handle>,
    queue: Option<CompletionQueue>,
    error: Option<HttpError>,
}

impl ClientBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(TransportConfig::default())
    }

    /// Start from a specific transport configuration
    #[must_use]
    pub fn with_config(config: TransportConfig) -> Self {
        Self {
            config,
            defaults: Defaults::default(),
            transport: None,
            runtime: None,
            queue: None,
            error: None,
        }
    }

    /// Per-attempt limit. Retries start with a fresh budget; an expired
    /// attempt fails with `HttpError::Timeout` and goes to the retry policy.
    #[must_use]
    pub fn timeout(mut self, limit: Duration) -> Self {
        self.config.attempt_timeout = limit;
        self
    }

    #[must_use]
    pub fn user_agent(mut self, agent: impl Into<String>) -> Self {
        self.config.user_agent = agent.into();
        self
    }

    /// Bodies larger than `bytes` (after decompression) fail the attempt
    #[must_use]
    pub fn max_body_size(mut self, bytes: usize) -> Self {
        self.config.max_body_size = bytes;
        self
    }

    /// Schemes the client accepts; see [`TransportSecurity`]
    #[must_use]
    pub fn transport_security(mut self, security: TransportSecurity) -> Self {
        self.config.security = security;
        self
    }

    /// Accept `http://` URLs. Compiled in for debug builds and behind the
    /// `allow-insecure-http` feature only.
    #[must_use]
    #[cfg(any(debug_assertions, feature = "allow-insecure-http"))]
    pub fn allow_insecure_http(mut self) -> Self {
        tracing::warn!(target: "courier::security", "plain http enabled, traffic is unencrypted");
        self.config.security = TransportSecurity::AllowInsecureHttp;
        self
    }

    #[must_use]
    pub fn tls_roots(mut self, roots: TlsRootConfig) -> Self {
        self.config.tls_roots = roots;
        self
    }

    /// Attempts allowed to queue for the transport (at least 1)
    #[must_use]
    pub fn buffer_capacity(mut self, slots: usize) -> Self {
        self.config.buffer_capacity = slots.max(1);
        self
    }

    #[must_use]
    pub fn max_redirects(mut self, hops: usize) -> Self {
        self.config.redirect.max_redirects = hops;
        self
    }

    /// Disable redirect following; every 3xx becomes `UnexpectedRedirect`
    #[must_use]
    pub fn no_redirects(mut self) -> Self {
        self.config.redirect = RedirectConfig::disabled();
        self
    }

    #[must_use]
    pub fn redirect(mut self, config: RedirectConfig) -> Self {
        self.config.redirect = config;
        self
    }

    /// How long pooled connections may idle; `None` for hyper-util's default
    #[must_use]
    pub fn pool_idle_timeout(mut self, idle: Option<Duration>) -> Self {
        self.config.pool_idle_timeout = idle;
        self
    }

    #[must_use]
    pub fn pool_max_idle_per_host(mut self, connections: usize) -> Self {
        self.config.pool_max_idle_per_host = connections;
        self
    }

    #[must_use]
    pub fn environment(mut self, environment: Environment) -> Self {
        self.defaults.set_environment(Some(environment));
        self
    }

    /// Shorthand for [`environment`](Self::environment) with a parsed URL
    #[must_use]
    pub fn base_url(mut self, base_url: &str) -> Self {
        if self.error.is_some() {
            return self;
        }
        match Environment::new(base_url) {
            Ok(environment) => self.defaults.set_environment(Some(environment)),
            Err(e) => self.error = Some(e),
        }
        self
    }

    /// Auth for requests targeting the environment's origin
    #[must_use]
    pub fn default_auth(mut self, auth: Arc<dyn Auth>) -> Self {
        self.defaults.set_auth(Some(auth));
        self
    }

    #[must_use]
    pub fn default_retry_policy(mut self, policy: Arc<dyn RetryPolicy>) -> Self {
        self.defaults.set_retry_policy(Some(policy));
        self
    }

    /// Use `transport` instead of the default [`HyperTransport`]
    #[must_use]
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Runtime to run tasks on. Defaults to the runtime `build` is called on.
    #[must_use]
    pub fn runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// Default completion queue. Defaults to the runtime's blocking pool.
    #[must_use]
    pub fn completion_queue(mut self, queue: CompletionQueue) -> Self {
        self.queue = Some(queue);
        self
    }

    /// Build the client
    ///
    /// # Errors
    /// Returns an error if a fluent call failed, no runtime is available,
    /// or the default transport cannot be built (TLS setup, user agent)
    pub fn build(mut self) -> Result<Client, HttpError> {
        if let Some(deferred) = self.error.take() {
            return Err(deferred);
        }

        let runtime = match self.runtime {
            Some(runtime) => runtime,
            None => Handle::try_current().map_err(HttpError::RuntimeUnavailable)?,
        };

        let transport = match self.transport {
            Some(transport) => transport,
            None => {
                // The transport's buffer worker is spawned onto `runtime`.
                let _guard = runtime.enter();
                Arc::new(HyperTransport::new(&self.config)?) as Arc<dyn Transport>
            }
        };

        let queue = self
            .queue
            .unwrap_or_else(|| CompletionQueue::Runtime(runtime.clone()));

        tracing::debug!(security = ?self.config.security, ?queue, "client ready");

        let context = ClientContext {
            transport,
            runtime,
            security: self.config.security,
            queue,
        };
        Ok(Client::from_parts(context, self.defaults))
    }
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}
