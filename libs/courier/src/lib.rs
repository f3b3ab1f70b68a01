#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![warn(warnings)]

//! Asynchronous HTTP task engine
//!
//! `courier` turns HTTP requests into [`Task`]s: cancellable units of work
//! that run on a Tokio runtime and deliver exactly one [`Outcome`] to a
//! completion callback. Between attempts a task consults two pluggable
//! collaborators:
//!
//! - an [`Auth`] provider, which decorates every attempt with headers and
//!   decides whether a `401 Unauthorized` may be retried (typically after
//!   refreshing a token);
//! - a [`RetryPolicy`], which decides whether any other failure is retried
//!   and after what delay.
//!
//! Both answer through a one-shot [`Decision`] so they can complete
//! asynchronously. A task performs at most one auth-driven retry; generic
//! retries are bounded by the policy.
//!
//! Failures are classified into [`ErrorKind`]: transport errors, non-2xx
//! statuses, unexpected redirects, unexpected content types, unexpected
//! `204 No Content` and parse failures. The response head and body are kept
//! wherever a response was received.
//!
//! # Transport
//!
//! The default [`HyperTransport`] is a hyper client behind a tower stack:
//! rustls TLS (HTTPS only unless explicitly relaxed), per-attempt timeouts,
//! transparent decompression, secure redirect following, a `User-Agent`
//! header and a bounded buffer that fails fast when full. Any other
//! [`Transport`] can be injected through [`ClientBuilder::transport`].
//!
//! # Example
//!
//! ```ignore
//! use courier::{BasicAuth, Client, Outcome, RetryBehavior, RetryStrategy};
//! use std::sync::Arc;
//!
//! let client = Client::builder()
//!     .base_url("https://api.example.com/v1/")
//!     .default_auth(Arc::new(BasicAuth::new("user", "secret")))
//!     .default_retry_policy(Arc::new(RetryBehavior::retry_network_failure(
//!         RetryStrategy::twice_with_default_delay(),
//!     )))
//!     .build()?;
//!
//! let outcome: Outcome<User> = client.get("users/42").send_json().await?;
//! ```

pub mod auth;
mod builder;
mod client;
mod config;
mod decision;
mod environment;
mod error;
mod executor;
mod queue;
mod redirect;
mod request;
mod response;
pub mod retry;
mod secret;
mod task;
mod taxonomy;
mod tls;
mod transport;

pub use auth::{Auth, BasicAuth, BearerAuth, OpaqueToken};
pub use builder::ClientBuilder;
pub use client::Client;
pub use config::{DEFAULT_USER_AGENT, TlsRootConfig, TransportConfig, TransportSecurity};
pub use decision::Decision;
pub use environment::{Defaults, Environment};
pub use error::{HttpError, InvalidUriKind};
pub use queue::{CompletionJob, CompletionQueue};
pub use redirect::{RedirectConfig, SecureRedirectPolicy};
pub use request::{
    IDEMPOTENCY_KEY_HEADER, PreparedRequest, RequestBuilder, is_idempotent_method,
    is_idempotent_request,
};
pub use response::{ResponseBody, ResponseHead, parse_retry_after};
pub use retry::{
    DEFAULT_RETRY_DELAY, ExponentialBackoff, RetryBehavior, RetryPolicy, RetryStrategy,
    calculate_backoff,
};
pub use secret::SecretString;
pub use task::{Task, TaskState};
pub use taxonomy::{BoxError, ErrorKind, Expectations, Outcome};
pub use transport::{HyperTransport, Transport, TransportFuture};
