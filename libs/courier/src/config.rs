//! Settings of the default [`HyperTransport`](crate::HyperTransport).

use crate::redirect::RedirectConfig;
use std::time::Duration;

pub const DEFAULT_USER_AGENT: &str = concat!("courier/", env!("CARGO_PKG_VERSION"));

/// Where trust anchors for TLS come from
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[non_exhaustive]
pub enum TlsRootConfig {
    /// Bundled Mozilla roots; behaves the same on every host
    #[default]
    WebPki,
    /// The operating system's certificate store
    Native,
}

/// Which URL schemes a client accepts.
///
/// Checked when a request is built, so an `http://` URL on a `TlsOnly`
/// client fails with `HttpError::InvalidScheme` before any task exists.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[non_exhaustive]
pub enum TransportSecurity {
    #[default]
    TlsOnly,
    /// Plain `http://` allowed as well. Meant for mock servers.
    AllowInsecureHttp,
}

/// Knobs of the default transport.
///
/// The task engine itself has no timeouts or limits; everything here is
/// enforced per attempt by the transport and surfaces as an `HttpError`
/// inside `ErrorKind::Transport`.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Upper bound for one attempt up to the response head
    pub attempt_timeout: Duration,

    /// Largest decompressed body accepted, in bytes
    pub max_body_size: usize,

    pub user_agent: String,

    pub security: TransportSecurity,

    pub tls_roots: TlsRootConfig,

    /// Attempts queued ahead of the connection pool. A full queue fails new
    /// attempts with `HttpError::Overloaded` instead of waiting.
    pub buffer_capacity: usize,

    pub redirect: RedirectConfig,

    /// `None` keeps hyper-util's own idle timeout
    pub pool_idle_timeout: Option<Duration>,

    pub pool_max_idle_per_host: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            attempt_timeout: Duration::from_secs(30),
            max_body_size: 10 << 20,
            user_agent: DEFAULT_USER_AGENT.to_owned(),
            security: TransportSecurity::TlsOnly,
            tls_roots: TlsRootConfig::WebPki,
            buffer_capacity: 1024,
            redirect: RedirectConfig::default(),
            pool_idle_timeout: Some(Duration::from_secs(90)),
            pool_max_idle_per_host: 32,
        }
    }
}

impl TransportConfig {
    /// Small footprint: short timeout, 1 MiB bodies, few pooled connections
    #[must_use]
    pub fn minimal() -> Self {
        Self {
            attempt_timeout: Duration::from_secs(10),
            max_body_size: 1 << 20,
            buffer_capacity: 256,
            pool_idle_timeout: Some(Duration::from_secs(30)),
            pool_max_idle_per_host: 8,
            ..Self::default()
        }
    }

    /// [`minimal`](Self::minimal) plus plain HTTP and unrestricted
    /// redirects. Never use against real services.
    #[must_use]
    pub fn for_testing() -> Self {
        Self {
            security: TransportSecurity::AllowInsecureHttp,
            redirect: RedirectConfig::for_testing(),
            pool_idle_timeout: Some(Duration::from_secs(10)),
            pool_max_idle_per_host: 4,
            ..Self::minimal()
        }
    }
}
