//! Redirect policy of the default transport.
//!
//! A redirect the policy refuses is not an error at the transport level: the
//! 3xx response is handed back unchanged and the task engine classifies it
//! as [`ErrorKind::UnexpectedRedirect`](crate::ErrorKind::UnexpectedRedirect).

use http::{Request, Uri, header};
use std::collections::HashSet;
use tower_http::follow_redirect::policy::{Action, Attempt, Policy};

/// Which redirects the default transport follows on its own.
///
/// ```rust,ignore
/// let config = RedirectConfig {
///     allowed_hosts: HashSet::from(["cdn.example.com".to_owned()]),
///     ..RedirectConfig::default()
/// };
/// ```
#[derive(Debug, Clone)]
pub struct RedirectConfig {
    /// Hops followed per attempt; `0` follows none
    pub max_redirects: usize,

    /// Refuse hops to another scheme, host or port, except to `allowed_hosts`
    pub same_origin_only: bool,

    /// Bare host names trusted as cross-origin targets
    pub allowed_hosts: HashSet<String>,

    /// Drop `Authorization`, `Cookie` and `Proxy-Authorization` once a hop
    /// has left the original origin
    pub strip_credentials: bool,

    /// Follow `https` to `http` hops
    pub allow_downgrade: bool,
}

impl Default for RedirectConfig {
    fn default() -> Self {
        Self {
            max_redirects: 10,
            same_origin_only: true,
            allowed_hosts: HashSet::new(),
            strip_credentials: true,
            allow_downgrade: false,
        }
    }
}

impl RedirectConfig {
    /// Any host, credentials still stripped on the way out
    #[must_use]
    pub fn permissive() -> Self {
        Self {
            same_origin_only: false,
            ..Self::default()
        }
    }

    /// Hand every 3xx back to the task engine
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            max_redirects: 0,
            ..Self::default()
        }
    }

    /// Mock servers only: any host, downgrades allowed
    #[must_use]
    pub fn for_testing() -> Self {
        Self {
            allow_downgrade: true,
            ..Self::permissive()
        }
    }
}

/// Stripped when a redirect leaves the original origin
const CREDENTIAL_HEADERS: [header::HeaderName; 3] = [
    header::AUTHORIZATION,
    header::COOKIE,
    header::PROXY_AUTHORIZATION,
];

/// Origin of a URI with scheme-default ports filled in. A missing scheme is
/// treated as https so comparisons fail closed.
fn origin(uri: &Uri) -> (&str, &str, u16) {
    let scheme = uri.scheme_str().unwrap_or("https");
    let port = uri.port_u16().unwrap_or(match scheme {
        "http" => 80,
        "https" => 443,
        _ => 0,
    });
    (scheme, uri.host().unwrap_or_default(), port)
}

/// Why a redirect was not followed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Refusal {
    Limit,
    Downgrade,
    CrossOrigin,
}

/// `tower_http` redirect policy enforcing [`RedirectConfig`].
///
/// Cloned per request by `FollowRedirect`, so the hop counter and the
/// cross-origin flag are per request.
#[derive(Debug, Clone)]
pub struct SecureRedirectPolicy {
    config: RedirectConfig,
    hops: usize,
    left_origin: bool,
}

impl SecureRedirectPolicy {
    #[must_use]
    pub fn new(config: RedirectConfig) -> Self {
        Self {
            config,
            hops: 0,
            left_origin: false,
        }
    }

    fn check(&self, from: &Uri, to: &Uri) -> Result<bool, Refusal> {
        if self.hops > self.config.max_redirects {
            return Err(Refusal::Limit);
        }

        let (from_scheme, ..) = origin(from);
        let (to_scheme, to_host, _) = origin(to);
        if !self.config.allow_downgrade && from_scheme == "https" && to_scheme == "http" {
            return Err(Refusal::Downgrade);
        }

        let same_origin = origin(from) == origin(to);
        if !same_origin
            && self.config.same_origin_only
            && !self.config.allowed_hosts.contains(to_host)
        {
            return Err(Refusal::CrossOrigin);
        }

        Ok(same_origin)
    }
}

impl<B: Clone, E> Policy<B, E> for SecureRedirectPolicy {
    fn redirect(&mut self, attempt: &Attempt<'_>) -> Result<Action, E> {
        self.hops += 1;
        let (from, to) = (attempt.previous(), attempt.location());

        match self.check(from, to) {
            Ok(same_origin) => {
                self.left_origin |= !same_origin;
                tracing::trace!(from = %from, to = %to, hop = self.hops, "following redirect");
                Ok(Action::Follow)
            }
            Err(Refusal::Limit) => {
                tracing::debug!(max = self.config.max_redirects, "redirect limit reached");
                Ok(Action::Stop)
            }
            Err(refusal) => {
                tracing::warn!(from = %from, to = %to, reason = ?refusal, "redirect refused");
                Ok(Action::Stop)
            }
        }
    }

    fn on_request(&mut self, request: &mut Request<B>) {
        if self.left_origin && self.config.strip_credentials {
            for name in &CREDENTIAL_HEADERS {
                request.headers_mut().remove(name);
            }
        }
    }

    fn clone_body(&self, body: &B) -> Option<B> {
        // 307/308 replay the original body
        Some(body.clone())
    }
}
