use crate::auth::Auth;
use crate::error::{HttpError, InvalidUriKind};
use crate::retry::RetryPolicy;
use std::sync::Arc;
use url::Url;

/// Base URL a client talks to.
///
/// Relative request paths are resolved against it, and the client's
/// default auth is only attached to requests whose origin (scheme, host and
/// port) matches it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Environment {
    base_url: Url,
}

impl Environment {
    /// Parse `base_url`. A path without a trailing slash gets one, so that
    /// `https://api.example.com/v1` resolves `users` to `/v1/users`.
    ///
    /// # Errors
    /// Returns `HttpError::InvalidUri` if the URL does not parse or has no host
    pub fn new(base_url: &str) -> Result<Self, HttpError> {
        let url = Url::parse(base_url).map_err(|e| {
            HttpError::invalid_uri(base_url, InvalidUriKind::ParseError, e.to_string())
        })?;
        Self::from_url(url)
    }

    /// # Errors
    /// Returns `HttpError::InvalidUri` if the URL has no host
    pub fn from_url(mut url: Url) -> Result<Self, HttpError> {
        if url.host_str().is_none() {
            return Err(HttpError::invalid_uri(
                url,
                InvalidUriKind::MissingAuthority,
                "environment base URL needs a host",
            ));
        }
        if !url.path().ends_with('/') {
            let path = format!("{}/", url.path());
            url.set_path(&path);
        }
        url.set_query(None);
        url.set_fragment(None);
        Ok(Self { base_url: url })
    }

    #[must_use]
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Whether `url` has the same origin as the base URL
    #[must_use]
    pub fn matches(&self, url: &Url) -> bool {
        url.origin() == self.base_url.origin()
    }

    /// Resolve `path` against the base URL (RFC 3986 reference resolution;
    /// a leading `/` replaces the base path).
    ///
    /// # Errors
    /// Returns `HttpError::InvalidUri` if the result is not a valid URL
    pub fn resolve(&self, path: &str) -> Result<Url, HttpError> {
        self.base_url
            .join(path)
            .map_err(|e| HttpError::invalid_uri(path, InvalidUriKind::ParseError, e.to_string()))
    }
}

/// Client-wide defaults, captured by each request when it is built.
///
/// Changing a client's defaults never affects requests that were already
/// constructed.
#[derive(Debug, Clone, Default)]
pub struct Defaults {
    environment: Option<Environment>,
    auth: Option<Arc<dyn Auth>>,
    retry_policy: Option<Arc<dyn RetryPolicy>>,
}

impl Defaults {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_environment(mut self, environment: Environment) -> Self {
        self.environment = Some(environment);
        self
    }

    #[must_use]
    pub fn with_auth(mut self, auth: Arc<dyn Auth>) -> Self {
        self.auth = Some(auth);
        self
    }

    #[must_use]
    pub fn with_retry_policy(mut self, policy: Arc<dyn RetryPolicy>) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    pub(crate) fn set_environment(&mut self, environment: Option<Environment>) {
        self.environment = environment;
    }

    pub(crate) fn set_auth(&mut self, auth: Option<Arc<dyn Auth>>) {
        self.auth = auth;
    }

    pub(crate) fn set_retry_policy(&mut self, policy: Option<Arc<dyn RetryPolicy>>) {
        self.retry_policy = policy;
    }

    #[must_use]
    pub fn environment(&self) -> Option<&Environment> {
        self.environment.as_ref()
    }

    #[must_use]
    pub fn auth(&self) -> Option<&Arc<dyn Auth>> {
        self.auth.as_ref()
    }

    #[must_use]
    pub fn retry_policy(&self) -> Option<&Arc<dyn RetryPolicy>> {
        self.retry_policy.as_ref()
    }

    /// Default auth for a request to `url`: only when an environment is
    /// configured and `url` shares its origin.
    pub(crate) fn auth_for(&self, url: &Url) -> Option<Arc<dyn Auth>> {
        let environment = self.environment.as_ref()?;
        if !environment.matches(url) {
            return None;
        }
        self.auth.clone()
    }
}
