//! Network transport capability.
//!
//! The task engine never talks to the network itself; every attempt goes
//! through a [`Transport`]. [`HyperTransport`] is the default implementation.

use crate::config::{TlsRootConfig, TransportConfig, TransportSecurity};
use crate::error::HttpError;
use crate::redirect::SecureRedirectPolicy;
use crate::response::{ResponseBody, read_body_limited};
use crate::tls;
use bytes::Bytes;
use http::{HeaderValue, Request, Response, header};
use http_body_util::{BodyExt, Full};
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::{TokioExecutor, TokioTimer};
use std::future::Future;
use std::pin::Pin;
use std::task::Poll;
use tower::buffer::Buffer;
use tower::timeout::TimeoutLayer;
use tower::util::BoxCloneService;
use tower::{Service, ServiceBuilder, ServiceExt};
use tower_http::decompression::DecompressionLayer;
use tower_http::follow_redirect::FollowRedirectLayer;
use tower_http::set_header::SetRequestHeaderLayer;

/// Future returned by [`Transport::send`]
pub type TransportFuture =
    Pin<Box<dyn Future<Output = Result<Response<Bytes>, HttpError>> + Send>>;

/// Performs one network attempt.
///
/// Dropping the returned future cancels the attempt. Redirects the
/// transport does not follow must be returned as-is; they are classified
/// by the engine.
pub trait Transport: Send + Sync + 'static {
    fn send(&self, request: Request<Bytes>) -> TransportFuture;
}

type ServiceFuture = <InnerService as Service<Request<Full<Bytes>>>>::Future;

type InnerService = BoxCloneService<Request<Full<Bytes>>, Response<ResponseBody>, HttpError>;

type BufferedService = Buffer<Request<Full<Bytes>>, ServiceFuture>;

/// Default transport: hyper-util pooled client with rustls, per-attempt
/// timeout, user agent, decompression and secure redirect following.
///
/// Cheap to clone. Attempts run concurrently through a
/// `tower::buffer::Buffer`; when the buffer is full new attempts fail fast
/// with [`HttpError::Overloaded`].
#[derive(Clone)]
pub struct HyperTransport {
    service: BufferedService,
    max_body_size: usize,
    security: TransportSecurity,
}

impl HyperTransport {
    /// Build the transport.
    ///
    /// Must be called within a Tokio runtime; the buffer worker is spawned
    /// onto it.
    ///
    /// # Errors
    /// Returns an error if TLS initialization fails or the user agent is not
    /// a valid header value
    pub fn new(config: &TransportConfig) -> Result<Self, HttpError> {
        if config.security == TransportSecurity::AllowInsecureHttp {
            tracing::warn!("plain http:// enabled on this transport; only point it at mock servers");
        }

        let mut pool = Client::builder(TokioExecutor::new());
        // idle timeouts need a timer
        pool.pool_timer(TokioTimer::new())
            .pool_max_idle_per_host(config.pool_max_idle_per_host);
        if let Some(idle) = config.pool_idle_timeout {
            pool.pool_idle_timeout(idle);
        }
        let hyper_client = pool.build::<_, Full<Bytes>>(connector(config)?);

        let timeout = config.attempt_timeout;
        let user_agent = HeaderValue::from_str(&config.user_agent)?;

        // outermost first; the timeout covers redirects too
        let stack = ServiceBuilder::new()
            .layer(TimeoutLayer::new(timeout))
            .layer(SetRequestHeaderLayer::if_not_present(
                header::USER_AGENT,
                user_agent,
            ))
            .layer(DecompressionLayer::new())
            .layer(FollowRedirectLayer::with_policy(SecureRedirectPolicy::new(
                config.redirect.clone(),
            )))
            .service(hyper_client)
            .map_response(box_body)
            .map_err(move |err: tower::BoxError| {
                if err.is::<tower::timeout::error::Elapsed>() {
                    HttpError::Timeout(timeout)
                } else {
                    unbox(err).unwrap_or_else(HttpError::Transport)
                }
            })
            .boxed_clone();

        Ok(Self {
            // a zero-capacity Buffer panics
            service: Buffer::new(stack, config.buffer_capacity.max(1)),
            max_body_size: config.max_body_size,
            security: config.security,
        })
    }

    /// Transport security mode this transport was built with
    #[must_use]
    pub fn security(&self) -> TransportSecurity {
        self.security
    }

    async fn execute(
        mut service: BufferedService,
        max_body_size: usize,
        request: Request<Bytes>,
    ) -> Result<Response<Bytes>, HttpError> {
        reserve_slot(&mut service).await?;
        let response = service
            .call(request.map(Full::new))
            .await
            .map_err(worker_failure)?;

        let (parts, body) = response.into_parts();
        let body = read_body_limited(body, max_body_size).await?;
        Ok(Response::from_parts(parts, body))
    }
}

impl std::fmt::Debug for HyperTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HyperTransport")
            .field("max_body_size", &self.max_body_size)
            .field("security", &self.security)
            .finish_non_exhaustive()
    }
}

impl Transport for HyperTransport {
    fn send(&self, request: Request<Bytes>) -> TransportFuture {
        Box::pin(Self::execute(
            self.service.clone(),
            self.max_body_size,
            request,
        ))
    }
}

fn unbox(err: tower::BoxError) -> Result<HttpError, tower::BoxError> {
    err.downcast::<HttpError>().map(|boxed| *boxed)
}

/// Errors out of the buffer are either ours, passed through, or a sign that
/// its worker is gone.
fn worker_failure(err: tower::BoxError) -> HttpError {
    unbox(err).unwrap_or_else(|err| {
        tracing::error!(error = %err, "transport buffer worker stopped");
        HttpError::ServiceClosed
    })
}

/// Take a buffer slot without waiting for one.
async fn reserve_slot(service: &mut BufferedService) -> Result<(), HttpError> {
    let ready = std::future::poll_fn(|cx| Poll::Ready(service.poll_ready(cx))).await;
    match ready {
        Poll::Ready(Ok(())) => Ok(()),
        Poll::Ready(Err(err)) => Err(worker_failure(err)),
        Poll::Pending => Err(HttpError::Overloaded),
    }
}

fn box_body<B>(response: Response<B>) -> Response<ResponseBody>
where
    B: hyper::body::Body<Data = Bytes> + Send + Sync + 'static,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    response.map(|body| body.map_err(Into::into).boxed())
}

/// rustls connector offering h2 and http/1.1, accepting plain http only
/// when the config allows it.
///
/// # Errors
/// `HttpError::Tls` when the crypto provider or the native root store
/// cannot be set up
fn connector(config: &TransportConfig) -> Result<HttpsConnector<HttpConnector>, HttpError> {
    let builder = hyper_rustls::HttpsConnectorBuilder::new();
    let builder = match config.tls_roots {
        TlsRootConfig::WebPki => builder
            .with_provider_and_webpki_roots(tls::get_crypto_provider())
            .map_err(|e| HttpError::Tls(Box::new(e)))?,
        TlsRootConfig::Native => builder.with_tls_config(tls::native_roots_client_config()?),
    };

    Ok(match config.security {
        TransportSecurity::AllowInsecureHttp => builder.https_or_http().enable_all_versions().build(),
        TransportSecurity::TlsOnly => builder.https_only().enable_all_versions().build(),
    })
}
