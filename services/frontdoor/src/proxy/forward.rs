//! Request forwarding.
//!
//! Serves HTTP/1.1 on each classified connection. Every request is tagged
//! with its [`ConnectionInfo`](super::listener::ConnectionInfo), rewritten
//! by the [`Director`], and relayed through an [`Upstream`]. Response
//! bodies are streamed frame by frame.

use std::convert::Infallible;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{future, TryStreamExt};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, BodyStream, Empty, StreamBody};
use hyper::body::{Frame, Incoming};
use hyper::header::{HeaderMap, HeaderName, CONNECTION, HOST};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioIo, TokioTimer};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, error, warn};

use super::director::Director;
use super::listener::ClassifiedStream;
use crate::error::{DirectorError, ForwardError};

/// Boxed error carried by proxied bodies.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Response body handed back to hyper.
pub type ProxyBody = UnsyncBoxBody<Bytes, BoxError>;

/// Default connect timeout for upstream connections.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default TCP keepalive for upstream connections.
pub const DEFAULT_TCP_KEEPALIVE: Duration = Duration::from_secs(30);

/// Default idle timeout for pooled upstream connections.
pub const DEFAULT_POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(120);

/// Default idle connections kept per upstream host.
pub const DEFAULT_POOL_MAX_IDLE_PER_HOST: usize = 100;

/// Headers that only apply to a single hop.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "proxy-connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Sends a directed request to its destination.
#[async_trait]
pub trait Upstream: Send + Sync {
    /// Forward `request`, whose URI is already absolute.
    async fn forward(&self, request: Request<Incoming>) -> Result<Response<ProxyBody>, ForwardError>;
}

/// Outbound transport settings.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub connect_timeout: Duration,
    pub tcp_keepalive: Duration,
    pub pool_idle_timeout: Duration,
    pub pool_max_idle_per_host: usize,
    /// Send all traffic through this forward proxy (HTTP/1.1 only).
    pub proxy_url: Option<String>,
    /// Honour `HTTP_PROXY`/`HTTPS_PROXY`/`NO_PROXY` when no proxy is set.
    pub use_env_proxy: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            tcp_keepalive: DEFAULT_TCP_KEEPALIVE,
            pool_idle_timeout: DEFAULT_POOL_IDLE_TIMEOUT,
            pool_max_idle_per_host: DEFAULT_POOL_MAX_IDLE_PER_HOST,
            proxy_url: None,
            use_env_proxy: true,
        }
    }
}

/// [`Upstream`] backed by a pooled reqwest client.
#[derive(Debug, Clone)]
pub struct HttpUpstream {
    client: reqwest::Client,
}

impl HttpUpstream {
    pub fn new(config: &TransportConfig) -> Result<Self, ForwardError> {
        let mut builder = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .tcp_keepalive(config.tcp_keepalive)
            .pool_idle_timeout(config.pool_idle_timeout)
            .pool_max_idle_per_host(config.pool_max_idle_per_host)
            .redirect(reqwest::redirect::Policy::none());

        if let Some(proxy_url) = &config.proxy_url {
            let proxy = reqwest::Proxy::all(proxy_url.as_str()).map_err(ForwardError::Client)?;
            builder = builder.proxy(proxy).http1_only();
        } else if !config.use_env_proxy {
            builder = builder.no_proxy();
        }

        let client = builder.build().map_err(ForwardError::Client)?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Upstream for HttpUpstream {
    async fn forward(&self, request: Request<Incoming>) -> Result<Response<ProxyBody>, ForwardError> {
        let (parts, body) = request.into_parts();

        let url = reqwest::Url::parse(&parts.uri.to_string())
            .map_err(|e| ForwardError::InvalidUrl(e.to_string()))?;

        let body = reqwest::Body::wrap_stream(
            BodyStream::new(body).try_filter_map(|frame| future::ready(Ok(frame.into_data().ok()))),
        );

        let upstream = self
            .client
            .request(parts.method, url)
            .headers(parts.headers)
            .body(body)
            .send()
            .await?;

        let status = upstream.status();
        let headers = upstream.headers().clone();
        let body = StreamBody::new(
            upstream
                .bytes_stream()
                .map_ok(Frame::data)
                .map_err(|e| Box::new(e) as BoxError),
        );

        let mut response = Response::new(body.boxed_unsync());
        *response.status_mut() = status;
        *response.headers_mut() = headers;
        Ok(response)
    }
}

/// Counters for forwarded requests.
#[derive(Debug, Default)]
pub struct ForwardStats {
    /// Requests relayed and answered by the upstream.
    pub requests_forwarded: AtomicU64,
    /// Requests rejected before forwarding.
    pub requests_rejected: AtomicU64,
    /// Requests that failed upstream.
    pub requests_failed: AtomicU64,
}

/// Ties the director to an upstream and serves connections.
pub struct ForwardingEngine {
    director: Director,
    upstream: Arc<dyn Upstream>,
    stats: ForwardStats,
}

impl ForwardingEngine {
    pub fn new(director: Director, upstream: Arc<dyn Upstream>) -> Self {
        Self {
            director,
            upstream,
            stats: ForwardStats::default(),
        }
    }

    pub fn stats(&self) -> &ForwardStats {
        &self.stats
    }

    /// Serve HTTP/1.1 on `stream` until the peer closes.
    pub async fn serve_connection<S>(
        self: Arc<Self>,
        stream: ClassifiedStream<S>,
        header_read_timeout: Duration,
    ) -> Result<(), hyper::Error>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let info = stream.connection_info().clone();
        let service = service_fn(move |mut request: Request<Incoming>| {
            let engine = Arc::clone(&self);
            request.extensions_mut().insert(info.clone());
            async move { Ok::<_, Infallible>(engine.handle(request).await) }
        });

        http1::Builder::new()
            .timer(TokioTimer::new())
            .header_read_timeout(header_read_timeout)
            .serve_connection(TokioIo::new(stream), service)
            .await
    }

    /// Direct and forward one request. Never fails; errors become responses.
    pub async fn handle(&self, request: Request<Incoming>) -> Response<ProxyBody> {
        let (mut parts, body) = request.into_parts();

        if let Err(e) = self.director.direct(&mut parts) {
            self.stats.requests_rejected.fetch_add(1, Ordering::Relaxed);
            return match e {
                DirectorError::MissingHost => {
                    debug!(uri = %parts.uri, "Rejecting request without Host");
                    status_response(StatusCode::BAD_REQUEST)
                }
                DirectorError::MissingClassification | DirectorError::InvalidUri(_) => {
                    warn!(error = %e, "Request not directed");
                    status_response(StatusCode::BAD_GATEWAY)
                }
            };
        }

        remove_hop_by_hop(&mut parts.headers);
        parts.headers.remove(HOST);

        let method = parts.method.clone();
        let uri = parts.uri.clone();

        match self.upstream.forward(Request::from_parts(parts, body)).await {
            Ok(mut response) => {
                self.stats.requests_forwarded.fetch_add(1, Ordering::Relaxed);
                remove_hop_by_hop(response.headers_mut());
                debug!(
                    method = %method,
                    uri = %uri,
                    status = response.status().as_u16(),
                    "Request forwarded"
                );
                response
            }
            Err(e) => {
                self.stats.requests_failed.fetch_add(1, Ordering::Relaxed);
                error!(method = %method, uri = %uri, error = %e, "Proxy error");
                status_response(StatusCode::BAD_GATEWAY)
            }
        }
    }
}

/// Remove hop-by-hop headers, including any named by `Connection`.
pub fn remove_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|token| HeaderName::from_bytes(token.trim().as_bytes()).ok())
        .collect();

    for name in named {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(*name);
    }
}

/// An empty response with `status`.
pub fn status_response(status: StatusCode) -> Response<ProxyBody> {
    let body = Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed_unsync();
    let mut response = Response::new(body);
    *response.status_mut() = status;
    response
}
