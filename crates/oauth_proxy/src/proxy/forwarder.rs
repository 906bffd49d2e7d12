use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Method, Request, Response, Uri};
use bytes::Bytes;
use tracing::{debug, warn};

use super::balancer::{Endpoint, EndpointPool};
use crate::config::ProxyConfig;
use crate::error::{GatewayError, Result};

/// Largest request body buffered for forwarding (and replay on retry).
pub const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_FORWARDED_HOST: &str = "x-forwarded-host";
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

const HOP_BY_HOP: [HeaderName; 8] = [
    header::CONNECTION,
    HeaderName::from_static("keep-alive"),
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

/// When a failed upstream attempt may be retried on another endpoint.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: usize,
    pub retry_non_idempotent: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_non_idempotent: false,
        }
    }
}

impl RetryPolicy {
    pub fn allows(&self, method: &Method) -> bool {
        self.retry_non_idempotent
            || matches!(*method, Method::GET | Method::HEAD | Method::OPTIONS)
    }
}

/// Forwards authenticated requests to the endpoint pool.
pub struct Forwarder {
    pool: Arc<EndpointPool>,
    client: reqwest::Client,
    policy: RetryPolicy,
    timeout: Duration,
    /// Scheme clients used to reach the gateway, reported as `X-Forwarded-Proto`
    proto: &'static str,
    max_body: usize,
}

impl Forwarder {
    pub fn new(pool: Arc<EndpointPool>, config: &ProxyConfig, proto: &'static str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .map_err(|e| GatewayError::Internal(format!("failed to build upstream client: {e}")))?;

        Ok(Self {
            pool,
            client,
            policy: RetryPolicy {
                retry_non_idempotent: config.retry_non_idempotent,
                ..RetryPolicy::default()
            },
            timeout: config.upstream_timeout,
            proto,
            max_body: MAX_BODY_BYTES,
        })
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn pool(&self) -> &Arc<EndpointPool> {
        &self.pool
    }

    /// Forward `request` to a pool endpoint and stream the response back.
    ///
    /// Transport failures before a response are retried on a different
    /// endpoint when the retry policy allows it.
    pub async fn forward(&self, request: Request<Body>) -> Result<Response<Body>> {
        let (parts, body) = request.into_parts();

        let body: Bytes = axum::body::to_bytes(body, self.max_body)
            .await
            .map_err(|_| GatewayError::PayloadTooLarge {
                limit: self.max_body,
            })?;

        let client_addr = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| *addr);
        let headers = self.upstream_headers(&parts.headers, &parts.uri, client_addr);
        let path_and_query = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");

        let max_attempts = if self.policy.allows(&parts.method) {
            self.policy.max_attempts.max(1)
        } else {
            1
        };

        let mut tried: Vec<Arc<Endpoint>> = Vec::with_capacity(max_attempts);
        while tried.len() < max_attempts {
            let Some(endpoint) = self.pool.next(&tried) else {
                break;
            };
            tried.push(endpoint.clone());

            let url = format!(
                "{}{}",
                endpoint.url().as_str().trim_end_matches('/'),
                path_and_query
            );
            debug!("forwarding {} {} (attempt {})", parts.method, url, tried.len());

            let started = Instant::now();
            let result = self
                .client
                .request(parts.method.clone(), &url)
                .headers(headers.clone())
                .body(body.clone())
                .timeout(self.timeout)
                .send()
                .await;

            match result {
                Ok(upstream) => {
                    self.pool.mark_healthy(&endpoint);
                    metrics::histogram!("oauth_proxy_upstream_duration_seconds")
                        .record(started.elapsed().as_secs_f64());
                    metrics::counter!("oauth_proxy_upstream_requests_total", "outcome" => "ok")
                        .increment(1);
                    return Ok(into_response(upstream));
                }
                Err(e) => {
                    warn!(
                        "upstream {} failed on attempt {}: {}",
                        endpoint.url(),
                        tried.len(),
                        e
                    );
                    metrics::counter!("oauth_proxy_upstream_requests_total", "outcome" => "transport_error")
                        .increment(1);
                    self.pool.mark_failed(&endpoint);
                }
            }
        }

        Err(GatewayError::UpstreamUnavailable {
            attempts: tried.len(),
        })
    }

    fn upstream_headers(
        &self,
        inbound: &HeaderMap,
        uri: &Uri,
        client_addr: Option<SocketAddr>,
    ) -> HeaderMap {
        let mut headers = inbound.clone();
        strip_hop_by_hop(&mut headers);
        headers.remove(header::CONTENT_LENGTH);

        if let Some(addr) = client_addr {
            let ip = addr.ip().to_string();
            let forwarded_for = match inbound
                .get(X_FORWARDED_FOR)
                .and_then(|v| v.to_str().ok())
            {
                Some(existing) => format!("{existing}, {ip}"),
                None => ip,
            };
            if let Ok(value) = HeaderValue::from_str(&forwarded_for) {
                headers.insert(X_FORWARDED_FOR, value);
            }
        }
        if let Some(host) = original_host(inbound, uri) {
            headers.insert(header::HOST, host.clone());
            headers.insert(X_FORWARDED_HOST, host);
        }
        headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static(self.proto));

        headers
    }
}

/// Host the client addressed: the `Host` header, or the URI authority for
/// HTTP/2 requests, which carry it as `:authority` instead.
fn original_host(inbound: &HeaderMap, uri: &Uri) -> Option<HeaderValue> {
    if let Some(host) = inbound.get(header::HOST) {
        return Some(host.clone());
    }
    let authority = uri.authority()?;
    let host = match authority.port_u16() {
        Some(port) => format!("{}:{}", authority.host(), port),
        None => authority.host().to_string(),
    };
    HeaderValue::from_str(&host).ok()
}

fn into_response(upstream: reqwest::Response) -> Response<Body> {
    let status = upstream.status();
    let mut headers = upstream.headers().clone();
    strip_hop_by_hop(&mut headers);

    let mut response = Response::new(Body::from_stream(upstream.bytes_stream()));
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

/// Remove connection-scoped headers, including any named by `Connection`.
fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in named.iter().chain(HOP_BY_HOP.iter()) {
        headers.remove(name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;
    use url::Url;

    fn proxy_config() -> ProxyConfig {
        ProxyConfig {
            endpoints: Vec::new(),
            rejected_endpoints: Vec::new(),
            user_header: "X-PROXY-USER".to_string(),
            upstream_timeout: Duration::from_secs(5),
            retry_non_idempotent: false,
        }
    }

    fn forwarder(urls: Vec<Url>) -> Forwarder {
        Forwarder::new(Arc::new(EndpointPool::new(urls)), &proxy_config(), "https").unwrap()
    }

    /// Accepts connections and closes them without answering.
    async fn dropping_backend() -> (Url, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = Url::parse(&format!("http://{}", listener.local_addr().unwrap())).unwrap();
        let accepted = Arc::new(AtomicUsize::new(0));
        let counter = accepted.clone();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                let mut buf = [0u8; 1024];
                let _ = socket.read(&mut buf).await;
                drop(socket);
            }
        });
        (url, accepted)
    }

    /// An address nothing listens on.
    async fn closed_port() -> Url {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        Url::parse(&format!("http://{addr}")).unwrap()
    }

    fn get(path: &str) -> Request<Body> {
        Request::builder()
            .uri(path)
            .header(header::HOST, "app.example.com")
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn test_retry_bound() {
        let (url, accepted) = dropping_backend().await;
        let forwarder = forwarder(vec![url]);

        let err = forwarder.forward(get("/")).await.unwrap_err();
        assert!(matches!(err, GatewayError::UpstreamUnavailable { attempts: 3 }));
        assert_eq!(err.status_code(), axum::http::StatusCode::BAD_GATEWAY);
        assert_eq!(accepted.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_post_is_not_retried() {
        let (url, accepted) = dropping_backend().await;
        let forwarder = forwarder(vec![url]);

        let request = Request::builder()
            .method(Method::POST)
            .uri("/orders")
            .body(Body::from("{}"))
            .unwrap();
        let err = forwarder.forward(request).await.unwrap_err();
        assert!(matches!(err, GatewayError::UpstreamUnavailable { attempts: 1 }));
        assert_eq!(accepted.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failover_to_second_endpoint() {
        let mut backend = mockito::Server::new_async().await;
        let mock = backend
            .mock("GET", "/status")
            .match_header("host", "app.example.com")
            .match_header("x-forwarded-proto", "https")
            .match_header("x-forwarded-host", "app.example.com")
            .with_body("up")
            .expect(1)
            .create_async()
            .await;

        let refused = closed_port().await;
        let forwarder = forwarder(vec![refused, Url::parse(&backend.url()).unwrap()]);

        let response = forwarder.forward(get("/status")).await.unwrap();
        assert_eq!(response.status(), axum::http::StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        assert_eq!(&body[..], b"up");
        mock.assert_async().await;

        assert!(!forwarder.pool().snapshot()[0].is_healthy());
    }

    #[tokio::test]
    async fn test_body_is_forwarded_and_limited() {
        let mut backend = mockito::Server::new_async().await;
        let mock = backend
            .mock("PUT", "/items/1?force=true")
            .match_body("payload")
            .with_status(204)
            .create_async()
            .await;

        let mut forwarder = forwarder(vec![Url::parse(&backend.url()).unwrap()]);
        let request = Request::builder()
            .method(Method::PUT)
            .uri("/items/1?force=true")
            .body(Body::from("payload"))
            .unwrap();
        let response = forwarder.forward(request).await.unwrap();
        assert_eq!(response.status(), axum::http::StatusCode::NO_CONTENT);
        mock.assert_async().await;

        forwarder.max_body = 4;
        let request = Request::builder()
            .method(Method::PUT)
            .uri("/items/1")
            .body(Body::from("payload"))
            .unwrap();
        assert!(matches!(
            forwarder.forward(request).await,
            Err(GatewayError::PayloadTooLarge { limit: 4 })
        ));
    }

    #[tokio::test]
    async fn test_empty_pool_is_unavailable() {
        let forwarder = forwarder(Vec::new());
        assert!(matches!(
            forwarder.forward(get("/")).await,
            Err(GatewayError::UpstreamUnavailable { attempts: 0 })
        ));
    }

    #[test]
    fn test_hop_by_hop_headers_are_stripped() {
        let forwarder = forwarder(Vec::new());
        let mut inbound = HeaderMap::new();
        inbound.insert(header::CONNECTION, HeaderValue::from_static("keep-alive, x-internal"));
        inbound.insert("x-internal", HeaderValue::from_static("1"));
        inbound.insert(header::TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        inbound.insert(X_FORWARDED_FOR, HeaderValue::from_static("203.0.113.7"));
        inbound.insert(header::ACCEPT, HeaderValue::from_static("text/html"));

        let headers = forwarder.upstream_headers(
            &inbound,
            &Uri::from_static("/"),
            Some("198.51.100.2:4242".parse().unwrap()),
        );

        assert!(headers.get(header::CONNECTION).is_none());
        assert!(headers.get("x-internal").is_none());
        assert!(headers.get(header::TRANSFER_ENCODING).is_none());
        assert_eq!(headers[X_FORWARDED_FOR], "203.0.113.7, 198.51.100.2");
        assert_eq!(headers[header::ACCEPT], "text/html");
    }

    #[test]
    fn test_host_taken_from_authority_without_host_header() {
        let forwarder = forwarder(Vec::new());
        let uri = Uri::from_static("https://app.example.com:8443/status");

        let headers = forwarder.upstream_headers(&HeaderMap::new(), &uri, None);
        assert_eq!(headers[header::HOST], "app.example.com:8443");
        assert_eq!(headers[X_FORWARDED_HOST], "app.example.com:8443");

        let mut inbound = HeaderMap::new();
        inbound.insert(header::HOST, HeaderValue::from_static("app.example.com"));
        let headers = forwarder.upstream_headers(&inbound, &uri, None);
        assert_eq!(headers[header::HOST], "app.example.com");
    }
}
