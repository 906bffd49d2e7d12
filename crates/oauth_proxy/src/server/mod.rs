//! OAuth2 Proxy HTTP Server
//!
//! Wires the auth gate, the status endpoints and the HTTPS redirect into
//! routers and runs them under the listener group.

pub mod cookies;
pub mod gate;
pub mod listener;
pub mod pages;

use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::{HeaderName, StatusCode, Uri};
use axum::response::{IntoResponse, Redirect, Response};
use axum::routing::get;
use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::task::JoinHandle;
use tower::ServiceBuilder;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::services::ServeDir;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::{debug, info, warn, Level};

use crate::auth::{PendingFlows, ProviderRegistry, SessionStore};
use crate::config::Config;
use crate::error::{GatewayError, Result};
use crate::proxy::{EndpointPool, Forwarder};
use crate::telemetry;
use cookies::CookieOptions;
use listener::{CertificateSource, Lifecycle, ListenerGroup, ListenerSpec, TlsPolicy, Transport};

/// How often expired sessions and abandoned logins are purged.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Application state shared across gate handlers
pub struct AppState {
    pub config: Arc<Config>,
    pub providers: ProviderRegistry,
    pub sessions: SessionStore,
    pub flows: PendingFlows,
    pub forwarder: Forwarder,
    pub lifecycle: Arc<Lifecycle>,
    pub cookies: CookieOptions,
    /// Identity header set toward the backend
    pub user_header: HeaderName,
}

impl AppState {
    pub fn new(
        config: Arc<Config>,
        providers: ProviderRegistry,
        forwarder: Forwarder,
        lifecycle: Arc<Lifecycle>,
    ) -> Result<Self> {
        let user_header = HeaderName::from_bytes(config.proxy.user_header.as_bytes())
            .map_err(|_| crate::config::ConfigError::Invalid("OAUTH2_PROXY_USER_HEADER"))?;
        let cookies = CookieOptions {
            secure: config.secure_cookies(),
        };

        Ok(Self {
            config,
            providers,
            sessions: SessionStore::new(),
            flows: PendingFlows::default(),
            forwarder,
            lifecycle,
            cookies,
            user_header,
        })
    }
}

/// Router for the main listener: gateway routes under the root prefix, and
/// the auth gate for everything else.
pub fn build_router(state: Arc<AppState>) -> Router {
    let root = state.config.server.root.clone();

    let mut router = Router::new()
        .route(&format!("{root}/login"), get(gate::login).post(gate::login_form))
        .route(&format!("{root}/logout"), get(gate::logout).post(gate::logout))
        .route(&format!("{root}/:provider/callback"), get(gate::callback));

    if let Some(assets) = &state.config.server.assets {
        router = router.nest_service(&format!("{root}/assets"), ServeDir::new(assets));
    }

    let middleware = ServiceBuilder::new()
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        );

    router
        .fallback(gate::gate)
        .with_state(state)
        .layer(middleware)
}

/// State behind the internal health/metrics listener
#[derive(Clone)]
pub struct StatusState {
    pub lifecycle: Arc<Lifecycle>,
    pub pool: Arc<EndpointPool>,
    pub metrics: Option<PrometheusHandle>,
}

/// Router for the internal listener: `/healthz`, `/readyz`, `/metrics`.
pub fn status_router(state: StatusState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(render_metrics))
        .with_state(state)
}

async fn healthz() -> &'static str {
    "OK"
}

/// Ready once every listener is up and at least one backend endpoint is healthy.
async fn readyz(State(state): State<StatusState>) -> Response {
    if !state.lifecycle.is_running() {
        return (StatusCode::SERVICE_UNAVAILABLE, "listeners not running").into_response();
    }
    if !state.pool.has_healthy() {
        return (StatusCode::SERVICE_UNAVAILABLE, "no healthy endpoint").into_response();
    }
    "OK".into_response()
}

async fn render_metrics(State(state): State<StatusState>) -> Response {
    match &state.metrics {
        Some(handle) => handle.render().into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

/// Router for the public plain-HTTP listener when TLS is enabled: every
/// request is redirected (308) to the same path on `https://{authority}`.
/// The client's `Host` header is never used to build the target.
pub fn redirect_router(authority: String) -> Router {
    Router::new().fallback(move |uri: Uri| {
        let target = https_location(&authority, &uri);
        async move {
            debug!("redirecting {} to {}", uri, target);
            Redirect::permanent(&target)
        }
    })
}

fn https_location(authority: &str, uri: &Uri) -> String {
    let path_and_query = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    format!("https://{authority}{path_and_query}")
}

/// Host and port of the secure listener as seen by clients: the external
/// host's explicit port, else the secure listener's port unless it is 443.
fn secure_authority(host: &url::Url, secure_port: u16) -> Option<String> {
    let name = host.host_str()?;
    Some(match (host.port(), secure_port) {
        (Some(port), _) => format!("{name}:{port}"),
        (None, 443) => name.to_string(),
        (None, port) => format!("{name}:{port}"),
    })
}

/// Periodically purge expired sessions and abandoned login flows.
pub fn spawn_sweeper(state: Arc<AppState>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let sessions = state.sessions.purge_expired();
            let flows = state.flows.purge_expired();
            if sessions > 0 || flows > 0 {
                debug!("purged {} expired session(s), {} login flow(s)", sessions, flows);
            }
            metrics::gauge!("oauth_proxy_sessions").set(state.sessions.len() as f64);
        }
    })
}

/// Start the OAuth2 Proxy
///
/// Listener topology depends on the TLS configuration:
/// - ACME: public redirect + secure listener with on-demand certificates
/// - certificate and key: public redirect + secure listener with the static pair
/// - neither: the gateway is served on the public listener over plain HTTP
///
/// The internal health listener always runs.
///
/// # Errors
/// Returns an error on invalid configuration, certificate errors, bind
/// failures, or when a listener dies while running.
pub async fn start_server(config: Config, metrics: Option<PrometheusHandle>) -> Result<()> {
    config.validate()?;
    let config = Arc::new(config);
    let server = &config.server;

    let lifecycle = Arc::new(Lifecycle::new());
    for endpoint in &config.proxy.rejected_endpoints {
        warn!(endpoint = %endpoint, "failed to parse endpoint, skipping");
    }
    let pool = Arc::new(EndpointPool::new(config.proxy.endpoints.clone()));
    if pool.is_empty() {
        warn!("No backend endpoints configured; authenticated requests will fail with 502");
    }
    for endpoint in pool.snapshot().iter() {
        info!("[OK] Backend endpoint: {}", endpoint.url());
    }

    let certificate = if server.auto_cert {
        let domain = server.host.host_str().ok_or_else(|| {
            GatewayError::CertificateError("OAUTH2_PROXY_SERVER_HOST has no host name".to_string())
        })?;
        Some(CertificateSource::Acme {
            domains: vec![domain.to_string()],
            contact: server.acme_contact.clone(),
            cache_dir: server.storage.join("certs"),
            production: true,
        })
    } else {
        match (&server.cert, &server.key) {
            (Some(cert), Some(key)) => Some(CertificateSource::Static {
                cert: cert.clone(),
                key: key.clone(),
            }),
            _ => None,
        }
    };

    let proto = if certificate.is_some() { "https" } else { "http" };
    let providers = ProviderRegistry::from_config(&config)?;
    let forwarder = Forwarder::new(pool.clone(), &config.proxy, proto)?;
    let state = Arc::new(AppState::new(
        config.clone(),
        providers,
        forwarder,
        lifecycle.clone(),
    )?);

    let status = status_router(StatusState {
        lifecycle: lifecycle.clone(),
        pool,
        metrics,
    });
    let mut group = ListenerGroup::new(lifecycle)
        .listener(ListenerSpec::plain("health", server.health_addr, status));

    match certificate {
        Some(source) => {
            let policy = TlsPolicy {
                strict_curves: server.strict_curves,
                strict_ciphers: server.strict_ciphers,
            };
            let (transport, driver) = source.into_transport(policy)?;
            let authority = secure_authority(&server.host, server.secure_addr.port())
                .ok_or_else(|| {
                    GatewayError::CertificateError(
                        "OAUTH2_PROXY_SERVER_HOST has no host name".to_string(),
                    )
                })?;
            group = group
                .listener(ListenerSpec::plain(
                    "public",
                    server.public_addr,
                    redirect_router(authority),
                ))
                .listener(ListenerSpec {
                    name: "secure",
                    addr: server.secure_addr,
                    router: build_router(state.clone()),
                    transport,
                });
            if let Some(driver) = driver {
                group = group.background(driver);
            }
        }
        None => {
            group = group.listener(ListenerSpec {
                name: "public",
                addr: server.public_addr,
                router: build_router(state.clone()),
                transport: Transport::Plain,
            });
        }
    }

    info!("[INFO] Gateway routes:");
    info!("  GET|POST {}          - Sign in", config.login_path());
    info!("  GET      {}/{{provider}}/callback - Provider callback", server.root);
    info!("  GET|POST {}         - Sign out", config.logout_path());
    info!("  *        /*                    - Authenticated proxy");

    let sweeper = spawn_sweeper(state);
    let result = group.run(telemetry::shutdown_signal()).await;
    sweeper.abort();
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{header, Request};
    use tower::ServiceExt;

    #[test]
    fn test_secure_authority() {
        let host = |s: &str| url::Url::parse(s).unwrap();
        assert_eq!(
            secure_authority(&host("https://auth.example.com"), 443).as_deref(),
            Some("auth.example.com")
        );
        assert_eq!(
            secure_authority(&host("https://auth.example.com"), 8443).as_deref(),
            Some("auth.example.com:8443")
        );
        assert_eq!(
            secure_authority(&host("https://auth.example.com:9443"), 443).as_deref(),
            Some("auth.example.com:9443")
        );
        assert_eq!(
            https_location("auth.example.com", &"/reports?year=2024".parse().unwrap()),
            "https://auth.example.com/reports?year=2024"
        );
    }

    #[tokio::test]
    async fn test_redirect_ignores_client_host() {
        let response = redirect_router("auth.example.com".to_string())
            .oneshot(
                Request::builder()
                    .uri("/a?b=c")
                    .header(header::HOST, "evil.example.net")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::PERMANENT_REDIRECT);
        assert_eq!(response.headers()[header::LOCATION], "https://auth.example.com/a?b=c");
    }

    #[tokio::test]
    async fn test_readyz_reflects_lifecycle_and_pool() {
        let state = StatusState {
            lifecycle: Arc::new(Lifecycle::new()),
            pool: Arc::new(EndpointPool::new(vec!["http://10.0.0.1".parse().unwrap()])),
            metrics: None,
        };
        let request = || Request::builder().uri("/readyz").body(Body::empty()).unwrap();

        let response = status_router(state.clone()).oneshot(request()).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let response = status_router(state)
            .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
