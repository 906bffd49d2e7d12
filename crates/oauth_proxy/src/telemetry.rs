//! Logging, metrics and process signals.

use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Initialize the global tracing subscriber.
///
/// `level` is an `EnvFilter` directive string such as `info` or
/// `oauth_proxy=debug,tower_http=info`.
pub fn init_tracing(level: &str) -> anyhow::Result<()> {
    let filter = EnvFilter::try_new(level).or_else(|_| EnvFilter::try_new("info"))?;

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .try_init()?;

    Ok(())
}

/// Install the Prometheus recorder and describe the gateway's metrics.
pub fn setup_metrics() -> anyhow::Result<PrometheusHandle> {
    let upstream_buckets = &[0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0];

    let handle = PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full("oauth_proxy_upstream_duration_seconds".to_string()),
            upstream_buckets,
        )?
        .install_recorder()?;

    metrics::describe_counter!(
        "oauth_proxy_gate_decisions_total",
        "Auth gate outcomes by decision (login, reject, forward)"
    );
    metrics::describe_counter!(
        "oauth_proxy_login_redirects_total",
        "Redirects to an identity provider by provider"
    );
    metrics::describe_counter!(
        "oauth_proxy_logins_total",
        "Completed provider callbacks by outcome"
    );
    metrics::describe_counter!(
        "oauth_proxy_upstream_requests_total",
        "Upstream attempts by outcome"
    );
    metrics::describe_histogram!(
        "oauth_proxy_upstream_duration_seconds",
        "Time to upstream response headers in seconds"
    );
    metrics::describe_gauge!("oauth_proxy_sessions", "Live sessions in the session store");

    Ok(handle)
}

/// Resolves on Ctrl+C or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received, starting graceful shutdown");
}
