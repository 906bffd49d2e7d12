// OAuth2 Proxy
//
// Authenticating reverse proxy for GitHub, GitLab and Bitbucket logins.
//
// Usage:
//   oauth-proxy [server]   run the gateway (default)
//   oauth-proxy health     check the internal /healthz endpoint

use std::env;
use std::time::Duration;

use anyhow::{bail, Context};
use oauth_proxy::{start_server, telemetry, Config};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Ok(path) = env::var("OAUTH2_PROXY_ENV_FILE") {
        dotenvy::from_path(&path).with_context(|| format!("Failed to load env file {path}"))?;
    }

    let config = Config::from_env()?;
    telemetry::init_tracing(&config.log_level)?;

    let command = env::args().nth(1).unwrap_or_else(|| "server".to_string());
    match command.as_str() {
        "server" => run_server(config).await,
        "health" => check_health(&config).await,
        other => bail!("Unknown command '{other}', expected 'server' or 'health'"),
    }
}

async fn run_server(config: Config) -> anyhow::Result<()> {
    info!("[INFO] Starting OAuth2 Proxy v{}", env!("CARGO_PKG_VERSION"));

    let metrics = telemetry::setup_metrics()?;
    info!("[OK] Metrics exported at http://{}/metrics", config.server.health_addr);

    start_server(config, Some(metrics)).await?;

    info!("[OK] OAuth2 Proxy stopped");
    Ok(())
}

/// Exit non-zero unless the internal health endpoint answers 200.
async fn check_health(config: &Config) -> anyhow::Result<()> {
    let mut addr = config.server.health_addr;
    if addr.ip().is_unspecified() {
        addr.set_ip(std::net::Ipv4Addr::LOCALHOST.into());
    }
    let url = format!("http://{addr}/healthz");
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()?;

    let response = client
        .get(&url)
        .send()
        .await
        .with_context(|| format!("Health check request to {url} failed"))?;

    if !response.status().is_success() {
        bail!("Health check returned {}", response.status());
    }
    println!("OK");
    Ok(())
}
