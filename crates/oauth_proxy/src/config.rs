//! Gateway configuration.
//!
//! Built once at startup from `OAUTH2_PROXY_*` environment variables and shared
//! read-only (behind an `Arc`) with every component afterwards.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use url::Url;

use crate::auth::ProviderKind;

/// Longest accepted session lifetime: one year.
pub const MAX_SESSION_TTL_SECS: i64 = 365 * 24 * 60 * 60;

/// Listener and page settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Internal listener for `/healthz`, `/readyz` and `/metrics`
    pub health_addr: SocketAddr,
    /// TLS listener address
    pub secure_addr: SocketAddr,
    /// Plain HTTP listener address
    pub public_addr: SocketAddr,
    /// Path prefix of the gateway's own routes, normalized to `/prefix` or empty
    pub root: String,
    /// Externally visible base URL, e.g. `https://auth.example.com`
    pub host: Url,
    pub cert: Option<PathBuf>,
    pub key: Option<PathBuf>,
    /// Request certificates on demand via ACME
    pub auto_cert: bool,
    pub acme_contact: Option<String>,
    /// Directory served under `{root}/assets`
    pub assets: Option<PathBuf>,
    /// Storage folder; the ACME cache lives in `certs/` below it
    pub storage: PathBuf,
    /// Title shown on the login page
    pub title: String,
    /// Restrict TLS key exchange to the NIST P-384 and P-256 curves
    pub strict_curves: bool,
    /// Restrict TLS to AES-GCM cipher suites with forward secrecy
    pub strict_ciphers: bool,
}

/// Forwarding settings.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub endpoints: Vec<Url>,
    /// Entries of `OAUTH2_PROXY_SERVER_ENDPOINTS` that are not http(s) URLs;
    /// logged and skipped at startup
    pub rejected_endpoints: Vec<String>,
    /// Header carrying the authenticated username toward the backend
    pub user_header: String,
    pub upstream_timeout: Duration,
    /// Retry POST/PUT/... on transport failure as well
    pub retry_non_idempotent: bool,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub cookie_name: String,
    pub ttl: chrono::Duration,
}

/// Per identity provider settings.
#[derive(Debug, Clone, Default)]
pub struct ProviderConfig {
    pub enabled: bool,
    pub client_id: String,
    pub client_secret: String,
    /// Base URL of a self-hosted instance
    pub base_url: Option<String>,
    /// Lower-cased organization allow-list; empty permits any organization
    pub allowed_orgs: HashSet<String>,
    pub skip_tls_verify: bool,
}

/// Immutable configuration snapshot.
#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub proxy: ProxyConfig,
    pub session: SessionConfig,
    pub github: ProviderConfig,
    pub gitlab: ProviderConfig,
    pub bitbucket: ProviderConfig,
    pub provider_timeout: Duration,
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let var_or = |key: &str, default: &str| var(key).unwrap_or_else(|| default.to_string());

        let addr = |key: &'static str, default: &str| -> Result<SocketAddr, ConfigError> {
            var_or(key, default)
                .parse()
                .map_err(|_| ConfigError::Invalid(key))
        };
        let flag = |key: &'static str| -> Result<bool, ConfigError> {
            match var(key) {
                None => Ok(false),
                Some(v) => parse_bool(&v).ok_or(ConfigError::Invalid(key)),
            }
        };
        let seconds = |key: &'static str, default: u64| -> Result<u64, ConfigError> {
            match var(key) {
                None => Ok(default),
                Some(v) => v.trim().parse().map_err(|_| ConfigError::Invalid(key)),
            }
        };

        let host = Url::parse(&var_or("OAUTH2_PROXY_SERVER_HOST", "http://localhost"))
            .map_err(|_| ConfigError::Invalid("OAUTH2_PROXY_SERVER_HOST"))?;

        let server = ServerConfig {
            health_addr: addr("OAUTH2_PROXY_PRIVATE_ADDR", "127.0.0.1:9000")?,
            secure_addr: addr("OAUTH2_PROXY_SERVER_HTTPS", "0.0.0.0:443")?,
            public_addr: addr("OAUTH2_PROXY_SERVER_ADDR", "0.0.0.0:80")?,
            root: normalize_root(&var_or("OAUTH2_PROXY_SERVER_ROOT", "/oauth2-proxy")),
            host,
            cert: var("OAUTH2_PROXY_SERVER_CERT").map(PathBuf::from),
            key: var("OAUTH2_PROXY_SERVER_KEY").map(PathBuf::from),
            auto_cert: flag("OAUTH2_PROXY_AUTO_CERT")?,
            acme_contact: var("OAUTH2_PROXY_ACME_CONTACT"),
            assets: var("OAUTH2_PROXY_SERVER_ASSETS").map(PathBuf::from),
            storage: PathBuf::from(var_or("OAUTH2_PROXY_SERVER_STORAGE", "storage/")),
            title: var_or("OAUTH2_PROXY_SERVER_TITLE", "OAuth2 Proxy"),
            strict_curves: flag("OAUTH2_PROXY_STRICT_CURVES")?,
            strict_ciphers: flag("OAUTH2_PROXY_STRICT_CIPHERS")?,
        };

        let (endpoints, rejected_endpoints) =
            parse_endpoints(&var_or("OAUTH2_PROXY_SERVER_ENDPOINTS", ""));

        let proxy = ProxyConfig {
            endpoints,
            rejected_endpoints,
            user_header: var_or("OAUTH2_PROXY_USER_HEADER", "X-PROXY-USER"),
            upstream_timeout: Duration::from_secs(seconds("OAUTH2_PROXY_UPSTREAM_TIMEOUT", 30)?),
            retry_non_idempotent: flag("OAUTH2_PROXY_RETRY_NON_IDEMPOTENT")?,
        };
        if axum::http::HeaderName::from_bytes(proxy.user_header.as_bytes()).is_err() {
            return Err(ConfigError::Invalid("OAUTH2_PROXY_USER_HEADER"));
        }

        let cookie_name = var_or("OAUTH2_PROXY_SESSION_COOKIE", "oauth2_proxy_session");
        if !cookie_name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
        {
            return Err(ConfigError::Invalid("OAUTH2_PROXY_SESSION_COOKIE"));
        }

        let ttl = seconds("OAUTH2_PROXY_SESSION_TTL", 86_400)?;
        let session = SessionConfig {
            cookie_name,
            ttl: i64::try_from(ttl)
                .ok()
                .filter(|secs| *secs <= MAX_SESSION_TTL_SECS)
                .and_then(chrono::Duration::try_seconds)
                .ok_or(ConfigError::Invalid("OAUTH2_PROXY_SESSION_TTL"))?,
        };

        let provider = |prefix: &'static str,
                        enabled: &'static str,
                        orgs: &'static str,
                        skip: Option<&'static str>|
         -> Result<ProviderConfig, ConfigError> {
            Ok(ProviderConfig {
                enabled: flag(enabled)?,
                client_id: var_or(&format!("{prefix}_CLIENT"), ""),
                client_secret: var_or(&format!("{prefix}_SECRET"), ""),
                base_url: var(&format!("{prefix}_URL")),
                allowed_orgs: parse_orgs(&var_or(orgs, "")),
                skip_tls_verify: match skip {
                    Some(key) => flag(key)?,
                    None => false,
                },
            })
        };

        Ok(Self {
            server,
            proxy,
            session,
            github: provider(
                "OAUTH2_PROXY_GITHUB",
                "OAUTH2_PROXY_GITHUB",
                "OAUTH2_PROXY_GITHUB_ORGS",
                Some("OAUTH2_PROXY_GITHUB_SKIPVERIFY"),
            )?,
            gitlab: provider(
                "OAUTH2_PROXY_GITLAB",
                "OAUTH2_PROXY_GITLAB",
                "OAUTH2_PROXY_GITLAB_ORGS",
                Some("OAUTH2_PROXY_GITLAB_SKIPVERIFY"),
            )?,
            bitbucket: provider(
                "OAUTH2_PROXY_BITBUCKET",
                "OAUTH2_PROXY_BITBUCKET",
                "OAUTH2_PROXY_BITBUCKET_ORGS",
                None,
            )?,
            provider_timeout: Duration::from_secs(seconds("OAUTH2_PROXY_PROVIDER_TIMEOUT", 10)?),
            log_level: var("OAUTH2_PROXY_LOG_LEVEL")
                .or_else(|| var("RUST_LOG"))
                .unwrap_or_else(|| "info".to_string()),
        })
    }

    /// Checks that the gateway can actually serve logins.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let enabled: Vec<ProviderKind> = ProviderKind::ALL
            .into_iter()
            .filter(|kind| self.provider(*kind).enabled)
            .collect();
        if enabled.is_empty() {
            return Err(ConfigError::NoProviders);
        }
        for kind in enabled {
            let provider = self.provider(kind);
            if provider.client_id.is_empty() || provider.client_secret.is_empty() {
                return Err(ConfigError::MissingCredentials(kind));
            }
        }
        if self.server.auto_cert && self.server.host.host_str().is_none() {
            return Err(ConfigError::Invalid("OAUTH2_PROXY_SERVER_HOST"));
        }
        if self.server.cert.is_some() != self.server.key.is_some() {
            return Err(ConfigError::Invalid("OAUTH2_PROXY_SERVER_CERT/OAUTH2_PROXY_SERVER_KEY"));
        }
        Ok(())
    }

    pub fn provider(&self, kind: ProviderKind) -> &ProviderConfig {
        match kind {
            ProviderKind::GitHub => &self.github,
            ProviderKind::GitLab => &self.gitlab,
            ProviderKind::Bitbucket => &self.bitbucket,
        }
    }

    pub fn login_path(&self) -> String {
        format!("{}/login", self.server.root)
    }

    pub fn logout_path(&self) -> String {
        format!("{}/logout", self.server.root)
    }

    pub fn callback_path(&self, kind: ProviderKind) -> String {
        format!("{}/{}/callback", self.server.root, kind)
    }

    /// Absolute callback URL registered with the provider.
    pub fn callback_url(&self, kind: ProviderKind) -> String {
        format!(
            "{}{}",
            self.server.host.as_str().trim_end_matches('/'),
            self.callback_path(kind)
        )
    }

    /// Cookies get the `Secure` attribute when the gateway is reached over https.
    pub fn secure_cookies(&self) -> bool {
        self.server.host.scheme() == "https"
    }
}

/// Configuration error
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for environment variable: {0}")]
    Invalid(&'static str),

    #[error("No identity provider is enabled")]
    NoProviders,

    #[error("Client id and secret are required for the {0} provider")]
    MissingCredentials(ProviderKind),
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn normalize_root(root: &str) -> String {
    let trimmed = root.trim().trim_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("/{trimmed}")
    }
}

fn parse_orgs(raw: &str) -> HashSet<String> {
    raw.split(',')
        .map(|org| org.trim().to_lowercase())
        .filter(|org| !org.is_empty())
        .collect()
}

/// Split endpoints into usable URLs and rejected raw entries.
fn parse_endpoints(raw: &str) -> (Vec<Url>, Vec<String>) {
    let mut endpoints = Vec::new();
    let mut rejected = Vec::new();
    for endpoint in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        match Url::parse(endpoint) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => endpoints.push(url),
            Ok(_) | Err(_) => rejected.push(endpoint.to_string()),
        }
    }
    (endpoints, rejected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.server.root, "/oauth2-proxy");
        assert_eq!(config.server.health_addr, "127.0.0.1:9000".parse().unwrap());
        assert_eq!(config.proxy.user_header, "X-PROXY-USER");
        assert_eq!(config.session.ttl, chrono::Duration::seconds(86_400));
        assert!(!config.github.enabled);
        assert_eq!(config.login_path(), "/oauth2-proxy/login");
    }

    #[test]
    fn test_orgs_are_lowercased_and_endpoints_filtered() {
        let config = Config::from_lookup(lookup(&[
            ("OAUTH2_PROXY_GITHUB", "true"),
            ("OAUTH2_PROXY_GITHUB_ORGS", "Acme, MyOrg ,"),
            (
                "OAUTH2_PROXY_SERVER_ENDPOINTS",
                "http://10.0.0.1:8080, not a url, ftp://files, https://backend",
            ),
        ]))
        .unwrap();

        assert!(config.github.allowed_orgs.contains("acme"));
        assert!(config.github.allowed_orgs.contains("myorg"));
        assert_eq!(config.github.allowed_orgs.len(), 2);
        assert_eq!(config.proxy.endpoints.len(), 2);
        assert_eq!(config.proxy.rejected_endpoints, vec!["not a url", "ftp://files"]);
    }

    #[test]
    fn test_session_ttl_is_bounded() {
        let config =
            Config::from_lookup(lookup(&[("OAUTH2_PROXY_SESSION_TTL", "3600")])).unwrap();
        assert_eq!(config.session.ttl, chrono::Duration::hours(1));

        for ttl in ["31536001", "9223372036854775807", "18446744073709551615"] {
            assert!(
                matches!(
                    Config::from_lookup(lookup(&[("OAUTH2_PROXY_SESSION_TTL", ttl)])),
                    Err(ConfigError::Invalid("OAUTH2_PROXY_SESSION_TTL"))
                ),
                "accepted {ttl}"
            );
        }
    }

    #[test]
    fn test_strict_tls_flags() {
        let config = Config::from_lookup(lookup(&[])).unwrap();
        assert!(!config.server.strict_curves && !config.server.strict_ciphers);

        let config = Config::from_lookup(lookup(&[
            ("OAUTH2_PROXY_STRICT_CURVES", "true"),
            ("OAUTH2_PROXY_STRICT_CIPHERS", "1"),
        ]))
        .unwrap();
        assert!(config.server.strict_curves && config.server.strict_ciphers);
    }

    #[test]
    fn test_root_normalization() {
        assert_eq!(normalize_root("/"), "");
        assert_eq!(normalize_root("auth/"), "/auth");
        assert_eq!(normalize_root("/oauth2-proxy"), "/oauth2-proxy");
    }

    #[test]
    fn test_callback_url() {
        let config = Config::from_lookup(lookup(&[(
            "OAUTH2_PROXY_SERVER_HOST",
            "https://auth.example.com/",
        )]))
        .unwrap();
        assert_eq!(
            config.callback_url(ProviderKind::GitLab),
            "https://auth.example.com/oauth2-proxy/gitlab/callback"
        );
        assert!(config.secure_cookies());
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        assert!(matches!(
            Config::from_lookup(lookup(&[("OAUTH2_PROXY_AUTO_CERT", "maybe")])),
            Err(ConfigError::Invalid("OAUTH2_PROXY_AUTO_CERT"))
        ));
        assert!(matches!(
            Config::from_lookup(lookup(&[("OAUTH2_PROXY_SERVER_ADDR", "nowhere")])),
            Err(ConfigError::Invalid("OAUTH2_PROXY_SERVER_ADDR"))
        ));
    }

    #[test]
    fn test_validate_requires_provider_credentials() {
        let config = Config::from_lookup(lookup(&[])).unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::NoProviders)));

        let config = Config::from_lookup(lookup(&[("OAUTH2_PROXY_GITLAB", "1")])).unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingCredentials(ProviderKind::GitLab))
        ));

        let config = Config::from_lookup(lookup(&[
            ("OAUTH2_PROXY_GITLAB", "1"),
            ("OAUTH2_PROXY_GITLAB_CLIENT", "id"),
            ("OAUTH2_PROXY_GITLAB_SECRET", "secret"),
        ]))
        .unwrap();
        assert!(config.validate().is_ok());
    }
}
