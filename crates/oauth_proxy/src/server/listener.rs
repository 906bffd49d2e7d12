//! Listener lifecycle.
//!
//! All listeners of the gateway start and stop as one unit: a bind failure
//! during startup, a listener dying at runtime, or the shutdown signal tears
//! every listener down with a bounded grace period.

use std::future::Future;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum_server::tls_rustls::RustlsConfig;
use axum_server::Handle;
use futures::future::BoxFuture;
use futures::StreamExt;
use rustls_acme::axum::AxumAcceptor;
use rustls_acme::caches::DirCache;
use rustls_acme::AcmeConfig;
use rustls::crypto::{aws_lc_rs, CryptoProvider};
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::{CipherSuite, NamedGroup, ServerConfig};
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::error::{GatewayError, Result};

/// How long in-flight requests get to finish once shutdown starts.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LifecycleState {
    Stopped = 0,
    Starting = 1,
    Running = 2,
    Stopping = 3,
}

/// Shared view of the listener group's state, read by the readiness check.
#[derive(Debug)]
pub struct Lifecycle(AtomicU8);

impl Lifecycle {
    pub fn new() -> Self {
        Self(AtomicU8::new(LifecycleState::Stopped as u8))
    }

    pub fn get(&self) -> LifecycleState {
        match self.0.load(Ordering::Acquire) {
            1 => LifecycleState::Starting,
            2 => LifecycleState::Running,
            3 => LifecycleState::Stopping,
            _ => LifecycleState::Stopped,
        }
    }

    fn set(&self, state: LifecycleState) {
        self.0.store(state as u8, Ordering::Release);
    }

    pub fn is_running(&self) -> bool {
        self.get() == LifecycleState::Running
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

const ALPN_PROTOCOLS: [&[u8]; 2] = [b"h2", b"http/1.1"];

/// AES-GCM suites with forward secrecy; TLS 1.3 suites are all ECDHE.
const STRICT_CIPHER_SUITES: [CipherSuite; 6] = [
    CipherSuite::TLS13_AES_256_GCM_SHA384,
    CipherSuite::TLS13_AES_128_GCM_SHA256,
    CipherSuite::TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384,
    CipherSuite::TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384,
    CipherSuite::TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256,
    CipherSuite::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,
];

const STRICT_KX_GROUPS: [NamedGroup; 2] = [NamedGroup::secp384r1, NamedGroup::secp256r1];

/// Cipher suite and key exchange restrictions for the TLS listener.
#[derive(Debug, Clone, Copy, Default)]
pub struct TlsPolicy {
    pub strict_curves: bool,
    pub strict_ciphers: bool,
}

impl TlsPolicy {
    pub fn crypto_provider(&self) -> CryptoProvider {
        let mut provider = aws_lc_rs::default_provider();
        if self.strict_ciphers {
            provider
                .cipher_suites
                .retain(|suite| STRICT_CIPHER_SUITES.contains(&suite.suite()));
        }
        if self.strict_curves {
            provider
                .kx_groups
                .retain(|group| STRICT_KX_GROUPS.contains(&group.name()));
        }
        provider
    }
}

fn certificate_error(path: &Path, reason: impl std::fmt::Display) -> GatewayError {
    GatewayError::CertificateError(format!("failed to load {}: {}", path.display(), reason))
}

fn load_static_config(cert: &Path, key: &Path, policy: TlsPolicy) -> Result<ServerConfig> {
    let chain = CertificateDer::pem_file_iter(cert)
        .and_then(|certs| certs.collect::<std::result::Result<Vec<_>, _>>())
        .map_err(|e| certificate_error(cert, e))?;
    if chain.is_empty() {
        return Err(certificate_error(cert, "no certificate found"));
    }
    let private_key = PrivateKeyDer::from_pem_file(key).map_err(|e| certificate_error(key, e))?;

    let mut config = ServerConfig::builder_with_provider(Arc::new(policy.crypto_provider()))
        .with_safe_default_protocol_versions()
        .map_err(|e| GatewayError::CertificateError(format!("unusable TLS policy: {e}")))?
        .with_no_client_auth()
        .with_single_cert(chain, private_key)
        .map_err(|e| GatewayError::CertificateError(format!("invalid certificate pair: {e}")))?;
    config.alpn_protocols = ALPN_PROTOCOLS.iter().map(|p| p.to_vec()).collect();
    Ok(config)
}

/// Where the TLS listener gets its certificate.
#[derive(Debug, Clone)]
pub enum CertificateSource {
    /// PEM certificate chain and private key on disk
    Static { cert: PathBuf, key: PathBuf },
    /// Certificates requested from Let's Encrypt on demand, cached in `cache_dir`
    Acme {
        domains: Vec<String>,
        contact: Option<String>,
        cache_dir: PathBuf,
        production: bool,
    },
}

impl CertificateSource {
    /// Resolve into a listener transport plus, for ACME, the background
    /// future that drives certificate orders and renewals.
    pub fn into_transport(
        self,
        policy: TlsPolicy,
    ) -> Result<(Transport, Option<BoxFuture<'static, ()>>)> {
        match self {
            Self::Static { cert, key } => {
                let config = load_static_config(&cert, &key, policy)?;
                Ok((Transport::Tls(RustlsConfig::from_config(Arc::new(config))), None))
            }
            Self::Acme {
                domains,
                contact,
                cache_dir,
                production,
            } => {
                if domains.is_empty() {
                    return Err(GatewayError::CertificateError(
                        "ACME requires at least one domain".to_string(),
                    ));
                }
                info!("[INFO] ACME certificates for {:?} cached in {}", domains, cache_dir.display());

                let mut state = AcmeConfig::new(domains)
                    .contact(contact.iter().map(|email| format!("mailto:{email}")))
                    .cache(DirCache::new(cache_dir))
                    .directory_lets_encrypt(production)
                    .state();
                let mut rustls_config = (*state
                    .default_rustls_config_with_provider(Arc::new(policy.crypto_provider())))
                .clone();
                rustls_config.alpn_protocols = ALPN_PROTOCOLS.iter().map(|p| p.to_vec()).collect();
                let acceptor = state.axum_acceptor(Arc::new(rustls_config));

                let driver: BoxFuture<'static, ()> = Box::pin(async move {
                    while let Some(event) = state.next().await {
                        match event {
                            Ok(ok) => info!("[OK] ACME event: {:?}", ok),
                            Err(err) => error!("ACME error: {:?}", err),
                        }
                    }
                });
                Ok((Transport::Acme(acceptor), Some(driver)))
            }
        }
    }
}

/// How a listener accepts connections.
pub enum Transport {
    Plain,
    Tls(RustlsConfig),
    Acme(AxumAcceptor),
}

pub struct ListenerSpec {
    pub name: &'static str,
    pub addr: SocketAddr,
    pub router: Router,
    pub transport: Transport,
}

impl ListenerSpec {
    pub fn plain(name: &'static str, addr: SocketAddr, router: Router) -> Self {
        Self {
            name,
            addr,
            router,
            transport: Transport::Plain,
        }
    }
}

type ListenerExit = (&'static str, SocketAddr, std::io::Result<()>);

/// A set of listeners run as one unit.
pub struct ListenerGroup {
    listeners: Vec<ListenerSpec>,
    background: Vec<BoxFuture<'static, ()>>,
    lifecycle: Arc<Lifecycle>,
    grace: Duration,
}

impl ListenerGroup {
    pub fn new(lifecycle: Arc<Lifecycle>) -> Self {
        Self {
            listeners: Vec::new(),
            background: Vec::new(),
            lifecycle,
            grace: DEFAULT_GRACE_PERIOD,
        }
    }

    pub fn listener(mut self, spec: ListenerSpec) -> Self {
        self.listeners.push(spec);
        self
    }

    /// A task that lives as long as the listeners, e.g. the ACME driver.
    pub fn background(mut self, task: BoxFuture<'static, ()>) -> Self {
        self.background.push(task);
        self
    }

    pub fn grace_period(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Bind every listener, serve until `shutdown` resolves or a listener
    /// exits, then stop them all.
    pub async fn run<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let lifecycle = self.lifecycle;
        let grace = self.grace;
        lifecycle.set(LifecycleState::Starting);

        let mut background = JoinSet::new();
        for task in self.background {
            background.spawn(task);
        }

        let mut tasks: JoinSet<ListenerExit> = JoinSet::new();
        let mut handles: Vec<Handle> = Vec::new();

        for spec in self.listeners {
            let handle = Handle::new();
            let (name, addr) = (spec.name, spec.addr);
            tasks.spawn(serve(spec, handle.clone()));

            match handle.listening().await {
                Some(bound) => {
                    info!("[OK] {} listener on {}", name, bound);
                    handles.push(handle);
                }
                None => {
                    lifecycle.set(LifecycleState::Stopping);
                    let exits = stop(&handles, &mut tasks, grace).await;
                    background.abort_all();
                    lifecycle.set(LifecycleState::Stopped);

                    let source = exits
                        .into_iter()
                        .find(|(n, a, _)| *n == name && *a == addr)
                        .and_then(|(_, _, result)| result.err())
                        .unwrap_or_else(|| {
                            std::io::Error::new(std::io::ErrorKind::Other, "listener did not start")
                        });
                    error!("failed to bind {} listener on {}: {}", name, addr, source);
                    return Err(GatewayError::ListenerBindFailure { name, addr, source });
                }
            }
        }

        lifecycle.set(LifecycleState::Running);
        info!("[OK] {} listener(s) running", handles.len());

        let outcome = tokio::select! {
            () = shutdown => Ok(()),
            Some(exit) = tasks.join_next() => {
                let err = match exit {
                    Ok((name, addr, Err(e))) => GatewayError::ListenerFailed { name, addr, reason: e.to_string() },
                    Ok((name, addr, Ok(()))) => GatewayError::ListenerFailed { name, addr, reason: "exited unexpectedly".to_string() },
                    Err(e) => GatewayError::Internal(format!("listener task failed: {e}")),
                };
                error!("{}", err);
                Err(err)
            }
        };

        lifecycle.set(LifecycleState::Stopping);
        info!("[INFO] Stopping listeners (grace period {:?})", grace);
        stop(&handles, &mut tasks, grace).await;
        background.abort_all();
        lifecycle.set(LifecycleState::Stopped);
        info!("[OK] All listeners stopped");

        outcome
    }
}

async fn serve(spec: ListenerSpec, handle: Handle) -> ListenerExit {
    let service = spec
        .router
        .into_make_service_with_connect_info::<SocketAddr>();

    let result = match spec.transport {
        Transport::Plain => axum_server::bind(spec.addr).handle(handle).serve(service).await,
        Transport::Tls(config) => {
            axum_server::bind_rustls(spec.addr, config)
                .handle(handle)
                .serve(service)
                .await
        }
        Transport::Acme(acceptor) => {
            axum_server::bind(spec.addr)
                .acceptor(acceptor)
                .handle(handle)
                .serve(service)
                .await
        }
    };
    (spec.name, spec.addr, result)
}

/// Gracefully shut down every handle, then force-close whatever is left.
async fn stop(handles: &[Handle], tasks: &mut JoinSet<ListenerExit>, grace: Duration) -> Vec<ListenerExit> {
    for handle in handles {
        handle.graceful_shutdown(Some(grace));
    }

    let mut exits = Vec::new();
    let drain = async {
        while let Some(joined) = tasks.join_next().await {
            if let Ok(exit) = joined {
                exits.push(exit);
            }
        }
    };
    if tokio::time::timeout(grace + Duration::from_secs(1), drain).await.is_err() {
        warn!("listeners did not stop within the grace period, aborting");
    }
    tasks.abort_all();
    exits
}
