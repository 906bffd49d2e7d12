//! OAuth2 Proxy
//!
//! Authenticating reverse proxy that puts GitHub, GitLab or Bitbucket logins in
//! front of backend HTTP services.
//!
//! # Features
//! - OAuth2 authorization-code login with single-use CSRF state
//! - Organization / group / workspace allow-lists per provider
//! - In-memory sessions with expiry and logout
//! - Round-robin forwarding with bounded retries and passive health tracking
//! - TLS from a static certificate or on-demand ACME certificates
//! - Health, readiness and Prometheus metrics on an internal listener

pub mod auth;
pub mod config;
pub mod error;
pub mod proxy;
pub mod server;
pub mod telemetry;

pub use auth::{Identity, IdentityProvider, ProviderKind, ProviderRegistry, Session, SessionStore};
pub use config::{Config, ConfigError};
pub use error::{GatewayError, Result};
pub use proxy::{EndpointPool, Forwarder};
pub use server::{build_router, start_server, AppState};
