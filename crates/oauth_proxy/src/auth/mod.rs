//! Authentication: identity providers, login CSRF state and sessions.

pub mod crypto;
pub mod csrf;
pub mod identity;
pub mod oauth;
pub mod providers;
pub mod session_store;

pub use csrf::{PendingFlow, PendingFlows};
pub use identity::{Identity, ProviderKind};
pub use oauth::{IdentityProvider, OAuthClient, OAuthConfig, ProviderRegistry};
pub use providers::{BitbucketProvider, GitHubProvider, GitLabProvider};
pub use session_store::{Session, SessionStore};
