//! GitHub, GitLab and Bitbucket identity providers.
//!
//! Each provider resolves the user profile plus the organizations (GitHub
//! orgs, GitLab groups, Bitbucket workspaces) used for the allow-list check.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::info;

use super::identity::{Identity, ProviderKind};
use super::oauth::{IdentityProvider, OAuthClient, OAuthConfig};
use crate::config::ProviderConfig;
use crate::error::Result;

const GITHUB_URL: &str = "https://github.com";
const GITHUB_API_URL: &str = "https://api.github.com";
const GITLAB_URL: &str = "https://gitlab.com";
const BITBUCKET_URL: &str = "https://bitbucket.org";
const BITBUCKET_API_URL: &str = "https://api.bitbucket.org/2.0";

fn trimmed(base: &str) -> &str {
    base.trim_end_matches('/')
}

impl OAuthConfig {
    /// GitHub or GitHub Enterprise (when `base_url` is set).
    pub fn github(config: &ProviderConfig) -> (Self, String) {
        let (site, api) = match config.base_url.as_deref().map(trimmed) {
            Some(base) if base != GITHUB_URL => (base.to_string(), format!("{base}/api/v3")),
            _ => (GITHUB_URL.to_string(), GITHUB_API_URL.to_string()),
        };

        let oauth = Self {
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
            auth_url: format!("{site}/login/oauth/authorize"),
            token_url: format!("{site}/login/oauth/access_token"),
            scopes: vec!["read:user".to_string(), "read:org".to_string()],
            basic_auth: false,
        };
        (oauth, api)
    }

    /// GitLab.com or a self-hosted GitLab instance.
    pub fn gitlab(config: &ProviderConfig) -> (Self, String) {
        let site = trimmed(config.base_url.as_deref().unwrap_or(GITLAB_URL)).to_string();

        let oauth = Self {
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
            auth_url: format!("{site}/oauth/authorize"),
            token_url: format!("{site}/oauth/token"),
            scopes: vec!["read_user".to_string(), "read_api".to_string()],
            basic_auth: false,
        };
        (oauth, format!("{site}/api/v4"))
    }

    /// Bitbucket Cloud. A `base_url` serves both the OAuth and the API routes.
    pub fn bitbucket(config: &ProviderConfig) -> (Self, String) {
        let (site, api) = match config.base_url.as_deref().map(trimmed) {
            Some(base) => (base.to_string(), format!("{base}/2.0")),
            None => (BITBUCKET_URL.to_string(), BITBUCKET_API_URL.to_string()),
        };

        let oauth = Self {
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
            auth_url: format!("{site}/site/oauth2/authorize"),
            token_url: format!("{site}/site/oauth2/access_token"),
            scopes: vec!["account".to_string()],
            basic_auth: true,
        };
        (oauth, api)
    }
}

pub struct GitHubProvider {
    client: OAuthClient,
    api_url: String,
}

impl GitHubProvider {
    pub fn new(config: &ProviderConfig, timeout: Duration) -> Result<Self> {
        let (oauth, api_url) = OAuthConfig::github(config);
        info!("[INFO] GitHub API at {}", api_url);
        Ok(Self {
            client: OAuthClient::new(oauth, timeout, config.skip_tls_verify)?,
            api_url,
        })
    }
}

#[derive(Deserialize)]
struct GitHubUser {
    id: u64,
    login: String,
}

#[derive(Deserialize)]
struct GitHubOrg {
    login: String,
}

#[async_trait]
impl IdentityProvider for GitHubProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::GitHub
    }

    fn authorization_url(&self, callback_url: &str, csrf_state: &str) -> Result<String> {
        self.client.authorization_url(callback_url, csrf_state)
    }

    async fn exchange_code(&self, code: &str, callback_url: &str) -> Result<Identity> {
        let token = self.client.exchange_code(code, callback_url).await?;

        let user: GitHubUser = self
            .client
            .get_json(&format!("{}/user", self.api_url), &token)
            .await?;
        let orgs: Vec<GitHubOrg> = self
            .client
            .get_json(&format!("{}/user/orgs?per_page=100", self.api_url), &token)
            .await?;

        Ok(Identity::new(
            ProviderKind::GitHub,
            user.id.to_string(),
            user.login,
            orgs.into_iter().map(|org| org.login),
        ))
    }
}

pub struct GitLabProvider {
    client: OAuthClient,
    api_url: String,
}

impl GitLabProvider {
    pub fn new(config: &ProviderConfig, timeout: Duration) -> Result<Self> {
        let (oauth, api_url) = OAuthConfig::gitlab(config);
        info!("[INFO] GitLab API at {}", api_url);
        Ok(Self {
            client: OAuthClient::new(oauth, timeout, config.skip_tls_verify)?,
            api_url,
        })
    }
}

#[derive(Deserialize)]
struct GitLabUser {
    id: u64,
    username: String,
}

#[derive(Deserialize)]
struct GitLabGroup {
    full_path: String,
}

#[async_trait]
impl IdentityProvider for GitLabProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::GitLab
    }

    fn authorization_url(&self, callback_url: &str, csrf_state: &str) -> Result<String> {
        self.client.authorization_url(callback_url, csrf_state)
    }

    async fn exchange_code(&self, code: &str, callback_url: &str) -> Result<Identity> {
        let token = self.client.exchange_code(code, callback_url).await?;

        let user: GitLabUser = self
            .client
            .get_json(&format!("{}/user", self.api_url), &token)
            .await?;
        let groups: Vec<GitLabGroup> = self
            .client
            .get_json(
                &format!("{}/groups?min_access_level=10&per_page=100", self.api_url),
                &token,
            )
            .await?;

        Ok(Identity::new(
            ProviderKind::GitLab,
            user.id.to_string(),
            user.username,
            groups.into_iter().map(|group| group.full_path),
        ))
    }
}

pub struct BitbucketProvider {
    client: OAuthClient,
    api_url: String,
}

impl BitbucketProvider {
    pub fn new(config: &ProviderConfig, timeout: Duration) -> Result<Self> {
        let (oauth, api_url) = OAuthConfig::bitbucket(config);
        info!("[INFO] Bitbucket API at {}", api_url);
        Ok(Self {
            client: OAuthClient::new(oauth, timeout, config.skip_tls_verify)?,
            api_url,
        })
    }
}

#[derive(Deserialize)]
struct BitbucketUser {
    uuid: String,
    username: Option<String>,
    nickname: Option<String>,
}

#[derive(Deserialize)]
struct BitbucketPage<T> {
    values: Vec<T>,
}

#[derive(Deserialize)]
struct BitbucketWorkspace {
    slug: String,
}

#[async_trait]
impl IdentityProvider for BitbucketProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Bitbucket
    }

    fn authorization_url(&self, callback_url: &str, csrf_state: &str) -> Result<String> {
        self.client.authorization_url(callback_url, csrf_state)
    }

    async fn exchange_code(&self, code: &str, callback_url: &str) -> Result<Identity> {
        let token = self.client.exchange_code(code, callback_url).await?;

        let user: BitbucketUser = self
            .client
            .get_json(&format!("{}/user", self.api_url), &token)
            .await?;
        let workspaces: BitbucketPage<BitbucketWorkspace> = self
            .client
            .get_json(
                &format!("{}/workspaces?role=member&pagelen=100", self.api_url),
                &token,
            )
            .await?;

        // Accounts created after the username deprecation only carry a nickname.
        let username = user
            .username
            .or(user.nickname)
            .unwrap_or_else(|| user.uuid.clone());

        Ok(Identity::new(
            ProviderKind::Bitbucket,
            user.uuid,
            username,
            workspaces.values.into_iter().map(|ws| ws.slug),
        ))
    }
}
