use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use oauth2::basic::{BasicClient, BasicTokenResponse};
use oauth2::{
    AuthType, AuthUrl, AuthorizationCode, ClientId, ClientSecret, CsrfToken, HttpRequest,
    HttpResponse, RedirectUrl, RequestTokenError, Scope, TokenResponse, TokenUrl,
};
use serde::de::DeserializeOwned;
use subtle::ConstantTimeEq;
use tracing::{debug, info, warn};

use super::csrf::PendingFlow;
use super::identity::{Identity, ProviderKind};
use super::providers::{BitbucketProvider, GitHubProvider, GitLabProvider};
use crate::config::Config;
use crate::error::{GatewayError, Result};

const USER_AGENT: &str = concat!("oauth-proxy/", env!("CARGO_PKG_VERSION"));

/// OAuth application endpoints and credentials for one provider
#[derive(Debug, Clone)]
pub struct OAuthConfig {
    pub client_id: String,
    pub client_secret: String,
    pub auth_url: String,
    pub token_url: String,
    pub scopes: Vec<String>,
    /// Send client credentials as HTTP basic auth instead of in the form body
    pub basic_auth: bool,
}

/// OAuth client shared by the concrete providers.
///
/// Wraps the `oauth2` client for authorization URLs and code exchange, plus an
/// HTTP client bounded by the provider timeout for profile and org lookups.
pub struct OAuthClient {
    oauth: BasicClient,
    scopes: Vec<String>,
    http_client: reqwest::Client,
}

impl OAuthClient {
    /// Create a new OAuth client
    pub fn new(config: OAuthConfig, timeout: Duration, skip_tls_verify: bool) -> Result<Self> {
        let auth_url = AuthUrl::new(config.auth_url.clone())
            .map_err(|e| GatewayError::ProviderError(format!("invalid authorization url: {e}")))?;
        let token_url = TokenUrl::new(config.token_url)
            .map_err(|e| GatewayError::ProviderError(format!("invalid token url: {e}")))?;

        let auth_type = if config.basic_auth {
            AuthType::BasicAuth
        } else {
            AuthType::RequestBody
        };
        let oauth = BasicClient::new(
            ClientId::new(config.client_id),
            Some(ClientSecret::new(config.client_secret)),
            auth_url,
            Some(token_url),
        )
        .set_auth_type(auth_type);

        if skip_tls_verify {
            warn!("TLS certificate verification disabled for {}", config.auth_url);
        }
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .danger_accept_invalid_certs(skip_tls_verify)
            .redirect(reqwest::redirect::Policy::none())
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| GatewayError::ProviderError(format!("failed to build http client: {e}")))?;

        Ok(Self {
            oauth,
            scopes: config.scopes,
            http_client,
        })
    }

    /// Build the provider's authorization URL carrying `csrf_state`.
    pub fn authorization_url(&self, callback_url: &str, csrf_state: &str) -> Result<String> {
        let redirect = RedirectUrl::new(callback_url.to_string())
            .map_err(|e| GatewayError::ProviderError(format!("invalid callback url: {e}")))?;

        let state = csrf_state.to_string();
        let (url, _) = self
            .oauth
            .clone()
            .set_redirect_uri(redirect)
            .authorize_url(move || CsrfToken::new(state))
            .add_scopes(self.scopes.iter().cloned().map(Scope::new))
            .url();

        Ok(url.to_string())
    }

    /// Exchange an authorization code for an access token.
    pub async fn exchange_code(&self, code: &str, callback_url: &str) -> Result<String> {
        let redirect = RedirectUrl::new(callback_url.to_string())
            .map_err(|e| GatewayError::ProviderError(format!("invalid callback url: {e}")))?;

        let http_client = self.http_client.clone();
        let token: BasicTokenResponse = self
            .oauth
            .clone()
            .set_redirect_uri(redirect)
            .exchange_code(AuthorizationCode::new(code.to_string()))
            .request_async(move |request| send_oauth_request(http_client, request))
            .await
            .map_err(|e| match e {
                RequestTokenError::ServerResponse(resp) => {
                    GatewayError::ProviderError(format!("token exchange rejected: {}", resp.error()))
                }
                RequestTokenError::Request(e) => {
                    GatewayError::ProviderError(format!("token request failed: {e}"))
                }
                RequestTokenError::Parse(e, _) => {
                    GatewayError::ProviderError(format!("failed to parse token response: {e}"))
                }
                RequestTokenError::Other(e) => GatewayError::ProviderError(e),
            })?;

        Ok(token.access_token().secret().clone())
    }

    /// GET a JSON resource from the provider API with the user's access token.
    pub async fn get_json<T: DeserializeOwned>(&self, url: &str, access_token: &str) -> Result<T> {
        debug!("provider api request: GET {}", url);

        let response = self
            .http_client
            .get(url)
            .bearer_auth(access_token)
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await
            .map_err(|e| GatewayError::ProviderError(format!("request to {url} failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(GatewayError::ProviderError(format!(
                "{url} returned {status}: {body}"
            )));
        }

        response
            .json()
            .await
            .map_err(|e| GatewayError::ProviderError(format!("failed to parse {url}: {e}")))
    }
}

/// Bridges the `oauth2` request types onto the shared reqwest client.
async fn send_oauth_request(
    client: reqwest::Client,
    request: HttpRequest,
) -> std::result::Result<HttpResponse, reqwest::Error> {
    let method = reqwest::Method::from_bytes(request.method.as_str().as_bytes())
        .unwrap_or(reqwest::Method::POST);

    let mut builder = client.request(method, request.url.as_str());
    for (name, value) in request.headers.iter() {
        builder = builder.header(name.as_str(), value.as_bytes());
    }
    let response = builder.body(request.body).send().await?;

    let status_code = oauth2::http::StatusCode::from_u16(response.status().as_u16())
        .unwrap_or(oauth2::http::StatusCode::BAD_GATEWAY);
    let mut headers = oauth2::http::HeaderMap::new();
    for (name, value) in response.headers() {
        if let (Ok(name), Ok(value)) = (
            oauth2::http::header::HeaderName::from_bytes(name.as_str().as_bytes()),
            oauth2::http::header::HeaderValue::from_bytes(value.as_bytes()),
        ) {
            headers.append(name, value);
        }
    }
    let body = response.bytes().await?.to_vec();

    Ok(HttpResponse {
        status_code,
        headers,
        body,
    })
}

/// An identity provider able to run the authorization-code flow.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    /// Authorization redirect URL for a login attempt.
    fn authorization_url(&self, callback_url: &str, csrf_state: &str) -> Result<String>;

    /// Redeem a callback code and resolve the user's identity and organizations.
    async fn exchange_code(&self, code: &str, callback_url: &str) -> Result<Identity>;
}

/// Enabled identity providers, keyed by kind. Built once at startup.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: HashMap<ProviderKind, Arc<dyn IdentityProvider>>,
    callback_base: String,
}

impl ProviderRegistry {
    /// Callback URLs are `{callback_base}/{provider}/callback`.
    pub fn new(callback_base: impl Into<String>) -> Self {
        Self {
            providers: HashMap::new(),
            callback_base: callback_base.into().trim_end_matches('/').to_string(),
        }
    }

    /// Build clients for every provider enabled in `config`.
    pub fn from_config(config: &Config) -> Result<Self> {
        let callback_base = format!(
            "{}{}",
            config.server.host.as_str().trim_end_matches('/'),
            config.server.root
        );
        let mut registry = Self::new(callback_base);

        for kind in ProviderKind::ALL {
            let provider_config = config.provider(kind);
            if !provider_config.enabled {
                continue;
            }
            let provider: Arc<dyn IdentityProvider> = match kind {
                ProviderKind::GitHub => Arc::new(GitHubProvider::new(
                    provider_config,
                    config.provider_timeout,
                )?),
                ProviderKind::GitLab => Arc::new(GitLabProvider::new(
                    provider_config,
                    config.provider_timeout,
                )?),
                ProviderKind::Bitbucket => Arc::new(BitbucketProvider::new(
                    provider_config,
                    config.provider_timeout,
                )?),
            };
            info!("[OK] {} login enabled", kind.display_name());
            registry = registry.with_provider(provider);
        }

        Ok(registry)
    }

    pub fn with_provider(mut self, provider: Arc<dyn IdentityProvider>) -> Self {
        self.providers.insert(provider.kind(), provider);
        self
    }

    /// Look up an enabled provider by route name.
    pub fn get(&self, name: &str) -> Result<Arc<dyn IdentityProvider>> {
        let kind: ProviderKind = name.parse()?;
        self.providers
            .get(&kind)
            .cloned()
            .ok_or_else(|| GatewayError::UnknownProvider(name.to_string()))
    }

    /// Enabled providers in display order.
    pub fn enabled(&self) -> Vec<ProviderKind> {
        let mut kinds: Vec<ProviderKind> = self.providers.keys().copied().collect();
        kinds.sort();
        kinds
    }

    pub fn callback_url(&self, kind: ProviderKind) -> String {
        format!("{}/{}/callback", self.callback_base, kind)
    }

    pub fn authorization_url(
        &self,
        provider: &str,
        callback_url: &str,
        csrf_state: &str,
    ) -> Result<String> {
        self.get(provider)?.authorization_url(callback_url, csrf_state)
    }

    /// Verify the callback state against the pending flow and redeem the code.
    ///
    /// `flow` is the server-side record taken for `csrf_state`; a missing flow,
    /// a flow for another provider or a differing state is a CSRF mismatch.
    pub async fn exchange_code(
        &self,
        provider: &str,
        code: &str,
        csrf_state: &str,
        flow: Option<&PendingFlow>,
    ) -> Result<Identity> {
        let provider = self.get(provider)?;

        let flow = flow.ok_or(GatewayError::CsrfMismatch)?;
        if flow.provider != provider.kind()
            || !bool::from(flow.state.as_bytes().ct_eq(csrf_state.as_bytes()))
        {
            return Err(GatewayError::CsrfMismatch);
        }

        provider
            .exchange_code(code, &self.callback_url(provider.kind()))
            .await
    }
}
