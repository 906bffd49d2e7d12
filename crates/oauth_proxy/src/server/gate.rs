//! Auth gate handlers.
//!
//! Every request ends in exactly one outcome: a login redirect, a code
//! exchange that creates a session, a forward to the backend pool, or a
//! rejection page.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, Query, Request, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Form;
use serde::Deserialize;
use subtle::ConstantTimeEq;
use tracing::{info, warn};

use super::cookies::{decode_value, encode_value, read_cookie, strip_cookie};
use super::pages;
use super::AppState;
use crate::auth::{PendingFlow, ProviderKind, Session};
use crate::error::GatewayError;

/// Seconds the CSRF state and return-to cookies live; matches the pending flow lifetime.
const LOGIN_COOKIE_MAX_AGE: i64 = 600;

/// Login parameters, from the query string or a submitted form
#[derive(Debug, Default, Deserialize)]
pub struct LoginParams {
    pub provider: Option<String>,
    pub return_to: Option<String>,
}

/// Parameters the provider appends to the callback URL
#[derive(Debug, Deserialize)]
pub struct CallbackParams {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
    pub error_description: Option<String>,
}

impl AppState {
    pub fn csrf_cookie(&self) -> String {
        format!("{}_csrf", self.config.session.cookie_name)
    }

    pub fn return_cookie(&self) -> String {
        format!("{}_return", self.config.session.cookie_name)
    }

    /// Resolve the session cookie to a session allowed through the gate.
    ///
    /// A missing or expired session is `SessionExpired`; a valid session whose
    /// identity fails the provider's org allow-list is `OrgNotAllowed` and is
    /// left in place.
    pub fn authorize(&self, headers: &HeaderMap) -> Result<Session, GatewayError> {
        let session = read_cookie(headers, &self.config.session.cookie_name)
            .and_then(|token| self.sessions.lookup(&token))
            .ok_or(GatewayError::SessionExpired)?;

        let identity = &session.identity;
        let allowed = &self.config.provider(identity.provider()).allowed_orgs;
        if !identity.is_member_of_any(allowed) {
            return Err(GatewayError::OrgNotAllowed(identity.username().to_string()));
        }
        Ok(session)
    }
}

fn request_id(headers: &HeaderMap) -> Option<&str> {
    headers.get("x-request-id").and_then(|v| v.to_str().ok())
}

/// 302 with `Location`, plus any cookies to set.
fn found(location: &str, cookies: Vec<Option<HeaderValue>>) -> Response {
    let Ok(location) = HeaderValue::from_str(location) else {
        return pages::error_page(
            StatusCode::INTERNAL_SERVER_ERROR,
            "An internal error occurred.",
            None,
        );
    };

    let mut response = StatusCode::FOUND.into_response();
    let headers = response.headers_mut();
    headers.insert(header::LOCATION, location);
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    for cookie in cookies.into_iter().flatten() {
        headers.append(header::SET_COOKIE, cookie);
    }
    response
}

fn reject(err: &GatewayError, headers: &HeaderMap) -> Response {
    pages::error_page(err.status_code(), err.public_message(), request_id(headers))
}

/// Only local absolute paths are followed after login.
pub fn sanitize_return_to(path: &str) -> Option<String> {
    let valid = path.starts_with('/')
        && !path.starts_with("//")
        && !path.starts_with("/\\")
        && !path.chars().any(|c| c.is_control());
    valid.then(|| path.to_string())
}

/// `GET {root}/login`
pub async fn login(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(params): Query<LoginParams>,
) -> Response {
    begin_login(&state, &headers, params)
}

/// Fields accepted by `POST {root}/login`: either a provider selection or
/// the provider's authorization response.
#[derive(Debug, Default, Deserialize)]
pub struct LoginForm {
    pub provider: Option<String>,
    pub return_to: Option<String>,
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
    pub error_description: Option<String>,
}

impl LoginForm {
    /// Form fields take precedence over the query string.
    fn merge(self, query: LoginForm) -> Self {
        Self {
            provider: self.provider.or(query.provider),
            return_to: self.return_to.or(query.return_to),
            code: self.code.or(query.code),
            state: self.state.or(query.state),
            error: self.error.or(query.error),
            error_description: self.error_description.or(query.error_description),
        }
    }

    fn is_authorization_response(&self) -> bool {
        self.code.is_some() || self.state.is_some() || self.error.is_some()
    }
}

/// `POST {root}/login`
///
/// An authorization response (`code`/`state`) completes the login like the
/// provider callback, with the provider taken from the pending flow. Anything
/// else starts a login.
pub async fn login_form(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<LoginForm>,
    form: Option<Form<LoginForm>>,
) -> Response {
    let form = form.map(|Form(form)| form).unwrap_or_default().merge(query);

    if form.is_authorization_response() {
        let params = CallbackParams {
            code: form.code,
            state: form.state,
            error: form.error,
            error_description: form.error_description,
        };
        return finish_login(&state, None, &headers, params).await;
    }

    let params = LoginParams {
        provider: form.provider,
        return_to: form.return_to,
    };
    begin_login(&state, &headers, params)
}

fn begin_login(state: &AppState, headers: &HeaderMap, params: LoginParams) -> Response {
    let config = &state.config;

    if state.authorize(headers).is_ok() {
        return found("/", Vec::new());
    }

    let enabled = state.providers.enabled();
    let provider = match params.provider {
        Some(provider) => provider,
        None if enabled.len() == 1 => enabled[0].to_string(),
        None => {
            return pages::login_page(&config.server.title, &config.login_path(), &enabled);
        }
    };

    let kind: ProviderKind = match provider.parse() {
        Ok(kind) => kind,
        Err(err) => return reject(&err, headers),
    };

    let return_to = params
        .return_to
        .or_else(|| read_cookie(headers, &state.return_cookie()).map(|v| decode_value(&v)))
        .and_then(|path| sanitize_return_to(&path))
        .unwrap_or_else(|| "/".to_string());

    let flow = state.flows.begin(kind, return_to);
    let url = match state.providers.authorization_url(
        &provider,
        &state.providers.callback_url(kind),
        &flow.state,
    ) {
        Ok(url) => url,
        Err(err) => {
            state.flows.take(&flow.state);
            warn!(
                request_id = request_id(headers),
                provider = %provider,
                "login rejected: {}", err
            );
            return reject(&err, headers);
        }
    };

    metrics::counter!("oauth_proxy_login_redirects_total", "provider" => kind.as_str())
        .increment(1);
    found(
        &url,
        vec![
            state
                .cookies
                .set(&state.csrf_cookie(), &flow.state, LOGIN_COOKIE_MAX_AGE),
            state.cookies.clear(&state.return_cookie()),
        ],
    )
}

/// `GET {root}/{provider}/callback`
pub async fn callback(
    State(state): State<Arc<AppState>>,
    Path(provider): Path<String>,
    headers: HeaderMap,
    Query(params): Query<CallbackParams>,
) -> Response {
    finish_login(&state, Some(provider), &headers, params).await
}

/// Redeem an authorization response. Without a provider in the path the
/// provider recorded in the pending flow is used.
async fn finish_login(
    state: &AppState,
    provider: Option<String>,
    headers: &HeaderMap,
    params: CallbackParams,
) -> Response {
    let clear_csrf = state.cookies.clear(&state.csrf_cookie());

    // The flow is consumed up front so a state value can never be replayed.
    let flow = params
        .state
        .as_deref()
        .and_then(|csrf_state| state.flows.take(csrf_state));
    let provider = provider.or_else(|| flow.as_ref().map(|flow| flow.provider.to_string()));

    let result = match provider.as_deref() {
        Some(provider) => complete_login(state, provider, headers, &params, flow.as_ref()).await,
        None => Err(GatewayError::CsrfMismatch),
    };
    let provider = provider.as_deref().unwrap_or("unknown");

    match result {
        Ok(session) => {
            let return_to = flow
                .as_ref()
                .and_then(|flow| sanitize_return_to(&flow.return_to))
                .unwrap_or_else(|| "/".to_string());

            info!(
                request_id = request_id(headers),
                provider = %session.identity.provider(),
                user = session.identity.username(),
                "[OK] login completed"
            );
            metrics::counter!("oauth_proxy_logins_total", "outcome" => "success").increment(1);

            found(
                &return_to,
                vec![
                    state.cookies.set(
                        &state.config.session.cookie_name,
                        &session.token,
                        session.remaining_secs(),
                    ),
                    clear_csrf,
                ],
            )
        }
        Err(err) => {
            warn!(
                request_id = request_id(headers),
                provider = %provider,
                "login failed: {}", err
            );
            metrics::counter!("oauth_proxy_logins_total", "outcome" => "failure").increment(1);

            let mut response = reject(&err, headers);
            if let Some(cookie) = clear_csrf {
                response.headers_mut().append(header::SET_COOKIE, cookie);
            }
            response
        }
    }
}

async fn complete_login(
    state: &AppState,
    provider: &str,
    headers: &HeaderMap,
    params: &CallbackParams,
    flow: Option<&PendingFlow>,
) -> Result<Session, GatewayError> {
    if let Some(error) = &params.error {
        warn!(
            "provider returned error: {} ({})",
            error,
            params.error_description.as_deref().unwrap_or("no description")
        );
        return Err(GatewayError::CsrfMismatch);
    }

    let csrf_state = params.state.as_deref().ok_or(GatewayError::CsrfMismatch)?;
    let cookie_state = read_cookie(headers, &state.csrf_cookie()).unwrap_or_default();
    if !bool::from(cookie_state.as_bytes().ct_eq(csrf_state.as_bytes())) {
        return Err(GatewayError::CsrfMismatch);
    }

    let code = params
        .code
        .as_deref()
        .ok_or_else(|| GatewayError::ProviderError("callback without code".to_string()))?;

    let identity = state
        .providers
        .exchange_code(provider, code, csrf_state, flow)
        .await?;

    Ok(state
        .sessions
        .create(identity, state.config.session.ttl))
}

/// `GET|POST {root}/logout`
pub async fn logout(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    if let Some(token) = read_cookie(&headers, &state.config.session.cookie_name) {
        state.sessions.revoke(&token);
    }
    found(
        &state.config.login_path(),
        vec![state.cookies.clear(&state.config.session.cookie_name)],
    )
}

/// Entry point for everything outside the gateway's own routes.
pub async fn gate(State(state): State<Arc<AppState>>, request: Request) -> Response {
    let session = match state.authorize(request.headers()) {
        Ok(session) => session,
        Err(GatewayError::SessionExpired) => {
            let return_to = request
                .uri()
                .path_and_query()
                .map(|pq| pq.as_str())
                .and_then(sanitize_return_to)
                .map(|path| encode_value(&path));

            metrics::counter!("oauth_proxy_gate_decisions_total", "decision" => "login").increment(1);
            let cookie = return_to.and_then(|path| {
                state
                    .cookies
                    .set(&state.return_cookie(), &path, LOGIN_COOKIE_MAX_AGE)
            });
            return found(&state.config.login_path(), vec![cookie]);
        }
        Err(err) => {
            warn!(
                request_id = request_id(request.headers()),
                path = %request.uri().path(),
                "request rejected: {}", err
            );
            metrics::counter!("oauth_proxy_gate_decisions_total", "decision" => "reject").increment(1);
            return reject(&err, request.headers());
        }
    };

    let request_id = request_id(request.headers()).map(str::to_string);
    let request = prepare_upstream(&state, request, session.identity.username());

    metrics::counter!("oauth_proxy_gate_decisions_total", "decision" => "forward").increment(1);
    match state.forwarder.forward(request).await {
        Ok(response) => response.into_response(),
        Err(err) => {
            warn!(request_id = request_id.as_deref(), "forward failed: {}", err);
            pages::error_page(err.status_code(), err.public_message(), request_id.as_deref())
        }
    }
}

/// Replace any client-supplied identity header and drop gateway cookies.
fn prepare_upstream(state: &AppState, request: Request, username: &str) -> Request<Body> {
    let (mut parts, body) = request.into_parts();

    parts.headers.remove(&state.user_header);
    strip_cookie(&mut parts.headers, &state.config.session.cookie_name);
    strip_cookie(&mut parts.headers, &state.csrf_cookie());
    strip_cookie(&mut parts.headers, &state.return_cookie());

    match HeaderValue::from_str(username) {
        Ok(value) => {
            parts.headers.insert(state.user_header.clone(), value);
        }
        Err(_) => warn!("username is not a valid header value: {:?}", username),
    }

    Request::from_parts(parts, body)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_return_to() {
        assert_eq!(sanitize_return_to("/dashboard?tab=1").as_deref(), Some("/dashboard?tab=1"));
        assert!(sanitize_return_to("https://evil.example").is_none());
        assert!(sanitize_return_to("//evil.example/path").is_none());
        assert!(sanitize_return_to("/\\evil.example").is_none());
        assert!(sanitize_return_to("/a\r\nSet-Cookie: x").is_none());
        assert!(sanitize_return_to("relative").is_none());
    }

    #[test]
    fn test_login_form_distinguishes_authorization_response() {
        let selection = LoginForm {
            provider: Some("gitlab".into()),
            ..LoginForm::default()
        };
        assert!(!selection.is_authorization_response());

        let query = LoginForm {
            code: Some("query-code".into()),
            state: Some("query-state".into()),
            ..LoginForm::default()
        };
        let form = LoginForm {
            code: Some("form-code".into()),
            ..LoginForm::default()
        }
        .merge(query);
        assert!(form.is_authorization_response());
        assert_eq!(form.code.as_deref(), Some("form-code"));
        assert_eq!(form.state.as_deref(), Some("query-state"));
    }
}
