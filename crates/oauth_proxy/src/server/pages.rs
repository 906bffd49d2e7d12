//! Minimal login and error pages.

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{Html, IntoResponse, Response};

use crate::auth::ProviderKind;

const STYLE: &str = r#"
        body {
            font-family: -apple-system, BlinkMacSystemFont, 'Segoe UI', Roboto, Oxygen, Ubuntu, Cantarell, sans-serif;
            display: flex;
            justify-content: center;
            align-items: center;
            min-height: 100vh;
            margin: 0;
            background: linear-gradient(135deg, #667eea 0%, #764ba2 100%);
        }
        .container {
            background: white;
            padding: 3rem;
            border-radius: 1rem;
            box-shadow: 0 20px 60px rgba(0,0,0,0.3);
            max-width: 500px;
            text-align: center;
        }
        h1 {
            margin-bottom: 1.5rem;
        }
        .provider {
            display: block;
            width: 100%;
            margin: 0.75rem 0;
            padding: 0.75rem;
            border: none;
            border-radius: 0.5rem;
            background: #2d3748;
            color: white;
            font-size: 1rem;
            cursor: pointer;
        }
        .error-message {
            background: #fff5f5;
            border: 1px solid #feb2b2;
            color: #c53030;
            padding: 1rem;
            border-radius: 0.5rem;
            margin-top: 1rem;
        }
        .request-id {
            margin-top: 2rem;
            color: #666;
            font-size: 0.8rem;
        }
"#;

/// Escape text for inclusion in HTML content or attribute values.
pub fn escape_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#x27;"),
            _ => out.push(c),
        }
    }
    out
}

fn page(title: &str, body: &str) -> String {
    format!(
        r#"<!DOCTYPE html>
<html>
<head>
    <meta charset="UTF-8">
    <meta name="viewport" content="width=device-width, initial-scale=1.0">
    <title>{title}</title>
    <style>{STYLE}</style>
</head>
<body>
    <div class="container">
{body}
    </div>
</body>
</html>
"#,
        title = escape_html(title),
    )
}

fn no_store(status: StatusCode, html: String) -> Response {
    let mut response = (status, Html(html)).into_response();
    response
        .headers_mut()
        .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    response
}

/// Provider selection page. Each button posts to the login endpoint.
pub fn login_page(title: &str, login_path: &str, providers: &[ProviderKind]) -> Response {
    let buttons: String = providers
        .iter()
        .map(|provider| {
            format!(
                r#"        <form method="post" action="{action}">
            <input type="hidden" name="provider" value="{value}">
            <button class="provider" type="submit">Sign in with {name}</button>
        </form>
"#,
                action = escape_html(login_path),
                value = provider.as_str(),
                name = provider.display_name(),
            )
        })
        .collect();

    let body = format!(
        "        <h1>{title}</h1>\n{buttons}",
        title = escape_html(title)
    );
    no_store(StatusCode::OK, page(title, &body))
}

/// Error page with a generic message and the request correlation id.
pub fn error_page(status: StatusCode, message: &str, request_id: Option<&str>) -> Response {
    let heading = status.canonical_reason().unwrap_or("Error");
    let request_id = request_id
        .map(|id| {
            format!(
                r#"        <p class="request-id">Request ID: {}</p>
"#,
                escape_html(id)
            )
        })
        .unwrap_or_default();

    let body = format!(
        r#"        <h1>{heading}</h1>
        <div class="error-message">{message}</div>
{request_id}"#,
        heading = escape_html(heading),
        message = escape_html(message),
    );
    no_store(status, page(heading, &body))
}
