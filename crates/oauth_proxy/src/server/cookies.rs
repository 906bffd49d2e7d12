//! Cookie parsing and `Set-Cookie` formatting.

use axum::http::{header, HeaderMap, HeaderValue};

/// Attributes shared by every cookie the gateway sets.
#[derive(Debug, Clone, Copy)]
pub struct CookieOptions {
    pub secure: bool,
}

impl CookieOptions {
    /// `name=value` valid for `max_age` seconds.
    pub fn set(&self, name: &str, value: &str, max_age: i64) -> Option<HeaderValue> {
        let secure = if self.secure { "; Secure" } else { "" };
        HeaderValue::from_str(&format!(
            "{name}={value}; Max-Age={max_age}; Path=/; HttpOnly; SameSite=Lax{secure}"
        ))
        .ok()
    }

    /// Expire `name` immediately.
    pub fn clear(&self, name: &str) -> Option<HeaderValue> {
        let secure = if self.secure { "; Secure" } else { "" };
        HeaderValue::from_str(&format!(
            "{name}=deleted; Max-Age=0; Expires=Thu, 01 Jan 1970 00:00:00 GMT; Path=/; HttpOnly; SameSite=Lax{secure}"
        ))
        .ok()
    }
}

/// Read cookie `name` from all `Cookie` headers.
pub fn read_cookie(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value.trim_matches('"').to_string())
}

/// Remove cookie `name` from the request headers, keeping every other cookie.
pub fn strip_cookie(headers: &mut HeaderMap, name: &str) {
    let remaining: Vec<String> = headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .map(str::trim)
        .filter(|pair| !pair.is_empty())
        .filter(|pair| pair.split_once('=').map(|(key, _)| key) != Some(name))
        .map(str::to_string)
        .collect();

    headers.remove(header::COOKIE);
    if remaining.is_empty() {
        return;
    }
    if let Ok(value) = HeaderValue::from_str(&remaining.join("; ")) {
        headers.insert(header::COOKIE, value);
    }
}

/// Cookie values cannot carry `;`, `,` or spaces, so paths are form-encoded.
pub fn encode_value(value: &str) -> String {
    url::form_urlencoded::byte_serialize(value.as_bytes()).collect()
}

pub fn decode_value(value: &str) -> String {
    url::form_urlencoded::parse(format!("v={value}").as_bytes())
        .next()
        .map(|(_, decoded)| decoded.into_owned())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cookie_headers(cookies: &[&str]) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for cookie in cookies {
            headers.append(header::COOKIE, HeaderValue::from_str(cookie).unwrap());
        }
        headers
    }

    #[test]
    fn test_read_cookie() {
        let headers = cookie_headers(&["theme=dark; oauth2_proxy_session=abc", "other=1"]);
        assert_eq!(read_cookie(&headers, "oauth2_proxy_session").as_deref(), Some("abc"));
        assert_eq!(read_cookie(&headers, "other").as_deref(), Some("1"));
        assert!(read_cookie(&headers, "oauth2_proxy").is_none());
    }

    #[test]
    fn test_strip_cookie() {
        let mut headers = cookie_headers(&["theme=dark; oauth2_proxy_session=abc", "other=1"]);
        strip_cookie(&mut headers, "oauth2_proxy_session");
        assert_eq!(headers[header::COOKIE], "theme=dark; other=1");

        let mut headers = cookie_headers(&["oauth2_proxy_session=abc"]);
        strip_cookie(&mut headers, "oauth2_proxy_session");
        assert!(headers.get(header::COOKIE).is_none());
    }

    #[test]
    fn test_cookie_attributes() {
        let options = CookieOptions { secure: true };
        let cookie = options.set("oauth2_proxy_session", "tok", 3600).unwrap();
        let cookie = cookie.to_str().unwrap();
        assert!(cookie.starts_with("oauth2_proxy_session=tok;"));
        assert!(cookie.contains("HttpOnly"));
        assert!(cookie.contains("SameSite=Lax"));
        assert!(cookie.contains("Max-Age=3600"));
        assert!(cookie.ends_with("; Secure"));

        let plain = CookieOptions { secure: false }.clear("x").unwrap();
        assert!(plain.to_str().unwrap().contains("Max-Age=0"));
        assert!(!plain.to_str().unwrap().contains("Secure"));
    }

    #[test]
    fn test_value_encoding() {
        let encoded = encode_value("/reports?year=2024&q=a b;c");
        assert!(!encoded.contains(';'));
        assert!(!encoded.contains(' '));
        assert_eq!(decode_value(&encoded), "/reports?year=2024&q=a b;c");
    }
}
