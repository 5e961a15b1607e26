//! Cookie header helpers.
//!
//! Cookies are written as raw `Set-Cookie` strings: `HttpOnly`, `Secure`,
//! `SameSite=Strict`, scoped to `/`.

use axum::http::header::COOKIE;
use axum::http::HeaderMap;

/// Build a `Set-Cookie` value that lives for `max_age_secs`.
pub fn set_cookie(name: &str, value: &str, max_age_secs: i64) -> String {
    format!(
        "{name}={value}; Path=/; Max-Age={}; HttpOnly; Secure; SameSite=Strict",
        max_age_secs.max(0)
    )
}

/// Build a `Set-Cookie` value that expires `name` immediately.
pub fn clear_cookie(name: &str) -> String {
    format!("{name}=; Path=/; Max-Age=0; HttpOnly; Secure; SameSite=Strict")
}

/// Find `cookie_name` in the request's Cookie headers.
pub fn read_cookie(headers: &HeaderMap, cookie_name: &str) -> Option<String> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .find_map(|cookie| {
            let (name, value) = cookie.trim().split_once('=')?;
            (name == cookie_name && !value.is_empty()).then(|| value.to_string())
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_read_cookie_among_many() {
        let mut headers = HeaderMap::new();
        headers.insert(COOKIE, HeaderValue::from_static("a=1; session_id=abc=; b=2"));
        assert_eq!(read_cookie(&headers, "session_id").as_deref(), Some("abc="));
        assert_eq!(read_cookie(&headers, "b").as_deref(), Some("2"));
        assert!(read_cookie(&headers, "missing").is_none());
    }

    #[test]
    fn test_empty_cookie_is_absent() {
        let mut headers = HeaderMap::new();
        headers.insert(COOKIE, HeaderValue::from_static("session_id="));
        assert!(read_cookie(&headers, "session_id").is_none());
    }

    #[test]
    fn test_cookie_attributes() {
        let set = set_cookie("session_id", "v", 60);
        assert!(set.starts_with("session_id=v;"));
        assert!(set.contains("Max-Age=60"));
        assert!(set.contains("HttpOnly"));
        assert!(set.contains("SameSite=Strict"));
        assert!(clear_cookie("session_id").contains("Max-Age=0"));
    }
}
