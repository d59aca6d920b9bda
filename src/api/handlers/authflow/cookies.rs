//! Cookie plumbing between HTTP headers and the flow service.

use axum::http::{
    HeaderMap, HeaderValue,
    header::{COOKIE, SET_COOKIE},
};
use tracing::warn;

use crate::authflow::Cookie;

/// Value of cookie `name` from the request, if present and non-empty.
pub fn read_cookie(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|header| header.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| {
            let (key, value) = pair.trim().split_once('=')?;
            (key.trim() == name).then(|| value.trim().to_string())
        })
        .find(|value| !value.is_empty())
}

/// Append a `Set-Cookie` header per cookie.
pub fn set_cookies(headers: &mut HeaderMap, cookies: &[Cookie]) {
    for cookie in cookies {
        match HeaderValue::from_str(&cookie.to_header_value()) {
            Ok(value) => {
                headers.append(SET_COOKIE, value);
            }
            Err(err) => warn!(cookie = %cookie.name, "invalid cookie value: {err}"),
        }
    }
}
