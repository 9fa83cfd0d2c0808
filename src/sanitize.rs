//! Response header rewriting.
//!
//! Upstreams that believe they are reached directly over TLS emit absolute
//! redirects to themselves and `Secure` cookies. Both break a client that
//! talks to the proxy instead, so every upstream response passes through
//! [`sanitize_response_headers`] before it is returned.

use hyper::header::{HeaderMap, HeaderValue, LOCATION, SET_COOKIE};

/// Apply all rewrites for a response from `origin`.
pub fn sanitize_response_headers(headers: &mut HeaderMap, origin: &str) {
    rewrite_location(headers, origin);
    strip_secure_cookies(headers);
}

/// Remove the first occurrence of `origin` from the `Location` header.
///
/// A redirect to the origin itself becomes `/`. Values that are not valid
/// UTF-8 or do not mention the origin are left alone.
pub fn rewrite_location(headers: &mut HeaderMap, origin: &str) {
    if origin.is_empty() {
        return;
    }

    let Some(location) = headers.get(LOCATION).and_then(|v| v.to_str().ok()) else {
        return;
    };
    if !location.contains(origin) {
        return;
    }

    let mut rewritten = location.replacen(origin, "", 1);
    if rewritten.is_empty() {
        rewritten.push('/');
    }

    // Removing a substring of a valid header value leaves a valid header value
    if let Ok(value) = HeaderValue::from_str(&rewritten) {
        headers.insert(LOCATION, value);
    }
}

/// Clear the `Secure` attribute on every `Set-Cookie` header.
///
/// All cookies are reissued in their original order. Headers are not
/// touched when the response sets no cookie.
pub fn strip_secure_cookies(headers: &mut HeaderMap) {
    if !headers.contains_key(SET_COOKIE) {
        return;
    }

    let cookies: Vec<HeaderValue> = headers
        .get_all(SET_COOKIE)
        .iter()
        .map(|value| clear_secure(value).unwrap_or_else(|| value.clone()))
        .collect();

    headers.remove(SET_COOKIE);
    for cookie in cookies {
        headers.append(SET_COOKIE, cookie);
    }
}

/// Returns the cookie without its `Secure` attribute, or `None` when the
/// value should pass through as is (no `Secure`, or not a parseable cookie).
fn clear_secure(value: &HeaderValue) -> Option<HeaderValue> {
    let cookie = value.to_str().ok()?;

    let mut segments = cookie.split(';');
    let pair = segments.next()?;
    match pair.split_once('=') {
        Some((name, _)) if !name.trim().is_empty() => {}
        _ => return None,
    }

    let attributes: Vec<&str> = segments.collect();
    let kept: Vec<&str> = attributes
        .iter()
        .copied()
        .filter(|attr| !is_secure_attribute(attr))
        .collect();
    if kept.len() == attributes.len() {
        return None;
    }

    let mut rewritten = pair.to_string();
    for attr in kept {
        rewritten.push(';');
        rewritten.push_str(attr);
    }

    HeaderValue::from_str(&rewritten).ok()
}

fn is_secure_attribute(attr: &str) -> bool {
    let name = attr.split_once('=').map_or(attr, |(name, _)| name);
    name.trim().eq_ignore_ascii_case("secure")
}
