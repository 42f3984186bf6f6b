//! Redirects that work for both full page loads and partial (htmx) requests.
//!
//! Partial requests announce themselves with `HX-Request`. They get a `200`
//! carrying `HX-Location` so the client navigates itself; everything else gets
//! a `303 See Other`.

use axum::{
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};

pub const HX_REQUEST: HeaderName = HeaderName::from_static("hx-request");
pub const HX_LOCATION: HeaderName = HeaderName::from_static("hx-location");

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Navigation {
    Full,
    Partial,
}

impl Navigation {
    #[must_use]
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let partial = headers
            .get(HX_REQUEST)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|value| !value.eq_ignore_ascii_case("false"));
        if partial { Self::Partial } else { Self::Full }
    }
}

/// Redirect to `location`, optionally setting cookies on the way.
#[must_use]
pub fn redirect(navigation: Navigation, location: &str, cookies: &[HeaderValue]) -> Response {
    let location = safe_landing_path(Some(location));
    // A sanitized path is always a valid header value; fall back to `/` anyway.
    let value = HeaderValue::from_str(&location).unwrap_or(HeaderValue::from_static("/"));
    navigate(navigation, value, cookies)
}

/// Redirect to an absolute external URL (identity provider endpoints).
#[must_use]
pub fn redirect_external(navigation: Navigation, url: &str, cookies: &[HeaderValue]) -> Response {
    match HeaderValue::from_str(url) {
        Ok(value) => navigate(navigation, value, cookies),
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

fn navigate(navigation: Navigation, location: HeaderValue, cookies: &[HeaderValue]) -> Response {
    let mut headers = HeaderMap::new();
    for cookie in cookies {
        headers.append(header::SET_COOKIE, cookie.clone());
    }
    match navigation {
        Navigation::Partial => {
            headers.insert(HX_LOCATION, location);
            (StatusCode::OK, headers).into_response()
        }
        Navigation::Full => {
            headers.insert(header::LOCATION, location);
            (StatusCode::SEE_OTHER, headers).into_response()
        }
    }
}

/// Keep only same-site absolute paths; anything else lands on `/`.
#[must_use]
pub fn safe_landing_path(path: Option<&str>) -> String {
    match path.map(str::trim) {
        Some(path)
            if path.starts_with('/')
                && !path.starts_with("//")
                && !path.contains('\\')
                && !path.chars().any(char::is_control) =>
        {
            path.to_string()
        }
        _ => "/".to_string(),
    }
}
