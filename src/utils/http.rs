//! Small helpers shared by every outbound HTTP caller (provider, sub-server,
//! streamable MCP servers).

/// Joins a base URL and an endpoint path without doubling or dropping slashes.
///
/// ```
/// use conduit::utils::http::join_url;
///
/// assert_eq!(join_url("https://api.example.com/v1/", "/chat/completions"),
///            "https://api.example.com/v1/chat/completions");
/// ```
pub fn join_url(base_url: &str, endpoint: &str) -> String {
    let base = base_url.trim_end_matches('/');
    let endpoint = endpoint.trim_start_matches('/');
    if endpoint.is_empty() {
        return base.to_string();
    }
    format!("{base}/{endpoint}")
}

/// Attaches `Authorization: Bearer <token>` unless the token is blank.
pub fn with_bearer(request: reqwest::RequestBuilder, token: Option<&str>) -> reqwest::RequestBuilder {
    match token.map(str::trim) {
        Some(token) if !token.is_empty() => {
            request.header(reqwest::header::AUTHORIZATION, format!("Bearer {token}"))
        }
        _ => request,
    }
}

/// Collapses whitespace and caps a response body so it can be embedded in an
/// error message.
pub fn body_excerpt(body: &str, limit: usize) -> String {
    let collapsed = body.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.chars().count() <= limit {
        return collapsed;
    }
    let mut excerpt: String = collapsed.chars().take(limit).collect();
    excerpt.push('…');
    excerpt
}
