use axum::http::HeaderMap;
use serde::Deserialize;

/// `?secret=` on trigger URLs.
#[derive(Debug, Default, Deserialize)]
pub struct SecretQuery {
    pub secret: Option<String>,
}

/// Credential from the query string, else from `Authorization: Bearer`.
pub fn presented_secret(query: &SecretQuery, headers: &HeaderMap) -> Option<String> {
    if let Some(secret) = query.secret.as_deref().filter(|s| !s.is_empty()) {
        return Some(secret.to_string());
    }

    let header = headers.get(axum::http::header::AUTHORIZATION)?.to_str().ok()?;
    let token = header.strip_prefix("Bearer ")?.trim();
    (!token.is_empty()).then(|| token.to_string())
}
