use axum::http::{header::AUTHORIZATION, HeaderMap};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("Missing Authorization header")]
    MissingHeader,
    #[error("Invalid Authorization header")]
    MalformedHeader,
    #[error("Authorization must use Bearer token")]
    NotBearer,
    #[error("Invalid API key")]
    InvalidKey,
}

/// Checks the MCP caller's bearer token against the configured key.
pub fn authorize(headers: &HeaderMap, expected_key: &str) -> Result<(), AuthError> {
    let raw = headers
        .get(AUTHORIZATION)
        .ok_or(AuthError::MissingHeader)?
        .to_str()
        .map_err(|_| AuthError::MalformedHeader)?;
    let token = raw.strip_prefix("Bearer ").ok_or(AuthError::NotBearer)?;

    if token.trim() != expected_key {
        return Err(AuthError::InvalidKey);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    fn headers_with(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(value).expect("valid header"),
        );
        headers
    }

    #[test]
    fn accepts_matching_bearer() {
        assert_eq!(authorize(&headers_with("Bearer key-1"), "key-1"), Ok(()));
    }

    #[test]
    fn rejects_missing_and_wrong_tokens() {
        assert_eq!(
            authorize(&HeaderMap::new(), "key-1"),
            Err(AuthError::MissingHeader)
        );
        assert_eq!(
            authorize(&headers_with("Basic abc"), "key-1"),
            Err(AuthError::NotBearer)
        );
        assert_eq!(
            authorize(&headers_with("Bearer nope"), "key-1"),
            Err(AuthError::InvalidKey)
        );
    }
}
