//! Request authentication.
//!
//! Two schemes are in use: session bearer tokens resolved to an [`Actor`] by a
//! [`SessionResolver`], and a shared secret guarding the external evaluation
//! trigger.

use std::collections::HashMap;

use axum::http::HeaderMap;
use axum::http::header::AUTHORIZATION;
use serde::Serialize;
use subtle::ConstantTimeEq;

/// An authenticated user acting on alert events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Actor {
    pub username: String,
}

impl Actor {
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
        }
    }
}

/// Resolves a session token to the user it belongs to.
pub trait SessionResolver: Send + Sync + 'static {
    fn resolve(&self, token: &str) -> Option<Actor>;
}

/// Fixed token to username table loaded from configuration.
#[derive(Debug, Clone, Default)]
pub struct StaticSessions {
    tokens: HashMap<String, String>,
}

impl StaticSessions {
    pub fn new(tokens: HashMap<String, String>) -> Self {
        let tokens = tokens
            .into_iter()
            .filter(|(token, user)| !token.trim().is_empty() && !user.trim().is_empty())
            .collect();
        Self { tokens }
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

impl SessionResolver for StaticSessions {
    fn resolve(&self, token: &str) -> Option<Actor> {
        self.tokens.get(token).map(Actor::new)
    }
}

/// Extract the token of an `Authorization: Bearer <token>` header.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    let token = token.trim();
    (scheme.eq_ignore_ascii_case("bearer") && !token.is_empty()).then_some(token)
}

/// Check a presented trigger secret.
///
/// Access is denied when no secret is configured.
pub fn secret_matches(expected: Option<&str>, presented: Option<&str>) -> bool {
    match (expected, presented) {
        (Some(expected), Some(presented)) if !expected.is_empty() => {
            expected.as_bytes().ct_eq(presented.as_bytes()).into()
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_str(value).unwrap());
        headers
    }

    #[test]
    fn test_bearer_token() {
        assert_eq!(bearer_token(&headers("Bearer abc")), Some("abc"));
        assert_eq!(bearer_token(&headers("bearer  abc ")), Some("abc"));
        assert_eq!(bearer_token(&headers("Basic abc")), None);
        assert_eq!(bearer_token(&headers("Bearer ")), None);
        assert_eq!(bearer_token(&HeaderMap::new()), None);
    }

    #[test]
    fn test_static_sessions() {
        let sessions = StaticSessions::new(HashMap::from([
            ("tok-alice".to_string(), "alice".to_string()),
            ("".to_string(), "ghost".to_string()),
        ]));
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions.resolve("tok-alice"), Some(Actor::new("alice")));
        assert_eq!(sessions.resolve("tok-bob"), None);
        assert_eq!(sessions.resolve(""), None);
    }

    #[test]
    fn test_secret_matches() {
        assert!(secret_matches(Some("s3cret"), Some("s3cret")));
        assert!(!secret_matches(Some("s3cret"), Some("s3cre")));
        assert!(!secret_matches(Some("s3cret"), Some("s3creT")));
        assert!(!secret_matches(Some("s3cret"), Some("s3cret ")));
        assert!(!secret_matches(Some("s3cret"), None));
        // Unset or empty secret denies everything
        assert!(!secret_matches(None, Some("anything")));
        assert!(!secret_matches(Some(""), Some("")));
    }
}
