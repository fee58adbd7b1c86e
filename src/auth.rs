//! Credential providers for the RT WebSocket handshake.
//!
//! The session asks its [`AuthProvider`] for a bearer token once per
//! connection attempt, so providers that mint short-lived tokens get a
//! fresh one on every retry. Token minting itself lives outside this
//! crate; [`StaticKeyAuth`] covers the plain API-key case.

use std::env;

use async_trait::async_trait;

use crate::errors::{VoiceError, VoiceResult};

/// Environment variable consulted when no explicit key is given.
pub const API_KEY_ENV: &str = "SPEECHMATICS_API_KEY";

/// Where the bearer credential is placed during the upgrade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthPlacement {
    /// `Authorization: Bearer <token>` request header.
    #[default]
    Header,
    /// `?jwt=<token>` query parameter, for environments where request
    /// headers cannot be set on the upgrade.
    QueryParam,
}

/// Supplies one bearer credential per connection.
#[async_trait]
pub trait AuthProvider: Send + Sync {
    /// Produce the token for the next connection attempt.
    async fn bearer_token(&self) -> VoiceResult<String>;

    /// How the token is attached to the handshake.
    fn placement(&self) -> AuthPlacement {
        AuthPlacement::Header
    }
}

/// Static API-key authentication.
///
/// The same key is used for every connection. Falls back to the
/// `SPEECHMATICS_API_KEY` environment variable when constructed without
/// an explicit key.
#[derive(Debug, Clone)]
pub struct StaticKeyAuth {
    api_key: String,
    placement: AuthPlacement,
}

impl StaticKeyAuth {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            placement: AuthPlacement::Header,
        }
    }

    /// Read the key from the environment.
    pub fn from_env() -> VoiceResult<Self> {
        match env::var(API_KEY_ENV) {
            Ok(key) if !key.is_empty() => Ok(Self::new(key)),
            _ => Err(VoiceError::Auth(format!(
                "API key required: provide one explicitly or set {API_KEY_ENV}"
            ))),
        }
    }

    /// Use explicit key if given, otherwise the environment.
    pub fn new_or_env(api_key: Option<String>) -> VoiceResult<Self> {
        match api_key {
            Some(key) if !key.is_empty() => Ok(Self::new(key)),
            _ => Self::from_env(),
        }
    }

    /// Switch to `?jwt=` query-parameter placement.
    pub fn with_query_placement(mut self) -> Self {
        self.placement = AuthPlacement::QueryParam;
        self
    }
}

#[async_trait]
impl AuthProvider for StaticKeyAuth {
    async fn bearer_token(&self) -> VoiceResult<String> {
        if self.api_key.is_empty() {
            return Err(VoiceError::Auth("empty API key".to_string()));
        }
        Ok(self.api_key.clone())
    }

    fn placement(&self) -> AuthPlacement {
        self.placement
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_key_returns_token() {
        let auth = StaticKeyAuth::new("test-key");
        assert_eq!(auth.bearer_token().await.unwrap(), "test-key");
        assert_eq!(auth.placement(), AuthPlacement::Header);
    }

    #[tokio::test]
    async fn query_placement_is_preserved() {
        let auth = StaticKeyAuth::new("k").with_query_placement();
        assert_eq!(auth.placement(), AuthPlacement::QueryParam);
    }

    #[tokio::test]
    async fn explicit_key_wins_over_env() {
        let auth = StaticKeyAuth::new_or_env(Some("explicit".to_string())).unwrap();
        assert_eq!(auth.bearer_token().await.unwrap(), "explicit");
    }

    #[tokio::test]
    async fn empty_key_is_an_auth_error() {
        let auth = StaticKeyAuth::new("");
        assert!(matches!(
            auth.bearer_token().await,
            Err(VoiceError::Auth(_))
        ));
    }
}
