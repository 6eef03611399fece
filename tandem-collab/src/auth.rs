//! Authentication collaborator consulted during the WebSocket upgrade.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

/// Authenticated user identity. Several connections may share one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserId(String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("missing credentials")]
    MissingCredentials,
    #[error("invalid token")]
    InvalidToken,
}

pub trait Authenticator: Send + Sync {
    /// Resolve a bearer token (if the client sent one) to a user.
    fn authenticate(&self, token: Option<&str>) -> Result<UserId, AuthError>;
}

/// Fixed token → user table.
#[derive(Debug, Clone, Default)]
pub struct StaticTokens {
    tokens: HashMap<String, UserId>,
}

impl StaticTokens {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(mut self, token: impl Into<String>, user: impl Into<String>) -> Self {
        self.tokens.insert(token.into(), UserId::new(user));
        self
    }

    /// Parse `token=user` pairs separated by commas. Malformed pairs are
    /// skipped with a warning.
    pub fn parse(spec: &str) -> Self {
        let mut tokens = HashMap::new();
        for pair in spec.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            match pair.split_once('=') {
                Some((token, user)) if !token.is_empty() && !user.is_empty() => {
                    tokens.insert(token.trim().to_string(), UserId::new(user.trim()));
                }
                _ => log::warn!("ignoring malformed token entry {pair:?}"),
            }
        }
        Self { tokens }
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

impl Authenticator for StaticTokens {
    fn authenticate(&self, token: Option<&str>) -> Result<UserId, AuthError> {
        let token = token.ok_or(AuthError::MissingCredentials)?;
        self.tokens.get(token).cloned().ok_or(AuthError::InvalidToken)
    }
}

/// Accepts everyone. The token, if any, becomes the user id.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAnonymous;

impl Authenticator for AllowAnonymous {
    fn authenticate(&self, token: Option<&str>) -> Result<UserId, AuthError> {
        Ok(UserId::new(token.filter(|t| !t.is_empty()).unwrap_or("anonymous")))
    }
}
