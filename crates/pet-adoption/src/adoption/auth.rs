use std::collections::BTreeMap;

use async_trait::async_trait;
use axum::http::{header, HeaderMap};

use super::domain::OrganizationId;

/// Resolves bearer tokens to the organization they were issued to.
///
/// Credential issuance lives outside this service; this is the seam it plugs into.
#[async_trait]
pub trait OrganizationAuthenticator: Send + Sync {
    async fn authenticate(&self, token: &str) -> Option<OrganizationId>;
}

/// Fixed token table loaded from configuration.
#[derive(Debug, Clone, Default)]
pub struct StaticTokenAuthenticator {
    tokens: BTreeMap<String, OrganizationId>,
}

impl StaticTokenAuthenticator {
    pub fn new(tokens: BTreeMap<String, OrganizationId>) -> Self {
        Self { tokens }
    }

    pub fn with_token(mut self, token: impl Into<String>, organization: OrganizationId) -> Self {
        self.tokens.insert(token.into(), organization);
        self
    }
}

#[async_trait]
impl OrganizationAuthenticator for StaticTokenAuthenticator {
    async fn authenticate(&self, token: &str) -> Option<OrganizationId> {
        self.tokens.get(token).copied()
    }
}

/// Why a request was rejected before reaching an administrative handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("missing bearer token")]
    MissingToken,
    #[error("malformed authorization header")]
    Malformed,
    #[error("invalid bearer token")]
    InvalidToken,
}

pub(crate) fn bearer_token(headers: &HeaderMap) -> Result<&str, AuthError> {
    let value = headers
        .get(header::AUTHORIZATION)
        .ok_or(AuthError::MissingToken)?
        .to_str()
        .map_err(|_| AuthError::Malformed)?;
    match value.split_once(' ') {
        Some(("Bearer", token)) if !token.trim().is_empty() => Ok(token.trim()),
        _ => Err(AuthError::Malformed),
    }
}

pub(crate) async fn authenticate(
    authenticator: &dyn OrganizationAuthenticator,
    headers: &HeaderMap,
) -> Result<OrganizationId, AuthError> {
    let token = bearer_token(headers)?;
    authenticator
        .authenticate(token)
        .await
        .ok_or(AuthError::InvalidToken)
}
