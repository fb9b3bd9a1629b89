//! Bearer token authentication.
//!
//! The identity provider is external; the server only needs a verified
//! `(user, family)` per request. Tokens come from the `[[auth.tokens]]`
//! config section.

use crate::config::AuthConfig;
use crate::error::ApiError;
use axum::extract::{Request, State};
use axum::http::header;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use std::collections::HashMap;
use std::sync::Arc;
use sync_types::{FamilyId, UserId};

/// Authenticated identity, added to request extensions after auth.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthUser {
    /// Verified user.
    pub user_id: UserId,
    /// Family the user belongs to.
    pub family_id: FamilyId,
}

/// Token store: maps token to identity.
#[derive(Debug, Clone, Default)]
pub struct TokenStore {
    tokens: HashMap<String, AuthUser>,
}

impl TokenStore {
    /// Build the store from configuration.
    pub fn from_config(config: &AuthConfig) -> Self {
        let tokens = config
            .tokens
            .iter()
            .map(|entry| {
                (
                    entry.token.clone(),
                    AuthUser {
                        user_id: entry.user_id.clone(),
                        family_id: entry.family_id.clone(),
                    },
                )
            })
            .collect();
        Self { tokens }
    }

    /// Validate a token and return the associated identity.
    pub fn validate(&self, token: &str) -> Option<AuthUser> {
        self.tokens.get(token).cloned()
    }

    /// Number of configured tokens.
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    /// Whether no tokens are configured.
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

/// Authentication middleware.
pub async fn auth_middleware(
    State(tokens): State<Arc<TokenStore>>,
    mut request: Request,
    next: Next,
) -> Response {
    let auth_header = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok());

    let token = match auth_header {
        Some(h) => match h.strip_prefix("Bearer ") {
            Some(token) => token.trim(),
            None => {
                return ApiError::Unauthorized("authorization header must use Bearer scheme")
                    .into_response()
            }
        },
        None => return ApiError::Unauthorized("authorization header required").into_response(),
    };

    match tokens.validate(token) {
        Some(user) => {
            request.extensions_mut().insert(user);
            next.run(request).await
        }
        None => {
            tracing::debug!("Rejected request with unknown token");
            ApiError::Unauthorized("invalid token").into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TokenEntry;

    #[test]
    fn validates_configured_tokens() {
        let store = TokenStore::from_config(&AuthConfig {
            tokens: vec![TokenEntry {
                token: "secret-a".into(),
                user_id: UserId::new("alice"),
                family_id: FamilyId::new("smith"),
            }],
        });

        assert_eq!(store.len(), 1);
        assert_eq!(
            store.validate("secret-a"),
            Some(AuthUser {
                user_id: UserId::new("alice"),
                family_id: FamilyId::new("smith"),
            })
        );
        assert_eq!(store.validate("secret-b"), None);
    }
}
