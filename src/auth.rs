use crate::error::GatewayError;
use async_trait::async_trait;
use axum::http::HeaderMap;
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub const SESSION_HEADER: &str = "x-session-id";
pub const TOKEN_HEADER: &str = "x-token";

/// Resolves an identity token to a stable user id.
#[async_trait]
pub trait IdentityVerifier: Send + Sync {
    async fn verify_token(&self, token: &str) -> Option<String>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityClaims {
    pub sub: String,
    pub exp: usize,
}

/// HS256 identity tokens. Without a secret nothing verifies.
#[derive(Clone)]
pub struct JwtIdentityVerifier {
    key: Option<DecodingKey>,
}

impl JwtIdentityVerifier {
    pub fn new(secret: Option<&str>) -> Self {
        Self {
            key: secret
                .filter(|s| !s.is_empty())
                .map(|s| DecodingKey::from_secret(s.as_bytes())),
        }
    }
}

#[async_trait]
impl IdentityVerifier for JwtIdentityVerifier {
    async fn verify_token(&self, token: &str) -> Option<String> {
        let key = self.key.as_ref()?;
        match jsonwebtoken::decode::<IdentityClaims>(token, key, &Validation::new(Algorithm::HS256)) {
            Ok(data) if !data.claims.sub.trim().is_empty() => Some(data.claims.sub),
            Ok(_) => None,
            Err(err) => {
                tracing::debug!("identity token rejected: {err}");
                None
            }
        }
    }
}

/// What the caller claims to be, before verification.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdentityClaim {
    pub session_id: Option<String>,
    pub token: Option<String>,
}

impl IdentityClaim {
    pub fn from_headers(headers: &HeaderMap) -> Self {
        Self {
            session_id: header_value(headers, SESSION_HEADER),
            token: header_value(headers, TOKEN_HEADER),
        }
    }
}

/// A claim after the token has been checked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Identity {
    User {
        user_id: String,
        session_id: Option<String>,
    },
    Anonymous {
        session_id: String,
    },
}

impl Identity {
    pub fn user_id(&self) -> Option<&str> {
        match self {
            Self::User { user_id, .. } => Some(user_id),
            Self::Anonymous { .. } => None,
        }
    }

    pub fn session_id(&self) -> Option<&str> {
        match self {
            Self::User { session_id, .. } => session_id.as_deref(),
            Self::Anonymous { session_id } => Some(session_id),
        }
    }

    pub fn owner_filter(&self) -> crate::store::OwnerFilter {
        crate::store::OwnerFilter {
            user_id: self.user_id().map(str::to_string),
            session_id: self.session_id().map(str::to_string),
        }
    }
}

#[derive(Clone)]
pub struct AuthState {
    verifier: Arc<dyn IdentityVerifier>,
}

impl AuthState {
    pub fn new(verifier: Arc<dyn IdentityVerifier>) -> Self {
        Self { verifier }
    }

    /// A token that fails verification is treated as absent; the session id
    /// then decides. `None` when neither yields an identity.
    pub async fn resolve_identity(&self, claim: &IdentityClaim) -> Option<Identity> {
        if let Some(token) = claim.token.as_deref() {
            if let Some(user_id) = self.verifier.verify_token(token).await {
                return Some(Identity::User {
                    user_id,
                    session_id: claim.session_id.clone(),
                });
            }
        }
        claim.session_id.clone().map(|session_id| Identity::Anonymous { session_id })
    }
}

/// The bearer credential is the caller's provider API key, passed through to
/// the upstream client untouched.
pub fn provider_credential(headers: &HeaderMap) -> Result<String, GatewayError> {
    let auth_header = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| GatewayError::Auth("Missing or invalid Authorization header".to_string()))?;
    let token = auth_header
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or_else(|| GatewayError::Auth("Missing or invalid Authorization header".to_string()))?;
    Ok(token.to_string())
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}
