//! Admission control: per-identity message quota, checked before any upstream
//! call is made.
//!
//! The count is read fresh on every check and is not reserved, so concurrent
//! requests from one identity can each pass at `limit - 1` and overshoot the
//! limit by a few messages. The quota is soft.

use crate::auth::{AuthState, Identity, IdentityClaim};
use crate::store::{ChatStore, StoreError};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentityKind {
    Authenticated,
    Anonymous,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct QuotaPolicy {
    #[serde(default = "default_authenticated_limit")]
    pub authenticated_limit: u64,
    #[serde(default = "default_anonymous_limit")]
    pub anonymous_limit: u64,
}

impl Default for QuotaPolicy {
    fn default() -> Self {
        Self {
            authenticated_limit: default_authenticated_limit(),
            anonymous_limit: default_anonymous_limit(),
        }
    }
}

impl QuotaPolicy {
    pub fn limit_for(&self, kind: IdentityKind) -> u64 {
        match kind {
            IdentityKind::Authenticated => self.authenticated_limit,
            IdentityKind::Anonymous => self.anonymous_limit,
        }
    }
}

fn default_authenticated_limit() -> u64 {
    200
}

fn default_anonymous_limit() -> u64 {
    100
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QuotaUsage {
    pub kind: IdentityKind,
    pub used: u64,
    pub limit: u64,
    pub remaining: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuotaDecision {
    Allowed(QuotaUsage),
    Denied(DenyReason),
}

impl QuotaDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DenyReason {
    NoIdentity,
    LimitReached(QuotaUsage),
}

#[derive(Clone)]
pub struct QuotaEnforcer {
    store: Arc<dyn ChatStore>,
    auth: AuthState,
    policy: QuotaPolicy,
}

impl QuotaEnforcer {
    pub fn new(store: Arc<dyn ChatStore>, auth: AuthState, policy: QuotaPolicy) -> Self {
        Self {
            store,
            auth,
            policy,
        }
    }

    /// Current usage for a resolved identity.
    pub async fn usage(&self, identity: &Identity) -> Result<QuotaUsage, StoreError> {
        let kind = match identity {
            Identity::User { .. } => IdentityKind::Authenticated,
            Identity::Anonymous { .. } => IdentityKind::Anonymous,
        };
        let used = self.store.count_messages(&identity.owner_filter()).await?;
        let limit = self.policy.limit_for(kind);
        Ok(QuotaUsage {
            kind,
            used,
            limit,
            remaining: limit.saturating_sub(used),
        })
    }

    pub async fn check(&self, claim: &IdentityClaim) -> Result<QuotaDecision, StoreError> {
        let Some(identity) = self.auth.resolve_identity(claim).await else {
            return Ok(QuotaDecision::Denied(DenyReason::NoIdentity));
        };
        let usage = self.usage(&identity).await?;
        if usage.used >= usage.limit {
            tracing::info!(
                kind = ?usage.kind,
                used = usage.used,
                limit = usage.limit,
                "quota exhausted"
            );
            return Ok(QuotaDecision::Denied(DenyReason::LimitReached(usage)));
        }
        Ok(QuotaDecision::Allowed(usage))
    }
}
