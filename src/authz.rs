//! Authorization provider interface (spec §1: "`authorize(principal,
//! resource, action) -> bool`"). Consulted before a lookup is dispatched
//! (spec §4.4) and conservatively gates schema lookups the same way as
//! topic lookups (spec §9, resolved in SPEC_FULL.md §4.8).

use async_trait::async_trait;

use crate::auth::Principal;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Lookup,
    Produce,
    Consume,
}

#[async_trait]
pub trait Authorizer: Send + Sync {
    async fn authorize(&self, principal: &Principal, topic: &str, action: Action) -> bool;
}

/// Authorizes every request; used when `require_authorization` is unset.
pub struct AllowAllAuthorizer;

#[async_trait]
impl Authorizer for AllowAllAuthorizer {
    async fn authorize(&self, _principal: &Principal, _topic: &str, _action: Action) -> bool {
        true
    }
}

/// Denies every request; useful in tests that exercise the
/// `AuthorizationError` path (spec §4.4).
pub struct DenyAllAuthorizer;

#[async_trait]
impl Authorizer for DenyAllAuthorizer {
    async fn authorize(&self, _principal: &Principal, _topic: &str, _action: Action) -> bool {
        false
    }
}
