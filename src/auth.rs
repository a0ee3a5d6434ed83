//! Authentication provider interface (spec §1: "pluggable; provide
//! `authenticate(credentials) -> principal`"). Grounded on
//! `mod_proxy.rs`'s `proxy_server_auth_rfc1929` callback, generalized from
//! a Lua callback to a Rust trait since config/Lua is out of scope here.

use async_trait::async_trait;
use bytes::Bytes;

/// The authenticated identity of a client (spec glossary: "Principal").
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Principal(pub String);

impl std::fmt::Display for Principal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone)]
pub struct AuthChallenge {
    pub auth_method_name: String,
    pub auth_data: Bytes,
}

pub enum AuthOutcome {
    /// Authentication is complete; the principal is established.
    Authenticated(Principal),
    /// Another challenge/response round is required.
    Challenge(AuthChallenge),
}

#[derive(Debug, thiserror::Error)]
#[error("authentication failed")]
pub struct AuthError;

/// A pluggable authentication provider (spec §1 out-of-scope collaborator).
/// Implementations decide how many `AuthResponse` round-trips a given auth
/// method needs; the connection state machine just keeps feeding responses
/// in until it gets `Authenticated` or an error (spec §4.3).
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(
        &self,
        auth_method_name: &str,
        auth_data: &[u8],
    ) -> Result<AuthOutcome, AuthError>;
}

/// Accepts every client without requiring any `AuthResponse` round-trip;
/// used when `require_authentication` is unset (spec §4.3: "or auth is
/// disabled").
pub struct NoAuthenticator;

#[async_trait]
impl Authenticator for NoAuthenticator {
    async fn authenticate(
        &self,
        _auth_method_name: &str,
        _auth_data: &[u8],
    ) -> Result<AuthOutcome, AuthError> {
        Ok(AuthOutcome::Authenticated(Principal("anonymous".to_string())))
    }
}

/// A simple static-credential authenticator used by tests and small
/// deployments: `auth_data` is matched verbatim against a fixed token.
pub struct StaticTokenAuthenticator {
    pub method_name: String,
    pub token: Bytes,
    pub principal: Principal,
}

#[async_trait]
impl Authenticator for StaticTokenAuthenticator {
    async fn authenticate(
        &self,
        auth_method_name: &str,
        auth_data: &[u8],
    ) -> Result<AuthOutcome, AuthError> {
        if auth_method_name != self.method_name || auth_data != self.token.as_ref() {
            return Err(AuthError);
        }
        Ok(AuthOutcome::Authenticated(self.principal.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn no_authenticator_always_succeeds() {
        let outcome = NoAuthenticator.authenticate("none", b"").await.unwrap();
        assert!(matches!(outcome, AuthOutcome::Authenticated(_)));
    }

    #[tokio::test]
    async fn static_token_rejects_wrong_token() {
        let auth = StaticTokenAuthenticator {
            method_name: "token".into(),
            token: Bytes::from_static(b"secret"),
            principal: Principal("svc".into()),
        };
        assert!(auth.authenticate("token", b"wrong").await.is_err());
        assert!(auth.authenticate("token", b"secret").await.is_ok());
    }
}
