//! Pluggable public-key authorization (spec §4.8, §9).
//!
//! Standalone mode accepts every key and assigns the single shared owner
//! bucket; node mode would delegate to the controller over the control
//! plane, but that decision belongs to whoever wires `SshHandler` together,
//! not to this trait — grounded on the teacher's `verification.rs`, which
//! kept the "is this key good" question behind a narrow async boundary.

use async_trait::async_trait;

use crate::registry::UNAUTHORIZED_OWNER;

#[derive(Debug, Clone)]
pub enum AuthDecision {
    Accept { owner: String },
    Reject,
}

#[async_trait]
pub trait Authorizer: Send + Sync {
    async fn authorize(&self, fingerprint: &str, username: &str) -> AuthDecision;
}

/// Accepts any public key and places every session under one shared owner
/// (spec §4.8: "standalone mode has no concept of per-tenant identity").
pub struct StandaloneAuthorizer;

#[async_trait]
impl Authorizer for StandaloneAuthorizer {
    async fn authorize(&self, _fingerprint: &str, _username: &str) -> AuthDecision {
        AuthDecision::Accept { owner: UNAUTHORIZED_OWNER.to_string() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn standalone_accepts_everything() {
        let auth = StandaloneAuthorizer;
        match auth.authorize("SHA256:anything", "anyone").await {
            AuthDecision::Accept { owner } => assert_eq!(owner, UNAUTHORIZED_OWNER),
            AuthDecision::Reject => panic!("standalone authorizer must never reject"),
        }
    }
}
