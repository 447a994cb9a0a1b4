//! Per-call state shared between the guards, the trace hook and application code.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A role identifier as carried in the `roles` custom claim.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Role(String);

impl Role {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Role {
    fn from(name: &str) -> Self {
        Self(name.to_string())
    }
}

impl From<String> for Role {
    fn from(name: String) -> Self {
        Self(name)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Claims of a verified Firebase ID token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecodedIdToken {
    pub aud: String,
    pub iss: String,
    #[serde(rename = "sub")]
    pub uid: String,
    pub exp: usize,
    pub iat: usize,
    pub auth_time: usize,
    /// Custom `roles` claim; absent means no roles.
    #[serde(default)]
    pub roles: Vec<Role>,
    #[serde(flatten)]
    pub claims: serde_json::Map<String, serde_json::Value>,
}

impl DecodedIdToken {
    pub fn has_role(&self, role: &Role) -> bool {
        self.roles.contains(role)
    }
}

/// Context owned by a single inbound call.
///
/// The identity slot is written at most once, by the auth guard after a bearer
/// token verifies.
#[derive(Debug, Default)]
pub struct CallContext {
    identity: Option<DecodedIdToken>,
    root_span: Option<tracing::Span>,
}

impl CallContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn identity(&self) -> Option<&DecodedIdToken> {
        self.identity.as_ref()
    }

    /// Uid of the authenticated caller, if the call was bearer-authenticated.
    pub fn uid(&self) -> Option<&str> {
        self.identity.as_ref().map(|identity| identity.uid.as_str())
    }

    /// Roles of the authenticated caller; empty when there is no identity.
    pub fn roles(&self) -> &[Role] {
        self.identity
            .as_ref()
            .map(|identity| identity.roles.as_slice())
            .unwrap_or_default()
    }

    /// Returns `false` and leaves the context untouched when an identity is
    /// already attached.
    pub(crate) fn attach_identity(&mut self, identity: DecodedIdToken) -> bool {
        if self.identity.is_some() {
            return false;
        }
        self.identity = Some(identity);
        true
    }

    pub fn root_span(&self) -> Option<&tracing::Span> {
        self.root_span.as_ref()
    }

    pub(crate) fn set_root_span(&mut self, span: tracing::Span) {
        self.root_span = Some(span);
    }

    pub(crate) fn take_root_span(&mut self) -> Option<tracing::Span> {
        self.root_span.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn identity(uid: &str) -> DecodedIdToken {
        serde_json::from_value(json!({
            "aud": "test-project",
            "iss": "https://securetoken.google.com/test-project",
            "sub": uid,
            "exp": 2,
            "iat": 1,
            "auth_time": 1,
        }))
        .unwrap()
    }

    #[test]
    fn test_decoded_token_reads_roles_and_extra_claims() {
        let token: DecodedIdToken = serde_json::from_value(json!({
            "aud": "test-project",
            "iss": "https://securetoken.google.com/test-project",
            "sub": "uid-1",
            "exp": 2,
            "iat": 1,
            "auth_time": 1,
            "roles": ["admin", "editor"],
            "email": "user@example.com",
        }))
        .unwrap();

        assert_eq!(token.uid, "uid-1");
        assert!(token.has_role(&Role::from("admin")));
        assert!(!token.has_role(&Role::from("owner")));
        assert_eq!(token.claims.get("email"), Some(&json!("user@example.com")));
    }

    #[test]
    fn test_missing_roles_claim_means_no_roles() {
        let token = identity("uid-1");
        assert!(token.roles.is_empty());
    }

    #[test]
    fn test_identity_is_written_once() {
        let mut ctx = CallContext::new();
        assert!(ctx.uid().is_none());
        assert!(ctx.roles().is_empty());

        assert!(ctx.attach_identity(identity("first")));
        assert!(!ctx.attach_identity(identity("second")));
        assert_eq!(ctx.uid(), Some("first"));
    }
}
