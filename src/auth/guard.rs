use std::sync::Arc;

use crate::auth::credentials::RequestCredentials;
use crate::auth::requirement::AccessRequirement;
use crate::auth::verifier::IdentityVerifier;
use crate::core::context::CallContext;

/// Decides whether a call is authenticated.
///
/// Checks run in precedence order and stop at the first success: the public
/// flag, then the operation's basic-auth pair, then the bearer token. Only the
/// bearer path touches the context, attaching the verified identity.
#[derive(Clone)]
pub struct AuthGuard {
    verifier: Arc<dyn IdentityVerifier>,
}

impl AuthGuard {
    pub fn new(verifier: Arc<dyn IdentityVerifier>) -> Self {
        Self { verifier }
    }

    pub async fn can_activate(
        &self,
        requirement: &AccessRequirement,
        credentials: &RequestCredentials,
        context: &mut CallContext,
    ) -> bool {
        if requirement.public {
            return true;
        }

        if Self::basic_auth_matches(requirement, credentials) {
            return true;
        }

        self.verify_bearer(credentials, context).await
    }

    fn basic_auth_matches(requirement: &AccessRequirement, credentials: &RequestCredentials) -> bool {
        let Some(expected) = &requirement.basic_auth else {
            return false;
        };

        match credentials.basic_credentials() {
            Some(presented) => presented == *expected,
            None => false,
        }
    }

    async fn verify_bearer(&self, credentials: &RequestCredentials, context: &mut CallContext) -> bool {
        let Some(token) = credentials.bearer_token() else {
            tracing::debug!("no bearer token presented");
            return false;
        };

        match self.verifier.verify_id_token(token).await {
            Ok(identity) => {
                tracing::debug!(uid = %identity.uid, "bearer token verified");
                if !context.attach_identity(identity) {
                    tracing::warn!("call context already carries an identity, keeping the first one");
                }
                true
            }
            Err(e) => {
                tracing::warn!(error = %e, "bearer token verification failed");
                false
            }
        }
    }
}
