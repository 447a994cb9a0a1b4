use std::sync::Arc;

use crate::auth::credentials::RequestCredentials;
use crate::auth::guard::AuthGuard;
use crate::auth::requirement::RequirementResolver;
use crate::auth::roles::RolesGuard;
use crate::core::context::CallContext;

/// Both guards behind one call, resolving the requirement by operation name.
///
/// The role check runs only after authentication succeeds, so it always sees
/// the identity the auth guard attached.
#[derive(Clone)]
pub struct AccessControl {
    resolver: Arc<dyn RequirementResolver>,
    auth: AuthGuard,
    roles: RolesGuard,
}

impl AccessControl {
    pub fn new(resolver: Arc<dyn RequirementResolver>, auth: AuthGuard, roles: RolesGuard) -> Self {
        Self { resolver, auth, roles }
    }

    pub async fn authorize(
        &self,
        operation: &str,
        credentials: &RequestCredentials,
        context: &mut CallContext,
    ) -> bool {
        let requirement = self.resolver.requirement(operation);

        if !self.auth.can_activate(&requirement, credentials, context).await {
            tracing::debug!(operation, "call not authenticated");
            return false;
        }

        if !self.roles.can_activate(&requirement, context) {
            tracing::debug!(operation, "call not authorized");
            return false;
        }

        true
    }
}
