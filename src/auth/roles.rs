use crate::auth::requirement::AccessRequirement;
use crate::core::context::{CallContext, Role};

/// Enforces the process-wide role and an operation's own role.
///
/// Every required role must be held; a caller needs both the global and the
/// local role when both apply.
#[derive(Debug, Clone, Default)]
pub struct RolesGuard {
    global_role: Option<Role>,
}

impl RolesGuard {
    pub fn new(global_role: Option<Role>) -> Self {
        Self { global_role }
    }

    pub fn global_role(&self) -> Option<&Role> {
        self.global_role.as_ref()
    }

    pub fn required_roles<'a>(&'a self, requirement: &'a AccessRequirement) -> Vec<&'a Role> {
        let global = if requirement.ignore_global_role {
            None
        } else {
            self.global_role.as_ref()
        };

        [global, requirement.role.as_ref()].into_iter().flatten().collect()
    }

    pub fn can_activate(&self, requirement: &AccessRequirement, context: &CallContext) -> bool {
        if requirement.public {
            return true;
        }

        let required = self.required_roles(requirement);
        if required.is_empty() {
            return true;
        }

        let user_roles = context.roles();
        let allowed = required.iter().all(|role| user_roles.contains(*role));
        if !allowed {
            tracing::debug!(
                uid = context.uid().unwrap_or("<anonymous>"),
                required = ?required,
                "caller lacks a required role"
            );
        }
        allowed
    }
}
