use std::collections::HashMap;

use crate::core::context::Role;

/// Static username/password pair accepted by an operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BasicCredentials {
    pub username: String,
    pub password: String,
}

impl BasicCredentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

/// Access rules declared for one operation.
///
/// The default requirement is "authenticated": no public access, no basic-auth
/// pair, no local role and the global role enforced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccessRequirement {
    pub public: bool,
    pub basic_auth: Option<BasicCredentials>,
    pub role: Option<Role>,
    pub ignore_global_role: bool,
}

impl AccessRequirement {
    pub fn authenticated() -> Self {
        Self::default()
    }

    /// Skips every authentication and role check.
    pub fn public() -> Self {
        Self {
            public: true,
            ..Self::default()
        }
    }

    pub fn with_basic_auth(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.basic_auth = Some(BasicCredentials::new(username, password));
        self
    }

    pub fn requires_role(mut self, role: impl Into<Role>) -> Self {
        self.role = Some(role.into());
        self
    }

    pub fn ignoring_global_role(mut self) -> Self {
        self.ignore_global_role = true;
        self
    }
}

/// Maps an operation identifier to its declared requirement. Routing layers
/// implement this so the guards never need to inspect handlers.
pub trait RequirementResolver: Send + Sync {
    fn requirement(&self, operation: &str) -> AccessRequirement;
}

/// Explicit table of per-operation requirements.
#[derive(Debug, Clone, Default)]
pub struct OperationRegistry {
    requirements: HashMap<String, AccessRequirement>,
    fallback: AccessRequirement,
}

impl OperationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requirement used for operations that were never declared.
    pub fn with_fallback(mut self, fallback: AccessRequirement) -> Self {
        self.fallback = fallback;
        self
    }

    pub fn declare(mut self, operation: impl Into<String>, requirement: AccessRequirement) -> Self {
        self.requirements.insert(operation.into(), requirement);
        self
    }

    pub fn insert(&mut self, operation: impl Into<String>, requirement: AccessRequirement) {
        self.requirements.insert(operation.into(), requirement);
    }
}

impl RequirementResolver for OperationRegistry {
    fn requirement(&self, operation: &str) -> AccessRequirement {
        self.requirements
            .get(operation)
            .cloned()
            .unwrap_or_else(|| self.fallback.clone())
    }
}
