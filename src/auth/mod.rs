//! Request authorization.
//!
//! Every operation declares an [`AccessRequirement`]. [`AuthGuard`] decides
//! whether the caller is authenticated (public operation, matching basic-auth
//! pair, or a verified Firebase ID token) and [`RolesGuard`] then checks the
//! caller's `roles` claim against the global and per-operation roles.
//! [`AccessControl`] runs both for a named operation.
//!
//! # Examples
//!
//! ```rust,no_run
//! # use std::sync::Arc;
//! # use firebase_cloud_kit::auth::*;
//! # use firebase_cloud_kit::core::context::{CallContext, Role};
//! # async fn run(headers: http::HeaderMap) {
//! let registry = OperationRegistry::new()
//!     .declare("health", AccessRequirement::public())
//!     .declare("importUsers", AccessRequirement::authenticated().with_basic_auth("ops", "secret"))
//!     .declare("deleteProject", AccessRequirement::authenticated().requires_role("owner"));
//!
//! let access = AccessControl::new(
//!     Arc::new(registry),
//!     AuthGuard::new(Arc::new(IdTokenVerifier::new("my-project"))),
//!     RolesGuard::new(Some(Role::from("member"))),
//! );
//!
//! let mut ctx = CallContext::new();
//! let allowed = access
//!     .authorize("deleteProject", &RequestCredentials::from_headers(&headers), &mut ctx)
//!     .await;
//! # }
//! ```

pub mod access;
pub mod credentials;
pub mod guard;
pub mod keys;
pub mod requirement;
pub mod roles;
pub mod verifier;

pub use access::AccessControl;
pub use credentials::RequestCredentials;
pub use guard::AuthGuard;
pub use requirement::{AccessRequirement, BasicCredentials, OperationRegistry, RequirementResolver};
pub use roles::RolesGuard;
pub use verifier::{IdTokenVerifier, IdentityVerifier, TokenVerificationError};

#[cfg(test)]
mod tests;
