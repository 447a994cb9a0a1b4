//! Firebase and Google Cloud building blocks for Rust services.
//!
//! [`FirebaseApp`] owns the service account and hands out the individual
//! services: request authorization ([`auth`]), Pub/Sub subscription streams
//! ([`pubsub`]), batched FCM sends ([`messaging`]) and request spans
//! ([`trace`]). Each service sits behind a cargo feature of the same name.

#[cfg(feature = "auth")]
pub mod auth;
pub mod config;
pub mod core;
#[cfg(feature = "messaging")]
pub mod messaging;
#[cfg(feature = "pubsub")]
pub mod pubsub;
#[cfg(feature = "trace")]
pub mod trace;


#[cfg(any(feature = "auth", feature = "trace"))]
use std::sync::Arc;

use yup_oauth2::ServiceAccountKey;

#[cfg(feature = "auth")]
use crate::auth::{AccessControl, AuthGuard, IdTokenVerifier, RequirementResolver, RolesGuard};
use crate::config::{required_env_var, AppConfig, ConfigError};
use crate::core::middleware::AuthMiddleware;
#[cfg(feature = "messaging")]
use crate::messaging::FirebaseMessaging;
#[cfg(feature = "pubsub")]
use crate::pubsub::PubSubService;
#[cfg(feature = "trace")]
use crate::trace::{RootSpanHook, TraceService};

/// Environment variable naming the service account key file.
pub const CREDENTIALS_VAR: &str = "GOOGLE_APPLICATION_CREDENTIALS";

#[derive(Clone)]
pub struct FirebaseApp {
    middleware: AuthMiddleware,
    project_id: String,
    config: AppConfig,
}

impl FirebaseApp {
    /// Creates an app for the key's project, configured from the process
    /// environment.
    pub fn new(service_account_key: ServiceAccountKey) -> Result<Self, ConfigError> {
        let project_id = service_account_key
            .project_id
            .clone()
            .filter(|id| !id.is_empty())
            .ok_or(ConfigError::ProjectIdMissing)?;

        Ok(Self {
            middleware: AuthMiddleware::new(service_account_key),
            project_id,
            config: AppConfig::from_env(),
        })
    }

    /// Reads the service account key named by `GOOGLE_APPLICATION_CREDENTIALS`.
    pub async fn from_env() -> Result<Self, ConfigError> {
        let path = required_env_var(CREDENTIALS_VAR)?;
        let key = yup_oauth2::read_service_account_key(&path).await?;
        tracing::debug!(path = %path, "loaded service account key");
        Self::new(key)
    }

    pub fn with_config(mut self, config: AppConfig) -> Self {
        self.config = config;
        self
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    #[cfg(feature = "auth")]
    pub fn id_token_verifier(&self) -> IdTokenVerifier {
        IdTokenVerifier::new(self.project_id.clone())
    }

    #[cfg(feature = "auth")]
    pub fn auth_guard(&self) -> AuthGuard {
        AuthGuard::new(Arc::new(self.id_token_verifier()))
    }

    /// Roles guard enforcing the configured global role.
    #[cfg(feature = "auth")]
    pub fn roles_guard(&self) -> RolesGuard {
        RolesGuard::new(self.config.global_role.clone())
    }

    #[cfg(feature = "auth")]
    pub fn access_control(&self, resolver: Arc<dyn RequirementResolver>) -> AccessControl {
        AccessControl::new(resolver, self.auth_guard(), self.roles_guard())
    }

    #[cfg(feature = "messaging")]
    pub fn messaging(&self) -> FirebaseMessaging {
        FirebaseMessaging::new(self.middleware.clone(), self.project_id.clone())
    }

    #[cfg(feature = "pubsub")]
    pub fn pubsub(&self) -> PubSubService {
        PubSubService::new(self.middleware.clone(), self.project_id.clone())
    }

    #[cfg(feature = "trace")]
    pub fn trace(&self) -> TraceService {
        TraceService::new(self.config.trace_service.clone())
    }

    #[cfg(feature = "trace")]
    pub fn root_span_hook(&self) -> RootSpanHook {
        RootSpanHook::new(Arc::new(self.trace()))
    }
}
