use async_trait::async_trait;
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use thiserror::Error;

use crate::auth::keys::{KeyFetchError, PublicKeyManager};
use crate::core::context::DecodedIdToken;

// Tolerated clock skew for auth_time, in seconds.
const AUTH_TIME_SKEW_SECS: i64 = 300;

#[derive(Error, Debug)]
pub enum TokenVerificationError {
    #[error("Key fetch error: {0}")]
    KeyFetchError(#[from] KeyFetchError),
    #[error("JWT validation error: {0}")]
    JwtError(#[from] jsonwebtoken::errors::Error),
    #[error("Invalid token: {0}")]
    InvalidToken(String),
}

/// Verifies bearer tokens presented by callers.
///
/// The auth guard only depends on this trait, so any identity provider (or a
/// stub in tests) can stand in for Firebase.
#[async_trait]
pub trait IdentityVerifier: Send + Sync {
    async fn verify_id_token(&self, token: &str) -> Result<DecodedIdToken, TokenVerificationError>;
}

pub struct IdTokenVerifier {
    project_id: String,
    key_manager: PublicKeyManager,
}

impl IdTokenVerifier {
    pub fn new(project_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            key_manager: PublicKeyManager::new(),
        }
    }

    pub fn with_key_manager(project_id: impl Into<String>, key_manager: PublicKeyManager) -> Self {
        Self {
            project_id: project_id.into(),
            key_manager,
        }
    }

    pub async fn verify_token(&self, token: &str) -> Result<DecodedIdToken, TokenVerificationError> {
        let header = decode_header(token)?;
        let kid = header
            .kid
            .ok_or_else(|| TokenVerificationError::InvalidToken("Missing kid in header".to_string()))?;

        let public_key_pem = self.key_manager.get_key(&kid).await?;
        let key = DecodingKey::from_rsa_pem(public_key_pem.as_bytes())?;

        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_audience(&[&self.project_id]);
        validation.set_issuer(&[format!("https://securetoken.google.com/{}", self.project_id)]);

        let claims = decode::<DecodedIdToken>(token, &key, &validation)?.claims;

        if claims.uid.is_empty() {
            return Err(TokenVerificationError::InvalidToken(
                "Subject (sub) claim must not be empty".to_string(),
            ));
        }

        let now = chrono::Utc::now().timestamp();
        if claims.auth_time as i64 > now + AUTH_TIME_SKEW_SECS {
            return Err(TokenVerificationError::InvalidToken(
                "Auth time is in the future".to_string(),
            ));
        }

        Ok(claims)
    }
}

#[async_trait]
impl IdentityVerifier for IdTokenVerifier {
    async fn verify_id_token(&self, token: &str) -> Result<DecodedIdToken, TokenVerificationError> {
        self.verify_token(token).await
    }
}
