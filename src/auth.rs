//! Token validation
//!
//! Connections authenticate with a bearer token in the upgrade request. The
//! core only validates tokens; issuing them belongs to the account service.

use async_trait::async_trait;
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::AppError;
use crate::types::UserId;

/// Claims carried by access tokens
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub user_id: String,
    pub exp: usize,
}

#[async_trait]
pub trait TokenValidator: Send + Sync {
    /// Resolve a token to the user it was issued for
    async fn validate(&self, token: &str) -> Result<UserId, AppError>;
}

/// HS256 validator sharing its secret with the token issuer
pub struct JwtValidator {
    key: DecodingKey,
    validation: Validation,
}

impl JwtValidator {
    pub fn new(secret: &[u8]) -> Self {
        Self {
            key: DecodingKey::from_secret(secret),
            validation: Validation::new(Algorithm::HS256),
        }
    }
}

#[async_trait]
impl TokenValidator for JwtValidator {
    async fn validate(&self, token: &str) -> Result<UserId, AppError> {
        let token = token.strip_prefix("Bearer ").unwrap_or(token).trim();
        if token.is_empty() {
            return Err(AppError::Unauthorized("missing token".into()));
        }

        let data = jsonwebtoken::decode::<Claims>(token, &self.key, &self.validation)
            .map_err(|e| {
                debug!("Token rejected: {}", e);
                AppError::Unauthorized("invalid token".into())
            })?;

        data.claims
            .user_id
            .parse()
            .map_err(|_| AppError::Unauthorized("invalid token subject".into()))
    }
}
