//! Identity verification
//!
//! Bearer tokens are HS256 JWTs carrying the user id, role and display name.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::{Identity, Role};
use crate::error::AppError;

#[async_trait]
pub trait IdentityVerifier: Send + Sync {
    /// `Ok(None)` for an unknown, expired or malformed token
    async fn verify(&self, token: &str) -> Result<Option<Identity>, AppError>;
}

/// Claims carried by a bearer token
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenClaims {
    pub sub: Uuid,
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub exp: usize,
}

pub struct JwtIdentityVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl JwtIdentityVerifier {
    pub fn new(secret: &str) -> Self {
        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation: Validation::new(Algorithm::HS256),
        }
    }
}

#[async_trait]
impl IdentityVerifier for JwtIdentityVerifier {
    async fn verify(&self, token: &str) -> Result<Option<Identity>, AppError> {
        match decode::<TokenClaims>(token, &self.key, &self.validation) {
            Ok(data) => {
                let claims = data.claims;
                let mut identity = Identity::new(claims.sub, claims.role);
                identity.display_name = claims.name;
                Ok(Some(identity))
            }
            Err(err) => {
                tracing::debug!(error = %err, "Rejected bearer token");
                Ok(None)
            }
        }
    }
}

/// Fixed token table, for tests and local tooling
#[derive(Debug, Default)]
pub struct StaticIdentityVerifier {
    tokens: RwLock<HashMap<String, Identity>>,
}

impl StaticIdentityVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, token: impl Into<String>, identity: Identity) {
        let mut tokens = self
            .tokens
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        tokens.insert(token.into(), identity);
    }
}

#[async_trait]
impl IdentityVerifier for StaticIdentityVerifier {
    async fn verify(&self, token: &str) -> Result<Option<Identity>, AppError> {
        let tokens = self
            .tokens
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Ok(tokens.get(token).cloned())
    }
}
