//! 身份校验
//!
//! - [`TrustedIdentityValidator`]：信任上游网关已校验的 `userId`
//! - [`JwtIdentityValidator`]：HS256 JWT，`sub` 为用户 ID

use async_trait::async_trait;
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::domain::model::AuthPayload;
use crate::domain::repository::IdentityValidator;
use crate::error::{ImError, Result};

pub struct TrustedIdentityValidator;

#[async_trait]
impl IdentityValidator for TrustedIdentityValidator {
    async fn validate_identity(&self, claim: &AuthPayload) -> Result<i64> {
        let user_id = claim.user_id.or_else(|| {
            claim
                .token
                .as_deref()
                .and_then(|token| token.trim().parse::<i64>().ok())
        });

        match user_id {
            Some(id) if id > 0 => Ok(id),
            Some(id) => Err(ImError::Auth(format!("invalid user id {id}"))),
            None => Err(ImError::Auth("missing user identity".to_string())),
        }
    }
}

/// JWT Claims
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityClaims {
    /// 用户 ID
    pub sub: String,
    /// 过期时间（Unix 时间戳）
    pub exp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
}

pub struct JwtIdentityValidator {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl JwtIdentityValidator {
    pub fn new(secret: &[u8], issuer: Option<&str>) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        if let Some(issuer) = issuer {
            validation.set_issuer(&[issuer]);
        }

        Self {
            decoding_key: DecodingKey::from_secret(secret),
            validation,
        }
    }
}

#[async_trait]
impl IdentityValidator for JwtIdentityValidator {
    async fn validate_identity(&self, claim: &AuthPayload) -> Result<i64> {
        let token = claim
            .token
            .as_deref()
            .filter(|token| !token.is_empty())
            .ok_or_else(|| ImError::Auth("missing token".to_string()))?;

        let data = decode::<IdentityClaims>(token, &self.decoding_key, &self.validation)
            .map_err(|err| {
                warn!(error = %err, "token validation failed");
                ImError::Auth(format!("invalid token: {err}"))
            })?;

        let user_id = data
            .claims
            .sub
            .parse::<i64>()
            .map_err(|_| ImError::Auth(format!("invalid subject {}", data.claims.sub)))?;

        if let Some(declared) = claim.user_id.filter(|declared| *declared != user_id) {
            return Err(ImError::Auth(format!(
                "declared user {declared} does not match token subject {user_id}"
            )));
        }

        debug!(user_id, "token validated");
        Ok(user_id)
    }
}
