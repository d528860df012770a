use async_trait::async_trait;
use jsonwebtoken::{decode, DecodingKey, Validation};

use crate::config::JwtConfig;
use crate::domain::VerifiedIdentity;
use crate::error::GatewayError;

use super::{Claims, IdentityVerifier};

pub struct JwtValidator {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl JwtValidator {
    pub fn new(config: &JwtConfig) -> Self {
        let decoding_key = DecodingKey::from_secret(config.secret.as_bytes());

        let mut validation = Validation::default();

        if let Some(ref issuer) = config.issuer {
            validation.set_issuer(&[issuer]);
        }

        if let Some(ref audience) = config.audience {
            validation.set_audience(&[audience]);
        }

        Self {
            decoding_key,
            validation,
        }
    }

    pub fn validate(&self, token: &str) -> Result<Claims, GatewayError> {
        let token_data = decode::<Claims>(token, &self.decoding_key, &self.validation)
            .map_err(|e| GatewayError::Unauthenticated(format!("Invalid token: {}", e)))?;

        Ok(token_data.claims)
    }
}

#[async_trait]
impl IdentityVerifier for JwtValidator {
    async fn verify(&self, token: &str) -> Result<VerifiedIdentity, GatewayError> {
        let claims = self.validate(token)?;
        if claims.sub.is_empty() {
            return Err(GatewayError::Unauthenticated("Token has no subject".to_string()));
        }
        Ok(VerifiedIdentity::new(claims.user_id(), claims.display_name()))
    }
}
