//! Identity verification for the WebSocket handshake.

mod claims;
mod jwt;

use async_trait::async_trait;

use crate::domain::VerifiedIdentity;
use crate::error::GatewayError;

pub use claims::Claims;
pub use jwt::JwtValidator;

/// Establishes a user identity from a bearer credential.
///
/// Implementations must return `GatewayError::Unauthenticated` for any
/// credential they reject.
#[async_trait]
pub trait IdentityVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> Result<VerifiedIdentity, GatewayError>;
}
