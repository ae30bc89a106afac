use anyhow::Result;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use super::{AuthError, Authenticator, Principal};
use crate::common::{GameId, Identity};
use crate::domains::game::Role;

/// JWT Claims - data stored in the token
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Claims {
    pub sub: Identity, // Player identity
    #[serde(rename = "gameId")]
    pub game_id: GameId,
    pub role: Role,
    pub exp: i64,    // Expiration timestamp
    pub iat: i64,    // Issued at timestamp
    pub iss: String, // Issuer
    pub jti: String, // JWT ID (unique token identifier)
}

/// JWT Service - creates and verifies session tokens
#[derive(Clone)]
pub struct JwtService {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    issuer: String,
}

impl JwtService {
    /// Create new JWT service with secret and issuer
    pub fn new(secret: &str, issuer: String) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            issuer,
        }
    }

    /// Create a token granting `identity` the `role` in `game_id`.
    ///
    /// Token expires after 1 hour
    pub fn create_token(&self, identity: &Identity, game_id: &GameId, role: Role) -> Result<String> {
        let now = chrono::Utc::now();
        let exp = now + chrono::Duration::hours(1);

        let claims = Claims {
            sub: identity.clone(),
            game_id: game_id.clone(),
            role,
            exp: exp.timestamp(),
            iat: now.timestamp(),
            iss: self.issuer.clone(),
            jti: Uuid::new_v4().to_string(),
        };

        encode(&Header::default(), &claims, &self.encoding_key).map_err(Into::into)
    }

    /// Verify and decode a token
    ///
    /// Returns claims if the token is valid, unexpired and from our issuer
    pub fn verify_token(&self, token: &str) -> Result<Claims, AuthError> {
        let mut validation = Validation::default();
        validation.set_issuer(&[&self.issuer]);

        decode::<Claims>(token, &self.decoding_key, &validation)
            .map(|data| data.claims)
            .map_err(|e| {
                debug!(error = %e, "Token rejected");
                AuthError::InvalidToken
            })
    }
}

impl Authenticator for JwtService {
    fn verify(&self, credential: Option<&str>) -> Result<Principal, AuthError> {
        let token = match credential {
            Some(token) if !token.is_empty() => token,
            _ => return Err(AuthError::MissingCredential),
        };
        let claims = self.verify_token(token)?;
        Ok(Principal {
            identity: claims.sub,
            game_id: claims.game_id,
            role: claims.role,
        })
    }
}
