use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::error::ApiError;

/// Session token claims. `jti` allows individual tokens to be revoked
/// through the blacklist table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub jti: String,
    pub iat: i64,
    pub exp: i64,
}

pub struct JwtUtil {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    expiration_hours: i64,
}

impl JwtUtil {
    pub fn new(secret: &str, expiration_hours: i64) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            expiration_hours,
        }
    }

    /// Issue a new session token. Returns (token, expiry).
    pub fn generate_token(&self) -> Result<(String, DateTime<Utc>), ApiError> {
        let now = Utc::now();
        let expires_at = now + Duration::hours(self.expiration_hours);

        let claims = Claims {
            sub: "user".to_string(),
            jti: Uuid::new_v4().to_string(),
            iat: now.timestamp(),
            exp: expires_at.timestamp(),
        };

        let token = encode(&Header::default(), &claims, &self.encoding_key)
            .map_err(|e| ApiError::internal_error(format!("Failed to sign token: {}", e)))?;

        Ok((token, expires_at))
    }

    pub fn verify_token(&self, token: &str) -> Result<Claims, ApiError> {
        let validation = Validation::new(Algorithm::HS256);
        decode::<Claims>(token, &self.decoding_key, &validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => ApiError::TokenExpired,
                _ => ApiError::unauthorized("Invalid token"),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_token() {
        let util = JwtUtil::new("0123456789abcdef0123456789abcdef", 24);
        let (token, expires_at) = util.generate_token().unwrap();
        assert!(expires_at > Utc::now());

        let claims = util.verify_token(&token).unwrap();
        assert_eq!(claims.sub, "user");
        assert!(!claims.jti.is_empty());
    }

    #[test]
    fn rejects_token_from_other_secret() {
        let util = JwtUtil::new("0123456789abcdef0123456789abcdef", 24);
        let other = JwtUtil::new("ffffffffffffffffffffffffffffffff", 24);
        let (token, _) = util.generate_token().unwrap();
        assert!(other.verify_token(&token).is_err());
    }
}
