use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::{AppError, Result};

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String, // User ID
    pub username: String,
    pub exp: i64,
    pub iat: i64,
    pub token_type: TokenType,
}

impl Claims {
    pub fn user_id(&self) -> Result<Uuid> {
        Uuid::parse_str(&self.sub).map_err(|_| AppError::Auth("Invalid user ID in token".to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TokenType {
    Access,
    Refresh,
}

pub struct JwtService {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    access_token_duration: Duration,
    refresh_token_duration: Duration,
}

impl JwtService {
    pub fn new(secret: &str) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret.as_ref()),
            decoding_key: DecodingKey::from_secret(secret.as_ref()),
            access_token_duration: Duration::hours(1),
            refresh_token_duration: Duration::days(7),
        }
    }

    pub fn generate_access_token(&self, user_id: Uuid, username: &str) -> Result<String> {
        self.generate(user_id, username, TokenType::Access, self.access_token_duration)
    }

    pub fn generate_refresh_token(&self, user_id: Uuid, username: &str) -> Result<String> {
        self.generate(user_id, username, TokenType::Refresh, self.refresh_token_duration)
    }

    fn generate(
        &self,
        user_id: Uuid,
        username: &str,
        token_type: TokenType,
        lifetime: Duration,
    ) -> Result<String> {
        let now = Utc::now();
        let claims = Claims {
            sub: user_id.to_string(),
            username: username.to_string(),
            exp: (now + lifetime).timestamp(),
            iat: now.timestamp(),
            token_type,
        };

        encode(&Header::default(), &claims, &self.encoding_key)
            .map_err(|e| AppError::Auth(format!("Failed to generate {:?} token: {}", token_type, e)))
    }

    pub fn verify_token(&self, token: &str) -> Result<Claims> {
        let token_data = decode::<Claims>(token, &self.decoding_key, &Validation::default())
            .map_err(|e| AppError::Auth(format!("Invalid token: {}", e)))?;

        Ok(token_data.claims)
    }

    pub fn verify_access_token(&self, token: &str) -> Result<Claims> {
        let claims = self.verify_token(token)?;

        match claims.token_type {
            TokenType::Access => Ok(claims),
            TokenType::Refresh => Err(AppError::Auth("Expected access token, got refresh token".to_string())),
        }
    }

    pub fn verify_refresh_token(&self, token: &str) -> Result<Claims> {
        let claims = self.verify_token(token)?;

        match claims.token_type {
            TokenType::Refresh => Ok(claims),
            TokenType::Access => Err(AppError::Auth("Expected refresh token, got access token".to_string())),
        }
    }
}
