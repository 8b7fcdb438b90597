use bcrypt::{hash, verify, DEFAULT_COST};

use crate::errors::{AppError, Result};

const MIN_PASSWORD_LEN: usize = 8;
const MAX_USERNAME_LEN: usize = 64;

pub struct PasswordService;

impl PasswordService {
    pub fn hash_password(password: &str) -> Result<String> {
        hash(password, DEFAULT_COST)
            .map_err(|e| AppError::Internal(anyhow::anyhow!("Failed to hash password: {}", e)))
    }

    pub fn verify_password(password: &str, hash: &str) -> Result<bool> {
        verify(password, hash)
            .map_err(|e| AppError::Auth(format!("Failed to verify password: {}", e)))
    }

    pub fn validate_password_strength(password: &str) -> Result<()> {
        if password.chars().count() < MIN_PASSWORD_LEN {
            return Err(AppError::Validation(format!(
                "Password must be at least {} characters long",
                MIN_PASSWORD_LEN
            )));
        }
        Ok(())
    }

    /// Usernames are case-sensitive and stored as given.
    pub fn validate_username(username: &str) -> Result<()> {
        if username.is_empty() || username.len() > MAX_USERNAME_LEN {
            return Err(AppError::Validation(format!(
                "Username must be between 1 and {} characters",
                MAX_USERNAME_LEN
            )));
        }
        if username.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err(AppError::Validation(
                "Username must not contain whitespace".to_string(),
            ));
        }
        Ok(())
    }
}
