use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{header, request::Parts},
    response::{IntoResponse, Response},
};
use uuid::Uuid;

use crate::{errors::AppError, handlers::AppState};

/// The verified caller. Handlers pass `id` into the lifecycle as the owner.
#[derive(Debug, Clone)]
pub struct AuthenticatedUser {
    pub id: Uuid,
    pub username: String,
}

#[async_trait]
impl FromRequestParts<AppState> for AuthenticatedUser {
    type Rejection = Response;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> std::result::Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|header| header.to_str().ok())
            .and_then(|header| header.strip_prefix("Bearer "))
            .ok_or_else(|| {
                AppError::Auth("Authentication required".to_string()).into_response()
            })?;

        let claims = state
            .jwt
            .verify_access_token(token)
            .map_err(|_| AppError::Auth("Invalid or expired token".to_string()).into_response())?;
        let user_id = claims.user_id().map_err(IntoResponse::into_response)?;

        // Verify user still exists
        match state.ledger.get_user(user_id).await {
            Ok(Some(user)) => Ok(AuthenticatedUser {
                id: user.id,
                username: user.username,
            }),
            Ok(None) => Err(AppError::Auth("User not found".to_string()).into_response()),
            Err(err) => Err(err.into_response()),
        }
    }
}
