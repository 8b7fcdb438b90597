use axum::{extract::State, http::StatusCode, response::Json};
use serde_json::json;

use crate::{
    auth::PasswordService,
    errors::{AppError, Result},
    handlers::AppState,
    middleware::AuthenticatedUser,
    models::{AuthResponse, CreateUserRequest, LoginRequest, RefreshRequest, User, UserResponse},
};

fn issue_tokens(state: &AppState, user: User) -> Result<AuthResponse> {
    let access_token = state.jwt.generate_access_token(user.id, &user.username)?;
    let refresh_token = state.jwt.generate_refresh_token(user.id, &user.username)?;

    Ok(AuthResponse {
        access_token,
        refresh_token,
        user: UserResponse::from(user),
    })
}

pub async fn register(
    State(state): State<AppState>,
    Json(request): Json<CreateUserRequest>,
) -> Result<(StatusCode, Json<AuthResponse>)> {
    PasswordService::validate_username(&request.username)?;
    PasswordService::validate_password_strength(&request.password)?;

    if state
        .ledger
        .get_user_by_username(&request.username)
        .await?
        .is_some()
    {
        return Err(AppError::Conflict("Username already exists".to_string()));
    }

    let password_hash = PasswordService::hash_password(&request.password)?;

    // The ledger enforces uniqueness too; a racing registration still gets 409.
    let user = state
        .ledger
        .create_user(&request.username, &password_hash)
        .await?;
    tracing::info!(user_id = %user.id, storage_quota = user.storage_quota, "User registered");

    Ok((StatusCode::CREATED, Json(issue_tokens(&state, user)?)))
}

pub async fn login(
    State(state): State<AppState>,
    Json(request): Json<LoginRequest>,
) -> Result<Json<AuthResponse>> {
    let user = state
        .ledger
        .get_user_by_username(&request.username)
        .await?
        .ok_or_else(|| AppError::Auth("Invalid username or password".to_string()))?;

    if !PasswordService::verify_password(&request.password, &user.password_hash)? {
        return Err(AppError::Auth("Invalid username or password".to_string()));
    }

    Ok(Json(issue_tokens(&state, user)?))
}

pub async fn refresh(
    State(state): State<AppState>,
    Json(request): Json<RefreshRequest>,
) -> Result<Json<serde_json::Value>> {
    let claims = state.jwt.verify_refresh_token(&request.refresh_token)?;
    let user_id = claims.user_id()?;

    // Verify user still exists
    let user = state
        .ledger
        .get_user(user_id)
        .await?
        .ok_or_else(|| AppError::Auth("User not found".to_string()))?;

    let access_token = state.jwt.generate_access_token(user.id, &user.username)?;

    Ok(Json(json!({
        "accessToken": access_token,
        "user": UserResponse::from(user)
    })))
}

pub async fn logout(_user: AuthenticatedUser) -> Json<serde_json::Value> {
    // Tokens are stateless; the client discards them.
    Json(json!({ "success": true }))
}

pub async fn me(
    State(state): State<AppState>,
    user: AuthenticatedUser,
) -> Result<Json<UserResponse>> {
    let user = state.ledger.get_user(user.id).await?.ok_or(AppError::NotFound)?;
    Ok(Json(UserResponse::from(user)))
}
