use axum::{extract::State, response::Json};

use crate::{
    errors::{AppError, Result},
    handlers::AppState,
    middleware::AuthenticatedUser,
    models::UserQuotaResponse,
};

pub async fn get_storage(
    State(state): State<AppState>,
    user: AuthenticatedUser,
) -> Result<Json<UserQuotaResponse>> {
    let user = state.ledger.get_user(user.id).await?.ok_or(AppError::NotFound)?;
    Ok(Json(UserQuotaResponse::from(&user)))
}
