use axum::{
    extract::DefaultBodyLimit,
    middleware::from_fn_with_state,
    routing::{delete, get, post},
    Router,
};
use tower_http::{limit::RequestBodyLimitLayer, trace::TraceLayer};

pub mod auth;
pub mod config;
pub mod database;
pub mod errors;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod services;
pub mod storage;
pub mod utils;

pub use handlers::AppState;

/// Room for multipart boundaries and part headers on top of the file itself.
const MULTIPART_OVERHEAD: usize = 64 * 1024;

pub fn create_app(state: AppState) -> Router {
    let body_limit = state.config.max_file_size.saturating_add(MULTIPART_OVERHEAD);

    let api = Router::new()
        .route("/auth/register", post(handlers::auth::register))
        .route("/auth/login", post(handlers::auth::login))
        .route("/auth/refresh", post(handlers::auth::refresh))
        .route("/auth/logout", post(handlers::auth::logout))
        .route("/auth/me", get(handlers::auth::me))
        .route("/files", get(handlers::files::list_files))
        .route("/files/upload", post(handlers::files::upload_file))
        .route("/files/:id/download", get(handlers::files::download_file))
        .route("/files/:id", delete(handlers::files::delete_file))
        .route("/storage", get(handlers::user::get_storage));

    Router::new()
        .route("/health", get(handlers::health::liveness))
        .route("/ready", get(handlers::health::readiness))
        .route("/metrics", get(handlers::metrics::metrics_handler))
        .nest("/api", api)
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(body_limit))
        .layer(from_fn_with_state(
            state.clone(),
            middleware::metrics_middleware,
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
