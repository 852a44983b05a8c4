//! Password rotation and recovery.

use crate::state::AppState;
use axum::{
    routing::{get, post},
    Router,
};

mod dto;
pub mod handlers;
pub mod policy;

/// Routes reachable with an expired password.
pub fn force_router() -> Router<AppState> {
    Router::new()
        .route("/check-expiration", get(handlers::check_expiration))
        .route("/force-password-change", post(handlers::force_password_change))
}

pub fn reset_router() -> Router<AppState> {
    Router::new()
        .route("/forgot-password", post(handlers::forgot_password))
        .route("/reset-password-email", post(handlers::reset_password_email))
        .route("/reset-password", post(handlers::reset_password))
}
