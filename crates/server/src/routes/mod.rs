use axum::{Router, routing::get};

use crate::AppState;

pub mod health;
pub mod poll;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health_check))
        .route("/poll/status", get(poll::poll_status))
        .with_state(state)
}
