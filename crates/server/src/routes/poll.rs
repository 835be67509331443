use axum::{extract::State, response::Json};
use services::services::poll::PollStatus;

use crate::AppState;

pub async fn poll_status(State(state): State<AppState>) -> Json<PollStatus> {
    Json(state.poll_status.snapshot().await)
}
