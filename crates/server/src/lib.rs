pub mod routes;

use services::services::poll::PollStatusHandle;

/// State shared with the HTTP routes.
#[derive(Clone)]
pub struct AppState {
    pub poll_status: PollStatusHandle,
}
