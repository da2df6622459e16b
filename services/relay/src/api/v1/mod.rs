//! API v1 routes.

mod machines;
mod terminal;

use axum::{routing::get, Router};

use crate::state::AppState;

/// Create API v1 routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/terminal", get(terminal::connect_terminal))
        .nest("/machines", machines::routes())
}
