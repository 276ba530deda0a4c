pub mod live;
pub mod session;
pub mod socket;

use crate::state::SharedState;
use axum::{routing::get, Router};

async fn health() -> &'static str {
    "OK"
}

pub fn routes(state: SharedState) -> Router {
    Router::new().route("/health", get(health)).nest(
        "/api/v1",
        live::router(state.clone()).merge(socket::router(state)),
    )
}
