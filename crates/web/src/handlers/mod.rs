use axum::{
    Router,
    routing::{get, post},
};

use crate::AppState;

mod webhook;

pub fn build_router() -> Router<AppState> {
    Router::new()
        .route("/", get(index))
        .route("/event_handler", post(webhook::event_handler))
}

async fn index() -> &'static str { "Power check webhook server is running" }
