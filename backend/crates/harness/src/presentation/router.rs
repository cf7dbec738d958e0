//! Harness Router

use crate::domain::repository::JobStore;
use crate::presentation::handlers::{self, HarnessAppState};
use axum::{Router, routing::get};

/// Create the harness router for any store implementation
pub fn harness_router<S>(state: HarnessAppState<S>) -> Router
where
    S: JobStore + 'static,
{
    Router::new()
        .route("/ws", get(handlers::connect::<S>))
        .route("/status", get(handlers::queue_status::<S>))
        .with_state(state)
}
