//! HTTP Handlers

use crate::application::challenge::ChallengeService;
use crate::application::config::HarnessConfig;
use crate::application::jobs::queue_snapshot;
use crate::application::registry::ConnectionRegistry;
use crate::application::session::Session;
use crate::domain::repository::JobStore;
use crate::presentation::dto::StatusResponse;
use crate::presentation::socket::WebSocketTransport;
use axum::Json;
use axum::extract::State;
use axum::extract::ws::WebSocketUpgrade;
use axum::response::Response;
use kernel::error::app_error::AppResult;
use std::sync::Arc;

/// Shared state for harness handlers
pub struct HarnessAppState<S>
where
    S: JobStore + 'static,
{
    pub store: Arc<S>,
    pub challenges: Arc<ChallengeService<S>>,
    pub registry: ConnectionRegistry,
    pub config: Arc<HarnessConfig>,
}

impl<S> HarnessAppState<S>
where
    S: JobStore + 'static,
{
    pub fn new(store: Arc<S>, registry: ConnectionRegistry, config: Arc<HarnessConfig>) -> Self {
        Self {
            challenges: Arc::new(ChallengeService::new(store.clone(), config.clone())),
            store,
            registry,
            config,
        }
    }
}

// Manual impl: deriving would require `S: Clone`.
impl<S> Clone for HarnessAppState<S>
where
    S: JobStore + 'static,
{
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            challenges: self.challenges.clone(),
            registry: self.registry.clone(),
            config: self.config.clone(),
        }
    }
}

/// GET /ws
pub async fn connect<S>(State(state): State<HarnessAppState<S>>, ws: WebSocketUpgrade) -> Response
where
    S: JobStore + 'static,
{
    ws.on_upgrade(move |socket| async move {
        let session = Session::new(
            WebSocketTransport::new(socket),
            state.store,
            state.challenges,
            state.registry,
            &state.config,
        );
        session.run().await;
    })
}

/// GET /status
pub async fn queue_status<S>(
    State(state): State<HarnessAppState<S>>,
) -> AppResult<Json<StatusResponse>>
where
    S: JobStore + 'static,
{
    let snapshot = queue_snapshot(state.store.as_ref()).await?;

    Ok(Json(StatusResponse {
        queued: snapshot.queued,
        running: snapshot.running,
        max_instances: state.config.max_instances,
        connections: state.registry.len(),
    }))
}
