use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use std::sync::Arc;
use tracing::error;

use crate::domain::error::{RegistryError, StoreError};
use crate::domain::fleet_service::FleetService;
use crate::domain::node::{Node, NodeSpec, NodeUpdate};
use crate::domain::types::{DaemonHealth, HealthResult, ScrapeTarget};
use crate::reconciler::{PassReport, Reconciler};

/// Shared application state for all API handlers.
#[derive(Clone)]
pub struct AppState {
    pub fleet: Arc<FleetService>,
    pub reconciler: Arc<Reconciler>,
}

type ApiError = (StatusCode, String);

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/v1/nodes", get(list_nodes).post(add_node))
        .route(
            "/api/v1/nodes/{id}",
            get(get_node).patch(update_node).delete(delete_node),
        )
        .route("/api/v1/nodes/{id}/health", get(node_health))
        .route("/api/v1/nodes/{id}/reprovision", post(reprovision))
        .route("/api/v1/reconcile", post(reconcile))
        .route("/api/v1/scrape/targets", get(scrape_targets))
        .with_state(state)
}

fn registry_error(e: RegistryError) -> ApiError {
    let status = match &e {
        RegistryError::InvalidInput(_) => StatusCode::BAD_REQUEST,
        RegistryError::DuplicateTarget { .. } => StatusCode::CONFLICT,
        RegistryError::NotFound(_) => StatusCode::NOT_FOUND,
        RegistryError::Persistence { .. } => {
            error!(error = ?e, "registry write failed");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (status, e.to_string())
}

fn store_error(e: StoreError) -> ApiError {
    error!(error = %e, "reading scrape config failed");
    (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}

async fn health(State(state): State<AppState>) -> Json<DaemonHealth> {
    Json(state.fleet.health().await)
}

async fn list_nodes(State(state): State<AppState>) -> Json<Vec<Node>> {
    Json(state.fleet.list_nodes().await)
}

/// Returns as soon as the node is recorded; provisioning continues in the background.
async fn add_node(
    State(state): State<AppState>,
    Json(spec): Json<NodeSpec>,
) -> Result<(StatusCode, Json<Node>), ApiError> {
    state
        .fleet
        .add_node(spec)
        .await
        .map(|node| (StatusCode::CREATED, Json(node)))
        .map_err(registry_error)
}

async fn get_node(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Node>, ApiError> {
    state.fleet.get_node(&id).await.map(Json).map_err(registry_error)
}

async fn update_node(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(update): Json<NodeUpdate>,
) -> Result<Json<Node>, ApiError> {
    state
        .fleet
        .update_node(&id, update)
        .await
        .map(Json)
        .map_err(registry_error)
}

async fn delete_node(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state
        .fleet
        .delete_node(&id)
        .await
        .map(|()| StatusCode::NO_CONTENT)
        .map_err(registry_error)
}

/// `null` until the node has been probed once.
async fn node_health(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Option<HealthResult>>, ApiError> {
    state
        .fleet
        .get_health(&id)
        .await
        .map(Json)
        .map_err(registry_error)
}

async fn reprovision(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<Node>), ApiError> {
    state
        .fleet
        .reprovision(&id)
        .await
        .map(|node| (StatusCode::ACCEPTED, Json(node)))
        .map_err(registry_error)
}

/// Run one pass now and return what it did.
async fn reconcile(State(state): State<AppState>) -> Json<PassReport> {
    Json(state.reconciler.run_pass().await)
}

async fn scrape_targets(
    State(state): State<AppState>,
) -> Result<Json<Vec<ScrapeTarget>>, ApiError> {
    state
        .fleet
        .scrape_targets()
        .await
        .map(Json)
        .map_err(store_error)
}
