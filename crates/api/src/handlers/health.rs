use crate::AppState;
use axum::{extract::State, http::StatusCode, Json};
use multidb_models::{
    ConnectivityReport, HealthReport, MigrationHealthReport, ResourceReport, RoutingReport,
};
use std::sync::Arc;

fn status_code(healthy: bool) -> StatusCode {
    if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

/// Composite health of every tenant database and the process
/// GET /health
pub async fn health_check(State(state): State<Arc<AppState>>) -> (StatusCode, Json<HealthReport>) {
    let report = state.health.overall().await;
    (status_code(report.healthy), Json(report))
}

/// GET /health/databases
pub async fn database_health(
    State(state): State<Arc<AppState>>,
) -> (StatusCode, Json<ConnectivityReport>) {
    let report = state.health.probe_connectivity().await;
    (status_code(report.healthy), Json(report))
}

/// GET /health/migrations
pub async fn migration_health(
    State(state): State<Arc<AppState>>,
) -> (StatusCode, Json<MigrationHealthReport>) {
    let report = state.health.probe_migrations().await;
    (status_code(report.healthy), Json(report))
}

/// GET /health/routing
pub async fn routing_health(
    State(state): State<Arc<AppState>>,
) -> (StatusCode, Json<RoutingReport>) {
    let report = state.health.probe_routing().await;
    (status_code(report.healthy), Json(report))
}

/// GET /health/system
pub async fn system_health(State(state): State<Arc<AppState>>) -> (StatusCode, Json<ResourceReport>) {
    let report = state.health.probe_resources().await;
    (status_code(report.healthy), Json(report))
}
