use crate::handlers;
use crate::middleware;
use crate::AppState;
use axum::{
    middleware::from_fn_with_state,
    routing::{get, post},
    Router,
};
use std::sync::Arc;

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        // Health checks
        .route("/health", get(handlers::health::health_check))
        .route("/health/databases", get(handlers::health::database_health))
        .route("/health/migrations", get(handlers::health::migration_health))
        .route("/health/routing", get(handlers::health::routing_health))
        .route("/health/system", get(handlers::health::system_health))
        // Tenants
        .route("/tenant", get(handlers::tenant::list_tenants))
        .route("/tenant/current", get(handlers::tenant::current_tenant))
        .route("/tenant/onboard", post(handlers::tenant::onboard_tenant))
        // Sample data
        .route("/init-data", post(handlers::tenant::seed_sample_data))
        .layer(from_fn_with_state(state.clone(), middleware::routing_scope))
        .with_state(state)
}
