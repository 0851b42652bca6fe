use crate::handlers::ErrorResponse;
use crate::AppState;
use axum::{extract::State, http::StatusCode, Json};
use multidb_database::RegistryStats;
use multidb_models::{OnboardTenantRequest, TenantKey};
use multidb_tenant::{FallbackReason, OnboardingOutcome, RoutingContext, TenantError};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Id of the sample row written by `/init-data`
const SAMPLE_ROW_ID: i64 = 1;

#[derive(Debug, Serialize)]
pub struct CurrentTenantResponse {
    pub tenant: TenantKey,
    pub requested: Option<TenantKey>,
    pub fallback: Option<FallbackReason>,
    pub table: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub row_count: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SeedResult {
    pub success: bool,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SeedResponse {
    pub table: String,
    pub results: BTreeMap<TenantKey, SeedResult>,
}

/// "CLIENT_A" -> "Client A DB"
fn sample_name(key: &TenantKey) -> String {
    let words: Vec<String> = key
        .as_str()
        .split('_')
        .filter(|word| !word.is_empty())
        .map(|word| {
            let lower = word.to_lowercase();
            let mut chars = lower.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect(),
                None => String::new(),
            }
        })
        .collect();
    format!("{} DB", words.join(" "))
}

fn error_response(err: TenantError) -> (StatusCode, Json<ErrorResponse>) {
    let message = err.to_string();
    match err {
        TenantError::Validation(_) => (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse::new("validation_error", &message)),
        ),
        TenantError::Configuration(_) => (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse::new("configuration_error", &message)),
        ),
        TenantError::Migration {
            tenant, version, ..
        } => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse {
                tenant: Some(tenant.to_string()),
                version: Some(version),
                ..ErrorResponse::new("migration_error", &message)
            }),
        ),
        TenantError::Connection(_) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse::new("connection_error", &message)),
        ),
    }
}

/// Register and migrate a new tenant database at runtime
/// POST /tenant/onboard
pub async fn onboard_tenant(
    State(state): State<Arc<AppState>>,
    Json(request): Json<OnboardTenantRequest>,
) -> Result<Json<OnboardingOutcome>, (StatusCode, Json<ErrorResponse>)> {
    let outcome = state
        .onboarder
        .onboard_request(&request)
        .await
        .map_err(|e| {
            tracing::warn!("Onboarding of tenant '{}' failed: {}", request.tenant_id, e);
            error_response(e)
        })?;

    Ok(Json(outcome))
}

/// GET /tenant
pub async fn list_tenants(State(state): State<Arc<AppState>>) -> Json<RegistryStats> {
    Json(state.registry.stats())
}

/// Route a trivial read through the request's routing context
/// GET /tenant/current
pub async fn current_tenant(State(state): State<Arc<AppState>>) -> Json<CurrentTenantResponse> {
    let routed = state.router.route();
    let count = routed.pool.row_count(&state.probe_table).await;

    Json(CurrentTenantResponse {
        tenant: routed.decision.key,
        requested: routed.decision.requested,
        fallback: routed.decision.fallback,
        table: state.probe_table.clone(),
        row_count: count.as_ref().ok().copied(),
        error: count.err().map(|e| e.to_string()),
    })
}

/// Write one sample row into every registered tenant, each through its own routing scope
/// POST /init-data
pub async fn seed_sample_data(
    State(state): State<Arc<AppState>>,
) -> (StatusCode, Json<SeedResponse>) {
    tracing::info!("Seeding sample data across {} tenant databases", state.registry.len());

    let mut results = BTreeMap::new();
    for key in state.registry.keys() {
        let name = sample_name(&key);
        let written = RoutingContext::with_tenant(key.clone(), async {
            let routed = state.router.route();
            routed
                .pool
                .upsert_row(&state.probe_table, SAMPLE_ROW_ID, &name)
                .await
        })
        .await;

        let result = match written {
            Ok(_) => {
                tracing::debug!("Saved sample row in {}", key);
                SeedResult {
                    success: true,
                    name,
                    error: None,
                }
            }
            Err(e) => {
                tracing::error!("Failed to seed database {}: {}", key, e);
                SeedResult {
                    success: false,
                    name,
                    error: Some(e.to_string()),
                }
            }
        };
        results.insert(key, result);
    }

    let status = if results.values().all(|r| r.success) {
        StatusCode::OK
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };

    (
        status,
        Json(SeedResponse {
            table: state.probe_table.clone(),
            results,
        }),
    )
}
