//! Runtime onboarding of tenant databases.
//!
//! Onboarding validates the request, registers a pool for the new tenant and
//! migrates it to the canonical schema. It is not atomic: once the pool is
//! registered it stays registered, even if a migration fails afterwards.

use crate::error::{Result, TenantError};
use multidb_database::{ConnectionPoolRegistry, MigrationOrchestrator, MigrationSet};
use multidb_models::{
    ConnectionParams, MigrationRecord, OnboardTenantRequest, PoolBounds, TenantKey,
};
use serde::Serialize;
use std::sync::Arc;
use validator::Validate;

#[derive(Debug, Clone, Serialize)]
pub struct OnboardingOutcome {
    pub tenant: TenantKey,
    pub applied: Vec<MigrationRecord>,
    pub current_version: Option<i64>,
}

pub struct TenantOnboarder {
    registry: Arc<ConnectionPoolRegistry>,
    orchestrator: Arc<MigrationOrchestrator>,
    migrations: Arc<MigrationSet>,
    default_bounds: PoolBounds,
}

impl TenantOnboarder {
    pub fn new(
        registry: Arc<ConnectionPoolRegistry>,
        orchestrator: Arc<MigrationOrchestrator>,
        migrations: Arc<MigrationSet>,
        default_bounds: PoolBounds,
    ) -> Self {
        Self {
            registry,
            orchestrator,
            migrations,
            default_bounds,
        }
    }

    pub async fn onboard(
        &self,
        tenant_id: &str,
        params: &ConnectionParams,
    ) -> Result<OnboardingOutcome> {
        self.onboard_with_bounds(tenant_id, params, None).await
    }

    /// Onboard from a transport request body
    pub async fn onboard_request(&self, request: &OnboardTenantRequest) -> Result<OnboardingOutcome> {
        request
            .validate()
            .map_err(|e| TenantError::Validation(e.to_string()))?;
        self.onboard_with_bounds(&request.tenant_id, &request.connection, request.bounds.as_ref())
            .await
    }

    pub async fn onboard_with_bounds(
        &self,
        tenant_id: &str,
        params: &ConnectionParams,
        bounds: Option<&PoolBounds>,
    ) -> Result<OnboardingOutcome> {
        let bounds = bounds.unwrap_or(&self.default_bounds);
        let key = self.validate(tenant_id, params, bounds)?;

        tracing::info!(
            "Onboarding new tenant {} at {}",
            key,
            params.redacted_address()
        );

        let pool = self.registry.register(key.clone(), params, bounds).await?;

        let outcome = self
            .orchestrator
            .migrate(&pool, &self.migrations)
            .await
            .map_err(|e| {
                tracing::error!(
                    "Tenant {} registered but its migrations failed: {}",
                    key,
                    e
                );
                TenantError::from(e)
            })?;

        tracing::info!(
            "Successfully onboarded tenant {} (schema version {:?}, {} migrations applied)",
            key,
            outcome.current_version,
            outcome.applied.len()
        );

        Ok(OnboardingOutcome {
            tenant: key,
            applied: outcome.applied,
            current_version: outcome.current_version,
        })
    }

    fn validate(
        &self,
        tenant_id: &str,
        params: &ConnectionParams,
        bounds: &PoolBounds,
    ) -> Result<TenantKey> {
        if tenant_id.trim().is_empty() {
            return Err(TenantError::Validation("Tenant ID cannot be empty".to_string()));
        }

        let key = TenantKey::parse(tenant_id).map_err(|e| {
            TenantError::Validation(format!("Invalid tenant ID '{}': {}", tenant_id.trim(), e))
        })?;

        if self.registry.contains(&key) {
            return Err(TenantError::Validation(format!(
                "Tenant {} already exists",
                key
            )));
        }

        params.check().map_err(TenantError::Validation)?;
        bounds.check().map_err(TenantError::Validation)?;

        Ok(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use multidb_database::Migration;

    fn sqlite_params() -> ConnectionParams {
        ConnectionParams::new(
            format!(
                "sqlite:file:multidb-{}?mode=memory&cache=shared",
                uuid::Uuid::new_v4().simple()
            ),
            "sa",
            "",
        )
    }

    fn single_connection() -> PoolBounds {
        PoolBounds {
            min_connections: 1,
            max_connections: 1,
            acquire_timeout_secs: 1,
            idle_timeout_secs: 600,
        }
    }

    fn key(s: &str) -> TenantKey {
        TenantKey::parse(s).unwrap()
    }

    fn canonical() -> MigrationSet {
        MigrationSet::new(vec![
            Migration::new(1, "create posts table", "CREATE TABLE posts (id BIGINT PRIMARY KEY, name TEXT NOT NULL);"),
            Migration::new(2, "seed posts", "INSERT INTO posts (id, name) VALUES (1, 'Hello');"),
        ])
        .unwrap()
    }

    async fn onboarder(set: MigrationSet) -> TenantOnboarder {
        let registry =
            ConnectionPoolRegistry::connect(TenantKey::main(), &sqlite_params(), &single_connection())
                .await
                .unwrap();
        TenantOnboarder::new(
            Arc::new(registry),
            Arc::new(MigrationOrchestrator::default()),
            Arc::new(set),
            single_connection(),
        )
    }

    #[tokio::test]
    async fn test_onboard_registers_and_migrates() {
        let onboarder = onboarder(canonical()).await;

        let outcome = onboarder.onboard("client-c", &sqlite_params()).await.unwrap();
        assert_eq!(outcome.tenant, key("CLIENT_C"));
        assert_eq!(outcome.current_version, Some(2));
        assert_eq!(outcome.applied.len(), 2);

        let pool = onboarder.registry.resolve(Some(&key("client-c")));
        assert_eq!(pool.key(), &key("CLIENT_C"));

        let history = onboarder.orchestrator.history(&pool).await.unwrap();
        let expected: Vec<(i64, String)> = canonical()
            .iter()
            .map(|m| (m.version(), m.checksum().to_string()))
            .collect();
        let actual: Vec<(i64, String)> = history
            .into_iter()
            .map(|r| (r.version, r.checksum))
            .collect();
        assert_eq!(actual, expected);
        assert_eq!(pool.row_count("posts").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_validation_failures_have_no_side_effects() {
        let onboarder = onboarder(canonical()).await;

        for tenant_id in ["", "   ", "1client", "client.c", "main"] {
            let err = onboarder.onboard(tenant_id, &sqlite_params()).await.unwrap_err();
            assert!(matches!(err, TenantError::Validation(_)), "{tenant_id}: {err}");
        }

        let missing_user = ConnectionParams::new("sqlite::memory:", "", "");
        let err = onboarder.onboard("client-c", &missing_user).await.unwrap_err();
        assert!(matches!(err, TenantError::Validation(_)));

        let wrong_scheme = ConnectionParams::new("mysql://db/client_c", "app", "secret");
        let err = onboarder.onboard("client-c", &wrong_scheme).await.unwrap_err();
        assert!(matches!(err, TenantError::Validation(_)));

        assert_eq!(onboarder.registry.len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_onboarding_is_rejected() {
        let onboarder = onboarder(canonical()).await;
        onboarder.onboard("client-c", &sqlite_params()).await.unwrap();

        let err = onboarder.onboard("CLIENT_C", &sqlite_params()).await.unwrap_err();
        assert!(matches!(err, TenantError::Validation(ref msg) if msg.contains("already exists")));
    }

    #[tokio::test]
    async fn test_failed_migration_keeps_registration() {
        let set = MigrationSet::new(vec![
            Migration::new(1, "create posts table", "CREATE TABLE posts (id BIGINT PRIMARY KEY);"),
            Migration::new(2, "broken", "ALTER TABLE missing ADD COLUMN x TEXT;"),
        ])
        .unwrap();
        let onboarder = onboarder(set).await;

        let err = onboarder.onboard("client-d", &sqlite_params()).await.unwrap_err();
        match err {
            TenantError::Migration { tenant, version, .. } => {
                assert_eq!(tenant, key("client-d"));
                assert_eq!(version, 2);
            }
            other => panic!("unexpected error: {other}"),
        }

        assert!(onboarder.registry.contains(&key("client-d")));
        let pool = onboarder.registry.resolve(Some(&key("client-d")));
        let history = onboarder.orchestrator.history(&pool).await.unwrap();
        assert_eq!(history.len(), 1);
    }

    #[tokio::test]
    async fn test_onboard_request_from_json() {
        let onboarder = onboarder(canonical()).await;
        let body = serde_json::json!({
            "tenant_id": "client-e",
            "address": sqlite_params().address,
            "username": "sa",
            "password": "",
            "bounds": { "min_connections": 1, "max_connections": 1 }
        });
        let request: OnboardTenantRequest = serde_json::from_value(body).unwrap();

        let outcome = onboarder.onboard_request(&request).await.unwrap();
        assert_eq!(outcome.tenant, key("CLIENT_E"));
        let pool = onboarder.registry.get(&key("client-e")).unwrap();
        assert_eq!(pool.bounds().max_connections, 1);
    }

    fn assert_send<T: Send>(_: T) {}

    #[tokio::test]
    async fn test_onboarding_runs_on_a_spawned_task() {
        let onboarder = Arc::new(onboarder(canonical()).await);
        let request: OnboardTenantRequest = serde_json::from_value(serde_json::json!({
            "tenant_id": "client-g",
            "address": sqlite_params().address,
            "username": "sa",
        }))
        .unwrap();
        assert_send(onboarder.onboard_request(&request));

        let task = {
            let onboarder = onboarder.clone();
            tokio::spawn(async move { onboarder.onboard_request(&request).await.map(|o| o.tenant) })
        };
        assert_eq!(task.await.unwrap().unwrap(), key("client-g"));
        assert!(onboarder.registry.contains(&key("client-g")));
    }

    #[tokio::test]
    async fn test_unreachable_database_never_leaks_password() {
        let onboarder = onboarder(canonical()).await;
        let params = ConnectionParams::new("postgres://127.0.0.1:1/client_f", "app", "hunter2");

        let err = onboarder.onboard("client-f", &params).await.unwrap_err();
        assert!(matches!(err, TenantError::Connection(_)));
        assert!(!err.to_string().contains("hunter2"));
        assert!(!onboarder.registry.contains(&key("client-f")));
    }
}
