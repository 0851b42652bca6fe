// multidb API Server
// Routes each request to its tenant database and onboards tenants at runtime

mod config;
mod handlers;
mod middleware;
mod routes;

use anyhow::Context;
use crate::config::Config;
use dotenvy::dotenv;
use multidb_database::{ConnectionPoolRegistry, MigrationOrchestrator, MigrationSet, TenantMigrationResult};
use multidb_health::{HealthAggregator, HealthConfig};
use multidb_models::PoolBounds;
use multidb_tenant::{TenantOnboarder, TenantRouter, TenantSelector};
use std::sync::Arc;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::EnvFilter;

pub struct AppState {
    pub registry: Arc<ConnectionPoolRegistry>,
    pub router: TenantRouter,
    pub selector: TenantSelector,
    pub onboarder: TenantOnboarder,
    pub health: HealthAggregator,
    /// Table read by `/tenant/current` and the routing probe
    pub probe_table: String,
}

impl AppState {
    pub fn new(
        registry: Arc<ConnectionPoolRegistry>,
        orchestrator: Arc<MigrationOrchestrator>,
        migrations: Arc<MigrationSet>,
        onboarding_bounds: PoolBounds,
        health_config: HealthConfig,
    ) -> Self {
        Self {
            router: TenantRouter::new(registry.clone()),
            selector: TenantSelector::new(registry.default_key().clone()),
            onboarder: TenantOnboarder::new(
                registry.clone(),
                orchestrator.clone(),
                migrations.clone(),
                onboarding_bounds,
            ),
            probe_table: health_config.routing_probe_table.clone(),
            health: HealthAggregator::new(registry.clone(), orchestrator, migrations, health_config),
            registry,
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,multidb_api=debug,tower_http=debug"));

    let json = std::env::var("MULTIDB_LOG_JSON")
        .map(|v| v.eq_ignore_ascii_case("true") || v == "1")
        .unwrap_or(false);

    if json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("🛑 Shutdown signal received");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenv().ok();

    init_tracing();

    tracing::info!("🚀 Starting multidb API Server");
    tracing::info!("📦 Version: {}", env!("CARGO_PKG_VERSION"));

    let config = Config::load()?;
    tracing::info!("🔌 Server: {}:{}", config.server.host, config.server.port);

    let migrations = Arc::new(MigrationSet::load_dir(&config.migrations_dir)?);

    // Connect static tenant databases, default first
    let default_key = config.default_key()?;
    let tenants = config.tenants()?;
    let (_, default_params, default_bounds) = tenants
        .iter()
        .find(|(key, _, _)| key == &default_key)
        .with_context(|| format!("Default tenant {} is not configured", default_key))?;

    tracing::info!("🗄️  Connecting to tenant databases...");
    let registry = Arc::new(
        ConnectionPoolRegistry::connect(default_key.clone(), default_params, default_bounds)
            .await
            .with_context(|| format!("Failed to connect default tenant {}", default_key))?,
    );
    for (key, params, bounds) in tenants.iter().filter(|(key, _, _)| key != &default_key) {
        registry
            .register(key.clone(), params, bounds)
            .await
            .with_context(|| format!("Failed to connect tenant {}", key))?;
    }
    tracing::info!("✅ {} tenant databases connected", registry.len());

    // Bring every tenant to the canonical schema; failures are reported, not fatal
    let orchestrator = Arc::new(MigrationOrchestrator::new(config.migration_config()));
    let summary = orchestrator.migrate_all(&registry, &migrations).await;
    for (key, result) in &summary.results {
        match result {
            TenantMigrationResult::Migrated {
                applied,
                current_version,
            } => tracing::info!(
                "Tenant {}: {} migrations applied, schema version {:?}",
                key,
                applied.len(),
                current_version
            ),
            TenantMigrationResult::Failed { version, cause } => tracing::error!(
                "Tenant {}: migration {:?} failed: {}",
                key,
                version,
                cause
            ),
        }
    }

    let state = Arc::new(AppState::new(
        registry.clone(),
        orchestrator,
        migrations,
        PoolBounds::default(),
        config.health_config(),
    ));

    let app = routes::create_router(state)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http());

    tracing::info!("📡 Routes configured:");
    tracing::info!("   GET  /health");
    tracing::info!("   GET  /health/databases");
    tracing::info!("   GET  /health/migrations");
    tracing::info!("   GET  /health/routing");
    tracing::info!("   GET  /health/system");
    tracing::info!("   GET  /tenant");
    tracing::info!("   GET  /tenant/current");
    tracing::info!("   POST /tenant/onboard");
    tracing::info!("   POST /init-data");

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    tracing::info!("✅ Server ready at http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    registry.close_all().await;
    tracing::info!("👋 Connection pools closed, bye");

    Ok(())
}
