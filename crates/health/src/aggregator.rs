//! Health aggregation.
//!
//! Four independent probes, each computed fresh on every call:
//! - connectivity: open and validate one connection per tenant
//! - migrations: compare every tenant's history with the canonical set
//! - routing: route a trivial read through the routing context to each tenant
//! - resources: process memory and thread count
//!
//! Probe failures are reported as data. No probe short-circuits another, and
//! every per-tenant query is bounded by the connect timeout.

use crate::resources::ResourceProbe;
use chrono::Utc;
use multidb_database::{ConnectionPoolRegistry, DatabaseError, MigrationOrchestrator, MigrationSet};
use multidb_models::{
    ConnectivityReport, DatabaseConnectivity, HealthReport, MigrationHealthReport,
    ResourceReport, RoutingReport, RoutingTest, TenantKey, TenantMigrationHealth,
};
use multidb_tenant::{RoutingContext, TenantRouter};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;

#[derive(Debug, Clone)]
pub struct HealthConfig {
    pub connect_timeout: Duration,
    pub memory_threshold_pct: f64,
    /// Falls back to `MemTotal` when unset
    pub memory_ceiling_mb: Option<u64>,
    pub routing_probe_table: String,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            memory_threshold_pct: 90.0,
            memory_ceiling_mb: None,
            routing_probe_table: "posts".to_string(),
        }
    }
}

pub struct HealthAggregator {
    registry: Arc<ConnectionPoolRegistry>,
    router: TenantRouter,
    orchestrator: Arc<MigrationOrchestrator>,
    migrations: Arc<MigrationSet>,
    resources: ResourceProbe,
    config: HealthConfig,
}

impl HealthAggregator {
    pub fn new(
        registry: Arc<ConnectionPoolRegistry>,
        orchestrator: Arc<MigrationOrchestrator>,
        migrations: Arc<MigrationSet>,
        config: HealthConfig,
    ) -> Self {
        Self {
            router: TenantRouter::new(registry.clone()),
            registry,
            orchestrator,
            migrations,
            resources: ResourceProbe::new(config.memory_threshold_pct, config.memory_ceiling_mb),
            config,
        }
    }

    pub fn with_resource_probe(mut self, probe: ResourceProbe) -> Self {
        self.resources = probe;
        self
    }

    /// Composite report; healthy only when all four probes are
    pub async fn overall(&self) -> HealthReport {
        let (connectivity, migrations, routing, system) = tokio::join!(
            self.probe_connectivity(),
            self.probe_migrations(),
            self.probe_routing(),
            self.probe_resources(),
        );

        let report = HealthReport::assemble(
            connectivity,
            migrations,
            routing,
            system,
            Utc::now().timestamp_millis(),
        );

        if report.healthy {
            tracing::debug!("Health check passed for {} tenants", self.registry.len());
        } else {
            tracing::warn!("Health check failed: {}", report.issues.join("; "));
        }
        report
    }

    pub async fn probe_connectivity(&self) -> ConnectivityReport {
        let timeout = self.config.connect_timeout;
        let mut probes = JoinSet::new();
        for (key, pool) in self.registry.entries() {
            probes.spawn(async move {
                let started = Instant::now();
                let result = pool.ping(timeout).await;
                let latency_ms = started.elapsed().as_millis() as u64;

                let connectivity = match result {
                    Ok(info) => DatabaseConnectivity {
                        connected: true,
                        address: pool.address().to_string(),
                        backend: Some(info.backend),
                        server_version: info.version,
                        latency_ms,
                        error: None,
                    },
                    Err(e) => {
                        tracing::warn!("Database {} connection failed: {}", key, e);
                        DatabaseConnectivity {
                            connected: false,
                            address: pool.address().to_string(),
                            backend: None,
                            server_version: None,
                            latency_ms,
                            error: Some(e.to_string()),
                        }
                    }
                };
                (key, connectivity)
            });
        }

        let mut databases = BTreeMap::new();
        while let Some(joined) = probes.join_next().await {
            match joined {
                Ok((key, connectivity)) => {
                    databases.insert(key, connectivity);
                }
                Err(e) => tracing::error!("Connectivity probe task failed: {}", e),
            }
        }

        let failed = failed_keys(&databases, |db| !db.connected);
        ConnectivityReport {
            healthy: failed.is_empty() && !databases.is_empty(),
            databases,
            failed,
            timestamp: Utc::now().timestamp_millis(),
        }
    }

    pub async fn probe_migrations(&self) -> MigrationHealthReport {
        let timeout = self.config.connect_timeout;
        let mut databases = BTreeMap::new();
        for (key, pool) in self.registry.entries() {
            let status =
                tokio::time::timeout(timeout, self.orchestrator.status(&pool, &self.migrations))
                    .await
                    .unwrap_or_else(|_| Err(timed_out(timeout)));

            let health = match status {
                Ok(status) => TenantMigrationHealth {
                    up_to_date: status.up_to_date,
                    status: Some(status),
                    error: None,
                },
                Err(e) => {
                    tracing::warn!("Could not read migration status of {}: {}", key, e);
                    TenantMigrationHealth {
                        up_to_date: false,
                        status: None,
                        error: Some(e.to_string()),
                    }
                }
            };
            databases.insert(key, health);
        }

        let failed = failed_keys(&databases, |db| !db.up_to_date);
        MigrationHealthReport {
            healthy: failed.is_empty(),
            canonical_version: self.migrations.latest_version(),
            databases,
            failed,
            timestamp: Utc::now().timestamp_millis(),
        }
    }

    pub async fn probe_routing(&self) -> RoutingReport {
        let mut tests = BTreeMap::new();
        for key in self.registry.keys() {
            let test = RoutingContext::with_tenant(key.clone(), self.route_probe(&key)).await;
            tests.insert(key, test);
        }

        let failed = failed_keys(&tests, |test| !test.success);
        RoutingReport {
            healthy: failed.is_empty(),
            tests,
            failed,
            timestamp: Utc::now().timestamp_millis(),
        }
    }

    pub async fn probe_resources(&self) -> ResourceReport {
        self.resources.sample()
    }

    async fn route_probe(&self, expected: &TenantKey) -> RoutingTest {
        let routed = self.router.route();
        let routed_to = Some(routed.decision.key.clone());

        if &routed.decision.key != expected {
            return RoutingTest {
                success: false,
                routed_to,
                row_count: None,
                message: format!("Routing to {} failed", expected),
                error: Some(format!(
                    "Context {} was routed to {}",
                    expected, routed.decision.key
                )),
            };
        }

        let timeout = self.config.connect_timeout;
        let count = tokio::time::timeout(timeout, routed.pool.row_count(&self.config.routing_probe_table))
            .await
            .unwrap_or_else(|_| Err(timed_out(timeout)));

        match count {
            Ok(count) => RoutingTest {
                success: true,
                routed_to,
                row_count: Some(count),
                message: format!("Routing to {} successful", expected),
                error: None,
            },
            Err(e) => {
                tracing::warn!("Routing probe for {} failed: {}", expected, e);
                RoutingTest {
                    success: false,
                    routed_to,
                    row_count: None,
                    message: format!("Routing to {} failed", expected),
                    error: Some(e.to_string()),
                }
            }
        }
    }
}

fn timed_out(timeout: Duration) -> DatabaseError {
    DatabaseError::Timeout(format!("Query did not finish within {:?}", timeout))
}

fn failed_keys<T>(entries: &BTreeMap<TenantKey, T>, failed: impl Fn(&T) -> bool) -> Vec<TenantKey> {
    entries
        .iter()
        .filter(|(_, entry)| failed(entry))
        .map(|(key, _)| key.clone())
        .collect()
}
