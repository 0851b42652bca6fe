use crate::migration::MigrationStatus;
use crate::tenant::TenantKey;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Connectivity of every registered tenant database
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectivityReport {
    pub healthy: bool,
    pub databases: BTreeMap<TenantKey, DatabaseConnectivity>,
    /// Tenants that could not be reached
    pub failed: Vec<TenantKey>,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConnectivity {
    pub connected: bool,
    pub address: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_version: Option<String>,
    pub latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Migration currency of every registered tenant database
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationHealthReport {
    pub healthy: bool,
    pub canonical_version: Option<i64>,
    pub databases: BTreeMap<TenantKey, TenantMigrationHealth>,
    /// Tenants that are behind or whose status could not be read
    pub failed: Vec<TenantKey>,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantMigrationHealth {
    pub up_to_date: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<MigrationStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Outcome of routing a trivial read to every tenant
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingReport {
    pub healthy: bool,
    pub tests: BTreeMap<TenantKey, RoutingTest>,
    pub failed: Vec<TenantKey>,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingTest {
    pub success: bool,
    /// Tenant the router actually resolved
    pub routed_to: Option<TenantKey>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub row_count: Option<i64>,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Process resource pressure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceReport {
    pub healthy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory: Option<MemoryUsage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub threads: Option<u64>,
    pub threshold_pct: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MemoryUsage {
    pub used_mb: u64,
    pub ceiling_mb: u64,
    pub usage_pct: f64,
}

/// Pass/fail summary per sub-probe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthChecks {
    pub database: bool,
    pub migrations: bool,
    pub routing: bool,
    pub system: bool,
}

/// Composite health snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub status: String,
    pub timestamp: i64,
    pub checks: HealthChecks,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub issues: Vec<String>,
    pub connectivity: ConnectivityReport,
    pub migrations: MigrationHealthReport,
    pub routing: RoutingReport,
    pub system: ResourceReport,
}

impl HealthReport {
    pub fn assemble(
        connectivity: ConnectivityReport,
        migrations: MigrationHealthReport,
        routing: RoutingReport,
        system: ResourceReport,
        timestamp: i64,
    ) -> Self {
        let checks = HealthChecks {
            database: connectivity.healthy,
            migrations: migrations.healthy,
            routing: routing.healthy,
            system: system.healthy,
        };

        let mut issues = Vec::new();
        if !checks.database {
            issues.push(format!(
                "Database connectivity issues: {}",
                join_keys(&connectivity.failed)
            ));
        }
        if !checks.migrations {
            issues.push(format!(
                "Migration status issues: {}",
                join_keys(&migrations.failed)
            ));
        }
        if !checks.routing {
            issues.push(format!(
                "Database routing issues: {}",
                join_keys(&routing.failed)
            ));
        }
        if !checks.system {
            issues.push("System resource issues".to_string());
        }

        let healthy = issues.is_empty();
        Self {
            healthy,
            status: if healthy { "UP" } else { "DOWN" }.to_string(),
            timestamp,
            checks,
            issues,
            connectivity,
            migrations,
            routing,
            system,
        }
    }
}

fn join_keys(keys: &[TenantKey]) -> String {
    keys.iter()
        .map(TenantKey::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}
