// Core modules
pub mod tenant;
pub mod migration;
pub mod health;

// Re-export commonly used types
pub use tenant::{
    ConnectionParams, OnboardTenantRequest, PoolBounds, TenantKey, TenantKeyError,
    SUPPORTED_SCHEMES,
};
pub use migration::{MigrationRecord, MigrationStatus, PendingMigration};
pub use health::{
    ConnectivityReport, DatabaseConnectivity, HealthChecks, HealthReport, MemoryUsage,
    MigrationHealthReport, ResourceReport, RoutingReport, RoutingTest, TenantMigrationHealth,
};
