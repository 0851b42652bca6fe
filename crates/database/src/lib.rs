pub mod connection;
pub mod error;
pub mod migration;
pub mod registry;

pub use connection::{PoolStats, ServerInfo, TenantPool};
pub use error::{DatabaseError, Result};
pub use migration::{
    compute_status, Migration, MigrationConfig, MigrationOrchestrator, MigrationOutcome,
    MigrationSet, MigrationSummary, TenantMigrationResult, BASELINE_DESCRIPTION, HISTORY_TABLE,
};
pub use registry::{ConnectionPoolRegistry, RegistryStats, TenantPoolSummary};
