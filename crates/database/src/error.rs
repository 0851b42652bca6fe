use multidb_models::TenantKey;
use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, DatabaseError>;

#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("Database connection error: {0}")]
    ConnectionError(#[from] sqlx::Error),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Connection pool for tenant {tenant} exhausted after waiting {waited:?}")]
    PoolExhausted { tenant: TenantKey, waited: Duration },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Migration {version} failed for tenant {tenant}: {cause}")]
    Migration {
        tenant: TenantKey,
        version: i64,
        cause: String,
    },

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl DatabaseError {
    pub fn duplicate_tenant(key: &TenantKey) -> Self {
        Self::Configuration(format!("Tenant {} is already registered", key))
    }

    pub fn migration(tenant: &TenantKey, version: i64, cause: impl ToString) -> Self {
        Self::Migration {
            tenant: tenant.clone(),
            version,
            cause: cause.to_string(),
        }
    }

    /// Map an acquisition failure, turning pool timeouts into `PoolExhausted`
    pub fn from_acquire(tenant: &TenantKey, waited: Duration, err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::PoolTimedOut => Self::PoolExhausted {
                tenant: tenant.clone(),
                waited,
            },
            other => Self::ConnectionError(other),
        }
    }

    /// Whether the caller may reasonably retry the operation later
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::ConnectionError(_)
                | Self::ConnectionFailed(_)
                | Self::PoolExhausted { .. }
                | Self::Timeout(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_timeout_maps_to_exhausted() {
        let tenant = TenantKey::parse("client-a").unwrap();
        let err = DatabaseError::from_acquire(&tenant, Duration::from_secs(3), sqlx::Error::PoolTimedOut);
        assert!(matches!(err, DatabaseError::PoolExhausted { .. }));
        assert!(err.is_transient());
        assert!(err.to_string().contains("CLIENT_A"));

        let closed = DatabaseError::from_acquire(&tenant, Duration::from_secs(3), sqlx::Error::PoolClosed);
        assert!(matches!(closed, DatabaseError::ConnectionError(_)));
    }

    #[test]
    fn test_migration_error_message() {
        let tenant = TenantKey::parse("client-b").unwrap();
        let err = DatabaseError::migration(&tenant, 2, "syntax error");
        assert_eq!(err.to_string(), "Migration 2 failed for tenant CLIENT_B: syntax error");
        assert!(!err.is_transient());
    }
}
