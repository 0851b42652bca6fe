use multidb_database::DatabaseError;
use multidb_models::TenantKey;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, TenantError>;

#[derive(Debug, Error)]
pub enum TenantError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Migration {version} failed for tenant {tenant}: {cause}")]
    Migration {
        tenant: TenantKey,
        version: i64,
        cause: String,
    },

    #[error("Connection error: {0}")]
    Connection(String),
}

impl From<DatabaseError> for TenantError {
    fn from(err: DatabaseError) -> Self {
        match err {
            DatabaseError::Configuration(msg) => Self::Configuration(msg),
            DatabaseError::Migration {
                tenant,
                version,
                cause,
            } => Self::Migration {
                tenant,
                version,
                cause,
            },
            other => Self::Connection(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RoutingError {
    #[error("Routing context accessed outside of a routing scope")]
    NoScope,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_database_errors_map_by_kind() {
        let tenant = TenantKey::parse("client-c").unwrap();
        let err: TenantError = DatabaseError::migration(&tenant, 3, "boom").into();
        assert!(matches!(err, TenantError::Migration { version: 3, .. }));

        let err: TenantError = DatabaseError::duplicate_tenant(&tenant).into();
        assert!(matches!(err, TenantError::Configuration(_)));

        let err: TenantError = DatabaseError::ConnectionFailed("refused".into()).into();
        assert!(matches!(err, TenantError::Connection(ref msg) if msg.contains("refused")));
    }
}
