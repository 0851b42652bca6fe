use crate::error::{DatabaseError, Result};
use multidb_models::{ConnectionParams, PoolBounds, TenantKey};
use serde::Serialize;
use sqlx::any::{AnyConnectOptions, AnyPoolOptions};
use sqlx::pool::PoolConnection;
use sqlx::{Any, AnyPool, Transaction};
use std::str::FromStr;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, MutexGuard};

/// Identification reported by a tenant database server
#[derive(Debug, Clone, Serialize)]
pub struct ServerInfo {
    pub backend: String,
    pub version: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub size: u32,
    pub idle: usize,
    pub max_connections: u32,
    pub closed: bool,
}

/// Bounded connection pool bound to one tenant database
pub struct TenantPool {
    key: TenantKey,
    pool: AnyPool,
    address: String,
    bounds: PoolBounds,
    /// Held for the whole duration of a migration run against this tenant
    migration_lock: Mutex<()>,
}

impl std::fmt::Debug for TenantPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TenantPool")
            .field("key", &self.key)
            .field("address", &self.address)
            .field("bounds", &self.bounds)
            .finish()
    }
}

impl TenantPool {
    /// Validate parameters, create the pool and open its first connection
    pub async fn connect(
        key: TenantKey,
        params: &ConnectionParams,
        bounds: &PoolBounds,
    ) -> Result<Self> {
        params
            .check()
            .map_err(|e| DatabaseError::Configuration(format!("Tenant {}: {}", key, e)))?;
        bounds
            .check()
            .map_err(|e| DatabaseError::Configuration(format!("Tenant {}: {}", key, e)))?;

        sqlx::any::install_default_drivers();

        let options = AnyConnectOptions::from_str(&connection_url(params)).map_err(|e| {
            DatabaseError::Configuration(format!(
                "Tenant {}: invalid database address {}: {}",
                key,
                params.redacted_address(),
                e
            ))
        })?;

        let pool = AnyPoolOptions::new()
            .max_connections(bounds.max_connections)
            .min_connections(bounds.min_connections)
            .acquire_timeout(bounds.acquire_timeout())
            .idle_timeout(bounds.idle_timeout())
            .connect_with(options)
            .await
            .map_err(|e| {
                DatabaseError::ConnectionFailed(format!(
                    "Failed to connect to tenant {} database: {}",
                    key, e
                ))
            })?;

        tracing::info!(
            "Created connection pool for tenant {} ({}, {}..{} connections)",
            key,
            params.redacted_address(),
            bounds.min_connections,
            bounds.max_connections
        );

        Ok(Self {
            key,
            pool,
            address: params.redacted_address(),
            bounds: bounds.clone(),
            migration_lock: Mutex::new(()),
        })
    }

    pub fn key(&self) -> &TenantKey {
        &self.key
    }

    /// Address with credentials masked
    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn bounds(&self) -> &PoolBounds {
        &self.bounds
    }

    /// Underlying sqlx pool for the persistence layer
    pub fn pool(&self) -> &AnyPool {
        &self.pool
    }

    /// Check out a connection, failing with `PoolExhausted` after the acquire timeout
    pub async fn acquire(&self) -> Result<PoolConnection<Any>> {
        let started = Instant::now();
        self.pool
            .acquire()
            .await
            .map_err(|e| DatabaseError::from_acquire(&self.key, started.elapsed(), e))
    }

    pub async fn begin(&self) -> Result<Transaction<'static, Any>> {
        let started = Instant::now();
        self.pool
            .begin()
            .await
            .map_err(|e| DatabaseError::from_acquire(&self.key, started.elapsed(), e))
    }

    /// Open and validate a connection within `timeout`
    pub async fn ping(&self, timeout: Duration) -> Result<ServerInfo> {
        let check = async {
            let mut conn = self.acquire().await?;
            let backend = conn.backend_name().to_string();
            let version_query = match backend.as_str() {
                "PostgreSQL" => Some("SELECT version()"),
                "SQLite" => Some("SELECT sqlite_version()"),
                _ => None,
            };
            let version = match version_query {
                Some(query) => Some(sqlx::query_scalar::<_, String>(query).fetch_one(&mut *conn).await?),
                None => {
                    sqlx::query("SELECT 1").execute(&mut *conn).await?;
                    None
                }
            };
            Ok::<_, DatabaseError>(ServerInfo { backend, version })
        };

        tokio::time::timeout(timeout, check).await.map_err(|_| {
            DatabaseError::Timeout(format!(
                "Connection check for tenant {} exceeded {:?}",
                self.key, timeout
            ))
        })?
    }

    /// Count rows in `table`, used as a trivial routed read
    pub async fn row_count(&self, table: &str) -> Result<i64> {
        check_table_name(table)?;

        let mut conn = self.acquire().await?;
        let count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", table))
            .fetch_one(&mut *conn)
            .await?;
        Ok(count)
    }

    /// Insert or overwrite the `(id, name)` row of `table`, used as a trivial routed write
    pub async fn upsert_row(&self, table: &str, id: i64, name: &str) -> Result<u64> {
        check_table_name(table)?;

        let mut conn = self.acquire().await?;
        let result = sqlx::query(&format!(
            "INSERT INTO {} (id, name) VALUES ($1, $2) \
             ON CONFLICT (id) DO UPDATE SET name = excluded.name",
            table
        ))
        .bind(id)
        .bind(name.to_string())
        .execute(&mut *conn)
        .await?;
        Ok(result.rows_affected())
    }

    /// Serialize migration runs against this tenant
    pub async fn lock_migrations(&self, timeout: Duration) -> Result<MutexGuard<'_, ()>> {
        tokio::time::timeout(timeout, self.migration_lock.lock())
            .await
            .map_err(|_| {
                DatabaseError::Timeout(format!(
                    "Waited {:?} for the migration lock of tenant {}",
                    timeout, self.key
                ))
            })
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            size: self.pool.size(),
            idle: self.pool.num_idle(),
            max_connections: self.bounds.max_connections,
            closed: self.pool.is_closed(),
        }
    }

    pub async fn close(&self) {
        self.pool.close().await;
        tracing::info!("Closed connection pool for tenant {}", self.key);
    }
}

fn check_table_name(table: &str) -> Result<()> {
    if table.is_empty()
        || !table
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
    {
        return Err(DatabaseError::Configuration(format!(
            "Invalid table name '{}'",
            table
        )));
    }
    Ok(())
}

/// Build the driver URL, injecting credentials into server addresses that carry none
fn connection_url(params: &ConnectionParams) -> String {
    let address = params.address.trim();
    match (params.scheme(), address.split_once("://")) {
        (Some("postgres" | "postgresql"), Some((scheme, rest))) => {
            let authority_end = rest.find('/').unwrap_or(rest.len());
            if rest[..authority_end].contains('@') {
                return address.to_string();
            }
            let credentials = if params.password.is_empty() {
                urlencoding::encode(&params.username).into_owned()
            } else {
                format!(
                    "{}:{}",
                    urlencoding::encode(&params.username),
                    urlencoding::encode(&params.password)
                )
            };
            format!("{}://{}@{}", scheme, credentials, rest)
        }
        _ => address.to_string(),
    }
}
