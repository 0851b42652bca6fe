//! Versioned schema migrations for tenant databases.
//!
//! Every tenant database records applied migrations in a history table.
//! Migrations are applied in ascending version order, one transaction each,
//! and a run halts at the first failure. Earlier committed steps stay applied.
//!
//! A database that already holds tables but has no history table is
//! baselined: the baseline version is recorded as applied without running
//! anything, and only later migrations are applied on top of it.

use crate::connection::TenantPool;
use crate::error::{DatabaseError, Result};
use crate::registry::ConnectionPoolRegistry;
use chrono::{DateTime, Utc};
use multidb_models::{MigrationRecord, MigrationStatus, PendingMigration, TenantKey};
use serde::Serialize;
use sha2::{Digest, Sha256};
use sqlx::{AnyConnection, Row};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::time::Duration;

/// Table holding each tenant's migration history
pub const HISTORY_TABLE: &str = "schema_migrations";

/// Description of the history row written when a database is baselined
pub const BASELINE_DESCRIPTION: &str = "<< baseline >>";

/// One versioned schema change
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Migration {
    version: i64,
    description: String,
    sql: String,
    checksum: String,
}

impl Migration {
    pub fn new(version: i64, description: impl Into<String>, sql: impl Into<String>) -> Self {
        let sql = sql.into();
        let checksum = hex::encode(Sha256::digest(sql.as_bytes()));
        Self {
            version,
            description: description.into(),
            sql,
            checksum,
        }
    }

    pub fn version(&self) -> i64 {
        self.version
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn checksum(&self) -> &str {
        &self.checksum
    }
}

/// The canonical, strictly ascending list of migrations every tenant must have
#[derive(Debug, Clone, Default)]
pub struct MigrationSet {
    migrations: Vec<Migration>,
}

impl MigrationSet {
    pub fn new(mut migrations: Vec<Migration>) -> Result<Self> {
        migrations.sort_by_key(Migration::version);

        if let Some(bad) = migrations.iter().find(|m| m.version <= 0) {
            return Err(DatabaseError::Configuration(format!(
                "Migration version must be positive, got {}",
                bad.version
            )));
        }
        if let Some(pair) = migrations.windows(2).find(|w| w[0].version == w[1].version) {
            return Err(DatabaseError::Configuration(format!(
                "Duplicate migration version {}",
                pair[0].version
            )));
        }

        Ok(Self { migrations })
    }

    /// Load `V<version>__<description>.sql` files from a directory
    pub fn load_dir(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let entries = std::fs::read_dir(dir).map_err(|e| {
            DatabaseError::Configuration(format!(
                "Cannot read migrations directory {}: {}",
                dir.display(),
                e
            ))
        })?;

        let mut migrations = Vec::new();
        for entry in entries {
            let path = entry
                .map_err(|e| DatabaseError::Configuration(e.to_string()))?
                .path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("sql") {
                continue;
            }

            let file_name = path
                .file_name()
                .and_then(|name| name.to_str())
                .unwrap_or_default();
            let (version, description) = parse_file_name(file_name).ok_or_else(|| {
                DatabaseError::Configuration(format!(
                    "Migration file {} does not match V<version>__<description>.sql",
                    file_name
                ))
            })?;
            let sql = std::fs::read_to_string(&path).map_err(|e| {
                DatabaseError::Configuration(format!("Cannot read {}: {}", path.display(), e))
            })?;

            migrations.push(Migration::new(version, description, sql));
        }

        let set = Self::new(migrations)?;
        tracing::info!(
            "Loaded {} migrations from {} (latest version {:?})",
            set.len(),
            dir.display(),
            set.latest_version()
        );
        Ok(set)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Migration> {
        self.migrations.iter()
    }

    pub fn get(&self, version: i64) -> Option<&Migration> {
        self.migrations
            .binary_search_by_key(&version, Migration::version)
            .ok()
            .map(|idx| &self.migrations[idx])
    }

    pub fn latest_version(&self) -> Option<i64> {
        self.migrations.last().map(Migration::version)
    }

    pub fn len(&self) -> usize {
        self.migrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.migrations.is_empty()
    }
}

fn parse_file_name(file_name: &str) -> Option<(i64, String)> {
    let stem = file_name.strip_suffix(".sql")?;
    let rest = stem.strip_prefix('V').or_else(|| stem.strip_prefix('v'))?;
    let (version, description) = rest.split_once("__")?;
    let version = version.parse().ok()?;
    Some((version, description.replace('_', " ")))
}

fn is_baseline(record: &MigrationRecord) -> bool {
    record.description == BASELINE_DESCRIPTION
}

/// Versions at or below the baseline count as applied
fn baseline_version(history: &[MigrationRecord]) -> Option<i64> {
    history
        .iter()
        .filter(|record| is_baseline(record))
        .map(|record| record.version)
        .max()
}

/// Canonical migrations missing from `history`, in ascending order
fn pending_migrations<'a>(history: &[MigrationRecord], set: &'a MigrationSet) -> Vec<&'a Migration> {
    let applied: HashSet<i64> = history.iter().map(|record| record.version).collect();
    let floor = baseline_version(history).unwrap_or(0);

    set.iter()
        .filter(|m| m.version > floor && !applied.contains(&m.version))
        .collect()
}

/// Compare a tenant's history with the canonical set
pub fn compute_status(history: &[MigrationRecord], set: &MigrationSet) -> MigrationStatus {
    let pending: Vec<PendingMigration> = pending_migrations(history, set)
        .into_iter()
        .map(|m| PendingMigration {
            version: m.version,
            description: m.description.clone(),
        })
        .collect();

    let unknown_versions = history
        .iter()
        .filter(|record| !is_baseline(record) && set.get(record.version).is_none())
        .map(|record| record.version)
        .collect();

    let checksum_mismatches = history
        .iter()
        .filter(|record| !is_baseline(record))
        .filter(|record| {
            set.get(record.version)
                .map(|m| m.checksum != record.checksum)
                .unwrap_or(false)
        })
        .map(|record| record.version)
        .collect();

    MigrationStatus {
        up_to_date: pending.is_empty(),
        pending,
        current: history.iter().max_by_key(|record| record.version).cloned(),
        unknown_versions,
        checksum_mismatches,
    }
}

#[derive(Debug, Clone)]
pub struct MigrationConfig {
    /// How long a run waits for another run on the same tenant to finish
    pub lock_timeout: Duration,
    /// Upper bound for applying a single migration
    pub statement_timeout: Duration,
    /// Baseline databases that have tables but no history table
    pub baseline_on_migrate: bool,
    pub baseline_version: i64,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_secs(30),
            statement_timeout: Duration::from_secs(300),
            baseline_on_migrate: true,
            baseline_version: 1,
        }
    }
}

/// Result of a successful migration run
#[derive(Debug, Clone, Serialize)]
pub struct MigrationOutcome {
    pub tenant: TenantKey,
    /// Migrations applied by this run, in the order they were applied
    pub applied: Vec<MigrationRecord>,
    pub current_version: Option<i64>,
}

impl MigrationOutcome {
    pub fn applied_versions(&self) -> Vec<i64> {
        self.applied.iter().map(|record| record.version).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TenantMigrationResult {
    Migrated {
        applied: Vec<i64>,
        current_version: Option<i64>,
    },
    Failed {
        version: Option<i64>,
        cause: String,
    },
}

/// Per-tenant results of `migrate_all`
#[derive(Debug, Clone, Default, Serialize)]
pub struct MigrationSummary {
    pub results: BTreeMap<TenantKey, TenantMigrationResult>,
}

impl MigrationSummary {
    pub fn is_success(&self) -> bool {
        self.failed().is_empty()
    }

    pub fn failed(&self) -> Vec<&TenantKey> {
        self.results
            .iter()
            .filter(|(_, result)| matches!(result, TenantMigrationResult::Failed { .. }))
            .map(|(key, _)| key)
            .collect()
    }
}

#[derive(Debug, Clone, Default)]
pub struct MigrationOrchestrator {
    config: MigrationConfig,
}

impl MigrationOrchestrator {
    pub fn new(config: MigrationConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &MigrationConfig {
        &self.config
    }

    /// Bring one tenant up to date with `set`
    pub async fn migrate(&self, pool: &TenantPool, set: &MigrationSet) -> Result<MigrationOutcome> {
        let tenant = pool.key().clone();
        let _guard = pool.lock_migrations(self.config.lock_timeout).await?;

        let history = {
            let mut conn = pool.acquire().await?;
            let baseline = self.config.baseline_on_migrate
                && !history_table_exists(&mut conn).await?
                && has_user_tables(&mut conn).await?;
            ensure_history_table(&mut conn).await?;
            if baseline {
                write_baseline(&mut conn, self.config.baseline_version).await?;
                tracing::info!(
                    "Baselined existing database {} at version {}",
                    tenant,
                    self.config.baseline_version
                );
            }
            read_history(&mut conn).await?
        };

        let status = compute_status(&history, set);
        if let Some(version) = status.checksum_mismatches.first() {
            return Err(DatabaseError::migration(
                &tenant,
                *version,
                "checksum mismatch between applied and canonical migration",
            ));
        }

        let pending = pending_migrations(&history, set);
        let mut current_version = history.iter().map(|record| record.version).max();

        // Never apply below what the tenant already has
        if let (Some(first), Some(latest)) = (pending.first(), current_version) {
            if first.version < latest {
                tracing::error!(
                    "Migration {} for database {} is out of order (applied version {})",
                    first.version,
                    tenant,
                    latest
                );
                return Err(DatabaseError::migration(
                    &tenant,
                    first.version,
                    format!("out of order: version {} is already applied", latest),
                ));
            }
        }

        if pending.is_empty() {
            tracing::info!("Database {} is already up to date", tenant);
            return Ok(MigrationOutcome {
                tenant,
                applied: Vec::new(),
                current_version,
            });
        }

        tracing::info!(
            "Applying {} pending migrations to database {}",
            pending.len(),
            tenant
        );

        let mut applied = Vec::with_capacity(pending.len());
        for migration in pending {
            let result =
                tokio::time::timeout(self.config.statement_timeout, apply(pool, migration)).await;

            let record = match result {
                Ok(Ok(record)) => record,
                Ok(Err(e)) => {
                    tracing::error!(
                        "Migration {} failed for database {} after {} applied: {}",
                        migration.version,
                        tenant,
                        applied.len(),
                        e
                    );
                    return Err(DatabaseError::migration(&tenant, migration.version, e));
                }
                Err(_) => {
                    tracing::error!(
                        "Migration {} timed out for database {}",
                        migration.version,
                        tenant
                    );
                    return Err(DatabaseError::migration(
                        &tenant,
                        migration.version,
                        format!("timed out after {:?}", self.config.statement_timeout),
                    ));
                }
            };

            tracing::info!(
                "Applied migration {} - {} to database {}",
                record.version,
                record.description,
                tenant
            );
            current_version = current_version.max(Some(record.version));
            applied.push(record);
        }

        Ok(MigrationOutcome {
            tenant,
            applied,
            current_version,
        })
    }

    /// Migrate every registered tenant; one tenant's failure never stops the rest
    pub async fn migrate_all(
        &self,
        registry: &ConnectionPoolRegistry,
        set: &MigrationSet,
    ) -> MigrationSummary {
        tracing::info!("Starting migrations for all tenant databases...");

        let mut summary = MigrationSummary::default();
        for (key, pool) in registry.entries() {
            let result = match self.migrate(&pool, set).await {
                Ok(outcome) => TenantMigrationResult::Migrated {
                    applied: outcome.applied_versions(),
                    current_version: outcome.current_version,
                },
                Err(DatabaseError::Migration { version, cause, .. }) => {
                    TenantMigrationResult::Failed {
                        version: Some(version),
                        cause,
                    }
                }
                Err(e) => {
                    tracing::error!("Error running migrations for database {}: {}", key, e);
                    TenantMigrationResult::Failed {
                        version: None,
                        cause: e.to_string(),
                    }
                }
            };
            summary.results.insert(key, result);
        }

        tracing::info!(
            "Completed migrations for {} tenant databases ({} failed)",
            summary.results.len(),
            summary.failed().len()
        );
        summary
    }

    /// Read-only comparison of a tenant's history with `set`
    pub async fn status(&self, pool: &TenantPool, set: &MigrationSet) -> Result<MigrationStatus> {
        let mut conn = pool.acquire().await?;
        let history = if history_table_exists(&mut conn).await? {
            read_history(&mut conn).await?
        } else {
            Vec::new()
        };
        Ok(compute_status(&history, set))
    }

    /// Applied migrations of a tenant in version order
    pub async fn history(&self, pool: &TenantPool) -> Result<Vec<MigrationRecord>> {
        let mut conn = pool.acquire().await?;
        if !history_table_exists(&mut conn).await? {
            return Ok(Vec::new());
        }
        read_history(&mut conn).await
    }
}

async fn apply(pool: &TenantPool, migration: &Migration) -> Result<MigrationRecord> {
    let mut tx = pool.begin().await?;

    sqlx::Executor::execute(&mut *tx, sqlx::raw_sql(migration.sql())).await?;

    let record = MigrationRecord {
        version: migration.version,
        description: migration.description.clone(),
        checksum: migration.checksum.clone(),
        applied_at: Utc::now(),
    };
    sqlx::query(&format!(
        "INSERT INTO {} (version, description, checksum, applied_at) VALUES ($1, $2, $3, $4)",
        HISTORY_TABLE
    ))
    .bind(record.version)
    .bind(record.description.clone())
    .bind(record.checksum.clone())
    .bind(record.applied_at.to_rfc3339())
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(record)
}

async fn ensure_history_table(conn: &mut AnyConnection) -> Result<()> {
    let sql = format!(
        "CREATE TABLE IF NOT EXISTS {} (
            version BIGINT PRIMARY KEY,
            description TEXT NOT NULL,
            checksum TEXT NOT NULL,
            applied_at TEXT NOT NULL
        )",
        HISTORY_TABLE
    );
    sqlx::query(&sql).execute(&mut *conn).await?;
    Ok(())
}

async fn write_baseline(conn: &mut AnyConnection, version: i64) -> Result<()> {
    let sql = format!(
        "INSERT INTO {} (version, description, checksum, applied_at) VALUES ($1, $2, $3, $4)",
        HISTORY_TABLE
    );
    sqlx::query(&sql)
        .bind(version)
        .bind(BASELINE_DESCRIPTION.to_string())
        .bind(String::new())
        .bind(Utc::now().to_rfc3339())
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Whether the database holds any table besides the history table
async fn has_user_tables(conn: &mut AnyConnection) -> Result<bool> {
    let query = match conn.backend_name() {
        "PostgreSQL" => {
            "SELECT COUNT(*) FROM information_schema.tables \
             WHERE table_schema = current_schema() AND table_name::text <> $1"
        }
        "SQLite" => {
            "SELECT COUNT(*) FROM sqlite_master \
             WHERE type = 'table' AND name <> $1 AND name NOT LIKE 'sqlite_%'"
        }
        other => {
            return Err(DatabaseError::Configuration(format!(
                "Unsupported database backend {}",
                other
            )))
        }
    };

    let count: i64 = sqlx::query_scalar(query)
        .bind(HISTORY_TABLE)
        .fetch_one(&mut *conn)
        .await?;
    Ok(count > 0)
}

async fn history_table_exists(conn: &mut AnyConnection) -> Result<bool> {
    let query = match conn.backend_name() {
        "PostgreSQL" => {
            "SELECT COUNT(*) FROM information_schema.tables \
             WHERE table_schema = current_schema() AND table_name::text = $1"
        }
        "SQLite" => "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = $1",
        other => {
            return Err(DatabaseError::Configuration(format!(
                "Unsupported database backend {}",
                other
            )))
        }
    };

    let count: i64 = sqlx::query_scalar(query)
        .bind(HISTORY_TABLE)
        .fetch_one(&mut *conn)
        .await?;
    Ok(count > 0)
}

async fn read_history(conn: &mut AnyConnection) -> Result<Vec<MigrationRecord>> {
    let rows = sqlx::query(&format!(
        "SELECT version, description, checksum, applied_at FROM {} ORDER BY version",
        HISTORY_TABLE
    ))
    .fetch_all(&mut *conn)
    .await?;

    rows.iter()
        .map(|row| {
            let applied_at: String = row.try_get("applied_at")?;
            let applied_at = DateTime::parse_from_rfc3339(&applied_at)
                .map_err(|e| {
                    DatabaseError::Internal(format!("Invalid applied_at '{}': {}", applied_at, e))
                })?
                .with_timezone(&Utc);

            Ok(MigrationRecord {
                version: row.try_get("version")?,
                description: row.try_get("description")?,
                checksum: row.try_get("checksum")?,
                applied_at,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use multidb_models::{ConnectionParams, PoolBounds};
    use proptest::prelude::*;
    use std::sync::Arc;

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
            acquire_timeout_secs: 5,
            idle_timeout_secs: 600,
        }
    }

    fn key(s: &str) -> TenantKey {
        TenantKey::parse(s).unwrap()
    }

    async fn tenant_pool(name: &str) -> TenantPool {
        TenantPool::connect(key(name), &sqlite_params(), &single_connection())
            .await
            .unwrap()
    }

    fn posts() -> Migration {
        Migration::new(1, "create posts table", "CREATE TABLE posts (id BIGINT PRIMARY KEY, name TEXT NOT NULL);")
    }

    fn comments() -> Migration {
        Migration::new(2, "create comments table", "CREATE TABLE comments (id BIGINT PRIMARY KEY, post_id BIGINT NOT NULL, body TEXT);")
    }

    fn post_index() -> Migration {
        Migration::new(3, "index post names", "CREATE INDEX idx_posts_name ON posts (name);")
    }

    fn canonical() -> MigrationSet {
        MigrationSet::new(vec![post_index(), posts(), comments()]).unwrap()
    }

    async fn table_exists(pool: &TenantPool, table: &str) -> bool {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = $1")
            .bind(table.to_string())
            .fetch_one(pool.pool())
            .await
            .unwrap();
        count > 0
    }

    #[test]
    fn test_set_is_sorted_and_rejects_duplicates() {
        let set = canonical();
        let versions: Vec<i64> = set.iter().map(Migration::version).collect();
        assert_eq!(versions, vec![1, 2, 3]);
        assert_eq!(set.latest_version(), Some(3));
        assert_eq!(set.get(2).map(Migration::description), Some("create comments table"));
        assert!(set.get(4).is_none());

        assert!(matches!(
            MigrationSet::new(vec![posts(), posts()]),
            Err(DatabaseError::Configuration(_))
        ));
        assert!(MigrationSet::new(vec![Migration::new(0, "zero", "SELECT 1")]).is_err());
    }

    #[test]
    fn test_checksum_tracks_script_contents() {
        assert_eq!(posts().checksum(), posts().checksum());
        assert_ne!(posts().checksum(), Migration::new(1, "create posts table", "CREATE TABLE posts (id BIGINT);").checksum());
        assert_eq!(posts().checksum().len(), 64);
    }

    #[test]
    fn test_parse_file_name() {
        assert_eq!(
            parse_file_name("V1__create_posts_table.sql"),
            Some((1, "create posts table".to_string()))
        );
        assert_eq!(parse_file_name("V12__x.sql"), Some((12, "x".to_string())));
        assert_eq!(parse_file_name("create_posts.sql"), None);
        assert_eq!(parse_file_name("Vx__bad.sql"), None);
    }

    #[test]
    fn test_load_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("V2__create_comments.sql"), comments().sql()).unwrap();
        std::fs::write(dir.path().join("V1__create_posts.sql"), posts().sql()).unwrap();
        std::fs::write(dir.path().join("README.md"), "ignored").unwrap();

        let set = MigrationSet::load_dir(dir.path()).unwrap();
        let versions: Vec<i64> = set.iter().map(Migration::version).collect();
        assert_eq!(versions, vec![1, 2]);
        assert_eq!(set.get(1).unwrap().description(), "create posts");

        std::fs::write(dir.path().join("cleanup.sql"), "DROP TABLE x;").unwrap();
        assert!(MigrationSet::load_dir(dir.path()).is_err());
    }

    #[tokio::test]
    async fn test_migrate_is_idempotent() {
        let pool = tenant_pool("client-a").await;
        let orchestrator = MigrationOrchestrator::default();
        let set = canonical();

        let first = orchestrator.migrate(&pool, &set).await.unwrap();
        assert_eq!(first.applied_versions(), vec![1, 2, 3]);
        assert_eq!(first.current_version, Some(3));
        let history = orchestrator.history(&pool).await.unwrap();

        let second = orchestrator.migrate(&pool, &set).await.unwrap();
        assert!(second.applied.is_empty());
        assert_eq!(second.current_version, Some(3));
        assert_eq!(orchestrator.history(&pool).await.unwrap(), history);
        assert!(orchestrator.status(&pool, &set).await.unwrap().up_to_date);
    }

    #[tokio::test]
    async fn test_pending_reported_and_applied_in_order() {
        let pool = tenant_pool("client-a").await;
        let orchestrator = MigrationOrchestrator::default();
        let first_only = MigrationSet::new(vec![posts()]).unwrap();
        orchestrator.migrate(&pool, &first_only).await.unwrap();

        let status = orchestrator.status(&pool, &canonical()).await.unwrap();
        assert!(!status.up_to_date);
        assert_eq!(status.pending_versions(), vec![2, 3]);
        assert_eq!(status.current_version(), Some(1));

        let outcome = orchestrator.migrate(&pool, &canonical()).await.unwrap();
        assert_eq!(outcome.applied_versions(), vec![2, 3]);

        let history = orchestrator.history(&pool).await.unwrap();
        assert!(history[1].applied_at <= history[2].applied_at);
        assert_eq!(history.iter().map(|r| r.version).collect::<Vec<_>>(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_failure_halts_and_keeps_committed_steps() {
        let pool = tenant_pool("client-b").await;
        let orchestrator = MigrationOrchestrator::default();
        let set = MigrationSet::new(vec![
            posts(),
            Migration::new(2, "broken", "CREATE TABLE broken (id BIGINT PRIMARY KEY,"),
            post_index(),
        ])
        .unwrap();

        let err = orchestrator.migrate(&pool, &set).await.unwrap_err();
        match err {
            DatabaseError::Migration { tenant, version, .. } => {
                assert_eq!(tenant, key("client-b"));
                assert_eq!(version, 2);
            }
            other => panic!("unexpected error: {other}"),
        }

        let status = orchestrator.status(&pool, &set).await.unwrap();
        assert_eq!(status.current_version(), Some(1));
        assert_eq!(status.pending_versions(), vec![2, 3]);
        assert!(table_exists(&pool, "posts").await);
        assert!(!table_exists(&pool, "broken").await);
    }

    #[tokio::test]
    async fn test_checksum_drift_is_rejected() {
        let pool = tenant_pool("main").await;
        let orchestrator = MigrationOrchestrator::default();
        orchestrator
            .migrate(&pool, &MigrationSet::new(vec![posts()]).unwrap())
            .await
            .unwrap();

        let edited = MigrationSet::new(vec![
            Migration::new(1, "create posts table", "CREATE TABLE posts (id BIGINT PRIMARY KEY);"),
            comments(),
        ])
        .unwrap();

        let status = orchestrator.status(&pool, &edited).await.unwrap();
        assert_eq!(status.checksum_mismatches, vec![1]);

        let err = orchestrator.migrate(&pool, &edited).await.unwrap_err();
        assert!(matches!(err, DatabaseError::Migration { version: 1, .. }));
        assert!(!table_exists(&pool, "comments").await);
    }

    #[tokio::test]
    async fn test_status_does_not_create_history_table() {
        let pool = tenant_pool("client-c").await;
        let orchestrator = MigrationOrchestrator::default();

        let status = orchestrator.status(&pool, &canonical()).await.unwrap();
        assert!(!status.up_to_date);
        assert_eq!(status.pending_versions(), vec![1, 2, 3]);
        assert!(status.current.is_none());
        assert!(!table_exists(&pool, HISTORY_TABLE).await);
    }

    #[tokio::test]
    async fn test_migrate_all_isolates_tenant_failures() {
        let registry = ConnectionPoolRegistry::new(tenant_pool("main").await);
        registry
            .register(key("client-a"), &sqlite_params(), &single_connection())
            .await
            .unwrap();
        let client_b = registry
            .register(key("client-b"), &sqlite_params(), &single_connection())
            .await
            .unwrap();

        // CLIENT_B already has a conflicting table, so version 2 fails there.
        sqlx::raw_sql("CREATE TABLE comments (id BIGINT PRIMARY KEY);")
            .execute(client_b.pool())
            .await
            .unwrap();

        let orchestrator = MigrationOrchestrator::default();
        let set = canonical();
        let summary = orchestrator.migrate_all(&registry, &set).await;

        assert!(!summary.is_success());
        assert_eq!(summary.failed(), vec![&key("client-b")]);
        assert_eq!(
            summary.results[&key("client-a")],
            TenantMigrationResult::Migrated {
                applied: vec![1, 2, 3],
                current_version: Some(3)
            }
        );
        assert!(matches!(
            summary.results[&key("client-b")],
            TenantMigrationResult::Failed { version: Some(2), .. }
        ));

        let client_a = registry.get(&key("client-a")).unwrap();
        assert!(orchestrator.status(&client_a, &set).await.unwrap().up_to_date);
        assert!(orchestrator.status(&registry.default_pool(), &set).await.unwrap().up_to_date);
        assert_eq!(
            orchestrator.status(&client_b, &set).await.unwrap().pending_versions(),
            vec![2, 3]
        );
    }

    #[tokio::test]
    async fn test_concurrent_runs_on_one_tenant_are_serialized() {
        let pool = Arc::new(tenant_pool("client-a").await);
        let orchestrator = MigrationOrchestrator::default();
        let set = canonical();

        let (a, b) = tokio::join!(orchestrator.migrate(&pool, &set), orchestrator.migrate(&pool, &set));
        let mut applied = a.unwrap().applied_versions();
        applied.extend(b.unwrap().applied_versions());
        applied.sort();
        assert_eq!(applied, vec![1, 2, 3]);
        assert_eq!(orchestrator.history(&pool).await.unwrap().len(), 3);
    }

    fn assert_send<T: Send>(_: T) {}

    #[tokio::test]
    async fn test_migrate_future_is_send() {
        let pool = tenant_pool("client-a").await;
        let orchestrator = MigrationOrchestrator::default();
        let set = canonical();
        assert_send(orchestrator.migrate(&pool, &set));

        let pool = Arc::new(pool);
        let spawned = {
            let pool = pool.clone();
            tokio::spawn(async move { orchestrator.migrate(&pool, &set).await.map(|o| o.current_version) })
        };
        assert_eq!(spawned.await.unwrap().unwrap(), Some(3));
    }

    #[tokio::test]
    async fn test_version_below_applied_is_rejected() {
        let pool = tenant_pool("client-a").await;
        let orchestrator = MigrationOrchestrator::default();
        let gapped = MigrationSet::new(vec![posts(), post_index()]).unwrap();
        let outcome = orchestrator.migrate(&pool, &gapped).await.unwrap();
        assert_eq!(outcome.current_version, Some(3));

        let err = orchestrator.migrate(&pool, &canonical()).await.unwrap_err();
        match err {
            DatabaseError::Migration { version, cause, .. } => {
                assert_eq!(version, 2);
                assert!(cause.contains("out of order"), "{cause}");
            }
            other => panic!("unexpected error: {other}"),
        }

        let versions: Vec<i64> = orchestrator.history(&pool).await.unwrap().iter().map(|r| r.version).collect();
        assert_eq!(versions, vec![1, 3]);
        assert!(!table_exists(&pool, "comments").await);
    }

    #[tokio::test]
    async fn test_existing_schema_is_baselined() {
        let pool = tenant_pool("client-d").await;
        sqlx::raw_sql("CREATE TABLE posts (id BIGINT PRIMARY KEY, name TEXT NOT NULL);")
            .execute(pool.pool())
            .await
            .unwrap();

        let orchestrator = MigrationOrchestrator::default();
        let outcome = orchestrator.migrate(&pool, &canonical()).await.unwrap();
        assert_eq!(outcome.applied_versions(), vec![2, 3]);
        assert_eq!(outcome.current_version, Some(3));

        let history = orchestrator.history(&pool).await.unwrap();
        assert_eq!(history[0].version, 1);
        assert_eq!(history[0].description, BASELINE_DESCRIPTION);

        let status = orchestrator.status(&pool, &canonical()).await.unwrap();
        assert!(status.up_to_date);
        assert!(status.checksum_mismatches.is_empty());
        assert!(status.unknown_versions.is_empty());
        assert!(orchestrator.migrate(&pool, &canonical()).await.unwrap().applied.is_empty());
    }

    #[tokio::test]
    async fn test_baseline_disabled_runs_from_first_version() {
        let pool = tenant_pool("client-d").await;
        sqlx::raw_sql("CREATE TABLE posts (id BIGINT PRIMARY KEY, name TEXT NOT NULL);")
            .execute(pool.pool())
            .await
            .unwrap();

        let orchestrator = MigrationOrchestrator::new(MigrationConfig {
            baseline_on_migrate: false,
            ..Default::default()
        });
        let err = orchestrator.migrate(&pool, &canonical()).await.unwrap_err();
        assert!(matches!(err, DatabaseError::Migration { version: 1, .. }));
    }

    #[tokio::test]
    async fn test_empty_database_is_not_baselined() {
        let pool = tenant_pool("client-e").await;
        let outcome = MigrationOrchestrator::default()
            .migrate(&pool, &canonical())
            .await
            .unwrap();
        assert_eq!(outcome.applied_versions(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_busy_migration_lock_times_out() {
        let pool = tenant_pool("client-a").await;
        let _held = pool.lock_migrations(Duration::from_secs(1)).await.unwrap();

        let orchestrator = MigrationOrchestrator::new(MigrationConfig {
            lock_timeout: Duration::from_millis(50),
            ..Default::default()
        });
        let err = orchestrator.migrate(&pool, &canonical()).await.unwrap_err();
        assert!(matches!(err, DatabaseError::Timeout(_)), "{err}");
    }

    #[tokio::test]
    async fn test_slow_migration_times_out() {
        let pool = tenant_pool("client-b").await;
        let set = MigrationSet::new(vec![Migration::new(
            1,
            "slow",
            "WITH RECURSIVE c(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM c WHERE x < 20000000) SELECT COUNT(*) FROM c;",
        )])
        .unwrap();

        let orchestrator = MigrationOrchestrator::new(MigrationConfig {
            statement_timeout: Duration::from_millis(20),
            ..Default::default()
        });
        let err = orchestrator.migrate(&pool, &set).await.unwrap_err();
        match err {
            DatabaseError::Migration { version, cause, .. } => {
                assert_eq!(version, 1);
                assert!(cause.starts_with("timed out"), "{cause}");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    fn record(version: i64) -> MigrationRecord {
        let migration = canonical().get(version).cloned().unwrap_or_else(|| Migration::new(version, "extra", "SELECT 1"));
        MigrationRecord {
            version,
            description: migration.description().to_string(),
            checksum: migration.checksum().to_string(),
            applied_at: Utc::now(),
        }
    }

    #[test]
    fn test_compute_status_flags_unknown_versions() {
        let status = compute_status(&[record(1), record(9)], &canonical());
        assert_eq!(status.unknown_versions, vec![9]);
        assert_eq!(status.pending_versions(), vec![2, 3]);
        assert_eq!(status.current_version(), Some(9));
        assert!(status.checksum_mismatches.is_empty());
    }

    proptest! {
        #[test]
        fn prop_pending_is_ordered_complement(applied in proptest::collection::btree_set(1i64..=3, 0..=3)) {
            let history: Vec<MigrationRecord> = applied.iter().map(|v| record(*v)).collect();
            let status = compute_status(&history, &canonical());
            let pending = status.pending_versions();

            prop_assert!(pending.windows(2).all(|w| w[0] < w[1]));
            prop_assert!(pending.iter().all(|v| !applied.contains(v)));
            prop_assert_eq!(pending.len() + applied.len(), 3);
            prop_assert_eq!(status.up_to_date, applied.len() == 3);
        }
    }
}
