use anyhow::{bail, Context};
use config::{Environment, File};
use multidb_database::MigrationConfig;
use multidb_health::HealthConfig;
use multidb_models::{ConnectionParams, PoolBounds, TenantKey};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

const CONFIG_FILE_VAR: &str = "MULTIDB_CONFIG";
const DEFAULT_CONFIG_FILE: &str = "multidb.toml";

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default = "default_tenant")]
    pub default_tenant: String,
    #[serde(default = "default_migrations_dir")]
    pub migrations_dir: PathBuf,
    #[serde(default)]
    pub tenants: BTreeMap<String, TenantConfig>,
    #[serde(default)]
    pub health: HealthSettings,
    #[serde(default)]
    pub migration: MigrationSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Static tenant database.
///
/// Every field is optional here because one tenant may be spread over
/// several entries, e.g. `[tenants.client-a]` in the file and
/// `MULTIDB_TENANTS__CLIENT_A__PASSWORD` in the environment (`client_a`).
/// Entries are merged by canonical key before use.
#[derive(Clone, Default, Deserialize)]
pub struct TenantConfig {
    pub address: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub min_connections: Option<u32>,
    pub max_connections: Option<u32>,
    pub acquire_timeout_secs: Option<u64>,
    pub idle_timeout_secs: Option<u64>,
}

impl std::fmt::Debug for TenantConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let address = self
            .address
            .as_deref()
            .map(|address| ConnectionParams::new(address, "", "").redacted_address());
        f.debug_struct("TenantConfig")
            .field("address", &address)
            .field("username", &self.username)
            .field("bounds", &self.bounds())
            .finish()
    }
}

impl TenantConfig {
    /// Fields set in `over` win
    fn merge(self, over: TenantConfig) -> TenantConfig {
        TenantConfig {
            address: over.address.or(self.address),
            username: over.username.or(self.username),
            password: over.password.or(self.password),
            min_connections: over.min_connections.or(self.min_connections),
            max_connections: over.max_connections.or(self.max_connections),
            acquire_timeout_secs: over.acquire_timeout_secs.or(self.acquire_timeout_secs),
            idle_timeout_secs: over.idle_timeout_secs.or(self.idle_timeout_secs),
        }
    }

    pub fn params(&self, key: &TenantKey) -> anyhow::Result<ConnectionParams> {
        let address = self
            .address
            .as_deref()
            .with_context(|| format!("Tenant {}: missing address", key))?;
        let username = self
            .username
            .as_deref()
            .with_context(|| format!("Tenant {}: missing username", key))?;
        Ok(ConnectionParams::new(
            address,
            username,
            self.password.as_deref().unwrap_or_default(),
        ))
    }

    pub fn bounds(&self) -> PoolBounds {
        let defaults = PoolBounds::default();
        PoolBounds {
            min_connections: self.min_connections.unwrap_or(defaults.min_connections),
            max_connections: self.max_connections.unwrap_or(defaults.max_connections),
            acquire_timeout_secs: self
                .acquire_timeout_secs
                .unwrap_or(defaults.acquire_timeout_secs),
            idle_timeout_secs: self.idle_timeout_secs.unwrap_or(defaults.idle_timeout_secs),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct HealthSettings {
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_memory_threshold_pct")]
    pub memory_threshold_pct: f64,
    pub memory_ceiling_mb: Option<u64>,
    #[serde(default = "default_routing_probe_table")]
    pub routing_probe_table: String,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout_secs(),
            memory_threshold_pct: default_memory_threshold_pct(),
            memory_ceiling_mb: None,
            routing_probe_table: default_routing_probe_table(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MigrationSettings {
    #[serde(default = "default_lock_timeout_secs")]
    pub lock_timeout_secs: u64,
    #[serde(default = "default_statement_timeout_secs")]
    pub statement_timeout_secs: u64,
    #[serde(default = "default_baseline_on_migrate")]
    pub baseline_on_migrate: bool,
    #[serde(default = "default_baseline_version")]
    pub baseline_version: i64,
}

impl Default for MigrationSettings {
    fn default() -> Self {
        Self {
            lock_timeout_secs: default_lock_timeout_secs(),
            statement_timeout_secs: default_statement_timeout_secs(),
            baseline_on_migrate: default_baseline_on_migrate(),
            baseline_version: default_baseline_version(),
        }
    }
}

fn default_tenant() -> String {
    TenantKey::MAIN.to_lowercase()
}

fn default_migrations_dir() -> PathBuf {
    PathBuf::from("migrations")
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_connect_timeout_secs() -> u64 {
    5
}

fn default_memory_threshold_pct() -> f64 {
    90.0
}

fn default_routing_probe_table() -> String {
    "posts".to_string()
}

fn default_lock_timeout_secs() -> u64 {
    30
}

fn default_statement_timeout_secs() -> u64 {
    300
}

fn default_baseline_on_migrate() -> bool {
    true
}

fn default_baseline_version() -> i64 {
    1
}

fn environment() -> Environment {
    // MULTIDB_SERVER__PORT=9090, MULTIDB_TENANTS__CLIENT_A__ADDRESS=...
    Environment::with_prefix("MULTIDB")
        .prefix_separator("_")
        .separator("__")
        .try_parsing(true)
}

impl Config {
    /// Load the optional config file, then environment overrides
    pub fn load() -> anyhow::Result<Self> {
        let path = std::env::var(CONFIG_FILE_VAR).unwrap_or_else(|_| DEFAULT_CONFIG_FILE.to_string());

        let config = config::Config::builder()
            .add_source(File::from(PathBuf::from(&path)).required(false))
            .add_source(environment())
            .build()
            .with_context(|| format!("Failed to load configuration from {}", path))?
            .try_deserialize::<Self>()
            .context("Invalid configuration")?;

        config.validate()?;
        Ok(config)
    }

    #[cfg(test)]
    fn from_toml(toml: &str, env: Option<std::collections::HashMap<String, String>>) -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .add_source(File::from_str(toml, config::FileFormat::Toml))
            .add_source(environment().source(env))
            .build()?
            .try_deserialize::<Self>()?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        let default_key = self.default_key()?;
        let tenants = self.tenants()?;

        if !tenants.iter().any(|(key, _, _)| key == &default_key) {
            bail!(
                "Default tenant {} has no entry under [tenants]",
                default_key
            );
        }

        for (key, params, bounds) in &tenants {
            params
                .check()
                .map_err(|e| anyhow::anyhow!("Tenant {}: {}", key, e))?;
            bounds
                .check()
                .map_err(|e| anyhow::anyhow!("Tenant {}: {}", key, e))?;
        }

        if self.migration.baseline_version <= 0 {
            bail!(
                "migration.baseline_version must be positive, got {}",
                self.migration.baseline_version
            );
        }

        if !(0.0..=100.0).contains(&self.health.memory_threshold_pct) {
            bail!(
                "health.memory_threshold_pct must be between 0 and 100, got {}",
                self.health.memory_threshold_pct
            );
        }

        Ok(())
    }

    pub fn default_key(&self) -> anyhow::Result<TenantKey> {
        TenantKey::parse(&self.default_tenant)
            .with_context(|| format!("Invalid default_tenant '{}'", self.default_tenant))
    }

    /// Static tenants keyed by their canonical TenantKey.
    ///
    /// The entry spelled like the environment would spell it (`client_a`)
    /// overrides the fields of any other spelling of the same tenant.
    pub fn tenants(&self) -> anyhow::Result<Vec<(TenantKey, ConnectionParams, PoolBounds)>> {
        let mut grouped: BTreeMap<TenantKey, (Option<TenantConfig>, Option<TenantConfig>)> =
            BTreeMap::new();
        for (name, tenant) in &self.tenants {
            let key = TenantKey::parse(name)
                .with_context(|| format!("Invalid tenant name '{}'", name))?;
            let env_spelling = key.as_str().to_lowercase() == *name;
            let (file, env) = grouped.entry(key.clone()).or_default();
            let slot = if env_spelling { env } else { file };
            if slot.is_some() {
                bail!("Tenant {} is configured more than once", key);
            }
            *slot = Some(tenant.clone());
        }

        grouped
            .into_iter()
            .map(|(key, (file, env))| {
                let tenant = file.unwrap_or_default().merge(env.unwrap_or_default());
                Ok((key.clone(), tenant.params(&key)?, tenant.bounds()))
            })
            .collect()
    }

    pub fn health_config(&self) -> HealthConfig {
        HealthConfig {
            connect_timeout: Duration::from_secs(self.health.connect_timeout_secs),
            memory_threshold_pct: self.health.memory_threshold_pct,
            memory_ceiling_mb: self.health.memory_ceiling_mb,
            routing_probe_table: self.health.routing_probe_table.clone(),
        }
    }

    pub fn migration_config(&self) -> MigrationConfig {
        MigrationConfig {
            lock_timeout: Duration::from_secs(self.migration.lock_timeout_secs),
            statement_timeout: Duration::from_secs(self.migration.statement_timeout_secs),
            baseline_on_migrate: self.migration.baseline_on_migrate,
            baseline_version: self.migration.baseline_version,
        }
    }
}
