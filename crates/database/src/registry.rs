//! Connection Pool Registry
//!
//! Owns one bounded pool per tenant database plus the default pool that
//! unrouted work falls back to.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                ConnectionPoolRegistry                │
//! │  ┌────────────────────────────────────────────────┐  │
//! │  │  Default pool (MAIN)  <- absent / unknown key  │  │
//! │  └────────────────────────────────────────────────┘  │
//! │  ┌──────────┐  ┌──────────┐  ┌──────────┐            │
//! │  │ CLIENT_A │  │ CLIENT_B │  │ CLIENT_C │  ...       │
//! │  │ (static) │  │ (static) │  │(onboarded)│           │
//! │  └──────────┘  └──────────┘  └──────────┘            │
//! └──────────────────────────────────────────────────────┘
//! ```
//!
//! Entries are insert-only: a registered pool is never replaced or mutated.

use crate::connection::{PoolStats, TenantPool};
use crate::error::{DatabaseError, Result};
use multidb_models::{ConnectionParams, PoolBounds, TenantKey};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock};

pub struct ConnectionPoolRegistry {
    default_key: TenantKey,
    default_pool: Arc<TenantPool>,
    pools: RwLock<HashMap<TenantKey, Arc<TenantPool>>>,
}

impl ConnectionPoolRegistry {
    /// Create a registry around an already connected default pool
    pub fn new(default_pool: TenantPool) -> Self {
        let default_key = default_pool.key().clone();
        let default_pool = Arc::new(default_pool);
        let mut pools = HashMap::new();
        pools.insert(default_key.clone(), default_pool.clone());

        Self {
            default_key,
            default_pool,
            pools: RwLock::new(pools),
        }
    }

    /// Connect the default tenant and build the registry around it
    pub async fn connect(
        default_key: TenantKey,
        params: &ConnectionParams,
        bounds: &PoolBounds,
    ) -> Result<Self> {
        let pool = TenantPool::connect(default_key, params, bounds).await?;
        Ok(Self::new(pool))
    }

    /// Create, warm and register a pool for `key`
    pub async fn register(
        &self,
        key: TenantKey,
        params: &ConnectionParams,
        bounds: &PoolBounds,
    ) -> Result<Arc<TenantPool>> {
        if self.contains(&key) {
            return Err(DatabaseError::duplicate_tenant(&key));
        }

        let pool = Arc::new(TenantPool::connect(key.clone(), params, bounds).await?);

        // Another registration may have won while this pool was connecting.
        let raced = {
            let mut pools = self.pools.write().unwrap_or_else(PoisonError::into_inner);
            if pools.contains_key(&key) {
                true
            } else {
                pools.insert(key.clone(), pool.clone());
                false
            }
        };
        if raced {
            pool.close().await;
            return Err(DatabaseError::duplicate_tenant(&key));
        }

        tracing::info!("Registered tenant {} ({})", key, pool.address());
        Ok(pool)
    }

    /// Pool for `key`, or the default pool when the key is absent or unknown
    pub fn resolve(&self, key: Option<&TenantKey>) -> Arc<TenantPool> {
        key.and_then(|k| self.get(k))
            .unwrap_or_else(|| self.default_pool.clone())
    }

    pub fn get(&self, key: &TenantKey) -> Option<Arc<TenantPool>> {
        self.pools
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    pub fn contains(&self, key: &TenantKey) -> bool {
        self.pools
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(key)
    }

    pub fn default_key(&self) -> &TenantKey {
        &self.default_key
    }

    pub fn default_pool(&self) -> Arc<TenantPool> {
        self.default_pool.clone()
    }

    /// Registered keys in sorted order
    pub fn keys(&self) -> Vec<TenantKey> {
        let mut keys: Vec<TenantKey> = self
            .pools
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        keys.sort();
        keys
    }

    /// Snapshot of all entries, sorted by key
    pub fn entries(&self) -> Vec<(TenantKey, Arc<TenantPool>)> {
        let mut entries: Vec<(TenantKey, Arc<TenantPool>)> = self
            .pools
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(key, pool)| (key.clone(), pool.clone()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    pub fn len(&self) -> usize {
        self.pools
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get registry statistics
    pub fn stats(&self) -> RegistryStats {
        let tenants = self
            .entries()
            .into_iter()
            .map(|(key, pool)| {
                let stats = TenantPoolSummary {
                    address: pool.address().to_string(),
                    pool: pool.stats(),
                };
                (key, stats)
            })
            .collect();

        RegistryStats {
            default_tenant: self.default_key.clone(),
            registered_tenants: self.len(),
            tenants,
        }
    }

    /// Close every pool, used on shutdown
    pub async fn close_all(&self) {
        for (_, pool) in self.entries() {
            pool.close().await;
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TenantPoolSummary {
    pub address: String,
    pub pool: PoolStats,
}

/// Registry statistics
#[derive(Debug, Clone, Serialize)]
pub struct RegistryStats {
    pub default_tenant: TenantKey,
    pub registered_tenants: usize,
    pub tenants: BTreeMap<TenantKey, TenantPoolSummary>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

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

    fn key(s: &str) -> TenantKey {
        TenantKey::parse(s).unwrap()
    }

    async fn registry() -> ConnectionPoolRegistry {
        ConnectionPoolRegistry::connect(TenantKey::main(), &sqlite_params(), &PoolBounds::default())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_resolve_registered_and_default() {
        let registry = registry().await;
        let client_a = registry
            .register(key("client-a"), &sqlite_params(), &PoolBounds::default())
            .await
            .unwrap();

        assert!(Arc::ptr_eq(&registry.resolve(Some(&key("CLIENT_A"))), &client_a));
        assert!(Arc::ptr_eq(&registry.resolve(None), &registry.default_pool()));
        assert!(Arc::ptr_eq(
            &registry.resolve(Some(registry.default_key())),
            &registry.default_pool()
        ));
        assert_eq!(registry.keys(), vec![key("client-a"), TenantKey::main()]);
    }

    #[tokio::test]
    async fn test_register_rejects_duplicates_and_bad_params() {
        let registry = registry().await;
        registry
            .register(key("client-a"), &sqlite_params(), &PoolBounds::default())
            .await
            .unwrap();

        let dup = registry
            .register(key("client-a"), &sqlite_params(), &PoolBounds::default())
            .await
            .unwrap_err();
        assert!(matches!(dup, DatabaseError::Configuration(_)));

        let main_dup = registry
            .register(TenantKey::main(), &sqlite_params(), &PoolBounds::default())
            .await
            .unwrap_err();
        assert!(matches!(main_dup, DatabaseError::Configuration(_)));

        let bad = registry
            .register(key("client-b"), &ConnectionParams::new("", "", ""), &PoolBounds::default())
            .await
            .unwrap_err();
        assert!(matches!(bad, DatabaseError::Configuration(_)));
        assert!(!registry.contains(&key("client-b")));
        assert_eq!(registry.len(), 2);
    }

    #[tokio::test]
    async fn test_stats_lists_every_tenant() {
        let registry = registry().await;
        registry
            .register(key("client-b"), &sqlite_params(), &PoolBounds::default())
            .await
            .unwrap();

        let stats = registry.stats();
        assert_eq!(stats.default_tenant, TenantKey::main());
        assert_eq!(stats.registered_tenants, 2);
        assert!(stats.tenants.contains_key(&key("client-b")));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        #[test]
        fn prop_unregistered_keys_resolve_to_default(token in "[a-z][a-z0-9_]{0,20}") {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            runtime.block_on(async {
                let registry = registry().await;
                let k = key(&token);
                prop_assume!(k != TenantKey::main());
                prop_assert!(Arc::ptr_eq(&registry.resolve(Some(&k)), &registry.default_pool()));
                Ok(())
            })?;
        }
    }
}
