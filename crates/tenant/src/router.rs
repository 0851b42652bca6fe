use crate::context::RoutingContext;
use multidb_database::{ConnectionPoolRegistry, TenantPool};
use multidb_models::TenantKey;
use serde::Serialize;
use std::sync::Arc;

/// Why a unit of work was sent to the default tenant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackReason {
    /// No tenant was bound in the routing context
    NoContext,
    /// The bound tenant has no registered pool
    UnknownTenant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RouteDecision {
    pub requested: Option<TenantKey>,
    pub key: TenantKey,
    pub fallback: Option<FallbackReason>,
}

#[derive(Debug, Clone)]
pub struct Routed {
    pub decision: RouteDecision,
    pub pool: Arc<TenantPool>,
}

/// Resolves the calling task's routing context into a connection pool
#[derive(Clone)]
pub struct TenantRouter {
    registry: Arc<ConnectionPoolRegistry>,
}

impl TenantRouter {
    pub fn new(registry: Arc<ConnectionPoolRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<ConnectionPoolRegistry> {
        &self.registry
    }

    /// Pool the current unit of work should use
    pub fn current_pool(&self) -> Arc<TenantPool> {
        self.route().pool
    }

    pub fn route(&self) -> Routed {
        let requested = RoutingContext::get();
        let registered = requested.as_ref().and_then(|key| self.registry.get(key));

        let (pool, fallback) = match (&requested, registered) {
            (_, Some(pool)) => (pool, None),
            (None, None) => {
                tracing::warn!(
                    "Routing fallback: no tenant in context, using {}",
                    self.registry.default_key()
                );
                (self.registry.default_pool(), Some(FallbackReason::NoContext))
            }
            (Some(key), None) => {
                tracing::warn!(
                    "Routing fallback: tenant {} is not registered, using {}",
                    key,
                    self.registry.default_key()
                );
                (
                    self.registry.default_pool(),
                    Some(FallbackReason::UnknownTenant),
                )
            }
        };

        Routed {
            decision: RouteDecision {
                requested,
                key: pool.key().clone(),
                fallback,
            },
            pool,
        }
    }
}
