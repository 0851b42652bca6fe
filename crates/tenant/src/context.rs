//! Per-task routing context.
//!
//! Each unit of work runs inside a scope that owns one slot holding the
//! tenant key its database operations target. The slot is task-local, so two
//! tasks never observe each other's binding even when they share a worker
//! thread, and it is destroyed when the scope ends, including on panic.

use crate::error::RoutingError;
use multidb_models::TenantKey;
use std::cell::RefCell;
use std::future::Future;

tokio::task_local! {
    static CURRENT_TENANT: RefCell<Option<TenantKey>>;
}

/// Accessors for the calling task's routing slot
pub struct RoutingContext;

impl RoutingContext {
    /// Run `fut` with an empty routing slot
    pub async fn scope<F: Future>(fut: F) -> F::Output {
        CURRENT_TENANT.scope(RefCell::new(None), fut).await
    }

    /// Run `fut` with the slot already bound to `key`
    pub async fn with_tenant<F: Future>(key: TenantKey, fut: F) -> F::Output {
        tracing::debug!("Routing context scoped to {}", key);
        CURRENT_TENANT.scope(RefCell::new(Some(key)), fut).await
    }

    /// Synchronous variant of [`RoutingContext::scope`]
    pub fn sync_scope<R>(key: Option<TenantKey>, f: impl FnOnce() -> R) -> R {
        CURRENT_TENANT.sync_scope(RefCell::new(key), f)
    }

    /// Bind `key`, replacing any previous binding
    pub fn set(key: TenantKey) -> Result<(), RoutingError> {
        CURRENT_TENANT
            .try_with(|slot| {
                tracing::debug!("Routing context set to {}", key);
                *slot.borrow_mut() = Some(key);
            })
            .map_err(|_| RoutingError::NoScope)
    }

    pub fn get() -> Option<TenantKey> {
        CURRENT_TENANT
            .try_with(|slot| slot.borrow().clone())
            .ok()
            .flatten()
    }

    /// Remove the binding. Idempotent, and a no-op outside a scope.
    pub fn clear() {
        let _ = CURRENT_TENANT.try_with(|slot| {
            if let Some(key) = slot.borrow_mut().take() {
                tracing::debug!("Routing context cleared (was {})", key);
            }
        });
    }

    /// Bind `key` until the returned guard is dropped, then restore the
    /// binding that was in place before
    pub fn enter(key: TenantKey) -> Result<RoutingGuard, RoutingError> {
        let previous = Self::get();
        Self::set(key)?;
        Ok(RoutingGuard { previous })
    }

    pub fn in_scope() -> bool {
        CURRENT_TENANT.try_with(|_| ()).is_ok()
    }
}

/// Restores the previous routing binding on drop
#[must_use = "the binding is reverted as soon as the guard is dropped"]
pub struct RoutingGuard {
    previous: Option<TenantKey>,
}

impl Drop for RoutingGuard {
    fn drop(&mut self) {
        match self.previous.take() {
            Some(key) => {
                let _ = RoutingContext::set(key);
            }
            None => RoutingContext::clear(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn key(s: &str) -> TenantKey {
        TenantKey::parse(s).unwrap()
    }

    #[test]
    fn test_outside_scope() {
        assert!(!RoutingContext::in_scope());
        assert_eq!(RoutingContext::get(), None);
        assert_eq!(RoutingContext::set(key("client-a")), Err(RoutingError::NoScope));
        RoutingContext::clear();
        assert!(RoutingContext::enter(key("client-a")).is_err());
    }

    #[tokio::test]
    async fn test_set_get_clear() {
        RoutingContext::scope(async {
            assert!(RoutingContext::in_scope());
            assert_eq!(RoutingContext::get(), None);

            RoutingContext::set(key("client-a")).unwrap();
            RoutingContext::set(key("client-b")).unwrap();
            assert_eq!(RoutingContext::get(), Some(key("CLIENT_B")));

            RoutingContext::clear();
            assert_eq!(RoutingContext::get(), None);
            RoutingContext::clear();
            assert_eq!(RoutingContext::get(), None);
        })
        .await;

        assert_eq!(RoutingContext::get(), None);
    }

    #[tokio::test]
    async fn test_with_tenant_binds_for_the_scope_only() {
        let seen = RoutingContext::with_tenant(key("client-a"), async {
            tokio::task::yield_now().await;
            RoutingContext::get()
        })
        .await;

        assert_eq!(seen, Some(key("client-a")));
        assert_eq!(RoutingContext::get(), None);
    }

    #[tokio::test]
    async fn test_guard_clears_on_drop() {
        RoutingContext::scope(async {
            {
                let _guard = RoutingContext::enter(key("client-b")).unwrap();
                assert_eq!(RoutingContext::get(), Some(key("client-b")));
            }
            assert_eq!(RoutingContext::get(), None);
        })
        .await;
    }

    #[tokio::test]
    async fn test_nested_guards_restore_outer_binding() {
        RoutingContext::scope(async {
            let outer = RoutingContext::enter(key("client-a")).unwrap();
            {
                let _inner = RoutingContext::enter(key("client-b")).unwrap();
                assert_eq!(RoutingContext::get(), Some(key("client-b")));
            }
            assert_eq!(RoutingContext::get(), Some(key("client-a")));
            drop(outer);
            assert_eq!(RoutingContext::get(), None);
        })
        .await;
    }

    #[test]
    fn test_panic_inside_scope_leaves_nothing_behind() {
        let result = std::panic::catch_unwind(|| {
            RoutingContext::sync_scope(Some(key("client-a")), || {
                assert_eq!(RoutingContext::get(), Some(key("client-a")));
                panic!("unit of work failed");
            })
        });

        assert!(result.is_err());
        assert_eq!(RoutingContext::get(), None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_tasks_are_isolated() {
        let handles: Vec<_> = (0..32)
            .map(|i| {
                let own = key(&format!("client-{}", i));
                tokio::spawn(RoutingContext::with_tenant(own.clone(), async move {
                    for _ in 0..20 {
                        tokio::task::yield_now().await;
                        assert_eq!(RoutingContext::get().as_ref(), Some(&own));
                    }
                    RoutingContext::clear();
                    RoutingContext::get().is_none()
                }))
            })
            .collect();

        for handle in handles {
            assert!(handle.await.unwrap());
        }
    }

    proptest! {
        #[test]
        fn prop_get_after_clear_is_none(token in "[a-z][a-z0-9_-]{0,30}", clears in 1usize..4) {
            let k = key(&token);
            RoutingContext::sync_scope(None, || {
                RoutingContext::set(k.clone()).unwrap();
                assert_eq!(RoutingContext::get(), Some(k));
                for _ in 0..clears {
                    RoutingContext::clear();
                    assert_eq!(RoutingContext::get(), None);
                }
            });
        }
    }
}
