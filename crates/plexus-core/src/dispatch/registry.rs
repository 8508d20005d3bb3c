//! Service registrations contributed by loaded extensions.

use super::service::ServiceName;
use crate::error::Result;
use crate::extension::CapabilityType;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, RwLock};
use tracing::debug;

/// Callable behind a service name.
#[async_trait]
pub trait ServiceHandler: Send + Sync + 'static {
    async fn call(&self, args: Value) -> Result<Value>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> ServiceHandler for FnHandler<F>
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value>> + Send + 'static,
{
    async fn call(&self, args: Value) -> Result<Value> {
        (self.0)(args).await
    }
}

/// Wrap an async closure as a handler.
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn ServiceHandler>
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

#[derive(Clone)]
pub struct ServiceRegistration {
    pub service: ServiceName,
    pub owner: String,
    pub handler: Arc<dyn ServiceHandler>,
}

impl std::fmt::Debug for ServiceRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceRegistration")
            .field("service", &self.service)
            .field("owner", &self.owner)
            .finish_non_exhaustive()
    }
}

#[derive(Default)]
struct Inner {
    handlers: HashMap<ServiceName, Vec<ServiceRegistration>>,
    providers: HashMap<CapabilityType, String>,
}

/// Registrations keyed by service name, in registration order, plus the
/// active provider per capability type.
#[derive(Default)]
pub struct ServiceRegistry {
    inner: RwLock<Inner>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, service: ServiceName, owner: &str, handler: Arc<dyn ServiceHandler>) {
        debug!("{} registered {}", owner, service);
        self.write()
            .handlers
            .entry(service)
            .or_default()
            .push(ServiceRegistration {
                service,
                owner: owner.to_string(),
                handler,
            });
    }

    /// Remove every registration made by `owner`. Returns how many were
    /// removed.
    pub fn remove_owner(&self, owner: &str) -> usize {
        let mut inner = self.write();
        let mut removed = 0;
        inner.handlers.retain(|_, regs| {
            let before = regs.len();
            regs.retain(|r| r.owner != owner);
            removed += before - regs.len();
            !regs.is_empty()
        });
        inner.providers.retain(|_, name| name != owner);
        removed
    }

    /// Registrations for `service`, in registration order.
    pub fn registrations(&self, service: ServiceName) -> Vec<ServiceRegistration> {
        self.read()
            .handlers
            .get(&service)
            .cloned()
            .unwrap_or_default()
    }

    /// Mark `owner` as the active provider for `capability`.
    pub fn set_provider(&self, capability: CapabilityType, owner: &str) {
        self.write().providers.insert(capability, owner.to_string());
    }

    pub fn provider(&self, capability: CapabilityType) -> Option<String> {
        self.read().providers.get(&capability).cloned()
    }

    pub fn clear(&self) {
        let mut inner = self.write();
        inner.handlers.clear();
        inner.providers.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.read().handlers.is_empty()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
