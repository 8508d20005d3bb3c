//! Service dispatch.
//!
//! Maps a logical service name to the handler(s) registered by active
//! extensions. A missing provider is reported as
//! [`DispatchOutcome::Unavailable`], never as an error, so callers can render
//! a "not configured" state.

mod registry;
mod service;

pub use registry::{handler_fn, ServiceHandler, ServiceRegistration, ServiceRegistry};
pub use service::ServiceName;

use crate::error::Result;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, warn};

/// Result of a dispatched call.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    Completed(Value),
    Unavailable { service: ServiceName },
}

impl DispatchOutcome {
    pub fn is_unavailable(&self) -> bool {
        matches!(self, DispatchOutcome::Unavailable { .. })
    }

    /// The completed value, if any.
    pub fn value(self) -> Option<Value> {
        match self {
            DispatchOutcome::Completed(value) => Some(value),
            DispatchOutcome::Unavailable { .. } => None,
        }
    }

    /// Wire form: `{"status": "completed", "value": ...}` or
    /// `{"status": "unavailable", "service": ...}`.
    pub fn to_json(&self) -> Value {
        match self {
            DispatchOutcome::Completed(value) => json!({ "status": "completed", "value": value }),
            DispatchOutcome::Unavailable { service } => {
                json!({ "status": "unavailable", "service": service.as_str() })
            }
        }
    }
}

#[derive(Clone)]
pub struct Dispatcher {
    services: Arc<ServiceRegistry>,
}

impl Dispatcher {
    pub fn new(services: Arc<ServiceRegistry>) -> Self {
        Self { services }
    }

    pub fn services(&self) -> &Arc<ServiceRegistry> {
        &self.services
    }

    /// Invoke the single handler that serves `service`.
    ///
    /// Capability-scoped names go to the active provider of that capability;
    /// other names go to the first registration.
    pub async fn execute(&self, service: ServiceName, args: Value) -> Result<DispatchOutcome> {
        let registrations = self.services.registrations(service);

        let chosen = match service.capability() {
            Some(capability) => self
                .services
                .provider(capability)
                .and_then(|owner| registrations.into_iter().find(|r| r.owner == owner)),
            None => registrations.into_iter().next(),
        };

        let Some(registration) = chosen else {
            debug!("No provider for {}", service);
            return Ok(DispatchOutcome::Unavailable { service });
        };

        debug!("Dispatching {} to {}", service, registration.owner);
        let value = registration.handler.call(args).await?;
        Ok(DispatchOutcome::Completed(value))
    }

    /// Invoke every handler registered for `service`, one after the other in
    /// registration order, and settle with the first handler's result.
    pub async fn execute_serial(&self, service: ServiceName, args: Value) -> Result<DispatchOutcome> {
        let registrations = self.services.registrations(service);
        if registrations.is_empty() {
            debug!("No handlers for {}", service);
            return Ok(DispatchOutcome::Unavailable { service });
        }

        let mut first: Option<Result<Value>> = None;
        for registration in registrations {
            let result = registration.handler.call(args.clone()).await;
            if first.is_none() {
                first = Some(result);
            } else if let Err(e) = result {
                warn!(
                    "{} handler from {} failed after the first settled: {}",
                    service, registration.owner, e
                );
            }
        }

        match first {
            Some(result) => result.map(DispatchOutcome::Completed),
            None => Ok(DispatchOutcome::Unavailable { service }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PlexusError;
    use crate::extension::CapabilityType;
    use std::sync::Mutex;

    fn recording(log: Arc<Mutex<Vec<&'static str>>>, name: &'static str) -> Arc<dyn ServiceHandler> {
        handler_fn(move |_| {
            let log = log.clone();
            async move {
                log.lock().unwrap().push(name);
                Ok(json!(name))
            }
        })
    }

    #[tokio::test]
    async fn test_unregistered_service_is_unavailable() {
        let dispatcher = Dispatcher::new(Arc::new(ServiceRegistry::new()));
        let outcome = tokio::time::timeout(
            std::time::Duration::from_secs(1),
            dispatcher.execute(ServiceName::CreateConversation, json!({})),
        )
        .await
        .expect("must not hang")
        .unwrap();

        assert_eq!(
            outcome,
            DispatchOutcome::Unavailable {
                service: ServiceName::CreateConversation
            }
        );
        assert_eq!(
            outcome.to_json(),
            json!({"status": "unavailable", "service": "CreateConversation"})
        );
    }

    #[tokio::test]
    async fn test_capability_service_goes_to_active_provider() {
        let services = Arc::new(ServiceRegistry::new());
        let log = Arc::new(Mutex::new(Vec::new()));
        services.register(ServiceName::InferenceComplete, "a", recording(log.clone(), "a"));
        services.register(ServiceName::InferenceComplete, "b", recording(log.clone(), "b"));
        services.set_provider(CapabilityType::Inference, "b");

        let dispatcher = Dispatcher::new(services);
        let outcome = dispatcher
            .execute(ServiceName::InferenceComplete, json!({}))
            .await
            .unwrap();

        assert_eq!(outcome.value(), Some(json!("b")));
        assert_eq!(*log.lock().unwrap(), vec!["b"]);
    }

    #[tokio::test]
    async fn test_capability_service_without_provider_is_unavailable() {
        let services = Arc::new(ServiceRegistry::new());
        services.register(
            ServiceName::InferenceStatus,
            "dormant",
            handler_fn(|_| async { Ok(json!(true)) }),
        );

        let outcome = Dispatcher::new(services)
            .execute(ServiceName::InferenceStatus, json!({}))
            .await
            .unwrap();
        assert!(outcome.is_unavailable());
    }

    #[tokio::test]
    async fn test_download_service_uses_first_registration() {
        let services = Arc::new(ServiceRegistry::new());
        let log = Arc::new(Mutex::new(Vec::new()));
        services.register(ServiceName::DownloadStart, "first", recording(log.clone(), "first"));
        services.register(ServiceName::DownloadStart, "second", recording(log.clone(), "second"));

        let outcome = Dispatcher::new(services)
            .execute(ServiceName::DownloadStart, json!({}))
            .await
            .unwrap();
        assert_eq!(outcome.value(), Some(json!("first")));
    }

    #[tokio::test]
    async fn test_execute_serial_runs_in_registration_order() {
        let services = Arc::new(ServiceRegistry::new());
        let log = Arc::new(Mutex::new(Vec::new()));
        for name in ["A", "B", "C"] {
            services.register(ServiceName::AddMessage, name, recording(log.clone(), name));
        }

        let outcome = Dispatcher::new(services)
            .execute_serial(ServiceName::AddMessage, json!({}))
            .await
            .unwrap();

        assert_eq!(*log.lock().unwrap(), vec!["A", "B", "C"]);
        assert_eq!(outcome.value(), Some(json!("A")));
    }

    #[tokio::test]
    async fn test_execute_serial_later_failures_do_not_change_result() {
        let services = Arc::new(ServiceRegistry::new());
        services.register(
            ServiceName::AddMessage,
            "ok",
            handler_fn(|_| async { Ok(json!("stored")) }),
        );
        services.register(
            ServiceName::AddMessage,
            "broken",
            handler_fn(|_| async { Err(PlexusError::Other("disk full".into())) }),
        );

        let outcome = Dispatcher::new(services)
            .execute_serial(ServiceName::AddMessage, json!({}))
            .await
            .unwrap();
        assert_eq!(outcome.value(), Some(json!("stored")));
    }

    #[tokio::test]
    async fn test_handler_error_propagates() {
        let services = Arc::new(ServiceRegistry::new());
        services.register(
            ServiceName::DownloadAbort,
            "d",
            handler_fn(|_| async {
                Err(PlexusError::DownloadNotFound { key: "x".into() })
            }),
        );

        let err = Dispatcher::new(services)
            .execute(ServiceName::DownloadAbort, json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, PlexusError::DownloadNotFound { .. }));
    }
}
