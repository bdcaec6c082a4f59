//! Action invokers -- one executable strategy per action kind.
//!
//! Invokers are built at unit-construction time so that validation and real
//! scheduling exercise the same path: a malformed action fails here with a
//! contract error before anything is scheduled. Invocation failures never
//! escape the action boundary; they become the run's Failed record.

pub mod bus;
pub mod device;
pub mod rest;

use std::sync::Arc;

use async_trait::async_trait;

use crate::errors::Result;
use crate::model::{ActionKind, AuthMethod, ScheduleAction};

pub use bus::{BusEnvelope, HttpMessageBus, MessageBusClient};
pub use device::{CommandClient, HttpCommandClient};
pub use rest::{FileTokenProvider, NoopInjector};

/// One unit of schedulable work.
#[async_trait]
pub trait ActionInvoker: Send + Sync {
    async fn invoke(&self, correlation_id: &str) -> anyhow::Result<String>;
}

/// Attaches credentials to an outbound request.
pub trait AuthInjector: Send + Sync {
    fn inject(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder;
}

/// Produces a request-signing injector for a given auth method, or a no-op.
pub trait SecretProvider: Send + Sync {
    fn injector(&self, method: AuthMethod) -> Arc<dyn AuthInjector>;
}

/// Injected collaborator clients shared by every invoker.
#[derive(Clone)]
pub struct Clients {
    pub http: reqwest::Client,
    pub bus: Arc<dyn MessageBusClient>,
    pub command: Arc<dyn CommandClient>,
    pub secrets: Arc<dyn SecretProvider>,
}

/// Select and construct the strategy for one action. Dispatch is an
/// exhaustive match on the action kind.
pub fn build_invoker(
    action: &ScheduleAction,
    clients: &Clients,
) -> Result<Arc<dyn ActionInvoker>> {
    match &action.kind {
        ActionKind::Rest {
            address,
            method,
            auth,
        } => {
            let invoker = rest::RestInvoker::build(
                clients.http.clone(),
                address,
                method,
                &action.content_type,
                action.payload.clone(),
                clients.secrets.injector(*auth),
            )?;
            Ok(Arc::new(invoker))
        }
        ActionKind::MessageBus { topic } => {
            let invoker = bus::BusInvoker::build(
                clients.bus.clone(),
                topic,
                &action.content_type,
                action.payload.clone(),
            )?;
            Ok(Arc::new(invoker))
        }
        ActionKind::DeviceControl {
            device_name,
            source_name,
        } => {
            let invoker = device::DeviceInvoker::build(
                clients.command.clone(),
                device_name,
                source_name,
                &action.payload,
            )?;
            Ok(Arc::new(invoker))
        }
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::test_clients;
    use super::*;
    use crate::errors::SchedulerError;
    use crate::model::ScheduleAction;

    #[test]
    fn test_dispatch_rejects_bad_rest_method() {
        let (clients, _, _) = test_clients();
        let action = ScheduleAction::rest("http://x", "BREW");
        let err = build_invoker(&action, &clients).err().unwrap();
        assert!(matches!(err, SchedulerError::ContractInvalid(_)));
    }

    #[test]
    fn test_dispatch_builds_each_kind() {
        let (clients, _, _) = test_clients();

        assert!(build_invoker(&ScheduleAction::rest("http://x", "GET"), &clients).is_ok());

        let bus_action = ScheduleAction {
            id: String::new(),
            content_type: "application/json".to_string(),
            payload: b"{}".to_vec(),
            kind: ActionKind::MessageBus {
                topic: "edge/events".to_string(),
            },
        };
        assert!(build_invoker(&bus_action, &clients).is_ok());

        let device_action = ScheduleAction {
            id: String::new(),
            content_type: "application/json".to_string(),
            payload: b"{\"setpoint\": 21}".to_vec(),
            kind: ActionKind::DeviceControl {
                device_name: "thermostat".to_string(),
                source_name: "setpoint".to_string(),
            },
        };
        assert!(build_invoker(&device_action, &clients).is_ok());
    }
}
