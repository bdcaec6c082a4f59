//! Device-control action invoker.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::debug;

use crate::errors::{Result, SchedulerError};

use super::ActionInvoker;

/// Injected device-command client.
#[async_trait]
pub trait CommandClient: Send + Sync {
    async fn issue_set_command(
        &self,
        device_name: &str,
        source_name: &str,
        settings: &Map<String, Value>,
        correlation_id: &str,
    ) -> anyhow::Result<String>;
}

pub struct DeviceInvoker {
    command: Arc<dyn CommandClient>,
    device_name: String,
    source_name: String,
    settings: Map<String, Value>,
}

impl DeviceInvoker {
    /// Device and source names are required; the payload must decode as a
    /// string-keyed map. All three are contract errors, caught by validation
    /// before anything is scheduled.
    pub fn build(
        command: Arc<dyn CommandClient>,
        device_name: &str,
        source_name: &str,
        payload: &[u8],
    ) -> Result<Self> {
        if device_name.trim().is_empty() {
            return Err(SchedulerError::ContractInvalid(
                "device name is empty".to_string(),
            ));
        }
        if source_name.trim().is_empty() {
            return Err(SchedulerError::ContractInvalid(
                "source name is empty".to_string(),
            ));
        }

        let settings = if payload.is_empty() {
            Map::new()
        } else {
            serde_json::from_slice::<Map<String, Value>>(payload).map_err(|e| {
                SchedulerError::ContractInvalid(format!(
                    "device control payload is not a string-keyed map: {e}"
                ))
            })?
        };

        Ok(DeviceInvoker {
            command,
            device_name: device_name.to_string(),
            source_name: source_name.to_string(),
            settings,
        })
    }
}

#[async_trait]
impl ActionInvoker for DeviceInvoker {
    async fn invoke(&self, correlation_id: &str) -> anyhow::Result<String> {
        let response = self
            .command
            .issue_set_command(
                &self.device_name,
                &self.source_name,
                &self.settings,
                correlation_id,
            )
            .await?;
        debug!(
            device = %self.device_name,
            source = %self.source_name,
            correlation_id,
            "set command issued"
        );
        Ok(response)
    }
}

/// HTTP client for the device service's set-command endpoint.
pub struct HttpCommandClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpCommandClient {
    pub fn new(client: reqwest::Client, base_url: &str) -> Self {
        HttpCommandClient {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl CommandClient for HttpCommandClient {
    async fn issue_set_command(
        &self,
        device_name: &str,
        source_name: &str,
        settings: &Map<String, Value>,
        correlation_id: &str,
    ) -> anyhow::Result<String> {
        let url = format!("{}/device/name/{device_name}/{source_name}", self.base_url);
        let resp = self
            .client
            .put(&url)
            .header("X-Correlation-ID", correlation_id)
            .json(settings)
            .send()
            .await?;
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            anyhow::bail!("set command to {url} returned {status}: {body}");
        }
        Ok(body)
    }
}
