//! Message-bus publish invoker.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::errors::{Result, SchedulerError};
use crate::model::action::CONTENT_TYPE_JSON;

use super::ActionInvoker;

/// Envelope published to the bus. Carries the content type alongside the
/// raw payload so consumers can decode it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusEnvelope {
    pub correlation_id: String,
    pub content_type: String,
    pub payload: Vec<u8>,
}

/// Injected message-bus publisher.
#[async_trait]
pub trait MessageBusClient: Send + Sync {
    async fn publish(&self, envelope: BusEnvelope, topic: &str) -> anyhow::Result<()>;
}

pub struct BusInvoker {
    bus: Arc<dyn MessageBusClient>,
    topic: String,
    content_type: String,
    payload: Vec<u8>,
}

impl BusInvoker {
    pub fn build(
        bus: Arc<dyn MessageBusClient>,
        topic: &str,
        content_type: &str,
        payload: Vec<u8>,
    ) -> Result<Self> {
        if topic.trim().is_empty() {
            return Err(SchedulerError::ContractInvalid(
                "message bus topic is empty".to_string(),
            ));
        }
        let content_type = if content_type.is_empty() {
            CONTENT_TYPE_JSON.to_string()
        } else {
            content_type.to_string()
        };
        Ok(BusInvoker {
            bus,
            topic: topic.to_string(),
            content_type,
            payload,
        })
    }
}

#[async_trait]
impl ActionInvoker for BusInvoker {
    async fn invoke(&self, correlation_id: &str) -> anyhow::Result<String> {
        let envelope = BusEnvelope {
            correlation_id: correlation_id.to_string(),
            content_type: self.content_type.clone(),
            payload: self.payload.clone(),
        };
        self.bus.publish(envelope, &self.topic).await?;
        debug!(topic = %self.topic, correlation_id, "published action payload to message bus");
        Ok(format!("published to {}", self.topic))
    }
}

/// HTTP bridge to the platform message bus: POSTs the envelope to the bus
/// service's publish endpoint for the topic.
pub struct HttpMessageBus {
    client: reqwest::Client,
    base_url: String,
}

impl HttpMessageBus {
    pub fn new(client: reqwest::Client, base_url: &str) -> Self {
        HttpMessageBus {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl MessageBusClient for HttpMessageBus {
    async fn publish(&self, envelope: BusEnvelope, topic: &str) -> anyhow::Result<()> {
        let url = format!("{}/publish/{topic}", self.base_url);
        let resp = self.client.post(&url).json(&envelope).send().await?;
        let status = resp.status();
        if !status.is_success() {
            anyhow::bail!("bus publish to {url} returned {status}");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::invoke::test_support::RecordingBus;

    #[test]
    fn test_empty_topic_is_contract_invalid() {
        let bus = Arc::new(RecordingBus::default());
        let err = BusInvoker::build(bus, "  ", CONTENT_TYPE_JSON, vec![]).err().unwrap();
        assert!(matches!(err, SchedulerError::ContractInvalid(_)));
    }

    #[tokio::test]
    async fn test_publish_wraps_payload_in_envelope() {
        let bus = Arc::new(RecordingBus::default());
        let invoker = BusInvoker::build(
            bus.clone(),
            "edge/telemetry",
            "",
            b"{\"temp\": 20}".to_vec(),
        )
        .unwrap();

        invoker.invoke("corr-1").await.unwrap();

        let published = bus.published.lock().unwrap();
        assert_eq!(published.len(), 1);
        let (topic, envelope) = &published[0];
        assert_eq!(topic, "edge/telemetry");
        // Empty content type defaults to JSON.
        assert_eq!(envelope.content_type, CONTENT_TYPE_JSON);
        assert_eq!(envelope.correlation_id, "corr-1");
        assert_eq!(envelope.payload, b"{\"temp\": 20}");
    }

    #[tokio::test]
    async fn test_publish_failure_is_reported_not_panicked() {
        let bus = Arc::new(RecordingBus {
            fail: true,
            ..Default::default()
        });
        let invoker = BusInvoker::build(bus, "t", CONTENT_TYPE_JSON, vec![]).unwrap();
        assert!(invoker.invoke("corr-2").await.is_err());
    }
}
