//! # Messaging
//!
//! [`CloudMachineServiceBus`] is the queue domain of the aggregate client.
//! It sends and receives [`BusMessage`]s through a [`MessageBus`] backend:
//! [`ServiceBusMessageBus`] for Azure Service Bus, or [`InMemoryMessageBus`]
//! for local runs and tests.

pub mod memory;
pub mod servicebus;

pub use memory::InMemoryMessageBus;
pub use servicebus::ServiceBusMessageBus;

use crate::common::{CloudMachineError, CloudMachineResult};
use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;

/// Queue used when the caller does not name one.
pub const DEFAULT_QUEUE: &str = "default";

/// A message body with its optional identifying properties.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BusMessage {
    pub body: Vec<u8>,
    pub message_id: Option<String>,
    pub content_type: Option<String>,
}

impl BusMessage {
    pub fn new(body: impl Into<Vec<u8>>) -> Self {
        Self {
            body: body.into(),
            ..Default::default()
        }
    }

    pub fn text(text: &str) -> Self {
        Self {
            content_type: Some("text/plain".to_string()),
            ..Self::new(text.as_bytes())
        }
    }

    /// Serializes `value` as the body and marks the message as JSON.
    pub fn json<T: Serialize>(value: &T) -> CloudMachineResult<Self> {
        Ok(Self {
            content_type: Some("application/json".to_string()),
            ..Self::new(serde_json::to_vec(value)?)
        })
    }

    pub fn with_message_id(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = Some(message_id.into());
        self
    }

    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn body_json<T: DeserializeOwned>(&self) -> CloudMachineResult<T> {
        Ok(serde_json::from_slice(&self.body)?)
    }
}

/// Queue transport behind [`CloudMachineServiceBus`].
#[async_trait]
pub trait MessageBus: Send + Sync {
    async fn send(&self, queue: &str, messages: Vec<BusMessage>) -> CloudMachineResult<()>;

    /// Receives and settles up to `max_count` messages, waiting at most
    /// `max_wait` for the first one. An empty result means nothing arrived.
    async fn receive(
        &self,
        queue: &str,
        max_count: u32,
        max_wait: Duration,
    ) -> CloudMachineResult<Vec<BusMessage>>;

    async fn close(&self) -> CloudMachineResult<()>;
}

/// Send/receive over named queues, defaulting to [`DEFAULT_QUEUE`].
pub struct CloudMachineServiceBus {
    bus: Arc<dyn MessageBus>,
}

impl CloudMachineServiceBus {
    pub fn new(bus: Arc<dyn MessageBus>) -> Self {
        Self { bus }
    }

    pub fn get_client(&self) -> Arc<dyn MessageBus> {
        Arc::clone(&self.bus)
    }

    /// Sends `messages` as one batch. Sending nothing is a no-op.
    pub async fn send(
        &self,
        queue: Option<&str>,
        messages: Vec<BusMessage>,
    ) -> CloudMachineResult<()> {
        if messages.is_empty() {
            return Ok(());
        }
        let queue = queue_name(queue);
        log::debug!("Sending {} message(s) to '{queue}'", messages.len());
        self.bus.send(queue, messages).await
    }

    pub async fn send_json<T: Serialize>(
        &self,
        queue: Option<&str>,
        value: &T,
    ) -> CloudMachineResult<()> {
        let message = BusMessage::json(value)?;
        self.send(queue, vec![message]).await
    }

    pub async fn receive(
        &self,
        queue: Option<&str>,
        max_count: u32,
        max_wait: Duration,
    ) -> CloudMachineResult<Vec<BusMessage>> {
        if max_count == 0 {
            return Err(CloudMachineError::InvalidQuery(
                "max_count must be at least 1".to_string(),
            ));
        }
        self.bus.receive(queue_name(queue), max_count, max_wait).await
    }

    pub async fn close(&self) -> CloudMachineResult<()> {
        self.bus.close().await?;
        log::info!("Messaging client closed");
        Ok(())
    }
}

fn queue_name(queue: Option<&str>) -> &str {
    queue.filter(|q| !q.is_empty()).unwrap_or(DEFAULT_QUEUE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};

    #[test]
    fn test_json_message() {
        let message = BusMessage::json(&json!({"order": 7})).unwrap();

        assert_eq!(message.content_type.as_deref(), Some("application/json"));
        assert_eq!(message.body_json::<Value>().unwrap()["order"], json!(7));
    }

    #[test]
    fn test_queue_name_defaults() {
        assert_eq!(queue_name(None), "default");
        assert_eq!(queue_name(Some("")), "default");
        assert_eq!(queue_name(Some("orders")), "orders");
    }

    #[tokio::test]
    async fn test_empty_send_is_a_no_op() {
        let bus = Arc::new(InMemoryMessageBus::new());
        let messaging = CloudMachineServiceBus::new(bus.clone());

        messaging.send(None, Vec::new()).await.unwrap();

        assert_eq!(bus.pending("default"), 0);
        assert_eq!(bus.send_calls(), 0);
    }
}
