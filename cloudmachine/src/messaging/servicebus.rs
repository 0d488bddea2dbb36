use super::{BusMessage, MessageBus};
use crate::common::{CloudMachineError, CloudMachineResult};
use async_trait::async_trait;
use azservicebus::core::BasicRetryPolicy;
use azservicebus::{
    ServiceBusClient, ServiceBusClientOptions, ServiceBusMessage, ServiceBusReceivedMessage,
    ServiceBusReceiver, ServiceBusReceiverOptions, ServiceBusSender, ServiceBusSenderOptions,
};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;

/// [`MessageBus`] over an AMQP connection to Azure Service Bus.
///
/// One sender and one receiver are opened per queue on first use and kept
/// until [`MessageBus::close`], which disposes every link and then the
/// connection.
pub struct ServiceBusMessageBus {
    client: Mutex<Option<ServiceBusClient<BasicRetryPolicy>>>,
    senders: Mutex<HashMap<String, ServiceBusSender>>,
    receivers: Mutex<HashMap<String, ServiceBusReceiver>>,
}

impl ServiceBusMessageBus {
    /// Opens a connection from a Service Bus connection string.
    pub async fn connect(connection_string: &str) -> CloudMachineResult<Self> {
        let client = ServiceBusClient::new_from_connection_string(
            connection_string,
            ServiceBusClientOptions::default(),
        )
        .await
        .map_err(|e| {
            CloudMachineError::Messaging(format!("Failed to create Service Bus client: {e}"))
        })?;

        log::info!("Connected to Service Bus");
        Ok(Self {
            client: Mutex::new(Some(client)),
            senders: Mutex::new(HashMap::new()),
            receivers: Mutex::new(HashMap::new()),
        })
    }

    async fn open_sender(&self, queue: &str) -> CloudMachineResult<ServiceBusSender> {
        let mut guard = self.client.lock().await;
        let client = guard.as_mut().ok_or(CloudMachineError::Closed)?;
        client
            .create_sender(queue, ServiceBusSenderOptions::default())
            .await
            .map_err(|e| CloudMachineError::Messaging(format!("Sender error: {e}")))
    }

    async fn open_receiver(&self, queue: &str) -> CloudMachineResult<ServiceBusReceiver> {
        let mut guard = self.client.lock().await;
        let client = guard.as_mut().ok_or(CloudMachineError::Closed)?;
        client
            .create_receiver_for_queue(queue, ServiceBusReceiverOptions::default())
            .await
            .map_err(|e| CloudMachineError::Messaging(format!("Receiver error: {e}")))
    }
}

fn to_service_bus_message(message: BusMessage) -> CloudMachineResult<ServiceBusMessage> {
    let mut converted = ServiceBusMessage::new(message.body);
    if let Some(message_id) = message.message_id {
        converted
            .set_message_id(message_id)
            .map_err(|e| CloudMachineError::Messaging(format!("Invalid message id: {e}")))?;
    }
    if let Some(content_type) = message.content_type {
        converted.set_content_type(content_type);
    }
    Ok(converted)
}

fn from_received(message: &ServiceBusReceivedMessage) -> CloudMachineResult<BusMessage> {
    let body = message
        .body()
        .map_err(|e| CloudMachineError::Messaging(format!("Unreadable message body: {e}")))?;
    Ok(BusMessage {
        body: body.to_vec(),
        message_id: message.message_id().map(|id| id.to_string()),
        content_type: message.content_type().map(|ct| ct.to_string()),
    })
}

/// Settlement of received messages.
#[async_trait]
trait CompleteMessage<M: Sync + 'static>: Send {
    async fn complete(&mut self, message: &M) -> CloudMachineResult<()>;
}

#[async_trait]
impl CompleteMessage<ServiceBusReceivedMessage> for ServiceBusReceiver {
    async fn complete(&mut self, message: &ServiceBusReceivedMessage) -> CloudMachineResult<()> {
        self.complete_message(message)
            .await
            .map_err(|e| CloudMachineError::Messaging(format!("Failed to complete message: {e}")))
    }
}

/// Converts every received message, then completes the readable ones.
///
/// Unreadable messages are left unsettled so the broker redelivers them.
/// A failed completion is logged and does not stop the rest; the message is
/// still returned to the caller.
async fn settle_received<M, R>(
    queue: &str,
    received: &[M],
    receiver: &mut R,
    convert: fn(&M) -> CloudMachineResult<BusMessage>,
) -> Vec<BusMessage>
where
    M: Sync + 'static,
    R: CompleteMessage<M>,
{
    let mut readable = Vec::with_capacity(received.len());
    for message in received {
        match convert(message) {
            Ok(converted) => readable.push((message, converted)),
            Err(e) => log::warn!("Leaving unreadable message on '{queue}' unsettled: {e}"),
        }
    }

    let mut completed = 0;
    let mut messages = Vec::with_capacity(readable.len());
    for (message, converted) in readable {
        match receiver.complete(message).await {
            Ok(()) => completed += 1,
            Err(e) => log::error!(
                "Failed to complete message {} on '{queue}': {e}",
                converted.message_id.as_deref().unwrap_or("unknown")
            ),
        }
        messages.push(converted);
    }

    log::debug!(
        "Completed {completed} of {} messages received from '{queue}'",
        received.len()
    );
    messages
}

#[async_trait]
impl MessageBus for ServiceBusMessageBus {
    async fn send(&self, queue: &str, messages: Vec<BusMessage>) -> CloudMachineResult<()> {
        let batch = messages
            .into_iter()
            .map(to_service_bus_message)
            .collect::<CloudMachineResult<Vec<_>>>()?;

        let mut senders = self.senders.lock().await;
        if !senders.contains_key(queue) {
            let sender = self.open_sender(queue).await?;
            senders.insert(queue.to_string(), sender);
        }
        let sender = senders
            .get_mut(queue)
            .ok_or_else(|| CloudMachineError::Internal(format!("No sender for '{queue}'")))?;

        sender
            .send_messages(batch)
            .await
            .map_err(|e| CloudMachineError::Messaging(format!("Send to '{queue}' failed: {e}")))
    }

    async fn receive(
        &self,
        queue: &str,
        max_count: u32,
        max_wait: Duration,
    ) -> CloudMachineResult<Vec<BusMessage>> {
        let mut receivers = self.receivers.lock().await;
        if !receivers.contains_key(queue) {
            let receiver = self.open_receiver(queue).await?;
            receivers.insert(queue.to_string(), receiver);
        }
        let receiver = receivers
            .get_mut(queue)
            .ok_or_else(|| CloudMachineError::Internal(format!("No receiver for '{queue}'")))?;

        let received =
            match tokio::time::timeout(max_wait, receiver.receive_messages(max_count)).await {
                Ok(result) => result.map_err(|e| {
                    CloudMachineError::Messaging(format!("Receive from '{queue}' failed: {e}"))
                })?,
                Err(_) => {
                    log::debug!("No messages on '{queue}' within {max_wait:?}");
                    return Ok(Vec::new());
                }
            };

        Ok(settle_received(queue, received.as_slice(), receiver, from_received).await)
    }

    async fn close(&self) -> CloudMachineResult<()> {
        let mut errors = Vec::new();

        for (queue, sender) in self.senders.lock().await.drain() {
            if let Err(e) = sender.dispose().await {
                log::warn!("Failed to dispose sender for '{queue}': {e}");
                errors.push(format!("sender '{queue}': {e}"));
            }
        }
        for (queue, receiver) in self.receivers.lock().await.drain() {
            if let Err(e) = receiver.dispose().await {
                log::warn!("Failed to dispose receiver for '{queue}': {e}");
                errors.push(format!("receiver '{queue}': {e}"));
            }
        }
        if let Some(client) = self.client.lock().await.take() {
            if let Err(e) = client.dispose().await {
                log::warn!("Failed to dispose Service Bus client: {e}");
                errors.push(format!("client: {e}"));
            }
        }

        if errors.is_empty() {
            log::info!("Service Bus connection closed");
            Ok(())
        } else {
            Err(CloudMachineError::Messaging(format!(
                "Failed to dispose {} resource(s): {}",
                errors.len(),
                errors.join("; ")
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeReceived {
        id: &'static str,
        readable: bool,
    }

    fn convert_fake(message: &FakeReceived) -> CloudMachineResult<BusMessage> {
        if message.readable {
            Ok(BusMessage::text(message.id).with_message_id(message.id))
        } else {
            Err(CloudMachineError::Messaging("unreadable body".to_string()))
        }
    }

    #[derive(Default)]
    struct RecordingReceiver {
        fail_on: Vec<&'static str>,
        attempted: Vec<&'static str>,
    }

    #[async_trait]
    impl CompleteMessage<FakeReceived> for RecordingReceiver {
        async fn complete(&mut self, message: &FakeReceived) -> CloudMachineResult<()> {
            self.attempted.push(message.id);
            if self.fail_on.contains(&message.id) {
                return Err(CloudMachineError::Messaging("lock lost".to_string()));
            }
            Ok(())
        }
    }

    fn fake(id: &'static str) -> FakeReceived {
        FakeReceived { id, readable: true }
    }

    #[tokio::test]
    async fn test_failed_completion_keeps_going_and_returns_everything() {
        let received = [fake("m-1"), fake("m-2"), fake("m-3")];
        let mut receiver = RecordingReceiver {
            fail_on: vec!["m-2"],
            ..Default::default()
        };

        let messages = settle_received("jobs", &received, &mut receiver, convert_fake).await;

        assert_eq!(receiver.attempted, vec!["m-1", "m-2", "m-3"]);
        let ids: Vec<_> = messages
            .iter()
            .map(|m| m.message_id.as_deref().unwrap())
            .collect();
        assert_eq!(ids, vec!["m-1", "m-2", "m-3"]);
    }

    #[tokio::test]
    async fn test_unreadable_message_is_left_unsettled() {
        let received = [
            fake("m-1"),
            FakeReceived {
                id: "m-2",
                readable: false,
            },
            fake("m-3"),
        ];
        let mut receiver = RecordingReceiver::default();

        let messages = settle_received("jobs", &received, &mut receiver, convert_fake).await;

        assert_eq!(receiver.attempted, vec!["m-1", "m-3"]);
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].body_text(), "m-3");
    }

    #[test]
    fn test_outgoing_message_conversion() {
        let message = BusMessage::text("hello").with_message_id("m-1");

        assert!(to_service_bus_message(message).is_ok());
    }

    #[test]
    fn test_oversized_message_id_is_rejected() {
        let message = BusMessage::text("hello").with_message_id("x".repeat(200));

        let error = to_service_bus_message(message).err().unwrap();

        assert!(matches!(error, CloudMachineError::Messaging(_)));
    }
}
