use claims::*;
use cloudmachine::config::MapEnv;
use cloudmachine::factory::InMemoryServiceFactory;
use cloudmachine::messaging::{BusMessage, MessageBus};
use cloudmachine::{CloudMachineClient, CloudMachineError};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, PartialEq, Serialize, Deserialize)]
struct Job {
    id: u32,
    kind: String,
}

fn client(factory: &InMemoryServiceFactory) -> CloudMachineClient {
    let env = MapEnv::default()
        .with("AZURE_CLOUDMACHINE_BLOB_ENDPOINT", "https://cm.blob")
        .with("AZURE_CLOUDMACHINE_TABLE_ENDPOINT", "https://cm.table");
    CloudMachineClient::builder()
        .env(Arc::new(env))
        .factory(Arc::new(factory.clone()))
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_send_and_receive_on_default_queue() {
    let factory = InMemoryServiceFactory::new();
    let client = client(&factory);
    let messaging = client.messaging().await.unwrap();

    messaging
        .send(
            None,
            vec![
                BusMessage::text("first").with_message_id("m-1"),
                BusMessage::text("second"),
            ],
        )
        .await
        .unwrap();
    assert_eq!(factory.bus().pending("default"), 2);

    let received = messaging
        .receive(Some("default"), 10, Duration::from_millis(50))
        .await
        .unwrap();

    assert_eq!(received.len(), 2);
    assert_eq!(received[0].body_text(), "first");
    assert_eq!(received[0].message_id.as_deref(), Some("m-1"));
    assert_eq!(factory.bus().pending("default"), 0);
}

#[tokio::test]
async fn test_json_messages_round_trip() {
    let factory = InMemoryServiceFactory::new();
    let client = client(&factory);
    let messaging = client.messaging().await.unwrap();
    let job = Job {
        id: 42,
        kind: "resize".to_string(),
    };

    messaging.send_json(Some("jobs"), &job).await.unwrap();
    let received = messaging
        .receive(Some("jobs"), 1, Duration::ZERO)
        .await
        .unwrap();

    assert_eq!(received[0].body_json::<Job>().unwrap(), job);
    assert_eq!(
        received[0].content_type.as_deref(),
        Some("application/json")
    );
}

#[tokio::test]
async fn test_queues_are_independent() {
    let factory = InMemoryServiceFactory::new();
    let client = client(&factory);
    let messaging = client.messaging().await.unwrap();

    messaging
        .send(Some("a"), vec![BusMessage::text("for a")])
        .await
        .unwrap();

    let from_b = messaging
        .receive(Some("b"), 1, Duration::from_millis(10))
        .await
        .unwrap();

    assert!(from_b.is_empty());
    assert_eq!(factory.bus().pending("a"), 1);
}

#[tokio::test]
async fn test_zero_max_count_is_rejected() {
    let factory = InMemoryServiceFactory::new();
    let client = client(&factory);
    let messaging = client.messaging().await.unwrap();

    let error = assert_err!(messaging.receive(None, 0, Duration::ZERO).await);

    assert_matches!(error, CloudMachineError::InvalidQuery(_));
}

#[tokio::test]
async fn test_messaging_client_is_built_once() {
    let factory = InMemoryServiceFactory::new();
    let client = client(&factory);

    let first = client.messaging().await.unwrap();
    let second = client.messaging().await.unwrap();

    assert!(std::ptr::eq(first, second));
    assert!(Arc::ptr_eq(&first.get_client(), &second.get_client()));
}

#[tokio::test]
async fn test_close_closes_the_bus() {
    let factory = InMemoryServiceFactory::new();
    let client = client(&factory);
    let bus = client.messaging().await.unwrap().get_client();

    client.close().await.unwrap();

    assert_eq!(factory.bus().close_count(), 1);
    assert_matches!(
        bus.send("default", vec![BusMessage::text("late")]).await,
        Err(CloudMachineError::Closed)
    );
}
