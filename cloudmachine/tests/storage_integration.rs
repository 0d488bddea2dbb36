use claims::*;
use cloudmachine::config::MapEnv;
use cloudmachine::events::{BlobEvent, EventKind};
use cloudmachine::factory::InMemoryServiceFactory;
use cloudmachine::storage::{BlobService, DOWNLOAD_CHUNK_SIZE, InMemoryBlobService};
use cloudmachine::{CloudMachineClient, CloudMachineError};
use futures::TryStreamExt;
use std::sync::{Arc, Mutex};

mod storage_helpers {
    use super::*;

    pub fn endpoints() -> MapEnv {
        MapEnv::default()
            .with(
                "AZURE_CLOUDMACHINE_BLOB_ENDPOINT",
                "https://cm.blob.core.windows.net",
            )
            .with(
                "AZURE_CLOUDMACHINE_TABLE_ENDPOINT",
                "https://cm.table.core.windows.net",
            )
    }

    pub fn client(factory: &InMemoryServiceFactory) -> CloudMachineClient {
        CloudMachineClient::builder()
            .env(Arc::new(endpoints()))
            .factory(Arc::new(factory.clone()))
            .build()
            .expect("client should build from in-memory endpoints")
    }

    /// Records every event of `kinds` delivered by the client's listener.
    pub fn record_events(
        client: &CloudMachineClient,
        kinds: &[EventKind],
    ) -> Arc<Mutex<Vec<BlobEvent>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        for kind in kinds {
            let seen = seen.clone();
            client
                .events()
                .subscribe(*kind, move |event| seen.lock().unwrap().push(event.clone()));
        }
        seen
    }
}

use storage_helpers::*;

#[tokio::test]
async fn test_upload_list_and_download_default_container() {
    let factory = InMemoryServiceFactory::new();
    let client = client(&factory);
    let storage = client.storage().await.unwrap();

    storage.upload("a.txt", "alpha", None).await.unwrap();
    storage.upload("b.txt", "beta", Some("default")).await.unwrap();
    storage.upload("logs/c.txt", "gamma", Some("")).await.unwrap();

    let all: Vec<String> = storage.list(None, None).await.try_collect().await.unwrap();
    let logs: Vec<String> = storage
        .list(Some("logs/"), None)
        .await
        .try_collect()
        .await
        .unwrap();

    assert_eq!(all, vec!["a.txt", "b.txt", "logs/c.txt"]);
    assert_eq!(logs, vec!["logs/c.txt"]);
    assert_eq!(storage.download_all("b.txt", None).await.unwrap(), b"beta");
    assert_eq!(storage.cached_containers().await, 0);
}

#[tokio::test]
async fn test_listing_follows_every_page() {
    let factory = InMemoryServiceFactory::with_services(
        InMemoryBlobService::new("memory://blob").with_page_size(2),
        cloudmachine::data::InMemoryTableService::new("memory://table"),
    );
    let client = client(&factory);
    let storage = client.storage().await.unwrap();

    for i in 0..5 {
        storage
            .upload(&format!("file-{i}"), vec![i as u8], None)
            .await
            .unwrap();
    }

    let names: Vec<String> = storage.list(None, None).await.try_collect().await.unwrap();

    assert_eq!(names.len(), 5);
}

#[tokio::test]
async fn test_large_download_is_chunked() {
    let factory = InMemoryServiceFactory::new();
    let client = client(&factory);
    let storage = client.storage().await.unwrap();
    let payload = vec![7u8; DOWNLOAD_CHUNK_SIZE as usize + 10];

    storage.upload("big.bin", payload.clone(), None).await.unwrap();
    let chunks: Vec<Vec<u8>> = storage
        .download("big.bin", None)
        .await
        .try_collect()
        .await
        .unwrap();

    assert_eq!(chunks.len(), 2);
    assert_eq!(chunks[1].len(), 10);
    assert_eq!(chunks.concat(), payload);
}

#[tokio::test]
async fn test_named_container_client_is_cached() {
    let factory = InMemoryServiceFactory::new();
    let client = client(&factory);
    let storage = client.storage().await.unwrap();

    let first = storage.container_client(Some("reports")).await;
    let second = storage.container_client(Some("reports")).await;
    let default = storage.container_client(None).await;

    assert!(Arc::ptr_eq(&first, &second));
    assert!(!Arc::ptr_eq(&first, &default));
    assert_eq!(storage.cached_containers().await, 1);
}

#[tokio::test]
async fn test_created_container_holds_uploads() {
    let factory = InMemoryServiceFactory::new();
    let client = client(&factory);
    let storage = client.storage().await.unwrap();

    storage.create_container("reports").await.unwrap();
    storage
        .upload("q1.csv", "a,b", Some("reports"))
        .await
        .unwrap();

    assert!(factory.blobs().has_container("reports"));
    assert_eq!(factory.blobs().blob_names("reports"), vec!["q1.csv"]);
    assert!(factory.blobs().blob_names("default").is_empty());
}

#[tokio::test]
async fn test_default_container_cannot_be_deleted() {
    let factory = InMemoryServiceFactory::new();
    let client = client(&factory);
    let storage = client.storage().await.unwrap();

    for name in ["default", "DEFAULT", "Default"] {
        let error = assert_err!(storage.delete_container(name).await);
        assert_matches!(error, CloudMachineError::ProtectedResource { .. });
    }
    assert!(factory.blobs().has_container("default"));
}

#[tokio::test]
async fn test_delete_container_removes_cached_and_uncached() {
    let factory = InMemoryServiceFactory::new();
    let client = client(&factory);
    let storage = client.storage().await.unwrap();
    storage.create_container("cached").await.unwrap();
    factory.blobs().create_container("uncached").await.unwrap();

    assert_ok!(storage.delete_container("cached").await);
    assert_ok!(storage.delete_container("uncached").await);

    assert_eq!(storage.cached_containers().await, 0);
    assert!(!factory.blobs().has_container("cached"));
    assert!(!factory.blobs().has_container("uncached"));
}

#[tokio::test]
async fn test_delete_missing_container_propagates_service_error() {
    let factory = InMemoryServiceFactory::new();
    let client = client(&factory);
    let storage = client.storage().await.unwrap();

    let error = assert_err!(storage.delete_container("ghost").await);

    assert!(error.is_not_found());
}

#[tokio::test]
async fn test_rename_moves_content() {
    let factory = InMemoryServiceFactory::new();
    let client = client(&factory);
    let storage = client.storage().await.unwrap();
    storage.upload("draft.md", "text", None).await.unwrap();

    storage.rename("draft.md", "final.md", None).await.unwrap();

    assert_eq!(factory.blobs().blob_names("default"), vec!["final.md"]);
    assert_eq!(
        factory.blobs().blob_content("default", "final.md").unwrap(),
        b"text"
    );
}

#[tokio::test]
async fn test_rename_onto_itself_keeps_the_blob() {
    let factory = InMemoryServiceFactory::new();
    let client = client(&factory);
    let seen = record_events(&client, &[EventKind::BlobRenamed, EventKind::BlobDeleted]);
    client.start().unwrap();
    let storage = client.storage().await.unwrap();
    storage.upload("a.txt", "keep me", None).await.unwrap();

    let error = assert_err!(storage.rename("a.txt", "a.txt", None).await);

    assert_matches!(error, CloudMachineError::InvalidArgument(_));
    assert_eq!(factory.blobs().blob_names("default"), vec!["a.txt"]);
    assert_eq!(
        factory.blobs().blob_content("default", "a.txt").unwrap(),
        b"keep me"
    );
    assert!(client.stop().await);
    assert!(seen.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_upload_many_keeps_input_order() {
    let factory = InMemoryServiceFactory::new();
    let client = client(&factory);
    let storage = client.storage().await.unwrap();
    let items: Vec<(String, Vec<u8>)> = (0..20)
        .map(|i| (format!("batch/{i:02}"), vec![i as u8; 3]))
        .collect();

    let files = storage.upload_many(items, None).await.unwrap();

    assert_eq!(files.len(), 20);
    assert_eq!(files[0].name, "batch/00");
    assert_eq!(files[19].name, "batch/19");
    assert_eq!(factory.blobs().blob_names("default").len(), 20);
}

#[tokio::test]
async fn test_events_are_delivered_in_order_after_start() {
    let factory = InMemoryServiceFactory::new();
    let client = client(&factory);
    let seen = record_events(
        &client,
        &[
            EventKind::BlobCreated,
            EventKind::BlobDeleted,
            EventKind::BlobRenamed,
        ],
    );
    let storage = client.storage().await.unwrap();

    // published before start, buffered until the thread runs
    storage.upload("one", "1", None).await.unwrap();
    client.start().unwrap();
    storage.rename("one", "two", None).await.unwrap();
    storage.delete("two", None).await.unwrap();
    assert!(client.stop().await);

    let seen = seen.lock().unwrap();
    let kinds: Vec<EventKind> = seen.iter().map(|event| event.kind).collect();
    assert_eq!(
        kinds,
        vec![
            EventKind::BlobCreated,
            EventKind::BlobRenamed,
            EventKind::BlobDeleted
        ]
    );
    assert_eq!(seen[1].previous_name.as_deref(), Some("one"));
    assert_eq!(seen[1].name, "two");
    assert_eq!(seen[2].container, "default");
}

#[tokio::test]
async fn test_no_events_without_start() {
    let factory = InMemoryServiceFactory::new();
    let client = client(&factory);
    let seen = record_events(&client, &[EventKind::BlobCreated]);
    let storage = client.storage().await.unwrap();

    storage.upload("quiet", "x", None).await.unwrap();
    client.close().await.unwrap();

    assert!(seen.lock().unwrap().is_empty());
    assert!(!client.events().has_started());
}
