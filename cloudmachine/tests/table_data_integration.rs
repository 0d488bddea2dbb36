use claims::*;
use cloudmachine::config::MapEnv;
use cloudmachine::data::{
    Entity, EntityBatch, InMemoryTableService, OperationKind, TableModel, TableQuery, UpdateMode,
};
use cloudmachine::factory::InMemoryServiceFactory;
use cloudmachine::storage::InMemoryBlobService;
use cloudmachine::{CloudMachineClient, CloudMachineError};
use futures::TryStreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Site {
    #[serde(rename = "PartitionKey")]
    region: String,
    #[serde(rename = "RowKey")]
    id: String,
    name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    capacity: Option<i64>,
}

impl TableModel for Site {
    fn table_name() -> &'static str {
        "sites"
    }
}

fn site(region: &str, id: &str, name: &str) -> Site {
    Site {
        region: region.to_string(),
        id: id.to_string(),
        name: name.to_string(),
        capacity: None,
    }
}

fn entity(value: Value) -> Entity {
    match value {
        Value::Object(map) => map,
        other => panic!("not an object: {other}"),
    }
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
async fn test_insert_sends_one_transaction_with_every_row() {
    let factory = InMemoryServiceFactory::new();
    let client = client(&factory);
    let data = client.data().await.unwrap();

    data.insert_typed(&[
        site("eu", "1", "Lyon"),
        site("eu", "2", "Porto"),
        site("eu", "3", "Turin"),
    ])
    .await
    .unwrap();

    let transactions = factory.tables().transactions();
    assert_eq!(transactions.len(), 1);
    assert_eq!(transactions[0].table, "sites");
    assert_eq!(transactions[0].operations.len(), 3);
    assert!(
        transactions[0]
            .operations
            .iter()
            .all(|op| op.kind == OperationKind::Create)
    );
    assert_eq!(factory.tables().row_count("sites"), 3);
}

#[tokio::test]
async fn test_typed_round_trip_through_queries() {
    let factory = InMemoryServiceFactory::new();
    let client = client(&factory);
    let data = client.data().await.unwrap();
    data.insert_typed(&[site("eu", "1", "Lyon"), site("eu", "2", "Porto")])
        .await
        .unwrap();
    data.insert_typed(&[site("us", "1", "Austin")])
        .await
        .unwrap();

    let point: Vec<Site> = data
        .query_typed(TableQuery::keys("eu", "2").unwrap())
        .await
        .unwrap()
        .try_collect()
        .await
        .unwrap();
    let by_partition: Vec<Site> = data
        .query_typed(TableQuery::keys("eu", "*").unwrap())
        .await
        .unwrap()
        .try_collect()
        .await
        .unwrap();
    let by_row: Vec<Site> = data
        .query_typed(TableQuery::keys("", "1").unwrap())
        .await
        .unwrap()
        .try_collect()
        .await
        .unwrap();

    assert_eq!(point, vec![site("eu", "2", "Porto")]);
    assert_eq!(by_partition.len(), 2);
    assert!(by_partition.iter().all(|s| s.region == "eu"));
    assert_eq!(by_row.len(), 2);
    assert!(by_row.iter().all(|s| s.id == "1"));
}

#[tokio::test]
async fn test_both_wildcards_rejected_before_any_call() {
    let factory = InMemoryServiceFactory::new();

    assert_matches!(TableQuery::keys("*", "*"), Err(CloudMachineError::InvalidQuery(_)));
    assert_matches!(TableQuery::keys("", ""), Err(CloudMachineError::InvalidQuery(_)));
    assert_matches!(TableQuery::keys("*", ""), Err(CloudMachineError::InvalidQuery(_)));
    assert!(factory.tables().transactions().is_empty());
}

#[tokio::test]
async fn test_raw_filter_with_parameters() {
    let factory = InMemoryServiceFactory::new();
    let client = client(&factory);
    let data = client.data().await.unwrap();
    data.insert(EntityBatch::raw(
        "people",
        [
            entity(json!({"PartitionKey": "team", "RowKey": "a", "Name": "O'Brien", "Age": 41})),
            entity(json!({"PartitionKey": "team", "RowKey": "b", "Name": "Ng", "Age": 29})),
            entity(json!({"PartitionKey": "team", "RowKey": "c", "Name": "Ruiz", "Age": 35})),
        ],
    ))
    .await
    .unwrap();

    let quoted: Vec<Entity> = data
        .query(
            "people",
            TableQuery::filter("Name eq @name").with_parameter("name", "O'Brien"),
        )
        .await
        .unwrap()
        .try_collect()
        .await
        .unwrap();
    let older: Vec<Entity> = data
        .query(
            "people",
            TableQuery::filter("Age ge @min and PartitionKey eq 'team'")
                .with_parameter("min", 30),
        )
        .await
        .unwrap()
        .try_collect()
        .await
        .unwrap();

    assert_eq!(quoted.len(), 1);
    assert_eq!(quoted[0]["RowKey"], json!("a"));
    assert_eq!(older.len(), 2);
}

#[tokio::test]
async fn test_upsert_merge_keeps_other_properties() {
    let factory = InMemoryServiceFactory::new();
    let client = client(&factory);
    let data = client.data().await.unwrap();
    let mut original = site("eu", "1", "Lyon");
    original.capacity = Some(120);
    data.insert_typed(&[original]).await.unwrap();

    data.upsert(
        EntityBatch::raw(
            "sites",
            [entity(json!({"PartitionKey": "eu", "RowKey": "1", "name": "Lyon Part-Dieu"}))],
        ),
        false,
    )
    .await
    .unwrap();

    let merged: Vec<Site> = data
        .query_typed(TableQuery::keys("eu", "1").unwrap())
        .await
        .unwrap()
        .try_collect()
        .await
        .unwrap();
    assert_eq!(merged[0].name, "Lyon Part-Dieu");
    assert_eq!(merged[0].capacity, Some(120));

    let last = factory.tables().transactions().pop().unwrap();
    assert_eq!(last.operations[0].mode, Some(UpdateMode::Merge));
}

#[tokio::test]
async fn test_update_replace_drops_missing_properties() {
    let factory = InMemoryServiceFactory::new();
    let client = client(&factory);
    let data = client.data().await.unwrap();
    let mut original = site("eu", "1", "Lyon");
    original.capacity = Some(120);
    data.insert_typed(&[original]).await.unwrap();

    data.update_typed(&[site("eu", "1", "Lyon")], true)
        .await
        .unwrap();

    let replaced: Vec<Site> = data
        .query_typed(TableQuery::keys("eu", "1").unwrap())
        .await
        .unwrap()
        .try_collect()
        .await
        .unwrap();
    assert_eq!(replaced[0].capacity, None);

    let last = factory.tables().transactions().pop().unwrap();
    assert_eq!(last.operations[0].kind, OperationKind::Update);
    assert_eq!(last.operations[0].mode, Some(UpdateMode::Replace));
}

#[tokio::test]
async fn test_failed_transaction_leaves_table_untouched() {
    let factory = InMemoryServiceFactory::new();
    let client = client(&factory);
    let data = client.data().await.unwrap();
    data.insert_typed(&[site("eu", "2", "Porto")]).await.unwrap();

    let error = assert_err!(
        data.insert_typed(&[site("eu", "1", "Lyon"), site("eu", "2", "Porto again")])
            .await
    );

    assert!(error.is_conflict());
    assert_eq!(factory.tables().row_count("sites"), 1);
}

#[tokio::test]
async fn test_update_of_missing_row_propagates_not_found() {
    let factory = InMemoryServiceFactory::new();
    let client = client(&factory);
    let data = client.data().await.unwrap();

    let error = assert_err!(data.update_typed(&[site("eu", "9", "Nowhere")], false).await);

    assert!(error.is_not_found());
}

#[tokio::test]
async fn test_delete_removes_rows() {
    let factory = InMemoryServiceFactory::new();
    let client = client(&factory);
    let data = client.data().await.unwrap();
    let rows = [site("eu", "1", "Lyon"), site("eu", "2", "Porto")];
    data.insert_typed(&rows).await.unwrap();

    data.delete_typed(&rows[..1]).await.unwrap();

    let remaining: Vec<Site> = data
        .list_typed()
        .await
        .unwrap()
        .try_collect()
        .await
        .unwrap();
    assert_eq!(remaining, vec![site("eu", "2", "Porto")]);
}

#[tokio::test]
async fn test_zero_entities_issue_no_transaction() {
    let factory = InMemoryServiceFactory::new();
    let client = client(&factory);
    let data = client.data().await.unwrap();

    data.insert_typed::<Site>(&[]).await.unwrap();
    data.upsert_typed::<Site>(&[], true).await.unwrap();
    data.update_typed::<Site>(&[], false).await.unwrap();
    data.delete_typed::<Site>(&[]).await.unwrap();

    assert!(factory.tables().transactions().is_empty());
}

#[tokio::test]
async fn test_list_is_paged_lazily() {
    let factory = InMemoryServiceFactory::with_services(
        InMemoryBlobService::new("memory://blob"),
        InMemoryTableService::new("memory://table").with_page_size(2),
    );
    let client = client(&factory);
    let data = client.data().await.unwrap();
    let rows: Vec<Site> = (0..5).map(|i| site("eu", &i.to_string(), "x")).collect();
    data.insert_typed(&rows).await.unwrap();

    let listed: Vec<Entity> = data
        .list("sites")
        .await
        .unwrap()
        .try_collect()
        .await
        .unwrap();

    assert_eq!(listed.len(), 5);
}

#[tokio::test]
async fn test_table_client_created_once_and_dropped_with_table() {
    let factory = InMemoryServiceFactory::new();
    let client = client(&factory);
    let data = client.data().await.unwrap();

    let first = data.table_client("audit").await.unwrap();
    let second = data.table_client("audit").await.unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert!(factory.tables().has_table("audit"));

    data.delete_table("audit").await.unwrap();

    assert_eq!(data.cached_tables().await, 0);
    assert!(!factory.tables().has_table("audit"));
}
