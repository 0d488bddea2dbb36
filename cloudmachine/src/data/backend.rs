use super::entity::{Entity, TransactionOperation};
use crate::common::CloudMachineResult;
use async_trait::async_trait;
use std::sync::Arc;

/// One page of entities and the continuation for the next page.
#[derive(Debug, Clone, Default)]
pub struct EntityPage {
    pub entities: Vec<Entity>,
    pub continuation: Option<String>,
}

/// Account-level table operations.
#[async_trait]
pub trait TableService: Send + Sync {
    fn endpoint(&self) -> &str;

    /// Creates `name` unless it already exists, and returns a client for it.
    async fn create_table_if_not_exists(&self, name: &str)
    -> CloudMachineResult<Arc<dyn TableClient>>;

    async fn delete_table(&self, name: &str) -> CloudMachineResult<()>;

    async fn close(&self) -> CloudMachineResult<()>;
}

/// Operations scoped to one table.
#[async_trait]
pub trait TableClient: Send + Sync {
    fn table_name(&self) -> &str;

    /// Applies every operation atomically. All operations must target the
    /// same partition.
    async fn submit_transaction(&self, operations: Vec<TransactionOperation>)
    -> CloudMachineResult<()>;

    async fn list_entities(&self, continuation: Option<String>)
    -> CloudMachineResult<EntityPage>;

    async fn query_entities(
        &self,
        filter: &str,
        continuation: Option<String>,
    ) -> CloudMachineResult<EntityPage>;

    async fn get_entity(&self, partition_key: &str, row_key: &str) -> CloudMachineResult<Entity>;
}
