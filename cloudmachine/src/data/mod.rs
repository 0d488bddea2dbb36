//! # Table data
//!
//! [`CloudMachineTableData`] is the structured-data domain of the aggregate
//! client. Rows are supplied either as typed models implementing
//! [`TableModel`] or as raw [`Entity`] maps for a named table; the caller
//! picks the form explicitly through [`EntityBatch`] or the `*_typed`
//! methods.
//!
//! Every mutating call sends all of its rows as one transaction. A call with
//! no rows sends nothing.
//!
//! ```no_run
//! use cloudmachine::data::{CloudMachineTableData, EntityBatch, TableQuery};
//! use futures::TryStreamExt;
//! use serde_json::json;
//!
//! # async fn demo(data: &CloudMachineTableData) -> cloudmachine::common::CloudMachineResult<()> {
//! let row = json!({"PartitionKey": "eu", "RowKey": "1", "name": "Lyon"});
//! data.insert(EntityBatch::raw("sites", [row.as_object().cloned().unwrap()])).await?;
//!
//! let rows: Vec<_> = data
//!     .query("sites", TableQuery::keys("eu", "*")?)
//!     .await?
//!     .try_collect()
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod entity;
pub mod filter;
pub mod memory;
pub mod query;
pub mod rest;

pub use backend::{EntityPage, TableClient, TableService};
pub use entity::{
    Entity, EntityBatch, OperationKind, PARTITION_KEY, ROW_KEY, TableModel, TransactionOperation,
    UpdateMode,
};
pub use memory::{InMemoryTableService, RecordedTransaction};
pub use query::{TableQuery, render_filter};
pub use rest::RestTableService;

use crate::cache::ClientCache;
use crate::common::CloudMachineResult;
use crate::paging::paged;
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use std::sync::Arc;

/// Table operations over one account, with a per-table client cache.
pub struct CloudMachineTableData {
    service: Arc<dyn TableService>,
    tables: ClientCache<dyn TableClient>,
}

impl CloudMachineTableData {
    pub fn new(service: Arc<dyn TableService>) -> Self {
        log::info!("Table client bound to {}", service.endpoint());
        Self {
            service,
            tables: ClientCache::new(),
        }
    }

    /// The underlying account-level service client.
    pub fn get_client(&self) -> Arc<dyn TableService> {
        Arc::clone(&self.service)
    }

    /// Returns the cached client for `table`, creating the table on first use.
    pub async fn table_client(&self, table: &str) -> CloudMachineResult<Arc<dyn TableClient>> {
        self.tables
            .get_or_try_create_with(table, || self.service.create_table_if_not_exists(table))
            .await
    }

    pub async fn insert(&self, batch: EntityBatch) -> CloudMachineResult<()> {
        self.submit(batch, OperationKind::Create, None).await
    }

    /// Inserts or replaces (`overwrite = true`) or merges (`false`) each row.
    pub async fn upsert(&self, batch: EntityBatch, overwrite: bool) -> CloudMachineResult<()> {
        let mode = UpdateMode::from_overwrite(overwrite);
        self.submit(batch, OperationKind::Upsert, Some(mode)).await
    }

    /// Replaces (`overwrite = true`) or merges (`false`) existing rows.
    pub async fn update(&self, batch: EntityBatch, overwrite: bool) -> CloudMachineResult<()> {
        let mode = UpdateMode::from_overwrite(overwrite);
        self.submit(batch, OperationKind::Update, Some(mode)).await
    }

    pub async fn delete(&self, batch: EntityBatch) -> CloudMachineResult<()> {
        self.submit(batch, OperationKind::Delete, None).await
    }

    pub async fn insert_typed<M: TableModel>(&self, models: &[M]) -> CloudMachineResult<()> {
        self.insert(EntityBatch::typed(models)?).await
    }

    pub async fn upsert_typed<M: TableModel>(
        &self,
        models: &[M],
        overwrite: bool,
    ) -> CloudMachineResult<()> {
        self.upsert(EntityBatch::typed(models)?, overwrite).await
    }

    pub async fn update_typed<M: TableModel>(
        &self,
        models: &[M],
        overwrite: bool,
    ) -> CloudMachineResult<()> {
        self.update(EntityBatch::typed(models)?, overwrite).await
    }

    pub async fn delete_typed<M: TableModel>(&self, models: &[M]) -> CloudMachineResult<()> {
        self.delete(EntityBatch::typed(models)?).await
    }

    async fn submit(
        &self,
        batch: EntityBatch,
        kind: OperationKind,
        mode: Option<UpdateMode>,
    ) -> CloudMachineResult<()> {
        if batch.is_empty() {
            log::debug!("No entities for {kind:?} on '{}', nothing sent", batch.table());
            return Ok(());
        }

        let (table, operations) = batch.into_operations(kind, mode);
        let client = self.table_client(&table).await?;
        log::debug!("Submitting {} {kind:?} operation(s) to '{table}'", operations.len());
        client.submit_transaction(operations).await
    }

    /// Lazily lists every row of `table`.
    pub async fn list(
        &self,
        table: &str,
    ) -> CloudMachineResult<BoxStream<'static, CloudMachineResult<Entity>>> {
        let client = self.table_client(table).await?;

        Ok(paged(move |continuation| {
            let client = Arc::clone(&client);
            async move {
                let page = client.list_entities(continuation).await?;
                Ok((page.entities, page.continuation))
            }
        }))
    }

    /// Lazily lists every row of `M`'s table as models.
    pub async fn list_typed<M>(&self) -> CloudMachineResult<BoxStream<'static, CloudMachineResult<M>>>
    where
        M: TableModel + Send + 'static,
    {
        Ok(into_models(self.list(M::table_name()).await?))
    }

    /// Runs `query` against `table`.
    ///
    /// # Errors
    ///
    /// Filter parameters are rendered up front; an unknown parameter fails
    /// with [`InvalidQuery`](crate::common::CloudMachineError::InvalidQuery)
    /// before any request is made.
    pub async fn query(
        &self,
        table: &str,
        query: TableQuery,
    ) -> CloudMachineResult<BoxStream<'static, CloudMachineResult<Entity>>> {
        let filter = query.render()?;
        let client = self.table_client(table).await?;

        let stream = match (filter, query) {
            (
                _,
                TableQuery::Point {
                    partition_key,
                    row_key,
                },
            ) => stream::once(async move { client.get_entity(&partition_key, &row_key).await })
                .boxed(),
            (Some(filter), TableQuery::Filter { .. }) => paged(move |continuation| {
                let client = Arc::clone(&client);
                let filter = filter.clone();
                async move {
                    let page = client.query_entities(&filter, continuation).await?;
                    Ok((page.entities, page.continuation))
                }
            }),
            (None, TableQuery::Filter { .. }) => stream::empty().boxed(),
        };
        Ok(stream)
    }

    /// Runs `query` against `M`'s table, yielding models.
    pub async fn query_typed<M>(
        &self,
        query: TableQuery,
    ) -> CloudMachineResult<BoxStream<'static, CloudMachineResult<M>>>
    where
        M: TableModel + Send + 'static,
    {
        Ok(into_models(self.query(M::table_name(), query).await?))
    }

    /// Drops `table` and forgets its cached client.
    pub async fn delete_table(&self, table: &str) -> CloudMachineResult<()> {
        self.tables.remove(table).await;
        self.service.delete_table(table).await
    }

    /// Number of table clients created so far.
    pub async fn cached_tables(&self) -> usize {
        self.tables.len().await
    }

    pub async fn close(&self) -> CloudMachineResult<()> {
        self.tables.drain().await;
        self.service.close().await?;
        log::info!("Table client closed");
        Ok(())
    }
}

fn into_models<M>(
    entities: BoxStream<'static, CloudMachineResult<Entity>>,
) -> BoxStream<'static, CloudMachineResult<M>>
where
    M: TableModel + Send + 'static,
{
    entities
        .and_then(|entity| async move { M::from_entity(entity) })
        .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::CloudMachineError;

    #[tokio::test]
    async fn test_empty_batch_sends_nothing() {
        let service = Arc::new(InMemoryTableService::new("memory://table"));
        let data = CloudMachineTableData::new(service.clone());

        data.insert(EntityBatch::raw("items", Vec::<Entity>::new())).await.unwrap();
        data.upsert(EntityBatch::raw("items", Vec::<Entity>::new()), false).await.unwrap();
        data.update(EntityBatch::raw("items", Vec::<Entity>::new()), true).await.unwrap();
        data.delete(EntityBatch::raw("items", Vec::<Entity>::new())).await.unwrap();

        assert!(service.transactions().is_empty());
        assert!(!service.has_table("items"));
        assert_eq!(data.cached_tables().await, 0);
    }

    #[tokio::test]
    async fn test_unknown_parameter_is_rejected_before_table_access() {
        let service = Arc::new(InMemoryTableService::new("memory://table"));
        let data = CloudMachineTableData::new(service.clone());

        let result = data
            .query("items", TableQuery::filter("Team eq @team"))
            .await;

        assert!(matches!(result, Err(CloudMachineError::InvalidQuery(_))));
        assert!(!service.has_table("items"));
    }
}
