use super::backend::{EntityPage, TableClient, TableService};
use super::entity::{Entity, OperationKind, TransactionOperation, UpdateMode};
use super::filter::Filter;
use crate::common::{CloudMachineError, CloudMachineResult};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::ops::Bound;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Maximum operations accepted in one transaction.
pub const MAX_TRANSACTION_SIZE: usize = 100;

type Key = (String, String);
type Rows = BTreeMap<Key, Entity>;
type Tables = Arc<Mutex<HashMap<String, Rows>>>;

/// A transaction as it was submitted, successful or not.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedTransaction {
    pub table: String,
    pub operations: Vec<TransactionOperation>,
}

/// Process-local table service with the table service's transaction rules.
///
/// Every submitted transaction is recorded and can be inspected with
/// [`InMemoryTableService::transactions`].
pub struct InMemoryTableService {
    endpoint: String,
    tables: Tables,
    transactions: Arc<Mutex<Vec<RecordedTransaction>>>,
    page_size: usize,
    close_count: AtomicUsize,
}

impl InMemoryTableService {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            tables: Arc::new(Mutex::new(HashMap::new())),
            transactions: Arc::new(Mutex::new(Vec::new())),
            page_size: 1000,
            close_count: AtomicUsize::new(0),
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn transactions(&self) -> Vec<RecordedTransaction> {
        lock(&self.transactions).clone()
    }

    pub fn has_table(&self, name: &str) -> bool {
        lock(&self.tables).contains_key(name)
    }

    pub fn row_count(&self, table: &str) -> usize {
        lock(&self.tables).get(table).map_or(0, BTreeMap::len)
    }

    pub fn close_count(&self) -> usize {
        self.close_count.load(Ordering::SeqCst)
    }

    fn client(&self, name: &str) -> InMemoryTableClient {
        InMemoryTableClient {
            name: name.to_string(),
            tables: Arc::clone(&self.tables),
            transactions: Arc::clone(&self.transactions),
            page_size: self.page_size,
        }
    }
}

#[async_trait]
impl TableService for InMemoryTableService {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn create_table_if_not_exists(
        &self,
        name: &str,
    ) -> CloudMachineResult<Arc<dyn TableClient>> {
        lock(&self.tables).entry(name.to_string()).or_default();
        Ok(Arc::new(self.client(name)))
    }

    async fn delete_table(&self, name: &str) -> CloudMachineResult<()> {
        lock(&self.tables)
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| service_error("delete_table", 404, "TableNotFound"))
    }

    async fn close(&self) -> CloudMachineResult<()> {
        self.close_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct InMemoryTableClient {
    name: String,
    tables: Tables,
    transactions: Arc<Mutex<Vec<RecordedTransaction>>>,
    page_size: usize,
}

impl InMemoryTableClient {
    fn page(
        &self,
        operation: &str,
        filter: Option<&Filter>,
        continuation: Option<String>,
    ) -> CloudMachineResult<EntityPage> {
        let start = match continuation {
            Some(token) => Bound::Included(decode_key(&token)?),
            None => Bound::Unbounded,
        };

        let tables = lock(&self.tables);
        let rows = tables
            .get(&self.name)
            .ok_or_else(|| service_error(operation, 404, "TableNotFound"))?;

        let mut matching = rows
            .range((start, Bound::Unbounded))
            .filter(|(_, entity)| filter.is_none_or(|f| f.matches(entity)));
        let entities = matching
            .by_ref()
            .take(self.page_size)
            .map(|(_, entity)| entity.clone())
            .collect();
        let continuation = matching.next().map(|(key, _)| encode_key(key));

        Ok(EntityPage {
            entities,
            continuation,
        })
    }
}

#[async_trait]
impl TableClient for InMemoryTableClient {
    fn table_name(&self) -> &str {
        &self.name
    }

    async fn submit_transaction(
        &self,
        operations: Vec<TransactionOperation>,
    ) -> CloudMachineResult<()> {
        lock(&self.transactions).push(RecordedTransaction {
            table: self.name.clone(),
            operations: operations.clone(),
        });

        let keyed = validate(&operations)?;

        let mut tables = lock(&self.tables);
        let rows = tables
            .get_mut(&self.name)
            .ok_or_else(|| service_error("submit_transaction", 404, "TableNotFound"))?;

        // applied to a copy so a failing operation leaves the table untouched
        let mut staged = rows.clone();
        for (key, operation) in keyed.into_iter().zip(operations) {
            apply(&mut staged, key, operation)?;
        }
        *rows = staged;
        Ok(())
    }

    async fn list_entities(&self, continuation: Option<String>) -> CloudMachineResult<EntityPage> {
        self.page("list_entities", None, continuation)
    }

    async fn query_entities(
        &self,
        filter: &str,
        continuation: Option<String>,
    ) -> CloudMachineResult<EntityPage> {
        let filter = Filter::parse(filter)?;
        self.page("query_entities", Some(&filter), continuation)
    }

    async fn get_entity(&self, partition_key: &str, row_key: &str) -> CloudMachineResult<Entity> {
        let tables = lock(&self.tables);
        let rows = tables
            .get(&self.name)
            .ok_or_else(|| service_error("get_entity", 404, "TableNotFound"))?;
        rows.get(&(partition_key.to_string(), row_key.to_string()))
            .cloned()
            .ok_or_else(|| service_error("get_entity", 404, "ResourceNotFound"))
    }
}

/// Checks the batch-wide rules and extracts each operation's key.
fn validate(operations: &[TransactionOperation]) -> CloudMachineResult<Vec<Key>> {
    if operations.len() > MAX_TRANSACTION_SIZE {
        return Err(service_error("submit_transaction", 400, "InvalidInput"));
    }

    let mut keys = Vec::with_capacity(operations.len());
    let mut seen = HashSet::new();
    for operation in operations {
        let (Some(partition_key), Some(row_key)) = (operation.partition_key(), operation.row_key())
        else {
            return Err(service_error("submit_transaction", 400, "PropertiesNeedValue"));
        };
        if keys
            .first()
            .is_some_and(|(first, _): &Key| first != partition_key)
        {
            return Err(service_error(
                "submit_transaction",
                400,
                "CommandsInBatchActOnDifferentPartitions",
            ));
        }
        if !seen.insert(row_key.to_string()) {
            return Err(service_error("submit_transaction", 400, "InvalidDuplicateRow"));
        }
        keys.push((partition_key.to_string(), row_key.to_string()));
    }
    Ok(keys)
}

fn apply(rows: &mut Rows, key: Key, operation: TransactionOperation) -> CloudMachineResult<()> {
    let mode = operation.mode.unwrap_or(UpdateMode::Replace);
    match operation.kind {
        OperationKind::Create => {
            if rows.contains_key(&key) {
                return Err(service_error("submit_transaction", 409, "EntityAlreadyExists"));
            }
            rows.insert(key, operation.entity);
        }
        OperationKind::Upsert => match rows.get_mut(&key) {
            Some(existing) if mode == UpdateMode::Merge => existing.extend(operation.entity),
            _ => {
                rows.insert(key, operation.entity);
            }
        },
        OperationKind::Update => {
            let existing = rows
                .get_mut(&key)
                .ok_or_else(|| service_error("submit_transaction", 404, "ResourceNotFound"))?;
            match mode {
                UpdateMode::Replace => *existing = operation.entity,
                UpdateMode::Merge => existing.extend(operation.entity),
            }
        }
        OperationKind::Delete => {
            rows.remove(&key)
                .ok_or_else(|| service_error("submit_transaction", 404, "ResourceNotFound"))?;
        }
    }
    Ok(())
}

fn encode_key(key: &Key) -> String {
    serde_json::json!([key.0, key.1]).to_string()
}

fn decode_key(token: &str) -> CloudMachineResult<Key> {
    serde_json::from_str(token)
        .map_err(|e| CloudMachineError::InvalidQuery(format!("Invalid continuation token: {e}")))
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn service_error(operation: &str, status: u16, code: &str) -> CloudMachineError {
    CloudMachineError::Service {
        operation: operation.to_string(),
        status,
        code: code.to_string(),
        message: format!("{code} (in-memory table service)"),
        request_id: None,
    }
}
