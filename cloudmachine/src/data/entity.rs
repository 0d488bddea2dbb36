use crate::common::{CloudMachineError, CloudMachineResult};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

/// A raw table row: property name to JSON value.
pub type Entity = Map<String, Value>;

pub const PARTITION_KEY: &str = "PartitionKey";
pub const ROW_KEY: &str = "RowKey";

/// A typed row bound to a table.
///
/// The model serializes into the row's properties and must therefore carry
/// `PartitionKey` and `RowKey` fields (usually via `#[serde(rename = ...)]`).
///
/// # Examples
///
/// ```no_run
/// use cloudmachine::data::TableModel;
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Serialize, Deserialize)]
/// struct Order {
///     #[serde(rename = "PartitionKey")]
///     customer: String,
///     #[serde(rename = "RowKey")]
///     id: String,
///     total: f64,
/// }
///
/// impl TableModel for Order {
///     fn table_name() -> &'static str {
///         "orders"
///     }
/// }
/// ```
pub trait TableModel: Serialize + DeserializeOwned {
    fn table_name() -> &'static str;

    fn to_entity(&self) -> CloudMachineResult<Entity> {
        match serde_json::to_value(self)? {
            Value::Object(map) => Ok(map),
            other => Err(CloudMachineError::Serialization(format!(
                "{} must serialize to an object, got {other}",
                Self::table_name()
            ))),
        }
    }

    fn from_entity(entity: Entity) -> CloudMachineResult<Self> {
        Ok(serde_json::from_value(Value::Object(entity))?)
    }
}

/// How an update or upsert treats properties missing from the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateMode {
    /// The stored row is replaced by the payload.
    Replace,
    /// Payload properties are merged into the stored row.
    Merge,
}

impl UpdateMode {
    pub fn from_overwrite(overwrite: bool) -> Self {
        if overwrite {
            UpdateMode::Replace
        } else {
            UpdateMode::Merge
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Create,
    Upsert,
    Update,
    Delete,
}

/// One entry of a transactional batch.
#[derive(Debug, Clone, PartialEq)]
pub struct TransactionOperation {
    pub kind: OperationKind,
    pub entity: Entity,
    /// Set for upserts and updates.
    pub mode: Option<UpdateMode>,
}

impl TransactionOperation {
    pub fn new(kind: OperationKind, entity: Entity, mode: Option<UpdateMode>) -> Self {
        Self { kind, entity, mode }
    }

    pub fn partition_key(&self) -> Option<&str> {
        self.entity.get(PARTITION_KEY).and_then(Value::as_str)
    }

    pub fn row_key(&self) -> Option<&str> {
        self.entity.get(ROW_KEY).and_then(Value::as_str)
    }
}

/// Entities for one table, tagged with how they were supplied.
///
/// Built with [`EntityBatch::typed`] from models, or [`EntityBatch::raw`]
/// from a table name and maps. The tag is explicit; nothing is inferred
/// from the payload.
#[derive(Debug, Clone, PartialEq)]
pub enum EntityBatch {
    Typed {
        table: &'static str,
        entities: Vec<Entity>,
    },
    Raw {
        table: String,
        entities: Vec<Entity>,
    },
}

impl EntityBatch {
    /// Serializes `models` into a batch for their table.
    ///
    /// # Errors
    ///
    /// Any serialization failure is returned; nothing is skipped.
    pub fn typed<M: TableModel>(models: &[M]) -> CloudMachineResult<Self> {
        let entities = models
            .iter()
            .map(TableModel::to_entity)
            .collect::<CloudMachineResult<Vec<_>>>()?;
        Ok(EntityBatch::Typed {
            table: M::table_name(),
            entities,
        })
    }

    pub fn raw<I>(table: impl Into<String>, entities: I) -> Self
    where
        I: IntoIterator<Item = Entity>,
    {
        EntityBatch::Raw {
            table: table.into(),
            entities: entities.into_iter().collect(),
        }
    }

    pub fn table(&self) -> &str {
        match self {
            EntityBatch::Typed { table, .. } => table,
            EntityBatch::Raw { table, .. } => table,
        }
    }

    pub fn entities(&self) -> &[Entity] {
        match self {
            EntityBatch::Typed { entities, .. } | EntityBatch::Raw { entities, .. } => entities,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entities().is_empty()
    }

    pub fn len(&self) -> usize {
        self.entities().len()
    }

    /// Splits into the target table and one descriptor per entity.
    pub fn into_operations(
        self,
        kind: OperationKind,
        mode: Option<UpdateMode>,
    ) -> (String, Vec<TransactionOperation>) {
        let (table, entities) = match self {
            EntityBatch::Typed { table, entities } => (table.to_string(), entities),
            EntityBatch::Raw { table, entities } => (table, entities),
        };
        let operations = entities
            .into_iter()
            .map(|entity| TransactionOperation::new(kind, entity, mode))
            .collect();
        (table, operations)
    }
}
