use super::backend::{EntityPage, TableClient, TableService};
use super::entity::{Entity, OperationKind, TransactionOperation, UpdateMode};
use crate::common::{CloudMachineError, CloudMachineResult};
use crate::credential::TokenCredential;
use crate::pipeline::{RestPipeline, join_url};
use crate::transport::{HttpRequest, HttpResponse, HttpTransport};
use async_trait::async_trait;
use reqwest::Method;
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;

const TABLE_API_VERSION: &str = "2019-02-02";
const JSON_NO_METADATA: &str = "application/json;odata=nometadata";
const NEXT_PARTITION_KEY: &str = "x-ms-continuation-nextpartitionkey";
const NEXT_ROW_KEY: &str = "x-ms-continuation-nextrowkey";

/// Table service spoken over the Table REST API.
pub struct RestTableService {
    pipeline: RestPipeline,
    endpoint: String,
}

impl RestTableService {
    pub fn new(
        endpoint: impl Into<String>,
        transport: Arc<dyn HttpTransport>,
        credential: Arc<dyn TokenCredential>,
    ) -> Self {
        Self {
            pipeline: RestPipeline::new(transport, credential, TABLE_API_VERSION),
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
        }
    }

    fn table(&self, name: &str) -> RestTableClient {
        RestTableClient {
            pipeline: self.pipeline.clone(),
            endpoint: self.endpoint.clone(),
            name: name.to_string(),
        }
    }
}

fn odata_request(method: Method, url: String) -> HttpRequest {
    HttpRequest::new(method, url)
        .header("Accept", JSON_NO_METADATA)
        .header("DataServiceVersion", "3.0")
        .header("MaxDataServiceVersion", "3.0;NetFx")
}

#[async_trait]
impl TableService for RestTableService {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn create_table_if_not_exists(
        &self,
        name: &str,
    ) -> CloudMachineResult<Arc<dyn TableClient>> {
        let body = serde_json::to_vec(&json!({ "TableName": name }))?;
        let request = odata_request(Method::POST, join_url(&self.endpoint, "Tables"))
            .header("Content-Type", "application/json")
            .header("Prefer", "return-no-content")
            .body(body);

        let response = self.pipeline.send_raw(request).await?;
        match response.status {
            status if (200..300).contains(&status) => log::info!("Created table '{name}'"),
            409 => log::debug!("Table '{name}' already exists"),
            _ => return Err(CloudMachineError::from_response("create_table", &response)),
        }
        Ok(Arc::new(self.table(name)))
    }

    async fn delete_table(&self, name: &str) -> CloudMachineResult<()> {
        let url = join_url(
            &self.endpoint,
            &format!("Tables('{}')", encode_key(name)),
        );
        self.pipeline
            .send("delete_table", odata_request(Method::DELETE, url))
            .await?;

        log::info!("Deleted table '{name}'");
        Ok(())
    }

    async fn close(&self) -> CloudMachineResult<()> {
        self.pipeline.transport().close().await
    }
}

/// Client for one table of a [`RestTableService`].
pub struct RestTableClient {
    pipeline: RestPipeline,
    endpoint: String,
    name: String,
}

impl RestTableClient {
    fn entity_url(&self, partition_key: &str, row_key: &str) -> String {
        join_url(
            &self.endpoint,
            &format!(
                "{}(PartitionKey='{}',RowKey='{}')",
                self.name,
                encode_key(partition_key),
                encode_key(row_key)
            ),
        )
    }

    fn operation_request(&self, operation: &TransactionOperation) -> CloudMachineResult<HttpRequest> {
        if operation.kind == OperationKind::Create {
            let body = serde_json::to_vec(&operation.entity)?;
            return Ok(odata_request(Method::POST, join_url(&self.endpoint, &self.name))
                .header("Content-Type", "application/json")
                .header("Prefer", "return-no-content")
                .body(body));
        }

        let (Some(partition_key), Some(row_key)) = (operation.partition_key(), operation.row_key())
        else {
            return Err(CloudMachineError::Serialization(
                "Entity must have string PartitionKey and RowKey properties".to_string(),
            ));
        };
        let url = self.entity_url(partition_key, row_key);

        let request = match operation.kind {
            OperationKind::Delete => odata_request(Method::DELETE, url).header("If-Match", "*"),
            kind => {
                let method = match operation.mode.unwrap_or(UpdateMode::Replace) {
                    UpdateMode::Replace => Method::PUT,
                    UpdateMode::Merge => merge_method()?,
                };
                let mut request = odata_request(method, url)
                    .header("Content-Type", "application/json")
                    .body(serde_json::to_vec(&operation.entity)?);
                if kind == OperationKind::Update {
                    request = request.header("If-Match", "*");
                }
                request
            }
        };
        Ok(request)
    }

    async fn fetch_page(
        &self,
        filter: Option<&str>,
        continuation: Option<String>,
    ) -> CloudMachineResult<EntityPage> {
        let mut query: Vec<String> = Vec::new();
        if let Some(filter) = filter {
            query.push(format!("$filter={}", urlencoding::encode(filter)));
        }
        if let Some(token) = continuation.as_deref() {
            let (partition_key, row_key) = decode_continuation(token)?;
            query.push(format!(
                "NextPartitionKey={}",
                urlencoding::encode(&partition_key)
            ));
            if let Some(row_key) = row_key {
                query.push(format!("NextRowKey={}", urlencoding::encode(&row_key)));
            }
        }

        let mut url = join_url(&self.endpoint, &format!("{}()", self.name));
        if !query.is_empty() {
            url = format!("{url}?{}", query.join("&"));
        }

        let response = self
            .pipeline
            .send("query_entities", odata_request(Method::GET, url))
            .await?;

        #[derive(Deserialize)]
        struct QueryResponse {
            #[serde(default)]
            value: Vec<Entity>,
        }
        let body: QueryResponse = response.json()?;

        Ok(EntityPage {
            entities: body.value.into_iter().map(strip_metadata).collect(),
            continuation: encode_continuation(&response),
        })
    }
}

#[async_trait]
impl TableClient for RestTableClient {
    fn table_name(&self) -> &str {
        &self.name
    }

    async fn submit_transaction(
        &self,
        operations: Vec<TransactionOperation>,
    ) -> CloudMachineResult<()> {
        if operations.is_empty() {
            return Ok(());
        }

        let requests = operations
            .iter()
            .map(|operation| self.operation_request(operation))
            .collect::<CloudMachineResult<Vec<_>>>()?;
        let batch_boundary = format!("batch_{}", uuid::Uuid::new_v4());
        let changeset_boundary = format!("changeset_{}", uuid::Uuid::new_v4());
        let body = encode_batch(&requests, &batch_boundary, &changeset_boundary);

        let request = odata_request(Method::POST, join_url(&self.endpoint, "$batch"))
            .header(
                "Content-Type",
                format!("multipart/mixed; boundary={batch_boundary}"),
            )
            .body(body);

        let response = self.pipeline.send("submit_transaction", request).await?;
        if let Some(error) = batch_failure(&response) {
            return Err(error);
        }

        log::debug!(
            "Committed {} operation(s) to table '{}'",
            operations.len(),
            self.name
        );
        Ok(())
    }

    async fn list_entities(&self, continuation: Option<String>) -> CloudMachineResult<EntityPage> {
        self.fetch_page(None, continuation).await
    }

    async fn query_entities(
        &self,
        filter: &str,
        continuation: Option<String>,
    ) -> CloudMachineResult<EntityPage> {
        self.fetch_page(Some(filter), continuation).await
    }

    async fn get_entity(&self, partition_key: &str, row_key: &str) -> CloudMachineResult<Entity> {
        let response = self
            .pipeline
            .send(
                "get_entity",
                odata_request(Method::GET, self.entity_url(partition_key, row_key)),
            )
            .await?;
        Ok(strip_metadata(response.json()?))
    }
}

fn merge_method() -> CloudMachineResult<Method> {
    Method::from_bytes(b"MERGE")
        .map_err(|e| CloudMachineError::Internal(format!("Invalid HTTP method: {e}")))
}

/// Escapes a key for use inside a quoted OData key predicate.
fn encode_key(key: &str) -> String {
    urlencoding::encode(&key.replace('\'', "''")).into_owned()
}

fn strip_metadata(mut entity: Entity) -> Entity {
    entity.retain(|key, _| !key.starts_with("odata."));
    entity
}

fn encode_continuation(response: &HttpResponse) -> Option<String> {
    let partition_key = response.header(NEXT_PARTITION_KEY)?;
    let row_key = response.header(NEXT_ROW_KEY);
    Some(json!([partition_key, row_key]).to_string())
}

fn decode_continuation(token: &str) -> CloudMachineResult<(String, Option<String>)> {
    let (partition_key, row_key): (String, Option<String>) = serde_json::from_str(token)
        .map_err(|e| CloudMachineError::InvalidQuery(format!("Invalid continuation token: {e}")))?;
    Ok((partition_key, row_key))
}

/// Serializes requests into one `$batch` body holding a single changeset.
fn encode_batch(requests: &[HttpRequest], batch: &str, changeset: &str) -> Vec<u8> {
    let mut body = String::new();
    body.push_str(&format!("--{batch}\r\n"));
    body.push_str(&format!(
        "Content-Type: multipart/mixed; boundary={changeset}\r\n\r\n"
    ));

    for request in requests {
        body.push_str(&format!("--{changeset}\r\n"));
        body.push_str("Content-Type: application/http\r\n");
        body.push_str("Content-Transfer-Encoding: binary\r\n\r\n");
        body.push_str(&format!("{} {} HTTP/1.1\r\n", request.method, request.url));
        for (name, value) in &request.headers {
            body.push_str(&format!("{name}: {value}\r\n"));
        }
        body.push_str("\r\n");
        body.push_str(&String::from_utf8_lossy(&request.body));
        body.push_str("\r\n");
    }

    body.push_str(&format!("--{changeset}--\r\n"));
    body.push_str(&format!("--{batch}--\r\n"));
    body.into_bytes()
}

/// The first failed sub-response of a `$batch` reply, if any.
fn batch_failure(response: &HttpResponse) -> Option<CloudMachineError> {
    let text = response.text();
    let mut lines = text.lines();

    while let Some(line) = lines.next() {
        let Some(status) = line
            .strip_prefix("HTTP/1.1 ")
            .and_then(|rest| rest.split_whitespace().next())
            .and_then(|code| code.parse::<u16>().ok())
        else {
            continue;
        };
        if status < 400 {
            continue;
        }

        let detail = lines
            .by_ref()
            .find(|l| l.trim_start().starts_with('{'))
            .and_then(|l| serde_json::from_str::<Value>(l.trim()).ok());
        let code = detail
            .as_ref()
            .and_then(|d| d.pointer("/odata.error/code"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| format!("HTTP_{status}"));
        let message = detail
            .as_ref()
            .and_then(|d| d.pointer("/odata.error/message/value"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| format!("HTTP {status} error"));

        return Some(CloudMachineError::Service {
            operation: "submit_transaction".to_string(),
            status,
            code,
            message,
            request_id: response.header("x-ms-request-id").map(str::to_string),
        });
    }
    None
}
