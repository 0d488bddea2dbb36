use super::backend::{BlobPage, BlobRange, BlobService, ContainerClient, StorageFile};
use crate::common::{CloudMachineError, CloudMachineResult};
use crate::credential::TokenCredential;
use crate::pipeline::{RestPipeline, encode_path, join_url};
use crate::transport::{HttpRequest, HttpTransport};
use async_trait::async_trait;
use reqwest::Method;
use serde::Deserialize;
use std::sync::Arc;

const BLOB_API_VERSION: &str = "2023-11-03";

/// Blob service spoken over the Blob REST API.
pub struct RestBlobService {
    pipeline: RestPipeline,
    account_url: String,
}

impl RestBlobService {
    pub fn new(
        account_url: impl Into<String>,
        transport: Arc<dyn HttpTransport>,
        credential: Arc<dyn TokenCredential>,
    ) -> Self {
        Self {
            pipeline: RestPipeline::new(transport, credential, BLOB_API_VERSION),
            account_url: account_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn container(&self, name: &str) -> RestContainerClient {
        RestContainerClient {
            pipeline: self.pipeline.clone(),
            container_url: join_url(&self.account_url, &encode_path(name)),
            name: name.to_string(),
        }
    }
}

#[async_trait]
impl BlobService for RestBlobService {
    fn account_url(&self) -> &str {
        &self.account_url
    }

    fn container_client(&self, name: &str) -> Arc<dyn ContainerClient> {
        Arc::new(self.container(name))
    }

    async fn create_container(&self, name: &str) -> CloudMachineResult<Arc<dyn ContainerClient>> {
        let container = self.container(name);
        let request = HttpRequest::new(
            Method::PUT,
            format!("{}?restype=container", container.container_url),
        );
        self.pipeline.send("create_container", request).await?;

        log::info!("Created container '{name}'");
        Ok(Arc::new(container))
    }

    async fn delete_container(&self, name: &str) -> CloudMachineResult<()> {
        self.container(name).delete_container().await
    }

    async fn close(&self) -> CloudMachineResult<()> {
        self.pipeline.transport().close().await
    }
}

/// Client for one container of a [`RestBlobService`].
pub struct RestContainerClient {
    pipeline: RestPipeline,
    container_url: String,
    name: String,
}

impl RestContainerClient {
    fn blob_url(&self, name: &str) -> String {
        join_url(&self.container_url, &encode_path(name))
    }
}

#[async_trait]
impl ContainerClient for RestContainerClient {
    fn container_name(&self) -> &str {
        &self.name
    }

    async fn list_blobs(
        &self,
        prefix: Option<&str>,
        marker: Option<String>,
    ) -> CloudMachineResult<BlobPage> {
        let mut url = format!("{}?restype=container&comp=list", self.container_url);
        if let Some(prefix) = prefix.filter(|p| !p.is_empty()) {
            url.push_str(&format!("&prefix={}", urlencoding::encode(prefix)));
        }
        if let Some(marker) = marker.as_deref() {
            url.push_str(&format!("&marker={}", urlencoding::encode(marker)));
        }

        let response = self
            .pipeline
            .send("list_blobs", HttpRequest::new(Method::GET, url))
            .await?;

        let results = parse_blob_listing(&response.text())?;
        let next_marker = results.next_marker();
        Ok(BlobPage {
            items: results
                .into_iter_files()
                .map(|mut file| {
                    file.url = self.blob_url(&file.name);
                    file
                })
                .collect(),
            next_marker,
        })
    }

    async fn upload_blob(
        &self,
        name: &str,
        data: Vec<u8>,
        content_type: Option<&str>,
        overwrite: bool,
    ) -> CloudMachineResult<StorageFile> {
        let content_type = content_type.unwrap_or("application/octet-stream");
        let content_length = data.len() as u64;
        let mut request = HttpRequest::new(Method::PUT, self.blob_url(name))
            .header("x-ms-blob-type", "BlockBlob")
            .header("Content-Type", content_type)
            .body(data);
        if !overwrite {
            request = request.header("If-None-Match", "*");
        }

        let response = self.pipeline.send("upload_blob", request).await?;

        Ok(StorageFile {
            name: name.to_string(),
            content_length,
            content_type: Some(content_type.to_string()),
            etag: response.header("etag").map(str::to_string),
            url: self.blob_url(name),
            content: None,
        })
    }

    async fn download_range(
        &self,
        name: &str,
        offset: u64,
        length: u64,
    ) -> CloudMachineResult<BlobRange> {
        let end = offset + length.max(1) - 1;
        let request = HttpRequest::new(Method::GET, self.blob_url(name))
            .header("x-ms-range", format!("bytes={offset}-{end}"));

        let response = self.pipeline.send_raw(request).await?;
        if response.status == 416 {
            // past the end, or an empty blob
            let total_length = response
                .header("content-range")
                .and_then(content_range_total)
                .unwrap_or(offset);
            return Ok(BlobRange {
                data: Vec::new(),
                total_length,
            });
        }
        if !response.is_success() {
            return Err(CloudMachineError::from_response("download_blob", &response));
        }

        let total_length = response
            .header("content-range")
            .and_then(content_range_total)
            .unwrap_or(response.body.len() as u64);
        Ok(BlobRange {
            data: response.body,
            total_length,
        })
    }

    async fn delete_blob(&self, name: &str) -> CloudMachineResult<()> {
        self.pipeline
            .send(
                "delete_blob",
                HttpRequest::new(Method::DELETE, self.blob_url(name)),
            )
            .await?;
        Ok(())
    }

    async fn delete_container(&self) -> CloudMachineResult<()> {
        let request = HttpRequest::new(
            Method::DELETE,
            format!("{}?restype=container", self.container_url),
        );
        self.pipeline.send("delete_container", request).await?;

        log::info!("Deleted container '{}'", self.name);
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct EnumerationResults {
    #[serde(rename = "Blobs", default)]
    blobs: BlobList,
    #[serde(rename = "NextMarker", default)]
    next_marker: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct BlobList {
    #[serde(rename = "Blob", default)]
    blob: Vec<BlobItem>,
}

#[derive(Debug, Deserialize)]
struct BlobItem {
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "Properties", default)]
    properties: BlobProperties,
}

#[derive(Debug, Default, Deserialize)]
struct BlobProperties {
    #[serde(rename = "Etag", default)]
    etag: Option<String>,
    #[serde(rename = "Content-Length", default)]
    content_length: Option<u64>,
    #[serde(rename = "Content-Type", default)]
    content_type: Option<String>,
}

impl EnumerationResults {
    fn next_marker(&self) -> Option<String> {
        self.next_marker
            .as_deref()
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .map(str::to_string)
    }

    fn into_iter_files(self) -> impl Iterator<Item = StorageFile> {
        self.blobs.blob.into_iter().map(|blob| StorageFile {
            name: blob.name,
            content_length: blob.properties.content_length.unwrap_or(0),
            content_type: blob.properties.content_type.filter(|t| !t.is_empty()),
            etag: blob.properties.etag,
            url: String::new(),
            content: None,
        })
    }
}

fn parse_blob_listing(xml: &str) -> CloudMachineResult<EnumerationResults> {
    let xml = xml.trim_start_matches('\u{feff}');
    Ok(quick_xml::de::from_str(xml)?)
}

/// Total size from a `Content-Range: bytes 0-99/1234` or `bytes */1234` header.
fn content_range_total(value: &str) -> Option<u64> {
    value.rsplit('/').next()?.trim().parse().ok()
}
