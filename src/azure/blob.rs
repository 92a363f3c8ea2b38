//! Blob Storage implementation of the [`BlobStore`] seam.

use std::time::Duration;

use chrono::Utc;
use reqwest::{Client, Method, StatusCode};
use serde::Deserialize;

use crate::store::{BlobItem, BlobStore, SasPermission, StoreFuture, TimeLimitedUrl};

use super::auth::{CanonicalRequest, SharedKey, encode_path, rfc1123};
use super::error::AzureError;

/// Storage REST API version sent with every request.
pub const STORAGE_API_VERSION: &str = "2021-08-06";

const OCTET_STREAM: &str = "application/octet-stream";

/// Object-store client for an Azure Storage account, authenticated with the
/// account's shared key.
#[derive(Clone, Debug)]
pub struct AzureBlobStore {
    http: Client,
    key: SharedKey,
    endpoint: String,
}

impl AzureBlobStore {
    /// Constructs a client for the account's default blob endpoint.
    ///
    /// # Errors
    ///
    /// Returns [`AzureError::InvalidKey`] when the key is not valid base64.
    pub fn new(account: &str, base64_key: &str) -> Result<Self, AzureError> {
        let endpoint = format!("https://{}.blob.core.windows.net", account.trim());
        Self::with_endpoint(account, base64_key, endpoint)
    }

    /// Constructs a client against an explicit endpoint, for emulators and
    /// sovereign-cloud domains.
    ///
    /// # Errors
    ///
    /// Returns [`AzureError::InvalidKey`] when the key is not valid base64,
    /// or [`AzureError::InvalidEndpoint`] for a blank endpoint.
    pub fn with_endpoint(
        account: &str,
        base64_key: &str,
        endpoint: impl Into<String>,
    ) -> Result<Self, AzureError> {
        let endpoint = endpoint.into().trim().trim_end_matches('/').to_owned();
        if endpoint.is_empty() {
            return Err(AzureError::InvalidEndpoint {
                service: "storage",
                endpoint,
            });
        }
        Ok(Self {
            http: Client::new(),
            key: SharedKey::new("storage", account, base64_key)?,
            endpoint,
        })
    }

    async fn send(
        &self,
        operation: &'static str,
        method: Method,
        request: CanonicalRequest,
        url: String,
        body: Vec<u8>,
    ) -> Result<(StatusCode, Vec<u8>), AzureError> {
        let mut builder = self
            .http
            .request(method, url)
            .header("Authorization", self.key.authorization(&request));
        for (name, value) in request.headers() {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if !request.content_type_value().is_empty() {
            builder = builder.header("Content-Type", request.content_type_value());
        }
        if !body.is_empty() {
            builder = builder.body(body);
        }

        let response = builder
            .send()
            .await
            .map_err(|err| AzureError::transport(operation, &err))?;
        let status = response.status();
        let bytes = response
            .bytes()
            .await
            .map_err(|err| AzureError::transport(operation, &err))?;
        Ok((status, bytes.to_vec()))
    }

    fn service_error(operation: &'static str, status: StatusCode, body: &[u8]) -> AzureError {
        let message = String::from_utf8_lossy(body);
        let message = message.trim();
        AzureError::Service {
            operation,
            status: status.as_u16(),
            message: if message.is_empty() {
                status
                    .canonical_reason()
                    .unwrap_or("no response body")
                    .to_owned()
            } else {
                message.to_owned()
            },
        }
    }

    fn base_request(method: &'static str, path: &str) -> CanonicalRequest {
        CanonicalRequest::new(method, path)
            .service_header("x-ms-date", rfc1123(Utc::now()))
            .service_header("x-ms-version", STORAGE_API_VERSION)
    }

    fn container_request_url(&self, container: &str) -> String {
        format!("{}/{container}?restype=container", self.endpoint)
    }
}

/// Shape of the `List Blobs` XML response; unknown elements are ignored.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct EnumerationResults {
    blobs: Option<BlobsNode>,
}

#[derive(Debug, Deserialize)]
struct BlobsNode {
    #[serde(rename = "Blob", default)]
    entries: Vec<BlobEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct BlobEntry {
    name: String,
    #[serde(default)]
    properties: Option<BlobEntryProperties>,
}

#[derive(Debug, Deserialize)]
struct BlobEntryProperties {
    #[serde(rename = "Content-Length", default)]
    content_length: Option<u64>,
}

impl BlobStore for AzureBlobStore {
    type Error = AzureError;

    fn create_container<'a>(&'a self, name: &'a str) -> StoreFuture<'a, (), Self::Error> {
        Box::pin(async move {
            let operation = "create container";
            let request = Self::base_request("PUT", &format!("/{name}"))
                .query_param("restype", "container");
            let url = self.container_request_url(name);
            let (status, body) = self.send(operation, Method::PUT, request, url, Vec::new()).await?;
            if status == StatusCode::CREATED {
                return Ok(());
            }
            Err(Self::service_error(operation, status, &body))
        })
    }

    fn delete_container<'a>(&'a self, name: &'a str) -> StoreFuture<'a, (), Self::Error> {
        Box::pin(async move {
            let operation = "delete container";
            let request = Self::base_request("DELETE", &format!("/{name}"))
                .query_param("restype", "container");
            let url = self.container_request_url(name);
            let (status, body) = self
                .send(operation, Method::DELETE, request, url, Vec::new())
                .await?;
            // Already-absent counts as deleted.
            if status == StatusCode::ACCEPTED || status == StatusCode::NOT_FOUND {
                return Ok(());
            }
            Err(Self::service_error(operation, status, &body))
        })
    }

    fn put_blob<'a>(
        &'a self,
        container: &'a str,
        name: &'a str,
        body: Vec<u8>,
    ) -> StoreFuture<'a, (), Self::Error> {
        Box::pin(async move {
            let operation = "put blob";
            let request = Self::base_request("PUT", &format!("/{container}/{name}"))
                .content(body.len(), OCTET_STREAM)
                .service_header("x-ms-blob-type", "BlockBlob");
            let url = format!("{}/{container}/{}", self.endpoint, encode_path(name));
            let (status, response) = self.send(operation, Method::PUT, request, url, body).await?;
            if status == StatusCode::CREATED {
                return Ok(());
            }
            Err(Self::service_error(operation, status, &response))
        })
    }

    fn get_blob<'a>(
        &'a self,
        container: &'a str,
        name: &'a str,
    ) -> StoreFuture<'a, Vec<u8>, Self::Error> {
        Box::pin(async move {
            let operation = "get blob";
            let request = Self::base_request("GET", &format!("/{container}/{name}"));
            let url = format!("{}/{container}/{}", self.endpoint, encode_path(name));
            let (status, body) = self.send(operation, Method::GET, request, url, Vec::new()).await?;
            if status == StatusCode::OK {
                return Ok(body);
            }
            Err(Self::service_error(operation, status, &body))
        })
    }

    fn list_blobs<'a>(&'a self, container: &'a str) -> StoreFuture<'a, Vec<BlobItem>, Self::Error> {
        Box::pin(async move {
            let operation = "list blobs";
            let request = Self::base_request("GET", &format!("/{container}"))
                .query_param("restype", "container")
                .query_param("comp", "list");
            let url = format!(
                "{}/{container}?restype=container&comp=list",
                self.endpoint
            );
            let (status, body) = self.send(operation, Method::GET, request, url, Vec::new()).await?;
            if status != StatusCode::OK {
                return Err(Self::service_error(operation, status, &body));
            }

            let text = String::from_utf8_lossy(&body);
            let parsed: EnumerationResults =
                quick_xml::de::from_str(&text).map_err(|err| AzureError::Response {
                    operation,
                    message: err.to_string(),
                })?;
            Ok(parsed
                .blobs
                .map(|node| node.entries)
                .unwrap_or_default()
                .into_iter()
                .map(|entry| BlobItem {
                    name: entry.name,
                    size: entry.properties.and_then(|props| props.content_length),
                })
                .collect())
        })
    }

    fn container_url<'a>(
        &'a self,
        container: &'a str,
        permission: SasPermission,
        ttl: Duration,
    ) -> StoreFuture<'a, TimeLimitedUrl, Self::Error> {
        Box::pin(async move {
            let ttl_seconds = i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX);
            let expires_at = Utc::now() + chrono::Duration::seconds(ttl_seconds);
            let query = self
                .key
                .container_sas(container, permission.token(), expires_at);
            Ok(TimeLimitedUrl {
                url: format!("{}/{container}?{query}", self.endpoint),
                query,
                permission,
                expires_at,
            })
        })
    }

    fn blob_url(&self, container: &str, name: &str, capability: &TimeLimitedUrl) -> String {
        format!(
            "{}/{container}/{}?{}",
            self.endpoint,
            encode_path(name),
            capability.query
        )
    }
}
