//! Batch service implementation of the [`ComputeBackend`] seam.

use chrono::Utc;
use reqwest::{Client, Method, StatusCode};
use serde::{Deserialize, Serialize};

use crate::compute::{ComputeBackend, ComputeFuture, PoolSpec, TaskSpec, TaskStatus};

use super::auth::{CanonicalRequest, SharedKey, rfc1123};
use super::error::AzureError;

/// Batch REST API version sent with every request.
pub const BATCH_API_VERSION: &str = "2023-11-01.18.0";

/// Node agent matching the Ubuntu images the pools boot from.
const NODE_AGENT_SKU: &str = "batch.node.ubuntu 22.04";

const JSON_CONTENT_TYPE: &str = "application/json; odata=minimalmetadata";

/// Compute client for an Azure Batch account, authenticated with the
/// account's shared key.
#[derive(Clone, Debug)]
pub struct AzureBatchClient {
    http: Client,
    key: SharedKey,
    base_url: String,
}

impl AzureBatchClient {
    /// Constructs a client for a batch account endpoint.
    ///
    /// # Errors
    ///
    /// Returns [`AzureError::InvalidKey`] when the key is not valid base64,
    /// or [`AzureError::InvalidEndpoint`] for a blank endpoint.
    pub fn new(
        account: &str,
        base64_key: &str,
        base_url: impl Into<String>,
    ) -> Result<Self, AzureError> {
        let base_url = base_url.into().trim().trim_end_matches('/').to_owned();
        if base_url.is_empty() {
            return Err(AzureError::InvalidEndpoint {
                service: "batch",
                endpoint: base_url,
            });
        }
        Ok(Self {
            http: Client::new(),
            key: SharedKey::new("batch", account, base64_key)?,
            base_url,
        })
    }

    async fn send(
        &self,
        operation: &'static str,
        method: Method,
        path: &str,
        body: Option<Vec<u8>>,
    ) -> Result<(StatusCode, Vec<u8>), AzureError> {
        let body = body.unwrap_or_default();
        let mut request = CanonicalRequest::new(method_name(&method), path)
            .service_header("ocp-date", rfc1123(Utc::now()))
            .query_param("api-version", BATCH_API_VERSION);
        if !body.is_empty() {
            request = request.content(body.len(), JSON_CONTENT_TYPE);
        }

        let url = format!("{}{path}?api-version={BATCH_API_VERSION}", self.base_url);
        let mut builder = self
            .http
            .request(method, url)
            .header("Authorization", self.key.authorization(&request));
        for (name, value) in request.headers() {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if !body.is_empty() {
            builder = builder
                .header("Content-Type", JSON_CONTENT_TYPE)
                .body(body);
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

    async fn send_json<T: Serialize>(
        &self,
        operation: &'static str,
        path: &str,
        payload: &T,
    ) -> Result<(StatusCode, Vec<u8>), AzureError> {
        let body = serde_json::to_vec(payload).map_err(|err| AzureError::Response {
            operation,
            message: err.to_string(),
        })?;
        self.send(operation, Method::POST, path, Some(body)).await
    }

    fn service_error(operation: &'static str, status: StatusCode, body: &[u8]) -> AzureError {
        let code = serde_json::from_slice::<BatchErrorBody>(body)
            .ok()
            .and_then(|err| err.code);
        let message = code.unwrap_or_else(|| {
            let text = String::from_utf8_lossy(body);
            let text = text.trim();
            if text.is_empty() {
                status
                    .canonical_reason()
                    .unwrap_or("no response body")
                    .to_owned()
            } else {
                text.to_owned()
            }
        });
        AzureError::Service {
            operation,
            status: status.as_u16(),
            message,
        }
    }

    fn accept_delete(
        operation: &'static str,
        status: StatusCode,
        body: &[u8],
    ) -> Result<(), AzureError> {
        // 404 means the resource is already gone, which is the goal.
        if status == StatusCode::ACCEPTED || status == StatusCode::OK || status == StatusCode::NOT_FOUND
        {
            return Ok(());
        }
        Err(Self::service_error(operation, status, body))
    }
}

/// `'static` method name for canonicalization.
fn method_name(method: &Method) -> &'static str {
    match method.as_str() {
        "PUT" => "PUT",
        "POST" => "POST",
        "DELETE" => "DELETE",
        _ => "GET",
    }
}

#[derive(Debug, Deserialize)]
struct BatchErrorBody {
    code: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PoolAddBody<'a> {
    id: &'a str,
    vm_size: &'a str,
    virtual_machine_configuration: VmConfiguration<'a>,
    target_dedicated_nodes: u32,
    target_low_priority_nodes: u32,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct VmConfiguration<'a> {
    image_reference: ImageReference<'a>,
    node_agent_sku_id: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ImageReference<'a> {
    virtual_machine_image_id: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct JobAddBody<'a> {
    id: &'a str,
    pool_info: PoolInfo<'a>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PoolInfo<'a> {
    pool_id: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TaskAddBody<'a> {
    id: &'a str,
    command_line: &'a str,
    resource_files: Vec<ResourceFileBody<'a>>,
    output_files: Vec<OutputFileBody<'a>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ResourceFileBody<'a> {
    http_url: &'a str,
    file_path: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct OutputFileBody<'a> {
    file_pattern: &'a str,
    destination: OutputDestinationBody<'a>,
    upload_options: UploadOptionsBody,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct OutputDestinationBody<'a> {
    container: ContainerDestinationBody<'a>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ContainerDestinationBody<'a> {
    container_url: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    path: Option<&'a str>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct UploadOptionsBody {
    upload_condition: &'static str,
}

#[derive(Debug, Deserialize)]
struct TaskListBody {
    #[serde(default)]
    value: Vec<TaskListEntry>,
}

#[derive(Debug, Deserialize)]
struct TaskListEntry {
    state: TaskStatus,
}

fn task_body<'a>(task: &'a TaskSpec) -> TaskAddBody<'a> {
    TaskAddBody {
        id: &task.id,
        command_line: &task.command_line,
        resource_files: task
            .resource_files
            .iter()
            .map(|file| ResourceFileBody {
                http_url: &file.url,
                file_path: &file.remote_path,
            })
            .collect(),
        output_files: task
            .output_captures
            .iter()
            .map(|capture| OutputFileBody {
                file_pattern: &capture.pattern,
                destination: OutputDestinationBody {
                    container: ContainerDestinationBody {
                        container_url: &capture.container_url,
                        path: capture.path.as_deref(),
                    },
                },
                upload_options: UploadOptionsBody {
                    upload_condition: if capture.on_success_only {
                        "taskSuccess"
                    } else {
                        "taskCompletion"
                    },
                },
            })
            .collect(),
    }
}

impl ComputeBackend for AzureBatchClient {
    type Error = AzureError;

    fn create_pool<'a>(&'a self, pool: &'a PoolSpec) -> ComputeFuture<'a, (), Self::Error> {
        Box::pin(async move {
            let operation = "create pool";
            let payload = PoolAddBody {
                id: &pool.id,
                vm_size: &pool.vm_size,
                virtual_machine_configuration: VmConfiguration {
                    image_reference: ImageReference {
                        virtual_machine_image_id: &pool.vm_image,
                    },
                    node_agent_sku_id: NODE_AGENT_SKU,
                },
                target_dedicated_nodes: pool.target_nodes,
                target_low_priority_nodes: 0,
            };
            let (status, body) = self.send_json(operation, "/pools", &payload).await?;
            if status == StatusCode::CREATED {
                return Ok(());
            }
            Err(Self::service_error(operation, status, &body))
        })
    }

    fn create_job<'a>(
        &'a self,
        job_id: &'a str,
        pool_id: &'a str,
    ) -> ComputeFuture<'a, (), Self::Error> {
        Box::pin(async move {
            let operation = "create job";
            let payload = JobAddBody {
                id: job_id,
                pool_info: PoolInfo { pool_id },
            };
            let (status, body) = self.send_json(operation, "/jobs", &payload).await?;
            if status == StatusCode::CREATED {
                return Ok(());
            }
            Err(Self::service_error(operation, status, &body))
        })
    }

    fn add_task<'a>(
        &'a self,
        job_id: &'a str,
        task: &'a TaskSpec,
    ) -> ComputeFuture<'a, (), Self::Error> {
        Box::pin(async move {
            let operation = "add task";
            let payload = task_body(task);
            let path = format!("/jobs/{job_id}/tasks");
            let (status, body) = self.send_json(operation, &path, &payload).await?;
            if status == StatusCode::CREATED {
                return Ok(());
            }
            Err(Self::service_error(operation, status, &body))
        })
    }

    fn task_states<'a>(
        &'a self,
        job_id: &'a str,
    ) -> ComputeFuture<'a, Vec<TaskStatus>, Self::Error> {
        Box::pin(async move {
            let operation = "list task states";
            let path = format!("/jobs/{job_id}/tasks");
            let (status, body) = self.send(operation, Method::GET, &path, None).await?;
            if status != StatusCode::OK {
                return Err(Self::service_error(operation, status, &body));
            }
            let parsed: TaskListBody =
                serde_json::from_slice(&body).map_err(|err| AzureError::Response {
                    operation,
                    message: err.to_string(),
                })?;
            Ok(parsed.value.into_iter().map(|entry| entry.state).collect())
        })
    }

    fn delete_job<'a>(&'a self, job_id: &'a str) -> ComputeFuture<'a, (), Self::Error> {
        Box::pin(async move {
            let operation = "delete job";
            let path = format!("/jobs/{job_id}");
            let (status, body) = self.send(operation, Method::DELETE, &path, None).await?;
            Self::accept_delete(operation, status, &body)
        })
    }

    fn delete_pool<'a>(&'a self, pool_id: &'a str) -> ComputeFuture<'a, (), Self::Error> {
        Box::pin(async move {
            let operation = "delete pool";
            let path = format!("/pools/{pool_id}");
            let (status, body) = self.send(operation, Method::DELETE, &path, None).await?;
            Self::accept_delete(operation, status, &body)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compute::{OutputCapture, ResourceReference};
    use rstest::rstest;

    fn sample_task() -> TaskSpec {
        TaskSpec {
            id: String::from("Task1"),
            command_line: String::from("/bin/bash -c 'echo hi'"),
            resource_files: vec![ResourceReference {
                remote_path: String::from("in/a.csv"),
                url: String::from("https://acct.blob.core.windows.net/c/a.csv?sig=x"),
            }],
            output_captures: vec![
                OutputCapture {
                    pattern: String::from("out/*.json"),
                    container_url: String::from("https://acct.blob.core.windows.net/o?sig=y"),
                    path: Some(String::from("out")),
                    on_success_only: true,
                },
                OutputCapture {
                    pattern: String::from("std*.txt"),
                    container_url: String::from("https://acct.blob.core.windows.net/o?sig=y"),
                    path: None,
                    on_success_only: true,
                },
            ],
        }
    }

    #[rstest]
    fn task_body_serializes_with_service_field_names() {
        let task = sample_task();
        let rendered =
            serde_json::to_value(task_body(&task)).expect("task body should serialize");

        assert_eq!(rendered["id"], "Task1");
        assert_eq!(rendered["commandLine"], "/bin/bash -c 'echo hi'");
        assert_eq!(rendered["resourceFiles"][0]["filePath"], "in/a.csv");
        assert_eq!(rendered["outputFiles"][0]["filePattern"], "out/*.json");
        assert_eq!(
            rendered["outputFiles"][0]["destination"]["container"]["path"],
            "out"
        );
        assert_eq!(
            rendered["outputFiles"][0]["uploadOptions"]["uploadCondition"],
            "taskSuccess"
        );
    }

    #[rstest]
    fn catch_all_capture_omits_destination_path() {
        let task = sample_task();
        let rendered =
            serde_json::to_value(task_body(&task)).expect("task body should serialize");
        assert!(
            rendered["outputFiles"][1]["destination"]["container"]
                .get("path")
                .is_none()
        );
    }

    #[rstest]
    fn pool_body_serializes_with_service_field_names() {
        let payload = PoolAddBody {
            id: "NightlyRun",
            vm_size: "Standard_D16s_v3",
            virtual_machine_configuration: VmConfiguration {
                image_reference: ImageReference {
                    virtual_machine_image_id: "/images/ubuntu-22.04",
                },
                node_agent_sku_id: NODE_AGENT_SKU,
            },
            target_dedicated_nodes: 1,
            target_low_priority_nodes: 0,
        };
        let rendered = serde_json::to_value(&payload).expect("pool body should serialize");

        assert_eq!(rendered["vmSize"], "Standard_D16s_v3");
        assert_eq!(rendered["targetDedicatedNodes"], 1);
        assert_eq!(
            rendered["virtualMachineConfiguration"]["imageReference"]["virtualMachineImageId"],
            "/images/ubuntu-22.04"
        );
    }

    #[rstest]
    fn task_list_body_parses_states() {
        let body = r#"{"value":[{"id":"Task1","state":"running"},{"id":"Task2","state":"completed"}]}"#;
        let parsed: TaskListBody = serde_json::from_str(body).expect("list should parse");
        let states: Vec<TaskStatus> = parsed.value.into_iter().map(|entry| entry.state).collect();
        assert_eq!(states, vec![TaskStatus::Running, TaskStatus::Completed]);
    }

    #[rstest]
    fn blank_endpoints_are_rejected() {
        let err = AzureBatchClient::new("acct", "a2V5", "  ").expect_err("should reject");
        assert!(matches!(err, AzureError::InvalidEndpoint { service: "batch", .. }));
    }
}
