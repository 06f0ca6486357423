//! Remote backend: runs each container as a VM through a
//! virtualization-management service.
//!
//! [`RemoteVmRuntime`] speaks to the service through the [`VirtApi`] trait.
//! [`HttpVirtApi`] is the JSON-over-HTTP implementation:
//!
//! | Operation | Request                         |
//! |-----------|---------------------------------|
//! | create    | `POST   /v1/vms`                |
//! | start     | `POST   /v1/vms/{name}/start`   |
//! | stop      | `POST   /v1/vms/{name}/stop`    |
//! | delete    | `DELETE /v1/vms/{name}[?force=true]` |
//! | info      | `GET    /v1/vms/{name}`         |
//!
//! The service has its own status vocabulary; [`map_vm_status`] folds it
//! onto [`ContainerStatus`].

use crate::constants::VIRT_API_TIMEOUT;
use crate::error::{Error, Result};
use crate::runtime::{BackendKind, ContainerInfo, ContainerStatus, CreateOptions, RuntimeBackend};
use async_trait::async_trait;
use reqwest::{Client, Method, Response};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

const BACKEND_NAME: &str = "remote";

/// VM creation request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmCreateRequest {
    /// VM name; always the container id.
    pub name: String,
    /// Bundle directory the VM boots from.
    pub bundle: String,
}

/// Service view of one VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmInfo {
    pub name: String,
    /// Service-assigned numeric id.
    #[serde(default)]
    pub id: Option<u64>,
    /// Status in the service's vocabulary.
    pub status: String,
    #[serde(default)]
    pub bundle: Option<String>,
}

/// Virtualization-management service client.
#[async_trait]
pub trait VirtApi: Send + Sync {
    async fn create_vm(&self, request: &VmCreateRequest) -> Result<VmInfo>;

    async fn start_vm(&self, name: &str) -> Result<()>;

    async fn stop_vm(&self, name: &str) -> Result<()>;

    async fn delete_vm(&self, name: &str, force: bool) -> Result<()>;

    async fn vm_info(&self, name: &str) -> Result<VmInfo>;

    /// Raw service status of `name`.
    async fn vm_status(&self, name: &str) -> Result<String> {
        Ok(self.vm_info(name).await?.status)
    }
}

/// Maps the service's status vocabulary onto [`ContainerStatus`].
pub fn map_vm_status(status: &str) -> Result<ContainerStatus> {
    match status.to_ascii_lowercase().as_str() {
        "pending" | "provisioning" | "building" => Ok(ContainerStatus::Creating),
        "defined" | "created" | "ready" => Ok(ContainerStatus::Created),
        "running" | "paused" | "blocked" => Ok(ContainerStatus::Running),
        "shutoff" | "shutdown" | "stopped" | "crashed" => Ok(ContainerStatus::Stopped),
        "deleted" | "undefined" => Ok(ContainerStatus::Deleted),
        _ => Err(Error::BackendProtocol {
            backend: BACKEND_NAME.to_string(),
            reason: format!("unknown VM status '{}'", status),
        }),
    }
}

/// Backend that runs containers as VMs.
#[derive(Clone)]
pub struct RemoteVmRuntime {
    api: Arc<dyn VirtApi>,
}

impl RemoteVmRuntime {
    pub fn new(api: Arc<dyn VirtApi>) -> Self {
        Self { api }
    }

    /// Backend talking HTTP to the service at `endpoint`.
    pub fn connect(endpoint: &str) -> Result<Self> {
        Ok(Self::new(Arc::new(HttpVirtApi::new(endpoint)?)))
    }
}

#[async_trait]
impl RuntimeBackend for RemoteVmRuntime {
    fn name(&self) -> &str {
        BACKEND_NAME
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Remote
    }

    async fn create_container(
        &self,
        id: &str,
        bundle: &Path,
        _opts: &CreateOptions,
    ) -> Result<Option<u64>> {
        let request = VmCreateRequest {
            name: id.to_string(),
            bundle: bundle.to_string_lossy().to_string(),
        };
        let vm = self.api.create_vm(&request).await?;
        info!("Created VM {} (id {:?})", id, vm.id);
        Ok(vm.id)
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        self.api.start_vm(id).await?;
        info!("Started VM {}", id);
        Ok(())
    }

    async fn stop_container(&self, id: &str) -> Result<()> {
        self.api.stop_vm(id).await?;
        info!("Stopped VM {}", id);
        Ok(())
    }

    async fn delete_container(&self, id: &str, force: bool) -> Result<()> {
        self.api.delete_vm(id, force).await?;
        info!("Deleted VM {}", id);
        Ok(())
    }

    async fn get_container_state(&self, id: &str) -> Result<ContainerStatus> {
        map_vm_status(&self.api.vm_status(id).await?)
    }

    async fn get_container_info(&self, id: &str) -> Result<ContainerInfo> {
        let vm = self.api.vm_info(id).await?;
        Ok(ContainerInfo {
            id: id.to_string(),
            status: map_vm_status(&vm.status)?,
            numeric_id: vm.id,
            bundle: vm.bundle.map(PathBuf::from),
        })
    }
}

// =============================================================================
// HTTP Client
// =============================================================================

/// JSON-over-HTTP [`VirtApi`].
#[derive(Debug, Clone)]
pub struct HttpVirtApi {
    client: Client,
    base_url: String,
}

impl HttpVirtApi {
    /// Client for the service at `base_url`.
    pub fn new(base_url: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(VIRT_API_TIMEOUT)
            .build()
            .map_err(|e| Error::InvalidConfig(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        name: &str,
        operation: &str,
        body: Option<&VmCreateRequest>,
    ) -> Result<Response> {
        let url = self.url(path);
        debug!("{} {}", method, url);

        let mut builder = self.client.request(method, &url);
        if let Some(body) = body {
            builder = builder.json(body);
        }

        let response = builder.send().await.map_err(|e| Error::RuntimeUnavailable {
            runtime: BACKEND_NAME.to_string(),
            reason: e.to_string(),
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = match response.text().await {
                Ok(body) => body,
                Err(e) => format!("failed to read response body: {}", e),
            };
            debug!("{} {} failed with {}: {}", operation, name, status, body);
            return Err(Error::RuntimeExecution {
                id: name.to_string(),
                operation: operation.to_string(),
                exit_code: None,
                stdout: format!("HTTP {}", status.as_u16()),
                stderr: body,
            });
        }
        Ok(response)
    }

    async fn decode(response: Response) -> Result<VmInfo> {
        response.json().await.map_err(|e| Error::BackendProtocol {
            backend: BACKEND_NAME.to_string(),
            reason: format!("invalid VM document: {}", e),
        })
    }
}

#[async_trait]
impl VirtApi for HttpVirtApi {
    async fn create_vm(&self, request: &VmCreateRequest) -> Result<VmInfo> {
        let response = self
            .send(Method::POST, "/v1/vms", &request.name, "create", Some(request))
            .await?;
        Self::decode(response).await
    }

    async fn start_vm(&self, name: &str) -> Result<()> {
        let path = format!("/v1/vms/{}/start", name);
        self.send(Method::POST, &path, name, "start", None).await?;
        Ok(())
    }

    async fn stop_vm(&self, name: &str) -> Result<()> {
        let path = format!("/v1/vms/{}/stop", name);
        self.send(Method::POST, &path, name, "stop", None).await?;
        Ok(())
    }

    async fn delete_vm(&self, name: &str, force: bool) -> Result<()> {
        let path = if force {
            format!("/v1/vms/{}?force=true", name)
        } else {
            format!("/v1/vms/{}", name)
        };
        self.send(Method::DELETE, &path, name, "delete", None).await?;
        Ok(())
    }

    async fn vm_info(&self, name: &str) -> Result<VmInfo> {
        let path = format!("/v1/vms/{}", name);
        let response = self.send(Method::GET, &path, name, "state", None).await?;
        Self::decode(response).await
    }
}
