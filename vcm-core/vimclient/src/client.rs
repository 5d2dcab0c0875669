//! 管理服务器 HTTP 客户端核心实现

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::api::{DatastoreApi, SnapshotApi, TaskApi, VmApi};
use crate::error::{Result, VimError};
use crate::models::{
    ApiResponse, ConfigSpec, DatastoreInfo, DatastorePath, DiskSpec, GuestNic, RegisterSpec,
    ServerAbout, SnapshotInfo, TaskInfo, TaskRef, VmConfig, VmRef, VmRuntime,
};
use crate::server::ManagementServer;

/// 客户端配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// 连接超时（秒）
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,

    /// 请求超时（秒）
    #[serde(default = "default_request_timeout")]
    pub request_timeout: u64,

    /// 是否验证 SSL 证书
    #[serde(default = "default_verify_ssl")]
    pub verify_ssl: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            connect_timeout: default_connect_timeout(),
            request_timeout: default_request_timeout(),
            verify_ssl: default_verify_ssl(),
        }
    }
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_request_timeout() -> u64 {
    60
}

fn default_verify_ssl() -> bool {
    true
}

/// 任务型接口的响应数据
#[derive(Debug, Deserialize)]
pub(crate) struct TaskHandle {
    pub task: TaskRef,
}

/// 管理服务器客户端
pub struct VimClient {
    /// API 基础 URL
    base_url: String,

    /// HTTP 客户端
    http_client: Client,

    /// 会话令牌
    access_token: Arc<RwLock<Option<String>>>,
}

impl VimClient {
    /// 创建新的客户端
    pub fn new(base_url: &str, config: ServerConfig) -> Result<Self> {
        url::Url::parse(base_url)
            .map_err(|e| VimError::ConfigError(format!("无效的服务器地址 {}: {}", base_url, e)))?;

        let http_client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout))
            .connect_timeout(Duration::from_secs(config.connect_timeout))
            .danger_accept_invalid_certs(!config.verify_ssl)
            .build()
            .map_err(|e| VimError::HttpError(e.to_string()))?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http_client,
            access_token: Arc::new(RwLock::new(None)),
        })
    }

    /// 虚拟机 API
    pub fn vm(&self) -> VmApi<'_> {
        VmApi::new(self)
    }

    /// 快照 API
    pub fn snapshot(&self) -> SnapshotApi<'_> {
        SnapshotApi::new(self)
    }

    /// 数据存储 API
    pub fn datastore(&self) -> DatastoreApi<'_> {
        DatastoreApi::new(self)
    }

    /// 任务 API
    pub fn task(&self) -> TaskApi<'_> {
        TaskApi::new(self)
    }

    /// 是否已登录
    pub async fn is_authenticated(&self) -> bool {
        self.access_token.read().await.is_some()
    }

    /// 发送请求并解出响应数据
    pub(crate) async fn request<T: Serialize, R: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<T>,
    ) -> Result<R> {
        let envelope: ApiResponse<R> = self.send(method, path, body).await?;
        envelope
            .data
            .ok_or_else(|| VimError::ParseError(format!("响应缺少数据: {}", path)))
    }

    /// 发送请求，忽略响应数据
    pub(crate) async fn execute<T: Serialize>(
        &self,
        method: Method,
        path: &str,
        body: Option<T>,
    ) -> Result<()> {
        let _: ApiResponse<serde_json::Value> = self.send(method, path, body).await?;
        Ok(())
    }

    async fn send<T: Serialize, R: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<T>,
    ) -> Result<ApiResponse<R>> {
        let url = format!("{}{}", self.base_url, path);
        debug!("管理服务器请求: {} {}", method, url);

        let token = self.access_token.read().await;
        let token_str = token
            .as_ref()
            .ok_or_else(|| VimError::AuthError("未认证，请先登录".to_string()))?;

        let mut request = self
            .http_client
            .request(method, &url)
            .header("Token", token_str)
            .header("Content-Type", "application/json");

        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| VimError::HttpError(e.to_string()))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(VimError::NotFound(path.to_string()));
        }
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "无法读取错误响应".to_string());
            warn!("API 请求失败: {} - {}", status, error_text);
            return Err(VimError::ApiError(status.as_u16(), error_text));
        }

        let envelope: ApiResponse<R> = response
            .json()
            .await
            .map_err(|e| VimError::ParseError(e.to_string()))?;

        if envelope.status != 0 {
            let msg = envelope.msg.clone().unwrap_or_else(|| "未知错误".to_string());
            return Err(VimError::Fault(msg));
        }

        Ok(envelope)
    }

    /// 发送返回任务句柄的请求
    pub(crate) async fn request_task<T: Serialize>(
        &self,
        method: Method,
        path: &str,
        body: Option<T>,
    ) -> Result<TaskRef> {
        let handle: TaskHandle = self.request(method, path, body).await?;
        Ok(handle.task)
    }
}

#[async_trait]
impl ManagementServer for VimClient {
    async fn login(&self, username: &str, password: &str) -> Result<()> {
        info!("管理服务器登录: {}", username);

        let login_url = format!("{}/api/v1/session/login", self.base_url);
        let response = self
            .http_client
            .post(&login_url)
            .json(&serde_json::json!({
                "username": username,
                "password": password,
            }))
            .send()
            .await
            .map_err(|e| VimError::HttpError(e.to_string()))?;

        let login_result: serde_json::Value = response
            .json()
            .await
            .map_err(|e| VimError::ParseError(e.to_string()))?;

        if login_result["status"].as_i64().unwrap_or(-1) != 0 {
            let msg = login_result["msg"].as_str().unwrap_or("未知错误");
            return Err(VimError::AuthError(format!("登录失败: {}", msg)));
        }

        let token = login_result["data"]["token"]
            .as_str()
            .ok_or_else(|| VimError::AuthError("未获取到 Token".to_string()))?
            .to_string();

        *self.access_token.write().await = Some(token);

        info!("管理服务器登录成功");
        Ok(())
    }

    async fn logout(&self) -> Result<()> {
        info!("管理服务器登出");
        if self.is_authenticated().await {
            self.execute(Method::POST, "/api/v1/session/logout", None::<()>)
                .await?;
        }
        *self.access_token.write().await = None;
        Ok(())
    }

    async fn about(&self) -> Result<ServerAbout> {
        self.request(Method::GET, "/api/v1/about", None::<()>).await
    }

    async fn list_vm_names(&self) -> Result<Vec<String>> {
        let vms = self.vm().list().await?;
        Ok(vms.into_iter().map(|vm| vm.name).collect())
    }

    async fn find_vm_by_name(&self, name: &str) -> Result<Option<VmRef>> {
        self.vm().find_by_name(name).await
    }

    async fn runtime(&self, vm: &VmRef) -> Result<VmRuntime> {
        self.vm().runtime(vm).await
    }

    async fn vm_config(&self, vm: &VmRef) -> Result<VmConfig> {
        self.vm().config(vm).await
    }

    async fn list_datastores(&self, vm: &VmRef) -> Result<Vec<DatastoreInfo>> {
        self.vm().datastores(vm).await
    }

    async fn guest_nics(&self, vm: &VmRef) -> Result<Vec<GuestNic>> {
        self.vm().guest_nics(vm).await
    }

    async fn power_on(&self, vm: &VmRef) -> Result<TaskRef> {
        self.vm().power(vm, "on").await
    }

    async fn power_off(&self, vm: &VmRef) -> Result<TaskRef> {
        self.vm().power(vm, "off").await
    }

    async fn suspend(&self, vm: &VmRef) -> Result<TaskRef> {
        self.vm().power(vm, "suspend").await
    }

    async fn reset(&self, vm: &VmRef) -> Result<TaskRef> {
        self.vm().power(vm, "reset").await
    }

    async fn answer_question(&self, vm: &VmRef, question_id: &str, choice: &str) -> Result<()> {
        self.vm().answer(vm, question_id, choice).await
    }

    async fn create_snapshot(
        &self,
        vm: &VmRef,
        name: &str,
        description: &str,
        quiesce: bool,
        memory: bool,
    ) -> Result<TaskRef> {
        self.snapshot()
            .create(vm, name, description, quiesce, memory)
            .await
    }

    async fn snapshot_forest(&self, vm: &VmRef) -> Result<Vec<SnapshotInfo>> {
        self.snapshot().list(vm).await
    }

    async fn snapshot_config(&self, vm: &VmRef, snapshot_id: &str) -> Result<VmConfig> {
        self.snapshot().config(vm, snapshot_id).await
    }

    async fn revert_snapshot(&self, vm: &VmRef, snapshot_id: &str) -> Result<TaskRef> {
        self.snapshot().revert(vm, snapshot_id).await
    }

    async fn remove_snapshot(
        &self,
        vm: &VmRef,
        snapshot_id: &str,
        remove_children: bool,
    ) -> Result<TaskRef> {
        self.snapshot()
            .remove(vm, snapshot_id, remove_children)
            .await
    }

    async fn rename_snapshot(
        &self,
        vm: &VmRef,
        snapshot_id: &str,
        new_name: &str,
        description: &str,
    ) -> Result<()> {
        self.snapshot()
            .rename(vm, snapshot_id, new_name, description)
            .await
    }

    async fn register_vm(&self, spec: &RegisterSpec) -> Result<TaskRef> {
        self.vm().register(spec).await
    }

    async fn unregister_vm(&self, vm: &VmRef) -> Result<()> {
        self.vm().unregister(vm).await
    }

    async fn destroy_vm(&self, vm: &VmRef) -> Result<TaskRef> {
        self.vm().destroy(vm).await
    }

    async fn reconfigure_vm(&self, vm: &VmRef, spec: &ConfigSpec) -> Result<TaskRef> {
        self.vm().reconfigure(vm, spec).await
    }

    async fn make_directory(&self, path: &DatastorePath) -> Result<()> {
        self.datastore().make_directory(path).await
    }

    async fn copy_virtual_disk(
        &self,
        source: &DatastorePath,
        destination: &DatastorePath,
        spec: &DiskSpec,
    ) -> Result<TaskRef> {
        self.datastore().copy_disk(source, destination, spec).await
    }

    async fn copy_datastore_file(
        &self,
        source: &DatastorePath,
        destination: &DatastorePath,
    ) -> Result<TaskRef> {
        self.datastore().copy_file(source, destination).await
    }

    async fn delete_datastore_file(&self, path: &DatastorePath) -> Result<TaskRef> {
        self.datastore().delete_file(path).await
    }

    async fn search_datastore(&self, directory: &DatastorePath) -> Result<Vec<DatastorePath>> {
        self.datastore().search(directory).await
    }

    async fn task_info(&self, task: &TaskRef) -> Result<TaskInfo> {
        self.task().info(task).await
    }
}
